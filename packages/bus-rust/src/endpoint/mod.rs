//! Receive endpoints: lifecycle, consume loop and delivery outcomes.

pub mod lifecycle;
pub mod outcome;
pub mod receive;

pub use lifecycle::{EndpointState, InFlightGuard, Lifecycle};
pub use outcome::{
    CompositeSink, DeliveryOutcome, MemorySink, MetricsSink, ObservabilitySink, OutcomeKind,
    TracingSink,
};
pub use receive::{ReceiveEndpoint, ReceiveEndpointBuilder};
