//! Courier Bus: filter pipeline, receive endpoints, transports, and the
//! publish/send facade.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod endpoint;
pub mod pipe;
pub mod publish;
pub mod registry;
pub mod retry;
pub mod transport;

pub use bus::{Bus, BusBuilder, SendEndpoint};
pub use config::{BusConfig, CircuitBreakerConfig, DeserializationFailurePolicy, EndpointConfig};
pub use consumer::{ConsumeContext, Consumer, ConsumerRegistration, DeliveryContext};
pub use endpoint::{
    CompositeSink, DeliveryOutcome, EndpointState, MemorySink, MetricsSink, ObservabilitySink,
    OutcomeKind, ReceiveEndpoint, ReceiveEndpointBuilder, TracingSink,
};
pub use pipe::{Filter, Pipe, PipeBuilder, PipeContext, ProbeContext};
pub use publish::{Publisher, SendOptions};
pub use registry::EndpointRegistry;
pub use retry::{RetryContext, RetryPolicy};
pub use transport::{InMemoryTransport, Settlement, Transport};
