//! Built-in filters.

pub mod circuit_breaker;
pub mod logging;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{CircuitBreakerFilter, CircuitState};
pub use logging::{LoggingFilter, Traceable};
pub use retry::RetryFilter;
pub use timeout::TimeoutFilter;
