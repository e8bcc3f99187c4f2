//! Delivery pipeline composition: combines the built-in filters, any
//! endpoint-specific filters and the consumer into a single pipe.

use std::sync::Arc;

use super::filters::{CircuitBreakerFilter, LoggingFilter, RetryFilter, TimeoutFilter, Traceable};
use super::{Filter, Pipe, PipeBuilder, RetryableContext};
use crate::config::EndpointConfig;
use crate::retry::RetryPolicy;

/// Builds the pipe one consumer registration runs for each delivery.
///
/// Filter order (outermost to innermost):
/// 1. `LoggingFilter` -- span, duration and outcome of the whole delivery
/// 2. `RetryFilter` -- only when the policy allows retries
/// 3. `CircuitBreakerFilter` -- only when configured; sees every attempt
/// 4. `TimeoutFilter` -- only when configured; bounds each attempt
/// 5. `extra` filters, in the given order
/// 6. `terminal` -- the consumer
#[must_use]
pub fn build_delivery_pipe<C>(
    config: &EndpointConfig,
    extra: &[Arc<dyn Filter<C>>],
    terminal: Arc<dyn Filter<C>>,
) -> Arc<dyn Pipe<C>>
where
    C: Traceable + RetryableContext,
{
    let mut builder = PipeBuilder::new()
        .push(LoggingFilter)
        .push_if(
            config.retry != RetryPolicy::None,
            RetryFilter::new(config.retry.clone()),
        )
        .push_opt(config.circuit_breaker.as_ref().map(CircuitBreakerFilter::new))
        .push_opt(config.message_timeout().map(TimeoutFilter::new));
    for filter in extra {
        builder = builder.push_shared(filter.clone());
    }
    builder.terminate_with(terminal).build()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::pipe::test_support::{Flaky, Recording, TestContext};
    use crate::pipe::ProbeContext;

    #[test]
    fn default_config_has_logging_and_timeout() {
        let pipe = build_delivery_pipe::<TestContext>(
            &EndpointConfig::default(),
            &[],
            Arc::new(Flaky::new(0)),
        );
        let mut probe = ProbeContext::new();
        pipe.probe(&mut probe);
        assert_eq!(probe.filter_names(), vec!["logging", "timeout", "flaky"]);
    }

    #[test]
    fn full_config_orders_filters() {
        let config = EndpointConfig {
            retry: RetryPolicy::immediate(1),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            message_timeout_ms: None,
            ..EndpointConfig::default()
        };
        let extra: Vec<Arc<dyn Filter<TestContext>>> =
            vec![Arc::new(Recording { name: "audit", call_next: true })];
        let pipe = build_delivery_pipe(&config, &extra, Arc::new(Flaky::new(0)));

        let mut probe = ProbeContext::new();
        pipe.probe(&mut probe);
        assert_eq!(
            probe.filter_names(),
            vec!["logging", "retry", "circuitBreaker", "audit", "flaky"]
        );
    }

    #[tokio::test]
    async fn retries_reach_the_terminal_through_extra_filters() {
        let config = EndpointConfig {
            retry: RetryPolicy::immediate(2),
            ..EndpointConfig::default()
        };
        let terminal = Arc::new(Flaky::new(2));
        let extra: Vec<Arc<dyn Filter<TestContext>>> =
            vec![Arc::new(Recording { name: "audit", call_next: true })];
        let pipe = build_delivery_pipe(&config, &extra, terminal.clone());

        let mut ctx = TestContext::new();
        pipe.send(&mut ctx).await.unwrap();
        assert_eq!(terminal.calls(), 3);
        assert_eq!(
            ctx.entries().iter().filter(|e| *e == "audit:before").count(),
            3
        );
    }
}
