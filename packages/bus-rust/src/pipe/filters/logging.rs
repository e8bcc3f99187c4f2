//! Logging filter.
//!
//! Wraps the rest of the chain in a `tracing` span and records its duration
//! and outcome on completion.

use async_trait::async_trait;
use courier_core::{BusResult, ErrorKind};
use tokio::time::Instant;
use tracing::Instrument;

use crate::pipe::{Filter, Pipe, PipeContext, ProbeContext};

/// Context that can describe itself as a tracing span.
///
/// The span should declare empty `duration_ms` and `outcome` fields so the
/// logging filter can record them.
pub trait Traceable: PipeContext {
    fn span(&self) -> tracing::Span;
}

/// Label for a pipe result, as recorded on spans and metrics.
#[must_use]
pub fn outcome_label(result: &BusResult<()>) -> String {
    match result {
        Ok(()) => "success".to_string(),
        Err(errors) if errors.contains(ErrorKind::RetryExhausted) => {
            ErrorKind::RetryExhausted.to_string()
        }
        Err(errors) => errors.first().kind().to_string(),
    }
}

/// Instruments downstream filters with timing and outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFilter;

#[async_trait]
impl<C: Traceable> Filter<C> for LoggingFilter {
    async fn send(&self, ctx: &mut C, next: &dyn Pipe<C>) -> BusResult<()> {
        let span = ctx.span();
        let start = Instant::now();
        let result = next.send(ctx).instrument(span.clone()).await;
        let elapsed = start.elapsed();
        ctx.record_stage("pipeline", elapsed);

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = elapsed.as_millis() as u64;
        let outcome = outcome_label(&result);
        span.record("duration_ms", duration_ms);
        span.record("outcome", outcome.as_str());

        span.in_scope(|| match &result {
            Ok(()) => tracing::debug!(duration_ms, outcome = %outcome, "delivery complete"),
            Err(errors) => tracing::warn!(
                duration_ms,
                outcome = %outcome,
                error = %errors,
                "delivery failed"
            ),
        });

        result
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe.add("logging");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_core::Error;

    use super::*;
    use crate::pipe::test_support::{Flaky, TestContext};
    use crate::pipe::PipeBuilder;

    impl Traceable for TestContext {
        fn span(&self) -> tracing::Span {
            tracing::info_span!(
                "test",
                duration_ms = tracing::field::Empty,
                outcome = tracing::field::Empty,
            )
        }
    }

    #[tokio::test]
    async fn passes_result_through_and_records_stage() {
        let pipe = PipeBuilder::<TestContext>::new()
            .push(LoggingFilter)
            .terminate_with(Arc::new(Flaky::new(1)))
            .build();

        let mut ctx = TestContext::new();
        assert!(pipe.send(&mut ctx).await.is_err());
        pipe.send(&mut ctx).await.unwrap();
        assert_eq!(ctx.stages, vec!["pipeline", "pipeline"]);
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome_label(&Ok(())), "success");

        let mut errors = courier_core::Errors::new(Error::failure("x", "y"));
        assert_eq!(outcome_label(&Err(errors.clone())), "consumer_failed:failure");

        errors.push(Error::RetryExhausted { attempts: 2 });
        assert_eq!(outcome_label(&Err(errors)), "retry_exhausted");
    }
}
