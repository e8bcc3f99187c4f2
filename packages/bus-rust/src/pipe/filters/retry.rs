//! Retry filter.
//!
//! Re-invokes the rest of the chain while the [`RetryPolicy`] allows it,
//! waiting the policy's delay between attempts. The wait observes the
//! context's cancellation token.

use async_trait::async_trait;
use courier_core::{BusResult, Error};
use tokio::time::Instant;

use crate::pipe::{Filter, Pipe, ProbeContext, RetryableContext};
use crate::retry::RetryPolicy;

/// Applies a [`RetryPolicy`] to everything downstream.
#[derive(Debug, Clone)]
pub struct RetryFilter {
    policy: RetryPolicy,
}

impl RetryFilter {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<C: RetryableContext> Filter<C> for RetryFilter {
    async fn send(&self, ctx: &mut C, next: &dyn Pipe<C>) -> BusResult<()> {
        loop {
            let Err(mut errors) = next.send(ctx).await else {
                return Ok(());
            };

            let cancel = ctx.cancellation().clone();
            if cancel.is_cancelled() {
                errors.push(Error::Cancelled);
                return Err(errors);
            }

            let retry = *ctx.retry_context();
            if !self.policy.should_retry(&retry, &errors) {
                if self.policy.is_exhausted(&retry) {
                    errors.push(Error::RetryExhausted {
                        attempts: retry.attempt().saturating_add(1),
                    });
                }
                return Err(errors);
            }

            let delay = self.policy.delay(&retry);
            tracing::debug!(
                attempt = retry.attempt(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %errors.first(),
                "retrying delivery"
            );

            if !delay.is_zero() {
                let started = Instant::now();
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        errors.push(Error::Cancelled);
                        return Err(errors);
                    }
                }
                ctx.record_stage("retry_wait", started.elapsed());
            }

            ctx.retry_context_mut().next_attempt();
        }
    }

    fn probe(&self, probe: &mut ProbeContext) {
        let entry = probe.add("retry");
        entry.set("maxRetries", self.policy.max_retries());
        if let Ok(policy) = serde_json::to_value(&self.policy) {
            entry.set("policy", policy);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
