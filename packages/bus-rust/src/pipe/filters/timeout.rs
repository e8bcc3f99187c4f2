//! Timeout filter.
//!
//! Fails a downstream call that exceeds its budget with `Error::Timeout`.

use std::time::Duration;

use async_trait::async_trait;
use courier_core::{BusResult, Error};

use crate::pipe::{Filter, Pipe, PipeContext, ProbeContext};

/// Bounds each downstream call by a fixed duration.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutFilter {
    timeout: Duration,
}

impl TimeoutFilter {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

#[async_trait]
impl<C: PipeContext> Filter<C> for TimeoutFilter {
    async fn send(&self, ctx: &mut C, next: &dyn Pipe<C>) -> BusResult<()> {
        match tokio::time::timeout(self.timeout, next.send(ctx)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Timeout {
                timeout_ms: self.timeout_ms(),
            }
            .into()),
        }
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe.add("timeout").set("timeoutMs", self.timeout_ms());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
