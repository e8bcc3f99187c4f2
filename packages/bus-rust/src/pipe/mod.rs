//! Filter pipeline.
//!
//! A [`Pipe`] runs a context through an ordered chain of [`Filter`]s. Each
//! filter receives the context and the rest of the chain as `next`, and
//! decides whether and when to call it:
//!
//! - [`builder`]: composes filters into a pipe
//! - [`filters`]: built-in filters (retry, circuit breaker, timeout, logging)
//! - [`pipeline`]: the standard delivery chain of a receive endpoint
//!
//! A composed pipe is immutable and shared by every concurrent delivery, so
//! filters keep per-delivery state in the context only.

pub mod builder;
pub mod filters;
pub mod pipeline;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::BusResult;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::retry::RetryContext;

pub use builder::PipeBuilder;
pub use pipeline::build_delivery_pipe;

// ---------------------------------------------------------------------------
// Context traits
// ---------------------------------------------------------------------------

/// Per-call state carried through a pipe.
pub trait PipeContext: Send + 'static {
    /// Cancellation signal for everything running on behalf of this context.
    fn cancellation(&self) -> &CancellationToken;

    /// Records how long a named stage took. Default: discarded.
    fn record_stage(&mut self, _stage: &'static str, _elapsed: Duration) {}
}

/// Context that carries a retry counter.
pub trait RetryableContext: PipeContext {
    fn retry_context(&self) -> &RetryContext;
    fn retry_context_mut(&mut self) -> &mut RetryContext;
}

// ---------------------------------------------------------------------------
// Pipe / Filter
// ---------------------------------------------------------------------------

/// A composed chain, ready to run.
#[async_trait]
pub trait Pipe<C: PipeContext>: Send + Sync {
    async fn send(&self, ctx: &mut C) -> BusResult<()>;

    /// Describes the chain for diagnostics.
    fn probe(&self, probe: &mut ProbeContext);
}

/// One link of a chain.
#[async_trait]
pub trait Filter<C: PipeContext>: Send + Sync {
    /// Handles `ctx`, calling `next` zero or more times.
    async fn send(&self, ctx: &mut C, next: &dyn Pipe<C>) -> BusResult<()>;

    fn probe(&self, probe: &mut ProbeContext);
}

/// Pipe that does nothing and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyPipe;

#[async_trait]
impl<C: PipeContext> Pipe<C> for EmptyPipe {
    async fn send(&self, _ctx: &mut C) -> BusResult<()> {
        Ok(())
    }

    fn probe(&self, _probe: &mut ProbeContext) {}
}

/// Wrapper pipe: runs `filter` with `next` as its continuation.
pub(crate) struct FilterPipe<C> {
    pub(crate) filter: Arc<dyn Filter<C>>,
    pub(crate) next: Arc<dyn Pipe<C>>,
}

#[async_trait]
impl<C: PipeContext> Pipe<C> for FilterPipe<C> {
    async fn send(&self, ctx: &mut C) -> BusResult<()> {
        self.filter.send(ctx, self.next.as_ref()).await
    }

    fn probe(&self, probe: &mut ProbeContext) {
        self.filter.probe(probe);
        self.next.probe(probe);
    }
}

// ---------------------------------------------------------------------------
// ProbeContext
// ---------------------------------------------------------------------------

/// Diagnostic description of one filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeEntry {
    pub filter: String,
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ProbeEntry {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Collects [`ProbeEntry`]s in chain order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeContext {
    entries: Vec<ProbeEntry>,
}

impl ProbeContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts an entry for the named filter.
    pub fn add(&mut self, filter: impl Into<String>) -> &mut ProbeEntry {
        self.entries.push(ProbeEntry {
            filter: filter.into(),
            properties: BTreeMap::new(),
        });
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    #[must_use]
    pub fn entries(&self) -> &[ProbeEntry] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Filter names in chain order.
    #[must_use]
    pub fn filter_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.filter.as_str()).collect()
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.entries).unwrap_or(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use parking_lot::Mutex;

    use super::*;

    /// Minimal context recording which filters ran.
    pub struct TestContext {
        pub cancel: CancellationToken,
        pub retry: RetryContext,
        pub log: Arc<Mutex<Vec<String>>>,
        pub stages: Vec<&'static str>,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self {
                cancel: CancellationToken::new(),
                retry: RetryContext::new(),
                log: Arc::new(Mutex::new(Vec::new())),
                stages: Vec::new(),
            }
        }

        pub fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl PipeContext for TestContext {
        fn cancellation(&self) -> &CancellationToken {
            &self.cancel
        }

        fn record_stage(&mut self, stage: &'static str, _elapsed: Duration) {
            self.stages.push(stage);
        }
    }

    impl RetryableContext for TestContext {
        fn retry_context(&self) -> &RetryContext {
            &self.retry
        }

        fn retry_context_mut(&mut self) -> &mut RetryContext {
            &mut self.retry
        }
    }

    /// Logs its name, then calls `next` unless configured to stop.
    pub struct Recording {
        pub name: &'static str,
        pub call_next: bool,
    }

    #[async_trait]
    impl Filter<TestContext> for Recording {
        async fn send(&self, ctx: &mut TestContext, next: &dyn Pipe<TestContext>) -> BusResult<()> {
            ctx.log.lock().push(format!("{}:before", self.name));
            let result = if self.call_next {
                next.send(ctx).await
            } else {
                Ok(())
            };
            ctx.log.lock().push(format!("{}:after", self.name));
            result
        }

        fn probe(&self, probe: &mut ProbeContext) {
            probe.add(self.name).set("callsNext", self.call_next);
        }
    }

    /// Terminal that fails its first `failures` invocations.
    pub struct Flaky {
        pub failures: u32,
        pub calls: std::sync::atomic::AtomicU32,
    }

    impl Flaky {
        pub fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: std::sync::atomic::AtomicU32::new(0),
            }
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Filter<TestContext> for Flaky {
        async fn send(&self, ctx: &mut TestContext, _next: &dyn Pipe<TestContext>) -> BusResult<()> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ctx.log.lock().push("terminal".to_string());
            if n < self.failures {
                Err(courier_core::Error::failure("flaky", format!("failure #{}", n + 1)).into())
            } else {
                Ok(())
            }
        }

        fn probe(&self, probe: &mut ProbeContext) {
            probe.add("flaky");
        }
    }
}
