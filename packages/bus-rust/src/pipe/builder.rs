//! Pipe composition.

use std::sync::Arc;

use super::{EmptyPipe, Filter, FilterPipe, Pipe, PipeContext};

/// Collects filters and composes them into a [`Pipe`].
///
/// Given `[f0, f1, ..., fn]` and an optional terminal `t`, `build()` returns
/// a pipe where `f0` runs first and receives a `next` that runs `f1`, and so
/// on; the terminal, when set, is always the innermost filter. The innermost
/// `next` is an [`EmptyPipe`].
pub struct PipeBuilder<C: PipeContext> {
    filters: Vec<Arc<dyn Filter<C>>>,
    terminal: Option<Arc<dyn Filter<C>>>,
}

impl<C: PipeContext> PipeBuilder<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            terminal: None,
        }
    }

    /// Appends a filter.
    #[must_use]
    pub fn push(self, filter: impl Filter<C> + 'static) -> Self {
        self.push_shared(Arc::new(filter))
    }

    /// Appends a filter that is shared with other pipes.
    #[must_use]
    pub fn push_shared(mut self, filter: Arc<dyn Filter<C>>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Appends a filter only when `condition` holds.
    #[must_use]
    pub fn push_if(self, condition: bool, filter: impl Filter<C> + 'static) -> Self {
        if condition {
            self.push(filter)
        } else {
            self
        }
    }

    /// Appends `filter` when it is `Some`.
    #[must_use]
    pub fn push_opt<F: Filter<C> + 'static>(self, filter: Option<F>) -> Self {
        match filter {
            Some(f) => self.push(f),
            None => self,
        }
    }

    /// Inserts a filter at `index`, clamped to the current length.
    #[must_use]
    pub fn insert(mut self, index: usize, filter: Arc<dyn Filter<C>>) -> Self {
        let index = index.min(self.filters.len());
        self.filters.insert(index, filter);
        self
    }

    /// Sets the innermost filter, replacing any previous terminal.
    #[must_use]
    pub fn terminate_with(mut self, filter: Arc<dyn Filter<C>>) -> Self {
        self.terminal = Some(filter);
        self
    }

    /// Number of filters, terminal included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len() + usize::from(self.terminal.is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Composes the chain.
    #[must_use]
    pub fn build(self) -> Arc<dyn Pipe<C>> {
        let mut next: Arc<dyn Pipe<C>> = Arc::new(EmptyPipe);
        for filter in self.filters.into_iter().chain(self.terminal).rev() {
            next = Arc::new(FilterPipe { filter, next });
        }
        next
    }
}

impl<C: PipeContext> Default for PipeBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::test_support::{Flaky, Recording, TestContext};
    use crate::pipe::ProbeContext;

    #[tokio::test]
    async fn empty_chain_is_a_no_op() {
        let pipe = PipeBuilder::<TestContext>::new().build();
        let mut ctx = TestContext::new();
        pipe.send(&mut ctx).await.unwrap();
        assert!(ctx.entries().is_empty());

        let mut probe = ProbeContext::new();
        pipe.probe(&mut probe);
        assert!(probe.is_empty());
    }

    #[tokio::test]
    async fn filters_run_in_order_around_terminal() {
        let terminal = Arc::new(Flaky::new(0));
        let pipe = PipeBuilder::<TestContext>::new()
            .push(Recording { name: "A", call_next: true })
            .push(Recording { name: "B", call_next: true })
            .terminate_with(terminal.clone())
            .build();

        let mut ctx = TestContext::new();
        pipe.send(&mut ctx).await.unwrap();
        assert_eq!(
            ctx.entries(),
            vec!["A:before", "B:before", "terminal", "B:after", "A:after"]
        );
        assert_eq!(terminal.calls(), 1);
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let terminal = Arc::new(Flaky::new(0));
        let pipe = PipeBuilder::<TestContext>::new()
            .push(Recording { name: "A", call_next: false })
            .push(Recording { name: "B", call_next: true })
            .terminate_with(terminal.clone())
            .build();

        let mut ctx = TestContext::new();
        pipe.send(&mut ctx).await.unwrap();
        assert_eq!(ctx.entries(), vec!["A:before", "A:after"]);
        assert_eq!(terminal.calls(), 0);
    }

    #[tokio::test]
    async fn terminal_errors_flow_back_up() {
        let pipe = PipeBuilder::<TestContext>::new()
            .push(Recording { name: "A", call_next: true })
            .terminate_with(Arc::new(Flaky::new(1)))
            .build();

        let mut ctx = TestContext::new();
        let errors = pipe.send(&mut ctx).await.unwrap_err();
        assert_eq!(errors.first().to_string(), "consumer failed (flaky): failure #1");
        assert_eq!(ctx.entries(), vec!["A:before", "terminal", "A:after"]);
    }

    #[tokio::test]
    async fn push_if_insert_and_probe_order() {
        let pipe = PipeBuilder::<TestContext>::new()
            .push(Recording { name: "A", call_next: true })
            .push_if(false, Recording { name: "skipped", call_next: true })
            .push(Recording { name: "C", call_next: true })
            .insert(1, Arc::new(Recording { name: "B", call_next: true }))
            .insert(99, Arc::new(Recording { name: "D", call_next: true }))
            .terminate_with(Arc::new(Flaky::new(0)))
            .build();

        let mut probe = ProbeContext::new();
        pipe.probe(&mut probe);
        assert_eq!(probe.filter_names(), vec!["A", "B", "C", "D", "flaky"]);
        assert_eq!(probe.entries()[0].properties["callsNext"], serde_json::json!(true));
    }

    #[test]
    fn len_counts_terminal() {
        let builder = PipeBuilder::<TestContext>::new()
            .push(Recording { name: "A", call_next: true })
            .terminate_with(Arc::new(Flaky::new(0)));
        assert_eq!(builder.len(), 2);
        assert!(!builder.is_empty());
    }
}
