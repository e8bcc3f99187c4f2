//! Receive endpoint: consumes one queue and runs each delivery through the
//! pipe of every matching consumer registration.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use courier_core::{
    headers, BusResult, EndpointAddress, Error, ErrorKind, Errors, MessageEnvelope,
    MessageSerializer,
};
use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{EndpointState, InFlightGuard, Lifecycle};
use super::outcome::{DeliveryOutcome, ObservabilitySink, OutcomeKind, TracingSink};
use crate::config::{CircuitBreakerConfig, DeserializationFailurePolicy, EndpointConfig};
use crate::consumer::registration::panic_message;
use crate::consumer::{ConsumerRegistration, DeliveryContext};
use crate::pipe::{Filter, Pipe, ProbeContext};
use crate::publish::Publisher;
use crate::retry::RetryPolicy;
use crate::transport::{InboundDelivery, ReceiveTransport, Settlement, Transport};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures a [`ReceiveEndpoint`].
#[must_use]
pub struct ReceiveEndpointBuilder {
    address: EndpointAddress,
    config: EndpointConfig,
    registrations: Vec<ConsumerRegistration>,
    filters: Vec<Arc<dyn Filter<DeliveryContext>>>,
    sink: Option<Arc<dyn ObservabilitySink>>,
    publisher: Option<Weak<dyn Publisher>>,
}

impl ReceiveEndpointBuilder {
    pub fn new(address: EndpointAddress) -> Self {
        Self {
            address,
            config: EndpointConfig::default(),
            registrations: Vec::new(),
            filters: Vec::new(),
            sink: None,
            publisher: None,
        }
    }

    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn consumer(mut self, registration: ConsumerRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Adds a filter that runs for every consumer of this endpoint, after the
    /// built-in filters and before any per-consumer filter.
    pub fn filter(mut self, filter: impl Filter<DeliveryContext> + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn concurrency_limit(mut self, limit: u32) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    pub fn prefetch_count(mut self, count: u32) -> Self {
        self.config.prefetch_count = count;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = Some(config);
        self
    }

    /// `None` disables the per-attempt timeout.
    pub fn message_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.message_timeout_ms =
            timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.config.stop_grace_period_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn deserialization_failure(mut self, policy: DeserializationFailurePolicy) -> Self {
        self.config.deserialization_failure = policy;
        self
    }

    /// Pause before requeueing an undecodable delivery.
    pub fn requeue_delay(mut self, delay: Duration) -> Self {
        self.config.requeue_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn publisher(mut self, publisher: Weak<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub(crate) fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Finishes configuration. Registrations are validated by `start()`.
    #[must_use]
    pub fn build(self, transport: Arc<dyn Transport>) -> ReceiveEndpoint {
        ReceiveEndpoint {
            inner: Arc::new(EndpointInner {
                address: self.address,
                config: self.config,
                registrations: self.registrations,
                filters: self.filters,
                transport,
                sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
                publisher: self.publisher,
                lifecycle: Lifecycle::new(),
                control: Mutex::new(None),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ReceiveEndpoint
// ---------------------------------------------------------------------------

/// Consumes one queue with a fixed set of consumers.
#[derive(Clone)]
pub struct ReceiveEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    address: EndpointAddress,
    config: EndpointConfig,
    registrations: Vec<ConsumerRegistration>,
    filters: Vec<Arc<dyn Filter<DeliveryContext>>>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn ObservabilitySink>,
    publisher: Option<Weak<dyn Publisher>>,
    lifecycle: Lifecycle,
    control: Mutex<Option<Running>>,
}

struct Running {
    receiver: Arc<dyn ReceiveTransport>,
    routes: Arc<[Route]>,
    stop: CancellationToken,
    deliveries: CancellationToken,
    task: JoinHandle<()>,
}

/// One registration with its composed pipe.
struct Route {
    index: usize,
    pipe: Arc<dyn Pipe<DeliveryContext>>,
}

impl ReceiveEndpoint {
    pub fn builder(address: EndpointAddress) -> ReceiveEndpointBuilder {
        ReceiveEndpointBuilder::new(address)
    }

    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        &self.inner.address
    }

    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> EndpointState {
        self.inner.lifecycle.state()
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.inner.lifecycle.in_flight_count()
    }

    /// Consumer names, in registration order.
    #[must_use]
    pub fn consumers(&self) -> Vec<&str> {
        self.inner.registrations.iter().map(ConsumerRegistration::name).collect()
    }

    pub(crate) fn registrations(&self) -> &[ConsumerRegistration] {
        &self.inner.registrations
    }

    /// Whether any consumer subscribes to one of `message_types`.
    #[must_use]
    pub fn subscribes_to(&self, message_types: &[String]) -> bool {
        self.inner
            .registrations
            .iter()
            .any(|r| message_types.iter().any(|t| t == r.urn()))
    }

    /// Message type identifiers consumed here, deduplicated.
    #[must_use]
    pub fn message_types(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.inner
            .registrations
            .iter()
            .map(ConsumerRegistration::urn)
            .filter(|urn| seen.insert(*urn))
            .collect()
    }

    /// Starts consuming. Calling it on a running endpoint is a no-op.
    ///
    /// # Errors
    ///
    /// - `TransportError` when the endpoint has no consumer, has two
    ///   consumers with the same name, was already stopped, or the transport
    ///   subscription cannot be opened.
    /// - `InvalidEndpointAddress` when the transport does not serve the
    ///   endpoint's address.
    pub async fn start(&self) -> BusResult<()> {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;
        match inner.lifecycle.state() {
            EndpointState::Starting | EndpointState::Running => return Ok(()),
            EndpointState::Stopping | EndpointState::Stopped => {
                return Err(Error::transport(format!(
                    "receive endpoint {} was stopped and cannot be restarted",
                    inner.address
                ))
                .into());
            }
            EndpointState::Created => {}
        }
        inner.validate()?;

        inner.lifecycle.set(EndpointState::Starting);
        let routes: Arc<[Route]> = inner
            .registrations
            .iter()
            .enumerate()
            .map(|(index, registration)| Route {
                index,
                pipe: registration.build_pipe(&inner.config, &inner.filters),
            })
            .collect();

        let receiver = match inner.open_receiver().await {
            Ok(receiver) => receiver,
            Err(errors) => {
                inner.lifecycle.set(EndpointState::Created);
                return Err(errors);
            }
        };

        let stop = CancellationToken::new();
        let deliveries = CancellationToken::new();
        let task = tokio::spawn(consume_loop(
            Arc::clone(inner),
            Arc::clone(&receiver),
            Arc::clone(&routes),
            stop.clone(),
            deliveries.clone(),
        ));
        *control = Some(Running {
            receiver,
            routes,
            stop,
            deliveries,
            task,
        });
        inner.lifecycle.set(EndpointState::Running);
        tracing::info!(
            endpoint = %inner.address,
            consumers = inner.registrations.len(),
            concurrency_limit = inner.config.concurrency_limit,
            prefetch_count = inner.config.prefetch_count,
            "receive endpoint started"
        );
        Ok(())
    }

    /// Stops consuming.
    ///
    /// In-flight deliveries get the stop grace period to finish; after that
    /// they are cancelled and requeued. Stopping a stopped (or never
    /// started) endpoint is a no-op apart from the state change.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` when the subscription cannot be closed.
    pub async fn stop(&self) -> BusResult<()> {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;
        let Some(running) = control.take() else {
            inner.lifecycle.set(EndpointState::Stopped);
            return Ok(());
        };

        inner.lifecycle.set(EndpointState::Stopping);
        running.stop.cancel();
        if let Err(err) = running.task.await {
            tracing::warn!(endpoint = %inner.address, error = %err, "consume loop ended abnormally");
        }

        let grace = inner.config.stop_grace_period();
        if !inner.lifecycle.wait_for_drain(grace).await {
            tracing::warn!(
                endpoint = %inner.address,
                in_flight = inner.lifecycle.in_flight_count(),
                grace_ms = inner.config.stop_grace_period_ms,
                "stop grace period elapsed, cancelling in-flight deliveries"
            );
            running.deliveries.cancel();
            if !inner.lifecycle.wait_for_drain(grace).await {
                tracing::warn!(
                    endpoint = %inner.address,
                    in_flight = inner.lifecycle.in_flight_count(),
                    "in-flight deliveries ignored cancellation"
                );
            }
        }

        let closed = running.receiver.close().await;
        inner.lifecycle.set(EndpointState::Stopped);
        tracing::info!(endpoint = %inner.address, "receive endpoint stopped");
        closed
    }

    /// Describes each consumer's pipe.
    #[must_use]
    pub fn probe(&self) -> serde_json::Value {
        let inner = &self.inner;
        let running_routes = inner
            .control
            .try_lock()
            .ok()
            .and_then(|control| control.as_ref().map(|r| Arc::clone(&r.routes)));

        let consumers: Vec<serde_json::Value> = inner
            .registrations
            .iter()
            .enumerate()
            .map(|(index, registration)| {
                let pipe = running_routes
                    .as_ref()
                    .and_then(|routes| routes.iter().find(|r| r.index == index))
                    .map_or_else(
                        || registration.build_pipe(&inner.config, &inner.filters),
                        |route| Arc::clone(&route.pipe),
                    );
                let mut probe = ProbeContext::new();
                pipe.probe(&mut probe);
                serde_json::json!({
                    "name": registration.name(),
                    "messageType": registration.urn(),
                    "filters": probe.to_json(),
                })
            })
            .collect();

        serde_json::json!({
            "address": inner.address.to_string(),
            "state": inner.lifecycle.state().as_str(),
            "inFlight": inner.lifecycle.in_flight_count(),
            "config": serde_json::to_value(&inner.config).unwrap_or(serde_json::Value::Null),
            "consumers": consumers,
        })
    }
}

impl std::fmt::Debug for ReceiveEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveEndpoint")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .field("consumers", &self.consumers())
            .finish_non_exhaustive()
    }
}

impl EndpointInner {
    fn validate(&self) -> BusResult<()> {
        let mut errors = Vec::new();
        if self.registrations.is_empty() {
            errors.push(Error::transport(format!(
                "receive endpoint {} has no consumers",
                self.address
            )));
        }
        let mut names = HashSet::new();
        for registration in &self.registrations {
            if !names.insert(registration.name()) {
                errors.push(Error::transport(format!(
                    "receive endpoint {} has more than one consumer named `{}`",
                    self.address,
                    registration.name()
                )));
            }
        }
        Errors::from_vec(errors).map_or(Ok(()), Err)
    }

    async fn open_receiver(&self) -> BusResult<Arc<dyn ReceiveTransport>> {
        let receiver = self.transport.create_receive_endpoint(&self.address)?;
        receiver.open(self.config.prefetch_count).await?;
        Ok(receiver)
    }

    fn publisher(&self) -> Option<Arc<dyn Publisher>> {
        self.publisher.as_ref().and_then(Weak::upgrade)
    }

    fn report(&self, outcome: &DeliveryOutcome) {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.sink.record(outcome))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(
                endpoint = %self.address,
                error = %format!("{err:#}"),
                "observability sink failed"
            ),
            Err(payload) => tracing::warn!(
                endpoint = %self.address,
                panic = %panic_message(&*payload),
                "observability sink panicked"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Consume loop
// ---------------------------------------------------------------------------

/// Pulls deliveries into a prefetch buffer and dispatches them, one task per
/// delivery, bounded by the concurrency limit.
async fn consume_loop(
    inner: Arc<EndpointInner>,
    receiver: Arc<dyn ReceiveTransport>,
    routes: Arc<[Route]>,
    stop: CancellationToken,
    deliveries: CancellationToken,
) {
    let prefetch = usize::try_from(inner.config.prefetch_count.max(1)).unwrap_or(1);
    let (tx, mut rx) = mpsc::channel::<InboundDelivery>(prefetch);

    let fetcher = tokio::spawn({
        let receiver = Arc::clone(&receiver);
        let stop = stop.clone();
        async move {
            while let Some(delivery) = receiver.receive(&stop).await {
                if let Err(mpsc::error::SendError(delivery)) = tx.send(delivery).await {
                    requeue(receiver.as_ref(), delivery).await;
                    break;
                }
            }
        }
    });

    let limit = usize::try_from(inner.config.concurrency_limit.max(1)).unwrap_or(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    loop {
        let permit = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => permit,
        };
        let Ok(permit) = permit else { break };

        let delivery = tokio::select! {
            biased;
            () = stop.cancelled() => None,
            delivery = rx.recv() => delivery,
        };
        let Some(delivery) = delivery else { break };

        let guard = inner.lifecycle.in_flight_guard();
        tokio::spawn(process(
            Arc::clone(&inner),
            Arc::clone(&receiver),
            Arc::clone(&routes),
            delivery,
            deliveries.child_token(),
            permit,
            guard,
        ));
    }

    rx.close();
    while let Some(delivery) = rx.recv().await {
        requeue(receiver.as_ref(), delivery).await;
    }
    if let Err(err) = fetcher.await {
        tracing::warn!(endpoint = %inner.address, error = %err, "fetch task ended abnormally");
    }
}

async fn requeue(receiver: &dyn ReceiveTransport, delivery: InboundDelivery) {
    if let Err(errors) = receiver.settle(delivery, Settlement::Requeue).await {
        tracing::warn!(queue = %receiver.address(), error = %errors, "failed to requeue buffered delivery");
    }
}

/// Processes one delivery end to end, then settles and reports it.
async fn process(
    inner: Arc<EndpointInner>,
    receiver: Arc<dyn ReceiveTransport>,
    routes: Arc<[Route]>,
    delivery: InboundDelivery,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
    _guard: InFlightGuard,
) {
    let started = Instant::now();
    let envelope = Arc::new(delivery.envelope.clone());

    let dispatched = AssertUnwindSafe(dispatch(&inner, &routes, &envelope, &cancel, started))
        .catch_unwind()
        .await;
    let (settlement, outcomes) = match dispatched {
        Ok(result) => result,
        Err(payload) => {
            let errors = Errors::new(Error::Fault(panic_message(&*payload)));
            tracing::error!(
                endpoint = %inner.address,
                message_id = %envelope.message_id(),
                error = %errors,
                "delivery panicked"
            );
            let headers = fault_headers(&inner.address, None, &errors, 0);
            let outcome = inner.outcome(&envelope, OutcomeKind::Exception, started, None, Some(errors));
            (Settlement::DeadLetter { headers }, vec![outcome])
        }
    };

    if let Settlement::DeadLetter { headers } = &settlement {
        inner.notify_fault_address(&envelope, headers).await;
    }
    let kind = settlement.as_str();
    if let Err(errors) = receiver.settle(delivery, settlement).await {
        tracing::warn!(
            endpoint = %inner.address,
            message_id = %envelope.message_id(),
            settlement = kind,
            error = %errors,
            "failed to settle delivery"
        );
    }

    for outcome in &outcomes {
        inner.report(outcome);
    }
}

/// Runs every matching consumer and decides how to settle the delivery.
async fn dispatch(
    inner: &Arc<EndpointInner>,
    routes: &[Route],
    envelope: &Arc<MessageEnvelope>,
    cancel: &CancellationToken,
    started: Instant,
) -> (Settlement, Vec<DeliveryOutcome>) {
    if envelope.is_expired(Utc::now()) {
        let outcome = inner.outcome(envelope, OutcomeKind::Skipped, started, None, None);
        let reason = "message expired".to_string();
        return (Settlement::Skip { reason }, vec![outcome]);
    }

    let matching: Vec<&Route> = routes
        .iter()
        .filter(|route| {
            let urn = inner.registrations[route.index].urn();
            envelope.message_types().iter().any(|t| t == urn)
        })
        .collect();
    if matching.is_empty() {
        let outcome = inner.outcome(envelope, OutcomeKind::Skipped, started, None, None);
        let reason = format!("no consumer for {}", envelope.primary_message_type());
        return (Settlement::Skip { reason }, vec![outcome]);
    }

    let serializer = MessageSerializer::for_content_type(envelope.content_type());
    let mut outcomes = Vec::with_capacity(matching.len());
    let mut cancelled = false;
    let mut fault: Option<Settlement> = None;
    let mut undecodable: Option<Settlement> = None;

    for route in matching {
        let registration = &inner.registrations[route.index];
        let consumer = registration.name_arc();

        let decoded = match serializer {
            Some(serializer) => registration.decode(&serializer, envelope.body()),
            None => Err(Error::DeserializationFailed {
                type_name: registration.message_type().rust_name().to_string(),
                reason: format!("unsupported content type `{}`", envelope.content_type()),
            }),
        };
        let message = match decoded {
            Ok(message) => message,
            Err(error) => {
                let errors = Errors::new(error);
                if undecodable.is_none() {
                    undecodable = Some(inner.deserialization_settlement(&consumer, &errors));
                }
                outcomes.push(inner.outcome(
                    envelope,
                    OutcomeKind::DeserializationFailed,
                    started,
                    Some(&*consumer),
                    Some(errors),
                ));
                continue;
            }
        };

        let mut ctx = DeliveryContext::new(
            Arc::clone(envelope),
            message,
            inner.address.clone(),
            Arc::clone(&consumer),
            cancel.clone(),
        );
        if let Some(publisher) = &inner.publisher {
            ctx = ctx.with_publisher(Weak::clone(publisher));
        }

        let result = route.pipe.send(&mut ctx).await;
        let attempts = ctx.attempt().saturating_add(1);
        let kind = classify(&result, cancel);
        let errors = result.err();
        match kind {
            OutcomeKind::Cancelled => cancelled = true,
            OutcomeKind::Success => {}
            _ => {
                if fault.is_none() {
                    if let Some(errors) = &errors {
                        let headers = fault_headers(&inner.address, Some(&*consumer), errors, attempts);
                        fault = Some(Settlement::DeadLetter { headers });
                    }
                }
            }
        }

        let mut outcome = inner.outcome(envelope, kind, started, Some(&*consumer), errors);
        outcome.attempts = attempts;
        outcome.fields = ctx.fields();
        outcome.stages = ctx.stages().to_vec();
        outcomes.push(outcome);
    }

    let settlement = if cancelled {
        Settlement::Requeue
    } else if let Some(fault) = fault {
        fault
    } else if let Some(undecodable) = undecodable {
        if undecodable == Settlement::Requeue {
            inner.requeue_backoff(cancel).await;
        }
        undecodable
    } else {
        Settlement::Ack
    };
    (settlement, outcomes)
}

/// Maps a pipe result to an outcome.
fn classify(result: &BusResult<()>, cancel: &CancellationToken) -> OutcomeKind {
    let Err(errors) = result else {
        return OutcomeKind::Success;
    };
    if cancel.is_cancelled() || errors.contains(ErrorKind::Cancelled) {
        OutcomeKind::Cancelled
    } else if errors.contains(ErrorKind::RetryExhausted) {
        OutcomeKind::RetryExhausted
    } else if errors.first().kind() == ErrorKind::Fault {
        OutcomeKind::Exception
    } else {
        OutcomeKind::Faulted
    }
}

fn fault_headers(
    endpoint: &EndpointAddress,
    consumer: Option<&str>,
    errors: &Errors,
    attempts: u32,
) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(headers::FAULT_MESSAGE.to_string(), errors.to_string());
    headers.insert(headers::FAULT_KIND.to_string(), errors.first().kind().to_string());
    headers.insert(headers::FAULT_TIMESTAMP.to_string(), Utc::now().to_rfc3339());
    headers.insert(headers::FAULT_ENDPOINT.to_string(), endpoint.to_string());
    if let Some(consumer) = consumer {
        headers.insert(headers::FAULT_CONSUMER.to_string(), consumer.to_string());
    }
    headers.insert(headers::FAULT_RETRY_COUNT.to_string(), attempts.saturating_sub(1).to_string());
    headers
}

impl EndpointInner {
    fn outcome(
        &self,
        envelope: &MessageEnvelope,
        kind: OutcomeKind,
        started: Instant,
        consumer: Option<&str>,
        errors: Option<Errors>,
    ) -> DeliveryOutcome {
        DeliveryOutcome {
            kind,
            endpoint: self.address.clone(),
            message_id: envelope.message_id(),
            message_type: envelope.primary_message_type().to_string(),
            consumer: consumer.map(str::to_string),
            attempts: 0,
            duration: started.elapsed(),
            errors,
            fields: BTreeMap::new(),
            stages: Vec::new(),
        }
    }

    fn deserialization_settlement(&self, consumer: &str, errors: &Errors) -> Settlement {
        match self.config.deserialization_failure {
            DeserializationFailurePolicy::DeadLetter => Settlement::DeadLetter {
                headers: fault_headers(&self.address, Some(consumer), errors, 0),
            },
            DeserializationFailurePolicy::Drop => Settlement::Ack,
            DeserializationFailurePolicy::Requeue => Settlement::Requeue,
        }
    }

    /// Holds an undecodable delivery back before it is requeued, so it is not
    /// redelivered in a tight loop. Cancellation ends the wait early.
    async fn requeue_backoff(&self, cancel: &CancellationToken) {
        let delay = self.config.requeue_delay();
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }

    /// Sends a copy of a faulted envelope to its fault address, if it has one.
    async fn notify_fault_address(&self, envelope: &MessageEnvelope, headers: &BTreeMap<String, String>) {
        let Some(address) = envelope.fault_address() else {
            return;
        };
        let Some(publisher) = self.publisher() else {
            return;
        };
        let copy = envelope.with_headers(headers.clone());
        if let Err(errors) = publisher.send_envelope(address, copy).await {
            tracing::warn!(
                endpoint = %self.address,
                fault_address = %address,
                error = %errors,
                "failed to forward fault"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
