//! The bus: transports, receive endpoints and the outbound API.
//!
//! A [`Bus`] is assembled once with [`BusBuilder`], then started and
//! stopped as a unit. Publishing routes a message to every receive endpoint
//! with a consumer for one of its type identifiers; sending targets one
//! address, either given explicitly or mapped per message type.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use courier_core::{
    BusResult, EndpointAddress, Error, Errors, HostInfo, Message, MessageEnvelope,
    MessageSerializer, MessageTypeRegistry,
};

use crate::config::BusConfig;
use crate::endpoint::{ObservabilitySink, ReceiveEndpoint, ReceiveEndpointBuilder};
use crate::publish::{Publisher, SendOptions};
use crate::registry::EndpointRegistry;
use crate::transport::{InMemoryTransport, SendTransport, Transport};

type ConfigureEndpoint = Box<dyn FnOnce(ReceiveEndpointBuilder) -> ReceiveEndpointBuilder + Send>;

// ---------------------------------------------------------------------------
// BusBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`Bus`].
///
/// Configuration errors (bad addresses, unknown schemes, duplicate
/// transports) are collected and reported together by [`BusBuilder::build`].
#[must_use]
pub struct BusBuilder {
    config: BusConfig,
    transports: Vec<Arc<dyn Transport>>,
    endpoints: Vec<(EndpointAddress, ConfigureEndpoint)>,
    mappings: HashMap<String, EndpointAddress>,
    registry: MessageTypeRegistry,
    sink: Option<Arc<dyn ObservabilitySink>>,
    errors: Vec<Error>,
}

impl BusBuilder {
    pub fn new() -> Self {
        Self {
            config: BusConfig::default(),
            transports: Vec::new(),
            endpoints: Vec::new(),
            mappings: HashMap::new(),
            registry: MessageTypeRegistry::new(),
            sink: None,
            errors: Vec::new(),
        }
    }

    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a transport. An in-memory transport is added at build time when
    /// none serves the `inmemory` scheme.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transports.push(Arc::new(transport));
        self
    }

    /// Sink for every endpoint that does not set its own.
    pub fn sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Registers `T` in the message-type registry without consuming it.
    pub fn message<T: Message>(mut self) -> Self {
        if let Err(error) = self.registry.register::<T>() {
            self.errors.push(error);
        }
        self
    }

    /// Declares a receive endpoint. `queue` is either a full address or a
    /// bare queue name on the in-memory transport.
    ///
    /// The builder passed to `configure` starts from the bus's endpoint
    /// defaults.
    pub fn receive_endpoint<F>(mut self, queue: &str, configure: F) -> Self
    where
        F: FnOnce(ReceiveEndpointBuilder) -> ReceiveEndpointBuilder + Send + 'static,
    {
        match resolve_queue(queue) {
            Ok(address) => self.endpoints.push((address, Box::new(configure))),
            Err(error) => self.errors.push(error),
        }
        self
    }

    /// Maps message type `T` to the address used by [`Bus::send`].
    pub fn map_endpoint<T: Message>(mut self, queue: &str) -> Self {
        match resolve_queue(queue) {
            Ok(address) => match self.registry.register::<T>() {
                Ok(entry) => {
                    let urn = entry.urn().to_string();
                    self.mappings.insert(urn, address);
                }
                Err(error) => self.errors.push(error),
            },
            Err(error) => self.errors.push(error),
        }
        self
    }

    /// Finishes the bus.
    ///
    /// # Errors
    ///
    /// Returns every configuration error found: invalid queue addresses,
    /// endpoints whose scheme no transport serves, two transports for one
    /// scheme, two endpoints on one address, two message types sharing an
    /// identifier.
    pub fn build(self) -> BusResult<Bus> {
        let BusBuilder {
            config,
            mut transports,
            endpoints,
            mappings,
            mut registry,
            sink,
            mut errors,
        } = self;

        if !transports.iter().any(|t| t.scheme() == courier_core::IN_MEMORY_SCHEME) {
            transports.push(Arc::new(InMemoryTransport::new()));
        }
        for (i, transport) in transports.iter().enumerate() {
            if transports[..i].iter().any(|t| t.scheme() == transport.scheme()) {
                errors.push(Error::transport(format!(
                    "more than one transport registered for scheme `{}`",
                    transport.scheme()
                )));
            }
        }

        let address = match EndpointAddress::in_memory(&config.name) {
            Ok(address) => Some(address),
            Err(error) => {
                errors.push(error);
                None
            }
        };

        let mut resolved = Vec::with_capacity(endpoints.len());
        for (endpoint_address, configure) in endpoints {
            match transport_for(&transports, &endpoint_address) {
                Ok(transport) => resolved.push((endpoint_address, configure, transport)),
                Err(error) => errors.push(error),
            }
        }

        if let Some(errors) = Errors::from_vec(errors) {
            return Err(errors);
        }
        let Some(address) = address else {
            return Err(Error::transport("bus address could not be resolved").into());
        };

        let mut prepared = Vec::with_capacity(resolved.len());
        for (endpoint_address, configure, transport) in resolved {
            let mut builder = configure(
                ReceiveEndpointBuilder::new(endpoint_address).config(config.endpoint_defaults.clone()),
            );
            if !builder.has_sink() {
                if let Some(sink) = &sink {
                    builder = builder.sink(Arc::clone(sink));
                }
            }
            prepared.push((builder, transport));
        }

        let host = config.stamp_host.then(HostInfo::current);
        let core = Arc::new_cyclic(|weak: &Weak<BusCore>| {
            let publisher: Weak<dyn Publisher> = weak.clone();
            let endpoints = EndpointRegistry::new();
            let mut duplicates = Vec::new();
            for (builder, transport) in prepared {
                let endpoint = builder.publisher(Weak::clone(&publisher)).build(transport);
                for registration in endpoint.registrations() {
                    if let Err(error) = registry.insert(registration.message_type().clone()) {
                        duplicates.push(error.into());
                    }
                }
                if let Err(errors) = endpoints.register(endpoint) {
                    duplicates.push(errors);
                }
            }
            BusCore {
                address,
                config,
                host,
                transports,
                endpoints,
                mappings,
                registry,
                duplicates,
            }
        });

        if let Some(mut all) = core.duplicates.first().cloned() {
            for errors in core.duplicates.iter().skip(1) {
                all.extend(errors.clone());
            }
            return Err(all);
        }
        Ok(Bus { core })
    }
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_queue(queue: &str) -> Result<EndpointAddress, Error> {
    if queue.contains("://") {
        EndpointAddress::parse(queue)
    } else {
        EndpointAddress::in_memory(queue)
    }
}

fn transport_for(
    transports: &[Arc<dyn Transport>],
    address: &EndpointAddress,
) -> Result<Arc<dyn Transport>, Error> {
    transports
        .iter()
        .find(|t| t.scheme() == address.scheme())
        .cloned()
        .ok_or_else(|| {
            Error::invalid_address(
                address.to_string(),
                format!("no transport registered for scheme `{}`", address.scheme()),
            )
        })
}

// ---------------------------------------------------------------------------
// BusCore
// ---------------------------------------------------------------------------

struct BusCore {
    address: EndpointAddress,
    config: BusConfig,
    host: Option<HostInfo>,
    transports: Vec<Arc<dyn Transport>>,
    endpoints: EndpointRegistry,
    mappings: HashMap<String, EndpointAddress>,
    registry: MessageTypeRegistry,
    /// Endpoint registration failures, reported by `build()`.
    duplicates: Vec<Errors>,
}

impl BusCore {
    fn send_transport(&self, address: &EndpointAddress) -> BusResult<Arc<dyn SendTransport>> {
        transport_for(&self.transports, address)?.get_send_endpoint(address)
    }

    fn envelope_for<T: Message>(&self, message: &T, options: SendOptions) -> BusResult<MessageEnvelope> {
        let mut builder = MessageEnvelope::for_message(message, self.config.serializer)?
            .source_address(self.address.clone());
        if let Some(host) = &self.host {
            builder = builder.host(host.clone());
        }
        Ok(options.apply(builder).build()?)
    }
}

#[async_trait]
impl Publisher for BusCore {
    fn serializer(&self) -> MessageSerializer {
        self.config.serializer
    }

    fn host(&self) -> Option<HostInfo> {
        self.host.clone()
    }

    fn mapped_address(&self, message_type: &str) -> BusResult<EndpointAddress> {
        self.mappings.get(message_type).cloned().ok_or_else(|| {
            Error::invalid_address(message_type, "no endpoint mapped for this message type").into()
        })
    }

    async fn publish_envelope(&self, envelope: MessageEnvelope) -> BusResult<usize> {
        let subscribers = self.endpoints.subscribers(envelope.message_types());
        if subscribers.is_empty() {
            tracing::debug!(
                message_id = %envelope.message_id(),
                message_type = %envelope.primary_message_type(),
                "published message has no subscribers"
            );
            return Ok(0);
        }

        let mut delivered = 0;
        let mut failures: Option<Errors> = None;
        for endpoint in &subscribers {
            match self.send_envelope(endpoint.address(), envelope.clone()).await {
                Ok(()) => delivered += 1,
                Err(errors) => match &mut failures {
                    Some(all) => all.extend(errors),
                    None => failures = Some(errors),
                },
            }
        }
        tracing::debug!(
            message_id = %envelope.message_id(),
            message_type = %envelope.primary_message_type(),
            subscribers = subscribers.len(),
            delivered,
            "message published"
        );
        failures.map_or(Ok(delivered), Err)
    }

    async fn send_envelope(&self, address: &EndpointAddress, envelope: MessageEnvelope) -> BusResult<()> {
        let transport = self.send_transport(address)?;
        let envelope = envelope.with_destination(address.clone());
        tracing::trace!(
            destination = %address,
            message_id = %envelope.message_id(),
            message_type = %envelope.primary_message_type(),
            "sending envelope"
        );
        transport.send(envelope).await
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Handle to a built bus. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    core: Arc<BusCore>,
}

impl Bus {
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    /// Address stamped as the source of messages published by the bus.
    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        &self.core.address
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.core.config
    }

    /// Types registered on the bus, including every consumed type.
    #[must_use]
    pub fn registry(&self) -> &MessageTypeRegistry {
        &self.core.registry
    }

    /// Receive endpoints in registration order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<ReceiveEndpoint> {
        self.core.endpoints.endpoints()
    }

    #[must_use]
    pub fn endpoint(&self, address: &EndpointAddress) -> Option<ReceiveEndpoint> {
        self.core.endpoints.get(address)
    }

    /// Starts every transport, then every receive endpoint in registration
    /// order. Endpoints are not started when a transport failed.
    ///
    /// # Errors
    ///
    /// Returns every transport failure, or else every endpoint failure,
    /// combined.
    pub async fn start(&self) -> BusResult<()> {
        let mut failures: Option<Errors> = None;
        for transport in &self.core.transports {
            if let Err(errors) = transport.start().await {
                tracing::warn!(scheme = transport.scheme(), error = %errors, "transport failed to start");
                match &mut failures {
                    Some(all) => all.extend(errors),
                    None => failures = Some(errors),
                }
            }
        }
        if let Some(errors) = failures {
            return Err(errors);
        }
        self.core.endpoints.start_all().await?;
        tracing::info!(
            bus = %self.core.config.name,
            endpoints = self.core.endpoints.len(),
            transports = self.core.transports.len(),
            "bus started"
        );
        Ok(())
    }

    /// Stops receive endpoints in reverse order, then transports.
    ///
    /// Every component is stopped even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns every failure, combined.
    pub async fn stop(&self) -> BusResult<()> {
        let mut failures = self.core.endpoints.stop_all().await.err();
        for transport in self.core.transports.iter().rev() {
            if let Err(errors) = transport.stop().await {
                tracing::warn!(scheme = transport.scheme(), error = %errors, "transport failed to stop");
                match &mut failures {
                    Some(all) => all.extend(errors),
                    None => failures = Some(errors),
                }
            }
        }
        tracing::info!(bus = %self.core.config.name, clean = failures.is_none(), "bus stopped");
        failures.map_or(Ok(()), Err)
    }

    /// Publishes `message` to every endpoint subscribed to one of its type
    /// identifiers. Returns how many endpoints it was delivered to; zero
    /// subscribers is not an error.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be serialized or a subscriber's queue
    /// rejects it.
    pub async fn publish<T: Message>(&self, message: &T) -> BusResult<usize> {
        self.publish_with(message, SendOptions::default()).await
    }

    /// [`Bus::publish`] with per-call overrides.
    ///
    /// # Errors
    ///
    /// See [`Bus::publish`].
    pub async fn publish_with<T: Message>(&self, message: &T, options: SendOptions) -> BusResult<usize> {
        let envelope = self.core.envelope_for(message, options)?;
        self.core.publish_envelope(envelope).await
    }

    /// Sends `message` to the address mapped for its type.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpointAddress` when `T` has no mapped address.
    pub async fn send<T: Message>(&self, message: &T) -> BusResult<()> {
        self.send_with(message, SendOptions::default()).await
    }

    /// [`Bus::send`] with per-call overrides.
    ///
    /// # Errors
    ///
    /// See [`Bus::send`].
    pub async fn send_with<T: Message>(&self, message: &T, options: SendOptions) -> BusResult<()> {
        let address = self.core.mapped_address(&T::message_type().urn())?;
        self.send_to_with(&address, message, options).await
    }

    /// Sends `message` to `address`. The message is enqueued even when no
    /// consumer is running.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpointAddress` when no transport serves `address`.
    pub async fn send_to<T: Message>(&self, address: &EndpointAddress, message: &T) -> BusResult<()> {
        self.send_to_with(address, message, SendOptions::default()).await
    }

    /// [`Bus::send_to`] with per-call overrides.
    ///
    /// # Errors
    ///
    /// See [`Bus::send_to`].
    pub async fn send_to_with<T: Message>(
        &self,
        address: &EndpointAddress,
        message: &T,
        options: SendOptions,
    ) -> BusResult<()> {
        let transport = self.core.send_transport(address)?;
        let envelope = self
            .core
            .envelope_for(message, options)?
            .with_destination(address.clone());
        transport.send(envelope).await
    }

    /// Resolves a send endpoint for `address`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpointAddress` when no transport serves `address`.
    pub fn get_send_endpoint(&self, address: &EndpointAddress) -> BusResult<SendEndpoint> {
        let transport = self.core.send_transport(address)?;
        Ok(SendEndpoint {
            core: Arc::clone(&self.core),
            transport,
        })
    }

    /// Describes transports, endpoints, consumer pipes and send mappings.
    #[must_use]
    pub fn probe(&self) -> serde_json::Value {
        let core = &self.core;
        let mut mappings: Vec<(&String, String)> = core
            .mappings
            .iter()
            .map(|(urn, address)| (urn, address.to_string()))
            .collect();
        mappings.sort();
        serde_json::json!({
            "name": core.config.name,
            "address": core.address.to_string(),
            "transports": core.transports.iter().map(|t| t.scheme()).collect::<Vec<_>>(),
            "endpoints": core.endpoints.endpoints().iter().map(ReceiveEndpoint::probe).collect::<Vec<_>>(),
            "mappings": mappings
                .into_iter()
                .map(|(urn, address)| serde_json::json!({ "messageType": urn, "address": address }))
                .collect::<Vec<_>>(),
        })
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.core.config.name)
            .field("endpoints", &self.core.endpoints.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SendEndpoint
// ---------------------------------------------------------------------------

/// Sends to one resolved address.
#[derive(Clone)]
pub struct SendEndpoint {
    core: Arc<BusCore>,
    transport: Arc<dyn SendTransport>,
}

impl std::fmt::Debug for SendEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendEndpoint")
            .field("address", &self.address().to_string())
            .finish_non_exhaustive()
    }
}

impl SendEndpoint {
    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        self.transport.address()
    }

    /// # Errors
    ///
    /// Fails when the message cannot be serialized or enqueued.
    pub async fn send<T: Message>(&self, message: &T) -> BusResult<()> {
        self.send_with(message, SendOptions::default()).await
    }

    /// # Errors
    ///
    /// Fails when the message cannot be serialized or enqueued.
    pub async fn send_with<T: Message>(&self, message: &T, options: SendOptions) -> BusResult<()> {
        let envelope = self
            .core
            .envelope_for(message, options)?
            .with_destination(self.address().clone());
        self.transport.send(envelope).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use courier_core::{headers, ErrorKind, MessageTypeName};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::consumer::{ConsumeContext, ConsumerRegistration};
    use crate::endpoint::{MemorySink, OutcomeKind};
    use crate::retry::RetryPolicy;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SubmitOrder {
        order_id: String,
        quantity: u32,
    }

    impl Message for SubmitOrder {
        fn message_type() -> MessageTypeName {
            MessageTypeName::new("Orders", "SubmitOrder")
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderSubmitted {
        order_id: String,
    }

    impl Message for OrderSubmitted {
        fn message_type() -> MessageTypeName {
            MessageTypeName::new("Orders", "OrderSubmitted")
        }

        fn implemented_types() -> Vec<MessageTypeName> {
            vec![OrderEvent::message_type()]
        }
    }

    /// Contract implemented by every order event.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderEvent {
        order_id: String,
    }

    impl Message for OrderEvent {
        fn message_type() -> MessageTypeName {
            MessageTypeName::new("Orders", "OrderEvent")
        }
    }

    fn order() -> SubmitOrder {
        SubmitOrder {
            order_id: "o-1".to_string(),
            quantity: 3,
        }
    }

    fn recording<T: Message + Clone>(name: &str, seen: &Arc<Mutex<Vec<T>>>) -> ConsumerRegistration {
        let seen = Arc::clone(seen);
        ConsumerRegistration::handler(name, move |ctx: ConsumeContext<T>| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(ctx.message().clone());
                Ok::<(), Errors>(())
            }
        })
    }

    #[tokio::test]
    async fn sent_message_is_consumed_with_equal_payload() {
        let sink = Arc::new(MemorySink::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus = Bus::builder()
            .sink(sink.clone())
            .receive_endpoint("orders", {
                let seen = Arc::clone(&seen);
                move |e| e.consumer(recording::<SubmitOrder>("SubmitOrderConsumer", &seen))
            })
            .map_endpoint::<SubmitOrder>("orders")
            .build()
            .unwrap();

        bus.start().await.unwrap();
        bus.send(&order()).await.unwrap();
        assert!(sink.wait_for(1, WAIT).await);
        bus.stop().await.unwrap();

        assert_eq!(*seen.lock(), vec![order()]);
        assert_eq!(sink.outcomes()[0].kind, OutcomeKind::Success);
        assert!(bus.registry().contains("urn:message:Orders:SubmitOrder"));
    }

    #[tokio::test]
    async fn always_failing_consumer_exhausts_immediate_retries() {
        let sink = Arc::new(MemorySink::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let transport = InMemoryTransport::new();
        let bus = Bus::builder()
            .transport(transport.clone())
            .sink(sink.clone())
            .receive_endpoint("orders", move |e| {
                e.retry(RetryPolicy::immediate(2)).consumer(ConsumerRegistration::handler(
                    "Failing",
                    move |_ctx: ConsumeContext<SubmitOrder>| {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Err(Errors::from(Error::failure("rejected", "order rejected")))
                        }
                    },
                ))
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        let address = EndpointAddress::in_memory("orders").unwrap();
        bus.send_to(&address, &order()).await.unwrap();
        assert!(sink.wait_for(1, WAIT).await);
        bus.stop().await.unwrap();

        let outcome = &sink.outcomes()[0];
        assert_eq!(outcome.kind, OutcomeKind::RetryExhausted);
        assert!(outcome
            .errors
            .as_ref()
            .is_some_and(|e| e.contains(ErrorKind::RetryExhausted)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(transport.drain("orders_error").len(), 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = Bus::builder().build().unwrap();
        bus.start().await.unwrap();
        let delivered = bus
            .publish(&OrderSubmitted {
                order_id: "o-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn publish_reaches_interface_subscribers() {
        let sink = Arc::new(MemorySink::new());
        let submitted = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::<OrderEvent>::new()));
        let bus = Bus::builder()
            .sink(sink.clone())
            .receive_endpoint("billing", {
                let submitted = Arc::clone(&submitted);
                move |e| e.consumer(recording::<OrderSubmitted>("Billing", &submitted))
            })
            .receive_endpoint("audit", {
                let events = Arc::clone(&events);
                move |e| e.consumer(recording::<OrderEvent>("Audit", &events))
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        let delivered = bus
            .publish(&OrderSubmitted {
                order_id: "o-9".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert!(sink.wait_for(2, WAIT).await);
        bus.stop().await.unwrap();

        assert_eq!(submitted.lock()[0].order_id, "o-9");
        assert_eq!(events.lock()[0].order_id, "o-9");
    }

    #[tokio::test]
    async fn unresolvable_addresses_are_rejected() {
        let bus = Bus::builder().build().unwrap();

        let amqp = EndpointAddress::parse("amqp://broker/orders").unwrap();
        let errors = bus.get_send_endpoint(&amqp).unwrap_err();
        assert_eq!(errors.first().kind(), ErrorKind::InvalidEndpointAddress);
        let errors = bus.send_to(&amqp, &order()).await.unwrap_err();
        assert_eq!(errors.first().kind(), ErrorKind::InvalidEndpointAddress);

        let errors = bus.send(&order()).await.unwrap_err();
        assert_eq!(errors.first().kind(), ErrorKind::InvalidEndpointAddress);
    }

    #[tokio::test]
    async fn start_reports_every_failing_endpoint() {
        let seen = Arc::new(Mutex::new(Vec::<SubmitOrder>::new()));
        let bus = Bus::builder()
            .receive_endpoint("orders", {
                let seen = Arc::clone(&seen);
                move |e| e.consumer(recording::<SubmitOrder>("SubmitOrderConsumer", &seen))
            })
            .receive_endpoint("broken_a", |e| e)
            .receive_endpoint("broken_b", |e| e)
            .build()
            .unwrap();

        let errors = bus.start().await.unwrap_err();
        assert_eq!(errors.len(), 2);
        let orders = bus.endpoint(&EndpointAddress::in_memory("orders").unwrap()).unwrap();
        assert_eq!(orders.state(), crate::endpoint::EndpointState::Running);

        bus.stop().await.unwrap();
        assert_eq!(orders.state(), crate::endpoint::EndpointState::Stopped);
    }

    #[test]
    fn configuration_errors_are_reported_together() {
        let errors = Bus::builder()
            .receive_endpoint("not a valid uri://", |e| e)
            .receive_endpoint("amqp://broker/orders", |e| e)
            .transport(InMemoryTransport::new())
            .transport(InMemoryTransport::new())
            .build()
            .unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[tokio::test]
    async fn send_enqueues_without_running_consumer() {
        let transport = InMemoryTransport::new();
        let bus = Bus::builder().transport(transport.clone()).build().unwrap();
        let address = EndpointAddress::in_memory("later").unwrap();

        let endpoint = bus.get_send_endpoint(&address).unwrap();
        assert!(format!("{endpoint:?}").contains("inmemory://"));
        endpoint
            .send_with(&order(), SendOptions::new().header("x-source", "test"))
            .await
            .unwrap();

        let queued = transport.drain("later");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].destination_address(), Some(&address));
        assert_eq!(queued[0].source_address(), Some(bus.address()));
        assert_eq!(queued[0].header("x-source"), Some("test"));
    }

    #[tokio::test]
    async fn follow_up_keeps_correlation_and_conversation() {
        let sink = Arc::new(MemorySink::new());
        let transport = InMemoryTransport::new();
        let bus = Bus::builder()
            .transport(transport.clone())
            .sink(sink.clone())
            .receive_endpoint("orders", |e| {
                e.consumer(ConsumerRegistration::handler(
                    "Submitter",
                    |ctx: ConsumeContext<SubmitOrder>| async move {
                        let event = OrderSubmitted {
                            order_id: ctx.message().order_id.clone(),
                        };
                        ctx.send_to(&EndpointAddress::in_memory("events").unwrap(), &event)
                            .await
                    },
                ))
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        let address = EndpointAddress::in_memory("orders").unwrap();
        let options = SendOptions::new().header(headers::TENANT_ID, "acme");
        bus.send_to_with(&address, &order(), options).await.unwrap();
        assert!(sink.wait_for(1, WAIT).await);
        bus.stop().await.unwrap();

        assert_eq!(sink.outcomes()[0].kind, OutcomeKind::Success);
        let events = transport.drain("events");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.initiator_id().is_some());
        assert!(event.conversation_id().is_some());
        assert_eq!(event.header(headers::TENANT_ID), Some("acme"));
        assert_eq!(event.primary_message_type(), "urn:message:Orders:OrderSubmitted");
    }

    #[tokio::test]
    async fn fault_address_receives_a_copy_of_failed_messages() {
        let sink = Arc::new(MemorySink::new());
        let transport = InMemoryTransport::new();
        let bus = Bus::builder()
            .transport(transport.clone())
            .sink(sink.clone())
            .receive_endpoint("orders", |e| {
                e.consumer(ConsumerRegistration::handler(
                    "Rejecting",
                    |_ctx: ConsumeContext<SubmitOrder>| async {
                        Err(Errors::from(Error::validation("quantity", "too many")))
                    },
                ))
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        let faults = EndpointAddress::in_memory("faults").unwrap();
        let address = EndpointAddress::in_memory("orders").unwrap();
        bus.send_to_with(&address, &order(), SendOptions::new().fault_address(faults))
            .await
            .unwrap();
        assert!(sink.wait_for(1, WAIT).await);
        bus.stop().await.unwrap();

        assert_eq!(sink.outcomes()[0].kind, OutcomeKind::Faulted);
        let copies = transport.drain("faults");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].header(headers::FAULT_KIND), Some("consumer_failed:validation"));
        assert_eq!(transport.drain("orders_error").len(), 1);
    }

    #[test]
    fn probe_lists_endpoints_and_mappings() {
        let bus = Bus::builder()
            .receive_endpoint("orders", |e| {
                e.consumer(ConsumerRegistration::handler(
                    "Orders",
                    |_ctx: ConsumeContext<SubmitOrder>| async { Ok::<(), Errors>(()) },
                ))
            })
            .map_endpoint::<SubmitOrder>("orders")
            .build()
            .unwrap();

        let probe = bus.probe();
        assert_eq!(probe["name"], "courier");
        assert_eq!(probe["transports"][0], "inmemory");
        assert_eq!(probe["endpoints"][0]["address"], "inmemory://localhost/orders");
        assert_eq!(probe["mappings"][0]["messageType"], "urn:message:Orders:SubmitOrder");
    }
}
