//! Type-erased consumer registrations and the terminal filter that invokes
//! them.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{BusResult, Error, Errors, Message, MessageSerializer, RegisteredType};
use futures_util::FutureExt;
use tower::{Service, ServiceExt};

use super::delivery::{DeliveryContext, SharedMessage};
use super::{ConsumeContext, Consumer};
use crate::config::EndpointConfig;
use crate::pipe::{build_delivery_pipe, Filter, Pipe, ProbeContext};

type MakeConsumer<T> = Arc<dyn Fn() -> Arc<dyn Consumer<T>> + Send + Sync>;

// ---------------------------------------------------------------------------
// ConsumerRegistration
// ---------------------------------------------------------------------------

/// A consumer bound to the message type it handles.
pub struct ConsumerRegistration {
    name: Arc<str>,
    message_type: RegisteredType,
    terminal: Arc<dyn Filter<DeliveryContext>>,
    filters: Vec<Arc<dyn Filter<DeliveryContext>>>,
}

impl ConsumerRegistration {
    fn from_make<T: Message>(name: &str, make: MakeConsumer<T>) -> Self {
        Self {
            name: Arc::from(name),
            message_type: RegisteredType::of::<T>(),
            terminal: Arc::new(ConsumerFilter { make }),
            filters: Vec::new(),
        }
    }

    /// Consumer created by `factory` for every delivery.
    pub fn consumer<T, C, F>(factory: F) -> Self
    where
        T: Message,
        C: Consumer<T>,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let make: MakeConsumer<T> = Arc::new(move || Arc::new(factory()) as Arc<dyn Consumer<T>>);
        Self::from_make(short_type_name::<C>(), make)
    }

    /// One consumer instance shared by every delivery.
    pub fn instance<T: Message, C: Consumer<T>>(consumer: C) -> Self {
        let shared: Arc<dyn Consumer<T>> = Arc::new(consumer);
        let make: MakeConsumer<T> = Arc::new(move || Arc::clone(&shared));
        Self::from_make(short_type_name::<C>(), make)
    }

    /// Async closure handler.
    pub fn handler<T, F, Fut>(name: &str, handler: F) -> Self
    where
        T: Message,
        F: Fn(ConsumeContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<()>> + Send + 'static,
    {
        Self::instance::<T, _>(HandlerConsumer {
            handler,
            _fut: PhantomData,
        })
        .named(name)
    }

    /// Any `tower::Service` over [`ConsumeContext`].
    pub fn service<T, S>(name: &str, service: S) -> Self
    where
        T: Message,
        S: Service<ConsumeContext<T>, Response = ()> + Clone + Send + Sync + 'static,
        S::Error: Into<Errors>,
        S::Future: Send,
    {
        Self::instance::<T, _>(ServiceConsumer { service }).named(name)
    }

    /// Overrides the consumer name used in logs, outcomes and fault headers.
    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = Arc::from(name);
        self
    }

    /// Adds a filter that runs for this consumer only, after the endpoint's
    /// own filters.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Filter<DeliveryContext> + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// The registered message type.
    #[must_use]
    pub fn message_type(&self) -> &RegisteredType {
        &self.message_type
    }

    /// Identifier this consumer subscribes to.
    #[must_use]
    pub fn urn(&self) -> &str {
        self.message_type.urn()
    }

    /// Decodes a body into this consumer's message type.
    pub(crate) fn decode(&self, serializer: &MessageSerializer, body: &[u8]) -> Result<SharedMessage, Error> {
        self.message_type.decode(serializer, body).map(SharedMessage::from)
    }

    /// Composes the full delivery pipe for this consumer.
    pub(crate) fn build_pipe(
        &self,
        config: &EndpointConfig,
        endpoint_filters: &[Arc<dyn Filter<DeliveryContext>>],
    ) -> Arc<dyn Pipe<DeliveryContext>> {
        let filters: Vec<_> = endpoint_filters
            .iter()
            .chain(&self.filters)
            .cloned()
            .collect();
        build_delivery_pipe(config, &filters, Arc::clone(&self.terminal))
    }
}

impl std::fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("name", &self.name)
            .field("message_type", &self.message_type.urn())
            .field("filters", &self.filters.len())
            .finish_non_exhaustive()
    }
}

fn short_type_name<C>() -> &'static str {
    let full = std::any::type_name::<C>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

struct HandlerConsumer<F, Fut> {
    handler: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<T, F, Fut> Consumer<T> for HandlerConsumer<F, Fut>
where
    T: Message,
    F: Fn(ConsumeContext<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BusResult<()>> + Send + 'static,
{
    async fn consume(&self, ctx: ConsumeContext<T>) -> BusResult<()> {
        (self.handler)(ctx).await
    }
}

struct ServiceConsumer<S> {
    service: S,
}

#[async_trait]
impl<T, S> Consumer<T> for ServiceConsumer<S>
where
    T: Message,
    S: Service<ConsumeContext<T>, Response = ()> + Clone + Send + Sync + 'static,
    S::Error: Into<Errors>,
    S::Future: Send,
{
    async fn consume(&self, ctx: ConsumeContext<T>) -> BusResult<()> {
        self.service.clone().oneshot(ctx).await.map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// ConsumerFilter
// ---------------------------------------------------------------------------

/// Terminal filter: hands the decoded message to the consumer.
///
/// A panic inside the consumer is caught and reported as `Error::Fault`, so
/// retry policies see it like any other failure.
pub struct ConsumerFilter<T> {
    make: MakeConsumer<T>,
}

#[async_trait]
impl<T: Message> Filter<DeliveryContext> for ConsumerFilter<T> {
    async fn send(&self, ctx: &mut DeliveryContext, _next: &dyn Pipe<DeliveryContext>) -> BusResult<()> {
        let message = Arc::clone(&ctx.message).downcast::<T>().map_err(|_| {
            Error::Fault(format!(
                "decoded message is not a {}",
                std::any::type_name::<T>()
            ))
        })?;
        let consume = ConsumeContext::from_delivery(message, ctx);
        let make = Arc::clone(&self.make);

        let invocation = AssertUnwindSafe(async move { make().consume(consume).await });
        match invocation.catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(Error::Fault(panic_message(&*payload)).into()),
        }
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe
            .add("consumer")
            .set("messageType", std::any::type_name::<T>());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use courier_core::{EndpointAddress, ErrorKind, MessageEnvelope, MessageTypeName};
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::retry::RetryPolicy;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Message for Ping {
        fn message_type() -> MessageTypeName {
            MessageTypeName::new("Tests", "Ping")
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pong;

    impl Message for Pong {
        fn message_type() -> MessageTypeName {
            MessageTypeName::new("Tests", "Pong")
        }
    }

    struct Counting {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Consumer<Ping> for Counting {
        async fn consume(&self, ctx: ConsumeContext<Ping>) -> BusResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.add_field("n", ctx.message().n.to_string());
            Ok(())
        }
    }

    fn delivery_for(registration: &ConsumerRegistration, ping: &Ping) -> DeliveryContext {
        let serializer = MessageSerializer::Json;
        let envelope = MessageEnvelope::for_message(ping, serializer).unwrap().build().unwrap();
        let message = registration.decode(&serializer, envelope.body()).unwrap();
        DeliveryContext::new(
            Arc::new(envelope),
            message,
            EndpointAddress::in_memory("pings").unwrap(),
            registration.name_arc(),
            CancellationToken::new(),
        )
    }

    fn no_timeout() -> EndpointConfig {
        EndpointConfig {
            message_timeout_ms: None,
            ..EndpointConfig::default()
        }
    }

    #[tokio::test]
    async fn factory_consumer_receives_message() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let registration = ConsumerRegistration::consumer(move || Counting {
            calls: Arc::clone(&counter),
        });
        assert_eq!(registration.name(), "Counting");
        assert_eq!(registration.urn(), "urn:message:Tests:Ping");

        let pipe = registration.build_pipe(&no_timeout(), &[]);
        let mut ctx = delivery_for(&registration, &Ping { n: 7 });
        pipe.send(&mut ctx).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.fields().get("n").map(String::as_str), Some("7"));
    }

    #[tokio::test]
    async fn handler_sees_retry_attempts() {
        let registration = ConsumerRegistration::handler("flaky", |ctx: ConsumeContext<Ping>| async move {
            if ctx.attempt() < 2 {
                Err(Errors::from(Error::failure("flaky", "not yet")))
            } else {
                Ok(())
            }
        });
        let config = EndpointConfig {
            retry: RetryPolicy::immediate(3),
            ..no_timeout()
        };
        let pipe = registration.build_pipe(&config, &[]);
        let mut ctx = delivery_for(&registration, &Ping { n: 1 });
        pipe.send(&mut ctx).await.unwrap();
        assert_eq!(ctx.attempt(), 2);
    }

    #[tokio::test]
    async fn panics_become_faults() {
        let registration = ConsumerRegistration::handler("boom", |ctx: ConsumeContext<Ping>| async move {
            assert!(ctx.message().n > 100, "consumer exploded");
            Ok::<(), Errors>(())
        });
        let pipe = registration.build_pipe(&no_timeout(), &[]);
        let mut ctx = delivery_for(&registration, &Ping { n: 1 });

        let errors = pipe.send(&mut ctx).await.unwrap_err();
        assert_eq!(errors.first(), &Error::Fault("consumer exploded".to_string()));
    }

    #[tokio::test]
    async fn tower_service_adapter() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let service = tower::service_fn(move |ctx: ConsumeContext<Ping>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(ctx.message().n, Ordering::SeqCst);
                Ok::<(), Errors>(())
            }
        });
        let registration = ConsumerRegistration::service("svc", service);
        let pipe = registration.build_pipe(&no_timeout(), &[]);
        let mut ctx = delivery_for(&registration, &Ping { n: 5 });
        pipe.send(&mut ctx).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn wrong_decoded_type_is_a_fault() {
        let registration = ConsumerRegistration::handler("ping", |_ctx: ConsumeContext<Ping>| async { Ok::<(), Errors>(()) });
        let pipe = registration.build_pipe(&no_timeout(), &[]);
        let mut ctx = delivery_for(&registration, &Ping { n: 1 });
        ctx.message = Arc::new(Pong);

        let errors = pipe.send(&mut ctx).await.unwrap_err();
        assert_eq!(errors.first().kind(), ErrorKind::Fault);
    }

    #[test]
    fn decode_failure_is_typed() {
        let registration = ConsumerRegistration::handler("ping", |_ctx: ConsumeContext<Ping>| async { Ok::<(), Errors>(()) });
        let err = registration
            .decode(&MessageSerializer::Json, b"{\"n\":\"nope\"}")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeserializationFailed);
    }

    #[test]
    fn probe_lists_consumer_last() {
        let registration = ConsumerRegistration::handler("ping", |_ctx: ConsumeContext<Ping>| async { Ok::<(), Errors>(()) });
        let pipe = registration.build_pipe(&EndpointConfig::default(), &[]);
        let mut probe = ProbeContext::new();
        pipe.probe(&mut probe);
        assert_eq!(probe.filter_names(), vec!["logging", "timeout", "consumer"]);
    }
}
