//! Registry of receive endpoints: lookup by address, subscriber matching
//! and ordered start/stop.

use dashmap::DashMap;
use parking_lot::RwLock;

use courier_core::{BusResult, EndpointAddress, Error, Errors};

use crate::endpoint::ReceiveEndpoint;

// ---------------------------------------------------------------------------
// EndpointRegistry
// ---------------------------------------------------------------------------

/// Registry of the bus's receive endpoints.
///
/// Endpoints are looked up by address. They start in registration order and
/// stop in reverse registration order.
pub struct EndpointRegistry {
    /// Address (as text) -> endpoint.
    by_address: DashMap<String, ReceiveEndpoint>,
    /// Registration order for deterministic start/stop sequencing.
    order: RwLock<Vec<String>>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_address: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers an endpoint.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpointAddress` if an endpoint with the same address
    /// is already registered.
    pub fn register(&self, endpoint: ReceiveEndpoint) -> BusResult<()> {
        let key = endpoint.address().to_string();
        let mut order = self.order.write();
        if self.by_address.contains_key(&key) {
            return Err(Error::invalid_address(key, "a receive endpoint is already registered here").into());
        }
        self.by_address.insert(key.clone(), endpoint);
        order.push(key);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, address: &EndpointAddress) -> Option<ReceiveEndpoint> {
        self.by_address
            .get(&address.to_string())
            .map(|entry| entry.value().clone())
    }

    /// Every endpoint, in registration order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<ReceiveEndpoint> {
        let order = self.order.read().clone();
        order
            .iter()
            .filter_map(|key| self.by_address.get(key).map(|e| e.value().clone()))
            .collect()
    }

    /// Endpoints with a consumer for any of `message_types`, in registration
    /// order.
    #[must_use]
    pub fn subscribers(&self, message_types: &[String]) -> Vec<ReceiveEndpoint> {
        self.endpoints()
            .into_iter()
            .filter(|endpoint| endpoint.subscribes_to(message_types))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Starts every endpoint in registration order.
    ///
    /// Every endpoint is attempted even if an earlier one fails; endpoints
    /// that started stay running until `stop_all`.
    ///
    /// # Errors
    ///
    /// Returns the combined errors of every endpoint that failed to start.
    pub async fn start_all(&self) -> BusResult<()> {
        let mut failures: Option<Errors> = None;
        for endpoint in self.endpoints() {
            if let Err(errors) = endpoint.start().await {
                tracing::warn!(endpoint = %endpoint.address(), error = %errors, "endpoint failed to start");
                match &mut failures {
                    Some(all) => all.extend(errors),
                    None => failures = Some(errors),
                }
            }
        }
        failures.map_or(Ok(()), Err)
    }

    /// Stops every endpoint in reverse registration order.
    ///
    /// Every endpoint is stopped even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the combined errors of every endpoint that failed to stop.
    pub async fn stop_all(&self) -> BusResult<()> {
        let mut failures: Option<Errors> = None;
        for endpoint in self.endpoints().iter().rev() {
            if let Err(errors) = endpoint.stop().await {
                tracing::warn!(endpoint = %endpoint.address(), error = %errors, "endpoint failed to stop");
                match &mut failures {
                    Some(all) => all.extend(errors),
                    None => failures = Some(errors),
                }
            }
        }
        failures.map_or(Ok(()), Err)
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use courier_core::{ErrorKind, Message, MessageTypeName};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::consumer::{ConsumeContext, ConsumerRegistration};
    use crate::endpoint::EndpointState;
    use crate::transport::{
        InMemoryTransport, InboundDelivery, ReceiveTransport, SendTransport, Settlement, Transport,
    };

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl Message for Ping {
        fn message_type() -> MessageTypeName {
            MessageTypeName::new("Tests", "Ping")
        }
    }

    fn endpoint(name: &str, transport: &InMemoryTransport) -> ReceiveEndpoint {
        ReceiveEndpoint::builder(EndpointAddress::in_memory(name).unwrap())
            .consumer(ConsumerRegistration::handler("Ping", |_ctx: ConsumeContext<Ping>| async {
                Ok::<(), Errors>(())
            }))
            .build(Arc::new(transport.clone()))
    }

    #[test]
    fn register_and_lookup() {
        let transport = InMemoryTransport::new();
        let registry = EndpointRegistry::new();
        registry.register(endpoint("first", &transport)).unwrap();
        registry.register(endpoint("second", &transport)).unwrap();

        let address = EndpointAddress::in_memory("second").unwrap();
        assert_eq!(registry.get(&address).unwrap().address(), &address);
        assert!(registry.get(&EndpointAddress::in_memory("third").unwrap()).is_none());

        let names: Vec<String> = registry
            .endpoints()
            .iter()
            .map(|e| e.address().name().to_string())
            .collect();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let transport = InMemoryTransport::new();
        let registry = EndpointRegistry::new();
        registry.register(endpoint("orders", &transport)).unwrap();
        let errors = registry.register(endpoint("orders", &transport)).unwrap_err();
        assert_eq!(errors.first().kind(), ErrorKind::InvalidEndpointAddress);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn subscribers_match_message_types() {
        let transport = InMemoryTransport::new();
        let registry = EndpointRegistry::new();
        registry.register(endpoint("a", &transport)).unwrap();
        registry.register(endpoint("b", &transport)).unwrap();

        assert_eq!(registry.subscribers(&["urn:message:Tests:Ping".to_string()]).len(), 2);
        assert!(registry.subscribers(&["urn:message:Tests:Pong".to_string()]).is_empty());
    }

    #[tokio::test]
    async fn start_all_then_stop_all() {
        let transport = InMemoryTransport::new();
        let registry = EndpointRegistry::new();
        registry.register(endpoint("first", &transport)).unwrap();
        registry.register(endpoint("second", &transport)).unwrap();

        registry.start_all().await.unwrap();
        assert!(registry
            .endpoints()
            .iter()
            .all(|e| e.state() == EndpointState::Running));

        registry.stop_all().await.unwrap();
        assert!(registry
            .endpoints()
            .iter()
            .all(|e| e.state() == EndpointState::Stopped));
    }

    fn without_consumers(name: &str, transport: &InMemoryTransport) -> ReceiveEndpoint {
        ReceiveEndpoint::builder(EndpointAddress::in_memory(name).unwrap())
            .build(Arc::new(transport.clone()))
    }

    #[tokio::test]
    async fn start_all_attempts_every_endpoint_and_aggregates() {
        let transport = InMemoryTransport::new();
        let registry = EndpointRegistry::new();
        registry.register(endpoint("first", &transport)).unwrap();
        registry.register(without_consumers("broken_a", &transport)).unwrap();
        registry.register(without_consumers("broken_b", &transport)).unwrap();
        registry.register(endpoint("last", &transport)).unwrap();

        let errors = registry.start_all().await.unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind() == ErrorKind::TransportError));

        let states: Vec<(String, EndpointState)> = registry
            .endpoints()
            .iter()
            .map(|e| (e.address().name().to_string(), e.state()))
            .collect();
        assert_eq!(
            states,
            [
                ("first".to_string(), EndpointState::Running),
                ("broken_a".to_string(), EndpointState::Created),
                ("broken_b".to_string(), EndpointState::Created),
                ("last".to_string(), EndpointState::Running),
            ]
        );

        registry.stop_all().await.unwrap();
    }

    /// In-memory transport whose receivers record closes and fail for the
    /// configured queues.
    #[derive(Clone)]
    struct ClosingTransport {
        inner: InMemoryTransport,
        failing: Arc<Vec<&'static str>>,
        closed: Arc<Mutex<Vec<String>>>,
    }

    struct ClosingReceiver {
        inner: Arc<dyn ReceiveTransport>,
        fail: bool,
        closed: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for ClosingTransport {
        fn scheme(&self) -> &str {
            self.inner.scheme()
        }

        async fn start(&self) -> BusResult<()> {
            self.inner.start().await
        }

        async fn stop(&self) -> BusResult<()> {
            self.inner.stop().await
        }

        fn get_send_endpoint(&self, address: &EndpointAddress) -> BusResult<Arc<dyn SendTransport>> {
            self.inner.get_send_endpoint(address)
        }

        fn create_receive_endpoint(&self, address: &EndpointAddress) -> BusResult<Arc<dyn ReceiveTransport>> {
            Ok(Arc::new(ClosingReceiver {
                inner: self.inner.create_receive_endpoint(address)?,
                fail: self.failing.iter().any(|name| *name == address.name()),
                closed: self.closed.clone(),
            }))
        }
    }

    #[async_trait]
    impl ReceiveTransport for ClosingReceiver {
        fn address(&self) -> &EndpointAddress {
            self.inner.address()
        }

        async fn open(&self, prefetch: u32) -> BusResult<()> {
            self.inner.open(prefetch).await
        }

        async fn receive(&self, cancel: &CancellationToken) -> Option<InboundDelivery> {
            self.inner.receive(cancel).await
        }

        async fn settle(&self, delivery: InboundDelivery, settlement: Settlement) -> BusResult<()> {
            self.inner.settle(delivery, settlement).await
        }

        async fn close(&self) -> BusResult<()> {
            let name = self.inner.address().name().to_string();
            self.inner.close().await?;
            self.closed.lock().push(name.clone());
            if self.fail {
                return Err(Error::transport(format!("{name} refused to close")).into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_all_runs_in_reverse_and_aggregates_failures() {
        let transport = ClosingTransport {
            inner: InMemoryTransport::new(),
            failing: Arc::new(vec!["second", "fourth"]),
            closed: Arc::new(Mutex::new(Vec::new())),
        };
        let registry = EndpointRegistry::new();
        for name in ["first", "second", "third", "fourth"] {
            let endpoint = ReceiveEndpoint::builder(EndpointAddress::in_memory(name).unwrap())
                .consumer(ConsumerRegistration::handler("Ping", |_ctx: ConsumeContext<Ping>| async {
                    Ok::<(), Errors>(())
                }))
                .build(Arc::new(transport.clone()));
            registry.register(endpoint).unwrap();
        }
        registry.start_all().await.unwrap();

        let errors = registry.stop_all().await.unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind() == ErrorKind::TransportError));
        assert_eq!(*transport.closed.lock(), ["fourth", "third", "second", "first"]);
        assert!(registry
            .endpoints()
            .iter()
            .all(|e| e.state() == EndpointState::Stopped));
    }
}
