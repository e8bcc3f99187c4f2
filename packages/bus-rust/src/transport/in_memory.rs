//! In-memory transport.
//!
//! Queues are created on first use and live as long as the transport.
//! Dead-lettered and skipped deliveries land on the `<name>_error` and
//! `<name>_skipped` queues of the same transport, where they can be
//! inspected with [`InMemoryTransport::drain`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use courier_core::{headers, BusResult, EndpointAddress, Error, MessageEnvelope, IN_MEMORY_SCHEME};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{InboundDelivery, ReceiveTransport, SendTransport, Settlement, Transport};

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Queue {
    address: EndpointAddress,
    tx: mpsc::UnboundedSender<InboundDelivery>,
    rx: Mutex<mpsc::UnboundedReceiver<InboundDelivery>>,
    depth: AtomicUsize,
    next_tag: AtomicU64,
}

impl Queue {
    fn new(address: EndpointAddress) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            address,
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
            next_tag: AtomicU64::new(1),
        }
    }

    fn push(&self, envelope: MessageEnvelope, redelivered: bool) -> BusResult<()> {
        let delivery = InboundDelivery {
            envelope,
            delivery_tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
            redelivered,
        };
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.tx.send(delivery).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            Error::transport(format!("queue {} is closed", self.address)).into()
        })
    }

    fn taken(&self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// InMemoryTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Hub {
    queues: DashMap<String, Arc<Queue>>,
    stopped: AtomicBool,
}

impl Hub {
    fn queue(&self, address: &EndpointAddress) -> Arc<Queue> {
        self.queues
            .entry(address.name().to_string())
            .or_insert_with(|| Arc::new(Queue::new(address.clone())))
            .clone()
    }

    fn ensure_running(&self) -> BusResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(Error::transport("in-memory transport is stopped").into())
        } else {
            Ok(())
        }
    }
}

/// Transport for the `inmemory` scheme.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    hub: Arc<Hub>,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check(address: &EndpointAddress) -> BusResult<()> {
        if address.scheme() == IN_MEMORY_SCHEME {
            Ok(())
        } else {
            Err(Error::invalid_address(
                address.to_string(),
                format!("scheme `{}` is not served by the in-memory transport", address.scheme()),
            )
            .into())
        }
    }

    /// Messages waiting on the named queue.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> usize {
        self.hub
            .queues
            .get(name)
            .map_or(0, |q| q.depth.load(Ordering::Acquire))
    }

    /// Names of every queue created so far.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.hub.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        names
    }

    /// Removes and returns every message currently on the named queue.
    ///
    /// Returns nothing while a receive endpoint is consuming the queue.
    pub fn drain(&self, name: &str) -> Vec<MessageEnvelope> {
        let Some(queue) = self.hub.queues.get(name).map(|q| Arc::clone(q.value())) else {
            return Vec::new();
        };
        let Ok(mut rx) = queue.rx.try_lock() else {
            return Vec::new();
        };
        let mut drained = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            queue.taken();
            drained.push(delivery.envelope);
        }
        drained
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn scheme(&self) -> &str {
        IN_MEMORY_SCHEME
    }

    async fn start(&self) -> BusResult<()> {
        self.hub.stopped.store(false, Ordering::Release);
        tracing::debug!("in-memory transport started");
        Ok(())
    }

    async fn stop(&self) -> BusResult<()> {
        self.hub.stopped.store(true, Ordering::Release);
        tracing::debug!(queues = self.hub.queues.len(), "in-memory transport stopped");
        Ok(())
    }

    fn get_send_endpoint(&self, address: &EndpointAddress) -> BusResult<Arc<dyn SendTransport>> {
        Self::check(address)?;
        Ok(Arc::new(InMemorySendTransport {
            hub: Arc::clone(&self.hub),
            queue: self.hub.queue(address),
        }))
    }

    fn create_receive_endpoint(&self, address: &EndpointAddress) -> BusResult<Arc<dyn ReceiveTransport>> {
        Self::check(address)?;
        Ok(Arc::new(InMemoryReceiveTransport {
            hub: Arc::clone(&self.hub),
            queue: self.hub.queue(address),
            open: AtomicBool::new(false),
        }))
    }
}

// ---------------------------------------------------------------------------
// Send / receive
// ---------------------------------------------------------------------------

struct InMemorySendTransport {
    hub: Arc<Hub>,
    queue: Arc<Queue>,
}

#[async_trait]
impl SendTransport for InMemorySendTransport {
    fn address(&self) -> &EndpointAddress {
        &self.queue.address
    }

    async fn send(&self, envelope: MessageEnvelope) -> BusResult<()> {
        self.hub.ensure_running()?;
        self.queue.push(envelope, false)
    }
}

struct InMemoryReceiveTransport {
    hub: Arc<Hub>,
    queue: Arc<Queue>,
    open: AtomicBool,
}

#[async_trait]
impl ReceiveTransport for InMemoryReceiveTransport {
    fn address(&self) -> &EndpointAddress {
        &self.queue.address
    }

    async fn open(&self, prefetch: u32) -> BusResult<()> {
        self.open.store(true, Ordering::Release);
        tracing::debug!(queue = %self.queue.address, prefetch, "in-memory subscription opened");
        Ok(())
    }

    async fn receive(&self, cancel: &CancellationToken) -> Option<InboundDelivery> {
        if !self.open.load(Ordering::Acquire) {
            return None;
        }
        let mut rx = tokio::select! {
            guard = self.queue.rx.lock() => guard,
            () = cancel.cancelled() => return None,
        };
        let delivery = tokio::select! {
            delivery = rx.recv() => delivery,
            () = cancel.cancelled() => None,
        };
        if delivery.is_some() {
            self.queue.taken();
        }
        delivery
    }

    async fn settle(&self, delivery: InboundDelivery, settlement: Settlement) -> BusResult<()> {
        match settlement {
            Settlement::Ack => Ok(()),
            Settlement::Requeue => self.queue.push(delivery.envelope, true),
            Settlement::DeadLetter { headers } => {
                let error_queue = self.hub.queue(&self.queue.address.error_queue());
                error_queue.push(delivery.envelope.with_headers(headers), false)
            }
            Settlement::Skip { reason } => {
                let skipped_queue = self.hub.queue(&self.queue.address.skipped_queue());
                let envelope = delivery.envelope.with_headers([
                    (headers::REASON.to_string(), reason),
                    (headers::FAULT_TIMESTAMP.to_string(), Utc::now().to_rfc3339()),
                ]);
                skipped_queue.push(envelope, false)
            }
        }
    }

    async fn close(&self) -> BusResult<()> {
        self.open.store(false, Ordering::Release);
        tracing::debug!(queue = %self.queue.address, "in-memory subscription closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
