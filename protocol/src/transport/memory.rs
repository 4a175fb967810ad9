//! # Loopback Relay
//!
//! An in-process relay for tests and local development. A [`MemoryBus`]
//! plays the part of the relay server — it stores published events and
//! broadcasts them to every connected link — and each [`MemoryRelay`] is
//! one client connection implementing [`RelayLink`].
//!
//! The bus honors the same contract a network relay would: stored history
//! is replayed on subscribe followed by an end-of-backlog marker, live
//! events are forwarded as they arrive, and closing a link emits a single
//! `Closed` notice. Failure-injection toggles let transport tests exercise
//! the partial-failure and reconnect paths without a flaky network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::event::{BusEvent, Filter};
use crate::transport::relay::{InboundSender, RelayInbound, RelayLink, TransportError};

/// The shared "server" side: stored events plus a live broadcast channel.
#[derive(Debug)]
pub struct MemoryBus {
    stored: RwLock<Vec<BusEvent>>,
    live: broadcast::Sender<BusEvent>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        let (live, _) = broadcast::channel(1024);
        Arc::new(Self {
            stored: RwLock::new(Vec::new()),
            live,
        })
    }

    /// Pre-seed stored history, as if other participants had published
    /// before we connected.
    pub fn seed(&self, event: BusEvent) {
        self.stored.write().push(event);
    }

    /// Accept a publish: store it and fan it out to live subscribers.
    fn ingest(&self, event: BusEvent) {
        self.stored.write().push(event.clone());
        // No live subscribers is fine; stored delivery still works.
        let _ = self.live.send(event);
    }

    /// Inspect stored history, the same way `fetch` sees it. Integration
    /// tests use this to assert on what actually hit the bus.
    pub fn stored_matching(&self, filter: &Filter) -> Vec<BusEvent> {
        let stored = self.stored.read();
        let mut hits: Vec<BusEvent> = stored.iter().filter(|e| filter.matches(e)).cloned().collect();
        if let Some(limit) = filter.limit {
            hits.truncate(limit);
        }
        hits
    }
}

/// One client connection to a [`MemoryBus`].
pub struct MemoryRelay {
    url: String,
    bus: Arc<MemoryBus>,
    subs: Arc<DashMap<String, Filter>>,
    inbound: Arc<RwLock<Option<InboundSender>>>,
    /// Test toggle: make `open` fail.
    pub fail_open: AtomicBool,
    /// Test toggle: make `publish` fail.
    pub fail_publish: AtomicBool,
}

impl MemoryRelay {
    pub fn new(url: impl Into<String>, bus: Arc<MemoryBus>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            bus,
            subs: Arc::new(DashMap::new()),
            inbound: Arc::new(RwLock::new(None)),
            fail_open: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
        })
    }

    /// Simulate a connection drop: stop forwarding and notify the transport.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.inbound.write().take() {
            let _ = tx.send(RelayInbound::Closed {
                endpoint: self.url.clone(),
            });
        }
    }
}

#[async_trait]
impl RelayLink for MemoryRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn open(&self, inbound: InboundSender) -> Result<(), TransportError> {
        if self.fail_open.load(Ordering::Relaxed) {
            return Err(TransportError::Endpoint {
                endpoint: self.url.clone(),
                detail: "connection refused (injected)".into(),
            });
        }

        *self.inbound.write() = Some(inbound.clone());

        // Live forwarding loop. Exits when the connection is dropped
        // (inbound sender replaced/taken) or the bus goes away.
        let mut rx = self.bus.live.subscribe();
        let subs = Arc::clone(&self.subs);
        let inbound_slot = Arc::clone(&self.inbound);
        let url = self.url.clone();
        let my_sender = inbound;
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let tx = {
                    let guard = inbound_slot.read();
                    match guard.as_ref() {
                        // A reopen swapped in a new sender; this loop is stale.
                        Some(tx) if tx.same_channel(&my_sender) => tx.clone(),
                        _ => break,
                    }
                };
                for entry in subs.iter() {
                    if entry.value().matches(&event) {
                        let sent = tx.send(RelayInbound::Event {
                            endpoint: url.clone(),
                            subscription: entry.key().clone(),
                            event: event.clone(),
                        });
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            debug!(endpoint = %url, "loopback forwarding loop ended");
        });

        Ok(())
    }

    async fn publish(&self, event: &BusEvent) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::Relaxed) {
            return Err(TransportError::Endpoint {
                endpoint: self.url.clone(),
                detail: "publish rejected (injected)".into(),
            });
        }
        self.bus.ingest(event.clone());
        Ok(())
    }

    async fn subscribe(&self, sub_id: &str, filter: &Filter) -> Result<(), TransportError> {
        self.subs.insert(sub_id.to_string(), filter.clone());

        // Replay stored history, then mark the backlog boundary.
        let tx = self
            .inbound
            .read()
            .clone()
            .ok_or_else(|| TransportError::Endpoint {
                endpoint: self.url.clone(),
                detail: "not connected".into(),
            })?;
        for event in self.bus.stored_matching(filter) {
            let _ = tx.send(RelayInbound::Event {
                endpoint: self.url.clone(),
                subscription: sub_id.to_string(),
                event,
            });
        }
        let _ = tx.send(RelayInbound::EndOfBacklog {
            endpoint: self.url.clone(),
            subscription: sub_id.to_string(),
        });
        Ok(())
    }

    async fn unsubscribe(&self, sub_id: &str) -> Result<(), TransportError> {
        self.subs.remove(sub_id);
        Ok(())
    }

    async fn fetch(&self, filter: &Filter) -> Result<Vec<BusEvent>, TransportError> {
        Ok(self.bus.stored_matching(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::TradeKeypair;
    use crate::event::EventTemplate;
    use tokio::sync::mpsc;

    fn event(content: &str) -> BusEvent {
        EventTemplate::new(1, content).sign(&TradeKeypair::generate())
    }

    #[tokio::test]
    async fn subscribe_replays_backlog_then_eose() {
        let bus = MemoryBus::new();
        bus.seed(event("old"));
        let relay = MemoryRelay::new("mem://a", bus);

        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.open(tx).await.unwrap();
        relay.subscribe("s1", &Filter::new().kind(1)).await.unwrap();

        match rx.recv().await.unwrap() {
            RelayInbound::Event { event, .. } => assert_eq!(event.content, "old"),
            other => panic!("expected backlog event, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            RelayInbound::EndOfBacklog { .. }
        ));
    }

    #[tokio::test]
    async fn live_events_are_forwarded_to_matching_subs() {
        let bus = MemoryBus::new();
        let relay = MemoryRelay::new("mem://a", Arc::clone(&bus));

        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.open(tx).await.unwrap();
        relay.subscribe("s1", &Filter::new().kind(1)).await.unwrap();
        // Drain the EOSE for the empty backlog.
        assert!(matches!(
            rx.recv().await.unwrap(),
            RelayInbound::EndOfBacklog { .. }
        ));

        relay.publish(&event("live")).await.unwrap();
        match rx.recv().await.unwrap() {
            RelayInbound::Event { event, .. } => assert_eq!(event.content, "live"),
            other => panic!("expected live event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_connection_emits_closed() {
        let bus = MemoryBus::new();
        let relay = MemoryRelay::new("mem://a", bus);
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.open(tx).await.unwrap();

        relay.drop_connection();
        assert!(matches!(
            rx.recv().await.unwrap(),
            RelayInbound::Closed { .. }
        ));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_endpoint_errors() {
        let bus = MemoryBus::new();
        let relay = MemoryRelay::new("mem://a", bus);
        relay.fail_publish.store(true, Ordering::Relaxed);
        assert!(relay.publish(&event("x")).await.is_err());
    }
}
