//! # Multi-Endpoint Transport
//!
//! Fan-out across N bus endpoints with per-endpoint status tracking.
//!
//! The transport never interprets events — it moves them. Publishing races
//! every endpoint and resolves on the first acknowledgement; subscribing
//! opens the same filter everywhere and funnels deliveries through one
//! dispatcher task; point-queries return best-effort results under a
//! bounded wait. One endpoint's failure never blocks the others, and a
//! dropped link is reopened by a supervisor with exponential backoff.
//!
//! ## Delivery guarantees (and non-guarantees)
//!
//! - Duplicate suppression: the same event arriving from several endpoints
//!   is delivered to a subscription once. The seen-cache is bounded, so a
//!   sufficiently delayed duplicate can slip through — consumers already
//!   deduplicate semantically (the order directory by listing id, the
//!   router by idempotent handlers).
//! - Ordering: none, across endpoints or within them. Consumers that need
//!   ordering reconstruct it from embedded timestamps.
//! - Callback containment: an error returned by a subscription callback is
//!   logged and counted, never propagated. A misbehaving consumer cannot
//!   take down delivery for everyone else.

pub mod memory;
pub mod relay;

use std::collections::HashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config;
use crate::event::{unix_now, BusEvent, Filter};

pub use relay::{EndpointInfo, EndpointStatus, RelayInbound, RelayLink, TransportError};

/// Subscription event callback. Returning `Err` is contained: logged,
/// counted, and delivery continues.
pub type EventCallback = Arc<dyn Fn(BusEvent) -> anyhow::Result<()> + Send + Sync>;

/// Optional end-of-backlog callback, invoked once per subscription when the
/// first endpoint reports that stored history is exhausted.
pub type CompleteCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Reconnect backoff policy: exponential with a ceiling, plus jitter so a
/// fleet of clients does not stampede a recovering relay.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempt cap; `0` retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: config::RECONNECT_BASE_DELAY,
            max_delay: config::RECONNECT_MAX_DELAY,
            max_attempts: config::RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given (1-based) attempt: `base * 2^(n-1)` capped at
    /// `max_delay`, then uniformly jittered down to half.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exp = attempt.saturating_sub(1).min(16);
        let full = base_ms.saturating_mul(1u64 << exp).min(max_ms).max(1);
        let jittered = rand::thread_rng().gen_range(full / 2..=full);
        Duration::from_millis(jittered)
    }
}

/// Transport tunables.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Bound on the duplicate-suppression cache, in (subscription, event)
    /// pairs.
    pub seen_cache_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: config::CONNECT_TIMEOUT,
            query_timeout: config::DEFAULT_QUERY_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            seen_cache_size: 16_384,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Queryable counters. Observability without log spelunking.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub events_received: AtomicU64,
    pub events_published: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub subscriptions_created: AtomicU64,
    pub connect_attempts: AtomicU64,
    pub callback_errors: AtomicU64,
    pub publish_failures: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub events_received: u64,
    pub events_published: u64,
    pub duplicates_dropped: u64,
    pub subscriptions_created: u64,
    pub connect_attempts: u64,
    pub callback_errors: u64,
    pub publish_failures: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            subscriptions_created: self.subscriptions_created.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of `connect()`. Partial success is a normal, reported outcome —
/// only zero successes is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectSummary {
    pub connected: usize,
    pub failed: usize,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Internal plumbing
// ---------------------------------------------------------------------------

struct SubscriptionEntry {
    filter: Filter,
    on_event: EventCallback,
    on_complete: Option<CompleteCallback>,
    complete_fired: AtomicBool,
}

/// Bounded (subscription, event-id) dedup cache. FIFO eviction; precision
/// is best-effort by design.
struct SeenCache {
    seen: HashSet<(String, String)>,
    order: VecDeque<(String, String)>,
    cap: usize,
}

impl SeenCache {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Returns `true` the first time a pair is inserted.
    fn insert(&mut self, sub: &str, event_id: &str) -> bool {
        let key = (sub.to_string(), event_id.to_string());
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Everything the dispatcher and reconnect tasks need, cheaply cloneable.
#[derive(Clone)]
struct Shared {
    links: Arc<HashMap<String, Arc<dyn RelayLink>>>,
    endpoints: Arc<DashMap<String, EndpointInfo>>,
    subs: Arc<DashMap<String, Arc<SubscriptionEntry>>>,
    stats: Arc<TransportStats>,
    seen: Arc<Mutex<SeenCache>>,
    reconnecting: Arc<DashMap<String, ()>>,
    inbound_tx: mpsc::UnboundedSender<RelayInbound>,
    reconnect: ReconnectPolicy,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The multi-endpoint transport. Owns endpoint bookkeeping, subscription
/// dispatch, and reconnection; everything above it sees one logical bus.
pub struct Transport {
    shared: Shared,
    link_order: Vec<Arc<dyn RelayLink>>,
    config: TransportConfig,
    dispatcher_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayInbound>>>,
}

impl Transport {
    /// Record the endpoint list; every endpoint starts `Disconnected`.
    /// A URL listed twice is one endpoint: the first link wins, the rest
    /// are dropped so publish and subscribe never hit it twice.
    pub fn new(links: Vec<Arc<dyn RelayLink>>, config: TransportConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let endpoints = Arc::new(DashMap::new());
        let mut by_url = HashMap::new();
        let mut link_order = Vec::with_capacity(links.len());
        for link in links {
            let url = link.url().to_string();
            if by_url.contains_key(&url) {
                warn!(endpoint = %url, "duplicate endpoint url ignored");
                continue;
            }
            endpoints.insert(url.clone(), EndpointInfo::new(&url));
            by_url.insert(url, Arc::clone(&link));
            link_order.push(link);
        }

        let shared = Shared {
            links: Arc::new(by_url),
            endpoints,
            subs: Arc::new(DashMap::new()),
            stats: Arc::new(TransportStats::default()),
            seen: Arc::new(Mutex::new(SeenCache::new(config.seen_cache_size))),
            reconnecting: Arc::new(DashMap::new()),
            inbound_tx,
            reconnect: config.reconnect.clone(),
        };

        Self {
            shared,
            link_order,
            config,
            dispatcher_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Counters.
    pub fn stats(&self) -> TransportStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Current per-endpoint bookkeeping.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.shared
            .endpoints
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// Attempt to reach every endpoint in parallel.
    ///
    /// Fails hard only when *zero* endpoints succeed; partial failure is
    /// reported in the summary and logged per endpoint.
    pub async fn connect(&self) -> Result<ConnectSummary, TransportError> {
        if self.link_order.is_empty() {
            return Err(TransportError::NoEndpoints);
        }

        // The dispatcher starts on first connect and runs for the life of
        // the transport.
        if let Some(rx) = self.dispatcher_rx.lock().take() {
            tokio::spawn(run_dispatcher(rx, self.shared.clone()));
        }

        let attempts = self.link_order.iter().map(|link| {
            let shared = self.shared.clone();
            let timeout = self.config.connect_timeout;
            async move {
                shared.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
                set_status(&shared, link.url(), EndpointStatus::Connecting);
                let opened =
                    tokio::time::timeout(timeout, link.open(shared.inbound_tx.clone())).await;
                match opened {
                    Ok(Ok(())) => {
                        mark_connected(&shared, link.url());
                        true
                    }
                    Ok(Err(e)) => {
                        mark_error(&shared, link.url(), &e.to_string());
                        false
                    }
                    Err(_) => {
                        mark_error(&shared, link.url(), "connect timed out");
                        false
                    }
                }
            }
        });

        let results = join_all(attempts).await;
        let connected = results.iter().filter(|ok| **ok).count();
        let summary = ConnectSummary {
            connected,
            failed: results.len() - connected,
            total: results.len(),
        };
        info!(
            connected = summary.connected,
            failed = summary.failed,
            total = summary.total,
            "endpoint connection sweep finished"
        );

        if connected == 0 {
            return Err(TransportError::AllEndpointsFailed {
                total: summary.total,
            });
        }
        Ok(summary)
    }

    /// Open one subscription against every configured endpoint.
    ///
    /// Endpoints that reject the subscription are logged and skipped; they
    /// pick the subscription up again after their next (re)connect.
    pub async fn subscribe(
        &self,
        filter: Filter,
        on_event: EventCallback,
        on_complete: Option<CompleteCallback>,
    ) -> SubscriptionHandle {
        let id = Uuid::new_v4().simple().to_string();
        let entry = Arc::new(SubscriptionEntry {
            filter: filter.clone(),
            on_event,
            on_complete,
            complete_fired: AtomicBool::new(false),
        });
        self.shared.subs.insert(id.clone(), entry);
        self.shared
            .stats
            .subscriptions_created
            .fetch_add(1, Ordering::Relaxed);

        for link in &self.link_order {
            if let Err(e) = link.subscribe(&id, &filter).await {
                warn!(endpoint = link.url(), error = %e, "subscribe failed on endpoint");
            }
        }

        SubscriptionHandle {
            id,
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Publish a signed event to every endpoint, resolving on the first
    /// acknowledgement. The remaining sends continue in the background.
    pub async fn publish(&self, event: &BusEvent) -> Result<(), TransportError> {
        if !event.is_signed() {
            return Err(TransportError::UnsignedEvent);
        }

        let total = self.link_order.len();
        if total == 0 {
            return Err(TransportError::NoEndpoints);
        }

        let (tx, mut rx) = mpsc::channel::<(String, Result<(), TransportError>)>(total);
        for link in &self.link_order {
            let link = Arc::clone(link);
            let event = event.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = link.publish(&event).await;
                let _ = tx.send((link.url().to_string(), result)).await;
            });
        }
        drop(tx);

        let mut failures = 0;
        while let Some((url, result)) = rx.recv().await {
            match result {
                Ok(()) => {
                    self.shared
                        .stats
                        .events_published
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(endpoint = %url, id = %event.id, "event acknowledged");
                    return Ok(());
                }
                Err(e) => {
                    warn!(endpoint = %url, error = %e, "publish failed on endpoint");
                    mark_error(&self.shared, &url, &e.to_string());
                    failures += 1;
                }
            }
        }

        debug_assert_eq!(failures, total);
        self.shared
            .stats
            .publish_failures
            .fetch_add(1, Ordering::Relaxed);
        Err(TransportError::PublishFailed)
    }

    /// Single-shot lookup of one event by id.
    ///
    /// Best effort under a bounded wait: the first endpoint that returns a
    /// hit wins; a miss everywhere, or the timeout elapsing, yields `None`.
    /// Never an error — "not found" is an answer, not a failure.
    pub async fn get_event(&self, id: &str, timeout: Option<Duration>) -> Option<BusEvent> {
        let filter = Filter::new().id(id).limit(1);
        let total = self.link_order.len();
        if total == 0 {
            return None;
        }

        let (tx, mut rx) = mpsc::channel::<Vec<BusEvent>>(total);
        for link in &self.link_order {
            let link = Arc::clone(link);
            let filter = filter.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let hits = link.fetch(&filter).await.unwrap_or_default();
                let _ = tx.send(hits).await;
            });
        }
        drop(tx);

        let wait = timeout.unwrap_or(self.config.query_timeout);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(hits)) => {
                    if let Some(event) = hits.into_iter().next() {
                        return Some(event);
                    }
                }
                // All endpoints answered empty, or the clock ran out.
                Ok(None) | Err(_) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription handle
// ---------------------------------------------------------------------------

/// Owner's handle to an open subscription.
///
/// `close()` is idempotent and takes effect immediately: the entry is
/// removed before endpoints are told, so no further callbacks fire even if
/// an endpoint keeps sending for a while. Callbacks already in flight may
/// still complete.
pub struct SubscriptionHandle {
    id: String,
    shared: Shared,
    closed: AtomicBool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.subs.remove(&self.id);
        for link in self.shared.links.values() {
            if let Err(e) = link.unsubscribe(&self.id).await {
                debug!(endpoint = link.url(), error = %e, "unsubscribe failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<RelayInbound>, shared: Shared) {
    while let Some(inbound) = rx.recv().await {
        match inbound {
            RelayInbound::Event {
                endpoint,
                subscription,
                event,
            } => {
                shared.stats.events_received.fetch_add(1, Ordering::Relaxed);

                let Some(entry) = shared.subs.get(&subscription).map(|e| Arc::clone(&e)) else {
                    // Late delivery for a closed subscription. Normal.
                    continue;
                };
                // Client-side re-check: endpoints are not trusted to filter
                // correctly.
                if !entry.filter.matches(&event) {
                    debug!(%endpoint, %subscription, "endpoint sent non-matching event");
                    continue;
                }
                if !shared.seen.lock().insert(&subscription, &event.id) {
                    shared
                        .stats
                        .duplicates_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if let Err(e) = (entry.on_event)(event) {
                    shared.stats.callback_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(%subscription, error = %e, "subscription callback failed");
                }
            }
            RelayInbound::EndOfBacklog {
                endpoint,
                subscription,
            } => {
                let Some(entry) = shared.subs.get(&subscription).map(|e| Arc::clone(&e)) else {
                    continue;
                };
                if entry.complete_fired.swap(true, Ordering::SeqCst) {
                    continue;
                }
                debug!(%endpoint, %subscription, "backlog complete, going live");
                if let Some(on_complete) = &entry.on_complete {
                    if let Err(e) = on_complete() {
                        shared.stats.callback_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(%subscription, error = %e, "completion callback failed");
                    }
                }
            }
            RelayInbound::Closed { endpoint } => {
                warn!(%endpoint, "endpoint connection lost");
                set_status(&shared, &endpoint, EndpointStatus::Disconnected);
                spawn_reconnect(shared.clone(), endpoint);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reconnect supervisor
// ---------------------------------------------------------------------------

fn spawn_reconnect(shared: Shared, endpoint: String) {
    // One supervisor per endpoint at a time.
    if shared.reconnecting.insert(endpoint.clone(), ()).is_some() {
        return;
    }
    let Some(link) = shared.links.get(&endpoint).cloned() else {
        shared.reconnecting.remove(&endpoint);
        return;
    };

    tokio::spawn(async move {
        let policy = shared.reconnect.clone();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if policy.max_attempts != 0 && attempt > policy.max_attempts {
                warn!(%endpoint, attempts = attempt - 1, "giving up on endpoint");
                set_status(&shared, &endpoint, EndpointStatus::Error);
                break;
            }

            let delay = policy.delay_for(attempt);
            debug!(%endpoint, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            tokio::time::sleep(delay).await;

            shared.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
            set_status(&shared, &endpoint, EndpointStatus::Connecting);
            match link.open(shared.inbound_tx.clone()).await {
                Ok(()) => {
                    mark_connected(&shared, &endpoint);
                    info!(%endpoint, attempt, "endpoint reconnected");
                    // Restore standing subscriptions on the fresh connection.
                    for entry in shared.subs.iter() {
                        if let Err(e) = link.subscribe(entry.key(), &entry.value().filter).await {
                            warn!(%endpoint, subscription = %entry.key(), error = %e,
                                "failed to restore subscription");
                        }
                    }
                    break;
                }
                Err(e) => {
                    mark_error(&shared, &endpoint, &e.to_string());
                }
            }
        }
        shared.reconnecting.remove(&endpoint);
    });
}

// ---------------------------------------------------------------------------
// Endpoint bookkeeping helpers
// ---------------------------------------------------------------------------

fn set_status(shared: &Shared, url: &str, status: EndpointStatus) {
    if let Some(mut info) = shared.endpoints.get_mut(url) {
        info.status = status;
    }
}

fn mark_connected(shared: &Shared, url: &str) {
    if let Some(mut info) = shared.endpoints.get_mut(url) {
        info.status = EndpointStatus::Connected;
        info.last_connected_at = Some(unix_now());
    }
}

fn mark_error(shared: &Shared, url: &str, detail: &str) {
    if let Some(mut info) = shared.endpoints.get_mut(url) {
        info.status = EndpointStatus::Error;
        info.error_count += 1;
        info.last_error = Some(detail.to_string());
    }
}
