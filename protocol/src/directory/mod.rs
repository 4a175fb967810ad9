//! # Order Directory
//!
//! The deduplicated, capacity-bounded view of every trade listing on the
//! marketplace, grouped by publishing counterparty.
//!
//! ## Consistency model
//!
//! Listings are replaceable entities: versions of the same listing id are
//! reconciled by their embedded `created_at` — last writer wins — never by
//! arrival order. Two clients that see the same set of events in any order
//! converge on the same directory. A stale version is a silent no-op, not
//! an error.
//!
//! The directory is single-writer: exactly one owner calls the `&mut self`
//! mutation methods, everyone else reads through queries. That ownership
//! discipline is the whole locking story.

pub mod order;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config;
use crate::event::{unix_now, BusEvent, ValidationError};
use crate::store::KeyValueStore;

pub use order::{FiatValue, ListingStatus, Order, OrderKind};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Directory tunables.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Hard cap on held listings. Exceeding it triggers an eviction sweep.
    pub max_size: usize,
    /// Listings older than this are dropped by sweeps even without an
    /// explicit expiry.
    pub max_age: std::time::Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_size: config::MAX_DIRECTORY_SIZE,
            max_age: config::MAX_LISTING_AGE,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregates & bookkeeping
// ---------------------------------------------------------------------------

/// Derived per-counterparty statistics, recomputed on every mutation of
/// that counterparty's listing set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterpartyStats {
    pub counterparty: String,
    pub buy: usize,
    pub sell: usize,
    pub active: usize,
    pub total: usize,
}

/// Queryable acceptance counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryStats {
    /// Listings accepted (inserted or replaced).
    pub valid: u64,
    /// Events or listings dropped by validation.
    pub invalid: u64,
    /// Older-version arrivals ignored by last-writer-wins.
    pub stale: u64,
    /// Listings removed by eviction sweeps.
    pub evicted: u64,
}

/// What `add_or_update` did with a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First sighting of this listing id.
    Inserted,
    /// Newer version replaced the held one.
    Replaced,
    /// Held version is at least as new; nothing changed.
    Stale,
    /// Validation failed (counterparty mismatch); dropped.
    Rejected,
}

// ---------------------------------------------------------------------------
// OrderDirectory
// ---------------------------------------------------------------------------

/// The marketplace listing directory.
pub struct OrderDirectory {
    cfg: DirectoryConfig,
    orders: HashMap<String, Order>,
    aggregates: HashMap<String, CounterpartyStats>,
    stats: DirectoryStats,
    /// False during backfill, true after end-of-backlog.
    live: bool,
}

impl OrderDirectory {
    pub fn new(cfg: DirectoryConfig) -> Self {
        Self {
            cfg,
            orders: HashMap::new(),
            aggregates: HashMap::new(),
            stats: DirectoryStats::default(),
            live: false,
        }
    }

    /// Full ingest path for a raw bus event: verify the signature, parse
    /// the listing, merge it. All failures are counted and dropped.
    pub fn apply_event(&mut self, event: &BusEvent) -> UpsertOutcome {
        if let Err(e) = event.verify() {
            warn!(id = %event.id, error = %e, "dropping listing event");
            self.stats.invalid += 1;
            return UpsertOutcome::Rejected;
        }
        match Order::from_event(event) {
            Ok(order) => self.add_or_update(order),
            Err(e) => {
                warn!(id = %event.id, error = %e, "dropping malformed listing");
                self.stats.invalid += 1;
                UpsertOutcome::Rejected
            }
        }
    }

    /// Merge one parsed listing under the replaceable-entity rules.
    pub fn add_or_update(&mut self, order: Order) -> UpsertOutcome {
        let outcome = match self.orders.get(&order.id) {
            Some(existing) if existing.counterparty != order.counterparty => {
                // A different key claiming an existing listing id is either
                // a broken counterparty or an impersonation attempt.
                warn!(
                    error = %ValidationError::CounterpartyMismatch {
                        id: order.id.clone(),
                        pinned: existing.counterparty.clone(),
                        got: order.counterparty.clone(),
                    },
                    "dropping listing"
                );
                self.stats.invalid += 1;
                return UpsertOutcome::Rejected;
            }
            Some(existing) if existing.created_at >= order.created_at => {
                self.stats.stale += 1;
                return UpsertOutcome::Stale;
            }
            Some(_) => UpsertOutcome::Replaced,
            None => UpsertOutcome::Inserted,
        };

        let counterparty = order.counterparty.clone();
        debug!(id = %order.id, %counterparty, ?outcome, "listing merged");
        self.orders.insert(order.id.clone(), order);
        self.stats.valid += 1;
        self.recompute_aggregate(&counterparty);

        if self.orders.len() > self.cfg.max_size {
            self.eviction_sweep(self.cfg.max_age);
        }
        outcome
    }

    /// Drop expired and over-age listings; under capacity pressure, also
    /// the oldest survivors until the cap holds. Returns how many went.
    pub fn eviction_sweep(&mut self, max_age: std::time::Duration) -> usize {
        let now = unix_now();
        let cutoff = now.saturating_sub(max_age.as_secs());

        let mut doomed: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.is_expired(now) || o.created_at < cutoff)
            .map(|o| o.id.clone())
            .collect();

        // Still over cap? Shed oldest-first until it holds.
        let remaining = self.orders.len() - doomed.len();
        if remaining > self.cfg.max_size {
            let mut survivors: Vec<(&String, u64)> = self
                .orders
                .values()
                .filter(|o| !doomed.contains(&o.id))
                .map(|o| (&o.id, o.created_at))
                .collect();
            survivors.sort_by_key(|(_, created_at)| *created_at);
            doomed.extend(
                survivors
                    .into_iter()
                    .take(remaining - self.cfg.max_size)
                    .map(|(id, _)| id.clone()),
            );
        }

        let mut touched: Vec<String> = Vec::new();
        for id in &doomed {
            if let Some(order) = self.orders.remove(id) {
                touched.push(order.counterparty);
            }
        }
        for counterparty in touched {
            self.recompute_aggregate(&counterparty);
        }

        let removed = doomed.len();
        if removed > 0 {
            info!(removed, held = self.orders.len(), "eviction sweep");
            self.stats.evicted += removed as u64;
        }
        removed
    }

    fn recompute_aggregate(&mut self, counterparty: &str) {
        let now = unix_now();
        let mut stats = CounterpartyStats {
            counterparty: counterparty.to_string(),
            buy: 0,
            sell: 0,
            active: 0,
            total: 0,
        };
        for order in self.orders.values().filter(|o| o.counterparty == counterparty) {
            stats.total += 1;
            match order.kind {
                Some(OrderKind::Buy) => stats.buy += 1,
                Some(OrderKind::Sell) => stats.sell += 1,
                None => {}
            }
            if order.is_active(now) {
                stats.active += 1;
            }
        }
        if stats.total == 0 {
            // A counterparty with no listings has no aggregate.
            self.aggregates.remove(counterparty);
        } else {
            self.aggregates.insert(counterparty.to_string(), stats);
        }
    }

    // -- read side ----------------------------------------------------------

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn counterparty_stats(&self, counterparty: &str) -> Option<&CounterpartyStats> {
        self.aggregates.get(counterparty)
    }

    pub fn counterparties(&self) -> Vec<&CounterpartyStats> {
        self.aggregates.values().collect()
    }

    pub fn stats(&self) -> DirectoryStats {
        self.stats
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Filtered listing query, newest first.
    pub fn query(&self, q: &OrderQuery) -> Vec<&Order> {
        let now = unix_now();
        let mut hits: Vec<&Order> = self
            .orders
            .values()
            .filter(|o| q.matches(o, now))
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        hits
    }

    // -- lifecycle ----------------------------------------------------------

    /// Backfill is done: switch to live mode and snapshot what we have.
    pub fn end_of_backlog(&mut self, store: &dyn KeyValueStore) {
        self.live = true;
        info!(held = self.orders.len(), "directory live after backfill");
        self.snapshot(store);
    }

    /// Serialize current contents to the key-value store.
    pub fn snapshot(&self, store: &dyn KeyValueStore) -> bool {
        let orders: Vec<&Order> = self.orders.values().collect();
        match serde_json::to_string(&orders) {
            Ok(json) => store.set(config::DIRECTORY_SNAPSHOT_KEY, &json),
            Err(e) => {
                warn!(error = %e, "directory snapshot failed to serialize");
                false
            }
        }
    }

    /// Load a previous snapshot. Entries that no longer validate — already
    /// expired, typically — are silently dropped. Returns how many loaded.
    pub fn restore(&mut self, store: &dyn KeyValueStore) -> usize {
        let Some(json) = store.get(config::DIRECTORY_SNAPSHOT_KEY) else {
            return 0;
        };
        let Ok(orders) = serde_json::from_str::<Vec<Order>>(&json) else {
            warn!("directory snapshot unreadable, starting empty");
            return 0;
        };

        let now = unix_now();
        let mut loaded = 0;
        for order in orders {
            if order.is_expired(now) {
                continue;
            }
            if self.add_or_update(order) != UpsertOutcome::Rejected {
                loaded += 1;
            }
        }
        info!(loaded, "directory restored from snapshot");
        loaded
    }
}

impl Default for OrderDirectory {
    fn default() -> Self {
        Self::new(DirectoryConfig::default())
    }
}

// ---------------------------------------------------------------------------
// OrderQuery
// ---------------------------------------------------------------------------

/// Listing query criteria. All populated fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderQuery {
    pub kind: Option<OrderKind>,
    pub fiat_code: Option<String>,
    /// Case-insensitive substring match on the payment method.
    pub payment_method: Option<String>,
    pub counterparty: Option<String>,
    pub status: Option<ListingStatus>,
    pub exclude_expired: bool,
    /// Only listings with kind + fiat code + payment method present.
    pub only_complete: bool,
}

impl OrderQuery {
    fn matches(&self, order: &Order, now: u64) -> bool {
        if let Some(kind) = self.kind {
            if order.kind != Some(kind) {
                return false;
            }
        }
        if let Some(code) = &self.fiat_code {
            if order.fiat_code.as_deref() != Some(code.to_ascii_uppercase().as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.payment_method {
            let Some(pm) = &order.payment_method else {
                return false;
            };
            if !pm.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(counterparty) = &self.counterparty {
            if order.counterparty != *counterparty {
                return false;
            }
        }
        if let Some(status) = self.status {
            if order.status != Some(status) {
                return false;
            }
        }
        if self.exclude_expired && order.is_expired(now) {
            return false;
        }
        if self.only_complete && !order.is_complete() {
            return false;
        }
        true
    }
}
