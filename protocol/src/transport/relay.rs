//! # Relay Links
//!
//! One [`RelayLink`] per configured bus endpoint. The trait is the seam
//! between the endpoint-agnostic [`Transport`](crate::transport::Transport)
//! and whatever actually moves bytes — a websocket client in production, the
//! in-process loopback relay in tests. Links push everything they receive
//! into a single inbound channel; the transport owns dispatch, bookkeeping,
//! and reconnection policy.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::{BusEvent, Filter};

/// Errors raised at the transport boundary.
///
/// Per the taxonomy: these are the *recoverable* failures — the caller
/// decides whether to retry. The one hard failure in here is
/// [`UnsignedEvent`](TransportError::UnsignedEvent), which indicates a
/// programming error, not a runtime condition.
#[derive(Debug, Error)]
pub enum TransportError {
    /// `connect()` reached none of the configured endpoints. Partial
    /// failure is a normal reported outcome; total failure is this.
    #[error("unable to reach any of {total} endpoints")]
    AllEndpointsFailed { total: usize },

    /// The transport was built with an empty endpoint list.
    #[error("no endpoints configured")]
    NoEndpoints,

    /// `publish()` was handed an event without a signature. Precondition
    /// violation: sign before publishing, always.
    #[error("refusing to publish an unsigned event")]
    UnsignedEvent,

    /// Every endpoint rejected or failed the publish.
    #[error("no endpoint accepted the event")]
    PublishFailed,

    /// A single endpoint operation failed (connection refused, protocol
    /// error, deliberate test injection, ...).
    #[error("endpoint {endpoint}: {detail}")]
    Endpoint { endpoint: String, detail: String },
}

// ---------------------------------------------------------------------------
// Inbound stream
// ---------------------------------------------------------------------------

/// Everything a link can push up to the transport.
#[derive(Debug, Clone)]
pub enum RelayInbound {
    /// An event matching one of our subscriptions arrived.
    Event {
        endpoint: String,
        subscription: String,
        event: BusEvent,
    },
    /// The endpoint finished replaying stored history for a subscription;
    /// everything after this is live.
    EndOfBacklog {
        endpoint: String,
        subscription: String,
    },
    /// The link dropped. The transport's supervisor decides whether and
    /// when to reopen it.
    Closed { endpoint: String },
}

/// Sender half handed to each link on `open`.
pub type InboundSender = mpsc::UnboundedSender<RelayInbound>;

// ---------------------------------------------------------------------------
// RelayLink
// ---------------------------------------------------------------------------

/// A connection to one bus endpoint.
///
/// Implementations own their socket and their read loop. Contract:
///
/// - `open` establishes the connection and starts forwarding into the
///   inbound channel. Reopening after a drop is legal and must restore a
///   clean slate (active subscriptions are re-issued by the transport).
/// - `publish` resolves when this endpoint acknowledges the event.
/// - `fetch` is a one-shot stored-history query; it must not disturb
///   standing subscriptions.
/// - On connection loss, send [`RelayInbound::Closed`] exactly once.
#[async_trait]
pub trait RelayLink: Send + Sync {
    /// Stable endpoint address, used as the bookkeeping key.
    fn url(&self) -> &str;

    /// Establish the connection and start the read loop.
    async fn open(&self, inbound: InboundSender) -> Result<(), TransportError>;

    /// Send a signed event and wait for this endpoint's acknowledgement.
    async fn publish(&self, event: &BusEvent) -> Result<(), TransportError>;

    /// Open a standing subscription under `sub_id`.
    async fn subscribe(&self, sub_id: &str, filter: &Filter) -> Result<(), TransportError>;

    /// Tear down the standing subscription `sub_id`. Unknown ids are a no-op.
    async fn unsubscribe(&self, sub_id: &str) -> Result<(), TransportError>;

    /// One-shot query of the endpoint's stored events.
    async fn fetch(&self, filter: &Filter) -> Result<Vec<BusEvent>, TransportError>;
}

// ---------------------------------------------------------------------------
// Endpoint status
// ---------------------------------------------------------------------------

/// Connection state of one endpoint. States are independent across
/// endpoints; one endpoint failing never blocks the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointStatus {
    /// Initial state, and the state after an orderly close.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Open and forwarding events.
    Connected,
    /// The last connection attempt failed.
    Error,
}

/// Per-endpoint bookkeeping, mutated only by the transport.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub url: String,
    pub status: EndpointStatus,
    /// Unix seconds of the most recent successful connect.
    pub last_connected_at: Option<u64>,
    /// Total connection/publish failures observed on this endpoint.
    pub error_count: u64,
    /// Human-readable description of the most recent failure.
    pub last_error: Option<String>,
}

impl EndpointInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: EndpointStatus::Disconnected,
            last_connected_at: None,
            error_count: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_endpoint_starts_disconnected() {
        let info = EndpointInfo::new("mem://a");
        assert_eq!(info.status, EndpointStatus::Disconnected);
        assert_eq!(info.error_count, 0);
        assert!(info.last_connected_at.is_none());
    }
}
