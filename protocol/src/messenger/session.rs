//! # Trade Sessions
//!
//! One [`TradeSession`] per order id: the locally tracked lifecycle of a
//! trade's negotiation and settlement, driven by incoming protocol actions.
//!
//! Updates are *merge patches*, never full replacement — each action
//! touches only the fields it knows about, so information accumulated by
//! earlier actions (the invoice, the released flag) survives later ones.
//!
//! ## Known limitation
//!
//! Patches are applied strictly in arrival order, with no timestamp
//! reconciliation. Unlike the order directory, two actions for the same
//! trade delivered out of order can leave the session behind true protocol
//! progress until the next action arrives. The counterparty's message
//! sequencing makes this rare in practice, but it is a real gap.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::unix_now;
use crate::messenger::cantdo::CantDoReason;

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Local lifecycle state of one trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    /// We have seen the trade referenced but no transition yet.
    Seen,
    /// Waiting for the seller to fund the escrow hold invoice.
    WaitingEscrowFunding,
    /// Escrow funded; the trade is live.
    Active,
    /// The buyer declared fiat as sent.
    FiatNotified,
    /// A dispute is open.
    Disputed,
    /// Settled. Terminal.
    Completed,
    /// Canceled by someone. Terminal.
    Canceled,
}

impl SessionStatus {
    /// Terminal sessions never transition again and are eligible for the
    /// retention sweep.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Seen => "seen",
            Self::WaitingEscrowFunding => "waiting-escrow-funding",
            Self::Active => "active",
            Self::FiatNotified => "fiat-notified",
            Self::Disputed => "disputed",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// TradeSession
// ---------------------------------------------------------------------------

/// Accumulated local state for one trade.
///
/// Invariant: exactly one session per order id, created on the first action
/// that references it, deleted only by the explicit retention sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSession {
    pub order_id: String,
    pub status: SessionStatus,
    /// Settlement invoice, once one has been exchanged.
    pub invoice: Option<String>,
    /// Seller released the escrowed sats.
    pub released: bool,
    /// Most recent structured rejection for this trade, if any.
    pub failure: Option<CantDoReason>,
    /// Unix seconds of the last applied patch.
    pub updated_at: u64,
}

impl TradeSession {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: SessionStatus::Seen,
            invoice: None,
            released: false,
            failure: None,
            updated_at: unix_now(),
        }
    }

    /// Apply a merge patch. Returns whether anything observable changed —
    /// replays of an already-applied action patch to identical values and
    /// report `false`.
    pub fn apply(&mut self, patch: SessionPatch) -> bool {
        let mut changed = false;

        if let Some(status) = patch.status {
            if self.status != status {
                self.status = status;
                changed = true;
            }
        }
        if let Some(invoice) = patch.invoice {
            if self.invoice.as_deref() != Some(invoice.as_str()) {
                self.invoice = Some(invoice);
                changed = true;
            }
        }
        if patch.released && !self.released {
            self.released = true;
            changed = true;
        }
        if let Some(failure) = patch.failure {
            if self.failure != Some(failure) {
                self.failure = Some(failure);
                changed = true;
            }
        }

        if changed {
            self.updated_at = unix_now();
        }
        changed
    }
}

/// A partial update: only populated fields are written.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub invoice: Option<String>,
    pub released: bool,
    pub failure: Option<CantDoReason>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_merges_without_clobbering() {
        let mut session = TradeSession::new("ord-1");
        session.apply(SessionPatch {
            invoice: Some("lnbc1...".into()),
            ..SessionPatch::default()
        });
        session.apply(SessionPatch::status(SessionStatus::Active));

        // The status patch did not erase the invoice.
        assert_eq!(session.invoice.as_deref(), Some("lnbc1..."));
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn replayed_patch_reports_no_change() {
        let mut session = TradeSession::new("ord-1");
        assert!(session.apply(SessionPatch::status(SessionStatus::Completed)));
        assert!(!session.apply(SessionPatch::status(SessionStatus::Completed)));
    }

    #[test]
    fn released_flag_is_monotonic() {
        let mut session = TradeSession::new("ord-1");
        assert!(session.apply(SessionPatch {
            released: true,
            ..SessionPatch::default()
        }));
        assert!(!session.apply(SessionPatch {
            released: true,
            ..SessionPatch::default()
        }));
        assert!(session.released);
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Canceled.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Seen.is_terminal());
    }
}
