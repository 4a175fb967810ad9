//! # Messenger
//!
//! The secure-messaging half of the engine: the typed protocol vocabulary
//! ([`message`]), the triple-layer envelope codec ([`envelope`]), the trade
//! session state machine ([`session`]), the structured rejection catalogue
//! ([`cantdo`]), and the outbound request builder ([`outgoing`]).
//!
//! At the center sits [`MessageRouter`]: every inbound wrap is unsealed,
//! dispatched against an exhaustive [`Action`] match, folded into the
//! per-order [`TradeSession`], and surfaced to the application through a
//! [`NotificationSink`]. A message that fails any stage is logged and
//! dropped; no partial state is ever written.

pub mod cantdo;
pub mod envelope;
pub mod message;
pub mod outgoing;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::crypto::keys::{IdentityProvider, PublicKey};
use crate::event::{unix_now, BusEvent};
use crate::notify::{Notice, NotificationSink, NullSink};

pub use cantdo::CantDoReason;
pub use envelope::{EnvelopeCodec, EnvelopeError};
pub use message::{Action, MessageBody, Payload, ProtocolMessage};
pub use outgoing::{Dispatch, Outbox, OutboxError};
pub use session::{SessionPatch, SessionStatus, TradeSession};

// ---------------------------------------------------------------------------
// RouterStats
// ---------------------------------------------------------------------------

/// Counters the router keeps as messages flow through it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Wraps successfully unsealed and dispatched.
    pub messages_received: u64,
    /// Wraps that failed to unseal (wrong recipient, malformed, strict
    /// signature rejection).
    pub envelopes_rejected: u64,
    /// Messages carrying a request-direction action, which only the
    /// counterparty coordinator handles.
    pub unhandled: u64,
    /// Sessions that transitioned into [`SessionStatus::Completed`].
    pub trades_completed: u64,
    /// Structured rejections received.
    pub cantdo_received: u64,
}

/// What one dispatched message did.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    /// The action advanced a trade (or was benign information).
    pub success: bool,
    /// Order the message concerned, when it named one.
    pub order_id: Option<String>,
    /// Session status after the dispatch, when a session exists.
    pub status: Option<SessionStatus>,
    /// Structured rejection carried by a `cant-do`.
    pub reason: Option<CantDoReason>,
    /// Display-ready failure text, when the action reported one.
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// MessageRouter
// ---------------------------------------------------------------------------

/// Unseals inbound wraps and drives trade sessions.
///
/// One router per local identity. Not internally synchronized: the owner
/// decides the locking discipline, same as [`OrderDirectory`].
///
/// [`OrderDirectory`]: crate::directory::OrderDirectory
pub struct MessageRouter {
    codec: EnvelopeCodec,
    sessions: HashMap<String, TradeSession>,
    sink: Arc<dyn NotificationSink>,
    stats: RouterStats,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::with_sink(Arc::new(NullSink))
    }

    pub fn with_sink(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            codec: EnvelopeCodec::new(),
            sessions: HashMap::new(),
            sink,
            stats: RouterStats::default(),
        }
    }

    /// Swap in a strict codec: wraps whose protocol signature fails are
    /// rejected instead of warned about.
    pub fn strict(mut self) -> Self {
        self.codec = EnvelopeCodec::strict();
        self
    }

    /// Unseal one inbound wrap and dispatch it.
    ///
    /// Returns `None` when the envelope could not be opened; nothing is
    /// mutated in that case beyond the rejection counter.
    pub fn handle_incoming(
        &mut self,
        wrap: &BusEvent,
        identity: &dyn IdentityProvider,
    ) -> Option<HandlerOutcome> {
        let (message, sender) = match self.codec.unseal(wrap, identity) {
            Ok(opened) => opened,
            Err(e) => {
                self.stats.envelopes_rejected += 1;
                debug!(wrap_id = %wrap.id, error = %e, "dropping envelope");
                return None;
            }
        };
        self.stats.messages_received += 1;
        Some(self.dispatch(&message, Some(&sender)))
    }

    /// Fold one already-opened message into local state.
    ///
    /// Exhaustive over [`Action`]: adding a variant without deciding its
    /// session effect is a compile error.
    pub fn dispatch(
        &mut self,
        message: &ProtocolMessage,
        sender: Option<&PublicKey>,
    ) -> HandlerOutcome {
        let body = &message.body;
        debug!(
            action = %body.action,
            order_id = body.id.as_deref().unwrap_or("-"),
            sender = %sender.map(|p| p.to_string()).unwrap_or_default(),
            "dispatching message"
        );

        match body.action {
            // Request-direction actions arrive here only if a peer
            // misdirects them; we are not the coordinator.
            Action::NewOrder
            | Action::TakeSell
            | Action::TakeBuy
            | Action::Cancel
            | Action::AddInvoice
            | Action::FiatSent
            | Action::Release
            | Action::Dispute
            | Action::RateUser
            | Action::AdminCancel
            | Action::AdminSettle
            | Action::AdminTakeDispute => {
                self.stats.unhandled += 1;
                warn!(action = %body.action, "ignoring request-direction action");
                self.sink.on_info(self.notice_for(
                    body,
                    "unhandled",
                    "received a request-direction action this client does not serve",
                ));
                self.outcome(body.id.clone(), true, None)
            }

            Action::OrderCreated => self.note(
                body,
                None,
                "order-created",
                "listing accepted and published",
            ),
            Action::BuyerTookOrder => self.note(
                body,
                Some(SessionPatch::status(SessionStatus::WaitingEscrowFunding)),
                "buyer-took-order",
                "a buyer took the listing",
            ),
            Action::WaitingSellerToPay => self.note(
                body,
                Some(SessionPatch::status(SessionStatus::WaitingEscrowFunding)),
                "waiting-seller-to-pay",
                "waiting for the seller to fund escrow",
            ),
            Action::WaitingBuyerInvoice => self.note(
                body,
                Some(SessionPatch::status(SessionStatus::WaitingEscrowFunding)),
                "waiting-buyer-invoice",
                "waiting for the buyer's invoice",
            ),
            Action::BuyerInvoiceAccepted => self.note(
                body,
                Some(SessionPatch::status(SessionStatus::WaitingEscrowFunding)),
                "buyer-invoice-accepted",
                "the buyer's invoice was accepted",
            ),
            Action::PayInvoice => {
                let patch = SessionPatch {
                    status: Some(SessionStatus::WaitingEscrowFunding),
                    invoice: invoice_in(body),
                    ..SessionPatch::default()
                };
                self.note(body, Some(patch), "pay-invoice", "escrow invoice to pay")
            }
            Action::HoldInvoicePaymentAccepted => {
                let outcome = self.advance(body, SessionPatch::status(SessionStatus::Active));
                self.sink.on_success(self.notice_for(body, "escrow-funded", "escrow is funded, trade is active"));
                outcome
            }
            Action::HoldInvoicePaymentSettled => self.note(
                body,
                Some(SessionPatch {
                    released: true,
                    ..SessionPatch::default()
                }),
                "escrow-settled",
                "escrow was settled to the buyer",
            ),
            Action::HoldInvoicePaymentCanceled => self.note(
                body,
                Some(SessionPatch::status(SessionStatus::Canceled)),
                "escrow-canceled",
                "the escrow hold was canceled",
            ),
            Action::FiatSentOk => self.note(
                body,
                Some(SessionPatch::status(SessionStatus::FiatNotified)),
                "fiat-sent",
                "the buyer declared fiat as sent",
            ),
            Action::Released => {
                let outcome = self.advance(
                    body,
                    SessionPatch {
                        released: true,
                        ..SessionPatch::default()
                    },
                );
                self.sink
                    .on_success(self.notice_for(body, "sats-released", "the seller released the sats"));
                outcome
            }
            Action::PurchaseCompleted => {
                let outcome = self.advance(body, SessionPatch::status(SessionStatus::Completed));
                self.sink
                    .on_success(self.notice_for(body, "trade-completed", "trade settled end to end"));
                outcome
            }
            Action::Canceled | Action::CooperativeCancelAccepted => self.note(
                body,
                Some(SessionPatch::status(SessionStatus::Canceled)),
                "trade-canceled",
                "the trade was canceled",
            ),
            Action::CooperativeCancelInitiatedByPeer => self.note(
                body,
                None,
                "cancel-proposed",
                "the peer proposes a cooperative cancel",
            ),
            Action::CooperativeCancelInitiatedByYou => self.note(
                body,
                None,
                "cancel-registered",
                "our cooperative cancel proposal was registered",
            ),
            Action::DisputeInitiatedByPeer
            | Action::DisputeInitiatedByYou
            | Action::AdminTookDispute => self.note(
                body,
                Some(SessionPatch::status(SessionStatus::Disputed)),
                "dispute",
                "the trade is in dispute",
            ),
            Action::AdminCanceled => self.note(
                body,
                Some(SessionPatch::status(SessionStatus::Canceled)),
                "admin-canceled",
                "an admin canceled the trade",
            ),
            Action::AdminSettled => {
                let outcome = self.advance(body, SessionPatch::status(SessionStatus::Completed));
                self.sink
                    .on_success(self.notice_for(body, "admin-settled", "an admin settled the trade"));
                outcome
            }
            Action::PaymentFailed => {
                // The coordinator retries on its own; the session stays put.
                self.sink.on_error(self.notice_for(
                    body,
                    "payment-failed",
                    "a settlement payment attempt failed and will be retried",
                ));
                self.outcome(body.id.clone(), false, None)
            }
            Action::InvoiceUpdated => {
                let patch = SessionPatch {
                    invoice: invoice_in(body),
                    ..SessionPatch::default()
                };
                self.note(body, Some(patch), "invoice-updated", "the stored invoice was replaced")
            }
            Action::RateReceived => {
                self.note(body, None, "rate-received", "our rating was recorded")
            }
            Action::CantDo => self.reject(body),
        }
    }

    // -- session plumbing ----------------------------------------------------

    /// Apply `patch` (if any) and emit an informational notice.
    fn note(
        &mut self,
        body: &MessageBody,
        patch: Option<SessionPatch>,
        code: &str,
        text: &str,
    ) -> HandlerOutcome {
        let outcome = match patch {
            Some(patch) => self.advance(body, patch),
            None => self.outcome(body.id.clone(), true, None),
        };
        self.sink.on_info(self.notice_for(body, code, text));
        outcome
    }

    /// Apply a session patch for the order `body` names. Messages without
    /// an order id cannot advance a session; they are reported as-is.
    fn advance(&mut self, body: &MessageBody, patch: SessionPatch) -> HandlerOutcome {
        let Some(order_id) = body.id.clone() else {
            debug!(action = %body.action, "action without order id, no session to advance");
            return self.outcome(None, true, None);
        };

        let session = self
            .sessions
            .entry(order_id.clone())
            .or_insert_with(|| TradeSession::new(order_id.clone()));
        let was_completed = session.status == SessionStatus::Completed;
        let changed = session.apply(patch);
        let status = session.status;

        if changed && status == SessionStatus::Completed && !was_completed {
            self.stats.trades_completed += 1;
            info!(order_id = %order_id, "trade completed");
        } else if changed {
            debug!(order_id = %order_id, status = %status, "session advanced");
        }

        HandlerOutcome {
            success: true,
            order_id: Some(order_id),
            status: Some(status),
            reason: None,
            error_message: None,
        }
    }

    /// Handle a structured rejection: record it on the session if the
    /// rejection names an order, and surface it either way.
    fn reject(&mut self, body: &MessageBody) -> HandlerOutcome {
        self.stats.cantdo_received += 1;
        let reason = match &body.payload {
            Some(Payload::CantDo { reason }) => Some(*reason),
            _ => None,
        };

        let status = body.id.as_ref().map(|order_id| {
            let session = self
                .sessions
                .entry(order_id.clone())
                .or_insert_with(|| TradeSession::new(order_id.clone()));
            session.apply(SessionPatch {
                failure: reason,
                ..SessionPatch::default()
            });
            session.status
        });

        let text = reason
            .map(|r| r.explanation().to_string())
            .unwrap_or_else(|| "the request was rejected".to_string());
        warn!(
            order_id = body.id.as_deref().unwrap_or("-"),
            reason = %reason.map(|r| r.to_string()).unwrap_or_else(|| "unspecified".into()),
            "request rejected"
        );
        self.sink.on_error(
            Notice::new("cant-do", text.clone()).with_detail(serde_json::json!({
                "order_id": body.id,
                "reason": reason,
                "request_id": body.request_id,
            })),
        );

        HandlerOutcome {
            success: false,
            order_id: body.id.clone(),
            status,
            reason,
            error_message: Some(text),
        }
    }

    fn outcome(
        &self,
        order_id: Option<String>,
        success: bool,
        reason: Option<CantDoReason>,
    ) -> HandlerOutcome {
        let status = order_id
            .as_ref()
            .and_then(|id| self.sessions.get(id))
            .map(|s| s.status);
        HandlerOutcome {
            success,
            order_id,
            status,
            reason,
            error_message: None,
        }
    }

    fn notice_for(&self, body: &MessageBody, code: &str, text: &str) -> Notice {
        Notice::new(code, text).with_detail(serde_json::json!({
            "order_id": body.id,
            "action": body.action,
            "request_id": body.request_id,
        }))
    }

    // -- accessors -----------------------------------------------------------

    pub fn session(&self, order_id: &str) -> Option<&TradeSession> {
        self.sessions.get(order_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &TradeSession> {
        self.sessions.values()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Drop terminal sessions untouched for longer than `retention`.
    /// Returns how many were removed. Live sessions are never swept.
    pub fn sweep_terminal(&mut self, retention: Duration) -> usize {
        let cutoff = unix_now().saturating_sub(retention.as_secs());
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| !(s.status.is_terminal() && s.updated_at < cutoff));
        let removed = before - self.sessions.len();
        if removed > 0 {
            info!(removed, "swept terminal sessions");
        }
        removed
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull an invoice string out of the payload, if one is there.
fn invoice_in(body: &MessageBody) -> Option<String> {
    match &body.payload {
        Some(Payload::Invoice(inv)) => Some(inv.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::TradeKeypair;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        notices: Mutex<Vec<(&'static str, Notice)>>,
    }

    impl NotificationSink for RecordingSink {
        fn on_success(&self, notice: Notice) {
            self.notices.lock().push(("success", notice));
        }
        fn on_error(&self, notice: Notice) {
            self.notices.lock().push(("error", notice));
        }
        fn on_info(&self, notice: Notice) {
            self.notices.lock().push(("info", notice));
        }
    }

    fn msg(action: Action, order: &str) -> ProtocolMessage {
        ProtocolMessage::new(action).with_order_id(order)
    }

    #[test]
    fn escrow_funding_then_completion() {
        let mut router = MessageRouter::new();

        router.dispatch(&msg(Action::WaitingSellerToPay, "ord-1"), None);
        assert_eq!(
            router.session("ord-1").unwrap().status,
            SessionStatus::WaitingEscrowFunding
        );

        router.dispatch(&msg(Action::HoldInvoicePaymentAccepted, "ord-1"), None);
        assert_eq!(router.session("ord-1").unwrap().status, SessionStatus::Active);

        router.dispatch(&msg(Action::FiatSentOk, "ord-1"), None);
        router.dispatch(&msg(Action::Released, "ord-1"), None);
        let outcome = router.dispatch(&msg(Action::PurchaseCompleted, "ord-1"), None);

        let session = router.session("ord-1").unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.released);
        assert_eq!(outcome.status, Some(SessionStatus::Completed));
        assert_eq!(router.stats().trades_completed, 1);
    }

    #[test]
    fn every_pre_escrow_action_waits_on_funding() {
        // All four notifications that precede escrow funding park the
        // session in the same state.
        let cases = [
            Action::BuyerTookOrder,
            Action::WaitingSellerToPay,
            Action::WaitingBuyerInvoice,
            Action::BuyerInvoiceAccepted,
        ];
        for (i, action) in cases.into_iter().enumerate() {
            let mut router = MessageRouter::new();
            let order_id = format!("ord-{i}");
            let outcome = router.dispatch(&msg(action, &order_id), None);
            assert_eq!(
                router.session(&order_id).unwrap().status,
                SessionStatus::WaitingEscrowFunding,
                "{action} should leave the session waiting on escrow funding"
            );
            assert_eq!(outcome.status, Some(SessionStatus::WaitingEscrowFunding));
        }
    }

    #[test]
    fn completion_is_counted_once() {
        let mut router = MessageRouter::new();
        router.dispatch(&msg(Action::PurchaseCompleted, "ord-1"), None);
        router.dispatch(&msg(Action::PurchaseCompleted, "ord-1"), None);
        assert_eq!(router.stats().trades_completed, 1);
    }

    #[test]
    fn unrelated_sessions_stay_untouched() {
        let mut router = MessageRouter::new();
        router.dispatch(&msg(Action::HoldInvoicePaymentAccepted, "ord-a"), None);
        router.dispatch(&msg(Action::HoldInvoicePaymentAccepted, "ord-b"), None);
        router.dispatch(&msg(Action::PurchaseCompleted, "ord-a"), None);

        assert_eq!(router.session("ord-a").unwrap().status, SessionStatus::Completed);
        assert_eq!(router.session("ord-b").unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn pay_invoice_stores_the_payment_request() {
        let mut router = MessageRouter::new();
        router.dispatch(
            &msg(Action::PayInvoice, "ord-1")
                .with_payload(Payload::Invoice("lnbc500n1...".into())),
            None,
        );
        let session = router.session("ord-1").unwrap();
        assert_eq!(session.invoice.as_deref(), Some("lnbc500n1..."));
        assert_eq!(session.status, SessionStatus::WaitingEscrowFunding);
    }

    #[test]
    fn cantdo_records_the_failure_and_notifies() {
        let sink = Arc::new(RecordingSink::default());
        let mut router = MessageRouter::with_sink(sink.clone());

        let outcome = router.dispatch(
            &msg(Action::CantDo, "ord-1").with_payload(Payload::CantDo {
                reason: CantDoReason::OutOfRangeFiatAmount,
            }),
            None,
        );

        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(CantDoReason::OutOfRangeFiatAmount));
        assert_eq!(
            router.session("ord-1").unwrap().failure,
            Some(CantDoReason::OutOfRangeFiatAmount)
        );
        assert_eq!(router.stats().cantdo_received, 1);

        let notices = sink.notices.lock();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, "error");
        assert_eq!(notices[0].1.code, "cant-do");
    }

    #[test]
    fn cantdo_without_order_id_still_notifies() {
        let sink = Arc::new(RecordingSink::default());
        let mut router = MessageRouter::with_sink(sink.clone());

        let outcome = router.dispatch(
            &ProtocolMessage::new(Action::CantDo).with_payload(Payload::CantDo {
                reason: CantDoReason::InvalidTradeIndex,
            }),
            None,
        );

        assert!(!outcome.success);
        assert_eq!(router.session_count(), 0);
        assert_eq!(sink.notices.lock().len(), 1);
    }

    #[test]
    fn request_direction_actions_are_ignored_but_surfaced() {
        let sink = Arc::new(RecordingSink::default());
        let mut router = MessageRouter::with_sink(sink.clone());

        let outcome = router.dispatch(&msg(Action::NewOrder, "ord-1"), None);
        assert!(outcome.success);
        assert_eq!(router.session_count(), 0);
        assert_eq!(router.stats().unhandled, 1);

        let notices = sink.notices.lock();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, "info");
        assert_eq!(notices[0].1.code, "unhandled");
    }

    #[test]
    fn late_status_does_not_erase_accumulated_fields() {
        let mut router = MessageRouter::new();
        router.dispatch(
            &msg(Action::InvoiceUpdated, "ord-1")
                .with_payload(Payload::Invoice("lnbc1...".into())),
            None,
        );
        router.dispatch(&msg(Action::HoldInvoicePaymentAccepted, "ord-1"), None);

        let session = router.session("ord-1").unwrap();
        assert_eq!(session.invoice.as_deref(), Some("lnbc1..."));
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn handle_incoming_unseals_and_dispatches() {
        let counterparty = TradeKeypair::generate();
        let us = TradeKeypair::generate();
        let mut router = MessageRouter::new();

        let wrap = EnvelopeCodec::new()
            .seal(
                &msg(Action::HoldInvoicePaymentAccepted, "ord-1"),
                &counterparty,
                &us.public_key(),
            )
            .unwrap();

        let outcome = router.handle_incoming(&wrap, &us).unwrap();
        assert_eq!(outcome.status, Some(SessionStatus::Active));
        assert_eq!(router.stats().messages_received, 1);
    }

    #[test]
    fn misdirected_wrap_is_rejected_without_state_change() {
        let counterparty = TradeKeypair::generate();
        let someone_else = TradeKeypair::generate();
        let us = TradeKeypair::generate();
        let mut router = MessageRouter::new();

        let wrap = EnvelopeCodec::new()
            .seal(
                &msg(Action::PurchaseCompleted, "ord-1"),
                &counterparty,
                &someone_else.public_key(),
            )
            .unwrap();

        assert!(router.handle_incoming(&wrap, &us).is_none());
        assert_eq!(router.stats().envelopes_rejected, 1);
        assert_eq!(router.session_count(), 0);
    }

    #[test]
    fn sweep_removes_only_stale_terminal_sessions() {
        let mut router = MessageRouter::new();
        router.dispatch(&msg(Action::Canceled, "ord-done"), None);
        router.dispatch(&msg(Action::HoldInvoicePaymentAccepted, "ord-live"), None);

        // Zero retention makes every terminal session stale... except ones
        // updated this very second, so backdate it by hand.
        router.sessions.get_mut("ord-done").unwrap().updated_at -= 10;
        let removed = router.sweep_terminal(Duration::from_secs(5));

        assert_eq!(removed, 1);
        assert!(router.session("ord-done").is_none());
        assert!(router.session("ord-live").is_some());
    }
}
