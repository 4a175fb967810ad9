//! # Protocol Messages
//!
//! The typed vocabulary of the trading protocol: every message exchanged
//! with a counterparty is an [`Action`] plus an optional action-specific
//! [`Payload`], wrapped in the fixed JSON envelope
//! `{"order": {version, id, request_id, trade_index, action, payload}}`.
//!
//! `Action` is a closed sum type with exhaustive matching in the router —
//! adding a variant without a handler fails to build instead of silently
//! falling into a generic path at runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PROTOCOL_VERSION;
use crate::directory::Order;
use crate::messenger::cantdo::CantDoReason;

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// Every protocol action, requests and notifications both.
///
/// Wire names are kebab-case (`"new-order"`, `"cant-do"`, ...). Roughly the
/// first third are requests a participant sends; the rest are counterparty
/// notifications driving the local trade session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    // -- requests we originate ---------------------------------------------
    /// Publish a new listing through the counterparty.
    NewOrder,
    /// Take someone's sell listing.
    TakeSell,
    /// Take someone's buy listing.
    TakeBuy,
    /// Cancel an order we are party to.
    Cancel,
    /// Attach a settlement invoice to a trade.
    AddInvoice,
    /// Declare the fiat side paid.
    FiatSent,
    /// Release the escrowed sats.
    Release,
    /// Open a dispute on a trade.
    Dispute,
    /// Rate the peer after settlement.
    RateUser,
    // -- admin requests -----------------------------------------------------
    AdminCancel,
    AdminSettle,
    AdminTakeDispute,
    // -- counterparty notifications ----------------------------------------
    /// Listing accepted and published.
    OrderCreated,
    /// A buyer took our sell listing.
    BuyerTookOrder,
    /// Waiting for the seller to fund escrow.
    WaitingSellerToPay,
    /// Waiting for the buyer to provide an invoice.
    WaitingBuyerInvoice,
    /// The buyer's invoice was accepted.
    BuyerInvoiceAccepted,
    /// Escrow hold invoice to pay (payload carries the payment request).
    PayInvoice,
    /// Escrow is funded; the trade is active.
    HoldInvoicePaymentAccepted,
    /// Escrow was settled to the buyer.
    HoldInvoicePaymentSettled,
    /// Escrow hold was canceled.
    HoldInvoicePaymentCanceled,
    /// Peer confirmed fiat as sent.
    FiatSentOk,
    /// Sats released by the seller.
    Released,
    /// Trade settled end to end.
    PurchaseCompleted,
    /// Order canceled.
    Canceled,
    /// Peer proposes a cooperative cancel.
    CooperativeCancelInitiatedByPeer,
    /// Our cooperative cancel proposal was registered.
    CooperativeCancelInitiatedByYou,
    /// Both sides agreed to cancel.
    CooperativeCancelAccepted,
    /// A dispute was opened by the peer.
    DisputeInitiatedByPeer,
    /// Our dispute was registered.
    DisputeInitiatedByYou,
    /// An admin took our dispute.
    AdminTookDispute,
    /// Admin canceled the trade.
    AdminCanceled,
    /// Admin settled the trade.
    AdminSettled,
    /// A settlement payment attempt failed and will be retried.
    PaymentFailed,
    /// The stored invoice was replaced.
    InvoiceUpdated,
    /// Our rating was recorded.
    RateReceived,
    /// Structured rejection; payload carries the reason.
    CantDo,
}

impl Action {
    /// Wire name, i.e. the serde kebab-case form.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::NewOrder => "new-order",
            Self::TakeSell => "take-sell",
            Self::TakeBuy => "take-buy",
            Self::Cancel => "cancel",
            Self::AddInvoice => "add-invoice",
            Self::FiatSent => "fiat-sent",
            Self::Release => "release",
            Self::Dispute => "dispute",
            Self::RateUser => "rate-user",
            Self::AdminCancel => "admin-cancel",
            Self::AdminSettle => "admin-settle",
            Self::AdminTakeDispute => "admin-take-dispute",
            Self::OrderCreated => "order-created",
            Self::BuyerTookOrder => "buyer-took-order",
            Self::WaitingSellerToPay => "waiting-seller-to-pay",
            Self::WaitingBuyerInvoice => "waiting-buyer-invoice",
            Self::BuyerInvoiceAccepted => "buyer-invoice-accepted",
            Self::PayInvoice => "pay-invoice",
            Self::HoldInvoicePaymentAccepted => "hold-invoice-payment-accepted",
            Self::HoldInvoicePaymentSettled => "hold-invoice-payment-settled",
            Self::HoldInvoicePaymentCanceled => "hold-invoice-payment-canceled",
            Self::FiatSentOk => "fiat-sent-ok",
            Self::Released => "released",
            Self::PurchaseCompleted => "purchase-completed",
            Self::Canceled => "canceled",
            Self::CooperativeCancelInitiatedByPeer => "cooperative-cancel-initiated-by-peer",
            Self::CooperativeCancelInitiatedByYou => "cooperative-cancel-initiated-by-you",
            Self::CooperativeCancelAccepted => "cooperative-cancel-accepted",
            Self::DisputeInitiatedByPeer => "dispute-initiated-by-peer",
            Self::DisputeInitiatedByYou => "dispute-initiated-by-you",
            Self::AdminTookDispute => "admin-took-dispute",
            Self::AdminCanceled => "admin-canceled",
            Self::AdminSettled => "admin-settled",
            Self::PaymentFailed => "payment-failed",
            Self::InvoiceUpdated => "invoice-updated",
            Self::RateReceived => "rate-received",
            Self::CantDo => "cant-do",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Action-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// A full listing (new-order, order-created, buyer-took-order, ...).
    Order(Order),
    /// A bolt11-style payment request / invoice string.
    Invoice(String),
    /// An amount in satoshis.
    Amount(i64),
    /// Free text.
    TextMessage(String),
    /// A peer reference.
    Peer { pubkey: String },
    /// Post-trade rating, 1-5.
    RatingUser(u8),
    /// Dispute reference.
    Dispute { id: String },
    /// Rejection reason for `cant-do`.
    CantDo { reason: CantDoReason },
}

// ---------------------------------------------------------------------------
// ProtocolMessage
// ---------------------------------------------------------------------------

/// The full wire message: a [`MessageBody`] under the fixed `"order"` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(rename = "order")]
    pub body: MessageBody,
}

/// The meat of a protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub version: u8,
    /// Order id this message concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    /// Caller-chosen correlation id for matching responses to requests.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<u64>,
    /// Index of this trade under the participant's key hierarchy.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trade_index: Option<u32>,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Payload>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            body: MessageBody {
                version: PROTOCOL_VERSION,
                id: None,
                request_id: None,
                trade_index: None,
                action,
                payload: None,
            },
        }
    }

    pub fn with_order_id(mut self, id: impl Into<String>) -> Self {
        self.body.id = Some(id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.body.request_id = Some(request_id);
        self
    }

    pub fn with_trade_index(mut self, trade_index: u32) -> Self {
        self.body.trade_index = Some(trade_index);
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.body.payload = Some(payload);
        self
    }

    /// Canonical serialized form — what gets signed and encrypted.
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wire_names_match_serde() {
        for action in [
            Action::NewOrder,
            Action::CantDo,
            Action::HoldInvoicePaymentAccepted,
            Action::CooperativeCancelInitiatedByPeer,
        ] {
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.wire_name()));
        }
    }

    #[test]
    fn unknown_action_fails_to_parse() {
        assert!(serde_json::from_str::<Action>("\"teleport-sats\"").is_err());
    }

    #[test]
    fn message_json_shape() {
        let msg = ProtocolMessage::new(Action::FiatSent)
            .with_order_id("ord-1")
            .with_request_id(42)
            .with_trade_index(3);
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["order"]["action"], "fiat-sent");
        assert_eq!(value["order"]["id"], "ord-1");
        assert_eq!(value["order"]["request_id"], 42);
        assert_eq!(value["order"]["trade_index"], 3);
        assert_eq!(value["order"]["version"], 1);
        assert!(value["order"].get("payload").is_none());
    }

    #[test]
    fn message_roundtrip_with_payload() {
        let msg = ProtocolMessage::new(Action::AddInvoice)
            .with_order_id("ord-2")
            .with_payload(Payload::Invoice("lnbc1...".into()));
        let back = ProtocolMessage::parse(&msg.serialize().unwrap()).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn cantdo_payload_roundtrip() {
        let msg = ProtocolMessage::new(Action::CantDo).with_payload(Payload::CantDo {
            reason: CantDoReason::InvalidAmount,
        });
        let json = msg.serialize().unwrap();
        assert!(json.contains("cant-do"));
        let back = ProtocolMessage::parse(&json).unwrap();
        assert!(matches!(
            back.body.payload,
            Some(Payload::CantDo {
                reason: CantDoReason::InvalidAmount
            })
        ));
    }
}
