//! # Outbox
//!
//! The request side of the protocol: build a typed message, seal it for the
//! coordinator, and publish the wrap over the transport. Every send returns
//! a [`Dispatch`] so callers can correlate the coordinator's response
//! (responses echo the `request_id`).

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::crypto::keys::{IdentityProvider, PublicKey};
use crate::directory::{Order, OrderKind};
use crate::messenger::envelope::{EnvelopeCodec, EnvelopeError};
use crate::messenger::message::{Action, Payload, ProtocolMessage};
use crate::transport::{Transport, TransportError};

/// Receipt for one sent request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Correlation id embedded in the message; the response carries it back.
    pub request_id: u64,
    /// Id of the published wrap event.
    pub event_id: String,
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("rating {0} is out of range, expected 1-5")]
    RatingOutOfRange(u8),

    #[error("listing has no buy/sell direction")]
    MissingDirection,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Sends sealed requests to one coordinator over the shared transport.
pub struct Outbox {
    transport: Arc<Transport>,
    codec: EnvelopeCodec,
    coordinator: PublicKey,
    identity: Arc<dyn IdentityProvider>,
}

impl Outbox {
    pub fn new(
        transport: Arc<Transport>,
        coordinator: PublicKey,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            transport,
            codec: EnvelopeCodec::new(),
            coordinator,
            identity,
        }
    }

    /// Ask the coordinator to create and publish a new listing.
    pub async fn submit_listing(
        &self,
        draft: Order,
        trade_index: u32,
    ) -> Result<Dispatch, OutboxError> {
        let message = ProtocolMessage::new(Action::NewOrder)
            .with_trade_index(trade_index)
            .with_payload(Payload::Order(draft));
        self.send(message).await
    }

    /// Take an existing listing. The action depends on the listing's
    /// direction; `amount` pins a value for range-priced listings.
    pub async fn take_listing(
        &self,
        listing: &Order,
        trade_index: u32,
        amount: Option<i64>,
    ) -> Result<Dispatch, OutboxError> {
        let action = match listing.kind {
            Some(OrderKind::Sell) => Action::TakeSell,
            Some(OrderKind::Buy) => Action::TakeBuy,
            None => return Err(OutboxError::MissingDirection),
        };
        let mut message = ProtocolMessage::new(action)
            .with_order_id(&listing.id)
            .with_trade_index(trade_index);
        if let Some(amount) = amount {
            message = message.with_payload(Payload::Amount(amount));
        }
        self.send(message).await
    }

    pub async fn cancel(&self, order_id: &str) -> Result<Dispatch, OutboxError> {
        self.send(ProtocolMessage::new(Action::Cancel).with_order_id(order_id))
            .await
    }

    /// Attach a settlement invoice to a trade.
    pub async fn add_invoice(
        &self,
        order_id: &str,
        invoice: impl Into<String>,
    ) -> Result<Dispatch, OutboxError> {
        self.send(
            ProtocolMessage::new(Action::AddInvoice)
                .with_order_id(order_id)
                .with_payload(Payload::Invoice(invoice.into())),
        )
        .await
    }

    /// Declare the fiat side of the trade paid.
    pub async fn fiat_sent(&self, order_id: &str) -> Result<Dispatch, OutboxError> {
        self.send(ProtocolMessage::new(Action::FiatSent).with_order_id(order_id))
            .await
    }

    /// Release the escrowed sats to the buyer.
    pub async fn release(&self, order_id: &str) -> Result<Dispatch, OutboxError> {
        self.send(ProtocolMessage::new(Action::Release).with_order_id(order_id))
            .await
    }

    pub async fn open_dispute(&self, order_id: &str) -> Result<Dispatch, OutboxError> {
        self.send(ProtocolMessage::new(Action::Dispute).with_order_id(order_id))
            .await
    }

    /// Rate the counterparty after settlement. Ratings are 1-5; anything
    /// else is refused locally rather than bounced by the coordinator.
    pub async fn rate_counterparty(
        &self,
        order_id: &str,
        rating: u8,
    ) -> Result<Dispatch, OutboxError> {
        if !(1..=5).contains(&rating) {
            return Err(OutboxError::RatingOutOfRange(rating));
        }
        self.send(
            ProtocolMessage::new(Action::RateUser)
                .with_order_id(order_id)
                .with_payload(Payload::RatingUser(rating)),
        )
        .await
    }

    async fn send(&self, message: ProtocolMessage) -> Result<Dispatch, OutboxError> {
        let request_id: u64 = OsRng.gen();
        let message = message.with_request_id(request_id);
        let wrap = self
            .codec
            .seal(&message, self.identity.as_ref(), &self.coordinator)?;
        let event_id = wrap.id.clone();
        self.transport.publish(&wrap).await?;
        debug!(
            action = %message.body.action,
            request_id,
            event_id = %event_id,
            "request dispatched"
        );
        Ok(Dispatch {
            request_id,
            event_id,
        })
    }
}
