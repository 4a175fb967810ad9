//! # Envelope Codec
//!
//! The triple-layer wrap that hides content, true sender, and routing
//! metadata from everyone watching the bus:
//!
//! ```text
//! rumor  — unsigned event carrying [serialized message, detached sig]
//! seal   — sender-signed event whose content is the encrypted rumor
//! wrap   — ephemeral-signed event whose content is the encrypted seal,
//!          routed to the recipient via a `p` tag
//! ```
//!
//! Only the wrap touches a relay. Its signer is a keypair used exactly
//! once, so an observer learns the recipient (routing demands it) but not
//! the sender; the recipient peels the layers with two conversation-key
//! derivations and recovers both the message and the claimed sender.
//!
//! The detached signature inside the rumor is the *protocol-level* proof of
//! authorship, separate from any event signature. By default a failed check
//! logs a warning and the message is still returned — counterparties
//! legitimately sign from rotated per-trade keys — but a codec built with
//! [`EnvelopeCodec::strict`] hard-rejects instead.

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config;
use crate::crypto::conversation::ConversationError;
use crate::crypto::keys::{IdentityProvider, PublicKey, Signature, TradeKeypair};
use crate::event::{unix_now, BusEvent, EventTemplate};
use crate::messenger::message::ProtocolMessage;

/// Envelope construction/opening failures.
///
/// All of these are non-fatal at the system level: an envelope that fails
/// to open is logged and dropped, and no state is mutated.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Crypto(#[from] ConversationError),

    #[error("inner layer has kind {got}, expected {expected}")]
    UnexpectedKind { expected: u16, got: u16 },

    #[error("envelope layer is malformed: {0}")]
    Malformed(String),

    #[error("protocol signature rejected in strict mode")]
    SignatureRejected,
}

// ---------------------------------------------------------------------------
// EnvelopeCodec
// ---------------------------------------------------------------------------

/// Builds and opens triple-layer envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    strict_verify: bool,
}

impl EnvelopeCodec {
    /// Default codec: soft signature verification on unseal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Strict codec: a failed protocol-signature check rejects the message.
    pub fn strict() -> Self {
        Self {
            strict_verify: true,
        }
    }

    /// Seal `message` from `sender` to `recipient`, returning the wrap
    /// ready for publishing.
    pub fn seal(
        &self,
        message: &ProtocolMessage,
        sender: &dyn IdentityProvider,
        recipient: &PublicKey,
    ) -> Result<BusEvent, EnvelopeError> {
        let serialized = message
            .serialize()
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        // Protocol-level detached signature over the serialized message,
        // distinct from any event signature below.
        let protocol_sig = sender.sign(serialized.as_bytes());

        // Layer 1: the rumor. Unsigned, tagged with the true sender.
        let rumor_content =
            serde_json::json!([serialized, protocol_sig.to_hex()]).to_string();
        let rumor = EventTemplate::new(config::KIND_RUMOR, rumor_content)
            .into_unsigned(&sender.public_key());
        let rumor_json = serde_json::to_vec(&rumor)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        // Layer 2: the seal. Sender-encrypted, sender-signed.
        let seal_ct = sender.encrypt(recipient, &rumor_json)?;
        let seal = sign_as(
            EventTemplate::new(config::KIND_SEAL, hex::encode(seal_ct)),
            sender,
        );
        let seal_json =
            serde_json::to_vec(&seal).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        // Layer 3: the wrap. A single-use ephemeral key encrypts and signs,
        // and the timestamp is backdated so relay logs can't be correlated
        // with send time.
        let ephemeral = TradeKeypair::generate();
        let wrap_ct = ephemeral.encrypt(recipient, &seal_json)?;
        let backdate = rand::thread_rng()
            .gen_range(0..=config::WRAP_BACKDATE_WINDOW.as_secs());
        let wrap = sign_as(
            EventTemplate::new(config::KIND_WRAP, hex::encode(wrap_ct))
                .tag(config::TAG_RECIPIENT, recipient.to_hex())
                .at(unix_now().saturating_sub(backdate)),
            &ephemeral,
        );

        debug!(wrap_id = %wrap.id, action = %message.body.action, "message sealed");
        Ok(wrap)
    }

    /// Open a wrap addressed to `recipient`, returning the message and the
    /// rumor's claimed sender.
    pub fn unseal(
        &self,
        wrap: &BusEvent,
        recipient: &dyn IdentityProvider,
    ) -> Result<(ProtocolMessage, PublicKey), EnvelopeError> {
        if wrap.kind != config::KIND_WRAP {
            return Err(EnvelopeError::UnexpectedKind {
                expected: config::KIND_WRAP,
                got: wrap.kind,
            });
        }

        // Peel the wrap with the ephemeral signer's key.
        let seal: BusEvent = decrypt_layer(recipient, wrap)?;
        if seal.kind != config::KIND_SEAL {
            return Err(EnvelopeError::UnexpectedKind {
                expected: config::KIND_SEAL,
                got: seal.kind,
            });
        }

        // Peel the seal with the true sender's key.
        let rumor: BusEvent = decrypt_layer(recipient, &seal)?;
        let sender = rumor
            .author()
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        // Rumor content is [serialized message, detached signature hex].
        let (serialized, sig_hex): (String, String) = serde_json::from_str(&rumor.content)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let message = ProtocolMessage::parse(&serialized)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        let verified = Signature::from_hex(&sig_hex)
            .map(|sig| sender.verify(serialized.as_bytes(), &sig))
            .unwrap_or(false);
        if !verified {
            if self.strict_verify {
                return Err(EnvelopeError::SignatureRejected);
            }
            // Soft mode: counterparties signing from rotated per-trade keys
            // are indistinguishable from forgeries here, so warn and let
            // the application decide what to trust.
            warn!(
                claimed_sender = %sender,
                action = %message.body.action,
                "protocol signature did not verify against the claimed sender"
            );
        }

        Ok((message, sender))
    }
}

/// Sign a template through the capability interface. `EventTemplate::sign`
/// wants a concrete keypair; identities behind `IdentityProvider` (hardware
/// signers and friends) go through here instead.
fn sign_as(template: EventTemplate, identity: &dyn IdentityProvider) -> BusEvent {
    let mut event = template.into_unsigned(&identity.public_key());
    let id_bytes = hex::decode(&event.id).unwrap_or_default();
    event.sig = identity.sign(&id_bytes).to_hex();
    event
}

/// Decrypt one layer: the conversation key between `recipient` and the
/// layer's signer recovers the nested event from `layer.content`.
fn decrypt_layer(
    recipient: &dyn IdentityProvider,
    layer: &BusEvent,
) -> Result<BusEvent, EnvelopeError> {
    let signer = layer
        .author()
        .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    let ciphertext = hex::decode(&layer.content)
        .map_err(|e| EnvelopeError::Malformed(format!("content not hex: {e}")))?;
    let plaintext = recipient.decrypt(&signer, &ciphertext)?;
    serde_json::from_slice(&plaintext).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::message::Action;

    fn message() -> ProtocolMessage {
        ProtocolMessage::new(Action::FiatSent)
            .with_order_id("ord-1")
            .with_request_id(7)
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let sender = TradeKeypair::generate();
        let recipient = TradeKeypair::generate();
        let codec = EnvelopeCodec::new();

        let wrap = codec
            .seal(&message(), &sender, &recipient.public_key())
            .unwrap();
        let (opened, claimed) = codec.unseal(&wrap, &recipient).unwrap();

        assert_eq!(opened, message());
        assert_eq!(claimed, sender.public_key());
    }

    #[test]
    fn wrap_hides_the_true_sender() {
        let sender = TradeKeypair::generate();
        let recipient = TradeKeypair::generate();
        let wrap = EnvelopeCodec::new()
            .seal(&message(), &sender, &recipient.public_key())
            .unwrap();

        // The wrap is signed by the ephemeral key, routed by tag, and
        // its ciphertext mentions nobody.
        assert_ne!(wrap.pubkey, sender.public_key().to_hex());
        assert_eq!(
            wrap.tag_value(config::TAG_RECIPIENT),
            Some(recipient.public_key().to_hex().as_str())
        );
        assert!(!wrap.content.contains(&sender.public_key().to_hex()));
        assert!(wrap.verify().is_ok());
    }

    #[test]
    fn wrap_timestamp_is_backdated_or_now() {
        let sender = TradeKeypair::generate();
        let recipient = TradeKeypair::generate();
        let wrap = EnvelopeCodec::new()
            .seal(&message(), &sender, &recipient.public_key())
            .unwrap();
        let now = unix_now();
        assert!(wrap.created_at <= now);
        assert!(wrap.created_at >= now - config::WRAP_BACKDATE_WINDOW.as_secs() - 5);
    }

    #[test]
    fn unrelated_recipient_cannot_unseal() {
        let sender = TradeKeypair::generate();
        let recipient = TradeKeypair::generate();
        let snoop = TradeKeypair::generate();

        let wrap = EnvelopeCodec::new()
            .seal(&message(), &sender, &recipient.public_key())
            .unwrap();
        assert!(matches!(
            EnvelopeCodec::new().unseal(&wrap, &snoop),
            Err(EnvelopeError::Crypto(_))
        ));
    }

    #[test]
    fn wrong_inner_kind_is_rejected() {
        let sender = TradeKeypair::generate();
        let recipient = TradeKeypair::generate();

        // Hand-build a wrap whose inner layer is a rumor, not a seal.
        let rumor = EventTemplate::new(config::KIND_RUMOR, "x")
            .into_unsigned(&sender.public_key());
        let rumor_json = serde_json::to_vec(&rumor).unwrap();
        let ephemeral = TradeKeypair::generate();
        let ct = ephemeral
            .encrypt(&recipient.public_key(), &rumor_json)
            .unwrap();
        let bogus = EventTemplate::new(config::KIND_WRAP, hex::encode(ct))
            .tag(config::TAG_RECIPIENT, recipient.public_key().to_hex())
            .sign(&ephemeral);

        assert!(matches!(
            EnvelopeCodec::new().unseal(&bogus, &recipient),
            Err(EnvelopeError::UnexpectedKind {
                expected: config::KIND_SEAL,
                got: config::KIND_RUMOR,
            })
        ));
    }

    #[test]
    fn soft_mode_returns_message_with_bad_protocol_signature() {
        let sender = TradeKeypair::generate();
        let recipient = TradeKeypair::generate();
        let imposter = TradeKeypair::generate();

        // Seal normally, then rebuild the rumor claiming a different
        // sender so the detached signature cannot match.
        let wrap = seal_with_forged_claim(&sender, &imposter, &recipient);

        let (opened, claimed) = EnvelopeCodec::new().unseal(&wrap, &recipient).unwrap();
        assert_eq!(opened, message());
        assert_eq!(claimed, imposter.public_key());
    }

    #[test]
    fn strict_mode_rejects_bad_protocol_signature() {
        let sender = TradeKeypair::generate();
        let recipient = TradeKeypair::generate();
        let imposter = TradeKeypair::generate();

        let wrap = seal_with_forged_claim(&sender, &imposter, &recipient);
        assert!(matches!(
            EnvelopeCodec::strict().unseal(&wrap, &recipient),
            Err(EnvelopeError::SignatureRejected)
        ));
    }

    /// Build a wrap whose rumor claims `claimed` as sender but carries a
    /// signature from `actual` — exactly what a forged claim looks like.
    /// The seal/wrap layers must come from `claimed` too, or the recipient's
    /// conversation keys won't open them.
    fn seal_with_forged_claim(
        actual: &TradeKeypair,
        claimed: &TradeKeypair,
        recipient: &TradeKeypair,
    ) -> BusEvent {
        let serialized = message().serialize().unwrap();
        let sig = actual.sign(serialized.as_bytes());
        let rumor_content = serde_json::json!([serialized, sig.to_hex()]).to_string();
        let rumor = EventTemplate::new(config::KIND_RUMOR, rumor_content)
            .into_unsigned(&claimed.public_key());
        let rumor_json = serde_json::to_vec(&rumor).unwrap();

        let seal_ct = claimed
            .encrypt(&recipient.public_key(), &rumor_json)
            .unwrap();
        let seal =
            EventTemplate::new(config::KIND_SEAL, hex::encode(seal_ct)).sign(claimed);
        let seal_json = serde_json::to_vec(&seal).unwrap();

        let ephemeral = TradeKeypair::generate();
        let wrap_ct = ephemeral
            .encrypt(&recipient.public_key(), &seal_json)
            .unwrap();
        EventTemplate::new(config::KIND_WRAP, hex::encode(wrap_ct))
            .tag(config::TAG_RECIPIENT, recipient.public_key().to_hex())
            .sign(&ephemeral)
    }
}
