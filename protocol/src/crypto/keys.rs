//! # Identity Keys
//!
//! Ed25519 keypair management for Rialto participants.
//!
//! Every participant on the bus — trader, counterparty service, ephemeral
//! envelope signer — is an Ed25519 keypair. The hex-encoded public key is
//! the participant's address: listings are grouped by it, envelopes are
//! routed to it, signatures are checked against it.
//!
//! ## Security considerations
//!
//! - Key generation uses `OsRng`. If your OS RNG is broken, a trading
//!   client is the least of your worries.
//! - The secret half deliberately does not implement `Serialize`. Writing
//!   a private key somewhere should be a conscious act, not a side effect
//!   of dumping a struct to JSON. Use `to_secret_hex()` explicitly.
//! - Key bytes are never logged. Keep it that way.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::{HEX_ID_LENGTH, HEX_SIG_LENGTH};

/// Errors that can occur during key operations.
///
/// Intentionally vague about *why* something failed — error messages that
/// describe key material in detail are a gift to attackers.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key: wrong length or malformed hex")]
    InvalidSecretKey,

    #[error("invalid public key: wrong length, malformed hex, or not a valid point")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignature,
}

// ---------------------------------------------------------------------------
// TradeKeypair
// ---------------------------------------------------------------------------

/// A participant's Ed25519 identity keypair.
///
/// Signs outgoing events and protocol messages, and (via the conversation
/// key machinery in [`crate::crypto::conversation`]) agrees on symmetric
/// keys with peers for envelope encryption.
///
/// # Examples
///
/// ```
/// use rialto_protocol::crypto::keys::TradeKeypair;
///
/// let kp = TradeKeypair::generate();
/// let sig = kp.sign(b"take listing 42");
/// assert!(kp.public_key().verify(b"take listing 42", &sig));
/// ```
pub struct TradeKeypair {
    signing_key: SigningKey,
}

impl TradeKeypair {
    /// Generate a fresh keypair from the OS cryptographic RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Construct a keypair deterministically from a 32-byte seed.
    ///
    /// In Ed25519 the 32-byte secret key *is* the seed. A weak seed makes
    /// a weak key; feed this from a CSPRNG or a proper KDF only.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load a keypair from a hex-encoded secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSecretKey)?;
        let arr: [u8; SECRET_KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&arr))
    }

    /// The public half of this identity.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Sign an arbitrary message, returning a detached signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            bytes: self.signing_key.sign(message).to_bytes(),
        }
    }

    /// Hex-encode the secret key. Deliberate, explicit, greppable.
    pub fn to_secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Raw seed bytes, for the Ed25519→X25519 conversion in the
    /// conversation-key module. Crate-internal on purpose.
    pub(crate) fn seed_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }
}

impl Clone for TradeKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for TradeKeypair {
    /// Shows only the public half. The secret stays out of logs, period.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TradeKeypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

/// The public half of a participant identity, safe to share and to log.
///
/// On the wire this is always 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey {
    bytes: [u8; 32],
}

impl PublicKey {
    /// Parse a public key from its hex wire form.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        if hex_str.len() != HEX_ID_LENGTH {
            return Err(KeyError::InvalidPublicKey);
        }
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidPublicKey)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        // Make sure the bytes actually decompress to an Ed25519 point now,
        // so later signature checks can't fail on a malformed key.
        VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes: arr })
    }

    /// The hex wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Verify a detached signature over `message`.
    ///
    /// Returns a plain `bool`: a bad signature is a routine protocol
    /// condition here, not an exceptional one.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let sig = DalekSignature::from_bytes(&signature.bytes);
        vk.verify(message, &sig).is_ok()
    }
}

impl TryFrom<String> for PublicKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<PublicKey> for String {
    fn from(value: PublicKey) -> Self {
        value.to_hex()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// A detached Ed25519 signature. 64 bytes, 128 hex characters on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    bytes: [u8; 64],
}

impl Signature {
    /// Parse a signature from its hex wire form.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        if hex_str.len() != HEX_SIG_LENGTH {
            return Err(KeyError::InvalidSignature);
        }
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSignature)?;
        let arr: [u8; 64] = bytes.try_into().map_err(|_| KeyError::InvalidSignature)?;
        Ok(Self { bytes: arr })
    }

    /// The hex wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// IdentityProvider
// ---------------------------------------------------------------------------

/// The pluggable signing/encryption capability the envelope codec consumes.
///
/// [`TradeKeypair`] implements it natively; an application that keeps keys
/// in a hardware signer or a remote enclave implements it there instead.
/// The codec never sees raw secret material — only this interface.
pub trait IdentityProvider: Send + Sync {
    /// The identity's public key.
    fn public_key(&self) -> PublicKey;

    /// Produce a detached signature over `message`.
    fn sign(&self, message: &[u8]) -> Signature;

    /// Encrypt `plaintext` so that only `peer` can read it.
    fn encrypt(
        &self,
        peer: &PublicKey,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, crate::crypto::conversation::ConversationError>;

    /// Decrypt a ciphertext produced by `peer` for this identity.
    fn decrypt(
        &self,
        peer: &PublicKey,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, crate::crypto::conversation::ConversationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = TradeKeypair::generate();
        let sig = kp.sign(b"hello relay");
        assert!(kp.public_key().verify(b"hello relay", &sig));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let kp = TradeKeypair::generate();
        let sig = kp.sign(b"fiat sent");
        assert!(!kp.public_key().verify(b"fiat not sent", &sig));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let kp = TradeKeypair::generate();
        let other = TradeKeypair::generate();
        let sig = kp.sign(b"release");
        assert!(!other.public_key().verify(b"release", &sig));
    }

    #[test]
    fn keypair_hex_roundtrip() {
        let kp = TradeKeypair::generate();
        let restored = TradeKeypair::from_hex(&kp.to_secret_hex()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let pk = TradeKeypair::generate().public_key();
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);
    }

    #[test]
    fn short_hex_public_key_rejected() {
        assert!(matches!(
            PublicKey::from_hex("abcd"),
            Err(KeyError::InvalidPublicKey)
        ));
    }

    #[test]
    fn signature_hex_roundtrip() {
        let kp = TradeKeypair::generate();
        let sig = kp.sign(b"x");
        let restored = Signature::from_hex(&sig.to_hex()).unwrap();
        assert!(kp.public_key().verify(b"x", &restored));
    }

    #[test]
    fn debug_never_prints_secret() {
        let kp = TradeKeypair::generate();
        let dump = format!("{:?}", kp);
        assert!(!dump.contains(&kp.to_secret_hex()));
    }
}
