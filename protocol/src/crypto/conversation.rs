//! # Conversation Keys
//!
//! Pairwise symmetric keys for envelope encryption, derived from the two
//! parties' long-lived Ed25519 identities.
//!
//! ## How the derivation works
//!
//! Ed25519 keys live on the Edwards form of Curve25519; X25519 runs on the
//! Montgomery form of the same curve. The birational map between the two is
//! the standard conversion libsodium ships as `crypto_sign_ed25519_*_to_curve25519`:
//!
//! - secret: the first 32 bytes of `SHA-512(seed)` become the X25519 scalar
//!   (clamping is applied by the X25519 function itself),
//! - public: decompress the Edwards point, map it to its Montgomery
//!   u-coordinate.
//!
//! Running Diffie-Hellman over the converted keys gives both parties the
//! same shared point. The raw DH output is NOT used as an encryption key —
//! curve points have algebraic structure, not uniform randomness — so it is
//! pushed through `blake3::derive_key` with a domain-separation context.
//!
//! Because `DH(a, B) == DH(b, A)`, the derived key is direction-independent:
//! either party derives the identical [`ConversationKey`] from its own secret
//! and the peer's public key. That symmetry is what lets the envelope codec
//! decrypt a layer knowing only "our keys" and "the layer's signer".
//!
//! ## Encryption
//!
//! AES-256-GCM with a random 96-bit nonce from `OsRng`. The wire format is
//! `nonce || ciphertext` in one buffer; the ciphertext includes GCM's 16-byte
//! authentication tag. Nonce reuse under GCM is catastrophic, so nonces are
//! never counters or derived values here — always fresh CSPRNG output.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use curve25519_dalek::edwards::CompressedEdwardsY;
use rand::RngCore;
use sha2::{Digest, Sha512};
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH, CONVERSATION_KDF_CONTEXT};
use crate::crypto::keys::{IdentityProvider, PublicKey, Signature, TradeKeypair};

/// Errors in conversation-key derivation or use.
///
/// Decryption failures are deliberately unspecific: "wrong key" and
/// "corrupted ciphertext" are indistinguishable by design under AEAD, and
/// telling an attacker which one happened helps nobody.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("peer public key is not a valid curve point")]
    InvalidPeerKey,

    #[error("key agreement produced a degenerate shared secret")]
    DegenerateSharedSecret,

    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("ciphertext too short: must be at least {AES_NONCE_LENGTH} bytes")]
    CiphertextTooShort,
}

// ---------------------------------------------------------------------------
// ConversationKey
// ---------------------------------------------------------------------------

/// A pairwise AES-256-GCM key shared by exactly two identities.
///
/// Derive once per (us, peer) pair and reuse freely; the random-nonce scheme
/// keeps every encryption independent.
///
/// # Examples
///
/// ```
/// use rialto_protocol::crypto::keys::TradeKeypair;
/// use rialto_protocol::crypto::conversation::ConversationKey;
///
/// let alice = TradeKeypair::generate();
/// let bob = TradeKeypair::generate();
///
/// let k_ab = ConversationKey::derive(&alice, &bob.public_key()).unwrap();
/// let k_ba = ConversationKey::derive(&bob, &alice.public_key()).unwrap();
///
/// let sealed = k_ab.encrypt(b"escrow funded").unwrap();
/// assert_eq!(k_ba.decrypt(&sealed).unwrap(), b"escrow funded");
/// ```
pub struct ConversationKey {
    key: [u8; AES_KEY_LENGTH],
}

impl ConversationKey {
    /// Derive the conversation key between `local` and `peer`.
    pub fn derive(local: &TradeKeypair, peer: &PublicKey) -> Result<Self, ConversationError> {
        // Ed25519 secret -> X25519 scalar: lower half of SHA-512(seed).
        // x25519() clamps internally, exactly like the libsodium conversion.
        let digest = Sha512::digest(local.seed_bytes());
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&digest[..32]);

        // Ed25519 public -> Montgomery u-coordinate.
        let point = CompressedEdwardsY(*peer.as_bytes())
            .decompress()
            .ok_or(ConversationError::InvalidPeerKey)?;
        let montgomery = point.to_montgomery().to_bytes();

        let shared = x25519_dalek::x25519(scalar, montgomery);

        // An all-zero DH output means the peer fed us a small-order point.
        // Refuse to derive a key from it.
        if shared == [0u8; 32] {
            return Err(ConversationError::DegenerateSharedSecret);
        }

        Ok(Self {
            key: blake3::derive_key(CONVERSATION_KDF_CONTEXT, &shared),
        })
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ConversationError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| ConversationError::EncryptFailed)?;

        let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| ConversationError::EncryptFailed)?;

        let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a `nonce || ciphertext` buffer produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, ConversationError> {
        if sealed.len() < AES_NONCE_LENGTH {
            return Err(ConversationError::CiphertextTooShort);
        }
        let (nonce, ciphertext) = sealed.split_at(AES_NONCE_LENGTH);

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| ConversationError::DecryptFailed)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ConversationError::DecryptFailed)
    }
}

// ---------------------------------------------------------------------------
// IdentityProvider for TradeKeypair
// ---------------------------------------------------------------------------

/// The in-process identity: keys in memory, derivation on demand.
///
/// Derivation per call keeps this impl stateless; at trading-protocol
/// message rates there is nothing worth caching.
impl IdentityProvider for TradeKeypair {
    fn public_key(&self) -> PublicKey {
        TradeKeypair::public_key(self)
    }

    fn sign(&self, message: &[u8]) -> Signature {
        TradeKeypair::sign(self, message)
    }

    fn encrypt(&self, peer: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, ConversationError> {
        ConversationKey::derive(self, peer)?.encrypt(plaintext)
    }

    fn decrypt(&self, peer: &PublicKey, ciphertext: &[u8]) -> Result<Vec<u8>, ConversationError> {
        ConversationKey::derive(self, peer)?.decrypt(ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_directions_derive_the_same_key() {
        let alice = TradeKeypair::generate();
        let bob = TradeKeypair::generate();

        let k_ab = ConversationKey::derive(&alice, &bob.public_key()).unwrap();
        let k_ba = ConversationKey::derive(&bob, &alice.public_key()).unwrap();
        assert_eq!(k_ab.key, k_ba.key);
    }

    #[test]
    fn different_peers_derive_different_keys() {
        let alice = TradeKeypair::generate();
        let bob = TradeKeypair::generate();
        let carol = TradeKeypair::generate();

        let k_ab = ConversationKey::derive(&alice, &bob.public_key()).unwrap();
        let k_ac = ConversationKey::derive(&alice, &carol.public_key()).unwrap();
        assert_ne!(k_ab.key, k_ac.key);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let alice = TradeKeypair::generate();
        let bob = TradeKeypair::generate();

        let key = ConversationKey::derive(&alice, &bob.public_key()).unwrap();
        let sealed = key.encrypt(b"invoice: lnbc1...").unwrap();
        assert_eq!(key.decrypt(&sealed).unwrap(), b"invoice: lnbc1...");
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let alice = TradeKeypair::generate();
        let bob = TradeKeypair::generate();
        let mallory = TradeKeypair::generate();

        let sealed = ConversationKey::derive(&alice, &bob.public_key())
            .unwrap()
            .encrypt(b"secret")
            .unwrap();

        let wrong = ConversationKey::derive(&mallory, &bob.public_key()).unwrap();
        assert!(matches!(
            wrong.decrypt(&sealed),
            Err(ConversationError::DecryptFailed)
        ));
    }

    #[test]
    fn truncated_ciphertext_rejected() {
        let alice = TradeKeypair::generate();
        let bob = TradeKeypair::generate();
        let key = ConversationKey::derive(&alice, &bob.public_key()).unwrap();
        assert!(matches!(
            key.decrypt(&[0u8; 4]),
            Err(ConversationError::CiphertextTooShort)
        ));
    }

    #[test]
    fn nonces_are_fresh_per_encryption() {
        let alice = TradeKeypair::generate();
        let bob = TradeKeypair::generate();
        let key = ConversationKey::derive(&alice, &bob.public_key()).unwrap();

        let a = key.encrypt(b"same plaintext").unwrap();
        let b = key.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn identity_provider_roundtrip() {
        let alice = TradeKeypair::generate();
        let bob = TradeKeypair::generate();

        let ct = IdentityProvider::encrypt(&alice, &bob.public_key(), b"hola").unwrap();
        let pt = IdentityProvider::decrypt(&bob, &alice.public_key(), &ct).unwrap();
        assert_eq!(pt, b"hola");
    }
}
