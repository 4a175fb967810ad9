//! # Cryptographic Primitives
//!
//! Low-level building blocks for Rialto's identity and envelope layers:
//!
//! - **keys** — Ed25519 identity keypairs, detached signatures, and the
//!   [`IdentityProvider`](keys::IdentityProvider) capability the envelope
//!   codec consumes.
//! - **conversation** — pairwise symmetric keys from Ed25519→X25519
//!   Diffie-Hellman plus a BLAKE3 KDF, and AES-256-GCM sealing.
//!
//! Nothing above this module touches a curve or a cipher directly.

pub mod conversation;
pub mod keys;

pub use conversation::{ConversationError, ConversationKey};
pub use keys::{IdentityProvider, KeyError, PublicKey, Signature, TradeKeypair};
