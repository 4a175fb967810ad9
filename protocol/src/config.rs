//! # Protocol Configuration & Constants
//!
//! Every magic number in Rialto lives here. Event kinds, tag names, caps,
//! and timeouts are protocol surface — change one and you stop interoperating
//! with every relay and counterparty on the network, so choose carefully.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Wire version carried inside every [`ProtocolMessage`](crate::messenger::ProtocolMessage).
/// Counterparties reject messages with a version they do not speak.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Event Kinds
// ---------------------------------------------------------------------------

/// Replaceable trade listing broadcast by a counterparty. Parameterized by
/// the `d` tag, so a newer event with the same (pubkey, kind, d) supersedes
/// the previous one.
pub const KIND_LISTING: u16 = 38383;

/// Outer envelope of the triple-layer wrap. The only envelope layer that
/// ever touches a relay. Signed by a single-use ephemeral key so observers
/// cannot attribute it to the true sender.
pub const KIND_WRAP: u16 = 1059;

/// Middle layer: the sender-signed seal carrying the encrypted rumor.
/// Never published on its own.
pub const KIND_SEAL: u16 = 13;

/// Innermost layer: the unsigned rumor carrying the serialized protocol
/// message plus its detached signature.
pub const KIND_RUMOR: u16 = 1;

// ---------------------------------------------------------------------------
// Tag Names
// ---------------------------------------------------------------------------

/// Unique listing identifier (the replaceable-event discriminator).
pub const TAG_LISTING_ID: &str = "d";
/// Listing kind: `buy` or `sell`.
pub const TAG_ORDER_KIND: &str = "k";
/// ISO-4217 fiat currency code.
pub const TAG_FIAT_CODE: &str = "f";
/// Listing status.
pub const TAG_STATUS: &str = "s";
/// Amount in satoshis.
pub const TAG_SAT_AMOUNT: &str = "amt";
/// Fiat amount, either a single integer or a `min-max` range.
pub const TAG_FIAT_AMOUNT: &str = "fa";
/// Payment method, free text.
pub const TAG_PAYMENT_METHOD: &str = "pm";
/// Premium over market price, signed percent.
pub const TAG_PREMIUM: &str = "premium";
/// Listing expiry, unix seconds.
pub const TAG_EXPIRATION: &str = "expiration";
/// Routing tag on wrap events: the recipient's public key.
pub const TAG_RECIPIENT: &str = "p";

/// Marketplace discriminator tag name. Every Rialto listing carries
/// `["y", "rialto"]`; the order directory subscribes on exactly this pair
/// so unrelated traffic on shared relays is filtered out relay-side.
pub const TAG_MARKETPLACE: &str = "y";
/// Marketplace discriminator tag value.
pub const MARKETPLACE_ID: &str = "rialto";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. 96 bits, the standard GCM nonce size.
pub const AES_NONCE_LENGTH: usize = 12;

/// Domain-separation context for deriving conversation keys from raw X25519
/// output. Changing this string changes every conversation key on the
/// network, which is a polite way of saying: don't.
pub const CONVERSATION_KDF_CONTEXT: &str = "rialto-protocol 2026 conversation key v1";

/// Hex-encoded public key / event id length (32 bytes).
pub const HEX_ID_LENGTH: usize = 64;

/// Hex-encoded Ed25519 signature length (64 bytes).
pub const HEX_SIG_LENGTH: usize = 128;

/// Wrap events backdate their `created_at` by a uniform random offset in
/// `[0, this]` so relay timestamps cannot be correlated with send time.
pub const WRAP_BACKDATE_WINDOW: Duration = Duration::from_secs(2 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Default bound for point-queries and initial discovery. After this, a
/// best-effort partial result is returned rather than an error.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-endpoint connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect backoff: first retry delay.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Reconnect backoff: delay ceiling. Doubling stops here.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default maximum reconnect attempts per endpoint. Zero means retry
/// forever, which is what a long-lived client actually wants.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 0;

// ---------------------------------------------------------------------------
// Order Directory
// ---------------------------------------------------------------------------

/// Maximum listings the directory will hold before an eviction sweep is
/// forced. Sized for "every active listing on the network plus slack" —
/// a busy marketplace runs a few hundred concurrent listings.
pub const MAX_DIRECTORY_SIZE: usize = 5_000;

/// Listings older than this are dropped by the eviction sweep even when
/// they carry no explicit expiration.
pub const MAX_LISTING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Key under which the directory snapshot is written to the key-value store.
pub const DIRECTORY_SNAPSHOT_KEY: &str = "rialto.directory.snapshot";

// ---------------------------------------------------------------------------
// Trade Sessions
// ---------------------------------------------------------------------------

/// Terminal (completed/canceled) sessions older than this are removed by
/// the retention sweep. Live sessions are never aged out.
pub const SESSION_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let kinds = [KIND_LISTING, KIND_WRAP, KIND_SEAL, KIND_RUMOR];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn backoff_window_is_sane() {
        assert!(RECONNECT_BASE_DELAY < RECONNECT_MAX_DELAY);
        assert!(DEFAULT_QUERY_TIMEOUT < MAX_LISTING_AGE);
    }
}
