//! # Bus Events
//!
//! The signed event is the only thing a relay ever stores or forwards.
//! Listings, wraps, everything — one shape:
//!
//! ```text
//! {id, pubkey, created_at, kind, tags, content, sig}
//! ```
//!
//! The `id` is the SHA-256 of a canonical JSON serialization, so any two
//! implementations that agree on the canonical form agree on the id. The
//! `sig` is an Ed25519 signature over the 32 id bytes. Verifying an event
//! therefore means: recompute the id, check it matches, check the signature
//! against `pubkey`. Anything that fails is dropped and counted, never
//! propagated — a malformed event from the network is weather, not a bug.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::keys::{PublicKey, Signature, TradeKeypair};

/// Locally detected problems with an event or listing.
///
/// All of these are non-fatal: the offending input is dropped, a counter is
/// bumped, processing continues.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("event id does not match its contents")]
    IdMismatch,

    #[error("event signature is invalid")]
    BadSignature,

    #[error("event kind {got} where {expected} was required")]
    WrongKind { expected: u16, got: u16 },

    #[error("required tag `{0}` is missing")]
    MissingTag(&'static str),

    #[error("tag `{tag}` has unparseable value `{value}`")]
    BadTag { tag: &'static str, value: String },

    #[error("listing {id} claims counterparty {got}, already pinned to {pinned}")]
    CounterpartyMismatch {
        id: String,
        pinned: String,
        got: String,
    },

    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

// ---------------------------------------------------------------------------
// BusEvent
// ---------------------------------------------------------------------------

/// One event on the bus, signed or (for rumors) deliberately unsigned.
///
/// Field types mirror the wire exactly: hex strings for `id`/`pubkey`/`sig`,
/// unix seconds for `created_at`, free-form string tag arrays. Typed
/// accessors ([`author`](Self::author), [`tag_value`](Self::tag_value)) sit
/// on top rather than replacing the wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEvent {
    /// SHA-256 of the canonical serialization, lowercase hex.
    pub id: String,
    /// Signer's public key, lowercase hex.
    pub pubkey: String,
    /// Creation time, unix seconds.
    pub created_at: u64,
    /// Event kind (see [`crate::config`] for the kinds Rialto speaks).
    pub kind: u16,
    /// Tag arrays: `[name, value, ...]` per tag.
    pub tags: Vec<Vec<String>>,
    /// Payload. Meaning depends on `kind`.
    pub content: String,
    /// Ed25519 signature over the id bytes, lowercase hex. Empty string on
    /// rumors, which are unsigned by construction.
    pub sig: String,
}

impl BusEvent {
    /// Canonical serialization: `[0, pubkey, created_at, kind, tags, content]`.
    ///
    /// The leading `0` is a format version discriminator baked into the
    /// hashing scheme; it is not the event kind.
    fn canonical(&self) -> String {
        serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ])
        .to_string()
    }

    /// Recompute this event's id from its contents.
    pub fn compute_id(&self) -> String {
        hex::encode(Sha256::digest(self.canonical().as_bytes()))
    }

    /// Whether the event carries a signature at all.
    pub fn is_signed(&self) -> bool {
        !self.sig.is_empty()
    }

    /// Full validation: id integrity plus signature.
    pub fn verify(&self) -> Result<(), ValidationError> {
        if self.compute_id() != self.id {
            return Err(ValidationError::IdMismatch);
        }
        let author = self.author().map_err(|_| ValidationError::BadSignature)?;
        let sig = Signature::from_hex(&self.sig).map_err(|_| ValidationError::BadSignature)?;
        let id_bytes = hex::decode(&self.id).map_err(|_| ValidationError::IdMismatch)?;
        if !author.verify(&id_bytes, &sig) {
            return Err(ValidationError::BadSignature);
        }
        Ok(())
    }

    /// The signer as a typed key.
    pub fn author(&self) -> Result<PublicKey, ValidationError> {
        PublicKey::from_hex(&self.pubkey)
            .map_err(|_| ValidationError::Malformed(format!("bad pubkey {}", self.pubkey)))
    }

    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Expiration timestamp from the `expiration` tag, if present and numeric.
    pub fn expiration(&self) -> Option<u64> {
        self.tag_value(crate::config::TAG_EXPIRATION)
            .and_then(|v| v.parse().ok())
    }
}

// ---------------------------------------------------------------------------
// EventTemplate
// ---------------------------------------------------------------------------

/// Everything an event needs except identity: build one of these, then
/// either sign it into a [`BusEvent`] or freeze it unsigned as a rumor.
#[derive(Debug, Clone)]
pub struct EventTemplate {
    pub kind: u16,
    pub created_at: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    /// A template stamped with the current time and no tags.
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            created_at: unix_now(),
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Add one `[name, value]` tag.
    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(vec![name.into(), value.into()]);
        self
    }

    /// Override the creation timestamp (wrap backdating uses this).
    pub fn at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Finalize without a signature: a rumor. The id is still computed so
    /// the rumor is tamper-evident once inside its encrypted seal.
    pub fn into_unsigned(self, author: &PublicKey) -> BusEvent {
        let mut event = BusEvent {
            id: String::new(),
            pubkey: author.to_hex(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: String::new(),
        };
        event.id = event.compute_id();
        event
    }

    /// Finalize and sign with `keys`.
    pub fn sign(self, keys: &TradeKeypair) -> BusEvent {
        let mut event = self.into_unsigned(&keys.public_key());
        // The signature covers the id bytes, which in turn commit to every
        // other field via the canonical form.
        let id_bytes = hex::decode(&event.id).unwrap_or_default();
        event.sig = keys.sign(&id_bytes).to_hex();
        event
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Subscription / query criteria.
///
/// All populated fields must match (AND); within a field, any listed value
/// matches (OR). An empty filter matches everything, which is almost never
/// what you want on a public relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    /// Tag equality constraints as `(name, value)` pairs.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(Vec::new).push(id.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(author.into());
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((name.into(), value.into()));
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The standing filter the order directory subscribes with: all listing
    /// events carrying the Rialto marketplace discriminator.
    pub fn listings() -> Self {
        Self::new()
            .kind(crate::config::KIND_LISTING)
            .tag(crate::config::TAG_MARKETPLACE, crate::config::MARKETPLACE_ID)
    }

    /// Incoming wraps addressed to `recipient`.
    pub fn wraps_for(recipient: &PublicKey) -> Self {
        Self::new()
            .kind(crate::config::KIND_WRAP)
            .tag(crate::config::TAG_RECIPIENT, recipient.to_hex())
    }

    /// Whether `event` satisfies every populated criterion. `limit` is a
    /// result-set bound, not a per-event predicate, so it plays no part here.
    pub fn matches(&self, event: &BusEvent) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|i| *i == event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        for (name, value) in &self.tags {
            if event.tag_value(name) != Some(value.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KIND_LISTING, MARKETPLACE_ID, TAG_MARKETPLACE};

    fn signed(kind: u16, tags: Vec<Vec<String>>) -> BusEvent {
        let kp = TradeKeypair::generate();
        let mut tpl = EventTemplate::new(kind, "content");
        tpl.tags = tags;
        tpl.sign(&kp)
    }

    #[test]
    fn signed_event_verifies() {
        let event = signed(1, vec![]);
        assert!(event.verify().is_ok());
    }

    #[test]
    fn tampered_content_fails_id_check() {
        let mut event = signed(1, vec![]);
        event.content = "edited".into();
        assert!(matches!(event.verify(), Err(ValidationError::IdMismatch)));
    }

    #[test]
    fn swapped_signature_fails() {
        let a = signed(1, vec![]);
        let mut b = signed(1, vec![]);
        b.sig = a.sig;
        assert!(matches!(b.verify(), Err(ValidationError::BadSignature)));
    }

    #[test]
    fn unsigned_rumor_has_id_but_no_sig() {
        let kp = TradeKeypair::generate();
        let rumor = EventTemplate::new(1, "whisper").into_unsigned(&kp.public_key());
        assert!(!rumor.is_signed());
        assert_eq!(rumor.id, rumor.compute_id());
    }

    #[test]
    fn id_commits_to_every_field() {
        let kp = TradeKeypair::generate();
        let base = EventTemplate::new(1, "x").at(100).sign(&kp);
        let other = EventTemplate::new(1, "x").at(101).sign(&kp);
        assert_ne!(base.id, other.id);
    }

    #[test]
    fn tag_value_returns_first_match() {
        let event = signed(
            KIND_LISTING,
            vec![
                vec!["d".into(), "order-1".into()],
                vec!["d".into(), "order-2".into()],
            ],
        );
        assert_eq!(event.tag_value("d"), Some("order-1"));
        assert_eq!(event.tag_value("missing"), None);
    }

    #[test]
    fn listings_filter_matches_discriminated_listing() {
        let listing = signed(
            KIND_LISTING,
            vec![vec![TAG_MARKETPLACE.into(), MARKETPLACE_ID.into()]],
        );
        let unrelated = signed(KIND_LISTING, vec![]);
        let filter = Filter::listings();
        assert!(filter.matches(&listing));
        assert!(!filter.matches(&unrelated));
    }

    #[test]
    fn since_until_bounds() {
        let kp = TradeKeypair::generate();
        let event = EventTemplate::new(1, "x").at(500).sign(&kp);
        assert!(Filter::new().since(400).matches(&event));
        assert!(!Filter::new().since(501).matches(&event));
        let mut f = Filter::new();
        f.until = Some(499);
        assert!(!f.matches(&event));
    }

    #[test]
    fn wire_shape_roundtrips_through_json() {
        let event = signed(KIND_LISTING, vec![vec!["d".into(), "abc".into()]]);
        let json = serde_json::to_string(&event).unwrap();
        let back: BusEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
        assert!(back.verify().is_ok());
    }
}
