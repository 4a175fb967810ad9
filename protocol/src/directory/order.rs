//! # Listings
//!
//! The [`Order`] is a discovered trade listing, parsed out of a
//! `KIND_LISTING` event's tags. Counterparties broadcast these as
//! replaceable events: same listing id, newer `created_at`, new content.
//!
//! Tag parsing is deliberately two-tier: a tag that is *absent* leaves the
//! field `None` (counterparties publish sparse listings while an order is
//! being set up), while a tag that is *present but garbage* fails the whole
//! listing with a [`ValidationError`]. Sparse is protocol; garbage is not.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config;
use crate::event::{BusEvent, ValidationError};

// ---------------------------------------------------------------------------
// OrderKind
// ---------------------------------------------------------------------------

/// Which side of the trade the listing's *maker* is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    /// Maker buys sats, pays fiat.
    Buy,
    /// Maker sells sats, receives fiat.
    Sell,
}

impl FromStr for OrderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            _ => Err(()),
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

// ---------------------------------------------------------------------------
// ListingStatus
// ---------------------------------------------------------------------------

/// Published lifecycle state of a listing, as the counterparty reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingStatus {
    /// Open and takeable.
    Pending,
    /// Taken; the trade is running.
    InProgress,
    /// Trade settled successfully.
    Success,
    /// Withdrawn or failed.
    Canceled,
    /// Aged out without being taken.
    Expired,
}

impl FromStr for ListingStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "canceled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Success => "success",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// FiatValue
// ---------------------------------------------------------------------------

/// Fiat side of a listing: a fixed amount or a negotiable range.
///
/// Wire form is the `fa` tag: `"1500"` or `"100-500"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FiatValue {
    Amount(u64),
    Range { min: u64, max: u64 },
}

impl FiatValue {
    pub fn parse(s: &str) -> Result<Self, ()> {
        if let Some((min, max)) = s.split_once('-') {
            let min: u64 = min.trim().parse().map_err(|_| ())?;
            let max: u64 = max.trim().parse().map_err(|_| ())?;
            if min > max {
                return Err(());
            }
            Ok(Self::Range { min, max })
        } else {
            Ok(Self::Amount(s.trim().parse().map_err(|_| ())?))
        }
    }
}

impl fmt::Display for FiatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amount(a) => write!(f, "{a}"),
            Self::Range { min, max } => write!(f, "{min}-{max}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// A discovered trade listing.
///
/// Invariant, enforced by the directory: for a given `id`, `counterparty`
/// never changes across updates. Conflicts between versions of the same
/// listing are resolved by `created_at` (last writer wins), never by
/// arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Stable, globally unique listing id (`d` tag).
    pub id: String,
    /// Publishing counterparty's public key (the event author).
    pub counterparty: String,
    pub kind: Option<OrderKind>,
    pub status: Option<ListingStatus>,
    /// ISO-4217 code, uppercased on parse.
    pub fiat_code: Option<String>,
    pub fiat: Option<FiatValue>,
    pub sat_amount: Option<u64>,
    pub payment_method: Option<String>,
    /// Premium over market price, signed percent.
    pub premium: Option<i64>,
    /// The listing version's creation time (the event `created_at`).
    pub created_at: u64,
    /// Explicit expiry, unix seconds.
    pub expires_at: Option<u64>,
}

impl Order {
    /// Parse a listing from a (kind-checked) listing event. The event's
    /// signature is the caller's business; this only reads tags.
    pub fn from_event(event: &BusEvent) -> Result<Self, ValidationError> {
        if event.kind != config::KIND_LISTING {
            return Err(ValidationError::WrongKind {
                expected: config::KIND_LISTING,
                got: event.kind,
            });
        }

        let id = event
            .tag_value(config::TAG_LISTING_ID)
            .ok_or(ValidationError::MissingTag(config::TAG_LISTING_ID))?
            .to_string();

        let kind = parse_tag(event, config::TAG_ORDER_KIND, |v| {
            OrderKind::from_str(v).ok()
        })?;
        let status = parse_tag(event, config::TAG_STATUS, |v| {
            ListingStatus::from_str(v).ok()
        })?;
        let fiat = parse_tag(event, config::TAG_FIAT_AMOUNT, |v| {
            FiatValue::parse(v).ok()
        })?;
        let sat_amount = parse_tag(event, config::TAG_SAT_AMOUNT, |v| v.parse().ok())?;
        let premium = parse_tag(event, config::TAG_PREMIUM, |v| v.parse().ok())?;
        let expires_at = parse_tag(event, config::TAG_EXPIRATION, |v| v.parse().ok())?;

        Ok(Self {
            id,
            counterparty: event.pubkey.clone(),
            kind,
            status,
            fiat_code: event
                .tag_value(config::TAG_FIAT_CODE)
                .map(|v| v.to_ascii_uppercase()),
            fiat,
            sat_amount,
            payment_method: event
                .tag_value(config::TAG_PAYMENT_METHOD)
                .map(str::to_string),
            premium,
            created_at: event.created_at,
            expires_at,
        })
    }

    /// Past its explicit expiry?
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    /// A listing with enough fields to actually present to a taker.
    pub fn is_complete(&self) -> bool {
        self.kind.is_some() && self.fiat_code.is_some() && self.payment_method.is_some()
    }

    /// Open for taking: pending status and not expired.
    pub fn is_active(&self, now: u64) -> bool {
        self.status == Some(ListingStatus::Pending) && !self.is_expired(now)
    }
}

/// Absent tag ⇒ `Ok(None)`; present-but-unparseable ⇒ `Err(BadTag)`.
fn parse_tag<T>(
    event: &BusEvent,
    tag: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, ValidationError> {
    match event.tag_value(tag) {
        None => Ok(None),
        Some(v) => parse(v).map(Some).ok_or(ValidationError::BadTag {
            tag,
            value: v.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::TradeKeypair;
    use crate::event::EventTemplate;

    fn listing_event(tags: &[(&str, &str)]) -> BusEvent {
        let mut tpl = EventTemplate::new(config::KIND_LISTING, "");
        for (name, value) in tags {
            tpl = tpl.tag(*name, *value);
        }
        tpl.sign(&TradeKeypair::generate())
    }

    #[test]
    fn full_listing_parses() {
        let event = listing_event(&[
            ("d", "ord-1"),
            ("k", "sell"),
            ("f", "eur"),
            ("s", "pending"),
            ("amt", "50000"),
            ("fa", "100-500"),
            ("pm", "SEPA"),
            ("premium", "-2"),
            ("expiration", "9999999999"),
        ]);
        let order = Order::from_event(&event).unwrap();
        assert_eq!(order.id, "ord-1");
        assert_eq!(order.kind, Some(OrderKind::Sell));
        assert_eq!(order.fiat_code.as_deref(), Some("EUR"));
        assert_eq!(order.fiat, Some(FiatValue::Range { min: 100, max: 500 }));
        assert_eq!(order.sat_amount, Some(50_000));
        assert_eq!(order.premium, Some(-2));
        assert_eq!(order.counterparty, event.pubkey);
        assert!(order.is_complete());
    }

    #[test]
    fn missing_listing_id_is_rejected() {
        let event = listing_event(&[("k", "buy")]);
        assert!(matches!(
            Order::from_event(&event),
            Err(ValidationError::MissingTag("d"))
        ));
    }

    #[test]
    fn sparse_listing_parses_as_incomplete() {
        let event = listing_event(&[("d", "ord-2"), ("k", "buy")]);
        let order = Order::from_event(&event).unwrap();
        assert!(!order.is_complete());
        assert!(order.fiat_code.is_none());
    }

    #[test]
    fn garbage_tag_value_is_rejected() {
        let event = listing_event(&[("d", "ord-3"), ("k", "lease")]);
        assert!(matches!(
            Order::from_event(&event),
            Err(ValidationError::BadTag { tag: "k", .. })
        ));
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let event = EventTemplate::new(1, "")
            .tag("d", "x")
            .sign(&TradeKeypair::generate());
        assert!(matches!(
            Order::from_event(&event),
            Err(ValidationError::WrongKind { .. })
        ));
    }

    #[test]
    fn fiat_value_parse_forms() {
        assert_eq!(FiatValue::parse("1500"), Ok(FiatValue::Amount(1500)));
        assert_eq!(
            FiatValue::parse("100-500"),
            Ok(FiatValue::Range { min: 100, max: 500 })
        );
        assert!(FiatValue::parse("500-100").is_err());
        assert!(FiatValue::parse("lots").is_err());
    }

    #[test]
    fn expiry_logic() {
        let event = listing_event(&[("d", "ord-4"), ("expiration", "1000")]);
        let order = Order::from_event(&event).unwrap();
        assert!(order.is_expired(1000));
        assert!(!order.is_expired(999));
    }
}
