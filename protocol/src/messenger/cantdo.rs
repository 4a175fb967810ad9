//! # CantDo Reasons
//!
//! A counterparty that refuses a request answers with a `cant-do` message
//! carrying one of these enumerated reasons. They are data, not errors:
//! the router hands them back to the caller as a structured rejection so
//! the application can explain what to fix, and nothing unwinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a counterparty rejected a request.
///
/// Wire names are kebab-case. Every variant carries a human-readable
/// [`explanation`](Self::explanation) suited for direct display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CantDoReason {
    InvalidSignature,
    InvalidTradeIndex,
    InvalidAmount,
    InvalidInvoice,
    InvalidPaymentRequest,
    InvalidPeer,
    InvalidRating,
    InvalidTextMessage,
    InvalidOrderKind,
    InvalidOrderStatus,
    InvalidPubkey,
    InvalidParameters,
    OrderAlreadyCanceled,
    CantCreateUser,
    IsNotYourOrder,
    NotAllowedByStatus,
    OutOfRangeFiatAmount,
    OutOfRangeSatsAmount,
    IsNotYourDispute,
    NotFound,
    PendingOrderExists,
}

impl CantDoReason {
    /// Remediation-oriented text for the application layer.
    pub fn explanation(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "the message signature did not verify; re-send from the key that owns this trade",
            Self::InvalidTradeIndex => "the trade index does not match the counterparty's records; sync your trade index and retry",
            Self::InvalidAmount => "the amount is not acceptable for this order",
            Self::InvalidInvoice => "the invoice is malformed or has an unacceptable amount or expiry",
            Self::InvalidPaymentRequest => "the payment request could not be parsed or paid",
            Self::InvalidPeer => "the referenced peer is not part of this trade",
            Self::InvalidRating => "ratings must be an integer from 1 to 5",
            Self::InvalidTextMessage => "the text message was rejected",
            Self::InvalidOrderKind => "this operation does not apply to that order kind",
            Self::InvalidOrderStatus => "the order is not in a status that allows this operation",
            Self::InvalidPubkey => "the public key is malformed or unknown",
            Self::InvalidParameters => "one or more request parameters are invalid",
            Self::OrderAlreadyCanceled => "the order was already canceled",
            Self::CantCreateUser => "the counterparty could not register your identity",
            Self::IsNotYourOrder => "that order belongs to a different participant",
            Self::NotAllowedByStatus => "the order's current status forbids this action",
            Self::OutOfRangeFiatAmount => "the fiat amount is outside the order's advertised range",
            Self::OutOfRangeSatsAmount => "the sats amount is outside the counterparty's accepted bounds",
            Self::IsNotYourDispute => "that dispute belongs to a different participant",
            Self::NotFound => "no such order or dispute exists",
            Self::PendingOrderExists => "you already have a pending order; cancel it or wait for it to settle",
        }
    }
}

impl fmt::Display for CantDoReason {
    /// Display = wire name. Lean on serde rather than hand-copying the 21
    /// kebab-case names a second time and letting them drift.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quoted = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(quoted.trim_matches('"'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_kebab_case() {
        assert_eq!(
            serde_json::to_string(&CantDoReason::OutOfRangeFiatAmount).unwrap(),
            "\"out-of-range-fiat-amount\""
        );
        assert_eq!(CantDoReason::InvalidAmount.to_string(), "invalid-amount");
    }

    #[test]
    fn every_reason_has_a_nonempty_explanation() {
        let all = [
            CantDoReason::InvalidSignature,
            CantDoReason::InvalidTradeIndex,
            CantDoReason::InvalidAmount,
            CantDoReason::InvalidInvoice,
            CantDoReason::InvalidPaymentRequest,
            CantDoReason::InvalidPeer,
            CantDoReason::InvalidRating,
            CantDoReason::InvalidTextMessage,
            CantDoReason::InvalidOrderKind,
            CantDoReason::InvalidOrderStatus,
            CantDoReason::InvalidPubkey,
            CantDoReason::InvalidParameters,
            CantDoReason::OrderAlreadyCanceled,
            CantDoReason::CantCreateUser,
            CantDoReason::IsNotYourOrder,
            CantDoReason::NotAllowedByStatus,
            CantDoReason::OutOfRangeFiatAmount,
            CantDoReason::OutOfRangeSatsAmount,
            CantDoReason::IsNotYourDispute,
            CantDoReason::NotFound,
            CantDoReason::PendingOrderExists,
        ];
        for reason in all {
            assert!(!reason.explanation().is_empty(), "{reason}");
        }
    }
}
