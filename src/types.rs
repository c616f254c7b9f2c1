//! Core primitives for the exchange.
//!
//! Ids, prices, and timestamps are newtypes so the compiler catches mixups
//! between internal integer ids, external strings, cents, and quantities.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal user id. The mapper hands these out; the external interface
/// only ever sees the string identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u32);

/// Counterparty for settlement liquidation trades. Never minted by the
/// mapper, which starts handing out ids at 1.
pub const HOUSE: UserId = UserId(0);

/// Client-assigned order id, globally unique across markets while the
/// order is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub u32);

/// A market is a binary contract on one subject crossing one threshold.
/// The same subject can carry several markets at different thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarketId {
    pub subject: UserId,
    pub threshold: u32,
}

impl MarketId {
    pub fn new(subject: UserId, threshold: u32) -> Self {
        Self { subject, threshold }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Price in integer cents. Orders must quote a positive price; the zero
/// price exists only for settlement trades on markets that resolved to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(i64);

impl Price {
    pub const ZERO: Price = Price(0);
    pub const ONE: Price = Price(1);

    #[must_use]
    pub fn new(cents: i64) -> Option<Self> {
        if cents > 0 {
            Some(Self(cents))
        } else {
            None
        }
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical timestamp used as the FIFO tie-breaker. Strictly monotonic
/// across all markets and preserved verbatim through snapshot reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Exact cents-to-dollars conversion. All money arithmetic in the engine
/// happens in integer cents; the ledger and the wire carry two-decimal
/// `Decimal` dollars.
pub fn cents_to_dollars(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn price_rejects_non_positive() {
        assert!(Price::new(0).is_none());
        assert!(Price::new(-5).is_none());
        assert_eq!(Price::new(60).unwrap().value(), 60);
    }

    #[test]
    fn terminal_prices() {
        assert_eq!(Price::ZERO.value(), 0);
        assert_eq!(Price::ONE.value(), 1);
    }

    #[test]
    fn cents_conversion_is_exact() {
        assert_eq!(cents_to_dollars(600), dec!(6.00));
        assert_eq!(cents_to_dollars(1), dec!(0.01));
        assert_eq!(cents_to_dollars(0), dec!(0.00));
    }
}
