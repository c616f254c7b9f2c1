//! Stateless invariant checks over the whole exchange.
//!
//! Run after every mutation. A failure here means in-memory state is
//! corrupted; the coordinator latches shut rather than trade on it.
//!
//! The laws:
//! - contracts: every market's positions sum to zero
//! - cash: total wealth equals minted - burned + settlement credits -
//!   settlement debits, and no balance is negative
//! - registry: the global registry is bijective with the live orders
//!   across all books and agrees on side, price, and owner
//! - portfolios: each book's position table matches the ledger's
//!   portfolios for that market

use crate::engine::Engine;
use crate::ledger::Ledger;
use crate::mapper::UserIdMapper;
use crate::types::{MarketId, OrderId, UserId};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("market {market:?} positions sum to {net}, expected 0")]
    UnbalancedMarket { market: MarketId, net: i64 },

    #[error("cash mismatch: ledger holds {actual}, conservation law expects {expected}")]
    CashMismatch { expected: Decimal, actual: Decimal },

    #[error("negative balance for {user}: available {available}, locked {locked}")]
    NegativeBalance {
        user: String,
        available: Decimal,
        locked: Decimal,
    },

    #[error("registry mismatch: {0}")]
    RegistryMismatch(String),

    #[error("portfolio mismatch for {user} in {market}: book has {book}, ledger has {ledger}")]
    PortfolioMismatch {
        user: String,
        market: String,
        book: i64,
        ledger: i64,
    },

    #[error("internal id {0:?} has no external mapping")]
    UnmappedId(UserId),
}

/// Run every check. Ordering mirrors severity: a broken registry or
/// portfolio usually shows up as a position imbalance first.
pub fn run_audit(engine: &Engine, ledger: &Ledger, mapper: &UserIdMapper) -> Result<(), AuditError> {
    check_positions(engine)?;
    check_cash(ledger)?;
    check_registry(engine)?;
    check_portfolios(engine, ledger, mapper)?;
    Ok(())
}

/// Conservation of contracts: longs and shorts cancel out per market.
fn check_positions(engine: &Engine) -> Result<(), AuditError> {
    for (market, book) in engine.books() {
        let net: i64 = book.positions().values().sum();
        if net != 0 {
            return Err(AuditError::UnbalancedMarket { market, net });
        }
    }
    Ok(())
}

/// Conservation of cash, with the burn floor and settlement flows folded
/// into the ledger's running totals.
fn check_cash(ledger: &Ledger) -> Result<(), AuditError> {
    let mut actual = Decimal::ZERO;
    for (user, account) in ledger.accounts() {
        if account.available < Decimal::ZERO || account.locked < Decimal::ZERO {
            return Err(AuditError::NegativeBalance {
                user: user.clone(),
                available: account.available,
                locked: account.locked,
            });
        }
        actual += account.total_equity();
    }

    let expected = ledger.total_minted() - ledger.total_burned() + ledger.settlement_credited()
        - ledger.settlement_debited();
    if actual != expected {
        return Err(AuditError::CashMismatch { expected, actual });
    }
    Ok(())
}

/// The registry's key set must equal the union of live order ids across
/// all books, with matching metadata.
fn check_registry(engine: &Engine) -> Result<(), AuditError> {
    let registry = engine.registry();
    let mut live_orders = 0usize;

    for (market, book) in engine.books() {
        for order_id in book.order_ids() {
            live_orders += 1;
            let Some(info) = registry.get(&order_id) else {
                return Err(AuditError::RegistryMismatch(format!(
                    "book order {order_id:?} missing from registry"
                )));
            };
            let order = book
                .order(order_id)
                .expect("iterating ids of the same book");
            if info.market != market
                || info.side != order.side
                || info.price != order.price
                || info.user != order.user
            {
                return Err(AuditError::RegistryMismatch(format!(
                    "registry metadata for {order_id:?} disagrees with the book"
                )));
            }
        }
    }

    if registry.len() != live_orders {
        let stale: Vec<OrderId> = registry
            .keys()
            .filter(|id| {
                engine
                    .books()
                    .all(|(_, book)| book.order(**id).is_none())
            })
            .copied()
            .collect();
        return Err(AuditError::RegistryMismatch(format!(
            "registry holds {} entries for {} live orders (stale: {:?})",
            registry.len(),
            live_orders,
            stale
        )));
    }
    Ok(())
}

/// The book's per-market position table and the ledger's portfolios are
/// two views of the same contracts.
fn check_portfolios(engine: &Engine, ledger: &Ledger, mapper: &UserIdMapper) -> Result<(), AuditError> {
    for (market, book) in engine.books() {
        let key = mapper
            .market_key(market)
            .ok_or(AuditError::UnmappedId(market.subject))?;
        for (&user, &position) in book.positions() {
            let name = mapper
                .to_external(user)
                .ok_or(AuditError::UnmappedId(user))?;
            let held = ledger
                .account(name)
                .and_then(|account| account.portfolio.get(&key).copied())
                .unwrap_or(0);
            if held != position {
                return Err(AuditError::PortfolioMismatch {
                    user: name.to_string(),
                    market: key.clone(),
                    book: position,
                    ledger: held,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Price, Side, UserId};
    use rust_decimal_macros::dec;

    fn setup() -> (Engine, Ledger, UserIdMapper) {
        let mut engine = Engine::new();
        let mut ledger = Ledger::new();
        let mut mapper = UserIdMapper::new();

        let alice = mapper.to_internal("alice");
        let bob = mapper.to_internal("bob");
        let market = MarketId::new(alice, 480);

        ledger.deposit("bob", dec!(10.00));

        engine
            .place(market, Side::Sell, Price::new(60).unwrap(), 10, OrderId(1), alice)
            .unwrap();
        ledger.lock_for_buy("bob", Price::new(60).unwrap(), 10).unwrap();
        engine
            .place(market, Side::Buy, Price::new(60).unwrap(), 10, OrderId(2), bob)
            .unwrap();
        ledger.apply_trade("alice,480", "bob", "alice", Price::new(60).unwrap(), 10);

        (engine, ledger, mapper)
    }

    #[test]
    fn consistent_state_passes() {
        let (engine, ledger, mapper) = setup();
        run_audit(&engine, &ledger, &mapper).unwrap();
    }

    #[test]
    fn detects_portfolio_drift() {
        let (engine, mut ledger, mapper) = setup();
        // a trade the book never saw
        ledger.apply_trade("alice,480", "bob", "carol", Price::new(10).unwrap(), 1);

        let err = run_audit(&engine, &ledger, &mapper).unwrap_err();
        assert!(matches!(err, AuditError::PortfolioMismatch { .. }));
    }

    #[test]
    fn detects_cash_leak() {
        let (engine, mut ledger, mapper) = setup();
        // release escrow that was never locked
        ledger.release_lock("bob", 100);

        let err = run_audit(&engine, &ledger, &mapper).unwrap_err();
        assert!(matches!(err, AuditError::NegativeBalance { .. }));
    }

    #[test]
    fn registry_stays_bijective_through_churn() {
        let (mut engine, mut ledger, mapper) = setup();
        let alice = UserId(1);
        let bob = UserId(2);
        let market = MarketId::new(alice, 480);

        ledger.deposit("bob", dec!(5.00));
        ledger.lock_for_buy("bob", Price::new(10).unwrap(), 10).unwrap();
        engine
            .place(market, Side::Buy, Price::new(10).unwrap(), 10, OrderId(3), bob)
            .unwrap();
        run_audit(&engine, &ledger, &mapper).unwrap();

        engine.cancel(OrderId(3)).unwrap();
        ledger.release_lock("bob", 100);
        run_audit(&engine, &ledger, &mapper).unwrap();
    }

    #[test]
    fn detects_unbalanced_positions() {
        let (mut engine, ledger, mapper) = setup();
        let alice = UserId(1);
        engine.restore_position(MarketId::new(alice, 480), UserId(2), 3);

        let err = run_audit(&engine, &ledger, &mapper).unwrap_err();
        assert!(matches!(err, AuditError::UnbalancedMarket { .. }));
    }
}
