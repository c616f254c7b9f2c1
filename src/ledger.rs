//! Capital and portfolio ledger.
//!
//! Accounts are keyed by the external string identity. Cash lives in two
//! buckets: `available` and `locked` (escrow backing open buy orders).
//! Sellers never lock anything; contracts come into existence as long/short
//! pairs. The ledger also keeps the running totals the auditor needs to
//! state an exact cash-conservation law: minting is the only source of
//! cash, burning and settlement debits the only sinks, and everything else
//! is an internal transfer.

use crate::types::{cents_to_dollars, Price, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

/// Credits minted per step walked.
pub const STEPS_REWARD_RATE: Decimal = dec!(0.01);

/// Credits burned per hour of doomscrolling.
pub const DOOMSCROLL_TAX_PER_HOUR: Decimal = dec!(5.00);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub available: Decimal,
    pub locked: Decimal,
    /// Net contracts per market key ("subject,threshold"). Positive is
    /// long, negative is short. Settled slots stay at zero.
    pub portfolio: BTreeMap<String, i64>,
}

impl Account {
    pub fn total_equity(&self) -> Decimal {
        self.available + self.locked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },
}

#[derive(Debug, Default)]
pub struct Ledger {
    accounts: BTreeMap<String, Account>,
    total_minted: Decimal,
    total_burned: Decimal,
    settlement_credited: Decimal,
    settlement_debited: Decimal,
}

fn trade_cost(price: Price, quantity: i64) -> Decimal {
    cents_to_dollars(price.value() * quantity)
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from snapshot accounts. Loaded wealth counts as minted at
    /// genesis so the cash-conservation law stays exact after a reload.
    pub fn restore(accounts: BTreeMap<String, Account>) -> Self {
        let total_minted = accounts.values().map(Account::total_equity).sum();
        Self {
            accounts,
            total_minted,
            total_burned: Decimal::ZERO,
            settlement_credited: Decimal::ZERO,
            settlement_debited: Decimal::ZERO,
        }
    }

    fn account_mut(&mut self, user: &str) -> &mut Account {
        self.accounts.entry(user.to_string()).or_default()
    }

    pub fn account(&self, user: &str) -> Option<&Account> {
        self.accounts.get(user)
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&String, &Account)> {
        self.accounts.iter()
    }

    /// Direct credit, for seeding and tests. Counts as minted.
    pub fn deposit(&mut self, user: &str, amount: Decimal) {
        self.account_mut(user).available += amount;
        self.total_minted += amount;
    }

    /// Mint credits for steps walked.
    pub fn mint_for_steps(&mut self, user: &str, steps: u64) -> Decimal {
        let reward = Decimal::from(steps) * STEPS_REWARD_RATE;
        self.account_mut(user).available += reward;
        self.total_minted += reward;
        reward
    }

    /// Burn credits for screen time, floored at zero. Returns the amount
    /// actually burned so the conservation totals stay exact.
    pub fn burn_for_scroll(&mut self, user: &str, minutes: u64) -> Decimal {
        let tax = (Decimal::from(minutes) / dec!(60) * DOOMSCROLL_TAX_PER_HOUR).round_dp(2);
        let account = self.account_mut(user);
        let burned = tax.min(account.available);
        account.available -= burned;
        self.total_burned += burned;
        burned
    }

    /// Escrow `price * qty` before a buy order reaches the engine.
    pub fn lock_for_buy(&mut self, user: &str, price: Price, quantity: i64) -> Result<(), LedgerError> {
        let cost = trade_cost(price, quantity);
        let account = self.account_mut(user);
        if account.available < cost {
            return Err(LedgerError::InsufficientFunds {
                needed: cost,
                available: account.available,
            });
        }
        account.available -= cost;
        account.locked += cost;
        Ok(())
    }

    /// Move escrowed cents back to available: cancels, rejected placements,
    /// and price-improvement refunds all land here.
    pub fn release_lock(&mut self, user: &str, amount_cents: i64) {
        let amount = cents_to_dollars(amount_cents);
        let account = self.account_mut(user);
        account.locked -= amount;
        account.available += amount;
    }

    /// Apply one executed trade: the buyer's escrow is consumed, the seller
    /// is paid, and both portfolios move by the traded quantity. A self
    /// trade nets out to an escrow release.
    pub fn apply_trade(&mut self, market_key: &str, buyer: &str, seller: &str, price: Price, quantity: i64) {
        let cost = trade_cost(price, quantity);

        let buyer_account = self.account_mut(buyer);
        buyer_account.locked -= cost;
        *buyer_account.portfolio.entry(market_key.to_string()).or_insert(0) += quantity;

        let seller_account = self.account_mut(seller);
        seller_account.available += cost;
        *seller_account.portfolio.entry(market_key.to_string()).or_insert(0) -= quantity;
    }

    /// Apply one settlement liquidation trade. A long sold to the house is
    /// credited `terminal * qty`; a short buying back is debited the same,
    /// floored at zero like burn. The market slot is zeroed either way.
    pub fn apply_settlement_trade(
        &mut self,
        user: &str,
        market_key: &str,
        side: Side,
        quantity: i64,
        terminal: Price,
    ) {
        let amount = trade_cost(terminal, quantity);
        match side {
            Side::Sell => {
                let account = self.account_mut(user);
                account.available += amount;
                account.portfolio.insert(market_key.to_string(), 0);
                self.settlement_credited += amount;
            }
            Side::Buy => {
                let account = self.account_mut(user);
                let collected = amount.min(account.available);
                account.available -= collected;
                account.portfolio.insert(market_key.to_string(), 0);
                self.settlement_debited += collected;
            }
        }
    }

    pub fn total_minted(&self) -> Decimal {
        self.total_minted
    }

    pub fn total_burned(&self) -> Decimal {
        self.total_burned
    }

    pub fn settlement_credited(&self) -> Decimal {
        self.settlement_credited
    }

    pub fn settlement_debited(&self) -> Decimal {
        self.settlement_debited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(cents: i64) -> Price {
        Price::new(cents).unwrap()
    }

    #[test]
    fn walking_mints_a_cent_per_step() {
        let mut ledger = Ledger::new();
        let minted = ledger.mint_for_steps("alice", 1234);
        assert_eq!(minted, dec!(12.34));
        assert_eq!(ledger.account("alice").unwrap().available, dec!(12.34));
        assert_eq!(ledger.total_minted(), dec!(12.34));
    }

    #[test]
    fn doomscroll_tax_rounds_to_cents() {
        let mut ledger = Ledger::new();
        ledger.deposit("alice", dec!(100.00));

        // 7 minutes at $5/hour is $0.5833..., banker's-rounded to $0.58
        let burned = ledger.burn_for_scroll("alice", 7);
        assert_eq!(burned, dec!(0.58));
        assert_eq!(ledger.account("alice").unwrap().available, dec!(99.42));
    }

    #[test]
    fn burn_floors_at_zero() {
        let mut ledger = Ledger::new();
        ledger.deposit("bob", dec!(1.00));

        let burned = ledger.burn_for_scroll("bob", 600); // $50 tax
        assert_eq!(burned, dec!(1.00));
        assert_eq!(ledger.account("bob").unwrap().available, dec!(0.00));
        assert_eq!(ledger.total_burned(), dec!(1.00));
    }

    #[test]
    fn lock_moves_available_to_locked() {
        let mut ledger = Ledger::new();
        ledger.deposit("bob", dec!(10.00));

        ledger.lock_for_buy("bob", price(60), 10).unwrap();
        let bob = ledger.account("bob").unwrap();
        assert_eq!(bob.available, dec!(4.00));
        assert_eq!(bob.locked, dec!(6.00));
    }

    #[test]
    fn lock_rejects_insufficient_available() {
        let mut ledger = Ledger::new();
        ledger.deposit("bob", dec!(5.99));

        let err = ledger.lock_for_buy("bob", price(60), 10).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                needed: dec!(6.00),
                available: dec!(5.99),
            }
        );
        // nothing moved
        assert_eq!(ledger.account("bob").unwrap().available, dec!(5.99));
        assert_eq!(ledger.account("bob").unwrap().locked, dec!(0.00));
    }

    #[test]
    fn release_restores_the_lock() {
        let mut ledger = Ledger::new();
        ledger.deposit("bob", dec!(10.00));
        ledger.lock_for_buy("bob", price(40), 10).unwrap();

        ledger.release_lock("bob", 400);
        let bob = ledger.account("bob").unwrap();
        assert_eq!(bob.available, dec!(10.00));
        assert_eq!(bob.locked, dec!(0.00));
    }

    #[test]
    fn apply_trade_transfers_cash_and_contracts() {
        let mut ledger = Ledger::new();
        ledger.deposit("bob", dec!(10.00));
        ledger.lock_for_buy("bob", price(60), 10).unwrap();

        ledger.apply_trade("alice,480", "bob", "alice", price(60), 10);

        let bob = ledger.account("bob").unwrap();
        assert_eq!(bob.locked, dec!(0.00));
        assert_eq!(bob.portfolio["alice,480"], 10);

        let alice = ledger.account("alice").unwrap();
        assert_eq!(alice.available, dec!(6.00));
        assert_eq!(alice.portfolio["alice,480"], -10);
    }

    #[test]
    fn self_trade_releases_the_escrow() {
        let mut ledger = Ledger::new();
        ledger.deposit("bob", dec!(10.00));
        ledger.lock_for_buy("bob", price(50), 4).unwrap();

        ledger.apply_trade("alice,480", "bob", "bob", price(50), 4);

        let bob = ledger.account("bob").unwrap();
        assert_eq!(bob.available, dec!(10.00));
        assert_eq!(bob.locked, dec!(0.00));
        assert_eq!(bob.portfolio["alice,480"], 0);
    }

    #[test]
    fn settlement_credits_longs_and_debits_shorts() {
        let mut ledger = Ledger::new();
        ledger.deposit("bob", dec!(10.00));
        ledger.deposit("dave", dec!(10.00));
        ledger.lock_for_buy("bob", price(60), 10).unwrap();
        ledger.apply_trade("alice,480", "bob", "dave", price(60), 10);

        ledger.apply_settlement_trade("bob", "alice,480", Side::Sell, 10, Price::ONE);
        ledger.apply_settlement_trade("dave", "alice,480", Side::Buy, 10, Price::ONE);

        let bob = ledger.account("bob").unwrap();
        assert_eq!(bob.available, dec!(4.10));
        assert_eq!(bob.portfolio["alice,480"], 0);

        let dave = ledger.account("dave").unwrap();
        assert_eq!(dave.available, dec!(15.90));
        assert_eq!(dave.portfolio["alice,480"], 0);

        assert_eq!(ledger.settlement_credited(), dec!(0.10));
        assert_eq!(ledger.settlement_debited(), dec!(0.10));
    }

    #[test]
    fn settlement_at_zero_moves_no_cash() {
        let mut ledger = Ledger::new();
        ledger.deposit("bob", dec!(10.00));
        ledger.lock_for_buy("bob", price(60), 10).unwrap();
        ledger.apply_trade("alice,480", "bob", "dave", price(60), 10);

        ledger.apply_settlement_trade("bob", "alice,480", Side::Sell, 10, Price::ZERO);
        ledger.apply_settlement_trade("dave", "alice,480", Side::Buy, 10, Price::ZERO);

        assert_eq!(ledger.account("bob").unwrap().available, dec!(4.00));
        assert_eq!(ledger.account("dave").unwrap().available, dec!(6.00));
        assert_eq!(ledger.settlement_credited(), dec!(0.00));
    }

    #[test]
    fn restore_counts_loaded_wealth_as_minted() {
        let mut accounts = BTreeMap::new();
        accounts.insert(
            "alice".to_string(),
            Account {
                available: dec!(7.50),
                locked: dec!(2.50),
                portfolio: BTreeMap::new(),
            },
        );
        let ledger = Ledger::restore(accounts);
        assert_eq!(ledger.total_minted(), dec!(10.00));
        assert_eq!(ledger.total_burned(), dec!(0.00));
    }
}
