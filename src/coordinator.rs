//! Command dispatcher.
//!
//! The coordinator is the only component that mutates more than one
//! subsystem: every command runs lock -> match -> apply -> refund -> audit
//! as one uninterrupted step. Funds are escrowed before the engine sees a
//! buy order, price-improvement refunds land before the trade is applied,
//! and the auditor runs after every mutation. If the auditor ever fails,
//! in-memory state is poisoned and the coordinator refuses all further
//! commands until state is reloaded from a snapshot.

use crate::audit;
use crate::book::{DepthLevel, Trade};
use crate::engine::{Engine, EngineError};
use crate::ledger::{Ledger, LedgerError};
use crate::mapper::UserIdMapper;
use crate::types::{MarketId, OrderId, Price, Side, UserId, HOUSE};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

/// A fully-typed request, already parsed off the wire. Identities are
/// still external strings; the coordinator owns the translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PlaceOrder {
        subject: String,
        threshold: u32,
        user: String,
        side: Side,
        price_cents: i64,
        qty: i64,
        order_id: u32,
    },
    CancelOrder {
        order_id: u32,
        user: String,
    },
    Settle {
        subject: String,
        observed_value: u32,
    },
    GetMarkets,
    GetSnapshot {
        subject: String,
        threshold: u32,
    },
    GetBalance {
        user: String,
    },
    MintByActivity {
        user: String,
        steps: u64,
    },
    BurnByUsage {
        user: String,
        minutes: u64,
    },
}

impl Command {
    /// Whether a successful run can have changed state. The server only
    /// snapshots after these.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Command::PlaceOrder { .. }
                | Command::CancelOrder { .. }
                | Command::Settle { .. }
                | Command::MintByActivity { .. }
                | Command::BurnByUsage { .. }
        )
    }
}

/// A trade as reported back to clients: external names, integer cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeView {
    pub market_id: String,
    pub buyer: String,
    pub seller: String,
    pub price: i64,
    pub qty: i64,
    pub taker_side: Side,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketView {
    pub id: String,
    pub name: String,
    pub best_bid: Option<i64>,
    pub best_ask: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Placed {
        trades: Vec<TradeView>,
        resting_qty: i64,
    },
    Canceled {
        refunded: Decimal,
    },
    Settled {
        trades: Vec<TradeView>,
    },
    Markets(Vec<MarketView>),
    Depth {
        bids: Vec<DepthLevel>,
        asks: Vec<DepthLevel>,
    },
    Balance {
        available: Decimal,
        locked: Decimal,
        positions: BTreeMap<String, i64>,
    },
    Minted(Decimal),
    Burned(Decimal),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("duplicate order id {0}")]
    DuplicateOrderId(u32),

    #[error("market {0} is settled and no longer accepts orders")]
    InactiveMarket(String),

    #[error("insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("unknown order {0}")]
    UnknownOrder(u32),

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolated(String),
}

impl CoordinatorError {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::InvalidArgument(_) => "invalid_argument",
            CoordinatorError::DuplicateOrderId(_) => "duplicate_order_id",
            CoordinatorError::InactiveMarket(_) => "inactive_market",
            CoordinatorError::InsufficientFunds { .. } => "insufficient_funds",
            CoordinatorError::UnknownOrder(_) => "unknown_order",
            CoordinatorError::InternalInvariantViolated(_) => "internal_invariant_violated",
        }
    }
}

#[derive(Debug)]
pub struct Coordinator {
    engine: Engine,
    ledger: Ledger,
    mapper: UserIdMapper,
    audit_enabled: bool,
    poisoned: bool,
}

impl Coordinator {
    pub fn new(audit_enabled: bool) -> Self {
        Self::from_parts(Engine::new(), Ledger::new(), UserIdMapper::new(), audit_enabled)
    }

    pub fn from_parts(engine: Engine, ledger: Ledger, mapper: UserIdMapper, audit_enabled: bool) -> Self {
        Self {
            engine,
            ledger,
            mapper,
            audit_enabled,
            poisoned: false,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn mapper(&self) -> &UserIdMapper {
        &self.mapper
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Seed an account directly. Testing and provisioning only; counts as
    /// minted cash like any other credit.
    pub fn deposit(&mut self, user: &str, amount: Decimal) {
        self.ledger.deposit(user, amount);
    }

    pub fn execute(&mut self, command: Command) -> Result<Response, CoordinatorError> {
        if self.poisoned {
            return Err(CoordinatorError::InternalInvariantViolated(
                "state poisoned by an earlier audit failure; reload from a snapshot".to_string(),
            ));
        }

        match command {
            Command::PlaceOrder {
                subject,
                threshold,
                user,
                side,
                price_cents,
                qty,
                order_id,
            } => self.handle_place(subject, threshold, user, side, price_cents, qty, order_id),
            Command::CancelOrder { order_id, user } => self.handle_cancel(order_id, user),
            Command::Settle {
                subject,
                observed_value,
            } => self.handle_settle(subject, observed_value),
            Command::GetMarkets => Ok(self.handle_get_markets()),
            Command::GetSnapshot { subject, threshold } => self.handle_get_snapshot(subject, threshold),
            Command::GetBalance { user } => Ok(self.handle_balance(user)),
            Command::MintByActivity { user, steps } => {
                let minted = self.ledger.mint_for_steps(&user, steps);
                tracing::debug!(user = %user, steps, %minted, "proof of walk");
                self.run_audit()?;
                Ok(Response::Minted(minted))
            }
            Command::BurnByUsage { user, minutes } => {
                let burned = self.ledger.burn_for_scroll(&user, minutes);
                tracing::debug!(user = %user, minutes, %burned, "doomscroll burn");
                self.run_audit()?;
                Ok(Response::Burned(burned))
            }
        }
    }

    /// The hardest path: escrow, match, transfer, refund, audit.
    fn handle_place(
        &mut self,
        subject: String,
        threshold: u32,
        user: String,
        side: Side,
        price_cents: i64,
        qty: i64,
        order_id: u32,
    ) -> Result<Response, CoordinatorError> {
        let price = Price::new(price_cents)
            .ok_or_else(|| CoordinatorError::InvalidArgument(format!("price must be positive, got {price_cents}")))?;
        if qty <= 0 {
            return Err(CoordinatorError::InvalidArgument(format!(
                "quantity must be positive, got {qty}"
            )));
        }

        let subject_id = self.mapper.to_internal(&subject);
        let user_id = self.mapper.to_internal(&user);
        let market = MarketId::new(subject_id, threshold);
        let market_key = format!("{subject},{threshold}");

        if !self.engine.has_market(market) {
            let name = format!("{} screen time over {}:{:02}", subject, threshold / 60, threshold % 60);
            self.engine.create_market(market, name);
        }

        // escrow before the engine sees the order; a refused lock must not
        // touch the book
        if side == Side::Buy {
            self.ledger
                .lock_for_buy(&user, price, qty)
                .map_err(|LedgerError::InsufficientFunds { needed, available }| {
                    CoordinatorError::InsufficientFunds { needed, available }
                })?;
        }

        let outcome = match self.engine.place(market, side, price, qty, OrderId(order_id), user_id) {
            Ok(outcome) => outcome,
            Err(err) => {
                if side == Side::Buy {
                    self.ledger.release_lock(&user, price.value() * qty);
                }
                return Err(match err {
                    EngineError::DuplicateOrderId(id) => CoordinatorError::DuplicateOrderId(id.0),
                    EngineError::Book(crate::book::BookError::Inactive) => {
                        CoordinatorError::InactiveMarket(market_key)
                    }
                    EngineError::Book(crate::book::BookError::DuplicateOrderId(id)) => {
                        CoordinatorError::DuplicateOrderId(id.0)
                    }
                    EngineError::Book(crate::book::BookError::NonPositiveQuantity(q)) => {
                        CoordinatorError::InvalidArgument(format!("quantity must be positive, got {q}"))
                    }
                    EngineError::UnknownOrder(id) => {
                        CoordinatorError::InvalidArgument(format!("unexpected unknown order {}", id.0))
                    }
                });
            }
        };

        for trade in &outcome.trades {
            // a buy taker filled below its limit gets the difference back
            // before the trade consumes the rest of the escrow
            if side == Side::Buy && trade.price < price {
                let improvement = (price.value() - trade.price.value()) * trade.quantity;
                self.ledger.release_lock(&user, improvement);
            }
            let buyer = self.external_name(trade.buyer);
            let seller = self.external_name(trade.seller);
            self.ledger
                .apply_trade(&market_key, &buyer, &seller, trade.price, trade.quantity);
        }

        tracing::info!(
            market = %market_key,
            user = %user,
            %side,
            price = price_cents,
            qty,
            trades = outcome.trades.len(),
            resting = outcome.resting_qty,
            "order placed"
        );

        self.run_audit()?;

        let trades = outcome
            .trades
            .iter()
            .map(|trade| self.trade_view(trade))
            .collect();
        Ok(Response::Placed {
            trades,
            resting_qty: outcome.resting_qty,
        })
    }

    fn handle_cancel(&mut self, order_id: u32, user: String) -> Result<Response, CoordinatorError> {
        let id = OrderId(order_id);
        let owner = self
            .engine
            .order_info(id)
            .map(|info| info.user)
            .ok_or(CoordinatorError::UnknownOrder(order_id))?;
        // only the owner may cancel; everyone else sees the same answer as
        // for an id that does not exist
        if self.mapper.get(&user) != Some(owner) {
            return Err(CoordinatorError::UnknownOrder(order_id));
        }

        let (market, order) = self
            .engine
            .cancel(id)
            .map_err(|_| CoordinatorError::UnknownOrder(order_id))?;

        let refunded = if order.side == Side::Buy {
            let cents = order.price.value() * order.quantity;
            self.ledger.release_lock(&user, cents);
            crate::types::cents_to_dollars(cents)
        } else {
            Decimal::ZERO
        };

        tracing::info!(
            market = ?market,
            user = %user,
            order = order_id,
            %refunded,
            "order canceled"
        );

        self.run_audit()?;
        Ok(Response::Canceled { refunded })
    }

    fn handle_settle(&mut self, subject: String, observed_value: u32) -> Result<Response, CoordinatorError> {
        // an unknown subject has no markets; settling it is a no-op
        let Some(subject_id) = self.mapper.get(&subject) else {
            return Ok(Response::Settled { trades: Vec::new() });
        };

        let outcome = self.engine.settle_all_for_subject(subject_id, observed_value);

        // resting orders die with the market; buy escrow goes home
        for (_, order) in &outcome.canceled {
            if order.side == Side::Buy {
                let owner = self.external_name(order.user);
                self.ledger
                    .release_lock(&owner, order.price.value() * order.quantity);
            }
        }

        for trade in &outcome.trades {
            let (user, side) = if trade.seller == HOUSE {
                (trade.buyer, Side::Buy)
            } else {
                (trade.seller, Side::Sell)
            };
            let name = self.external_name(user);
            let key = self
                .mapper
                .market_key(trade.market)
                .unwrap_or_else(|| format!("{},{}", trade.market.subject.0, trade.market.threshold));
            self.ledger
                .apply_settlement_trade(&name, &key, side, trade.quantity, trade.price);
        }

        tracing::info!(
            subject = %subject,
            observed_value,
            canceled = outcome.canceled.len(),
            trades = outcome.trades.len(),
            "settled"
        );

        self.run_audit()?;

        let trades = outcome
            .trades
            .iter()
            .map(|trade| self.trade_view(trade))
            .collect();
        Ok(Response::Settled { trades })
    }

    fn handle_get_markets(&self) -> Response {
        let markets = self
            .engine
            .list_active_markets()
            .into_iter()
            .map(|summary| MarketView {
                id: self
                    .mapper
                    .market_key(summary.market)
                    .unwrap_or_else(|| format!("{},{}", summary.market.subject.0, summary.market.threshold)),
                name: summary.name,
                best_bid: summary.best_bid.map(|p| p.value()),
                best_ask: summary.best_ask.map(|p| p.value()),
            })
            .collect();
        Response::Markets(markets)
    }

    fn handle_get_snapshot(&self, subject: String, threshold: u32) -> Result<Response, CoordinatorError> {
        let market = self
            .mapper
            .get(&subject)
            .map(|id| MarketId::new(id, threshold))
            .filter(|&market| self.engine.has_market(market))
            .ok_or_else(|| {
                CoordinatorError::InvalidArgument(format!("unknown market {subject},{threshold}"))
            })?;
        let (bids, asks) = self
            .engine
            .depth(market)
            .expect("market existence checked above");
        Ok(Response::Depth { bids, asks })
    }

    fn handle_balance(&self, user: String) -> Response {
        match self.ledger.account(&user) {
            Some(account) => Response::Balance {
                available: account.available,
                locked: account.locked,
                positions: account.portfolio.clone(),
            },
            None => Response::Balance {
                available: Decimal::ZERO,
                locked: Decimal::ZERO,
                positions: BTreeMap::new(),
            },
        }
    }

    fn run_audit(&mut self) -> Result<(), CoordinatorError> {
        if !self.audit_enabled {
            return Ok(());
        }
        if let Err(err) = audit::run_audit(&self.engine, &self.ledger, &self.mapper) {
            self.poisoned = true;
            tracing::error!(error = %err, "audit failed after mutation; refusing further commands");
            return Err(CoordinatorError::InternalInvariantViolated(err.to_string()));
        }
        Ok(())
    }

    fn external_name(&self, user: UserId) -> String {
        if user == HOUSE {
            return "house".to_string();
        }
        self.mapper
            .to_external(user)
            .expect("internal ids are only minted by the mapper")
            .to_string()
    }

    fn trade_view(&self, trade: &Trade) -> TradeView {
        TradeView {
            market_id: self
                .mapper
                .market_key(trade.market)
                .unwrap_or_else(|| format!("{},{}", trade.market.subject.0, trade.market.threshold)),
            buyer: self.external_name(trade.buyer),
            seller: self.external_name(trade.seller),
            price: trade.price.value(),
            qty: trade.quantity,
            taker_side: trade.taker_side,
            seq: trade.seq,
        }
    }
}
