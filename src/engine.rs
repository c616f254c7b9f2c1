//! Multi-market matching engine.
//!
//! Owns one [`Book`] per market plus the global order registry that makes
//! cancellation O(1) across markets: the registry maps a live order id to
//! the market it rests in, so a cancel goes straight to the owning book.

use crate::book::{Book, BookError, DepthLevel, Order, PlaceOutcome, Trade};
use crate::types::{MarketId, OrderId, Price, Side, Timestamp, UserId};
use std::collections::{BTreeMap, HashMap};

/// Registry entry for a live resting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderInfo {
    pub market: MarketId,
    pub side: Side,
    pub price: Price,
    pub user: UserId,
}

/// One row of the market listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketSummary {
    pub market: MarketId,
    pub name: String,
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
}

/// Settlement across every market of a subject: orders canceled out of the
/// books plus the synthetic liquidation trades, in market order.
#[derive(Debug, Clone, Default)]
pub struct SettleAllOutcome {
    pub canceled: Vec<(MarketId, Order)>,
    pub trades: Vec<Trade>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("order id {0:?} is already live")]
    DuplicateOrderId(OrderId),

    #[error("unknown order {0:?}")]
    UnknownOrder(OrderId),

    #[error(transparent)]
    Book(#[from] BookError),
}

#[derive(Debug, Default)]
pub struct Engine {
    books: BTreeMap<MarketId, Book>,
    names: BTreeMap<MarketId, String>,
    registry: HashMap<OrderId, OrderInfo>,
    next_timestamp: u64,
    trade_seq: u64,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_market(&self, market: MarketId) -> bool {
        self.books.contains_key(&market)
    }

    /// Create a market with a display name. Idempotent; an existing name is
    /// kept so reloaded names survive repeated calls.
    pub fn create_market(&mut self, market: MarketId, name: String) {
        self.books.entry(market).or_insert_with(|| Book::new(market));
        self.names.entry(market).or_insert(name);
    }

    /// Match then rest, stamping the order with a fresh logical timestamp.
    /// The registry picks up the resting remainder and drops any makers the
    /// match fully consumed.
    pub fn place(
        &mut self,
        market: MarketId,
        side: Side,
        price: Price,
        quantity: i64,
        order_id: OrderId,
        user: UserId,
    ) -> Result<PlaceOutcome, EngineError> {
        if self.registry.contains_key(&order_id) {
            return Err(EngineError::DuplicateOrderId(order_id));
        }

        self.next_timestamp += 1;
        let timestamp = Timestamp(self.next_timestamp);

        let book = self.books.entry(market).or_insert_with(|| Book::new(market));
        let outcome = book.place(side, price, quantity, order_id, user, timestamp, &mut self.trade_seq)?;

        for maker_id in &outcome.filled_makers {
            self.registry.remove(maker_id);
        }
        if outcome.resting_qty > 0 {
            self.registry.insert(
                order_id,
                OrderInfo {
                    market,
                    side,
                    price,
                    user,
                },
            );
        }

        Ok(outcome)
    }

    pub fn order_info(&self, order_id: OrderId) -> Option<&OrderInfo> {
        self.registry.get(&order_id)
    }

    /// O(1) cancel via the registry. Returns the market and the order as it
    /// rested, so the caller can release any locked funds.
    pub fn cancel(&mut self, order_id: OrderId) -> Result<(MarketId, Order), EngineError> {
        let info = self
            .registry
            .remove(&order_id)
            .ok_or(EngineError::UnknownOrder(order_id))?;
        let order = self
            .books
            .get_mut(&info.market)
            .and_then(|book| book.cancel(order_id))
            .ok_or(EngineError::UnknownOrder(order_id))?;
        Ok((info.market, order))
    }

    /// Settle every active market on the given subject. Each market resolves
    /// against its own threshold, so siblings can settle to different
    /// terminal prices.
    pub fn settle_all_for_subject(&mut self, subject: UserId, observed_value: u32) -> SettleAllOutcome {
        let markets: Vec<MarketId> = self
            .books
            .iter()
            .filter(|(id, book)| id.subject == subject && book.is_active())
            .map(|(&id, _)| id)
            .collect();

        let mut outcome = SettleAllOutcome::default();
        for market in markets {
            let terminal = if observed_value >= market.threshold {
                Price::ONE
            } else {
                Price::ZERO
            };
            let book = self
                .books
                .get_mut(&market)
                .expect("settling a market we just listed");
            let settled = book.settle(terminal, &mut self.trade_seq);
            for order in &settled.canceled {
                self.registry.remove(&order.id);
            }
            outcome
                .canceled
                .extend(settled.canceled.into_iter().map(|order| (market, order)));
            outcome.trades.extend(settled.trades);
        }
        outcome
    }

    /// Markets still accepting orders, in id order.
    pub fn list_active_markets(&self) -> Vec<MarketSummary> {
        self.books
            .iter()
            .filter(|(_, book)| book.is_active())
            .map(|(&market, book)| MarketSummary {
                market,
                name: self.display_name(market),
                best_bid: book.best_bid(),
                best_ask: book.best_ask(),
            })
            .collect()
    }

    pub fn display_name(&self, market: MarketId) -> String {
        self.names.get(&market).cloned().unwrap_or_else(|| {
            format!("market {}:{}", market.subject.0, market.threshold)
        })
    }

    pub fn depth(&self, market: MarketId) -> Option<(Vec<DepthLevel>, Vec<DepthLevel>)> {
        self.books.get(&market).map(Book::depth)
    }

    pub fn books(&self) -> impl Iterator<Item = (MarketId, &Book)> {
        self.books.iter().map(|(&id, book)| (id, book))
    }

    pub fn registry(&self) -> &HashMap<OrderId, OrderInfo> {
        &self.registry
    }

    /// Rest an order exactly as it appears in a snapshot, keeping its
    /// original timestamp so FIFO priority survives the reload.
    pub fn restore_resting_order(&mut self, market: MarketId, order: Order) -> Result<(), EngineError> {
        if self.registry.contains_key(&order.id) {
            return Err(EngineError::DuplicateOrderId(order.id));
        }
        let info = OrderInfo {
            market,
            side: order.side,
            price: order.price,
            user: order.user,
        };
        self.next_timestamp = self.next_timestamp.max(order.timestamp.as_u64());
        let book = self.books.entry(market).or_insert_with(|| Book::new(market));
        book.add_resting(order.clone())?;
        self.registry.insert(order.id, info);
        Ok(())
    }

    /// Reinstate an open position after a snapshot reload.
    pub fn restore_position(&mut self, market: MarketId, user: UserId, quantity: i64) {
        let book = self.books.entry(market).or_insert_with(|| Book::new(market));
        book.restore_position(user, quantity);
    }
}
