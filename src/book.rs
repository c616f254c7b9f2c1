//! Single-market order book with price-time priority matching.
//!
//! The level maps are the source of truth for which prices are live; the
//! heaps are only a hint and keep stale prices until a best-price walk pops
//! them (lazy deletion). Cancellation is O(1): the order arena is keyed by
//! id, and a dead id left behind in a level queue is skipped on the next
//! matching walk.

use crate::types::{MarketId, OrderId, Price, Side, Timestamp, UserId, HOUSE};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};

/// A resting order. Mutated only by decrementing `quantity` as it fills.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: OrderId,
    pub user: UserId,
    pub side: Side,
    pub price: Price,
    pub quantity: i64,
    pub timestamp: Timestamp,
}

/// Immutable record of a match. `price` is always the maker's price; the
/// settlement path reuses this shape with [`HOUSE`] as one counterparty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    pub market: MarketId,
    pub buyer: UserId,
    pub seller: UserId,
    pub price: Price,
    pub quantity: i64,
    pub taker_side: Side,
    pub seq: u64,
}

impl Trade {
    /// Settlement counterparty trades carry the house on exactly one side.
    pub fn is_settlement(&self) -> bool {
        self.buyer == HOUSE || self.seller == HOUSE
    }
}

/// Aggregated view of one price level, for snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DepthLevel {
    pub price: Price,
    pub qty: i64,
}

/// Outcome of placing an order: executed trades, the quantity left resting
/// on the book, and the maker ids that were fully consumed (the engine
/// drops those from its global registry).
#[derive(Debug, Clone)]
pub struct PlaceOutcome {
    pub trades: Vec<Trade>,
    pub resting_qty: i64,
    pub filled_makers: Vec<OrderId>,
}

/// Outcome of settling a market: every resting order comes back canceled,
/// followed by the synthetic liquidation trades against the house.
#[derive(Debug, Clone)]
pub struct SettleOutcome {
    pub canceled: Vec<Order>,
    pub trades: Vec<Trade>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookError {
    #[error("market is closed")]
    Inactive,

    #[error("order id {0:?} is already resting in this market")]
    DuplicateOrderId(OrderId),

    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(i64),
}

/// FIFO queue of order ids at one price. `volume` and `live` count only
/// orders still present in the arena; canceled ids linger in the queue.
#[derive(Debug, Default)]
struct Level {
    queue: VecDeque<OrderId>,
    volume: i64,
    live: usize,
}

#[derive(Debug)]
pub struct Book {
    market: MarketId,
    active: bool,
    orders: HashMap<OrderId, Order>,
    bids: HashMap<Price, Level>,
    asks: HashMap<Price, Level>,
    bids_heap: BinaryHeap<Price>,
    asks_heap: BinaryHeap<Reverse<Price>>,
    positions: BTreeMap<UserId, i64>,
}

impl Book {
    pub fn new(market: MarketId) -> Self {
        Self {
            market,
            active: true,
            orders: HashMap::new(),
            bids: HashMap::new(),
            asks: HashMap::new(),
            bids_heap: BinaryHeap::new(),
            asks_heap: BinaryHeap::new(),
            positions: BTreeMap::new(),
        }
    }

    pub fn market(&self) -> MarketId {
        self.market
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Highest live bid price. Reads the level map, not the heap, so it
    /// never observes a lazily-deleted price.
    pub fn best_bid(&self) -> Option<Price> {
        self.bids.keys().max().copied()
    }

    /// Lowest live ask price.
    pub fn best_ask(&self) -> Option<Price> {
        self.asks.keys().min().copied()
    }

    /// Match an incoming order, then rest any remainder.
    pub fn place(
        &mut self,
        side: Side,
        price: Price,
        quantity: i64,
        order_id: OrderId,
        user: UserId,
        timestamp: Timestamp,
        trade_seq: &mut u64,
    ) -> Result<PlaceOutcome, BookError> {
        if !self.active {
            return Err(BookError::Inactive);
        }
        if quantity <= 0 {
            return Err(BookError::NonPositiveQuantity(quantity));
        }
        if self.orders.contains_key(&order_id) {
            return Err(BookError::DuplicateOrderId(order_id));
        }

        let mut trades = Vec::new();
        let mut filled_makers = Vec::new();
        let mut remaining = quantity;

        while remaining > 0 {
            let best = match side {
                Side::Buy => self.front_ask(),
                Side::Sell => self.front_bid(),
            };
            let Some(best) = best else { break };
            let crosses = match side {
                Side::Buy => best <= price,
                Side::Sell => best >= price,
            };
            if !crosses {
                break;
            }

            let level = match side {
                Side::Buy => self.asks.get_mut(&best),
                Side::Sell => self.bids.get_mut(&best),
            }
            .expect("front price always maps to a live level");

            while remaining > 0 {
                let Some(&maker_id) = level.queue.front() else {
                    break;
                };
                let Some(maker) = self.orders.get_mut(&maker_id) else {
                    // canceled id left behind in the queue
                    level.queue.pop_front();
                    continue;
                };

                let traded = remaining.min(maker.quantity);
                maker.quantity -= traded;
                let maker_user = maker.user;
                let maker_done = maker.quantity == 0;

                remaining -= traded;
                level.volume -= traded;

                let (buyer, seller) = match side {
                    Side::Buy => (user, maker_user),
                    Side::Sell => (maker_user, user),
                };
                *trade_seq += 1;
                trades.push(Trade {
                    market: self.market,
                    buyer,
                    seller,
                    price: best,
                    quantity: traded,
                    taker_side: side,
                    seq: *trade_seq,
                });

                *self.positions.entry(buyer).or_insert(0) += traded;
                *self.positions.entry(seller).or_insert(0) -= traded;

                if maker_done {
                    self.orders.remove(&maker_id);
                    filled_makers.push(maker_id);
                    level.queue.pop_front();
                    level.live -= 1;
                }
            }

            if level.live == 0 {
                // the price stays in the heap; the level map is truth
                match side {
                    Side::Buy => self.asks.remove(&best),
                    Side::Sell => self.bids.remove(&best),
                };
            }
        }

        let resting_qty = remaining;
        if resting_qty > 0 {
            self.rest(Order {
                id: order_id,
                user,
                side,
                price,
                quantity: resting_qty,
                timestamp,
            });
        }

        Ok(PlaceOutcome {
            trades,
            resting_qty,
            filled_makers,
        })
    }

    /// Rest an order without matching. Used by the snapshot loader, which
    /// replays orders that were already matched when first placed.
    pub fn add_resting(&mut self, order: Order) -> Result<(), BookError> {
        if !self.active {
            return Err(BookError::Inactive);
        }
        if order.quantity <= 0 {
            return Err(BookError::NonPositiveQuantity(order.quantity));
        }
        if self.orders.contains_key(&order.id) {
            return Err(BookError::DuplicateOrderId(order.id));
        }
        self.rest(order);
        Ok(())
    }

    fn rest(&mut self, order: Order) {
        match order.side {
            Side::Buy => {
                let level = self.bids.entry(order.price).or_insert_with(|| {
                    self.bids_heap.push(order.price);
                    Level::default()
                });
                level.queue.push_back(order.id);
                level.volume += order.quantity;
                level.live += 1;
            }
            Side::Sell => {
                let level = self.asks.entry(order.price).or_insert_with(|| {
                    self.asks_heap.push(Reverse(order.price));
                    Level::default()
                });
                level.queue.push_back(order.id);
                level.volume += order.quantity;
                level.live += 1;
            }
        }
        self.orders.insert(order.id, order);
    }

    /// O(1) cancel. The id is dropped from the arena and the level counters
    /// are adjusted; the queue entry is skipped lazily by later walks.
    pub fn cancel(&mut self, order_id: OrderId) -> Option<Order> {
        let order = self.orders.remove(&order_id)?;
        let levels = match order.side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        if let Some(level) = levels.get_mut(&order.price) {
            level.volume -= order.quantity;
            level.live -= 1;
            if level.live == 0 {
                levels.remove(&order.price);
            }
        }
        Some(order)
    }

    /// Close the market: cancel every resting order, then liquidate every
    /// open position against the house at the terminal price. Longs sell to
    /// the house, shorts buy from it.
    pub fn settle(&mut self, terminal: Price, trade_seq: &mut u64) -> SettleOutcome {
        self.active = false;

        let mut ids: Vec<OrderId> = self.orders.keys().copied().collect();
        ids.sort();
        let canceled: Vec<Order> = ids.into_iter().filter_map(|id| self.cancel(id)).collect();

        let mut trades = Vec::new();
        for (&user, position) in self.positions.iter_mut() {
            let p = *position;
            if p == 0 {
                continue;
            }
            let (buyer, seller, taker_side, quantity) = if p > 0 {
                (HOUSE, user, Side::Sell, p)
            } else {
                (user, HOUSE, Side::Buy, -p)
            };
            *trade_seq += 1;
            trades.push(Trade {
                market: self.market,
                buyer,
                seller,
                price: terminal,
                quantity,
                taker_side,
                seq: *trade_seq,
            });
            *position = 0;
        }

        SettleOutcome { canceled, trades }
    }

    /// Aggregated depth: bids highest-first, asks lowest-first.
    pub fn depth(&self) -> (Vec<DepthLevel>, Vec<DepthLevel>) {
        let mut bids: Vec<DepthLevel> = self
            .bids
            .iter()
            .map(|(&price, level)| DepthLevel {
                price,
                qty: level.volume,
            })
            .collect();
        bids.sort_by(|a, b| b.price.cmp(&a.price));

        let mut asks: Vec<DepthLevel> = self
            .asks
            .iter()
            .map(|(&price, level)| DepthLevel {
                price,
                qty: level.volume,
            })
            .collect();
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        (bids, asks)
    }

    /// Live resting orders of one side in match order: best price first,
    /// FIFO within a price. Used by the snapshot writer and by audits.
    pub fn side_orders(&self, side: Side) -> Vec<&Order> {
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        let mut prices: Vec<Price> = levels.keys().copied().collect();
        match side {
            Side::Buy => prices.sort_by(|a, b| b.cmp(a)),
            Side::Sell => prices.sort(),
        }

        let mut orders = Vec::new();
        for price in prices {
            for id in &levels[&price].queue {
                if let Some(order) = self.orders.get(id) {
                    orders.push(order);
                }
            }
        }
        orders
    }

    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    pub fn order_ids(&self) -> impl Iterator<Item = OrderId> + '_ {
        self.orders.keys().copied()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn positions(&self) -> &BTreeMap<UserId, i64> {
        &self.positions
    }

    /// Reinstate a position after a snapshot reload. The snapshot stores
    /// positions on the ledger side only; the loader pushes them back here
    /// so settlement keeps working across restarts.
    pub(crate) fn restore_position(&mut self, user: UserId, quantity: i64) {
        self.positions.insert(user, quantity);
    }

    /// Pop-peek the ask heap until the top price is live in the level map.
    fn front_ask(&mut self) -> Option<Price> {
        while let Some(&Reverse(price)) = self.asks_heap.peek() {
            if self.asks.contains_key(&price) {
                return Some(price);
            }
            self.asks_heap.pop();
        }
        None
    }

    fn front_bid(&mut self) -> Option<Price> {
        while let Some(&price) = self.bids_heap.peek() {
            if self.bids.contains_key(&price) {
                return Some(price);
            }
            self.bids_heap.pop();
        }
        None
    }
}
