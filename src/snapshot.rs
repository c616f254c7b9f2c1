//! Persistent snapshot of the whole exchange.
//!
//! One JSON document with three top-level keys: `engine` (per-market
//! resting orders), `economy` (accounts with decimal-string balances), and
//! `mapper` (the external/internal id mapping). Every map is a `BTreeMap`
//! and every list is emitted in a canonical order, so dump -> load -> dump
//! is byte-identical. Order timestamps are preserved verbatim; FIFO
//! priority survives a reload.

use crate::book::Order;
use crate::coordinator::Coordinator;
use crate::engine::Engine;
use crate::ledger::{Account, Ledger};
use crate::mapper::UserIdMapper;
use crate::types::{MarketId, OrderId, Price, Side, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub engine: EngineState,
    pub economy: BTreeMap<String, AccountState>,
    pub mapper: MapperState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    pub markets: BTreeMap<String, MarketRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub name: String,
    pub bids: Vec<OrderRecord>,
    pub asks: Vec<OrderRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: u32,
    pub user_id: String,
    pub price: i64,
    pub qty: i64,
    pub side: Side,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub available: String,
    pub locked: String,
    pub portfolio: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperState {
    pub map: BTreeMap<String, u32>,
    pub next_id: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("malformed market key {0:?}, expected \"subject,threshold\"")]
    BadMarketKey(String),

    #[error("malformed decimal {0:?}")]
    BadDecimal(String),

    #[error("order {id} could not be restored into {market}: {reason}")]
    BadOrder {
        id: u32,
        market: String,
        reason: String,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Snapshot {
    /// Capture the current state. Settled markets are dropped: their
    /// orders are gone and their positions are zeroed, so nothing of them
    /// belongs in the next life of the process.
    pub fn capture(engine: &Engine, ledger: &Ledger, mapper: &UserIdMapper) -> Self {
        let mut markets = BTreeMap::new();
        for (market, book) in engine.books() {
            if !book.is_active() {
                continue;
            }
            let key = mapper
                .market_key(market)
                .expect("market subjects are minted through the mapper");
            let record = MarketRecord {
                name: engine.display_name(market),
                bids: order_records(book.side_orders(Side::Buy), mapper),
                asks: order_records(book.side_orders(Side::Sell), mapper),
            };
            markets.insert(key, record);
        }

        let economy = ledger
            .accounts()
            .map(|(user, account)| {
                (
                    user.clone(),
                    AccountState {
                        available: account.available.to_string(),
                        locked: account.locked.to_string(),
                        portfolio: account.portfolio.clone(),
                    },
                )
            })
            .collect();

        let mapper_state = MapperState {
            map: mapper.mappings().map(|(name, id)| (name.clone(), id.0)).collect(),
            next_id: mapper.next_id(),
        };

        Snapshot {
            engine: EngineState { markets },
            economy,
            mapper: mapper_state,
        }
    }

    /// Rebuild the exchange. Orders are rested in stored order with their
    /// original timestamps; open positions are reseeded into the books from
    /// the ledger portfolios so later settlement still finds them.
    pub fn restore(&self) -> Result<(Engine, Ledger, UserIdMapper), SnapshotError> {
        let mut mapper = UserIdMapper::restore(self.mapper.map.clone(), self.mapper.next_id);

        let mut accounts = BTreeMap::new();
        for (user, state) in &self.economy {
            accounts.insert(
                user.clone(),
                Account {
                    available: parse_decimal(&state.available)?,
                    locked: parse_decimal(&state.locked)?,
                    portfolio: state.portfolio.clone(),
                },
            );
        }
        let ledger = Ledger::restore(accounts);

        let mut engine = Engine::new();
        for (key, record) in &self.engine.markets {
            let market = parse_market_key(key, &mut mapper)?;
            engine.create_market(market, record.name.clone());
            for order in record.bids.iter().chain(record.asks.iter()) {
                let restored = restore_order(order, &mut mapper)?;
                engine
                    .restore_resting_order(market, restored)
                    .map_err(|err| SnapshotError::BadOrder {
                        id: order.id,
                        market: key.clone(),
                        reason: err.to_string(),
                    })?;
            }
        }

        // the snapshot keeps positions on the ledger side only
        for (user, account) in ledger.accounts() {
            for (key, &quantity) in &account.portfolio {
                if quantity == 0 {
                    continue;
                }
                let market = parse_market_key(key, &mut mapper)?;
                let user_id = mapper.to_internal(user);
                engine.restore_position(market, user_id, quantity);
            }
        }

        Ok((engine, ledger, mapper))
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Coordinator {
    pub fn dump_state(&self) -> Snapshot {
        Snapshot::capture(self.engine(), self.ledger(), self.mapper())
    }

    pub fn from_snapshot(snapshot: &Snapshot, audit_enabled: bool) -> Result<Self, SnapshotError> {
        let (engine, ledger, mapper) = snapshot.restore()?;
        Ok(Coordinator::from_parts(engine, ledger, mapper, audit_enabled))
    }
}

fn order_records(orders: Vec<&Order>, mapper: &UserIdMapper) -> Vec<OrderRecord> {
    orders
        .into_iter()
        .map(|order| OrderRecord {
            id: order.id.0,
            user_id: external_name(order.user, mapper),
            price: order.price.value(),
            qty: order.quantity,
            side: order.side,
            timestamp: order.timestamp.as_u64(),
        })
        .collect()
}

fn external_name(user: UserId, mapper: &UserIdMapper) -> String {
    mapper
        .to_external(user)
        .expect("internal ids are only minted by the mapper")
        .to_string()
}

fn parse_decimal(raw: &str) -> Result<Decimal, SnapshotError> {
    Decimal::from_str(raw).map_err(|_| SnapshotError::BadDecimal(raw.to_string()))
}

fn parse_market_key(key: &str, mapper: &mut UserIdMapper) -> Result<MarketId, SnapshotError> {
    let (subject, threshold) = key
        .rsplit_once(',')
        .ok_or_else(|| SnapshotError::BadMarketKey(key.to_string()))?;
    let threshold: u32 = threshold
        .parse()
        .map_err(|_| SnapshotError::BadMarketKey(key.to_string()))?;
    Ok(MarketId::new(mapper.to_internal(subject), threshold))
}

fn restore_order(record: &OrderRecord, mapper: &mut UserIdMapper) -> Result<Order, SnapshotError> {
    let price = Price::new(record.price).ok_or_else(|| SnapshotError::BadOrder {
        id: record.id,
        market: String::new(),
        reason: format!("non-positive price {}", record.price),
    })?;
    Ok(Order {
        id: OrderId(record.id),
        user: mapper.to_internal(&record.user_id),
        side: record.side,
        price,
        quantity: record.qty,
        timestamp: Timestamp(record.timestamp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Command;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    fn seeded() -> Coordinator {
        let mut c = Coordinator::new(true);
        c.deposit("alice", dec!(50.00));
        c.deposit("bob", dec!(50.00));

        c.execute(Command::PlaceOrder {
            subject: "alice".to_string(),
            threshold: 480,
            user: "alice".to_string(),
            side: Side::Sell,
            price_cents: 60,
            qty: 10,
            order_id: 1,
        })
        .unwrap();
        c.execute(Command::PlaceOrder {
            subject: "alice".to_string(),
            threshold: 480,
            user: "bob".to_string(),
            side: Side::Buy,
            price_cents: 60,
            qty: 4,
            order_id: 2,
        })
        .unwrap();
        c.execute(Command::PlaceOrder {
            subject: "alice".to_string(),
            threshold: 480,
            user: "bob".to_string(),
            side: Side::Buy,
            price_cents: 40,
            qty: 5,
            order_id: 3,
        })
        .unwrap();
        c
    }

    #[test]
    fn dump_load_dump_is_byte_identical() {
        let c = seeded();
        let first = c.dump_state().to_json().unwrap();

        let reloaded = Coordinator::from_snapshot(&Snapshot::from_json(&first).unwrap(), true).unwrap();
        let second = reloaded.dump_state().to_json().unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn reload_preserves_orders_positions_and_balances() {
        let c = seeded();
        let snapshot = c.dump_state();
        let mut reloaded = Coordinator::from_snapshot(&snapshot, true).unwrap();

        // the partially filled ask is still there with its remaining qty
        let info = reloaded.engine().order_info(OrderId(1)).unwrap();
        assert_eq!(info.price.value(), 60);

        // positions were reseeded into the book, so settlement still works
        let response = reloaded
            .execute(Command::Settle {
                subject: "alice".to_string(),
                observed_value: 500,
            })
            .unwrap();
        let crate::coordinator::Response::Settled { trades } = response else {
            panic!("expected Settled");
        };
        assert_eq!(trades.len(), 2);

        let bob = reloaded.ledger().account("bob").unwrap();
        assert_eq!(bob.portfolio["alice,480"], 0);
    }

    #[test]
    fn settled_markets_are_dropped_from_the_snapshot() {
        let mut c = seeded();
        c.execute(Command::Settle {
            subject: "alice".to_string(),
            observed_value: 0,
        })
        .unwrap();

        let snapshot = c.dump_state();
        assert!(snapshot.engine.markets.is_empty());
        // accounts survive
        assert!(snapshot.economy.contains_key("bob"));
    }
}
