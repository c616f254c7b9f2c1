//! Snapshot round trips: byte identity, FIFO survival, and the on-disk
//! file format the server reads on boot.

use rust_decimal_macros::dec;
use screentime_core::coordinator::{Command, Coordinator, Response};
use screentime_core::snapshot::Snapshot;
use screentime_core::types::Side;
use std::io::Write;

fn place(subject: &str, user: &str, side: Side, price: i64, qty: i64, id: u32) -> Command {
    Command::PlaceOrder {
        subject: subject.to_string(),
        threshold: 480,
        user: user.to_string(),
        side,
        price_cents: price,
        qty,
        order_id: id,
    }
}

fn busy_exchange() -> Coordinator {
    let mut c = Coordinator::new(true);
    c.deposit("alice", dec!(25.00));
    c.deposit("bob", dec!(75.50));
    c.deposit("carol", dec!(10.00));

    c.execute(place("alice", "alice", Side::Sell, 60, 10, 1)).unwrap();
    c.execute(place("alice", "bob", Side::Buy, 60, 4, 2)).unwrap();
    c.execute(place("alice", "bob", Side::Buy, 40, 5, 3)).unwrap();
    c.execute(place("alice", "carol", Side::Buy, 40, 2, 4)).unwrap();
    c.execute(place("zoe", "carol", Side::Sell, 15, 6, 5)).unwrap();
    c.execute(Command::MintByActivity {
        user: "bob".to_string(),
        steps: 123,
    })
    .unwrap();
    c
}

#[test]
fn dump_load_dump_yields_identical_bytes() {
    let c = busy_exchange();
    let first = c.dump_state().to_json().unwrap();

    let snapshot = Snapshot::from_json(&first).unwrap();
    let reloaded = Coordinator::from_snapshot(&snapshot, true).unwrap();
    let second = reloaded.dump_state().to_json().unwrap();

    assert_eq!(first, second);

    // and a third generation, after real activity in between, still loads
    let mut third_gen = Coordinator::from_snapshot(&Snapshot::from_json(&second).unwrap(), true).unwrap();
    third_gen
        .execute(place("alice", "carol", Side::Buy, 41, 1, 6))
        .unwrap();
}

#[test]
fn fifo_priority_survives_a_reload() {
    let mut c = Coordinator::new(true);
    c.deposit("taker", dec!(50.00));

    // two makers queue at the same price, in this order
    c.execute(place("s", "first", Side::Sell, 50, 5, 1)).unwrap();
    c.execute(place("s", "second", Side::Sell, 50, 5, 2)).unwrap();

    let snapshot = c.dump_state();
    let mut reloaded = Coordinator::from_snapshot(&snapshot, true).unwrap();

    let Response::Placed { trades, .. } = reloaded
        .execute(place("s", "taker", Side::Buy, 50, 5, 3))
        .unwrap()
    else {
        panic!("expected Placed");
    };
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].seller, "first");
}

#[test]
fn timestamps_are_preserved_verbatim() {
    let mut c = Coordinator::new(true);
    c.execute(place("s", "a", Side::Sell, 50, 5, 1)).unwrap();
    c.execute(place("s", "b", Side::Sell, 50, 5, 2)).unwrap();

    let snapshot = c.dump_state();
    let market = &snapshot.engine.markets["s,480"];
    let stamps: Vec<u64> = market.asks.iter().map(|o| o.timestamp).collect();

    let reloaded = Coordinator::from_snapshot(&snapshot, true).unwrap();
    let again = reloaded.dump_state();
    let reloaded_stamps: Vec<u64> = again.engine.markets["s,480"]
        .asks
        .iter()
        .map(|o| o.timestamp)
        .collect();

    assert_eq!(stamps, reloaded_stamps);
    assert!(stamps[0] < stamps[1]);
}

#[test]
fn open_positions_survive_and_settle_after_reload() {
    let mut c = Coordinator::new(true);
    c.deposit("bob", dec!(10.00));

    c.execute(place("alice", "dave", Side::Sell, 60, 10, 1)).unwrap();
    c.execute(place("alice", "bob", Side::Buy, 60, 10, 2)).unwrap();

    let snapshot = c.dump_state();
    let mut reloaded = Coordinator::from_snapshot(&snapshot, true).unwrap();

    let Response::Settled { trades } = reloaded
        .execute(Command::Settle {
            subject: "alice".to_string(),
            observed_value: 999,
        })
        .unwrap()
    else {
        panic!("expected Settled");
    };
    assert_eq!(trades.len(), 2);

    let bob = reloaded.ledger().account("bob").unwrap();
    assert_eq!(bob.available, dec!(4.10));
    assert_eq!(bob.portfolio["alice,480"], 0);
}

#[test]
fn snapshot_file_round_trips_through_disk() {
    let c = busy_exchange();
    let json = c.dump_state().to_json().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exchange_state.json");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let read_back = std::fs::read_to_string(&path).unwrap();
    let reloaded = Coordinator::from_snapshot(&Snapshot::from_json(&read_back).unwrap(), true).unwrap();
    assert_eq!(reloaded.dump_state().to_json().unwrap(), json);
}

#[test]
fn mapper_state_round_trips() {
    let c = busy_exchange();
    let snapshot = c.dump_state();

    assert_eq!(snapshot.mapper.map["alice"], 1);
    assert!(snapshot.mapper.map.contains_key("zoe"));
    assert_eq!(snapshot.mapper.next_id as usize, snapshot.mapper.map.len() + 1);

    // reloaded mapper keeps minting above the persisted range
    let reloaded = Coordinator::from_snapshot(&snapshot, true).unwrap();
    assert_eq!(reloaded.mapper().next_id(), snapshot.mapper.next_id);
}
