//! External string identities <-> internal integer ids.
//!
//! The engine and books only ever see small integers; the wire and the
//! ledger speak strings. The mapping is minted once per identity, grows
//! monotonically, and persists in the snapshot.

use crate::types::{MarketId, UserId};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
pub struct UserIdMapper {
    forward: BTreeMap<String, UserId>,
    reverse: HashMap<UserId, String>,
    next_id: u32,
}

impl Default for UserIdMapper {
    fn default() -> Self {
        // id 0 is reserved for the house
        Self {
            forward: BTreeMap::new(),
            reverse: HashMap::new(),
            next_id: 1,
        }
    }
}

impl UserIdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map an external identity to its internal id, minting one on first
    /// use.
    pub fn to_internal(&mut self, external: &str) -> UserId {
        if let Some(&id) = self.forward.get(external) {
            return id;
        }
        let id = UserId(self.next_id);
        self.next_id += 1;
        self.forward.insert(external.to_string(), id);
        self.reverse.insert(id, external.to_string());
        id
    }

    /// Look up without minting. Read paths use this so queries for unknown
    /// identities do not grow the mapping.
    pub fn get(&self, external: &str) -> Option<UserId> {
        self.forward.get(external).copied()
    }

    pub fn to_external(&self, internal: UserId) -> Option<&str> {
        self.reverse.get(&internal).map(String::as_str)
    }

    /// Wire/ledger key for a market: `"<subject>,<threshold>"` with the
    /// external subject string.
    pub fn market_key(&self, market: MarketId) -> Option<String> {
        Some(format!("{},{}", self.to_external(market.subject)?, market.threshold))
    }

    pub fn mappings(&self) -> impl Iterator<Item = (&String, UserId)> {
        self.forward.iter().map(|(name, &id)| (name, id))
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Rebuild from a snapshot, recomputing the reverse map.
    pub fn restore(map: BTreeMap<String, u32>, next_id: u32) -> Self {
        let mut highest = 0;
        let mut forward = BTreeMap::new();
        let mut reverse = HashMap::new();
        for (name, raw) in map {
            highest = highest.max(raw);
            forward.insert(name.clone(), UserId(raw));
            reverse.insert(UserId(raw), name);
        }
        Self {
            forward,
            reverse,
            next_id: next_id.max(highest + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_per_identity() {
        let mut mapper = UserIdMapper::new();
        let alice = mapper.to_internal("alice");
        let bob = mapper.to_internal("bob");

        assert_ne!(alice, bob);
        assert_eq!(mapper.to_internal("alice"), alice);
        assert_eq!(mapper.to_external(alice), Some("alice"));
        assert_eq!(mapper.get("carol"), None);
    }

    #[test]
    fn house_id_is_never_minted() {
        let mut mapper = UserIdMapper::new();
        let first = mapper.to_internal("alice");
        assert_eq!(first, UserId(1));
    }

    #[test]
    fn market_key_uses_external_subject() {
        let mut mapper = UserIdMapper::new();
        let alice = mapper.to_internal("alice");
        let market = MarketId::new(alice, 480);
        assert_eq!(mapper.market_key(market).unwrap(), "alice,480");
    }

    #[test]
    fn restore_round_trips() {
        let mut mapper = UserIdMapper::new();
        mapper.to_internal("alice");
        mapper.to_internal("bob");

        let map: BTreeMap<String, u32> = mapper.mappings().map(|(n, id)| (n.clone(), id.0)).collect();
        let restored = UserIdMapper::restore(map, mapper.next_id());

        assert_eq!(restored.get("alice"), Some(UserId(1)));
        assert_eq!(restored.to_external(UserId(2)), Some("bob"));

        let mut restored = restored;
        assert_eq!(restored.to_internal("carol"), UserId(3));
    }
}
