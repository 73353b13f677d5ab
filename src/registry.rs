//! Association ↔ peer address maps of a multiplexed channel.
//!
//! The two maps are kept as exact inverses: an address maps to an
//! association exactly when it is in that association's address set.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::association::{AssocId, Association};

#[derive(Debug)]
struct Entry {
    association: Association,
    addresses: HashSet<SocketAddr>,
}

#[derive(Debug, Default)]
pub(crate) struct AssociationRegistry {
    entries: HashMap<AssocId, Entry>,
    by_address: HashMap<SocketAddr, AssocId>,
}

impl AssociationRegistry {
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, id: AssocId) -> Option<Association> {
        self.entries.get(&id).map(|e| e.association)
    }

    pub(crate) fn association_for(&self, address: &SocketAddr) -> Option<Association> {
        self.by_address.get(address).and_then(|id| self.get(*id))
    }

    pub(crate) fn addresses_of(&self, id: AssocId) -> Option<Vec<SocketAddr>> {
        self.entries.get(&id).map(|e| {
            let mut addrs: Vec<_> = e.addresses.iter().copied().collect();
            addrs.sort();
            addrs
        })
    }

    /// Snapshot ordered by id.
    pub(crate) fn associations(&self) -> Vec<Association> {
        let mut all: Vec<_> = self.entries.values().map(|e| e.association).collect();
        all.sort_by_key(Association::id);
        all
    }

    /// Register `association` with its peer addresses. An address that was
    /// mapped to another association moves to this one. Registering an id
    /// that is already present only merges addresses.
    pub(crate) fn insert(&mut self, association: Association, addresses: impl IntoIterator<Item = SocketAddr>) {
        let id = association.id();
        self.entries.entry(id).or_insert_with(|| Entry {
            association,
            addresses: HashSet::new(),
        });
        for address in addresses {
            self.add_address(id, address);
        }
    }

    /// Map `address` to the association `id`. Returns false if `id` is unknown.
    pub(crate) fn add_address(&mut self, id: AssocId, address: SocketAddr) -> bool {
        if !self.entries.contains_key(&id) {
            return false;
        }
        if let Some(previous) = self.by_address.insert(address, id) {
            if previous != id {
                if let Some(entry) = self.entries.get_mut(&previous) {
                    entry.addresses.remove(&address);
                }
            }
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.addresses.insert(address);
        }
        true
    }

    /// Drop `address` from association `id`, keeping at least one address.
    pub(crate) fn remove_address(&mut self, id: AssocId, address: &SocketAddr) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if entry.addresses.len() <= 1 || !entry.addresses.remove(address) {
            return false;
        }
        self.by_address.remove(address);
        true
    }

    /// Remove the association and every address mapped to it.
    pub(crate) fn remove(&mut self, id: AssocId) -> Option<(Association, Vec<SocketAddr>)> {
        let entry = self.entries.remove(&id)?;
        for address in &entry.addresses {
            self.by_address.remove(address);
        }
        Some((entry.association, entry.addresses.into_iter().collect()))
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let forward = self.entries.iter().all(|(id, e)| {
            e.association.id() == *id && e.addresses.iter().all(|a| self.by_address.get(a) == Some(id))
        });
        let backward = self.by_address.iter().all(|(a, id)| {
            self.entries.get(id).map(|e| e.addresses.contains(a)).unwrap_or(false)
        });
        forward && backward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut registry = AssociationRegistry::default();
        let a = Association::new(1, 10, 10);
        registry.insert(a, [addr(1, 5000), addr(2, 5000)]);

        assert_eq!(registry.association_for(&addr(1, 5000)), Some(a));
        assert_eq!(registry.association_for(&addr(2, 5000)), Some(a));
        assert_eq!(registry.addresses_of(1).unwrap().len(), 2);
        assert!(registry.is_consistent());

        let (removed, addrs) = registry.remove(1).unwrap();
        assert_eq!(removed, a);
        assert_eq!(addrs.len(), 2);
        assert_eq!(registry.association_for(&addr(1, 5000)), None);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_address_moves_between_associations() {
        let mut registry = AssociationRegistry::default();
        registry.insert(Association::new(1, 1, 1), [addr(1, 1), addr(2, 1)]);
        registry.insert(Association::new(2, 1, 1), [addr(2, 1)]);

        assert_eq!(registry.association_for(&addr(2, 1)).map(|a| a.id()), Some(2));
        assert_eq!(registry.addresses_of(1).unwrap(), vec![addr(1, 1)]);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_last_address_is_kept() {
        let mut registry = AssociationRegistry::default();
        registry.insert(Association::new(4, 1, 1), [addr(1, 1)]);
        assert!(!registry.remove_address(4, &addr(1, 1)));
        assert_eq!(registry.association_for(&addr(1, 1)).map(|a| a.id()), Some(4));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(AssocId, Vec<u8>),
        AddAddress(AssocId, u8),
        RemoveAddress(AssocId, u8),
        Remove(AssocId),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..6, prop::collection::vec(0u8..12, 0..4)).prop_map(|(id, a)| Op::Insert(id, a)),
            (0u32..6, 0u8..12).prop_map(|(id, a)| Op::AddAddress(id, a)),
            (0u32..6, 0u8..12).prop_map(|(id, a)| Op::RemoveAddress(id, a)),
            (0u32..6).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_maps_stay_inverse(ops in prop::collection::vec(op(), 0..64)) {
            let mut registry = AssociationRegistry::default();
            for op in ops {
                match op {
                    Op::Insert(id, addrs) => registry.insert(
                        Association::new(id, 2, 2),
                        addrs.into_iter().map(|a| addr(a, 9)),
                    ),
                    Op::AddAddress(id, a) => {
                        registry.add_address(id, addr(a, 9));
                    }
                    Op::RemoveAddress(id, a) => {
                        registry.remove_address(id, &addr(a, 9));
                    }
                    Op::Remove(id) => {
                        registry.remove(id);
                    }
                }
                prop_assert!(registry.is_consistent());
            }
        }
    }
}
