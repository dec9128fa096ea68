use std::fmt::{Debug, Display, Formatter};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::transport::PeerId;


/// Server-assigned handle of an established connection. Ids are allocated from a counter and
///  are not reused while the peer they were assigned to is still mapped.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(pub u32);

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[conn:{}]", self.0)
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}


#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum IdentityMapError {
    #[error("identity map is at capacity")]
    CapacityExceeded,
    #[error("peer {0:?} is already mapped")]
    DuplicatePeer(PeerId),
    #[error("connection id {0:?} is already mapped")]
    DuplicateId(ConnectionId),
}


/// Bijection between the peers that completed the handshake and their connection ids, with
///  an upper bound on the number of entries. Insertion beyond the bound fails, nothing is
///  ever evicted.
///
/// NB: There is no internal locking. The owner keeps the map behind its own lock.
pub struct IdentityMap {
    max_entries: usize,
    by_peer: FxHashMap<PeerId, ConnectionId>,
    by_id: FxHashMap<ConnectionId, PeerId>,
}
impl IdentityMap {
    pub fn new(max_entries: usize) -> IdentityMap {
        IdentityMap {
            max_entries,
            by_peer: Default::default(),
            by_id: Default::default(),
        }
    }

    pub fn insert(&mut self, peer: PeerId, id: ConnectionId) -> Result<(), IdentityMapError> {
        if self.is_full() {
            return Err(IdentityMapError::CapacityExceeded);
        }
        if self.by_peer.contains_key(&peer) {
            return Err(IdentityMapError::DuplicatePeer(peer));
        }
        if self.by_id.contains_key(&id) {
            return Err(IdentityMapError::DuplicateId(id));
        }

        self.by_peer.insert(peer, id);
        self.by_id.insert(id, peer);
        Ok(())
    }

    pub fn remove_peer(&mut self, peer: PeerId) -> Option<ConnectionId> {
        let id = self.by_peer.remove(&peer)?;
        self.by_id.remove(&id);
        Some(id)
    }

    pub fn remove_id(&mut self, id: ConnectionId) -> Option<PeerId> {
        let peer = self.by_id.remove(&id)?;
        self.by_peer.remove(&peer);
        Some(peer)
    }

    pub fn lookup_peer(&self, peer: PeerId) -> Option<ConnectionId> {
        self.by_peer.get(&peer).copied()
    }

    pub fn lookup_id(&self, id: ConnectionId) -> Option<PeerId> {
        self.by_id.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_entries
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, ConnectionId)> + '_ {
        self.by_peer.iter()
            .map(|(peer, id)| (*peer, *id))
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.by_id.keys().copied()
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Insert(u64, u32),
        RemovePeer(u64),
        RemoveId(u32),
    }

    fn assert_bijective(map: &IdentityMap) {
        assert_eq!(map.by_peer.len(), map.by_id.len());
        for (peer, id) in map.iter() {
            assert_eq!(map.lookup_id(id), Some(peer));
            assert_eq!(map.lookup_peer(peer), Some(id));
        }
        assert!(map.len() <= map.capacity());
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut map = IdentityMap::new(4);
        assert!(map.is_empty());

        map.insert(PeerId(10), ConnectionId(1)).unwrap();
        map.insert(PeerId(20), ConnectionId(2)).unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.lookup_peer(PeerId(10)), Some(ConnectionId(1)));
        assert_eq!(map.lookup_id(ConnectionId(2)), Some(PeerId(20)));
        assert_eq!(map.lookup_peer(PeerId(30)), None);
        assert_eq!(map.lookup_id(ConnectionId(3)), None);
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let mut map = IdentityMap::new(4);
        map.insert(PeerId(10), ConnectionId(1)).unwrap();

        assert_eq!(map.insert(PeerId(10), ConnectionId(2)), Err(IdentityMapError::DuplicatePeer(PeerId(10))));
        assert_eq!(map.insert(PeerId(11), ConnectionId(1)), Err(IdentityMapError::DuplicateId(ConnectionId(1))));
        assert_eq!(map.len(), 1);
        assert_bijective(&map);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let mut map = IdentityMap::new(2);
        map.insert(PeerId(1), ConnectionId(1)).unwrap();
        map.insert(PeerId(2), ConnectionId(2)).unwrap();
        assert!(map.is_full());

        assert_eq!(map.insert(PeerId(3), ConnectionId(3)), Err(IdentityMapError::CapacityExceeded));
        assert_eq!(map.lookup_peer(PeerId(1)), Some(ConnectionId(1)));

        map.remove_peer(PeerId(1));
        map.insert(PeerId(3), ConnectionId(3)).unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut map = IdentityMap::new(2);
        map.insert(PeerId(1), ConnectionId(7)).unwrap();

        assert_eq!(map.remove_id(ConnectionId(7)), Some(PeerId(1)));
        assert_eq!(map.remove_id(ConnectionId(7)), None);
        assert_eq!(map.remove_peer(PeerId(1)), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_bijection_holds_under_random_operations() {
        let mut map = IdentityMap::new(8);
        for _ in 0..10_000 {
            let peer = PeerId(rand::random::<u64>() % 16);
            let id = ConnectionId(rand::random::<u32>() % 16);

            match rand::random::<u8>() % 3 {
                0 => {
                    let before = map.len();
                    if map.insert(peer, id).is_err() {
                        assert_eq!(map.len(), before);
                    }
                }
                1 => { map.remove_peer(peer); }
                _ => { map.remove_id(id); }
            }
            assert_bijective(&map);
        }
    }

    #[rstest]
    #[case::insert_remove_reinsert(vec![Op::Insert(1, 1), Op::RemovePeer(1), Op::Insert(1, 2), Op::Insert(2, 1)])]
    #[case::colliding_ids(vec![Op::Insert(1, 1), Op::Insert(2, 1), Op::Insert(2, 2), Op::RemoveId(1), Op::Insert(3, 1)])]
    #[case::over_capacity(vec![Op::Insert(1, 1), Op::Insert(2, 2), Op::Insert(3, 3), Op::Insert(4, 4), Op::RemoveId(2), Op::Insert(4, 4)])]
    #[case::removing_unknown(vec![Op::RemovePeer(5), Op::RemoveId(5), Op::Insert(5, 5), Op::RemovePeer(6), Op::RemoveId(6)])]
    #[case::churn(vec![Op::Insert(1, 1), Op::Insert(2, 2), Op::Insert(3, 3), Op::RemovePeer(2), Op::RemoveId(1), Op::Insert(2, 1), Op::Insert(1, 2), Op::RemovePeer(3), Op::Insert(3, 3)])]
    fn test_bijection_holds_under_any_sequence(#[case] ops: Vec<Op>) {
        let mut map = IdentityMap::new(3);
        for op in ops {
            match op {
                Op::Insert(peer, id) => { let _ = map.insert(PeerId(peer), ConnectionId(id)); }
                Op::RemovePeer(peer) => { map.remove_peer(PeerId(peer)); }
                Op::RemoveId(id) => { map.remove_id(ConnectionId(id)); }
            }
            assert_bijective(&map);
        }
    }
}
