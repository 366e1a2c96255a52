//! Fixed-size pool of session pairs for one host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mte_relay_core::RoundRobin;
use mte_relay_types::{ClientId, HostSnapshot, PairId};

use crate::cipher::RatchetProvider;
use crate::kem::{KemError, KeyExchange};
use crate::pair::{PairError, PendingPair, SessionPair};

struct PoolInner {
    order: Vec<Arc<SessionPair>>,
    index: HashMap<PairId, usize>,
    rotation: RoundRobin,
}

/// Ordered `pair_id -> SessionPair` map with round-robin selection.
///
/// Cursor advance and lookup happen under one mutex. The pair contents are
/// never touched under it; each pair has its own async lock.
pub struct PairPool {
    generation: u64,
    inner: Mutex<PoolInner>,
}

impl PairPool {
    /// Generate `n` candidate pairs with fresh KEM keypairs.
    pub fn create(n: usize, kem: &dyn KeyExchange) -> Result<Vec<PendingPair>, KemError> {
        (0..n).map(|_| PendingPair::generate(kem)).collect()
    }

    /// A pool over established pairs, in the given order.
    pub fn from_pairs(generation: u64, pairs: Vec<SessionPair>) -> Self {
        let order: Vec<Arc<SessionPair>> = pairs.into_iter().map(Arc::new).collect();
        let index = order
            .iter()
            .enumerate()
            .map(|(i, pair)| (pair.id().clone(), i))
            .collect();
        let rotation = RoundRobin::new(order.len());
        Self {
            generation,
            inner: Mutex::new(PoolInner {
                order,
                index,
                rotation,
            }),
        }
    }

    /// Rebuild a pool from a persisted snapshot without generating keys.
    pub fn reload(
        generation: u64,
        snapshot: &HostSnapshot,
        ratchets: Arc<dyn RatchetProvider>,
    ) -> Result<Self, PairError> {
        let pairs = snapshot
            .pairs
            .iter()
            .map(|pair| SessionPair::from_snapshot(pair, Arc::clone(&ratchets)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_pairs(generation, pairs))
    }

    /// Generation this pool was installed at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    /// True if the pool holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next pair in rotation, stepping over burned pairs.
    pub fn next(&self) -> Result<Arc<SessionPair>, PairError> {
        let mut inner = self.lock();
        let PoolInner {
            order, rotation, ..
        } = &mut *inner;
        rotation
            .next_matching(|i| !order[i].is_burned())
            .map(|i| Arc::clone(&order[i]))
            .ok_or(PairError::PoolExhausted)
    }

    /// Pair by id, if it belongs to this pool.
    pub fn get(&self, pair_id: &PairId) -> Option<Arc<SessionPair>> {
        let inner = self.lock();
        inner
            .index
            .get(pair_id)
            .map(|&i| Arc::clone(&inner.order[i]))
    }

    /// Pair ids in rotation order.
    pub fn ids(&self) -> Vec<PairId> {
        self.lock().order.iter().map(|p| p.id().clone()).collect()
    }

    /// Burn a pair; returns how many pairs are now burned.
    pub fn burn(&self, pair_id: &PairId) -> usize {
        let inner = self.lock();
        if let Some(&i) = inner.index.get(pair_id) {
            inner.order[i].burn();
        }
        inner.order.iter().filter(|p| p.is_burned()).count()
    }

    /// Number of burned pairs.
    pub fn burned(&self) -> usize {
        self.lock().order.iter().filter(|p| p.is_burned()).count()
    }

    /// Snapshot of every pair's committed state.
    pub fn snapshot(&self, client_id: &ClientId) -> HostSnapshot {
        let pairs: Vec<Arc<SessionPair>> = self.lock().order.clone();
        HostSnapshot {
            client_id: client_id.clone(),
            pairs: pairs.iter().map(|pair| pair.snapshot()).collect(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PairPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairPool")
            .field("generation", &self.generation)
            .field("pairs", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::ChaChaRatchetProvider;
    use crate::kem::MlKemAgent;
    use crate::pair::instantiate_ratchet;
    use crate::cipher::Direction;

    fn ratchets() -> Arc<dyn RatchetProvider> {
        Arc::new(ChaChaRatchetProvider)
    }

    fn established(n: usize) -> PairPool {
        let provider = ratchets();
        let pairs = (0..n)
            .map(|i| {
                let state = instantiate_ratchet(
                    provider.as_ref(),
                    Direction::Encoder,
                    &[i as u8 + 1; 32],
                    i as u64,
                    "pool-test",
                )
                .unwrap();
                SessionPair::from_states(PairId::random(), state.clone(), state, provider.clone())
            })
            .collect();
        PairPool::from_pairs(1, pairs)
    }

    #[test]
    fn create_generates_distinct_candidates() {
        let pending = PairPool::create(3, &MlKemAgent).unwrap();
        assert_eq!(pending.len(), 3);
        let offers: Vec<_> = pending.iter().map(|p| p.offer()).collect();
        assert_ne!(offers[0].pair_id, offers[1].pair_id);
        assert_ne!(offers[0].encoder_public_key, offers[1].encoder_public_key);
    }

    #[test]
    fn next_visits_each_pair_once_per_lap() {
        let pool = established(3);
        let ids = pool.ids();

        let lap: Vec<PairId> = (0..3).map(|_| pool.next().unwrap().id().clone()).collect();
        assert_eq!(lap, ids);

        let again: Vec<PairId> = (0..5).map(|_| pool.next().unwrap().id().clone()).collect();
        assert_eq!(again, vec![ids[0].clone(), ids[1].clone(), ids[2].clone(), ids[0].clone(), ids[1].clone()]);
    }

    #[test]
    fn get_finds_by_id_only_in_this_pool() {
        let pool = established(2);
        let id = pool.ids()[1].clone();
        assert_eq!(pool.get(&id).unwrap().id(), &id);
        assert!(pool.get(&PairId::random()).is_none());
    }

    #[test]
    fn burned_pairs_are_skipped() {
        let pool = established(3);
        let ids = pool.ids();
        assert_eq!(pool.burn(&ids[1]), 1);

        let picks: Vec<PairId> = (0..4).map(|_| pool.next().unwrap().id().clone()).collect();
        assert_eq!(picks, vec![ids[0].clone(), ids[2].clone(), ids[0].clone(), ids[2].clone()]);
    }

    #[test]
    fn all_burned_is_exhausted() {
        let pool = established(2);
        for id in pool.ids() {
            pool.burn(&id);
        }
        assert!(matches!(pool.next(), Err(PairError::PoolExhausted)));
    }

    #[test]
    fn reload_keeps_ids_and_order() {
        let pool = established(3);
        let snapshot = pool.snapshot(&ClientId::new("client"));
        let reloaded = PairPool::reload(2, &snapshot, ratchets()).unwrap();

        assert_eq!(reloaded.ids(), pool.ids());
        assert_eq!(reloaded.generation(), 2);
        assert_eq!(reloaded.snapshot(&ClientId::new("client")), snapshot);
    }

    #[test]
    fn concurrent_next_is_fair() {
        let pool = Arc::new(established(3));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.next().unwrap().id().clone())
            })
            .collect();
        let mut counts: HashMap<PairId, usize> = HashMap::new();
        for handle in handles {
            *counts.entry(handle.join().unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 2));
    }
}
