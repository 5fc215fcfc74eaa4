//! The watcher pool: ZCs whose parents have not arrived yet.
//!
//! A tx that resolves everywhere except one or more unknown outpoints is
//! parked here, keyed by the parent hashes it is waiting on. When one of
//! those parents stages (or confirms), the entry wakes for another
//! resolution pass. Entries that outlive the configured timeout are
//! swept out so an orphan whose parent never shows cannot leak.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::time::Instant;
use tracing::trace;

use vigil_chain::transaction::Hash;
use vigil_chain::transparent::OutPoint;

use crate::parsed_tx::ParsedTx;
use crate::tracker::RequestId;
use crate::zc_key::ZcKey;

/// A parked parent-missing ZC.
#[derive(Clone, Debug)]
pub struct ParkedZc {
    pub key: ZcKey,
    pub tx: ParsedTx,
    pub missing: BTreeSet<OutPoint>,
    pub parked_at: Instant,
    /// The broadcast request that pushed this tx, when client-originated.
    pub origin: Option<RequestId>,
}

#[derive(Debug, Default)]
pub struct WatcherPool {
    entries: BTreeMap<ZcKey, ParkedZc>,
    /// Parent tx hash → parked keys waiting on one of its outputs.
    by_parent: HashMap<Hash, BTreeSet<ZcKey>>,
}

impl WatcherPool {
    pub fn new() -> WatcherPool {
        WatcherPool::default()
    }

    pub fn park(&mut self, parked: ParkedZc) {
        trace!(key = %parked.key, waiting_on = parked.missing.len(), "parking zc");
        for outpoint in &parked.missing {
            self.by_parent
                .entry(outpoint.hash)
                .or_default()
                .insert(parked.key);
        }
        self.entries.insert(parked.key, parked);
        metrics::gauge!("mempool.watcher.parked").set(self.entries.len() as f64);
    }

    /// A transaction with this hash became available (staged or mined).
    /// Returns the parked entries that are no longer waiting on anything,
    /// in intake (ZcKey) order, removed from the pool. Entries still
    /// missing other parents stay parked.
    pub fn on_parent_available(&mut self, parent: &Hash) -> Vec<ParkedZc> {
        let keys = match self.by_parent.remove(parent) {
            Some(keys) => keys,
            None => return Vec::new(),
        };

        let mut ready = Vec::new();
        for key in keys {
            let entry = self
                .entries
                .get_mut(&key)
                .expect("by_parent only names parked entries");
            entry.missing.retain(|outpoint| outpoint.hash != *parent);
            if entry.missing.is_empty() {
                trace!(%key, "parked zc ready");
                ready.push(self.entries.remove(&key).expect("present above"));
            }
        }
        metrics::gauge!("mempool.watcher.parked").set(self.entries.len() as f64);
        ready
    }

    /// Evict everything parked longer than `timeout`. Returns the evicted
    /// entries so deferred rejects can reach their originating requests.
    pub fn sweep_expired(&mut self, timeout: std::time::Duration, now: Instant) -> Vec<ParkedZc> {
        let expired: Vec<ZcKey> = self
            .entries
            .values()
            .filter(|entry| now.duration_since(entry.parked_at) >= timeout)
            .map(|entry| entry.key)
            .collect();

        let mut evicted = Vec::new();
        for key in expired {
            let entry = self.entries.remove(&key).expect("collected above");
            for outpoint in &entry.missing {
                if let Some(set) = self.by_parent.get_mut(&outpoint.hash) {
                    set.remove(&key);
                    if set.is_empty() {
                        self.by_parent.remove(&outpoint.hash);
                    }
                }
            }
            trace!(%key, "evicting expired watcher entry");
            evicted.push(entry);
        }
        metrics::gauge!("mempool.watcher.parked").set(self.entries.len() as f64);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vigil_chain::transaction::Hash;

    use super::*;
    use crate::parsed_tx::ResolutionState;

    fn parked(key: u32, missing: &[OutPoint], at: Instant) -> ParkedZc {
        ParkedZc {
            key: ZcKey::from_counter(key),
            tx: ParsedTx {
                hash: Hash([key as u8; 32]),
                raw: Vec::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                state: ResolutionState::ResolvedButInputsMissing,
                signals_rbf: false,
            },
            missing: missing.iter().copied().collect(),
            parked_at: at,
            origin: None,
        }
    }

    fn outpoint(hash_byte: u8, index: u32) -> OutPoint {
        OutPoint {
            hash: Hash([hash_byte; 32]),
            index,
        }
    }

    #[tokio::test]
    async fn wakes_only_fully_satisfied_entries() {
        vigil_test::init();

        let now = Instant::now();
        let mut pool = WatcherPool::new();
        pool.park(parked(1, &[outpoint(0xAA, 0)], now));
        pool.park(parked(2, &[outpoint(0xAA, 1), outpoint(0xBB, 0)], now));

        let ready = pool.on_parent_available(&Hash([0xAA; 32]));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].key, ZcKey::from_counter(1));
        assert_eq!(pool.len(), 1);

        let ready = pool.on_parent_available(&Hash([0xBB; 32]));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].key, ZcKey::from_counter(2));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_expired_and_their_index_entries() {
        vigil_test::init();

        let now = Instant::now();
        let mut pool = WatcherPool::new();
        pool.park(parked(1, &[outpoint(0xAA, 0)], now));
        pool.park(parked(
            2,
            &[outpoint(0xAA, 1)],
            now + Duration::from_secs(30),
        ));

        let evicted = pool.sweep_expired(Duration::from_secs(60), now + Duration::from_secs(60));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, ZcKey::from_counter(1));

        // the survivor still wakes normally
        let ready = pool.on_parent_available(&Hash([0xAA; 32]));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].key, ZcKey::from_counter(2));
    }
}
