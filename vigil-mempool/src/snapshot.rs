//! The mempool snapshot: an immutable-on-read, multi-index view over the
//! staged zero-confirmation transactions.
//!
//! The [`SnapshotBuilder`] is owned by the parser task, which is the only
//! writer. `commit` publishes a clone of the working state behind an
//! `Arc`; readers hold their handle for as long as they like. Staging and
//! dropping keep six indexes consistent:
//!
//! * `by_key` / `by_hash`: bijective over the staged set
//! * `by_scraddr`: ordered TxIO keys touching each script address
//! * `by_outpoint`: which ZC is spending each output (single-spender)
//! * `txio_pool`: output/input pairs, confirmed and mempool
//! * `children`: reflexive-transitive descendant sets

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use vigil_chain::transaction::Hash;
use vigil_chain::transparent::{OutPoint, ScriptAddr};
use vigil_chain::Amount;

use crate::filter::FilteredTx;
use crate::parsed_tx::{InputSource, ParsedTx, ParsedTxOut, ResolutionState};
use crate::zc_key::{TxIoKey, ZcKey};
use crate::MempoolConfig;

/// Why a transaction could not be staged.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StageError {
    /// An input neither resolves in the confirmed chain nor in this
    /// snapshot (would break closed-world resolution).
    #[error("transaction has unresolved inputs")]
    UnresolvedInputs,
    /// Another staged ZC already spends one of the inputs.
    #[error("outpoint {outpoint:?} already spent by {holder}")]
    OutpointConflict { outpoint: OutPoint, holder: ZcKey },
    /// The same transaction is already staged.
    #[error("transaction {0:?} already staged")]
    DuplicateHash(Hash),
    /// The transaction can never stage (coinbase, empty, self-conflict).
    #[error("transaction is structurally invalid")]
    StructurallyInvalid,
}

/// A linked output–input pair: a confirmed or mempool output, and the ZC
/// input spending it, if any. A pair with no spender is an available
/// mempool UTXO.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxIoPair {
    pub output: TxIoKey,
    pub value: Amount,
    pub scraddr: ScriptAddr,
    pub spender: Option<(ZcKey, u32)>,
}

/// A staged ZC with everything the fan-out pass needs.
#[derive(Clone, Debug)]
pub(crate) struct StagedZc {
    pub tx: Arc<ParsedTx>,
    pub filtered: FilteredTx,
    pub mempool_parents: BTreeSet<ZcKey>,
}

/// One committed (or building) view of the mempool.
#[derive(Clone, Debug, Default)]
pub struct MempoolSnapshot {
    by_key: BTreeMap<ZcKey, StagedZc>,
    by_hash: HashMap<Hash, ZcKey>,
    by_scraddr: BTreeMap<ScriptAddr, BTreeSet<TxIoKey>>,
    by_outpoint: HashMap<OutPoint, ZcKey>,
    txio_pool: BTreeMap<TxIoKey, TxIoPair>,
    children: BTreeMap<ZcKey, BTreeSet<ZcKey>>,
    top_zc_id: u32,
    sequence: u64,
    merge_count: u64,
}

impl MempoolSnapshot {
    pub fn has_hash(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn key_for_hash(&self, hash: &Hash) -> Option<ZcKey> {
        self.by_hash.get(hash).copied()
    }

    pub fn tx_by_key(&self, key: ZcKey) -> Option<Arc<ParsedTx>> {
        self.by_key.get(&key).map(|staged| staged.tx.clone())
    }

    pub fn filtered_by_key(&self, key: ZcKey) -> Option<&FilteredTx> {
        self.by_key.get(&key).map(|staged| &staged.filtered)
    }

    /// The ordered TxIO keys touching a script address.
    pub fn txio_keys_for_scraddr(&self, scraddr: &ScriptAddr) -> BTreeSet<TxIoKey> {
        self.by_scraddr.get(scraddr).cloned().unwrap_or_default()
    }

    pub fn txio_by_key(&self, key: &TxIoKey) -> Option<&TxIoPair> {
        self.txio_pool.get(key)
    }

    /// The ZC spending this output, if any (mempool single-spender rule).
    pub fn is_output_spent_by_zc(&self, outpoint: &OutPoint) -> Option<ZcKey> {
        self.by_outpoint.get(outpoint).copied()
    }

    /// Resolve an outpoint against the staged set: the output it names,
    /// when its transaction is staged here.
    pub fn output_of(&self, outpoint: &OutPoint) -> Option<(ZcKey, &ParsedTxOut)> {
        let key = self.key_for_hash(&outpoint.hash)?;
        let staged = &self.by_key[&key];
        staged
            .tx
            .outputs
            .get(outpoint.index as usize)
            .map(|output| (key, output))
    }

    /// The reflexive-transitive descendant set of `key`.
    pub fn descendants(&self, key: ZcKey) -> BTreeSet<ZcKey> {
        self.children.get(&key).cloned().unwrap_or_default()
    }

    /// The last-assigned ZC counter. Monotonic across every operation,
    /// including drops.
    pub fn top_zc_id(&self) -> u32 {
        self.top_zc_id
    }

    /// The commit sequence number of this view.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// How many full index merges have happened. Introspection for tests.
    pub fn merge_count(&self) -> u64 {
        self.merge_count
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ZcKey, Arc<ParsedTx>)> + '_ {
        self.by_key
            .iter()
            .map(|(key, staged)| (*key, staged.tx.clone()))
    }

    /// Every mempool ancestor of the given parent set, parents included.
    fn collect_ancestors(&self, parents: &BTreeSet<ZcKey>) -> BTreeSet<ZcKey> {
        let mut ancestors = BTreeSet::new();
        let mut queue: VecDeque<ZcKey> = parents.iter().copied().collect();
        while let Some(key) = queue.pop_front() {
            if !ancestors.insert(key) {
                continue;
            }
            if let Some(staged) = self.by_key.get(&key) {
                queue.extend(staged.mempool_parents.iter().copied());
            }
        }
        ancestors
    }

    fn remove_scraddr_entry(&mut self, scraddr: &ScriptAddr, txio: &TxIoKey) {
        if let Some(set) = self.by_scraddr.get_mut(scraddr) {
            set.remove(txio);
            if set.is_empty() {
                self.by_scraddr.remove(scraddr);
            }
        }
    }

    /// Rebuild every derived index from the staged set. Compacts the maps
    /// after drop churn; observable only through `merge_count`.
    fn rebuild_indexes(&mut self) {
        self.by_hash = self
            .by_key
            .iter()
            .map(|(key, staged)| (staged.tx.hash, *key))
            .collect();

        self.by_outpoint.clear();
        self.txio_pool.clear();
        self.by_scraddr.clear();
        self.children.clear();

        let keys: Vec<ZcKey> = self.by_key.keys().copied().collect();
        for key in &keys {
            self.children.insert(*key, BTreeSet::from([*key]));
        }

        for key in keys {
            let staged = self.by_key[&key].clone();
            for (in_idx, input) in staged.tx.inputs.iter().enumerate() {
                self.by_outpoint.insert(input.outpoint, key);
                match input.source.expect("staged inputs are resolved") {
                    InputSource::Confirmed(db_key) => {
                        let txio = TxIoKey::Confirmed(db_key);
                        let scraddr = input.scraddr.expect("resolved input has a scraddr");
                        self.txio_pool.insert(
                            txio,
                            TxIoPair {
                                output: txio,
                                value: input.value.expect("resolved input has a value"),
                                scraddr,
                                spender: Some((key, in_idx as u32)),
                            },
                        );
                        self.by_scraddr.entry(scraddr).or_default().insert(txio);
                    }
                    InputSource::Mempool(..) => {
                        // spender back-links are re-established in the
                        // output pass below
                    }
                }
            }
            for (out_idx, output) in staged.tx.outputs.iter().enumerate() {
                let txio = TxIoKey::Zc(key, out_idx as u16);
                self.txio_pool.insert(
                    txio,
                    TxIoPair {
                        output: txio,
                        value: output.value,
                        scraddr: output.scraddr,
                        spender: None,
                    },
                );
                self.by_scraddr
                    .entry(output.scraddr)
                    .or_default()
                    .insert(txio);
            }
            for ancestor in self.collect_ancestors(&staged.mempool_parents) {
                self.children
                    .get_mut(&ancestor)
                    .expect("ancestor is staged")
                    .insert(key);
            }
        }

        // second pass: mempool spender back-links
        let spends: Vec<(ZcKey, u32, ZcKey, u16)> = self
            .by_key
            .iter()
            .flat_map(|(key, staged)| {
                staged
                    .tx
                    .inputs
                    .iter()
                    .enumerate()
                    .filter_map(move |(in_idx, input)| match input.source {
                        Some(InputSource::Mempool(parent, out_idx)) => {
                            Some((*key, in_idx as u32, parent, out_idx))
                        }
                        _ => None,
                    })
            })
            .collect();
        for (spender, in_idx, parent, out_idx) in spends {
            let pair = self
                .txio_pool
                .get_mut(&TxIoKey::Zc(parent, out_idx))
                .expect("parent output pair exists");
            pair.spender = Some((spender, in_idx));
        }
    }
}

/// The single-writer handle the parser mutates.
pub struct SnapshotBuilder {
    current: MempoolSnapshot,
    merge_threshold: u64,
    commits_since_merge: u64,
    history: VecDeque<Arc<MempoolSnapshot>>,
    history_depth: usize,
}

impl SnapshotBuilder {
    pub fn new(config: &MempoolConfig) -> SnapshotBuilder {
        SnapshotBuilder {
            current: MempoolSnapshot::default(),
            merge_threshold: config.pool_merge_threshold.max(1),
            commits_since_merge: 0,
            history: VecDeque::new(),
            history_depth: config.mempool_depth.max(1),
        }
    }

    /// The building view. Resolution of incoming ZCs reads through this,
    /// so a tx arriving mid-batch can spend an uncommitted parent.
    pub fn snapshot(&self) -> &MempoolSnapshot {
        &self.current
    }

    /// Assign the next ZcKey. Called once per intake; a tx parked for a
    /// missing parent keeps the key it was assigned here.
    pub fn assign_key(&mut self) -> ZcKey {
        self.current.top_zc_id += 1;
        ZcKey::from_counter(self.current.top_zc_id)
    }

    /// Stage a resolved transaction under a previously assigned key.
    ///
    /// Nothing is mutated on error: a conflicting or unresolved tx leaves
    /// every index exactly as it was.
    pub fn stage(
        &mut self,
        key: ZcKey,
        tx: Arc<ParsedTx>,
        filtered: FilteredTx,
    ) -> Result<ZcKey, StageError> {
        match tx.state {
            ResolutionState::Resolved => {}
            ResolutionState::Invalid => return Err(StageError::StructurallyInvalid),
            _ => return Err(StageError::UnresolvedInputs),
        }
        if self.current.by_hash.contains_key(&tx.hash) {
            return Err(StageError::DuplicateHash(tx.hash));
        }
        for input in &tx.inputs {
            if let Some(&holder) = self.current.by_outpoint.get(&input.outpoint) {
                return Err(StageError::OutpointConflict {
                    outpoint: input.outpoint,
                    holder,
                });
            }
            match input.source {
                Some(InputSource::Confirmed(_)) => {}
                // a parent may have been dropped since this tx resolved
                Some(InputSource::Mempool(parent, _))
                    if self.current.by_key.contains_key(&parent) => {}
                _ => return Err(StageError::UnresolvedInputs),
            }
        }

        let mut mempool_parents = BTreeSet::new();
        for (in_idx, input) in tx.inputs.iter().enumerate() {
            self.current.by_outpoint.insert(input.outpoint, key);
            match input.source.expect("validated above") {
                InputSource::Confirmed(db_key) => {
                    let txio = TxIoKey::Confirmed(db_key);
                    let scraddr = input.scraddr.expect("resolved input has a scraddr");
                    self.current.txio_pool.insert(
                        txio,
                        TxIoPair {
                            output: txio,
                            value: input.value.expect("resolved input has a value"),
                            scraddr,
                            spender: Some((key, in_idx as u32)),
                        },
                    );
                    self.current
                        .by_scraddr
                        .entry(scraddr)
                        .or_default()
                        .insert(txio);
                }
                InputSource::Mempool(parent, out_idx) => {
                    mempool_parents.insert(parent);
                    let pair = self
                        .current
                        .txio_pool
                        .get_mut(&TxIoKey::Zc(parent, out_idx))
                        .expect("staged parent carries its output pairs");
                    pair.spender = Some((key, in_idx as u32));
                }
            }
        }
        for (out_idx, output) in tx.outputs.iter().enumerate() {
            let txio = TxIoKey::Zc(key, out_idx as u16);
            self.current.txio_pool.insert(
                txio,
                TxIoPair {
                    output: txio,
                    value: output.value,
                    scraddr: output.scraddr,
                    spender: None,
                },
            );
            self.current
                .by_scraddr
                .entry(output.scraddr)
                .or_default()
                .insert(txio);
        }
        self.current.by_hash.insert(tx.hash, key);
        self.current.children.insert(key, BTreeSet::from([key]));
        for ancestor in self.current.collect_ancestors(&mempool_parents) {
            self.current
                .children
                .get_mut(&ancestor)
                .expect("ancestors are staged")
                .insert(key);
        }
        trace!(%key, hash = ?tx.hash, parents = mempool_parents.len(), "staged zc");
        self.current.by_key.insert(
            key,
            StagedZc {
                tx,
                filtered,
                mempool_parents,
            },
        );
        Ok(key)
    }

    /// Drop a ZC and, atomically, its entire descendant set. Returns the
    /// dropped transactions keyed by their ZcKeys; `top_zc_id` is
    /// unaffected.
    pub fn drop_zc(&mut self, key: ZcKey) -> BTreeMap<ZcKey, Arc<ParsedTx>> {
        let victims = match self.current.children.get(&key) {
            Some(set) => set.clone(),
            None => return BTreeMap::new(),
        };

        let mut dropped = BTreeMap::new();
        for victim in &victims {
            let staged = self
                .current
                .by_key
                .remove(victim)
                .expect("children sets only name staged keys");
            self.current.by_hash.remove(&staged.tx.hash);

            for input in &staged.tx.inputs {
                self.current.by_outpoint.remove(&input.outpoint);
                match input.source.expect("staged inputs are resolved") {
                    InputSource::Confirmed(db_key) => {
                        let txio = TxIoKey::Confirmed(db_key);
                        self.current.txio_pool.remove(&txio);
                        let scraddr = input.scraddr.expect("resolved input has a scraddr");
                        self.current.remove_scraddr_entry(&scraddr, &txio);
                    }
                    InputSource::Mempool(parent, out_idx) => {
                        // a surviving parent's output becomes available again
                        if !victims.contains(&parent) {
                            if let Some(pair) = self
                                .current
                                .txio_pool
                                .get_mut(&TxIoKey::Zc(parent, out_idx))
                            {
                                pair.spender = None;
                            }
                        }
                    }
                }
            }
            for (out_idx, output) in staged.tx.outputs.iter().enumerate() {
                let txio = TxIoKey::Zc(*victim, out_idx as u16);
                self.current.txio_pool.remove(&txio);
                self.current.remove_scraddr_entry(&output.scraddr, &txio);
            }
            dropped.insert(*victim, staged.tx);
        }

        self.current.children.retain(|k, _| !victims.contains(k));
        for set in self.current.children.values_mut() {
            for victim in &victims {
                set.remove(victim);
            }
        }

        trace!(%key, count = dropped.len(), "dropped zc subtree");
        dropped
    }

    /// Publish the building state as the new committed snapshot. Pure
    /// visibility boundary: no ZC content changes here.
    pub fn commit(&mut self) -> Arc<MempoolSnapshot> {
        self.current.sequence += 1;
        self.commits_since_merge += 1;
        if self.commits_since_merge >= self.merge_threshold {
            self.current.rebuild_indexes();
            self.current.merge_count += 1;
            self.commits_since_merge = 0;
            metrics::counter!("mempool.merges").increment(1);
        }

        let published = Arc::new(self.current.clone());
        self.history.push_back(published.clone());
        while self.history.len() > self.history_depth {
            self.history.pop_front();
        }

        metrics::counter!("mempool.commits").increment(1);
        metrics::gauge!("mempool.snapshot.size").set(self.current.len() as f64);
        published
    }

    /// How many full merges the committed state has been through.
    pub fn merge_count(&self) -> u64 {
        self.current.merge_count
    }

    /// The retained committed generations, oldest first.
    pub fn committed_history(&self) -> impl Iterator<Item = &Arc<MempoolSnapshot>> {
        self.history.iter()
    }
}
