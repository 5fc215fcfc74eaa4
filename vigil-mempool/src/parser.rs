//! The ZC parser: the single-writer event loop that owns the snapshot.
//!
//! All snapshot mutation happens on this task. Intake events arrive on a
//! typed channel; each event is processed as one batch and published with
//! exactly one commit, so subscribers observe groups atomically. Readers
//! follow the committed snapshot through a `watch` channel of `Arc`s.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant};
use tracing::{debug, trace, warn};

use vigil_chain::transaction::Hash;
use vigil_chain::Amount;

use crate::filter::{self, FilteredTx};
use crate::notification::{NotificationSink, SubscriberNotification, ZcEntry};
use crate::parsed_tx::{AddrInterest, ParsedTx, ResolutionState, UtxoLookup};
use crate::snapshot::{MempoolSnapshot, SnapshotBuilder, StageError};
use crate::tracker::{BroadcastTracker, HashState, RejectCode, RequestId};
use crate::watcher::{ParkedZc, WatcherPool};
use crate::zc_key::ZcKey;
use crate::{BoxError, MempoolConfig, SubscriberId};

/// Intake events, in the order the node and the clients produce them.
#[derive(Debug)]
pub enum ParserEvent {
    /// A transaction received from the node (inv/tx flow).
    NewZcFromNode { raw: Vec<u8> },
    /// A client broadcast group. The request must already be registered
    /// with the tracker; the whole group commits once.
    NewZcBatchFromClient {
        raws: Vec<Vec<u8>>,
        request_id: RequestId,
    },
    /// A block connected (or a reorg switched tips). Mined ZCs leave the
    /// snapshot; transactions from orphaned blocks re-enter intake.
    NewBlock {
        confirmed_txids: Vec<Hash>,
        reorged_raw_txs: Vec<Vec<u8>>,
    },
    /// The node answered a getdata for an advertised tx with notfound.
    NodeGetDataMiss { hash: Hash },
    /// Discard the building snapshot and stop.
    Shutdown,
}

/// The accumulated effect of one event, committed as a unit.
#[derive(Default)]
struct CommitBatch {
    staged: Vec<ZcKey>,
    /// Dropped ZCs with the interest data captured before the drop.
    dropped: Vec<(ZcKey, Hash, FilteredTx)>,
}

impl CommitBatch {
    fn is_empty(&self) -> bool {
        self.staged.is_empty() && self.dropped.is_empty()
    }
}

/// Cheap cloneable handle to a running parser.
#[derive(Clone)]
pub struct ParserHandle {
    events: mpsc::Sender<ParserEvent>,
    snapshot: watch::Receiver<Arc<MempoolSnapshot>>,
}

impl ParserHandle {
    pub async fn send(&self, event: ParserEvent) -> Result<(), BoxError> {
        self.events.send(event).await.map_err(|e| Box::new(e) as _)
    }

    /// The latest committed snapshot.
    pub fn current_snapshot(&self) -> Arc<MempoolSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// A receiver that yields each newly committed snapshot.
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<MempoolSnapshot>> {
        self.snapshot.clone()
    }
}

pub struct ZcParser {
    builder: SnapshotBuilder,
    watcher: WatcherPool,
    tracker: Arc<BroadcastTracker>,
    chain: Arc<dyn UtxoLookup>,
    interest: Arc<dyn AddrInterest>,
    sink: Arc<dyn NotificationSink>,
    snapshot_tx: watch::Sender<Arc<MempoolSnapshot>>,
    last_published: Arc<MempoolSnapshot>,
    config: MempoolConfig,
}

/// Start the parser task. Returns the handle plus the task's join handle.
pub fn spawn(
    config: MempoolConfig,
    chain: Arc<dyn UtxoLookup>,
    interest: Arc<dyn AddrInterest>,
    sink: Arc<dyn NotificationSink>,
    tracker: Arc<BroadcastTracker>,
) -> (ParserHandle, tokio::task::JoinHandle<()>) {
    let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
    let empty = Arc::new(MempoolSnapshot::default());
    let (snapshot_tx, snapshot_rx) = watch::channel(empty.clone());

    let parser = ZcParser {
        builder: SnapshotBuilder::new(&config),
        watcher: WatcherPool::new(),
        tracker,
        chain,
        interest,
        sink,
        snapshot_tx,
        last_published: empty,
        config,
    };

    let handle = ParserHandle {
        events: events_tx,
        snapshot: snapshot_rx,
    };
    let join = tokio::spawn(parser.run(events_rx));
    (handle, join)
}

impl ZcParser {
    async fn run(mut self, mut events: mpsc::Receiver<ParserEvent>) {
        let sweep_period = (self.config.watcher_timeout / 4).max(std::time::Duration::from_secs(1));
        let mut sweep = interval(sweep_period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ParserEvent::Shutdown) | None => {
                        // the building snapshot is discarded, not committed
                        debug!("parser shutting down");
                        break;
                    }
                    Some(event) => self.handle_event(event),
                },
                _ = sweep.tick() => self.sweep_watcher(),
            }
        }
    }

    fn handle_event(&mut self, event: ParserEvent) {
        match event {
            ParserEvent::NewZcFromNode { raw } => {
                let mut batch = CommitBatch::default();
                self.intake(&raw, None, &mut batch);
                self.finish_batch(batch);
            }
            ParserEvent::NewZcBatchFromClient { raws, request_id } => {
                let mut batch = CommitBatch::default();
                for raw in &raws {
                    self.intake(raw, Some(request_id.clone()), &mut batch);
                }
                self.finish_batch(batch);
            }
            ParserEvent::NewBlock {
                confirmed_txids,
                reorged_raw_txs,
            } => {
                let mut batch = CommitBatch::default();
                for txid in confirmed_txids {
                    self.drop_confirmed(&txid, &mut batch);
                }
                for raw in &reorged_raw_txs {
                    self.intake(raw, None, &mut batch);
                }
                self.finish_batch(batch);
            }
            ParserEvent::NodeGetDataMiss { hash } => {
                // nothing in the snapshot changes; the broadcaster's own
                // timeout accounting handles the advertised tx
                trace!(?hash, "node getdata miss");
                metrics::counter!("mempool.getdata.miss").increment(1);
            }
            ParserEvent::Shutdown => unreachable!("handled in run"),
        }
    }

    /// Parse → resolve → filter → stage one transaction.
    fn intake(&mut self, raw: &[u8], origin: Option<RequestId>, batch: &mut CommitBatch) {
        let parsed = match ParsedTx::parse(raw) {
            Ok(parsed) => parsed,
            Err(error) => {
                // undecodable bytes are dropped with no notification; a
                // client-originated request learned its hashes at
                // registration, so there is nothing to correlate either
                warn!(%error, "discarding unparseable zc");
                return;
            }
        };
        let hash = parsed.hash;

        if parsed.state == ResolutionState::Invalid {
            debug!(?hash, "discarding structurally invalid zc");
            if let Some(request_id) = origin {
                self.emit_outcomes(self.tracker.transition(
                    &request_id,
                    &hash,
                    HashState::RejectedByNode(RejectCode::MALFORMED),
                ));
            }
            return;
        }

        if self.builder.snapshot().has_hash(&hash) {
            if let Some(request_id) = origin {
                self.emit_outcomes(self.tracker.transition(
                    &request_id,
                    &hash,
                    HashState::AlreadyInMempool,
                ));
            }
            return;
        }

        if self.chain.tx_in_chain(&hash) {
            if let Some(request_id) = origin {
                self.emit_outcomes(self.tracker.transition(
                    &request_id,
                    &hash,
                    HashState::AlreadyInChain,
                ));
            }
            return;
        }

        let key = self.builder.assign_key();
        self.try_stage(key, parsed, origin, batch);
    }

    /// Resolve and stage a transaction under its assigned key, reviving
    /// parked children as staging makes them resolvable.
    fn try_stage(
        &mut self,
        key: ZcKey,
        mut parsed: ParsedTx,
        origin: Option<RequestId>,
        batch: &mut CommitBatch,
    ) {
        let missing = parsed.resolve(&*self.chain, &self.builder);
        if !missing.is_empty() {
            self.watcher.park(ParkedZc {
                key,
                tx: parsed,
                missing: missing.into_iter().collect(),
                parked_at: Instant::now(),
                origin,
            });
            return;
        }

        let filtered = filter::filter(&parsed, &*self.interest);
        let hash = parsed.hash;
        let tx = Arc::new(parsed);
        match self.builder.stage(key, tx.clone(), filtered.clone()) {
            Ok(_) => {
                batch.staged.push(key);
                self.revive_children(&hash, batch);
            }
            Err(StageError::OutpointConflict { outpoint, holder }) => {
                trace!(?outpoint, %holder, replacement = %key, "outpoint conflict");
                self.try_rbf(key, tx, filtered, origin, batch);
            }
            Err(StageError::DuplicateHash(_)) => {
                if let Some(request_id) = origin {
                    self.emit_outcomes(self.tracker.transition(
                        &request_id,
                        &hash,
                        HashState::AlreadyInMempool,
                    ));
                }
            }
            Err(error) => {
                debug!(%error, ?hash, "stage failed");
                if let Some(request_id) = origin {
                    self.emit_outcomes(self.tracker.transition(
                        &request_id,
                        &hash,
                        HashState::VerifyRejected,
                    ));
                }
            }
        }
    }

    /// The replace-by-fee path, entered when staging hit a claimed
    /// outpoint.
    ///
    /// Replacement rule (recorded in DESIGN.md): the replacement must
    /// signal BIP 125 and pay strictly more total fee than the aggregate
    /// fee of every ZC it evicts (the conflicting subtrees). Policy
    /// beyond that is the node's call; its `InsufficientFee` reject stays
    /// authoritative.
    fn try_rbf(
        &mut self,
        key: ZcKey,
        tx: Arc<ParsedTx>,
        filtered: FilteredTx,
        origin: Option<RequestId>,
        batch: &mut CommitBatch,
    ) {
        let hash = tx.hash;
        if !tx.signals_rbf {
            debug!(?hash, "conflict without rbf signal");
            if let Some(request_id) = origin {
                self.emit_outcomes(self.tracker.transition(
                    &request_id,
                    &hash,
                    HashState::VerifyRejected,
                ));
            }
            return;
        }

        let (holders, evicted_fee) = {
            let snapshot = self.builder.snapshot();
            let mut holders = BTreeSet::new();
            for input in &tx.inputs {
                if let Some(holder) = snapshot.is_output_spent_by_zc(&input.outpoint) {
                    holders.insert(holder);
                }
            }
            let mut victims = BTreeSet::new();
            for holder in &holders {
                victims.extend(snapshot.descendants(*holder));
            }
            let mut evicted_fee = Amount::ZERO;
            for victim in &victims {
                let victim_tx = snapshot
                    .tx_by_key(*victim)
                    .expect("descendant sets name staged keys");
                evicted_fee = evicted_fee
                    .checked_add(victim_tx.fee().unwrap_or(Amount::ZERO))
                    .unwrap_or(Amount::from_sat(u64::MAX));
            }
            (holders, evicted_fee)
        };

        let replacement_fee = tx.fee().unwrap_or(Amount::ZERO);
        if replacement_fee <= evicted_fee {
            debug!(
                ?hash,
                replacement_fee = replacement_fee.sat(),
                evicted_fee = evicted_fee.sat(),
                "rbf replacement fee too low"
            );
            if let Some(request_id) = origin {
                self.emit_outcomes(self.tracker.transition(
                    &request_id,
                    &hash,
                    HashState::RejectedByNode(RejectCode::INSUFFICIENT_FEE),
                ));
            }
            return;
        }

        for holder in holders {
            self.capture_and_drop(holder, batch);
        }
        match self.builder.stage(key, tx, filtered) {
            Ok(_) => {
                debug!(?hash, %key, fee = replacement_fee.sat(), "rbf replacement staged");
                batch.staged.push(key);
                self.revive_children(&hash, batch);
            }
            Err(error) => {
                warn!(%error, ?hash, "rbf restage failed");
                if let Some(request_id) = origin {
                    self.emit_outcomes(self.tracker.transition(
                        &request_id,
                        &hash,
                        HashState::VerifyRejected,
                    ));
                }
            }
        }
    }

    fn revive_children(&mut self, parent: &Hash, batch: &mut CommitBatch) {
        for ready in self.watcher.on_parent_available(parent) {
            trace!(key = %ready.key, "reviving parked child");
            self.try_stage(ready.key, ready.tx, ready.origin, batch);
        }
    }

    fn sweep_watcher(&mut self) {
        let evicted = self
            .watcher
            .sweep_expired(self.config.watcher_timeout, Instant::now());
        for entry in evicted {
            debug!(key = %entry.key, hash = ?entry.tx.hash, "watcher entry timed out");
            if let Some(request_id) = entry.origin {
                self.emit_outcomes(self.tracker.transition(
                    &request_id,
                    &entry.tx.hash,
                    HashState::TimedOut,
                ));
            }
        }
    }

    fn drop_confirmed(&mut self, txid: &Hash, batch: &mut CommitBatch) {
        if let Some(key) = self.builder.snapshot().key_for_hash(txid) {
            self.capture_and_drop(key, batch);
        }
        // a parked child's parent just confirmed; the chain lookup will
        // resolve it now
        self.revive_children(txid, batch);
        self.emit_outcomes(self.tracker.transition_all(txid, HashState::SeenInSnapshot));
    }

    /// Record interest data for a subtree, then drop it.
    fn capture_and_drop(&mut self, key: ZcKey, batch: &mut CommitBatch) {
        let snapshot = self.builder.snapshot();
        let mut meta = Vec::new();
        for victim in snapshot.descendants(key) {
            let tx = snapshot
                .tx_by_key(victim)
                .expect("descendant sets name staged keys");
            let filtered = snapshot
                .filtered_by_key(victim)
                .expect("staged zc carries its filter result")
                .clone();
            meta.push((victim, tx.hash, filtered));
        }
        let dropped = self.builder.drop_zc(key);
        debug_assert_eq!(dropped.len(), meta.len());
        batch.dropped.extend(meta);
    }

    /// Commit the batch (if it changed anything) and fan out.
    fn finish_batch(&mut self, batch: CommitBatch) {
        if batch.is_empty() {
            return;
        }

        let snapshot = self.builder.commit();
        let sequence = snapshot.sequence();

        // fan out accepted ZCs, grouped per subscriber, in stage order
        let mut accepted: BTreeMap<SubscriberId, Vec<ZcEntry>> = BTreeMap::new();
        for key in &batch.staged {
            // a ZC staged and replaced within the same batch never became
            // visible; skip it
            let filtered = match snapshot.filtered_by_key(*key) {
                Some(filtered) => filtered,
                None => continue,
            };
            let tx = snapshot.tx_by_key(*key).expect("staged key has a tx");
            for subscriber in &filtered.flagged {
                let scraddrs: BTreeSet<_> = filtered
                    .per_scraddr
                    .iter()
                    .filter(|(_, watchers)| watchers.contains(subscriber))
                    .map(|(scraddr, _)| *scraddr)
                    .collect();
                accepted.entry(*subscriber).or_default().push(ZcEntry {
                    hash: tx.hash,
                    scraddrs,
                });
            }
        }
        for (subscriber, entries) in accepted {
            self.sink.notify(
                subscriber,
                SubscriberNotification::ZcAccepted { sequence, entries },
            );
        }

        // invalidations, only for ZCs a committed snapshot ever carried
        let mut invalidated: BTreeMap<SubscriberId, Vec<Hash>> = BTreeMap::new();
        for (key, hash, filtered) in &batch.dropped {
            if self.last_published.key_for_hash(hash) != Some(*key) {
                continue;
            }
            for subscriber in &filtered.flagged {
                invalidated.entry(*subscriber).or_default().push(*hash);
            }
        }
        for (subscriber, hashes) in invalidated {
            self.sink.notify(
                subscriber,
                SubscriberNotification::ZcInvalidated { sequence, hashes },
            );
        }

        // broadcast requests whose hashes reached this commit succeeded
        for key in &batch.staged {
            if let Some(tx) = snapshot.tx_by_key(*key) {
                self.emit_outcomes(
                    self.tracker
                        .transition_all(&tx.hash, HashState::SeenInSnapshot),
                );
            }
        }

        metrics::counter!("mempool.committed.zc.count").increment(batch.staged.len() as u64);
        self.last_published = snapshot.clone();
        let _ = self.snapshot_tx.send(snapshot);
    }

    fn emit_outcomes(&self, outcomes: Vec<crate::tracker::BroadcastOutcome>) {
        for outcome in outcomes {
            self.sink.broadcast_outcome(outcome);
        }
    }
}
