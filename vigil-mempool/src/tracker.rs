//! The broadcast-request tracker.
//!
//! Correlates client broadcast intents to the downstream events they
//! produce: node acceptance or rejection, presence in a committed
//! snapshot, or synthesized already-known outcomes. Several overlapping
//! requests may reference the same tx hash; each sees its own per-hash
//! outcome exactly once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use rand::RngCore;

use vigil_chain::transaction::Hash;

/// A caller-chosen opaque broadcast request id.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(pub Vec<u8>);

impl RequestId {
    /// Synthesize an id for callers that omitted one.
    pub fn synthesize() -> RequestId {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        RequestId(bytes.to_vec())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestId")
            .field(&hex::encode(&self.0))
            .finish()
    }
}

/// An upstream reject code, using the P2P reject ccode values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RejectCode(pub u8);

impl RejectCode {
    pub const MALFORMED: RejectCode = RejectCode(0x01);
    pub const INVALID: RejectCode = RejectCode(0x10);
    pub const DUPLICATE: RejectCode = RejectCode(0x12);
    pub const INSUFFICIENT_FEE: RejectCode = RejectCode(0x42);
    pub const OTHER: RejectCode = RejectCode(0x50);
}

/// The lifecycle of one hash within one request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashState {
    Submitted,
    AcceptedByNode,
    /// Success terminal: the ZC is in a committed snapshot.
    SeenInSnapshot,
    RejectedByNode(RejectCode),
    /// The snapshot-level double-spend verdict for conflicts that cannot
    /// be replaced.
    VerifyRejected,
    AlreadyInMempool,
    AlreadyInChain,
    TimedOut,
}

impl HashState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HashState::Submitted | HashState::AcceptedByNode)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, HashState::SeenInSnapshot)
    }
}

/// A client-visible per-hash outcome, emitted at most once per
/// (request, hash, terminal-state).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BroadcastOutcome {
    pub request_id: RequestId,
    pub hash: Hash,
    pub state: HashState,
}

#[derive(Debug)]
struct RequestState {
    per_hash: BTreeMap<Hash, HashState>,
}

impl RequestState {
    fn is_complete(&self) -> bool {
        self.per_hash.values().all(HashState::is_terminal)
    }
}

/// Tracks every in-flight broadcast request under one short-held mutex.
#[derive(Debug, Default)]
pub struct BroadcastTracker {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    requests: HashMap<RequestId, RequestState>,
    /// hash → requests that reference it and are not yet terminal for it
    by_hash: HashMap<Hash, HashSet<RequestId>>,
}

impl BroadcastTracker {
    pub fn new() -> BroadcastTracker {
        BroadcastTracker::default()
    }

    /// Register a request and its hashes, all in `Submitted` state.
    /// Re-registering an id merges the new hashes in.
    pub fn register(&self, request_id: RequestId, hashes: impl IntoIterator<Item = Hash>) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        let request = inner
            .requests
            .entry(request_id.clone())
            .or_insert_with(|| RequestState {
                per_hash: BTreeMap::new(),
            });
        let mut added = Vec::new();
        for hash in hashes {
            request.per_hash.entry(hash).or_insert(HashState::Submitted);
            added.push(hash);
        }
        for hash in added {
            inner
                .by_hash
                .entry(hash)
                .or_default()
                .insert(request_id.clone());
        }
    }

    /// Whether any live request references this hash.
    pub fn is_tracked(&self, hash: &Hash) -> bool {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner.by_hash.contains_key(hash)
    }

    /// Move one (request, hash) to a terminal or intermediate state,
    /// returning the client-visible outcomes produced.
    pub fn transition(
        &self,
        request_id: &RequestId,
        hash: &Hash,
        state: HashState,
    ) -> Vec<BroadcastOutcome> {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        inner.transition_one(request_id, hash, state)
    }

    /// Move every request referencing `hash` to `state`.
    pub fn transition_all(&self, hash: &Hash, state: HashState) -> Vec<BroadcastOutcome> {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        let referencing: Vec<RequestId> = inner
            .by_hash
            .get(hash)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut outcomes = Vec::new();
        for request_id in referencing {
            outcomes.extend(inner.transition_one(&request_id, hash, state));
        }
        outcomes
    }

    /// The non-terminal hashes of a request, for timeout bookkeeping.
    pub fn pending_hashes(&self, request_id: &RequestId) -> Vec<Hash> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner
            .requests
            .get(request_id)
            .map(|request| {
                request
                    .per_hash
                    .iter()
                    .filter(|(_, state)| !state.is_terminal())
                    .map(|(hash, _)| *hash)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn live_requests(&self) -> usize {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner.requests.len()
    }
}

impl Inner {
    fn transition_one(
        &mut self,
        request_id: &RequestId,
        hash: &Hash,
        state: HashState,
    ) -> Vec<BroadcastOutcome> {
        let request = match self.requests.get_mut(request_id) {
            Some(request) => request,
            None => return Vec::new(),
        };
        let slot = match request.per_hash.get_mut(hash) {
            Some(slot) => slot,
            None => return Vec::new(),
        };
        // terminal states are sticky; a late node reply cannot overwrite
        // an outcome the client has already been told about
        if slot.is_terminal() {
            return Vec::new();
        }
        *slot = state;

        let mut outcomes = Vec::new();
        if state.is_terminal() {
            outcomes.push(BroadcastOutcome {
                request_id: request_id.clone(),
                hash: *hash,
                state,
            });
            if let Some(set) = self.by_hash.get_mut(hash) {
                set.remove(request_id);
                if set.is_empty() {
                    self.by_hash.remove(hash);
                }
            }
            if request.is_complete() {
                self.requests.remove(request_id);
            }
        }
        outcomes
    }
}
