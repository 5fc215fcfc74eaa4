//! Notification types the parser fans out after each commit.

use std::collections::BTreeSet;

use vigil_chain::transaction::Hash;
use vigil_chain::transparent::ScriptAddr;

use crate::tracker::BroadcastOutcome;
use crate::SubscriberId;

/// One accepted ZC as seen by one subscriber: the hash plus the touched
/// addresses that subscriber watches.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZcEntry {
    pub hash: Hash,
    pub scraddrs: BTreeSet<ScriptAddr>,
}

/// What a subscriber learns about a commit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscriberNotification {
    /// New ZCs entered the committed snapshot.
    ZcAccepted { sequence: u64, entries: Vec<ZcEntry> },
    /// Previously-notified ZCs left the snapshot (replaced, conflicted
    /// out, or mined).
    ZcInvalidated { sequence: u64, hashes: Vec<Hash> },
}

impl SubscriberNotification {
    /// The commit sequence this notification belongs to. Monotonic per
    /// subscriber, so clients can detect gaps and duplicates.
    pub fn sequence(&self) -> u64 {
        match self {
            SubscriberNotification::ZcAccepted { sequence, .. } => *sequence,
            SubscriberNotification::ZcInvalidated { sequence, .. } => *sequence,
        }
    }
}

/// Where the parser delivers its output. Implemented by the subscriber
/// registry; delivery is at-least-once and must not block the parser for
/// long (bounded per-subscriber queues drop the connection instead).
pub trait NotificationSink: Send + Sync {
    fn notify(&self, subscriber: SubscriberId, notification: SubscriberNotification);

    /// A per-hash broadcast outcome for a tracked request.
    fn broadcast_outcome(&self, outcome: BroadcastOutcome);
}

/// A sink that discards everything; placeholder for headless setups.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _subscriber: SubscriberId, _notification: SubscriberNotification) {}

    fn broadcast_outcome(&self, _outcome: BroadcastOutcome) {}
}
