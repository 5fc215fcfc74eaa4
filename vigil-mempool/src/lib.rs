//! The zero-confirmation tracking engine.
//!
//! This crate owns the mempool snapshot data structure and its lifecycle:
//! transaction intake and resolution, replace-by-fee conflict handling,
//! parent→descendant invalidation, the broadcast-request tracker, and the
//! per-subscriber notification fan-out. All snapshot mutation happens on
//! the single [`parser::ZcParser`] task; readers share immutable
//! [`snapshot::MempoolSnapshot`] handles.

use std::time::Duration;

pub mod filter;
pub mod notification;
pub mod parsed_tx;
pub mod parser;
pub mod snapshot;
pub mod tracker;
pub mod watcher;
pub mod zc_key;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use filter::FilteredTx;
pub use parsed_tx::{AddrInterest, ConfirmedUtxo, ParsedTx, ResolutionState, UtxoLookup};
pub use snapshot::{MempoolSnapshot, SnapshotBuilder, StageError, TxIoPair};
pub use tracker::{BroadcastTracker, HashState, RejectCode, RequestId};
pub use zc_key::{DbKey, TxIoKey, ZcKey};

/// A boxed error at a service boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Identifies a registered notification subscriber.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct SubscriberId(pub u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

use serde::{Deserialize, Serialize};

/// Tuning knobs for the mempool engine. Immutable once built; threaded
/// through constructors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MempoolConfig {
    /// Committed-snapshot generations retained for introspection.
    pub mempool_depth: usize,
    /// Commits between full index merges.
    pub pool_merge_threshold: u64,
    /// How long a parent-missing ZC may sit in the watcher pool.
    pub watcher_timeout: Duration,
    /// Intake channel capacity.
    pub event_capacity: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            mempool_depth: 4,
            pool_merge_threshold: 100,
            watcher_timeout: Duration::from_secs(120),
            event_capacity: 1024,
        }
    }
}
