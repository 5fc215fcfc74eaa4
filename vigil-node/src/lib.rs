//! The narrow port to the Bitcoin node, and the broadcaster that drives
//! it.
//!
//! Two submission paths exist behind the same pair of traits: the P2P
//! path (asynchronous: an inv implies acceptance, a reject message
//! refusal, silence a timeout) and the RPC path (synchronous
//! accept/reject), used as a fallback and as the explicit RPC-only mode.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use vigil_chain::transaction::Hash;
use vigil_mempool::RejectCode;

pub mod broadcaster;
pub mod pump;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use broadcaster::NodeBroadcaster;
pub use pump::StatusSink;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node transport unavailable: {0}")]
    Transport(String),
    #[error("node event stream lagged")]
    Lagged,
}

/// A synchronous refusal from the RPC path.
#[derive(Clone, Debug, Error)]
#[error("rpc rejected tx: {reason} (code {code:?})")]
pub struct RpcRejection {
    pub code: RejectCode,
    pub reason: String,
}

/// Connection and sync state of the node, surfaced to subscribers as
/// `NodeStatus` notifications.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub connected: bool,
    pub synced: bool,
    pub height: u32,
}

impl NodeStatus {
    pub fn disconnected() -> NodeStatus {
        NodeStatus {
            connected: false,
            synced: false,
            height: 0,
        }
    }
}

/// Everything the node pushes at us.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// The node advertises transactions (acceptance of ours included).
    Inv(Vec<Hash>),
    /// The node relayed a new mempool transaction.
    ZcPushed { raw: Vec<u8> },
    /// The node refused a transaction.
    Reject {
        hash: Hash,
        code: RejectCode,
        reason: String,
    },
    /// The node answered a getdata with notfound.
    NotFound(Hash),
    /// Connection or sync state changed.
    StatusChanged(NodeStatus),
    /// A block connected; mined txids leave the mempool.
    NewBlock { height: u32, txids: Vec<Hash> },
}

/// The P2P side of the node port.
#[async_trait]
pub trait P2pPort: Send + Sync {
    /// Push a raw transaction at the node. Resolution arrives (or does
    /// not) on the event stream.
    async fn submit(&self, raw: Vec<u8>) -> Result<(), NodeError>;

    /// Subscribe to inv/tx/reject/status events.
    fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent>;

    /// Fetch a transaction the node advertised.
    async fn fetch_tx(&self, hash: Hash) -> Result<Option<Vec<u8>>, NodeError>;
}

/// The RPC side: synchronous submission.
#[async_trait]
pub trait RpcPort: Send + Sync {
    async fn submit(&self, raw: Vec<u8>) -> Result<(), RpcRejection>;
}

/// Broadcaster tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// How long to wait for the node's inv before falling back.
    pub inv_timeout: Duration,
    /// How long a pending reject may take to resolve.
    pub reject_timeout: Duration,
    /// Skip the P2P path entirely.
    pub rpc_only: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            inv_timeout: Duration::from_secs(3),
            reject_timeout: Duration::from_secs(30),
            rpc_only: false,
        }
    }
}
