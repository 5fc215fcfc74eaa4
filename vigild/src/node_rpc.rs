//! The JSON-RPC node connector: the explicit RPC intake path.
//!
//! Implements both node ports over bitcoind's JSON-RPC interface and
//! runs a poller that turns mempool and chain-tip changes into node
//! events, so the rest of the service sees the same stream it would on
//! the P2P path.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use vigil_chain::transaction::Hash;
use vigil_mempool::RejectCode;
use vigil_node::{NodeError, NodeEvent, NodeStatus, P2pPort, RpcPort, RpcRejection};

const EVENT_CAPACITY: usize = 1024;

pub struct NodeRpcClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeRpcClient {
    pub fn new(url: String, user: String, password: String) -> Arc<NodeRpcClient> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(NodeRpcClient {
            http: reqwest::Client::new(),
            url,
            user,
            password,
            events,
        })
    }

    pub(crate) async fn call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, NodeError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "vigild",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        let reply: Value = response
            .json()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(NodeError::Transport(error.to_string()));
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Map a bitcoind RPC error to the P2P-style reject codes clients
    /// understand.
    fn reject_code_for(error_text: &str) -> RejectCode {
        let lowered = error_text.to_lowercase();
        if lowered.contains("insufficient fee") || lowered.contains("min relay fee") {
            RejectCode::INSUFFICIENT_FEE
        } else if lowered.contains("already in block chain") {
            RejectCode::DUPLICATE
        } else if lowered.contains("decode") || lowered.contains("parse") {
            RejectCode::MALFORMED
        } else {
            RejectCode::INVALID
        }
    }

    async fn mempool_txids(&self) -> Result<Vec<Hash>, NodeError> {
        let result = self.call("getrawmempool", json!([])).await?;
        let txids = result
            .as_array()
            .ok_or_else(|| NodeError::Transport("getrawmempool: not an array".into()))?;
        txids
            .iter()
            .map(|txid| {
                txid.as_str()
                    .ok_or_else(|| NodeError::Transport("getrawmempool: bad txid".into()))?
                    .parse()
                    .map_err(|_| NodeError::Transport("getrawmempool: bad txid hex".into()))
            })
            .collect()
    }

    async fn block_count(&self) -> Result<u32, NodeError> {
        let result = self.call("getblockcount", json!([])).await?;
        result
            .as_u64()
            .map(|height| height as u32)
            .ok_or_else(|| NodeError::Transport("getblockcount: not a number".into()))
    }

    async fn block_txids(&self, height: u32) -> Result<Vec<Hash>, NodeError> {
        let hash = self.call("getblockhash", json!([height])).await?;
        let block = self.call("getblock", json!([hash, 1])).await?;
        let txids = block
            .get("tx")
            .and_then(Value::as_array)
            .ok_or_else(|| NodeError::Transport("getblock: missing tx list".into()))?;
        txids
            .iter()
            .map(|txid| {
                txid.as_str()
                    .ok_or_else(|| NodeError::Transport("getblock: bad txid".into()))?
                    .parse()
                    .map_err(|_| NodeError::Transport("getblock: bad txid hex".into()))
            })
            .collect()
    }
}

#[async_trait]
impl RpcPort for NodeRpcClient {
    async fn submit(&self, raw: Vec<u8>) -> Result<(), RpcRejection> {
        match self
            .call("sendrawtransaction", json!([hex::encode(&raw)]))
            .await
        {
            Ok(_) => Ok(()),
            Err(NodeError::Transport(text)) => Err(RpcRejection {
                code: Self::reject_code_for(&text),
                reason: text,
            }),
            Err(other) => Err(RpcRejection {
                code: RejectCode::OTHER,
                reason: other.to_string(),
            }),
        }
    }
}

#[async_trait]
impl P2pPort for NodeRpcClient {
    async fn submit(&self, raw: Vec<u8>) -> Result<(), NodeError> {
        // no P2P transport in the RPC-only daemon; the broadcaster's
        // fallback ladder lands on the RPC port instead
        let _ = raw;
        Err(NodeError::Transport("rpc-only".into()))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    async fn fetch_tx(&self, hash: Hash) -> Result<Option<Vec<u8>>, NodeError> {
        match self
            .call("getrawtransaction", json!([hash.to_string(), false]))
            .await
        {
            Ok(Value::String(tx_hex)) => Ok(hex::decode(tx_hex).map(Some).unwrap_or(None)),
            Ok(_) => Ok(None),
            Err(error) => {
                trace!(%error, ?hash, "getrawtransaction miss");
                Ok(None)
            }
        }
    }
}

/// Poll the node: new mempool entries become `ZcPushed`, tip changes
/// become `NewBlock`, connectivity flips become `StatusChanged`.
pub async fn run_node_poller(client: Arc<NodeRpcClient>, poll_interval: Duration) {
    let mut known_txids: HashSet<Hash> = HashSet::new();
    let mut last_height: Option<u32> = None;
    let mut connected = false;
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let height = match client.block_count().await {
            Ok(height) => {
                if !connected {
                    connected = true;
                    info!(height, "node connection established");
                    let _ = client.events.send(NodeEvent::StatusChanged(NodeStatus {
                        connected: true,
                        synced: true,
                        height,
                    }));
                }
                height
            }
            Err(error) => {
                if connected {
                    warn!(%error, "node connection lost");
                    connected = false;
                    let _ = client
                        .events
                        .send(NodeEvent::StatusChanged(NodeStatus::disconnected()));
                }
                continue;
            }
        };

        // blocks first, so a tx that was mined between polls drops out
        // of the snapshot before its mempool disappearance is observed
        if let Some(previous) = last_height {
            for new_height in (previous + 1)..=height {
                match client.block_txids(new_height).await {
                    Ok(txids) => {
                        debug!(new_height, txs = txids.len(), "new block");
                        for txid in &txids {
                            known_txids.remove(txid);
                        }
                        let _ = client.events.send(NodeEvent::NewBlock {
                            height: new_height,
                            txids,
                        });
                    }
                    Err(error) => warn!(%error, new_height, "getblock failed"),
                }
            }
        }
        last_height = Some(height);

        match client.mempool_txids().await {
            Ok(txids) => {
                let current: HashSet<Hash> = txids.into_iter().collect();
                for txid in current.difference(&known_txids) {
                    match client.fetch_tx(*txid).await {
                        Ok(Some(raw)) => {
                            let _ = client.events.send(NodeEvent::ZcPushed { raw });
                        }
                        Ok(None) => trace!(?txid, "mempool tx vanished before fetch"),
                        Err(error) => warn!(%error, ?txid, "fetch_tx failed"),
                    }
                }
                known_txids = current;
            }
            Err(error) => warn!(%error, "getrawmempool failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_codes_map_from_error_text() {
        assert_eq!(
            NodeRpcClient::reject_code_for("66: min relay fee not met"),
            RejectCode::INSUFFICIENT_FEE
        );
        assert_eq!(
            NodeRpcClient::reject_code_for("transaction already in block chain"),
            RejectCode::DUPLICATE
        );
        assert_eq!(
            NodeRpcClient::reject_code_for("TX decode failed"),
            RejectCode::MALFORMED
        );
        assert_eq!(
            NodeRpcClient::reject_code_for("txn-mempool-conflict"),
            RejectCode::INVALID
        );
    }
}
