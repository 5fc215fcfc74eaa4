//! Submits transactions to the node, P2P first with RPC fallback.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, trace, warn};

use vigil_chain::transaction::Hash;
use vigil_chain::{BitcoinDeserialize, Transaction};

use vigil_mempool::notification::NotificationSink;
use vigil_mempool::{BroadcastTracker, HashState, RequestId};

use crate::{BroadcastConfig, NodeEvent, P2pPort, RpcPort};

/// How one hash fared on the P2P path.
enum P2pVerdict {
    Accepted,
    Rejected(vigil_mempool::RejectCode),
    /// Timeout or node "unknown": promote to the RPC path.
    Promote,
}

pub struct NodeBroadcaster {
    p2p: Arc<dyn P2pPort>,
    rpc: Arc<dyn RpcPort>,
    tracker: Arc<BroadcastTracker>,
    sink: Arc<dyn NotificationSink>,
    config: BroadcastConfig,
}

impl NodeBroadcaster {
    pub fn new(
        p2p: Arc<dyn P2pPort>,
        rpc: Arc<dyn RpcPort>,
        tracker: Arc<BroadcastTracker>,
        sink: Arc<dyn NotificationSink>,
        config: BroadcastConfig,
    ) -> NodeBroadcaster {
        NodeBroadcaster {
            p2p,
            rpc,
            tracker,
            sink,
            config,
        }
    }

    /// Submit a batch in order. One tx's failure does not block the
    /// next; a dependent child of a rejected parent will be rejected
    /// downstream on its own.
    pub async fn broadcast_batch(&self, request_id: RequestId, raws: Vec<Vec<u8>>) {
        let mut txs = Vec::with_capacity(raws.len());
        for raw in raws {
            match Transaction::bitcoin_deserialize(&raw[..]) {
                Ok(tx) => txs.push((tx.hash(), raw)),
                Err(error) => {
                    // dispatch validates payloads; anything reaching here
                    // unparseable is dropped with a log line only
                    warn!(%error, "skipping unparseable tx in broadcast batch");
                }
            }
        }

        self.tracker
            .register(request_id.clone(), txs.iter().map(|(hash, _)| *hash));

        for (hash, raw) in txs {
            self.broadcast_one(&request_id, hash, raw).await;
        }
    }

    async fn broadcast_one(&self, request_id: &RequestId, hash: Hash, raw: Vec<u8>) {
        metrics::counter!("node.broadcast.submitted").increment(1);

        if !self.config.rpc_only {
            match self.p2p_path(hash, &raw).await {
                P2pVerdict::Accepted => {
                    trace!(?hash, "node acknowledged via inv");
                    // intermediate state; the success terminal is the
                    // committed snapshot
                    self.tracker.transition_all(&hash, HashState::AcceptedByNode);
                    return;
                }
                P2pVerdict::Rejected(code) => {
                    debug!(?hash, ?code, "node rejected via p2p");
                    self.emit(
                        self.tracker
                            .transition(request_id, &hash, HashState::RejectedByNode(code)),
                    );
                    return;
                }
                P2pVerdict::Promote => {
                    debug!(?hash, "p2p path inconclusive, falling back to rpc");
                    metrics::counter!("node.broadcast.rpc_fallback").increment(1);
                }
            }
        }

        self.rpc_path(request_id, hash, raw).await;
    }

    async fn p2p_path(&self, hash: Hash, raw: &[u8]) -> P2pVerdict {
        let mut events = self.p2p.subscribe_events();
        if let Err(error) = self.p2p.submit(raw.to_vec()).await {
            warn!(%error, ?hash, "p2p submit failed");
            return P2pVerdict::Promote;
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(NodeEvent::Inv(hashes)) if hashes.contains(&hash) => {
                        break P2pVerdict::Accepted;
                    }
                    Ok(NodeEvent::Reject {
                        hash: rejected,
                        code,
                        ..
                    }) if rejected == hash => break P2pVerdict::Rejected(code),
                    Ok(NodeEvent::NotFound(missed)) if missed == hash => {
                        // the node does not know the tx it should have
                        // just learned; treat like silence
                        break P2pVerdict::Promote;
                    }
                    Ok(_) => continue,
                    Err(_) => break P2pVerdict::Promote,
                }
            }
        };

        match timeout(self.config.inv_timeout, wait).await {
            Ok(verdict) => verdict,
            Err(_elapsed) => P2pVerdict::Promote,
        }
    }

    async fn rpc_path(&self, request_id: &RequestId, hash: Hash, raw: Vec<u8>) {
        let submit = timeout(self.config.reject_timeout, self.rpc.submit(raw));
        match submit.await {
            Ok(Ok(())) => {
                trace!(?hash, "rpc accepted");
                // the tx re-surfaces through the normal mempool flow
                self.tracker.transition_all(&hash, HashState::AcceptedByNode);
            }
            Ok(Err(rejection)) => {
                debug!(?hash, code = ?rejection.code, reason = %rejection.reason, "rpc rejected");
                self.emit(self.tracker.transition(
                    request_id,
                    &hash,
                    HashState::RejectedByNode(rejection.code),
                ));
            }
            Err(_elapsed) => {
                debug!(?hash, "rpc submit timed out");
                self.emit(
                    self.tracker
                        .transition(request_id, &hash, HashState::TimedOut),
                );
            }
        }
    }

    fn emit(&self, outcomes: Vec<vigil_mempool::tracker::BroadcastOutcome>) {
        for outcome in outcomes {
            self.sink.broadcast_outcome(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use vigil_chain::Amount;
    use vigil_mempool::testing::{hash_of, raw_tx, scraddr, MockChain, RecordingSink};
    use vigil_mempool::{BroadcastTracker, HashState, RejectCode, RequestId};

    use crate::mock::MockNode;
    use crate::BroadcastConfig;

    use super::*;

    fn fast_config() -> BroadcastConfig {
        BroadcastConfig {
            inv_timeout: Duration::from_millis(200),
            reject_timeout: Duration::from_millis(500),
            rpc_only: false,
        }
    }

    fn fixture_tx(tag: u8) -> Vec<u8> {
        let chain = MockChain::new();
        let op = chain.add_utxo(tag, 0, Amount::from_btc(1), scraddr(tag));
        raw_tx(&[op], &[(scraddr(0x50 + tag), Amount::from_sat(90_000_000))], false)
    }

    fn harness(node: Arc<MockNode>) -> (NodeBroadcaster, Arc<BroadcastTracker>, Arc<RecordingSink>) {
        let tracker = Arc::new(BroadcastTracker::new());
        let sink = Arc::new(RecordingSink::new());
        let broadcaster = NodeBroadcaster::new(
            node.clone(),
            node,
            tracker.clone(),
            sink.clone(),
            fast_config(),
        );
        (broadcaster, tracker, sink)
    }

    #[tokio::test]
    async fn accepted_tx_reaches_accepted_state() {
        vigil_test::init();

        let node = Arc::new(MockNode::new());
        let (broadcaster, tracker, _sink) = harness(node.clone());

        let raw = fixture_tx(1);
        let hash = hash_of(&raw);
        broadcaster
            .broadcast_batch(RequestId(b"r1".to_vec()), vec![raw])
            .await;

        assert!(node.present_zc_hash(hash));
        // not terminal: the request still waits for the snapshot
        assert!(tracker.is_tracked(&hash));
    }

    #[tokio::test]
    async fn skipped_broadcast_falls_back_to_rpc() {
        vigil_test::init();

        let node = Arc::new(MockNode::new());
        node.skip_zc(1);
        let (broadcaster, tracker, _sink) = harness(node.clone());

        let raw = fixture_tx(2);
        let hash = hash_of(&raw);
        broadcaster
            .broadcast_batch(RequestId(b"r2".to_vec()), vec![raw])
            .await;

        // the p2p submit was swallowed, but the rpc fallback landed it
        assert!(node.present_zc_hash(hash));
        assert!(tracker.is_tracked(&hash));
    }

    #[tokio::test]
    async fn node_rejection_surfaces_to_the_request() {
        vigil_test::init();

        // fixture txs carry placeholder unlock scripts, so enabling
        // signature checking makes the mock node refuse them
        let node = Arc::new(MockNode::new());
        node.check_sigs(true);
        let (broadcaster, tracker, sink) = harness(node.clone());

        let raw = fixture_tx(3);
        let hash = hash_of(&raw);
        let request = RequestId(b"r3".to_vec());
        broadcaster.broadcast_batch(request.clone(), vec![raw]).await;

        let outcomes = sink.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].request_id, request);
        assert_eq!(
            outcomes[0].state,
            HashState::RejectedByNode(RejectCode::INVALID)
        );
        assert!(!tracker.is_tracked(&hash));
    }

    #[tokio::test]
    async fn batch_failures_do_not_block_siblings() {
        vigil_test::init();

        let node = Arc::new(MockNode::new());
        // first submission dropped; the rest flow normally
        node.skip_zc(1);
        node.fail_rpc_with(RejectCode::OTHER);
        let (broadcaster, _tracker, sink) = harness(node.clone());

        let first = fixture_tx(4);
        let second = fixture_tx(5);
        let request = RequestId(b"r4".to_vec());
        broadcaster
            .broadcast_batch(request.clone(), vec![first.clone(), second.clone()])
            .await;

        // the first died on both paths; the second landed via p2p
        let outcomes = sink.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].hash, hash_of(&first));
        assert!(node.present_zc_hash(hash_of(&second)));
    }

    #[tokio::test]
    async fn rpc_only_mode_never_touches_p2p() {
        vigil_test::init();

        let node = Arc::new(MockNode::new());
        let tracker = Arc::new(BroadcastTracker::new());
        let sink = Arc::new(RecordingSink::new());
        let broadcaster = NodeBroadcaster::new(
            node.clone(),
            node.clone(),
            tracker.clone(),
            sink,
            BroadcastConfig {
                rpc_only: true,
                ..fast_config()
            },
        );

        let raw = fixture_tx(6);
        broadcaster
            .broadcast_batch(RequestId(b"r5".to_vec()), vec![raw.clone()])
            .await;

        assert_eq!(node.p2p_submissions(), 0);
        assert!(node.present_zc_hash(hash_of(&raw)));
    }
}
