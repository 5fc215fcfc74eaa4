//! Node-to-snapshot intake: the mock node pushes ZCs and blocks through
//! the event pump into a live parser.

use std::sync::Arc;
use std::time::Duration;

use vigil_chain::Amount;

use vigil_mempool::parser;
use vigil_mempool::testing::{hash_of, raw_tx, scraddr, MockChain, RecordingSink};
use vigil_mempool::{BroadcastTracker, MempoolConfig};

use vigil_node::mock::MockNode;
use vigil_node::{pump, NodeStatus, StatusSink};

#[derive(Default)]
struct RecordingStatus {
    statuses: std::sync::Mutex<Vec<NodeStatus>>,
    blocks: std::sync::Mutex<Vec<u32>>,
}

impl StatusSink for RecordingStatus {
    fn node_status(&self, status: NodeStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn new_block(&self, height: u32) {
        self.blocks.lock().unwrap().push(height);
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test(flavor = "multi_thread")]
async fn pushed_zcs_reach_the_snapshot_and_blocks_clear_them() {
    vigil_test::init();

    let chain = Arc::new(MockChain::new());
    let op = chain.add_utxo(0xA0, 0, Amount::from_btc(1), scraddr(0xA0));
    let raw = raw_tx(&[op], &[(scraddr(0xB0), Amount::from_sat(90_000_000))], false);

    let node = Arc::new(MockNode::new());
    let sink = Arc::new(RecordingSink::new());
    let tracker = Arc::new(BroadcastTracker::new());
    let status = Arc::new(RecordingStatus::default());

    let (handle, _parser_join) = parser::spawn(
        MempoolConfig::default(),
        chain.clone(),
        Arc::new(vigil_mempool::testing::FixedInterest::default()),
        sink,
        tracker,
    );
    let _pump = tokio::spawn(pump::run_event_pump(
        node.clone(),
        handle.clone(),
        status.clone(),
    ));

    // the node relays a new mempool tx
    node.push_zc(vec![raw.clone()]);
    let hash = hash_of(&raw);
    let probe = handle.clone();
    wait_for("zc to stage", move || {
        probe.current_snapshot().has_hash(&hash)
    })
    .await;

    // a block mines it: it leaves the snapshot, clients hear the height
    node.new_block(101, vec![hash]);
    let probe = handle.clone();
    wait_for("zc to clear", move || probe.current_snapshot().is_empty()).await;
    wait_for("block notification", || {
        status.blocks.lock().unwrap().contains(&101)
    })
    .await;

    node.set_status(NodeStatus {
        connected: true,
        synced: true,
        height: 101,
    });
    wait_for("status notification", || {
        !status.statuses.lock().unwrap().is_empty()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_node_delays_but_does_not_lose_a_broadcast() {
    vigil_test::init();

    let chain = MockChain::new();
    let op = chain.add_utxo(0xA1, 0, Amount::from_btc(1), scraddr(0xA1));
    let raw = raw_tx(&[op], &[(scraddr(0xB1), Amount::from_sat(90_000_000))], false);

    let node = Arc::new(MockNode::new());
    node.stall_next_zc(1);

    let started = std::time::Instant::now();
    vigil_node::P2pPort::submit(&*node, raw.clone()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(node.present_zc_hash(hash_of(&raw)));
}
