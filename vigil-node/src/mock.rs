//! A mock node for tests: deterministic mempool, controllable timing.
//!
//! The hooks (`check_sigs`, `skip_zc`, `stall_next_zc`, `present_zc_hash`,
//! `push_zc`) simulate node behaviors. They influence timing and
//! acceptance, never the correctness of the code under test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use vigil_chain::transaction::Hash;
use vigil_chain::transparent::Input;
use vigil_chain::{BitcoinDeserialize, Transaction};
use vigil_mempool::RejectCode;

use crate::{NodeError, NodeEvent, NodeStatus, P2pPort, RpcPort, RpcRejection};

const EVENT_CAPACITY: usize = 256;

pub struct MockNode {
    events: broadcast::Sender<NodeEvent>,
    mempool: Mutex<HashMap<Hash, Vec<u8>>>,
    check_sigs: AtomicBool,
    skip_count: AtomicU32,
    stall_secs: AtomicU64,
    rpc_fail_code: Mutex<Option<RejectCode>>,
    p2p_submissions: AtomicU32,
}

impl MockNode {
    pub fn new() -> MockNode {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        MockNode {
            events,
            mempool: Mutex::new(HashMap::new()),
            check_sigs: AtomicBool::new(false),
            skip_count: AtomicU32::new(0),
            stall_secs: AtomicU64::new(0),
            rpc_fail_code: Mutex::new(None),
            p2p_submissions: AtomicU32::new(0),
        }
    }

    /// Toggle simulated signature checking. The simulation treats any
    /// spending input with an unlock script shorter than two bytes as
    /// unsigned.
    pub fn check_sigs(&self, enabled: bool) {
        self.check_sigs.store(enabled, Ordering::SeqCst);
    }

    /// Silently drop the next `n` P2P broadcasts: no inv, no reject.
    pub fn skip_zc(&self, n: u32) {
        self.skip_count.store(n, Ordering::SeqCst);
    }

    /// Delay handling of the next P2P broadcast.
    pub fn stall_next_zc(&self, secs: u64) {
        self.stall_secs.store(secs, Ordering::SeqCst);
    }

    /// Whether the node's mempool carries this hash.
    pub fn present_zc_hash(&self, hash: Hash) -> bool {
        self.mempool.lock().unwrap().contains_key(&hash)
    }

    /// Inject transactions as though the node relayed them to us.
    pub fn push_zc(&self, raws: Vec<Vec<u8>>) {
        for raw in raws {
            if let Ok(tx) = Transaction::bitcoin_deserialize(&raw[..]) {
                self.mempool.lock().unwrap().insert(tx.hash(), raw.clone());
            }
            let _ = self.events.send(NodeEvent::ZcPushed { raw });
        }
    }

    /// Make every RPC submission fail with the given code.
    pub fn fail_rpc_with(&self, code: RejectCode) {
        *self.rpc_fail_code.lock().unwrap() = Some(code);
    }

    /// Announce a connected block and clear its txids from the mempool.
    pub fn new_block(&self, height: u32, txids: Vec<Hash>) {
        let mut mempool = self.mempool.lock().unwrap();
        for txid in &txids {
            mempool.remove(txid);
        }
        drop(mempool);
        let _ = self.events.send(NodeEvent::NewBlock { height, txids });
    }

    pub fn set_status(&self, status: NodeStatus) {
        let _ = self.events.send(NodeEvent::StatusChanged(status));
    }

    /// How many P2P submissions this node has seen.
    pub fn p2p_submissions(&self) -> u32 {
        self.p2p_submissions.load(Ordering::SeqCst)
    }

    fn sigs_look_valid(tx: &Transaction) -> bool {
        tx.inputs.iter().all(|input| match input {
            Input::PrevOut { unlock_script, .. } => unlock_script.0.len() >= 2,
            Input::Coinbase { .. } => true,
        })
    }

    fn accept(&self, raw: Vec<u8>) -> Result<Hash, RejectCode> {
        let tx = Transaction::bitcoin_deserialize(&raw[..]).map_err(|_| RejectCode::MALFORMED)?;
        if self.check_sigs.load(Ordering::SeqCst) && !Self::sigs_look_valid(&tx) {
            return Err(RejectCode::INVALID);
        }
        let hash = tx.hash();
        self.mempool.lock().unwrap().insert(hash, raw);
        Ok(hash)
    }
}

impl Default for MockNode {
    fn default() -> Self {
        MockNode::new()
    }
}

#[async_trait]
impl P2pPort for MockNode {
    async fn submit(&self, raw: Vec<u8>) -> Result<(), NodeError> {
        let stall = self.stall_secs.swap(0, Ordering::SeqCst);
        if stall > 0 {
            trace!(stall, "mock node stalling");
            tokio::time::sleep(std::time::Duration::from_secs(stall)).await;
        }

        self.p2p_submissions.fetch_add(1, Ordering::SeqCst);

        let skip = self
            .skip_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if skip {
            trace!("mock node skipping broadcast");
            return Ok(());
        }

        // malformed bytes just vanish; a reject needs the hash
        let tx = match Transaction::bitcoin_deserialize(&raw[..]) {
            Ok(tx) => tx,
            Err(_) => return Ok(()),
        };
        let hash = tx.hash();

        if self.check_sigs.load(Ordering::SeqCst) && !Self::sigs_look_valid(&tx) {
            let _ = self.events.send(NodeEvent::Reject {
                hash,
                code: RejectCode::INVALID,
                reason: "bad-sig".to_owned(),
            });
            return Ok(());
        }

        self.mempool.lock().unwrap().insert(hash, raw);
        let _ = self.events.send(NodeEvent::Inv(vec![hash]));
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    async fn fetch_tx(&self, hash: Hash) -> Result<Option<Vec<u8>>, NodeError> {
        let found = self.mempool.lock().unwrap().get(&hash).cloned();
        if found.is_none() {
            let _ = self.events.send(NodeEvent::NotFound(hash));
        }
        Ok(found)
    }
}

#[async_trait]
impl RpcPort for MockNode {
    async fn submit(&self, raw: Vec<u8>) -> Result<(), RpcRejection> {
        if let Some(code) = *self.rpc_fail_code.lock().unwrap() {
            return Err(RpcRejection {
                code,
                reason: "forced rpc failure".to_owned(),
            });
        }
        match self.accept(raw) {
            Ok(_) => Ok(()),
            Err(code) => Err(RpcRejection {
                code,
                reason: "mock rejection".to_owned(),
            }),
        }
    }
}
