//! Test fixtures: a mock confirmed-chain index, an address-interest map,
//! and raw-transaction builders.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use vigil_chain::transaction::{self, LockTime, Transaction};
use vigil_chain::transparent::{Input, OutPoint, Output, Script, ScriptAddr};
use vigil_chain::{Amount, BitcoinSerialize};

use crate::parsed_tx::{AddrInterest, ConfirmedUtxo, UtxoLookup};
use crate::zc_key::DbKey;
use crate::SubscriberId;

/// An in-memory stand-in for the confirmed-chain callbacks.
#[derive(Debug, Default)]
pub struct MockChain {
    utxos: Mutex<HashMap<OutPoint, ConfirmedUtxo>>,
    mined: Mutex<HashSet<transaction::Hash>>,
    next_db_key: Mutex<u64>,
}

impl MockChain {
    pub fn new() -> MockChain {
        MockChain::default()
    }

    /// Record a confirmed output and return the outpoint referencing it.
    pub fn add_utxo(&self, hash_byte: u8, index: u32, value: Amount, scraddr: ScriptAddr) -> OutPoint {
        let outpoint = OutPoint {
            hash: transaction::Hash([hash_byte; 32]),
            index,
        };
        let mut next = self.next_db_key.lock().unwrap();
        *next += 1;
        let db_key = DbKey(next.to_be_bytes());
        self.utxos.lock().unwrap().insert(
            outpoint,
            ConfirmedUtxo {
                value,
                scraddr,
                db_key,
            },
        );
        outpoint
    }

    /// Mark a transaction as mined, so `tx_in_chain` reports it.
    pub fn confirm(&self, hash: transaction::Hash) {
        self.mined.lock().unwrap().insert(hash);
    }
}

impl UtxoLookup for MockChain {
    fn lookup_utxo(&self, outpoint: &OutPoint) -> Option<ConfirmedUtxo> {
        self.utxos.lock().unwrap().get(outpoint).copied()
    }

    fn tx_in_chain(&self, hash: &transaction::Hash) -> bool {
        self.mined.lock().unwrap().contains(hash)
    }
}

/// A fixed scraddr → watchers map.
#[derive(Debug, Default)]
pub struct FixedInterest(pub BTreeMap<ScriptAddr, BTreeSet<SubscriberId>>);

impl FixedInterest {
    pub fn watch(mut self, scraddr: ScriptAddr, subscriber: SubscriberId) -> Self {
        self.0.entry(scraddr).or_default().insert(subscriber);
        self
    }

    /// Watch every address with a single subscriber. Stand-in for "the
    /// wallet watches everything" scenarios.
    pub fn watch_all(subscriber: SubscriberId) -> WatchAll {
        WatchAll(subscriber)
    }
}

impl AddrInterest for FixedInterest {
    fn watchers_of(&self, scraddr: &ScriptAddr) -> BTreeSet<SubscriberId> {
        self.0.get(scraddr).cloned().unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct WatchAll(pub SubscriberId);

impl AddrInterest for WatchAll {
    fn watchers_of(&self, _scraddr: &ScriptAddr) -> BTreeSet<SubscriberId> {
        BTreeSet::from([self.0])
    }
}

/// A distinct P2PKH script address per tag byte.
pub fn scraddr(tag: u8) -> ScriptAddr {
    ScriptAddr::P2pkh([tag; 20])
}

fn p2pkh_script(scraddr: &ScriptAddr) -> Script {
    let hash = match scraddr {
        ScriptAddr::P2pkh(h) => *h,
        other => panic!("fixture scripts are P2PKH, got {:?}", other),
    };
    let mut bytes = vec![0x76, 0xA9, 0x14];
    bytes.extend_from_slice(&hash);
    bytes.extend_from_slice(&[0x88, 0xAC]);
    Script(bytes)
}

/// Build the raw bytes of a transaction spending `spends` into `outs`.
pub fn raw_tx(spends: &[OutPoint], outs: &[(ScriptAddr, Amount)], rbf: bool) -> Vec<u8> {
    let sequence = if rbf { 0xFFFF_FFFD } else { 0xFFFF_FFFF };
    let inputs = spends
        .iter()
        .map(|outpoint| Input::PrevOut {
            outpoint: *outpoint,
            unlock_script: Script(vec![0x51]),
            sequence,
        })
        .collect();
    let outputs = outs
        .iter()
        .map(|(scraddr, value)| Output {
            value: *value,
            lock_script: p2pkh_script(scraddr),
        })
        .collect();
    Transaction::new(2, inputs, outputs, LockTime::unlocked())
        .bitcoin_serialize_to_vec()
        .expect("serializing a fixture tx never fails")
}

/// The outpoint of `output_index` of the transaction encoded by `raw`.
pub fn outpoint_of(raw: &[u8], output_index: u32) -> OutPoint {
    use vigil_chain::BitcoinDeserialize;

    let tx = Transaction::bitcoin_deserialize(raw).expect("fixture txs deserialize");
    OutPoint {
        hash: tx.hash(),
        index: output_index,
    }
}

/// The txid of the transaction encoded by `raw`.
pub fn hash_of(raw: &[u8]) -> transaction::Hash {
    use vigil_chain::BitcoinDeserialize;

    Transaction::bitcoin_deserialize(raw)
        .expect("fixture txs deserialize")
        .hash()
}

/// A notification sink that records everything it is handed.
#[derive(Debug, Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<(SubscriberId, crate::notification::SubscriberNotification)>>,
    outcomes: Mutex<Vec<crate::tracker::BroadcastOutcome>>,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        RecordingSink::default()
    }

    pub fn notifications(&self) -> Vec<(SubscriberId, crate::notification::SubscriberNotification)> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn outcomes(&self) -> Vec<crate::tracker::BroadcastOutcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl crate::notification::NotificationSink for RecordingSink {
    fn notify(
        &self,
        subscriber: SubscriberId,
        notification: crate::notification::SubscriberNotification,
    ) {
        self.notifications
            .lock()
            .unwrap()
            .push((subscriber, notification));
    }

    fn broadcast_outcome(&self, outcome: crate::tracker::BroadcastOutcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }
}
