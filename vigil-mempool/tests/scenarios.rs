//! End-to-end mempool scenarios: stage/commit/drop lifecycles, cascading
//! invalidation, RBF replacement, batch pushes, and the watcher pool.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use vigil_chain::Amount;

use vigil_mempool::filter::FilteredTx;
use vigil_mempool::notification::SubscriberNotification;
use vigil_mempool::parser::{self, ParserEvent};
use vigil_mempool::testing::{
    hash_of, outpoint_of, raw_tx, scraddr, FixedInterest, MockChain, RecordingSink,
};
use vigil_mempool::{
    BroadcastTracker, HashState, MempoolConfig, ParsedTx, RejectCode, RequestId, SnapshotBuilder,
    SubscriberId, TxIoKey, ZcKey,
};

fn test_config() -> MempoolConfig {
    MempoolConfig {
        mempool_depth: 1,
        pool_merge_threshold: 2,
        watcher_timeout: Duration::from_millis(200),
        event_capacity: 64,
    }
}

/// Parse and resolve a raw tx against `chain` and the builder, ready for
/// staging.
fn resolved(raw: &[u8], chain: &MockChain, builder: &SnapshotBuilder) -> Arc<ParsedTx> {
    let mut parsed = ParsedTx::parse(raw).unwrap();
    let missing = parsed.resolve(chain, builder);
    assert!(missing.is_empty(), "fixture tx must resolve: {:?}", missing);
    Arc::new(parsed)
}

#[test]
fn single_stage_commit_drop() {
    vigil_test::init();

    let chain = MockChain::new();
    let op_a0 = chain.add_utxo(0xA0, 0, Amount::from_btc(10), scraddr(0xA0));

    let mut builder = SnapshotBuilder::new(&test_config());
    let t0 = raw_tx(
        &[op_a0],
        &[
            (scraddr(0xB0), Amount::from_btc(7)),
            (scraddr(0xC0), Amount::from_btc(3)),
        ],
        false,
    );

    let key = builder.assign_key();
    assert_eq!(key, ZcKey::from_counter(1));
    assert_eq!(key.to_bytes(), [0xFF, 0xFF, 0, 0, 0, 1]);

    let tx = resolved(&t0, &chain, &builder);
    builder
        .stage(key, tx.clone(), FilteredTx::default())
        .unwrap();

    let committed = builder.commit();
    assert_eq!(committed.key_for_hash(&hash_of(&t0)), Some(key));
    assert_eq!(committed.tx_by_key(key).unwrap().hash, tx.hash);
    assert_eq!(committed.sequence(), 1);

    let dropped = builder.drop_zc(key);
    assert_eq!(dropped.len(), 1);
    assert!(dropped.contains_key(&key));

    let committed = builder.commit();
    assert!(committed.is_empty());
    assert_eq!(committed.top_zc_id(), 1);
}

#[test]
fn parent_drop_cascades_to_child() {
    vigil_test::init();

    let chain = MockChain::new();
    let op_a0 = chain.add_utxo(0xA0, 0, Amount::from_btc(10), scraddr(0xA0));

    let mut builder = SnapshotBuilder::new(&test_config());
    let t0 = raw_tx(&[op_a0], &[(scraddr(0xB0), Amount::from_btc(9))], false);
    let k0 = builder.assign_key();
    let parent = resolved(&t0, &chain, &builder);
    builder.stage(k0, parent, FilteredTx::default()).unwrap();

    let t1 = raw_tx(
        &[outpoint_of(&t0, 0)],
        &[(scraddr(0xD0), Amount::from_btc(6))],
        false,
    );
    let k1 = builder.assign_key();
    let child = resolved(&t1, &chain, &builder);
    builder.stage(k1, child, FilteredTx::default()).unwrap();

    // the child is linked into its parent's TxIO pair
    let pair = builder
        .snapshot()
        .txio_by_key(&TxIoKey::Zc(k0, 0))
        .unwrap();
    assert_eq!(pair.spender.map(|(key, _)| key), Some(k1));

    let dropped = builder.drop_zc(k0);
    assert_eq!(
        dropped.keys().copied().collect::<Vec<_>>(),
        vec![k0, k1],
        "dropping the parent takes the whole subtree"
    );

    let committed = builder.commit();
    assert!(committed.is_empty());
    assert_eq!(committed.top_zc_id(), 2);
}

#[test]
fn merge_threshold_trips_full_rebuild() {
    vigil_test::init();

    let chain = MockChain::new();
    let mut builder = SnapshotBuilder::new(&test_config());
    assert_eq!(builder.merge_count(), 0);

    for round in 0u8..2 {
        let op = chain.add_utxo(round, 0, Amount::from_btc(1), scraddr(round));
        let raw = raw_tx(&[op], &[(scraddr(0x70 + round), Amount::from_sat(90_000_000))], false);
        let key = builder.assign_key();
        let tx = resolved(&raw, &chain, &builder);
        builder.stage(key, tx, FilteredTx::default()).unwrap();
        builder.commit();
    }

    // POOL_MERGE_THRESHOLD=2: the second commit performed the merge
    assert_eq!(builder.merge_count(), 1);

    // the rebuilt indexes still answer correctly
    let snapshot = builder.commit();
    assert_eq!(snapshot.len(), 2);
    for (key, tx) in snapshot.iter() {
        assert_eq!(snapshot.key_for_hash(&tx.hash), Some(key));
    }
}

#[test]
fn drop_then_restage_yields_greater_key_same_bytes() {
    vigil_test::init();

    let chain = MockChain::new();
    let op = chain.add_utxo(0xA0, 0, Amount::from_btc(2), scraddr(0xA0));
    let mut builder = SnapshotBuilder::new(&test_config());
    let raw = raw_tx(&[op], &[(scraddr(0xB0), Amount::from_btc(1))], false);

    let first_key = builder.assign_key();
    let first = resolved(&raw, &chain, &builder);
    builder.stage(first_key, first.clone(), FilteredTx::default()).unwrap();
    builder.drop_zc(first_key);

    let second_key = builder.assign_key();
    let second = resolved(&raw, &chain, &builder);
    builder.stage(second_key, second.clone(), FilteredTx::default()).unwrap();

    assert!(second_key > first_key);
    assert_eq!(first.hash, second.hash);
    assert_eq!(first.raw, second.raw);
}

// ---- parser-level scenarios ----

struct Harness {
    sink: Arc<RecordingSink>,
    tracker: Arc<BroadcastTracker>,
    handle: parser::ParserHandle,
    _join: tokio::task::JoinHandle<()>,
}

fn spawn_parser(chain: MockChain, interest: FixedInterest) -> Harness {
    let chain = Arc::new(chain);
    let sink = Arc::new(RecordingSink::new());
    let tracker = Arc::new(BroadcastTracker::new());
    let (handle, join) = parser::spawn(
        test_config(),
        chain.clone(),
        Arc::new(interest),
        sink.clone(),
        tracker.clone(),
    );
    Harness {
        sink,
        tracker,
        handle,
        _join: join,
    }
}

/// Wait until the committed snapshot reaches `sequence`.
async fn sync_to(handle: &parser::ParserHandle, sequence: u64) {
    let mut rx = handle.subscribe_snapshots();
    loop {
        if rx.borrow().sequence() >= sequence {
            return;
        }
        rx.changed().await.expect("parser alive");
    }
}

#[tokio::test]
async fn rbf_with_sufficient_fee_replaces_subtree() {
    vigil_test::init();

    let watcher = SubscriberId(1);
    let chain = MockChain::new();
    let addr = scraddr(0xA0);
    let op_a0 = chain.add_utxo(0xA0, 0, Amount::from_btc(10), addr);
    let interest = FixedInterest::default()
        .watch(addr, watcher)
        .watch(scraddr(0xB0), watcher)
        .watch(scraddr(0xC0), watcher);

    let h = spawn_parser(chain, interest);

    // T0 pays a 1 BTC fee
    let t0 = raw_tx(&[op_a0], &[(scraddr(0xB0), Amount::from_btc(9))], false);
    h.handle
        .send(ParserEvent::NewZcFromNode { raw: t0.clone() })
        .await
        .unwrap();
    sync_to(&h.handle, 1).await;
    assert!(h.handle.current_snapshot().has_hash(&hash_of(&t0)));

    // T0' pays 2 BTC and signals replaceability
    let t0_prime = raw_tx(&[op_a0], &[(scraddr(0xC0), Amount::from_btc(8))], true);
    h.handle
        .send(ParserEvent::NewZcFromNode {
            raw: t0_prime.clone(),
        })
        .await
        .unwrap();
    sync_to(&h.handle, 2).await;

    let snapshot = h.handle.current_snapshot();
    assert!(!snapshot.has_hash(&hash_of(&t0)));
    assert!(snapshot.has_hash(&hash_of(&t0_prime)));

    // the watcher saw T0 accepted, then invalidated, then T0' accepted
    let notifications = h.sink.notifications();
    let kinds: Vec<&'static str> = notifications
        .iter()
        .map(|(_, n)| match n {
            SubscriberNotification::ZcAccepted { .. } => "accepted",
            SubscriberNotification::ZcInvalidated { .. } => "invalidated",
        })
        .collect();
    assert_eq!(kinds, vec!["accepted", "accepted", "invalidated"]);
    match &notifications[2].1 {
        SubscriberNotification::ZcInvalidated { hashes, .. } => {
            assert_eq!(hashes, &vec![hash_of(&t0)]);
        }
        other => panic!("expected invalidation, got {:?}", other),
    }
}

#[tokio::test]
async fn rbf_with_insufficient_fee_is_refused() {
    vigil_test::init();

    let chain = MockChain::new();
    let op_a0 = chain.add_utxo(0xA0, 0, Amount::from_btc(10), scraddr(0xA0));
    let h = spawn_parser(chain, FixedInterest::default());

    let t0 = raw_tx(&[op_a0], &[(scraddr(0xB0), Amount::from_btc(8))], false);
    h.handle
        .send(ParserEvent::NewZcFromNode { raw: t0.clone() })
        .await
        .unwrap();
    sync_to(&h.handle, 1).await;

    // equal fee, RBF signal set: still refused
    let request = RequestId(b"rbf-low".to_vec());
    let t0_prime = raw_tx(&[op_a0], &[(scraddr(0xC0), Amount::from_btc(8))], true);
    h.tracker
        .register(request.clone(), [hash_of(&t0_prime)]);
    h.handle
        .send(ParserEvent::NewZcBatchFromClient {
            raws: vec![t0_prime.clone()],
            request_id: request.clone(),
        })
        .await
        .unwrap();

    // the refusal is immediate; wait for the outcome rather than a commit
    let outcome = loop {
        let outcomes = h.sink.outcomes();
        if let Some(outcome) = outcomes.first() {
            break outcome.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(outcome.request_id, request);
    assert_eq!(
        outcome.state,
        HashState::RejectedByNode(RejectCode::INSUFFICIENT_FEE)
    );

    let snapshot = h.handle.current_snapshot();
    assert!(snapshot.has_hash(&hash_of(&t0)));
    assert!(!snapshot.has_hash(&hash_of(&t0_prime)));
}

#[tokio::test]
async fn batch_push_with_one_already_in_mempool() {
    vigil_test::init();

    let chain = MockChain::new();
    let op1 = chain.add_utxo(0x01, 0, Amount::from_btc(1), scraddr(0x01));
    let op2 = chain.add_utxo(0x02, 0, Amount::from_btc(1), scraddr(0x02));
    let op3 = chain.add_utxo(0x03, 0, Amount::from_btc(1), scraddr(0x03));
    let h = spawn_parser(chain, FixedInterest::default());

    // pre-stage T1 via the node path
    let t1 = raw_tx(&[op1], &[(scraddr(0x11), Amount::from_sat(90_000_000))], false);
    h.handle
        .send(ParserEvent::NewZcFromNode { raw: t1.clone() })
        .await
        .unwrap();
    sync_to(&h.handle, 1).await;

    let t2 = raw_tx(&[op2], &[(scraddr(0x12), Amount::from_sat(90_000_000))], false);
    let t3 = raw_tx(&[op3], &[(scraddr(0x13), Amount::from_sat(90_000_000))], false);

    let request = RequestId(b"batch".to_vec());
    h.tracker.register(
        request.clone(),
        [hash_of(&t1), hash_of(&t2), hash_of(&t3)],
    );
    h.handle
        .send(ParserEvent::NewZcBatchFromClient {
            raws: vec![t1.clone(), t2.clone(), t3.clone()],
            request_id: request.clone(),
        })
        .await
        .unwrap();
    sync_to(&h.handle, 2).await;

    // T2 and T3 entered in one commit
    let snapshot = h.handle.current_snapshot();
    assert_eq!(snapshot.sequence(), 2);
    assert!(snapshot.has_hash(&hash_of(&t2)));
    assert!(snapshot.has_hash(&hash_of(&t3)));

    let outcomes = h.sink.outcomes();
    let state_of = |hash| {
        outcomes
            .iter()
            .find(|o| o.hash == hash)
            .map(|o| o.state)
            .unwrap_or_else(|| panic!("no outcome for {:?}", hash))
    };
    assert_eq!(state_of(hash_of(&t1)), HashState::AlreadyInMempool);
    assert_eq!(state_of(hash_of(&t2)), HashState::SeenInSnapshot);
    assert_eq!(state_of(hash_of(&t3)), HashState::SeenInSnapshot);
    assert_eq!(h.tracker.live_requests(), 0);
}

#[tokio::test]
async fn parked_child_revives_when_parent_arrives() {
    vigil_test::init();

    let chain = MockChain::new();
    let op = chain.add_utxo(0xA0, 0, Amount::from_btc(2), scraddr(0xA0));
    let h = spawn_parser(chain, FixedInterest::default());

    let parent = raw_tx(&[op], &[(scraddr(0xB0), Amount::from_btc(1))], false);
    let child = raw_tx(
        &[outpoint_of(&parent, 0)],
        &[(scraddr(0xC0), Amount::from_sat(50_000_000))],
        false,
    );

    // the child arrives first and parks
    h.handle
        .send(ParserEvent::NewZcFromNode { raw: child.clone() })
        .await
        .unwrap();
    h.handle
        .send(ParserEvent::NewZcFromNode { raw: parent.clone() })
        .await
        .unwrap();
    sync_to(&h.handle, 1).await;

    let snapshot = h.handle.current_snapshot();
    assert!(snapshot.has_hash(&hash_of(&parent)));
    assert!(snapshot.has_hash(&hash_of(&child)));

    // intake order: the child was assigned its key first
    let child_key = snapshot.key_for_hash(&hash_of(&child)).unwrap();
    let parent_key = snapshot.key_for_hash(&hash_of(&parent)).unwrap();
    assert!(child_key < parent_key);

    // and the parent's descendant set includes the revived child
    assert_eq!(
        snapshot.descendants(parent_key),
        BTreeSet::from([parent_key, child_key])
    );
}

#[tokio::test]
async fn orphan_whose_parent_never_arrives_times_out() {
    vigil_test::init();

    let chain = MockChain::new();
    let h = spawn_parser(chain, FixedInterest::default());

    let orphan = raw_tx(
        &[outpoint_of(&vigil_test::DUMMY_TX1, 0)],
        &[(scraddr(0xC0), Amount::from_sat(50_000_000))],
        false,
    );
    let request = RequestId(b"orphan".to_vec());
    h.tracker.register(request.clone(), [hash_of(&orphan)]);
    h.handle
        .send(ParserEvent::NewZcBatchFromClient {
            raws: vec![orphan.clone()],
            request_id: request.clone(),
        })
        .await
        .unwrap();

    // watcher_timeout is 200ms in the test config; the sweep runs at
    // 1s granularity, so allow a little slack
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(outcome) = h.sink.outcomes().first().cloned() {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("deferred reject arrives");

    assert_eq!(outcome.state, HashState::TimedOut);
    assert_eq!(outcome.request_id, request);
    assert!(h.handle.current_snapshot().is_empty());
}

#[tokio::test]
async fn mined_zc_leaves_snapshot_and_notifies() {
    vigil_test::init();

    let watcher = SubscriberId(9);
    let chain = MockChain::new();
    let addr = scraddr(0xA0);
    let op = chain.add_utxo(0xA0, 0, Amount::from_btc(1), addr);
    let interest = FixedInterest::default()
        .watch(addr, watcher)
        .watch(scraddr(0xB0), watcher);
    let h = spawn_parser(chain, interest);

    let t0 = raw_tx(&[op], &[(scraddr(0xB0), Amount::from_sat(90_000_000))], false);
    h.handle
        .send(ParserEvent::NewZcFromNode { raw: t0.clone() })
        .await
        .unwrap();
    sync_to(&h.handle, 1).await;

    h.handle
        .send(ParserEvent::NewBlock {
            confirmed_txids: vec![hash_of(&t0)],
            reorged_raw_txs: vec![],
        })
        .await
        .unwrap();
    sync_to(&h.handle, 2).await;

    assert!(h.handle.current_snapshot().is_empty());
    let invalidations: Vec<_> = h
        .sink
        .notifications()
        .into_iter()
        .filter(|(sub, n)| {
            *sub == watcher && matches!(n, SubscriberNotification::ZcInvalidated { .. })
        })
        .collect();
    assert_eq!(invalidations.len(), 1);
}

#[tokio::test]
async fn rebroadcast_of_committed_tx_is_already_in_mempool() {
    vigil_test::init();

    let chain = MockChain::new();
    let op = chain.add_utxo(0xA0, 0, Amount::from_btc(1), scraddr(0xA0));
    let h = spawn_parser(chain, FixedInterest::default());

    let t0 = raw_tx(&[op], &[(scraddr(0xB0), Amount::from_sat(90_000_000))], false);
    h.handle
        .send(ParserEvent::NewZcFromNode { raw: t0.clone() })
        .await
        .unwrap();
    sync_to(&h.handle, 1).await;
    let before = h.handle.current_snapshot();

    let request = RequestId(b"again".to_vec());
    h.tracker.register(request.clone(), [hash_of(&t0)]);
    h.handle
        .send(ParserEvent::NewZcBatchFromClient {
            raws: vec![t0.clone()],
            request_id: request.clone(),
        })
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(outcome) = h.sink.outcomes().first().cloned() {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(outcome.state, HashState::AlreadyInMempool);

    // the snapshot was not perturbed: same sequence, same content
    let after = h.handle.current_snapshot();
    assert_eq!(before.sequence(), after.sequence());
    assert_eq!(before.len(), after.len());
}

#[tokio::test]
async fn already_in_chain_is_synthesized() {
    vigil_test::init();

    let chain = MockChain::new();
    let op = chain.add_utxo(0xA0, 0, Amount::from_btc(1), scraddr(0xA0));
    let mined = raw_tx(&[op], &[(scraddr(0xB0), Amount::from_sat(90_000_000))], false);
    chain.confirm(hash_of(&mined));

    let h = spawn_parser(chain, FixedInterest::default());

    let request = RequestId(b"mined".to_vec());
    h.tracker.register(request.clone(), [hash_of(&mined)]);
    h.handle
        .send(ParserEvent::NewZcBatchFromClient {
            raws: vec![mined.clone()],
            request_id: request,
        })
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(outcome) = h.sink.outcomes().first().cloned() {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(outcome.state, HashState::AlreadyInChain);
}
