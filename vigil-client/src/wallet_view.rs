//! Balance and ledger derivation over a committed snapshot.
//!
//! The confirmed chain stays behind the [`ConfirmedView`] callback; this
//! module owns the mempool side and the combination rules:
//!
//! * **full**: confirmed balance plus the net unconfirmed delta
//! * **spendable**: confirmed outputs not currently consumed by a ZC,
//!   plus available (unspent) mempool outputs
//! * **unconfirmed**: the net mempool delta alone

use std::collections::BTreeSet;
use std::sync::Arc;

use vigil_chain::transaction::Hash;
use vigil_chain::transparent::{OutPoint, ScriptAddr};
use vigil_chain::Amount;

use vigil_mempool::{MempoolSnapshot, TxIoKey};

/// The confirmed-chain queries the wallet view needs. An external
/// collaborator; tests use an in-memory table.
pub trait ConfirmedView: Send + Sync {
    fn confirmed_balance(&self, scraddr: &ScriptAddr) -> Amount;

    /// Confirmed UTXOs on an address, for spendability accounting.
    fn confirmed_utxos(&self, scraddr: &ScriptAddr) -> Vec<(OutPoint, Amount)>;
}

/// Balances for one address set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BalanceReport {
    pub full: Amount,
    pub spendable: Amount,
    pub unconfirmed: Amount,
}

/// One row of a per-address ledger: a TxIO pair flattened for clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    /// The tx the row belongs to: the ZC carrying the output, or the
    /// spender for consumed confirmed outputs.
    pub tx_hash: Hash,
    pub value: Amount,
    pub scraddr: ScriptAddr,
    /// Credit (an output to the address) vs debit (the address's output
    /// being consumed).
    pub credit: bool,
    /// Whether the output side is itself unconfirmed.
    pub zc: bool,
    /// Whether a ZC currently spends this output.
    pub spent: bool,
}

/// A read-only wallet view bound to one snapshot generation.
pub struct WalletView {
    snapshot: Arc<MempoolSnapshot>,
    confirmed: Arc<dyn ConfirmedView>,
}

impl WalletView {
    pub fn new(snapshot: Arc<MempoolSnapshot>, confirmed: Arc<dyn ConfirmedView>) -> WalletView {
        WalletView {
            snapshot,
            confirmed,
        }
    }

    /// The commit generation this view answers for.
    pub fn sequence(&self) -> u64 {
        self.snapshot.sequence()
    }

    /// Balances over an address set.
    pub fn balance(&self, scraddrs: &BTreeSet<ScriptAddr>) -> BalanceReport {
        let mut confirmed_total = Amount::ZERO;
        let mut zc_credits = Amount::ZERO;
        let mut zc_debits = Amount::ZERO;
        let mut spendable = Amount::ZERO;

        for scraddr in scraddrs {
            confirmed_total = confirmed_total
                .checked_add(self.confirmed.confirmed_balance(scraddr))
                .expect("balances fit in 21M BTC");

            // confirmed outputs not claimed by a ZC stay spendable
            for (outpoint, value) in self.confirmed.confirmed_utxos(scraddr) {
                if self.snapshot.is_output_spent_by_zc(&outpoint).is_none() {
                    spendable = spendable.checked_add(value).expect("balance overflow");
                }
            }

            for txio in self.snapshot.txio_keys_for_scraddr(scraddr) {
                let pair = match self.snapshot.txio_by_key(&txio) {
                    Some(pair) => *pair,
                    None => continue,
                };
                match txio {
                    TxIoKey::Zc(..) => {
                        zc_credits = zc_credits.checked_add(pair.value).expect("overflow");
                        if pair.spender.is_none() {
                            spendable = spendable.checked_add(pair.value).expect("overflow");
                        }
                    }
                    TxIoKey::Confirmed(_) => {
                        // a confirmed output of ours consumed by a ZC
                        zc_debits = zc_debits.checked_add(pair.value).expect("overflow");
                    }
                }
            }
        }

        // the net mempool movement may be negative; clamp the report at
        // zero rather than invent signed balances
        let unconfirmed = zc_credits.checked_sub(zc_debits).unwrap_or(Amount::ZERO);
        let full = confirmed_total
            .checked_add(zc_credits)
            .and_then(|sum| sum.checked_sub(zc_debits))
            .unwrap_or(Amount::ZERO);

        BalanceReport {
            full,
            spendable,
            unconfirmed,
        }
    }

    /// The ordered TxIO rows touching one address.
    pub fn ledger(&self, scraddr: &ScriptAddr) -> Vec<LedgerEntry> {
        let mut entries = Vec::new();
        for txio in self.snapshot.txio_keys_for_scraddr(scraddr) {
            let pair = match self.snapshot.txio_by_key(&txio) {
                Some(pair) => *pair,
                None => continue,
            };
            let entry = match txio {
                TxIoKey::Zc(key, _) => {
                    let tx = self
                        .snapshot
                        .tx_by_key(key)
                        .expect("txio keys name staged zcs");
                    LedgerEntry {
                        tx_hash: tx.hash,
                        value: pair.value,
                        scraddr: pair.scraddr,
                        credit: true,
                        zc: true,
                        spent: pair.spender.is_some(),
                    }
                }
                TxIoKey::Confirmed(_) => {
                    let (spender, _) = pair
                        .spender
                        .expect("confirmed pairs only exist while a zc spends them");
                    let tx = self
                        .snapshot
                        .tx_by_key(spender)
                        .expect("spender is staged");
                    LedgerEntry {
                        tx_hash: tx.hash,
                        value: pair.value,
                        scraddr: pair.scraddr,
                        credit: false,
                        zc: true,
                        spent: true,
                    }
                }
            };
            entries.push(entry);
        }
        entries
    }

    /// Available mempool UTXOs (no ZC spender yet) on the address set.
    pub fn spendable_zc_outputs(&self, scraddrs: &BTreeSet<ScriptAddr>) -> Vec<LedgerEntry> {
        let mut utxos = Vec::new();
        for scraddr in scraddrs {
            for txio in self.snapshot.txio_keys_for_scraddr(scraddr) {
                if let TxIoKey::Zc(key, _) = txio {
                    let pair = match self.snapshot.txio_by_key(&txio) {
                        Some(pair) => *pair,
                        None => continue,
                    };
                    if pair.spender.is_some() {
                        continue;
                    }
                    let tx = self
                        .snapshot
                        .tx_by_key(key)
                        .expect("txio keys name staged zcs");
                    utxos.push(LedgerEntry {
                        tx_hash: tx.hash,
                        value: pair.value,
                        scraddr: pair.scraddr,
                        credit: true,
                        zc: true,
                        spent: false,
                    });
                }
            }
        }
        utxos
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use vigil_mempool::filter::FilteredTx;
    use vigil_mempool::testing::{hash_of, outpoint_of, raw_tx, scraddr, MockChain};
    use vigil_mempool::{MempoolConfig, ParsedTx, SnapshotBuilder};

    use super::*;

    #[derive(Default)]
    struct TableView {
        balances: Mutex<HashMap<ScriptAddr, Amount>>,
        utxos: Mutex<HashMap<ScriptAddr, Vec<(OutPoint, Amount)>>>,
    }

    impl TableView {
        fn put(&self, scraddr: ScriptAddr, outpoint: OutPoint, value: Amount) {
            let mut balances = self.balances.lock().unwrap();
            let entry = balances.entry(scraddr).or_insert(Amount::ZERO);
            *entry = entry.checked_add(value).unwrap();
            self.utxos
                .lock()
                .unwrap()
                .entry(scraddr)
                .or_default()
                .push((outpoint, value));
        }
    }

    impl ConfirmedView for TableView {
        fn confirmed_balance(&self, scraddr: &ScriptAddr) -> Amount {
            self.balances
                .lock()
                .unwrap()
                .get(scraddr)
                .copied()
                .unwrap_or(Amount::ZERO)
        }

        fn confirmed_utxos(&self, scraddr: &ScriptAddr) -> Vec<(OutPoint, Amount)> {
            self.utxos
                .lock()
                .unwrap()
                .get(scraddr)
                .cloned()
                .unwrap_or_default()
        }
    }

    /// One confirmed 10 BTC output on addr A; a ZC spends it into 7 BTC
    /// to addr B and 3 BTC back to A (ignoring fees for clarity of the
    /// arithmetic: 2.9 BTC change + 0.1 fee).
    fn setup() -> (Arc<MempoolSnapshot>, Arc<TableView>) {
        let chain = MockChain::new();
        let addr_a = scraddr(0xAA);
        let addr_b = scraddr(0xBB);
        let op = chain.add_utxo(0x01, 0, Amount::from_btc(10), addr_a);

        let table = TableView::default();
        table.put(addr_a, op, Amount::from_btc(10));

        let mut builder = SnapshotBuilder::new(&MempoolConfig::default());
        let raw = raw_tx(
            &[op],
            &[
                (addr_b, Amount::from_btc(7)),
                (addr_a, Amount::from_sat(290_000_000)),
            ],
            false,
        );
        let key = builder.assign_key();
        let mut parsed = ParsedTx::parse(&raw).unwrap();
        assert!(parsed.resolve(&chain, &builder).is_empty());
        builder
            .stage(key, Arc::new(parsed), FilteredTx::default())
            .unwrap();
        (builder.commit(), Arc::new(table))
    }

    #[test]
    fn balances_combine_confirmed_and_mempool() {
        vigil_test::init();

        let (snapshot, table) = setup();
        let view = WalletView::new(snapshot, table);
        let addr_a = scraddr(0xAA);
        let addr_b = scraddr(0xBB);

        // addr A: 10 confirmed, spent by the ZC, 2.9 change returning
        let report = view.balance(&BTreeSet::from([addr_a]));
        assert_eq!(report.unconfirmed, Amount::ZERO); // 2.9 in, 10 out clamps
        assert_eq!(report.full, Amount::from_sat(290_000_000));
        assert_eq!(report.spendable, Amount::from_sat(290_000_000));

        // addr B: nothing confirmed, 7 unconfirmed
        let report = view.balance(&BTreeSet::from([addr_b]));
        assert_eq!(report.full, Amount::from_btc(7));
        assert_eq!(report.unconfirmed, Amount::from_btc(7));
        assert_eq!(report.spendable, Amount::from_btc(7));
    }

    #[test]
    fn ledger_lists_credits_and_debits() {
        vigil_test::init();

        let (snapshot, table) = setup();
        let view = WalletView::new(snapshot, table);

        let ledger = view.ledger(&scraddr(0xAA));
        assert_eq!(ledger.len(), 2);
        // confirmed-before-mempool ordering: the debit row first
        assert!(!ledger[0].credit);
        assert_eq!(ledger[0].value, Amount::from_btc(10));
        assert!(ledger[1].credit);
        assert_eq!(ledger[1].value, Amount::from_sat(290_000_000));
    }

    #[test]
    fn spendable_zc_outputs_skip_spent_pairs() {
        vigil_test::init();

        let (snapshot, table) = setup();
        let view = WalletView::new(snapshot, table);

        let utxos = view.spendable_zc_outputs(&BTreeSet::from([scraddr(0xAA), scraddr(0xBB)]));
        assert_eq!(utxos.len(), 2);
        assert!(utxos.iter().all(|u| !u.spent && u.zc));
    }
}
