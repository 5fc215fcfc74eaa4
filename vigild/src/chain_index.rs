//! The confirmed-chain callbacks, answered over the node's RPC.
//!
//! The parser's UTXO lookup is synchronous by design (it runs inside the
//! single-writer event loop), so RPC round-trips go through
//! `block_in_place` with a positive-result cache in front. Unspendable
//! misses are not cached: an outpoint can become known when a block
//! arrives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::trace;

use vigil_chain::transaction::Hash;
use vigil_chain::transparent::{OutPoint, Script, ScriptAddr};
use vigil_chain::Amount;

use vigil_client::wallet_view::ConfirmedView;
use vigil_mempool::parsed_tx::{ConfirmedUtxo, UtxoLookup};
use vigil_mempool::DbKey;

use crate::node_rpc::NodeRpcClient;

pub struct RpcChainIndex {
    node: Arc<NodeRpcClient>,
    network: vigil_chain::Network,
    utxo_cache: Mutex<HashMap<OutPoint, ConfirmedUtxo>>,
    next_db_key: Mutex<u64>,
}

impl RpcChainIndex {
    pub fn new(node: Arc<NodeRpcClient>, network: vigil_chain::Network) -> RpcChainIndex {
        RpcChainIndex {
            node,
            network,
            utxo_cache: Mutex::new(HashMap::new()),
            next_db_key: Mutex::new(0),
        }
    }

    fn blocking<T>(&self, fut: impl std::future::Future<Output = T>) -> T {
        tokio::task::block_in_place(|| Handle::current().block_on(fut))
    }

    fn assign_db_key(&self) -> DbKey {
        let mut next = self.next_db_key.lock().expect("db key lock poisoned");
        *next += 1;
        DbKey(next.to_be_bytes())
    }

    fn utxo_from_gettxout(&self, result: &Value) -> Option<(Amount, ScriptAddr)> {
        let value_btc = result.get("value")?.as_f64()?;
        let sat = (value_btc * 100_000_000.0).round() as u64;
        let script_hex = result.get("scriptPubKey")?.get("hex")?.as_str()?;
        let script = Script(hex::decode(script_hex).ok()?);
        Some((
            Amount::from_sat(sat),
            ScriptAddr::from_lock_script(&script),
        ))
    }
}

impl UtxoLookup for RpcChainIndex {
    fn lookup_utxo(&self, outpoint: &OutPoint) -> Option<ConfirmedUtxo> {
        if let Some(hit) = self
            .utxo_cache
            .lock()
            .expect("utxo cache lock poisoned")
            .get(outpoint)
        {
            return Some(*hit);
        }

        let result = self
            .blocking(self.node.call(
                "gettxout",
                json!([outpoint.hash.to_string(), outpoint.index, true]),
            ))
            .ok()?;
        if result.is_null() {
            trace!(?outpoint, "gettxout miss");
            return None;
        }

        let (value, scraddr) = self.utxo_from_gettxout(&result)?;
        let utxo = ConfirmedUtxo {
            value,
            scraddr,
            db_key: self.assign_db_key(),
        };
        self.utxo_cache
            .lock()
            .expect("utxo cache lock poisoned")
            .insert(*outpoint, utxo);
        Some(utxo)
    }

    fn tx_in_chain(&self, hash: &Hash) -> bool {
        // confirmed txs report a blockhash; mempool ones do not
        let result = self.blocking(
            self.node
                .call("getrawtransaction", json!([hash.to_string(), true])),
        );
        match result {
            Ok(verbose) => verbose.get("blockhash").map(|v| !v.is_null()).unwrap_or(false),
            Err(_) => false,
        }
    }
}

impl ConfirmedView for RpcChainIndex {
    fn confirmed_balance(&self, scraddr: &ScriptAddr) -> Amount {
        Amount::sum(
            self.confirmed_utxos(scraddr)
                .into_iter()
                .map(|(_, value)| value),
        )
        .unwrap_or(Amount::ZERO)
    }

    fn confirmed_utxos(&self, scraddr: &ScriptAddr) -> Vec<(OutPoint, Amount)> {
        // nodes without an address index answer this through a utxo-set
        // scan; sufficient for a wallet-scale address set
        let Some(address) = scraddr.to_address_string(self.network) else {
            return Vec::new();
        };
        let descriptor = format!("addr({})", address);
        let result = self.blocking(
            self.node
                .call("scantxoutset", json!(["start", [descriptor]])),
        );

        let Ok(result) = result else {
            return Vec::new();
        };
        let Some(unspents) = result.get("unspents").and_then(Value::as_array) else {
            return Vec::new();
        };

        unspents
            .iter()
            .filter_map(|unspent| {
                let txid: Hash = unspent.get("txid")?.as_str()?.parse().ok()?;
                let vout = unspent.get("vout")?.as_u64()? as u32;
                let value_btc = unspent.get("amount")?.as_f64()?;
                Some((
                    OutPoint {
                        hash: txid,
                        index: vout,
                    },
                    Amount::from_sat((value_btc * 100_000_000.0).round() as u64),
                ))
            })
            .collect()
    }
}
