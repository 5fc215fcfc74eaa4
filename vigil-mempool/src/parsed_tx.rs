//! The canonical in-memory form of a transaction, and input resolution.

use std::collections::{BTreeSet, HashSet};

use vigil_chain::transaction::{self, Transaction};
use vigil_chain::transparent::{self, OutPoint, ScriptAddr};
use vigil_chain::{Amount, BitcoinDeserialize, SerializationError};

use crate::snapshot::SnapshotBuilder;
use crate::zc_key::{DbKey, ZcKey};
use crate::SubscriberId;

/// A confirmed output, as reported by the external chain index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConfirmedUtxo {
    pub value: Amount,
    pub scraddr: ScriptAddr,
    pub db_key: DbKey,
}

/// The confirmed-chain lookup the resolver consults for inputs that do
/// not reference another staged ZC.
pub trait UtxoLookup: Send + Sync {
    fn lookup_utxo(&self, outpoint: &OutPoint) -> Option<ConfirmedUtxo>;

    /// Whether the transaction is already mined. Used to synthesize
    /// `AlreadyInChain` outcomes at submit time.
    fn tx_in_chain(&self, hash: &transaction::Hash) -> bool;
}

/// The address-interest oracle: which subscribers watch a script address.
pub trait AddrInterest: Send + Sync {
    fn watchers_of(&self, scraddr: &ScriptAddr) -> BTreeSet<SubscriberId>;
}

/// Where a resolved input's value came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InputSource {
    /// A confirmed output, by its database key.
    Confirmed(DbKey),
    /// Another staged ZC's output.
    Mempool(ZcKey, u16),
}

/// One input of a parsed transaction. `value`, `scraddr` and `source`
/// are filled by resolution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedTxIn {
    pub outpoint: OutPoint,
    pub sequence: u32,
    pub value: Option<Amount>,
    pub scraddr: Option<ScriptAddr>,
    pub source: Option<InputSource>,
}

/// One output of a parsed transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedTxOut {
    pub scraddr: ScriptAddr,
    pub value: Amount,
}

/// How far a ZC has made it through input resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResolutionState {
    /// Parsed; inputs not yet looked up.
    Unresolved,
    /// Every input resolved against the chain index or the snapshot.
    Resolved,
    /// At least one input's parent is unknown; parked until it arrives.
    ResolvedButInputsMissing,
    /// Structurally unusable: coinbase, empty, or self-conflicting.
    Invalid,
}

/// The canonical in-memory form of a zero-confirmation transaction.
#[derive(Clone, Debug)]
pub struct ParsedTx {
    pub hash: transaction::Hash,
    pub raw: Vec<u8>,
    pub inputs: Vec<ParsedTxIn>,
    pub outputs: Vec<ParsedTxOut>,
    pub state: ResolutionState,
    /// BIP 125 opt-in signal, captured at parse time.
    pub signals_rbf: bool,
}

impl ParsedTx {
    /// Parse raw transaction bytes into the unresolved form.
    ///
    /// Undecodable bytes error out; decodable transactions that can never
    /// stage (coinbase, empty sides, an outpoint spent twice by the same
    /// tx) come back in the `Invalid` state so callers still learn their
    /// identity.
    pub fn parse(raw: &[u8]) -> Result<ParsedTx, SerializationError> {
        let tx = Transaction::bitcoin_deserialize(raw)?;
        let hash = tx.hash();
        let signals_rbf = tx.signals_rbf();

        let mut inputs = Vec::with_capacity(tx.inputs.len());
        let mut structural_failure = tx.is_coinbase() || tx.is_empty();
        let mut seen = HashSet::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            match input {
                transparent::Input::PrevOut {
                    outpoint, sequence, ..
                } => {
                    if !seen.insert(*outpoint) {
                        structural_failure = true;
                    }
                    inputs.push(ParsedTxIn {
                        outpoint: *outpoint,
                        sequence: *sequence,
                        value: None,
                        scraddr: None,
                        source: None,
                    });
                }
                transparent::Input::Coinbase { .. } => structural_failure = true,
            }
        }

        let outputs = tx
            .outputs
            .iter()
            .map(|output| ParsedTxOut {
                scraddr: output.script_addr(),
                value: output.value,
            })
            .collect();

        Ok(ParsedTx {
            hash,
            raw: raw.to_vec(),
            inputs,
            outputs,
            state: if structural_failure {
                ResolutionState::Invalid
            } else {
                ResolutionState::Unresolved
            },
            signals_rbf,
        })
    }

    /// Resolve every input against the confirmed lookup, falling back to
    /// the snapshot being built. Returns the outpoints that resolved
    /// nowhere; when non-empty the state is `ResolvedButInputsMissing`
    /// and the caller parks this tx keyed by those outpoints.
    pub fn resolve(
        &mut self,
        lookup: &dyn UtxoLookup,
        building: &SnapshotBuilder,
    ) -> Vec<OutPoint> {
        if self.state == ResolutionState::Invalid {
            return Vec::new();
        }

        let mut missing = Vec::new();
        for input in &mut self.inputs {
            if input.source.is_some() {
                // already resolved on a previous pass
                continue;
            }
            if let Some(utxo) = lookup.lookup_utxo(&input.outpoint) {
                input.value = Some(utxo.value);
                input.scraddr = Some(utxo.scraddr);
                input.source = Some(InputSource::Confirmed(utxo.db_key));
            } else if let Some((parent_key, parent_out)) =
                building.snapshot().output_of(&input.outpoint)
            {
                input.value = Some(parent_out.value);
                input.scraddr = Some(parent_out.scraddr);
                input.source = Some(InputSource::Mempool(
                    parent_key,
                    input.outpoint.index as u16,
                ));
            } else {
                missing.push(input.outpoint);
            }
        }

        self.state = if missing.is_empty() {
            ResolutionState::Resolved
        } else {
            ResolutionState::ResolvedButInputsMissing
        };
        missing
    }

    /// The fee this transaction pays, available once resolved.
    pub fn fee(&self) -> Option<Amount> {
        if self.state != ResolutionState::Resolved {
            return None;
        }
        let funding = Amount::sum(self.inputs.iter().filter_map(|input| input.value))?;
        let spending = Amount::sum(self.outputs.iter().map(|output| output.value))?;
        funding.checked_sub(spending)
    }

    /// All script addresses this transaction touches: resolved input
    /// addresses plus every output address.
    pub fn touched_scraddrs(&self) -> BTreeSet<ScriptAddr> {
        self.inputs
            .iter()
            .filter_map(|input| input.scraddr)
            .chain(self.outputs.iter().map(|output| output.scraddr))
            .collect()
    }
}
