//! Transparent-output functionality: outpoints, inputs, outputs, scripts,
//! and the script-address form the mempool indexes key on.

mod address;
mod script;
mod serialize;

pub use address::ScriptAddr;
pub use script::Script;

use crate::amount::Amount;
use crate::compactint::CompactInt;
use crate::transaction;

#[cfg(any(test, feature = "proptest-impl"))]
use proptest_derive::Arbitrary;

/// A particular transaction output reference.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[cfg_attr(any(test, feature = "proptest-impl"), derive(Arbitrary))]
pub struct OutPoint {
    /// References the transaction that contains the output being spent.
    pub hash: transaction::Hash,

    /// Identifies which output from that transaction is referenced; the
    /// first output is 0, etc.
    pub index: u32,
}

impl OutPoint {
    #[inline]
    pub const fn len() -> usize {
        36
    }

    /// The sentinel outpoint a coinbase input carries.
    pub fn null() -> OutPoint {
        OutPoint {
            hash: transaction::Hash([0u8; 32]),
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX && self.hash.0 == [0u8; 32]
    }
}

/// A transparent input to a transaction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Input {
    /// A reference to an output of a previous transaction.
    PrevOut {
        /// The previous output transaction reference.
        outpoint: OutPoint,
        /// The script that authorizes spending `outpoint`.
        unlock_script: Script,
        /// The sequence number for the input.
        sequence: u32,
    },
    /// New coins created by the block reward.
    Coinbase {
        /// Free data inserted by the miner.
        data: Vec<u8>,
        /// The sequence number for the input.
        sequence: u32,
    },
}

impl Input {
    pub fn len(&self) -> usize {
        match self {
            Input::PrevOut { unlock_script, .. } => {
                OutPoint::len() + unlock_script.serialized_size() + 4
            }
            Input::Coinbase { data, .. } => {
                OutPoint::len() + CompactInt::size(data.len()) + data.len() + 4
            }
        }
    }

    /// The outpoint this input spends, unless it is a coinbase.
    pub fn outpoint(&self) -> Option<OutPoint> {
        match self {
            Input::PrevOut { outpoint, .. } => Some(*outpoint),
            Input::Coinbase { .. } => None,
        }
    }
}

/// A transparent output from a transaction.
///
/// The UTXOs tracked for a wallet are a subset of the unspent outputs of
/// the global transaction set; every output here is an indivisible unit
/// of value locked by `lock_script`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Output {
    /// Transaction value.
    pub value: Amount,

    /// The lock script defines the conditions under which this output can
    /// be spent.
    pub lock_script: Script,
}

impl Output {
    /// Returns the serialized length (in bytes) of this output.
    pub fn len(&self) -> usize {
        8 + self.lock_script.serialized_size()
    }

    /// The script-address form of this output's lock script.
    pub fn script_addr(&self) -> ScriptAddr {
        ScriptAddr::from_lock_script(&self.lock_script)
    }
}
