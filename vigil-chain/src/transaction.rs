//! Transactions and transaction-related structures.

use crate::cached::Cached;
use crate::compactint::CompactInt;
use crate::transparent;

mod hash;
mod lock_time;
mod serialize;

#[cfg(any(test, feature = "proptest-impl"))]
mod arbitrary;

pub use hash::Hash;
pub use lock_time::LockTime;

/// The sequence value at or above which an input opts out of BIP 125
/// replacement signaling.
pub const SEQUENCE_FINAL_RBF_THRESHOLD: u32 = 0xFFFF_FFFE;

/// A Bitcoin transaction.
///
/// This implementation covers the pre-segwit encoding, which is all the
/// service needs for transaction identity and input/output accounting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// The transaction version. Versions greater than 1 mean that BIP 68 applies.
    pub version: i32,
    /// The transaction inputs
    pub inputs: Vec<transparent::Input>,
    /// The transaction outputs
    pub outputs: Vec<transparent::Output>,
    /// The transaction lock time
    pub locktime: LockTime,
    hash: Cached<Hash>,
}

impl Transaction {
    pub fn new(
        version: i32,
        inputs: Vec<transparent::Input>,
        outputs: Vec<transparent::Output>,
        locktime: LockTime,
    ) -> Transaction {
        Transaction {
            version,
            inputs,
            outputs,
            locktime,
            hash: Cached::new(),
        }
    }

    /// Get the hash of this transaction.
    pub fn hash(&self) -> Hash {
        // If we have a cached version, just return that
        if let Some(hash) = self.hash.value() {
            return hash;
        }
        // Otherwise, serialize the tx to calculate and return the hash
        Hash::from(self)
    }

    /// Returns `true` if this transaction is a coinbase transaction.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && matches!(
                self.inputs.first(),
                Some(transparent::Input::Coinbase { .. })
            )
    }

    /// Returns `true` if any input signals BIP 125 opt-in replaceability.
    pub fn signals_rbf(&self) -> bool {
        self.inputs.iter().any(|input| match input {
            transparent::Input::PrevOut { sequence, .. } => {
                *sequence < SEQUENCE_FINAL_RBF_THRESHOLD
            }
            transparent::Input::Coinbase { .. } => false,
        })
    }

    /// Returns the serialized length (in bytes) of this transaction.
    pub fn len(&self) -> usize {
        let mut size = 4 + CompactInt::size(self.inputs.len());
        for input in self.inputs.iter() {
            size += input.len();
        }
        size += CompactInt::size(self.outputs.len());
        for output in self.outputs.iter() {
            size += output.len();
        }
        size + 4
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }
}
