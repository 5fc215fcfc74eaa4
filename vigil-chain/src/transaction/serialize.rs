//! Wire encoding for transactions, kept in one place so the hash-caching
//! path is next to the byte layout it depends on.

use std::{io, sync::Arc};

use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError};
use crate::transparent;

use super::*;

/// The maximum size of a transaction (excluding the witness) in bytes.
pub const MAX_TX_SIZE: u64 = 1_000_000;

impl BitcoinSerialize for Transaction {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        self.version.bitcoin_serialize(&mut writer)?;
        self.inputs.bitcoin_serialize(&mut writer)?;
        self.outputs.bitcoin_serialize(&mut writer)?;
        self.locktime.bitcoin_serialize(&mut writer)?;
        self.hash.bitcoin_serialize(&mut writer)?;
        Ok(())
    }
}

/// Deserializes a transaction, calculating and caching its txid.
impl BitcoinDeserialize for Transaction {
    fn bitcoin_deserialize<R: io::Read>(src: R) -> Result<Self, SerializationError> {
        // Sanity-cap the read at one full transaction to protect against
        // DOS payloads.
        let mut src = src.take(MAX_TX_SIZE);
        let version = i32::bitcoin_deserialize(&mut src)?;
        let inputs = <Vec<transparent::Input>>::bitcoin_deserialize(&mut src)?;
        let outputs = <Vec<transparent::Output>>::bitcoin_deserialize(&mut src)?;
        let locktime = LockTime::bitcoin_deserialize(&mut src)?;
        let mut tx = Transaction {
            version,
            inputs,
            outputs,
            locktime,
            hash: Cached::new(),
        };
        let own_hash = tx.hash();
        tx.hash = Cached::from(own_hash);
        Ok(tx)
    }
}

impl<T> BitcoinDeserialize for Arc<T>
where
    T: BitcoinDeserialize,
{
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Arc::new(T::bitcoin_deserialize(reader)?))
    }
}

impl<T> BitcoinSerialize for Arc<T>
where
    T: BitcoinSerialize,
{
    fn bitcoin_serialize<W: io::Write>(&self, writer: W) -> Result<(), io::Error> {
        T::bitcoin_serialize(self, writer)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::amount::Amount;
    use crate::transparent::{Input, OutPoint, Output, Script};

    use super::*;

    fn sample_tx() -> Transaction {
        Transaction::new(
            2,
            vec![Input::PrevOut {
                outpoint: OutPoint {
                    hash: Hash([0x11; 32]),
                    index: 0,
                },
                unlock_script: Script(vec![0x51]),
                sequence: 0xFFFF_FFFD,
            }],
            vec![Output {
                value: Amount::from_sat(50_000),
                lock_script: Script(vec![0x76, 0xA9]),
            }],
            LockTime::unlocked(),
        )
    }

    #[test]
    fn round_trip_caches_hash() {
        let tx = sample_tx();
        let bytes = tx.bitcoin_serialize_to_vec().unwrap();
        assert_eq!(bytes.len(), tx.len());

        let parsed = Transaction::bitcoin_deserialize(Cursor::new(&bytes)).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(parsed.hash(), tx.hash());
    }

    #[test]
    fn rbf_signal_follows_sequence() {
        let mut tx = sample_tx();
        assert!(tx.signals_rbf());
        if let Input::PrevOut { sequence, .. } = &mut tx.inputs[0] {
            *sequence = 0xFFFF_FFFF;
        }
        assert!(!tx.signals_rbf());
    }

    #[test]
    fn oversized_read_is_bounded() {
        // A length prefix claiming more inputs than the size cap allows
        // must fail cleanly rather than allocate.
        let mut bytes = 1i32.bitcoin_serialize_to_vec().unwrap();
        bytes.extend_from_slice(&[0xFE, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(Transaction::bitcoin_deserialize(Cursor::new(&bytes)).is_err());
    }
}
