//! Wire encodings for outpoints, inputs and outputs.

use std::io;

use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

use super::{OutPoint, Input, Output, Script};
use crate::amount::Amount;
use crate::transaction;

impl BitcoinSerialize for OutPoint {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        self.hash.bitcoin_serialize(&mut writer)?;
        self.index.bitcoin_serialize(&mut writer)?;
        Ok(())
    }
}

impl BitcoinDeserialize for OutPoint {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(OutPoint {
            hash: transaction::Hash::bitcoin_deserialize(&mut reader)?,
            index: u32::bitcoin_deserialize(&mut reader)?,
        })
    }
}

impl BitcoinSerialize for Input {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        match self {
            Input::PrevOut {
                outpoint,
                unlock_script,
                sequence,
            } => {
                outpoint.bitcoin_serialize(&mut writer)?;
                unlock_script.bitcoin_serialize(&mut writer)?;
                sequence.bitcoin_serialize(&mut writer)?;
            }
            Input::Coinbase { data, sequence } => {
                OutPoint::null().bitcoin_serialize(&mut writer)?;
                data.bitcoin_serialize(&mut writer)?;
                sequence.bitcoin_serialize(&mut writer)?;
            }
        }
        Ok(())
    }
}

impl BitcoinDeserialize for Input {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let outpoint = OutPoint::bitcoin_deserialize(&mut reader)?;
        if outpoint.is_null() {
            let data = <Vec<u8>>::bitcoin_deserialize(&mut reader)?;
            let sequence = u32::bitcoin_deserialize(&mut reader)?;
            Ok(Input::Coinbase { data, sequence })
        } else {
            let unlock_script = Script::bitcoin_deserialize(&mut reader)?;
            let sequence = u32::bitcoin_deserialize(&mut reader)?;
            Ok(Input::PrevOut {
                outpoint,
                unlock_script,
                sequence,
            })
        }
    }
}

impl BitcoinSerialize for Output {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        self.value.bitcoin_serialize(&mut writer)?;
        self.lock_script.bitcoin_serialize(&mut writer)?;
        Ok(())
    }
}

impl BitcoinDeserialize for Output {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Output {
            value: Amount::bitcoin_deserialize(&mut reader)?,
            lock_script: Script::bitcoin_deserialize(&mut reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn coinbase_input_round_trip() {
        let input = Input::Coinbase {
            data: vec![0xDE, 0xAD],
            sequence: u32::MAX,
        };
        let bytes = input.bitcoin_serialize_to_vec().unwrap();
        assert_eq!(bytes.len(), input.len());
        let parsed = Input::bitcoin_deserialize(Cursor::new(&bytes)).unwrap();
        assert_eq!(parsed, input);
    }

    #[test]
    fn prevout_input_round_trip() {
        let input = Input::PrevOut {
            outpoint: OutPoint {
                hash: transaction::Hash([3u8; 32]),
                index: 7,
            },
            unlock_script: Script(vec![0x00, 0x14]),
            sequence: 0,
        };
        let bytes = input.bitcoin_serialize_to_vec().unwrap();
        let parsed = Input::bitcoin_deserialize(Cursor::new(&bytes)).unwrap();
        assert_eq!(parsed, input);
    }
}
