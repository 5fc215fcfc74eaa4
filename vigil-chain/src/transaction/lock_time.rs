use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// The raw values below this threshold are block heights; at or above it,
/// unix timestamps.
const LOCK_TIME_THRESHOLD: u32 = 500_000_000;

/// A transaction lock time.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LockTime {
    /// Spendable at or after this block height.
    Height(u32),
    /// Spendable at or after this unix timestamp.
    Time(u32),
}

impl LockTime {
    pub fn unlocked() -> LockTime {
        LockTime::Height(0)
    }

    fn raw(&self) -> u32 {
        match self {
            LockTime::Height(height) => *height,
            LockTime::Time(timestamp) => *timestamp,
        }
    }
}

impl BitcoinSerialize for LockTime {
    fn bitcoin_serialize<W: std::io::Write>(&self, writer: W) -> Result<(), std::io::Error> {
        self.raw().bitcoin_serialize(writer)
    }
}

impl BitcoinDeserialize for LockTime {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        let raw = u32::bitcoin_deserialize(reader)?;
        if raw < LOCK_TIME_THRESHOLD {
            Ok(LockTime::Height(raw))
        } else {
            Ok(LockTime::Time(raw))
        }
    }
}
