//! Satoshi amounts.

use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// The number of satoshis in one bitcoin.
pub const COIN: u64 = 100_000_000;

/// A non-negative satoshi amount.
///
/// On the wire Bitcoin encodes output values as little-endian i64; this
/// type rejects negative values at the deserialization boundary so the
/// rest of the service never sees one.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_sat(sat: u64) -> Amount {
        Amount(sat)
    }

    pub fn from_btc(btc: u64) -> Amount {
        Amount(btc * COIN)
    }

    pub fn sat(&self) -> u64 {
        self.0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    /// Sum an iterator of amounts, `None` on overflow.
    pub fn sum<I: IntoIterator<Item = Amount>>(iter: I) -> Option<Amount> {
        iter.into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:08} BTC", self.0 / COIN, self.0 % COIN)
    }
}

impl BitcoinSerialize for Amount {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        (self.0 as i64).bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for Amount {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        let raw = i64::bitcoin_deserialize(reader)?;
        if raw < 0 {
            return Err(SerializationError::Parse("negative output value"));
        }
        Ok(Amount(raw as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_detects_overflow() {
        let amounts = [Amount::from_sat(u64::MAX), Amount::from_sat(1)];
        assert_eq!(Amount::sum(amounts), None);
        assert_eq!(
            Amount::sum([Amount::from_btc(7), Amount::from_btc(3)]),
            Some(Amount::from_btc(10))
        );
    }

    #[test]
    fn negative_wire_value_rejected() {
        let bytes = (-1i64).bitcoin_serialize_to_vec().unwrap();
        assert!(Amount::bitcoin_deserialize(&bytes[..]).is_err());
    }
}
