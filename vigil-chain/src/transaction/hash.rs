use std::fmt;

use crate::serialization::{
    sha256d, BitcoinDeserialize, BitcoinSerialize, SerializationError,
};

use super::Transaction;

/// A transaction hash (txid), in internal byte order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl From<&Transaction> for Hash {
    fn from(transaction: &Transaction) -> Self {
        let mut hash_writer = sha256d::Writer::new();
        transaction
            .bitcoin_serialize(&mut hash_writer)
            .expect("writing to a hasher never fails");
        Hash(hash_writer.finish())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("transaction::Hash")
            .field(&hex::encode(self.0))
            .finish()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // display in the conventional reversed (RPC) byte order
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl std::str::FromStr for Hash {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| SerializationError::Parse("invalid hex"))?;
        if bytes.len() != 32 {
            return Err(SerializationError::Parse("txid must be 32 bytes"));
        }
        let mut internal = [0u8; 32];
        internal.copy_from_slice(&bytes);
        internal.reverse();
        Ok(Hash(internal))
    }
}

impl BitcoinSerialize for Hash {
    fn bitcoin_serialize<W: std::io::Write>(&self, writer: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(writer)
    }
}

impl BitcoinDeserialize for Hash {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Hash(<[u8; 32]>::bitcoin_deserialize(reader)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_reverses_byte_order() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xAA;
        bytes[31] = 0xBB;
        let displayed = Hash(bytes).to_string();
        assert!(displayed.starts_with("bb"));
        assert!(displayed.ends_with("aa"));
    }

    #[test]
    fn from_str_round_trips_display() {
        let hash = Hash([7u8; 32]);
        let parsed: Hash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
    }
}
