use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};
use byteorder::{LittleEndian, WriteBytesExt};

/// The Bitcoin variable-length integer encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactInt(u64);

impl CompactInt {
    pub fn from(value: usize) -> CompactInt {
        CompactInt(value as u64)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The number of bytes a value of this size occupies on the wire.
    pub fn size(value: usize) -> usize {
        if value < 253 {
            1
        } else if value <= u16::MAX as usize {
            3
        } else if value <= u32::MAX as usize {
            5
        } else {
            9
        }
    }
}

impl BitcoinSerialize for CompactInt {
    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        if self.0 < 253 {
            target.write_all(&[self.0 as u8])
        } else if self.0 <= u16::MAX as u64 {
            target.write_all(&[253])?;
            target.write_u16::<LittleEndian>(self.0 as u16)
        } else if self.0 <= u32::MAX as u64 {
            target.write_all(&[254])?;
            target.write_u32::<LittleEndian>(self.0 as u32)
        } else {
            target.write_all(&[255])?;
            target.write_u64::<LittleEndian>(self.0)
        }
    }
}

impl BitcoinDeserialize for CompactInt {
    fn bitcoin_deserialize<R: std::io::Read>(
        mut target: R,
    ) -> Result<CompactInt, SerializationError> {
        let first = u8::bitcoin_deserialize(&mut target)?;
        match first {
            253 => Ok(CompactInt(u16::bitcoin_deserialize(&mut target)? as u64)),
            254 => Ok(CompactInt(u32::bitcoin_deserialize(&mut target)? as u64)),
            255 => Ok(CompactInt(u64::bitcoin_deserialize(&mut target)?)),
            small => Ok(CompactInt(small as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn round_trip(value: u64) -> Vec<u8> {
        let encoded = CompactInt(value).bitcoin_serialize_to_vec().unwrap();
        let decoded = CompactInt::bitcoin_deserialize(Cursor::new(&encoded)).unwrap();
        assert_eq!(decoded.value(), value);
        encoded
    }

    #[test]
    fn boundary_encodings() {
        assert_eq!(round_trip(0), vec![0]);
        assert_eq!(round_trip(252), vec![252]);
        assert_eq!(round_trip(253), vec![253, 253, 0]);
        assert_eq!(round_trip(0xFFFF), vec![253, 0xFF, 0xFF]);
        assert_eq!(round_trip(0x10000), vec![254, 0, 0, 1, 0]);
        assert_eq!(round_trip(u32::MAX as u64).len(), 5);
        assert_eq!(round_trip(u32::MAX as u64 + 1).len(), 9);
    }

    #[test]
    fn size_matches_encoding() {
        for value in [0usize, 1, 252, 253, 0xFFFF, 0x10000, u32::MAX as usize] {
            let encoded = CompactInt::from(value).bitcoin_serialize_to_vec().unwrap();
            assert_eq!(CompactInt::size(value), encoded.len(), "value {}", value);
        }
    }
}
