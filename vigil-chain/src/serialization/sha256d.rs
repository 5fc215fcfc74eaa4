//! The double-SHA256 hash used for Bitcoin transaction and block identity.

use sha2::{Digest, Sha256};

/// Hash `data` with two rounds of SHA256.
pub fn digest(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// An incremental sha256d writer, for hashing a serialization stream
/// without buffering it.
#[derive(Default)]
pub struct Writer {
    hasher: Sha256,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> [u8; 32] {
        let first = self.hasher.finalize();
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        out
    }
}

impl std::io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_matches_known_vector() {
        // sha256d of the empty string
        let expected =
            hex::decode("5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456")
                .unwrap();
        assert_eq!(digest(b"")[..], expected[..]);
    }

    #[test]
    fn incremental_writer_matches_oneshot() {
        use std::io::Write;

        let data = b"the quick brown fox";
        let mut writer = Writer::new();
        writer.write_all(&data[..9]).unwrap();
        writer.write_all(&data[9..]).unwrap();
        assert_eq!(writer.finish(), digest(data));
    }
}
