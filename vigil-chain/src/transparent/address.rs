//! Script addresses.
//!
//! The mempool and subscriber indexes key on a compact "script address"
//! derived from each output's lock script: one tag byte plus a 20-byte
//! hash. Standard script shapes keep their own tags so address-string
//! rendering stays possible; anything else is tracked under an opaque
//! tag keyed by the hash of the raw script.

use bech32::{ToBase32, Variant};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::parameters::Network;

use super::Script;

/// Tag bytes for the serialized form of a script address.
const TAG_P2PKH: u8 = 0x00;
const TAG_P2SH: u8 = 0x05;
const TAG_P2WPKH: u8 = 0x90;
const TAG_NONSTANDARD: u8 = 0xFF;

/// The address form of an output lock script.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ScriptAddr {
    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
    P2pkh([u8; 20]),
    /// `OP_HASH160 <20> OP_EQUAL`
    P2sh([u8; 20]),
    /// `OP_0 <20>`
    P2wpkh([u8; 20]),
    /// Any other script, tracked by the hash160 of its raw bytes.
    NonStandard([u8; 20]),
}

fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

impl ScriptAddr {
    /// Classify a lock script into its address form.
    pub fn from_lock_script(script: &Script) -> ScriptAddr {
        let bytes = &script.0;
        match bytes.as_slice() {
            // OP_DUP OP_HASH160 PUSH20 <h> OP_EQUALVERIFY OP_CHECKSIG
            [0x76, 0xA9, 0x14, hash @ .., 0x88, 0xAC] if hash.len() == 20 => {
                let mut h = [0u8; 20];
                h.copy_from_slice(hash);
                ScriptAddr::P2pkh(h)
            }
            // OP_HASH160 PUSH20 <h> OP_EQUAL
            [0xA9, 0x14, hash @ .., 0x87] if hash.len() == 20 => {
                let mut h = [0u8; 20];
                h.copy_from_slice(hash);
                ScriptAddr::P2sh(h)
            }
            // OP_0 PUSH20 <program>
            [0x00, 0x14, program @ ..] if program.len() == 20 => {
                let mut h = [0u8; 20];
                h.copy_from_slice(program);
                ScriptAddr::P2wpkh(h)
            }
            _ => ScriptAddr::NonStandard(hash160(bytes)),
        }
    }

    /// The 21-byte tagged serialization the indexes use.
    pub fn to_bytes(&self) -> [u8; 21] {
        let (tag, payload) = match self {
            ScriptAddr::P2pkh(h) => (TAG_P2PKH, h),
            ScriptAddr::P2sh(h) => (TAG_P2SH, h),
            ScriptAddr::P2wpkh(h) => (TAG_P2WPKH, h),
            ScriptAddr::NonStandard(h) => (TAG_NONSTANDARD, h),
        };
        let mut out = [0u8; 21];
        out[0] = tag;
        out[1..].copy_from_slice(payload);
        out
    }

    /// Rebuild from the tagged serialization.
    pub fn from_bytes(bytes: [u8; 21]) -> Option<ScriptAddr> {
        let mut payload = [0u8; 20];
        payload.copy_from_slice(&bytes[1..]);
        match bytes[0] {
            TAG_P2PKH => Some(ScriptAddr::P2pkh(payload)),
            TAG_P2SH => Some(ScriptAddr::P2sh(payload)),
            TAG_P2WPKH => Some(ScriptAddr::P2wpkh(payload)),
            TAG_NONSTANDARD => Some(ScriptAddr::NonStandard(payload)),
            _ => None,
        }
    }

    /// Render the human-readable address string, when the script shape
    /// has one on the given network.
    pub fn to_address_string(&self, network: Network) -> Option<String> {
        match self {
            ScriptAddr::P2pkh(h) => Some(
                bs58::encode(h)
                    .with_check_version(network.pubkey_hash_prefix())
                    .into_string(),
            ),
            ScriptAddr::P2sh(h) => Some(
                bs58::encode(h)
                    .with_check_version(network.script_hash_prefix())
                    .into_string(),
            ),
            ScriptAddr::P2wpkh(h) => {
                let mut data = vec![bech32::u5::try_from_u8(0).expect("0 is a valid u5")];
                data.extend(h.to_base32());
                bech32::encode(network.bech32_hrp(), data, Variant::Bech32).ok()
            }
            ScriptAddr::NonStandard(_) => None,
        }
    }
}

impl std::fmt::Debug for ScriptAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ScriptAddr")
            .field(&hex::encode(self.to_bytes()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh_script(hash: [u8; 20]) -> Script {
        let mut bytes = vec![0x76, 0xA9, 0x14];
        bytes.extend_from_slice(&hash);
        bytes.extend_from_slice(&[0x88, 0xAC]);
        Script(bytes)
    }

    #[test]
    fn standard_shapes_classify() {
        let hash = [7u8; 20];
        assert_eq!(
            ScriptAddr::from_lock_script(&p2pkh_script(hash)),
            ScriptAddr::P2pkh(hash)
        );

        let mut p2sh = vec![0xA9, 0x14];
        p2sh.extend_from_slice(&hash);
        p2sh.push(0x87);
        assert_eq!(
            ScriptAddr::from_lock_script(&Script(p2sh)),
            ScriptAddr::P2sh(hash)
        );

        let mut p2wpkh = vec![0x00, 0x14];
        p2wpkh.extend_from_slice(&hash);
        assert_eq!(
            ScriptAddr::from_lock_script(&Script(p2wpkh)),
            ScriptAddr::P2wpkh(hash)
        );
    }

    #[test]
    fn nonstandard_scripts_get_stable_addrs() {
        let script = Script(vec![0x6A, 0x04, 0xDE, 0xAD, 0xBE, 0xEF]);
        let a = ScriptAddr::from_lock_script(&script);
        let b = ScriptAddr::from_lock_script(&script);
        assert_eq!(a, b);
        assert!(matches!(a, ScriptAddr::NonStandard(_)));
        assert_eq!(a.to_address_string(Network::Mainnet), None);
    }

    #[test]
    fn known_p2pkh_address_vector() {
        // hash160 of all zeroes renders the well-known burn address.
        let addr = ScriptAddr::P2pkh([0u8; 20]);
        assert_eq!(
            addr.to_address_string(Network::Mainnet).unwrap(),
            "1111111111111111111114oLvT2"
        );
    }

    #[test]
    fn p2wpkh_renders_bech32() {
        let addr = ScriptAddr::P2wpkh([0u8; 20]);
        let rendered = addr.to_address_string(Network::Mainnet).unwrap();
        assert!(rendered.starts_with("bc1q"));
    }
}
