//! Per-network consensus and encoding parameters.
//!
//! Everything the service needs to know about the network it is tracking
//! is carried by value on the [`Network`] enum; there is no global
//! settings object.

use lazy_static::lazy_static;

lazy_static! {
    static ref MAINNET_GENESIS_HASH: [u8; 32] = genesis_from_hex(
        "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000"
    );
    static ref TESTNET_GENESIS_HASH: [u8; 32] = genesis_from_hex(
        "43497fd7f826957108f4a30fd9cec3aeba79972084e90ead01ea330900000000"
    );
    static ref REGTEST_GENESIS_HASH: [u8; 32] = genesis_from_hex(
        "06226e46111a0b59caaf126043eb5bbf28c34f3a5e332a1fc7b2b73cf188910f"
    );
}

fn genesis_from_hex(hex_str: &str) -> [u8; 32] {
    let bytes = hex::decode(hex_str).expect("hardcoded genesis hash is valid hex");
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    out
}

/// The Bitcoin network the service is tracking.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

impl Network {
    /// The wire protocol magic bytes.
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xF9, 0xBE, 0xB4, 0xD9],
            Network::Testnet => [0x0B, 0x11, 0x09, 0x07],
            Network::Regtest => [0xFA, 0xBF, 0xB5, 0xDA],
        }
    }

    /// The base58check version byte for pay-to-pubkey-hash addresses.
    pub fn pubkey_hash_prefix(&self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet | Network::Regtest => 0x6F,
        }
    }

    /// The base58check version byte for pay-to-script-hash addresses.
    pub fn script_hash_prefix(&self) -> u8 {
        match self {
            Network::Mainnet => 0x05,
            Network::Testnet | Network::Regtest => 0xC4,
        }
    }

    /// The bech32 human-readable part for segwit addresses.
    pub fn bech32_hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "bc",
            Network::Testnet => "tb",
            Network::Regtest => "bcrt",
        }
    }

    /// The genesis block hash, in internal byte order.
    pub fn genesis_hash(&self) -> [u8; 32] {
        match self {
            Network::Mainnet => *MAINNET_GENESIS_HASH,
            Network::Testnet => *TESTNET_GENESIS_HASH,
            Network::Regtest => *REGTEST_GENESIS_HASH,
        }
    }

    /// The default port for the network's P2P listener.
    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }
}

impl std::str::FromStr for Network {
    type Err = InvalidNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            wrong => Err(InvalidNetworkError(wrong.to_owned())),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("invalid network: {0}")]
pub struct InvalidNetworkError(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn networks_have_distinct_magic() {
        let magics = [
            Network::Mainnet.magic(),
            Network::Testnet.magic(),
            Network::Regtest.magic(),
        ];
        assert_ne!(magics[0], magics[1]);
        assert_ne!(magics[1], magics[2]);
        assert_ne!(magics[0], magics[2]);
    }

    #[test]
    fn parse_round_trip() {
        for name in ["mainnet", "testnet", "regtest"] {
            let network: Network = name.parse().unwrap();
            assert_eq!(format!("{:?}", network).to_lowercase(), name);
        }
        assert!("simnet".parse::<Network>().is_err());
    }
}
