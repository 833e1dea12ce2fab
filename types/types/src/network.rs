//! The networks a node can run on.
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

const MAINNET_MAGIC: u32 = 0xd9b4_bef9;
const TESTNET_MAGIC: u32 = 0x0709_110b;
const REGTEST_MAGIC: u32 = 0xdab5_bffa;
const SIMNET_MAGIC: u32 = 0x1214_1c16;

/// An enum representing every network.
#[derive(Debug, Clone, Copy, Default, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Network {
    /// Mainnet
    #[default]
    Mainnet,
    /// Testnet
    Testnet,
    /// Regression test network.
    ///
    /// Peers on this network are always sync candidates and headers-first sync is never used.
    Regtest,
    /// Simulation test network.
    Simnet,
}

impl Network {
    /// Returns the 4 byte magic that prefixes every message on this network.
    pub const fn magic(&self) -> u32 {
        match self {
            Self::Mainnet => MAINNET_MAGIC,
            Self::Testnet => TESTNET_MAGIC,
            Self::Regtest => REGTEST_MAGIC,
            Self::Simnet => SIMNET_MAGIC,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown network: {0}")]
pub struct ParseNetworkError(pub String);

impl FromStr for Network {
    type Err = ParseNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            "simnet" => Ok(Self::Simnet),
            _ => Err(ParseNetworkError(s.to_string())),
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
            Self::Simnet => "simnet",
        })
    }
}
