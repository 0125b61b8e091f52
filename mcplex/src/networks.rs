//! Supported settlement networks and their USDC deployments.
//!
//! The gateway prices everything in USDC. Each supported network maps to
//! the canonical USDC ERC-20 contract on that chain; unknown network
//! names fall back to [`Network::BaseSepolia`] so that a misconfigured
//! gateway still emits well-formed payment challenges.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A settlement network the gateway can charge on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    /// Base Sepolia testnet (default).
    #[default]
    BaseSepolia,
    /// Base mainnet.
    Base,
    /// Ethereum mainnet.
    Ethereum,
    /// Optimism mainnet.
    Optimism,
    /// Polygon PoS mainnet.
    Polygon,
}

/// A known network definition with its wire name and USDC deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Human-readable network name used on the wire (e.g. `"base-sepolia"`).
    pub name: &'static str,
    /// USDC ERC-20 contract address on this network.
    pub usdc_asset: &'static str,
}

/// All networks the gateway knows how to charge on.
pub const KNOWN_NETWORKS: &[(Network, NetworkInfo)] = &[
    (
        Network::BaseSepolia,
        NetworkInfo {
            name: "base-sepolia",
            usdc_asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
        },
    ),
    (
        Network::Base,
        NetworkInfo {
            name: "base",
            usdc_asset: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
        },
    ),
    (
        Network::Ethereum,
        NetworkInfo {
            name: "ethereum",
            usdc_asset: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
        },
    ),
    (
        Network::Optimism,
        NetworkInfo {
            name: "optimism",
            usdc_asset: "0x0b2C639c533813f4Aa9D7837CAf62653d097Ff85",
        },
    ),
    (
        Network::Polygon,
        NetworkInfo {
            name: "polygon",
            usdc_asset: "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359",
        },
    ),
];

impl Network {
    /// Returns the static info record for this network.
    #[must_use]
    pub fn info(self) -> &'static NetworkInfo {
        // KNOWN_NETWORKS covers every variant.
        KNOWN_NETWORKS
            .iter()
            .find(|(n, _)| *n == self)
            .map(|(_, info)| info)
            .expect("every network variant has an info record")
    }

    /// Wire name of this network (e.g. `"base-sepolia"`).
    #[must_use]
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// USDC contract address on this network.
    #[must_use]
    pub fn usdc_asset(self) -> &'static str {
        self.info().usdc_asset
    }

    /// Resolves a network by wire name, falling back to
    /// [`Network::BaseSepolia`] for unknown names.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        KNOWN_NETWORKS
            .iter()
            .find(|(_, info)| info.name == name)
            .map_or(Self::BaseSepolia, |(network, _)| *network)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Strict parse used where a typo should be an error rather than a
/// silent testnet fallback (configuration validation).
impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KNOWN_NETWORKS
            .iter()
            .find(|(_, info)| info.name == s)
            .map(|(network, _)| *network)
            .ok_or_else(|| UnknownNetwork(s.to_owned()))
    }
}

/// Error for a network name outside [`KNOWN_NETWORKS`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown network: {0:?}")]
pub struct UnknownNetwork(pub String);

impl Serialize for Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
