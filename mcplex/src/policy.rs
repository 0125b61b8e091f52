//! Payment policy model: per-entity pricing, per-upstream payment modes,
//! and the gateway-wide payment policy.
//!
//! These types are deserialized from the gateway configuration and are
//! immutable for the lifetime of the process. The mediator reads them;
//! nothing mutates them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::amount::{Markup, Money};
use crate::networks::Network;

/// Pricing descriptor for a single tool, resource, or prompt.
///
/// Tier values reuse [`Money`] parsing, so `"free"`, `"$0"`, and
/// `"$0.00"` all mean a zero price.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pricing {
    /// Explicitly free; overrides any price below.
    #[serde(default)]
    pub free: bool,
    /// Price for anonymous x402 payers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x402: Option<Money>,
    /// Per-tier prices for API-key holders, keyed by tier label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_tiers: Option<HashMap<String, Money>>,
}

impl Pricing {
    /// Returns `true` when this pricing means "no payment required".
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.free
    }

    /// Looks up the price for an API-key tier, if one is configured.
    #[must_use]
    pub fn tier_price(&self, tier: &str) -> Option<Money> {
        self.api_key_tiers.as_ref()?.get(tier).copied()
    }
}

/// How the gateway relates inbound payments to a paid upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMode {
    /// The upstream is not payment-aware; forward calls untouched.
    #[default]
    None,
    /// Relay the client's own payment headers to the upstream.
    Passthrough,
    /// Gateway pays the upstream and charges the client a marked-up price.
    Markup,
    /// Gateway pays the upstream and charges the client per the absorb
    /// pricing (often free for privileged tiers).
    Absorb,
}

/// Per-upstream payment policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamPaymentPolicy {
    /// Relationship between inbound and outbound payments.
    #[serde(default)]
    pub mode: PaymentMode,
    /// Markup applied when `mode` is [`PaymentMode::Markup`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markup: Option<Markup>,
    /// Pricing used when no per-tool entry matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pricing: Option<Pricing>,
    /// Pricing overrides keyed by the upstream's original tool name
    /// (or resource URI / prompt name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_tool: Option<HashMap<String, Pricing>>,
}

impl UpstreamPaymentPolicy {
    /// Resolves pricing for a capability by its upstream-original name.
    ///
    /// Per-tool entries win over the default; `None` means free.
    #[must_use]
    pub fn resolve_pricing(&self, original_name: &str) -> Option<&Pricing> {
        if let Some(pricing) = self.per_tool.as_ref().and_then(|m| m.get(original_name)) {
            return Some(pricing);
        }
        self.default_pricing.as_ref()
    }
}

/// A configured API key with its tier and optional rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    /// The literal key value clients present.
    pub key: String,
    /// Tier label used for pricing lookups.
    pub tier: String,
    /// Requests per minute allowed for this key; `None` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
}

/// Gateway-owned credential used to pay payment-demanding upstreams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundCredential {
    /// Opaque credential material; never logged.
    pub credential: String,
    /// Hard cap on any single outbound payment.
    #[serde(default = "OutboundCredential::default_max_value")]
    pub max_value: Money,
}

impl OutboundCredential {
    fn default_max_value() -> Money {
        "$1.00".parse().expect("static default parses")
    }
}

/// Gateway-wide payment policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPolicy {
    /// Master switch; when `false` every call is admitted free.
    #[serde(default)]
    pub enabled: bool,
    /// Address that receives inbound payments.
    #[serde(default)]
    pub recipient: String,
    /// Settlement network for inbound payments.
    #[serde(default)]
    pub network: Network,
    /// Base URL of the external verification facilitator.
    #[serde(default = "PaymentPolicy::default_facilitator_url")]
    pub facilitator_url: String,
    /// Enables outbound payments when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<OutboundCredential>,
    /// Static API keys mapped to tiers.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

impl PaymentPolicy {
    fn default_facilitator_url() -> String {
        "https://x402.org/facilitator".to_owned()
    }

    /// A disabled policy; every call is admitted free.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            recipient: String::new(),
            network: Network::default(),
            facilitator_url: Self::default_facilitator_url(),
            outbound: None,
            api_keys: Vec::new(),
        }
    }
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing(x402: &str) -> Pricing {
        Pricing {
            free: false,
            x402: Some(x402.parse().unwrap()),
            api_key_tiers: None,
        }
    }

    #[test]
    fn per_tool_wins_over_default() {
        let policy = UpstreamPaymentPolicy {
            default_pricing: Some(pricing("$0.01")),
            per_tool: Some(HashMap::from([("search".to_owned(), pricing("$0.10"))])),
            ..Default::default()
        };
        assert_eq!(
            policy.resolve_pricing("search").unwrap().x402.unwrap(),
            "$0.10".parse().unwrap()
        );
        assert_eq!(
            policy.resolve_pricing("other").unwrap().x402.unwrap(),
            "$0.01".parse().unwrap()
        );
    }

    #[test]
    fn missing_pricing_means_free() {
        let policy = UpstreamPaymentPolicy::default();
        assert!(policy.resolve_pricing("anything").is_none());
    }

    #[test]
    fn tier_values_parse_free_as_zero() {
        let json = r#"{"api_key_tiers": {"premium": "free", "basic": "$0.05"}}"#;
        let pricing: Pricing = serde_json::from_str(json).unwrap();
        assert!(pricing.tier_price("premium").unwrap().is_zero());
        assert!(!pricing.tier_price("basic").unwrap().is_zero());
        assert!(pricing.tier_price("unknown").is_none());
    }

    #[test]
    fn payment_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&PaymentMode::Passthrough).unwrap(),
            "\"passthrough\""
        );
        let mode: PaymentMode = serde_json::from_str("\"absorb\"").unwrap();
        assert_eq!(mode, PaymentMode::Absorb);
    }
}
