//! Wire format types for x402 payment exchanges.
//!
//! These are the JSON documents that travel in `X-PAYMENT` headers,
//! 402 challenge bodies, JSON-RPC error `data` payloads, and facilitator
//! `/verify` requests. Field names follow the x402 v1 camelCase
//! convention.

use serde::{Deserialize, Serialize};

use crate::amount::Money;
use crate::networks::Network;

/// Version marker that serializes as the integer `V` and rejects any
/// other value on deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version<const V: u8>;

/// Version marker for x402 protocol version 1.
pub type X402Version1 = Version<1>;

/// Convenience constant for constructing protocol messages.
pub const V1: X402Version1 = Version;

impl<const V: u8> Serialize for Version<V> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(V)
    }
}

impl<'de, const V: u8> Deserialize<'de> for Version<V> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        if raw == V {
            Ok(Self)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported x402 version {raw}, expected {V}"
            )))
        }
    }
}

/// The payment scheme used throughout the gateway.
pub const EXACT_SCHEME: &str = "exact";

/// Default validity window for emitted payment requirements, in seconds.
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 30;

/// The kind of MCP capability a payment applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// An MCP tool (`tools/call`).
    Tool,
    /// An MCP resource (`resources/read`).
    Resource,
    /// An MCP prompt (`prompts/get`).
    Prompt,
}

impl EntityKind {
    /// Singular noun used in challenge descriptions.
    #[must_use]
    pub const fn noun(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::Prompt => "prompt",
        }
    }

    /// Path segment used when building challenge resource URLs.
    #[must_use]
    pub const fn path_segment(self) -> &'static str {
        match self {
            Self::Tool => "tools",
            Self::Resource => "resources",
            Self::Prompt => "prompts",
        }
    }
}

/// Payment terms for a single acceptable payment method.
///
/// One of these appears in every challenge's `accepts` array and in each
/// facilitator verify request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Payment scheme; the gateway only emits [`EXACT_SCHEME`].
    pub scheme: String,
    /// Wire name of the settlement network.
    pub network: Network,
    /// Maximum payment amount in atomic USDC units, as a decimal string.
    pub max_amount_required: String,
    /// The resource being paid for, e.g. `/tools/price`.
    pub resource: String,
    /// Recipient address for the payment.
    pub pay_to: String,
    /// USDC contract address on `network`.
    pub asset: String,
    /// Validity window for the payment authorization.
    pub max_timeout_seconds: u64,
    /// Human-readable description of what is being bought.
    pub description: String,
    /// MIME type of the paid resource.
    pub mime_type: String,
}

impl PaymentRequirements {
    /// Builds the single `exact`-scheme requirement the gateway emits for
    /// a priced capability.
    #[must_use]
    pub fn exact(
        kind: EntityKind,
        name: &str,
        price: Money,
        network: Network,
        pay_to: impl Into<String>,
    ) -> Self {
        Self {
            scheme: EXACT_SCHEME.to_owned(),
            network,
            max_amount_required: price.atomic_units(),
            resource: format!("/{}/{}", kind.path_segment(), name),
            pay_to: pay_to.into(),
            asset: network.usdc_asset().to_owned(),
            max_timeout_seconds: DEFAULT_MAX_TIMEOUT_SECS,
            description: format!("Payment for MCP {}: {}", kind.noun(), name),
            mime_type: "application/json".to_owned(),
        }
    }
}

/// The payment challenge document.
///
/// Emitted as the body of an HTTP 402 response and as the structured
/// `data` payload of the JSON-RPC payment error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Protocol version (always 1).
    pub x402_version: X402Version1,
    /// Acceptable payment methods; the gateway emits exactly one.
    #[serde(default)]
    pub accepts: Vec<PaymentRequirements>,
    /// Optional error detail when the challenge follows a failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PaymentRequired {
    /// Builds a challenge with a single acceptable payment method.
    #[must_use]
    pub fn single(requirements: PaymentRequirements) -> Self {
        Self {
            x402_version: V1,
            accepts: vec![requirements],
            error: None,
        }
    }

    /// Attaches an error detail to the challenge.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A signed payment authorization presented by a payer.
///
/// The `payload` is scheme-specific and opaque to the gateway; only the
/// facilitator interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version (always 1).
    pub x402_version: X402Version1,
    /// The payment scheme (e.g. `"exact"`).
    pub scheme: String,
    /// Wire name of the settlement network.
    pub network: String,
    /// Scheme-specific signed payload.
    pub payload: serde_json::Value,
}

/// Request body for the facilitator `/verify` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// The payer's payment payload, decoded from the `X-PAYMENT` header.
    pub payment_payload: serde_json::Value,
    /// The requirements the payment must satisfy.
    pub payment_requirements: PaymentRequirements,
}

/// Verdict returned by a facilitator for a verify request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the payment satisfies the requirements.
    #[serde(default, alias = "isValid")]
    pub verified: bool,
    /// Reason the payment was rejected, when available.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "invalidReason")]
    pub error: Option<String>,
}

impl Verdict {
    /// A positive verdict.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            verified: true,
            error: None,
        }
    }

    /// A negative verdict with a reason.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            verified: false,
            error: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_marker_round_trip() {
        let json = serde_json::to_string(&V1).unwrap();
        assert_eq!(json, "1");
        assert!(serde_json::from_str::<X402Version1>("1").is_ok());
        assert!(serde_json::from_str::<X402Version1>("2").is_err());
    }

    #[test]
    fn challenge_shape_matches_wire_format() {
        let price: Money = "$0.01".parse().unwrap();
        let req = PaymentRequirements::exact(
            EntityKind::Tool,
            "price",
            price,
            Network::BaseSepolia,
            "0xAB01",
        );
        let challenge = PaymentRequired::single(req);
        let json = serde_json::to_value(&challenge).unwrap();

        assert_eq!(json["x402Version"], 1);
        let accepts = json["accepts"].as_array().unwrap();
        assert_eq!(accepts.len(), 1);
        let entry = &accepts[0];
        assert_eq!(entry["scheme"], "exact");
        assert_eq!(entry["network"], "base-sepolia");
        assert_eq!(entry["maxAmountRequired"], "10000");
        assert_eq!(entry["payTo"], "0xAB01");
        assert_eq!(
            entry["asset"],
            "0x036CbD53842c5426634e7929541eC2318f3dCF7e"
        );
        assert_eq!(entry["maxTimeoutSeconds"], 30);
        assert_eq!(entry["resource"], "/tools/price");
        assert_eq!(entry["mimeType"], "application/json");
        assert_eq!(entry["description"], "Payment for MCP tool: price");
    }

    #[test]
    fn verdict_accepts_facilitator_aliases() {
        let verdict: Verdict =
            serde_json::from_str(r#"{"isValid": true}"#).unwrap();
        assert!(verdict.verified);
        let verdict: Verdict =
            serde_json::from_str(r#"{"verified": false, "invalidReason": "expired"}"#).unwrap();
        assert!(!verdict.verified);
        assert_eq!(verdict.error.as_deref(), Some("expired"));
    }
}
