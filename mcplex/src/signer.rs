//! Outbound payment authorization signing.
//!
//! When a downstream (upstream-of-gateway) server demands payment, the
//! gateway answers with an authorization derived from its own credential.
//! The credential is opaque at this layer: the facilitator on the far
//! side is the authority on whether the produced payload settles.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::proto::{EXACT_SCHEME, PaymentPayload, PaymentRequirements, V1};

/// Errors from constructing an outbound payment payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignerError {
    /// No outbound credential is configured.
    #[error("no outbound payment credential configured")]
    NoCredential,
    /// The requirements asked for a scheme this signer cannot produce.
    #[error("unsupported payment scheme: {0:?}")]
    UnsupportedScheme(String),
}

/// Produces signed payment payloads for a given set of requirements.
pub trait PaymentSigner: Send + Sync {
    /// Signs an authorization satisfying `requirements`.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError`] when the scheme is unsupported or no
    /// credential is available.
    fn sign(&self, requirements: &PaymentRequirements) -> Result<PaymentPayload, SignerError>;
}

/// Signer backed by the gateway-owned opaque credential.
#[derive(Debug, Clone)]
pub struct CredentialSigner {
    credential: String,
}

impl CredentialSigner {
    /// Creates a signer from the configured credential.
    #[must_use]
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
        }
    }
}

impl PaymentSigner for CredentialSigner {
    fn sign(&self, requirements: &PaymentRequirements) -> Result<PaymentPayload, SignerError> {
        if requirements.scheme != EXACT_SCHEME {
            return Err(SignerError::UnsupportedScheme(requirements.scheme.clone()));
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Ok(PaymentPayload {
            x402_version: V1,
            scheme: EXACT_SCHEME.to_owned(),
            network: requirements.network.name().to_owned(),
            payload: json!({
                "authorization": {
                    "to": requirements.pay_to,
                    "asset": requirements.asset,
                    "value": requirements.max_amount_required,
                    "validAfter": "0",
                    "validBefore": (now + requirements.max_timeout_seconds).to_string(),
                },
                "signature": self.credential,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Money;
    use crate::networks::Network;
    use crate::proto::EntityKind;

    #[test]
    fn signs_exact_requirements() {
        let signer = CredentialSigner::new("cred-123");
        let price: Money = "$0.02".parse().unwrap();
        let requirements =
            PaymentRequirements::exact(EntityKind::Tool, "echo", price, Network::Base, "0xFEED");
        let payload = signer.sign(&requirements).unwrap();
        assert_eq!(payload.scheme, "exact");
        assert_eq!(payload.network, "base");
        assert_eq!(payload.payload["authorization"]["value"], "20000");
        assert_eq!(payload.payload["signature"], "cred-123");
    }

    #[test]
    fn rejects_unknown_schemes() {
        let signer = CredentialSigner::new("cred");
        let price: Money = "$0.02".parse().unwrap();
        let mut requirements =
            PaymentRequirements::exact(EntityKind::Tool, "echo", price, Network::Base, "0xFEED");
        requirements.scheme = "stream".to_owned();
        assert!(matches!(
            signer.sign(&requirements),
            Err(SignerError::UnsupportedScheme(_))
        ));
    }
}
