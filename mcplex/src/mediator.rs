//! The bidirectional payment policy engine.
//!
//! For every inbound call the mediator decides one of four outcomes:
//! admit free, admit paid (API key or verified x402 payment), challenge
//! with payment requirements, or reject. When a call is admitted it also
//! produces the [`ForwardDirective`] telling the dispatch path how to
//! treat payment material on the way to the upstream.
//!
//! The mediator holds the gateway-wide [`PaymentPolicy`] and its API-key
//! index by value; both are immutable after construction, so admission
//! needs no locks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::amount::{Money, compute_markup_price};
use crate::auth::InboundAuth;
use crate::facilitator::Facilitator;
use crate::policy::{ApiKeyEntry, PaymentMode, PaymentPolicy, Pricing, UpstreamPaymentPolicy};
use crate::proto::{EntityKind, PaymentRequired, PaymentRequirements, VerifyRequest};
use crate::ratelimit::RateLimiter;

/// How an admitted call was paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    /// Verified x402 payment from the `X-PAYMENT` header.
    X402,
    /// A configured API key (possibly on a free tier).
    ApiKey,
}

/// Result of mediating an inbound call.
#[derive(Debug, Clone)]
pub enum PaymentOutcome {
    /// No payment required; forward the call.
    AllowFree,
    /// Payment satisfied; forward the call.
    AllowPaid {
        /// How the payment was satisfied.
        method: PaymentMethod,
        /// The price that was charged (zero for free tiers).
        amount: Money,
    },
    /// No acceptable payment presented; the client must pay and retry.
    Challenge(Box<PaymentRequired>),
    /// A payment was presented but did not verify, or policy forbids
    /// the call outright.
    Reject {
        /// Human-readable rejection reason.
        reason: String,
    },
}

impl PaymentOutcome {
    /// `true` when the call may proceed to the upstream.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::AllowFree | Self::AllowPaid { .. })
    }
}

/// Instruction for the dispatch path once a call is admitted.
#[derive(Debug, Clone)]
pub enum ForwardDirective {
    /// Forward without payment augmentation.
    Direct,
    /// Relay the client's own payment headers, casing preserved.
    Passthrough {
        /// The recognized header pairs exactly as the client sent them.
        headers: Vec<(String, String)>,
    },
    /// The gateway pays the upstream itself, up to the given cap.
    Paid {
        /// Hard cap on the outbound payment.
        max_value: Money,
    },
}

/// A single admission question put to the mediator.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    /// What kind of capability is being invoked.
    pub kind: EntityKind,
    /// The upstream-original name (pricing key and challenge subject).
    pub name: &'a str,
    /// The payment policy of the target upstream, if it has one.
    pub upstream_policy: Option<&'a UpstreamPaymentPolicy>,
    /// Credentials presented by the client.
    pub auth: &'a InboundAuth,
}

/// The payment mediator.
pub struct PaymentMediator {
    policy: PaymentPolicy,
    keys: HashMap<String, ApiKeyEntry>,
    limiter: RateLimiter,
    facilitator: Arc<dyn Facilitator>,
}

impl std::fmt::Debug for PaymentMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentMediator")
            .field("enabled", &self.policy.enabled)
            .field("api_keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

impl PaymentMediator {
    /// Creates a mediator from the gateway policy and a facilitator.
    #[must_use]
    pub fn new(policy: PaymentPolicy, facilitator: Arc<dyn Facilitator>) -> Self {
        let keys = policy
            .api_keys
            .iter()
            .map(|entry| (entry.key.clone(), entry.clone()))
            .collect();
        Self {
            policy,
            keys,
            limiter: RateLimiter::new(),
            facilitator,
        }
    }

    /// The gateway-wide payment policy this mediator enforces.
    #[must_use]
    pub const fn policy(&self) -> &PaymentPolicy {
        &self.policy
    }

    /// Decides whether an inbound call is admitted, challenged, or
    /// rejected.
    pub async fn admit(&self, request: AdmissionRequest<'_>) -> PaymentOutcome {
        if !self.policy.enabled {
            return PaymentOutcome::AllowFree;
        }
        let pricing = request
            .upstream_policy
            .and_then(|policy| policy.resolve_pricing(request.name));
        let Some(pricing) = pricing else {
            return PaymentOutcome::AllowFree;
        };
        if pricing.is_free() {
            return PaymentOutcome::AllowFree;
        }

        // API key first: cheap, local, no facilitator round trip.
        if let Some(key) = request.auth.api_key()
            && let Some(entry) = self.keys.get(key)
        {
            if let Some(limit) = entry.rate_limit
                && !self.limiter.allow(key, limit)
            {
                tracing::warn!(tier = %entry.tier, "API key over rate limit");
                return PaymentOutcome::Reject {
                    reason: "rate limit exceeded".to_owned(),
                };
            }
            if let Some(tier_price) = pricing.tier_price(&entry.tier) {
                tracing::debug!(
                    kind = ?request.kind,
                    name = %request.name,
                    tier = %entry.tier,
                    amount = %tier_price,
                    "admitted via API key tier"
                );
                return PaymentOutcome::AllowPaid {
                    method: PaymentMethod::ApiKey,
                    amount: tier_price,
                };
            }
            // Known key without a matching tier price: fall through to x402.
        }

        let price = self.effective_price(request.upstream_policy, pricing);
        let Some(payment) = request.auth.payment() else {
            return PaymentOutcome::Challenge(Box::new(self.challenge(
                request.kind,
                request.name,
                price,
            )));
        };

        let payload: serde_json::Value = match payment.decode_json() {
            Ok(value) => value,
            Err(err) => {
                return PaymentOutcome::Challenge(Box::new(
                    self.challenge(request.kind, request.name, price)
                        .with_error(format!("malformed X-PAYMENT header: {err}")),
                ));
            }
        };

        let verify = VerifyRequest {
            payment_payload: payload,
            payment_requirements: self.requirements(request.kind, request.name, price),
        };
        match self.facilitator.verify(verify).await {
            Ok(verdict) if verdict.verified => PaymentOutcome::AllowPaid {
                method: PaymentMethod::X402,
                amount: price,
            },
            Ok(verdict) => {
                // Facilitator HTTP failures are reported as "HTTP <code>"
                // verdicts; keep those codes out of the client-facing reason.
                let reason = match verdict.error {
                    Some(detail) if detail.starts_with("HTTP ") => {
                        tracing::warn!(%detail, "facilitator verify returned HTTP failure");
                        "verification failed".to_owned()
                    }
                    Some(detail) => format!("verification failed: {detail}"),
                    None => "verification failed".to_owned(),
                };
                PaymentOutcome::Reject { reason }
            }
            Err(err) => {
                // Facilitator trouble is not the client's business; keep
                // HTTP codes and transport detail out of the reason.
                tracing::warn!(error = %err, "facilitator verify failed");
                PaymentOutcome::Reject {
                    reason: "verification failed".to_owned(),
                }
            }
        }
    }

    /// Produces the forwarding instruction for an admitted call.
    #[must_use]
    pub fn forward_directive(
        &self,
        upstream_policy: Option<&UpstreamPaymentPolicy>,
        auth: &InboundAuth,
    ) -> ForwardDirective {
        let Some(policy) = upstream_policy else {
            return ForwardDirective::Direct;
        };
        match policy.mode {
            PaymentMode::None => ForwardDirective::Direct,
            PaymentMode::Passthrough => ForwardDirective::Passthrough {
                headers: auth.forwarded_headers().to_vec(),
            },
            PaymentMode::Markup | PaymentMode::Absorb => match &self.policy.outbound {
                Some(outbound) => ForwardDirective::Paid {
                    max_value: outbound.max_value,
                },
                None => {
                    tracing::warn!(
                        "upstream expects gateway-paid calls but no outbound credential is configured"
                    );
                    ForwardDirective::Direct
                }
            },
        }
    }

    /// The client-facing x402 price for a capability.
    ///
    /// Markup mode publishes the downstream price with the configured
    /// markup applied; every other mode publishes the configured price.
    /// A missing price defaults to $0.01.
    fn effective_price(
        &self,
        upstream_policy: Option<&UpstreamPaymentPolicy>,
        pricing: &Pricing,
    ) -> Money {
        let base = pricing
            .x402
            .unwrap_or_else(|| "$0.01".parse().expect("static default parses"));
        match upstream_policy {
            Some(policy) if policy.mode == PaymentMode::Markup => policy
                .markup
                .as_ref()
                .map_or(base, |markup| compute_markup_price(base, markup)),
            _ => base,
        }
    }

    fn requirements(&self, kind: EntityKind, name: &str, price: Money) -> PaymentRequirements {
        PaymentRequirements::exact(
            kind,
            name,
            price,
            self.policy.network,
            self.policy.recipient.clone(),
        )
    }

    fn challenge(&self, kind: EntityKind, name: &str, price: Money) -> PaymentRequired {
        PaymentRequired::single(self.requirements(kind, name, price))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::encoding::Base64Bytes;
    use crate::facilitator::{BoxFuture, FacilitatorError};
    use crate::networks::Network;
    use crate::policy::OutboundCredential;
    use crate::proto::Verdict;

    /// Facilitator stub with a fixed verdict and a call counter.
    struct FakeFacilitator {
        verdict: Verdict,
        calls: AtomicUsize,
    }

    impl FakeFacilitator {
        fn accepting() -> Arc<Self> {
            Arc::new(Self {
                verdict: Verdict::ok(),
                calls: AtomicUsize::new(0),
            })
        }

        fn rejecting(reason: &str) -> Arc<Self> {
            Arc::new(Self {
                verdict: Verdict::rejected(reason),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Facilitator for FakeFacilitator {
        fn verify(
            &self,
            _request: VerifyRequest,
        ) -> BoxFuture<'_, Result<Verdict, FacilitatorError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let verdict = self.verdict.clone();
            Box::pin(async move { Ok(verdict) })
        }
    }

    fn policy_with_keys(keys: Vec<ApiKeyEntry>) -> PaymentPolicy {
        PaymentPolicy {
            enabled: true,
            recipient: "0xAB01".to_owned(),
            network: Network::BaseSepolia,
            facilitator_url: "http://localhost:4021".to_owned(),
            outbound: None,
            api_keys: keys,
        }
    }

    fn priced(x402: &str) -> UpstreamPaymentPolicy {
        UpstreamPaymentPolicy {
            default_pricing: Some(Pricing {
                free: false,
                x402: Some(x402.parse().unwrap()),
                api_key_tiers: None,
            }),
            ..Default::default()
        }
    }

    fn payment_header() -> InboundAuth {
        let payload = serde_json::json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "base-sepolia",
            "payload": {"signature": "0xsig"},
        });
        let encoded = Base64Bytes::encode_json(&payload).unwrap();
        InboundAuth::from_headers([("X-PAYMENT", encoded.to_string().as_str())])
    }

    #[tokio::test]
    async fn disabled_policy_admits_everything_free() {
        let mediator =
            PaymentMediator::new(PaymentPolicy::disabled(), FakeFacilitator::accepting());
        let auth = InboundAuth::anonymous();
        let outcome = mediator
            .admit(AdmissionRequest {
                kind: EntityKind::Tool,
                name: "ls",
                upstream_policy: Some(&priced("$5.00")),
                auth: &auth,
            })
            .await;
        assert!(matches!(outcome, PaymentOutcome::AllowFree));
    }

    #[tokio::test]
    async fn unpriced_capability_is_free() {
        let mediator =
            PaymentMediator::new(policy_with_keys(vec![]), FakeFacilitator::accepting());
        let auth = InboundAuth::anonymous();
        let outcome = mediator
            .admit(AdmissionRequest {
                kind: EntityKind::Tool,
                name: "ls",
                upstream_policy: Some(&UpstreamPaymentPolicy::default()),
                auth: &auth,
            })
            .await;
        assert!(matches!(outcome, PaymentOutcome::AllowFree));
    }

    #[tokio::test]
    async fn missing_payment_yields_exact_challenge() {
        let mediator =
            PaymentMediator::new(policy_with_keys(vec![]), FakeFacilitator::accepting());
        let auth = InboundAuth::anonymous();
        let outcome = mediator
            .admit(AdmissionRequest {
                kind: EntityKind::Tool,
                name: "price",
                upstream_policy: Some(&priced("$0.01")),
                auth: &auth,
            })
            .await;
        let PaymentOutcome::Challenge(challenge) = outcome else {
            panic!("expected challenge, got {outcome:?}");
        };
        assert_eq!(challenge.accepts.len(), 1);
        let accepts = &challenge.accepts[0];
        assert_eq!(accepts.max_amount_required, "10000");
        assert_eq!(accepts.pay_to, "0xAB01");
        assert_eq!(accepts.resource, "/tools/price");
        assert_eq!(accepts.description, "Payment for MCP tool: price");
        assert_eq!(
            accepts.asset,
            "0x036CbD53842c5426634e7929541eC2318f3dCF7e"
        );
    }

    #[tokio::test]
    async fn free_tier_key_bypasses_facilitator() {
        let facilitator = FakeFacilitator::accepting();
        let mediator = PaymentMediator::new(
            policy_with_keys(vec![ApiKeyEntry {
                key: "K".to_owned(),
                tier: "premium".to_owned(),
                rate_limit: None,
            }]),
            Arc::clone(&facilitator) as Arc<dyn Facilitator>,
        );
        let upstream = UpstreamPaymentPolicy {
            default_pricing: Some(Pricing {
                free: false,
                x402: Some("$0.10".parse().unwrap()),
                api_key_tiers: Some(HashMap::from([(
                    "premium".to_owned(),
                    "free".parse().unwrap(),
                )])),
            }),
            ..Default::default()
        };
        let auth = InboundAuth::with_api_key("K");
        let outcome = mediator
            .admit(AdmissionRequest {
                kind: EntityKind::Tool,
                name: "search",
                upstream_policy: Some(&upstream),
                auth: &auth,
            })
            .await;
        match outcome {
            PaymentOutcome::AllowPaid { method, amount } => {
                assert_eq!(method, PaymentMethod::ApiKey);
                assert!(amount.is_zero());
            }
            other => panic!("expected paid admission, got {other:?}"),
        }
        assert_eq!(facilitator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tier_miss_falls_through_to_challenge() {
        let mediator = PaymentMediator::new(
            policy_with_keys(vec![ApiKeyEntry {
                key: "K".to_owned(),
                tier: "basic".to_owned(),
                rate_limit: None,
            }]),
            FakeFacilitator::accepting(),
        );
        let upstream = UpstreamPaymentPolicy {
            default_pricing: Some(Pricing {
                free: false,
                x402: Some("$0.03".parse().unwrap()),
                api_key_tiers: Some(HashMap::from([(
                    "premium".to_owned(),
                    "free".parse().unwrap(),
                )])),
            }),
            ..Default::default()
        };
        let auth = InboundAuth::with_api_key("K");
        let outcome = mediator
            .admit(AdmissionRequest {
                kind: EntityKind::Tool,
                name: "search",
                upstream_policy: Some(&upstream),
                auth: &auth,
            })
            .await;
        let PaymentOutcome::Challenge(challenge) = outcome else {
            panic!("expected challenge, got {outcome:?}");
        };
        assert_eq!(challenge.accepts[0].max_amount_required, "30000");
    }

    #[tokio::test]
    async fn verified_payment_is_admitted() {
        let mediator =
            PaymentMediator::new(policy_with_keys(vec![]), FakeFacilitator::accepting());
        let auth = payment_header();
        let outcome = mediator
            .admit(AdmissionRequest {
                kind: EntityKind::Tool,
                name: "price",
                upstream_policy: Some(&priced("$0.01")),
                auth: &auth,
            })
            .await;
        assert!(matches!(
            outcome,
            PaymentOutcome::AllowPaid {
                method: PaymentMethod::X402,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failed_verification_is_rejected_with_reason() {
        let mediator = PaymentMediator::new(
            policy_with_keys(vec![]),
            FakeFacilitator::rejecting("expired authorization"),
        );
        let auth = payment_header();
        let outcome = mediator
            .admit(AdmissionRequest {
                kind: EntityKind::Tool,
                name: "price",
                upstream_policy: Some(&priced("$0.01")),
                auth: &auth,
            })
            .await;
        let PaymentOutcome::Reject { reason } = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert!(reason.contains("expired authorization"));
    }

    #[tokio::test]
    async fn facilitator_errors_do_not_leak_detail() {
        struct FailingFacilitator;
        impl Facilitator for FailingFacilitator {
            fn verify(
                &self,
                _request: VerifyRequest,
            ) -> BoxFuture<'_, Result<Verdict, FacilitatorError>> {
                Box::pin(async { Err(FacilitatorError::Status { status: 503 }) })
            }
        }
        let mediator =
            PaymentMediator::new(policy_with_keys(vec![]), Arc::new(FailingFacilitator));
        let auth = payment_header();
        let outcome = mediator
            .admit(AdmissionRequest {
                kind: EntityKind::Tool,
                name: "price",
                upstream_policy: Some(&priced("$0.01")),
                auth: &auth,
            })
            .await;
        let PaymentOutcome::Reject { reason } = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert_eq!(reason, "verification failed");
    }

    #[tokio::test]
    async fn malformed_payment_header_re_challenges() {
        let mediator =
            PaymentMediator::new(policy_with_keys(vec![]), FakeFacilitator::accepting());
        let auth = InboundAuth::from_headers([("X-PAYMENT", "not base64!!")]);
        let outcome = mediator
            .admit(AdmissionRequest {
                kind: EntityKind::Tool,
                name: "price",
                upstream_policy: Some(&priced("$0.01")),
                auth: &auth,
            })
            .await;
        let PaymentOutcome::Challenge(challenge) = outcome else {
            panic!("expected challenge, got {outcome:?}");
        };
        assert!(challenge.error.as_deref().unwrap().contains("X-PAYMENT"));
    }

    #[tokio::test]
    async fn absent_x402_price_defaults_to_one_cent() {
        let mediator =
            PaymentMediator::new(policy_with_keys(vec![]), FakeFacilitator::accepting());
        let upstream = UpstreamPaymentPolicy {
            default_pricing: Some(Pricing {
                free: false,
                x402: None,
                api_key_tiers: Some(HashMap::from([(
                    "premium".to_owned(),
                    "free".parse().unwrap(),
                )])),
            }),
            ..Default::default()
        };
        let auth = InboundAuth::anonymous();
        let outcome = mediator
            .admit(AdmissionRequest {
                kind: EntityKind::Tool,
                name: "price",
                upstream_policy: Some(&upstream),
                auth: &auth,
            })
            .await;
        let PaymentOutcome::Challenge(challenge) = outcome else {
            panic!("expected challenge, got {outcome:?}");
        };
        assert_eq!(challenge.accepts[0].max_amount_required, "10000");
    }

    #[tokio::test]
    async fn markup_mode_publishes_marked_up_price() {
        let mediator =
            PaymentMediator::new(policy_with_keys(vec![]), FakeFacilitator::accepting());
        let upstream = UpstreamPaymentPolicy {
            mode: PaymentMode::Markup,
            markup: Some("20%".parse().unwrap()),
            default_pricing: Some(Pricing {
                free: false,
                x402: Some("$0.10".parse().unwrap()),
                api_key_tiers: None,
            }),
            per_tool: None,
        };
        let auth = InboundAuth::anonymous();
        let outcome = mediator
            .admit(AdmissionRequest {
                kind: EntityKind::Tool,
                name: "quote",
                upstream_policy: Some(&upstream),
                auth: &auth,
            })
            .await;
        let PaymentOutcome::Challenge(challenge) = outcome else {
            panic!("expected challenge, got {outcome:?}");
        };
        // $0.12 in atomic units.
        assert_eq!(challenge.accepts[0].max_amount_required, "120000");
    }

    #[tokio::test]
    async fn rate_limited_key_is_rejected() {
        let mediator = PaymentMediator::new(
            policy_with_keys(vec![ApiKeyEntry {
                key: "K".to_owned(),
                tier: "premium".to_owned(),
                rate_limit: Some(1),
            }]),
            FakeFacilitator::accepting(),
        );
        let upstream = UpstreamPaymentPolicy {
            default_pricing: Some(Pricing {
                free: false,
                x402: Some("$0.10".parse().unwrap()),
                api_key_tiers: Some(HashMap::from([(
                    "premium".to_owned(),
                    "free".parse().unwrap(),
                )])),
            }),
            ..Default::default()
        };
        let auth = InboundAuth::with_api_key("K");
        let request = AdmissionRequest {
            kind: EntityKind::Tool,
            name: "search",
            upstream_policy: Some(&upstream),
            auth: &auth,
        };
        assert!(mediator.admit(request).await.is_admitted());
        let PaymentOutcome::Reject { reason } = mediator.admit(request).await else {
            panic!("expected rejection");
        };
        assert_eq!(reason, "rate limit exceeded");
    }

    #[test]
    fn passthrough_directive_preserves_headers() {
        let mediator =
            PaymentMediator::new(policy_with_keys(vec![]), FakeFacilitator::accepting());
        let upstream = UpstreamPaymentPolicy {
            mode: PaymentMode::Passthrough,
            ..Default::default()
        };
        let auth = InboundAuth::from_headers([("x-PaYmEnT", "abc"), ("Authorization", "Bearer t")]);
        let ForwardDirective::Passthrough { headers } =
            mediator.forward_directive(Some(&upstream), &auth)
        else {
            panic!("expected passthrough directive");
        };
        assert_eq!(headers[0].0, "x-PaYmEnT");
        assert_eq!(headers[1].0, "Authorization");
    }

    #[test]
    fn paid_modes_need_an_outbound_credential() {
        let mediator =
            PaymentMediator::new(policy_with_keys(vec![]), FakeFacilitator::accepting());
        let upstream = UpstreamPaymentPolicy {
            mode: PaymentMode::Markup,
            ..Default::default()
        };
        assert!(matches!(
            mediator.forward_directive(Some(&upstream), &InboundAuth::anonymous()),
            ForwardDirective::Direct
        ));

        let mut policy = policy_with_keys(vec![]);
        policy.outbound = Some(OutboundCredential {
            credential: "cred".to_owned(),
            max_value: "$0.50".parse().unwrap(),
        });
        let mediator = PaymentMediator::new(policy, FakeFacilitator::accepting());
        let ForwardDirective::Paid { max_value } =
            mediator.forward_directive(Some(&upstream), &InboundAuth::anonymous())
        else {
            panic!("expected paid directive");
        };
        assert_eq!(max_value, "$0.50".parse().unwrap());
    }
}
