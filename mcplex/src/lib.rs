#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core policy and payment types for the mcplex MCP gateway.
//!
//! mcplex presents many upstream MCP servers to a single downstream
//! client as one aggregated endpoint, and meters access with x402
//! micropayments and static API keys. This crate holds everything that
//! is independent of transports and wire plumbing:
//!
//! - [`amount`] — dollar amounts, atomic USDC units, markup arithmetic
//! - [`auth`] — inbound credential extraction (`X-PAYMENT`, API keys)
//! - [`encoding`] — base64 JSON payload handling
//! - [`facilitator`] — the payment verification trait
//! - [`mediator`] — the admission / challenge / forwarding policy engine
//! - [`networks`] — supported networks and their USDC deployments
//! - [`policy`] — pricing and payment policy configuration model
//! - [`proto`] — x402 wire format documents
//! - [`signer`] — outbound payment authorization construction
//!
//! Transport-facing companions: `mcplex-mcp` (upstream sessions,
//! connection management, capability registry), `mcplex-http` (remote
//! facilitator client, paying HTTP client), and `mcplex-gateway` (the
//! served gateway binary).

pub mod amount;
pub mod auth;
pub mod encoding;
pub mod facilitator;
pub mod mediator;
pub mod networks;
pub mod policy;
pub mod proto;
mod ratelimit;
pub mod signer;

pub use amount::{Markup, Money, compute_markup_price};
pub use auth::InboundAuth;
pub use encoding::Base64Bytes;
pub use facilitator::{Facilitator, FacilitatorError};
pub use mediator::{
    AdmissionRequest, ForwardDirective, PaymentMediator, PaymentMethod, PaymentOutcome,
};
pub use networks::Network;
pub use policy::{PaymentMode, PaymentPolicy, Pricing, UpstreamPaymentPolicy};
pub use proto::{EntityKind, PaymentPayload, PaymentRequired, PaymentRequirements, Verdict};
