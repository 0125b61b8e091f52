#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! HTTP adapters for the mcplex gateway.
//!
//! Two clients live here:
//!
//! - [`facilitator_client::FacilitatorClient`] — talks to the external
//!   verification facilitator's `POST /verify` endpoint and implements
//!   the core [`mcplex::facilitator::Facilitator`] trait
//! - [`paying::PayingClient`] — a streamable-HTTP MCP client that
//!   transparently settles downstream 402 challenges with the gateway's
//!   outbound credential, capped at a configured maximum

pub mod facilitator_client;
pub mod paying;

pub use facilitator_client::{FacilitatorClient, FacilitatorClientError};
pub use paying::{CAP_EXCEEDED_MESSAGE, PayingClient, PayingError};
