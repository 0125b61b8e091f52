#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Upstream MCP connectivity for the mcplex gateway.
//!
//! This crate owns everything between the gateway front-end and the
//! remote MCP servers it aggregates:
//!
//! - [`model`] — framework-agnostic capability definitions
//! - [`transport`] — transport descriptors and the session factory
//!   (stdio, streamable HTTP, legacy SSE, websocket)
//! - [`session`] — the [`session::McpSession`] seam and its `rmcp`
//!   implementation, including payment-meta forwarding
//! - [`manager`] — the connection manager: parallel connects with
//!   linear retries, the single-writer session map, the health loop
//! - [`registry`] — the aggregated capability index with namespacing,
//!   collision handling, and atomic snapshot publication

pub mod manager;
pub mod model;
pub mod registry;
pub mod session;
pub mod transport;

pub use manager::{
    ConnectedUpstream, ConnectionManager, Connector, ManagerEvent, ManagerSettings, SessionStatus,
    TransportConnector, UpstreamSpec, UpstreamStatus, is_valid_namespace,
};
pub use model::{PromptArgument, PromptDef, ResourceDef, ToolDef};
pub use registry::{
    AggregatedPrompt, AggregatedResource, AggregatedTool, CapabilityRegistry, ConflictResolution,
    RegistrySnapshot, RegistryStats,
};
pub use session::{
    Capabilities, McpSession, PromptGet, ResourceRead, RmcpSession, ToolCall, UpstreamError,
};
pub use transport::{
    OutboundPayer, TransportDescriptor, TransportError, TransportFactory, ValidationIssue,
};
