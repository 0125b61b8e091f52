#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! The mcplex gateway: one MCP endpoint in front of many upstreams.
//!
//! The binary wires together the crates below and serves the result
//! over stdio (standard MCP) and/or the HTTP wrapper:
//!
//! - `mcplex` — payment policy, the mediator, x402 wire types
//! - `mcplex-mcp` — transports, sessions, connection manager, registry
//! - `mcplex-http` — facilitator client, paying upstream client
//!
//! Library modules:
//!
//! - [`config`] — TOML configuration with env expansion and legacy
//!   server-entry coercion
//! - [`frontend`] — the [`frontend::Gateway`] front-end itself
//! - [`mcp_binding`] — the stdio MCP server binding
//! - [`http_binding`] — the axum HTTP wrapper

pub mod config;
pub mod frontend;
pub mod http_binding;
pub mod mcp_binding;

pub use config::{ConfigError, GatewayConfig, GatewaySettings, HttpSettings, LogLevel};
pub use frontend::{Gateway, GatewayError, GatewayInfo, GatewayStats};
