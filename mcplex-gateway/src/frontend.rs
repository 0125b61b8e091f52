//! The downstream-facing gateway front-end.
//!
//! One [`Gateway`] value implements the six MCP verbs over the
//! aggregated view: listings come from the registry snapshot, and every
//! dispatching verb runs the same pipeline — resolve the exposed name,
//! find the connected session, put the call through the payment
//! mediator, then forward with the mediator's directive applied.
//! Protocol bindings (stdio MCP, HTTP wrapper) translate
//! [`GatewayError`] into their own error surface.

use std::sync::Arc;

use mcplex::mediator::{AdmissionRequest, PaymentMediator, PaymentOutcome};
use mcplex::proto::{EntityKind, PaymentRequired};
use mcplex::InboundAuth;
use mcplex_mcp::manager::{ConnectionManager, ManagerEvent, UpstreamStatus};
use mcplex_mcp::model::{PromptDef, ResourceDef, ToolDef};
use mcplex_mcp::registry::{CapabilityRegistry, RegistryStats};
use mcplex_mcp::session::{PromptGet, ResourceRead, ToolCall};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Identity announced to downstream clients.
#[derive(Debug, Clone)]
pub struct GatewayInfo {
    /// Gateway name.
    pub name: String,
    /// Gateway version.
    pub version: String,
    /// Optional description.
    pub description: Option<String>,
}

/// Errors surfaced by front-end verbs.
///
/// Bindings map these onto JSON-RPC error codes or HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The exposed name does not exist in the current snapshot.
    #[error("method not found: {0}")]
    NotFound(String),
    /// The call must be paid for; the challenge says how.
    #[error("payment required")]
    PaymentRequired(Box<PaymentRequired>),
    /// A presented payment was rejected.
    #[error("payment rejected: {0}")]
    PaymentRejected(String),
    /// Upstream or gateway failure.
    #[error("{0}")]
    Internal(String),
}

/// Combined diagnostics for the `/stats` surface.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    /// Registry counts.
    pub registry: RegistryStats,
    /// Per-upstream session status.
    pub upstreams: Vec<UpstreamStatus>,
}

/// The aggregation gateway front-end.
pub struct Gateway {
    info: GatewayInfo,
    manager: Arc<ConnectionManager>,
    registry: Arc<CapabilityRegistry>,
    mediator: Arc<PaymentMediator>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("name", &self.info.name)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Assembles the front-end from its collaborators.
    #[must_use]
    pub fn new(
        info: GatewayInfo,
        manager: Arc<ConnectionManager>,
        registry: Arc<CapabilityRegistry>,
        mediator: Arc<PaymentMediator>,
    ) -> Self {
        Self {
            info,
            manager,
            registry,
            mediator,
        }
    }

    /// The announced gateway identity.
    #[must_use]
    pub const fn info(&self) -> &GatewayInfo {
        &self.info
    }

    /// The connection manager (bindings use it for lifecycle).
    #[must_use]
    pub const fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// All exposed tools, with default descriptions filled in.
    #[must_use]
    pub fn list_tools(&self) -> Vec<ToolDef> {
        let snapshot = self.registry.snapshot();
        snapshot
            .tools
            .values()
            .map(|entry| ToolDef {
                name: entry.exposed_name.clone(),
                description: Some(entry.description.clone().unwrap_or_else(|| {
                    default_description("Tool", &entry.upstream_id, entry.namespace.as_deref())
                })),
                input_schema: entry.payload.input_schema.clone(),
            })
            .collect()
    }

    /// All exposed resources, with default descriptions filled in.
    #[must_use]
    pub fn list_resources(&self) -> Vec<ResourceDef> {
        let snapshot = self.registry.snapshot();
        snapshot
            .resources
            .values()
            .map(|entry| ResourceDef {
                uri: entry.exposed_name.clone(),
                name: entry.payload.name.clone(),
                description: Some(entry.description.clone().unwrap_or_else(|| {
                    default_description("Resource", &entry.upstream_id, entry.namespace.as_deref())
                })),
                mime_type: entry.payload.mime_type.clone(),
            })
            .collect()
    }

    /// All exposed prompts, with default descriptions filled in.
    #[must_use]
    pub fn list_prompts(&self) -> Vec<PromptDef> {
        let snapshot = self.registry.snapshot();
        snapshot
            .prompts
            .values()
            .map(|entry| PromptDef {
                name: entry.exposed_name.clone(),
                description: Some(entry.description.clone().unwrap_or_else(|| {
                    default_description("Prompt", &entry.upstream_id, entry.namespace.as_deref())
                })),
                arguments: entry.payload.arguments.clone(),
            })
            .collect()
    }

    /// Invokes an exposed tool.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] for unknown names, disconnected
    /// upstreams, payment outcomes, and upstream failures.
    pub async fn call_tool(
        &self,
        exposed_name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
        auth: &InboundAuth,
    ) -> Result<serde_json::Value, GatewayError> {
        let entry = self
            .registry
            .find_tool(exposed_name)
            .ok_or_else(|| GatewayError::NotFound(exposed_name.to_owned()))?;
        let upstream = self
            .manager
            .get_session(&entry.upstream_id)
            .ok_or_else(|| GatewayError::Internal("server not connected".to_owned()))?;

        let policy = upstream.spec.payment.as_ref();
        self.admit(EntityKind::Tool, &entry.original_name, policy, auth)
            .await?;
        let forward = self.mediator.forward_directive(policy, auth);

        tracing::debug!(
            tool = %exposed_name,
            upstream = %entry.upstream_id,
            original = %entry.original_name,
            "dispatching tool call"
        );
        upstream
            .session
            .call_tool(ToolCall {
                name: entry.original_name.clone(),
                arguments,
                forward,
            })
            .await
            .map_err(|err| {
                GatewayError::Internal(format!("tool execution failed: {}", err.message))
            })
    }

    /// Reads an exposed resource.
    ///
    /// # Errors
    ///
    /// Same surface as [`Gateway::call_tool`].
    pub async fn read_resource(
        &self,
        exposed_uri: &str,
        auth: &InboundAuth,
    ) -> Result<serde_json::Value, GatewayError> {
        let entry = self
            .registry
            .find_resource(exposed_uri)
            .ok_or_else(|| GatewayError::NotFound(exposed_uri.to_owned()))?;
        let upstream = self
            .manager
            .get_session(&entry.upstream_id)
            .ok_or_else(|| GatewayError::Internal("server not connected".to_owned()))?;

        let policy = upstream.spec.payment.as_ref();
        self.admit(EntityKind::Resource, &entry.original_name, policy, auth)
            .await?;
        let forward = self.mediator.forward_directive(policy, auth);

        upstream
            .session
            .read_resource(ResourceRead {
                uri: entry.original_name.clone(),
                forward,
            })
            .await
            .map_err(|err| {
                GatewayError::Internal(format!("resource read failed: {}", err.message))
            })
    }

    /// Fetches an exposed prompt.
    ///
    /// # Errors
    ///
    /// Same surface as [`Gateway::call_tool`].
    pub async fn get_prompt(
        &self,
        exposed_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        auth: &InboundAuth,
    ) -> Result<serde_json::Value, GatewayError> {
        let entry = self
            .registry
            .find_prompt(exposed_name)
            .ok_or_else(|| GatewayError::NotFound(exposed_name.to_owned()))?;
        let upstream = self
            .manager
            .get_session(&entry.upstream_id)
            .ok_or_else(|| GatewayError::Internal("server not connected".to_owned()))?;

        let policy = upstream.spec.payment.as_ref();
        self.admit(EntityKind::Prompt, &entry.original_name, policy, auth)
            .await?;
        let forward = self.mediator.forward_directive(policy, auth);

        upstream
            .session
            .get_prompt(PromptGet {
                name: entry.original_name.clone(),
                arguments,
                forward,
            })
            .await
            .map_err(|err| {
                GatewayError::Internal(format!("prompt fetch failed: {}", err.message))
            })
    }

    /// Runs the payment mediator and maps its outcome.
    async fn admit(
        &self,
        kind: EntityKind,
        original_name: &str,
        policy: Option<&mcplex::UpstreamPaymentPolicy>,
        auth: &InboundAuth,
    ) -> Result<(), GatewayError> {
        match self
            .mediator
            .admit(AdmissionRequest {
                kind,
                name: original_name,
                upstream_policy: policy,
                auth,
            })
            .await
        {
            PaymentOutcome::AllowFree => Ok(()),
            PaymentOutcome::AllowPaid { method, amount } => {
                tracing::info!(
                    kind = ?kind,
                    name = %original_name,
                    method = ?method,
                    amount = %amount,
                    "paid call admitted"
                );
                Ok(())
            }
            PaymentOutcome::Challenge(challenge) => {
                Err(GatewayError::PaymentRequired(challenge))
            }
            PaymentOutcome::Reject { reason } => Err(GatewayError::PaymentRejected(reason)),
        }
    }

    /// Administrative registry rebuild from the current connected set.
    pub async fn refresh_registry(&self) -> RegistryStats {
        let connected = self.manager.get_connected();
        self.registry.refresh(&connected).await
    }

    /// Combined diagnostics for the stats surface.
    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            registry: self.registry.stats(),
            upstreams: self.manager.statuses(),
        }
    }

    /// Keeps the registry in sync with manager events until cancelled.
    pub fn spawn_registry_sync(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let gateway = self;
        let mut events = gateway.manager.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ManagerEvent::Initialized | ManagerEvent::HealthCheckCompleted) => {
                            gateway.refresh_registry().await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "registry sync lagged behind manager events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    () = cancel.cancelled() => break,
                }
            }
        })
    }
}

/// `"<kind> from <upstreamId>[ (<namespace>)]"`.
fn default_description(kind: &str, upstream_id: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{kind} from {upstream_id} ({ns})"),
        None => format!("{kind} from {upstream_id}"),
    }
}
