//! Streaming MCP binding for the downstream client.
//!
//! Serves the gateway over stdio as a standard MCP server. Payment
//! outcomes surface as JSON-RPC errors: a challenge uses error code 402
//! with the challenge document as structured `data`; everything else
//! maps onto the standard codes.

use std::sync::Arc;

use mcplex::{Base64Bytes, InboundAuth};
use mcplex_mcp::model::PAYMENT_META_KEY;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, ErrorCode, ErrorData, GetPromptRequestParams,
    GetPromptResult, Implementation, ListPromptsResult, ListResourcesResult, ListToolsResult,
    Meta, PaginatedRequestParams, ReadResourceRequestParams, ReadResourceResult,
    ServerCapabilities, ServerInfo,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ServerHandler, ServiceExt};

use crate::frontend::{Gateway, GatewayError};

/// JSON-RPC error code for payment-required errors (x402 convention).
pub const PAYMENT_REQUIRED_CODE: i32 = 402;

/// The gateway exposed as an MCP [`ServerHandler`].
#[derive(Clone)]
pub struct McpBinding {
    gateway: Arc<Gateway>,
}

impl std::fmt::Debug for McpBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpBinding").finish_non_exhaustive()
    }
}

impl McpBinding {
    /// Wraps a gateway for serving.
    #[must_use]
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

/// Maps a front-end error onto the JSON-RPC error surface.
fn error_data(err: GatewayError) -> ErrorData {
    match err {
        GatewayError::NotFound(name) => ErrorData::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method not found: {name}"),
            None,
        ),
        GatewayError::PaymentRequired(challenge) => ErrorData::new(
            ErrorCode(PAYMENT_REQUIRED_CODE),
            "Payment required".to_owned(),
            serde_json::to_value(challenge.as_ref()).ok(),
        ),
        GatewayError::PaymentRejected(reason) => ErrorData::new(
            ErrorCode::INTERNAL_ERROR,
            format!("payment rejected: {reason}"),
            Some(serde_json::json!({ "reason": reason })),
        ),
        GatewayError::Internal(message) => ErrorData::internal_error(message, None),
    }
}

/// Extracts inbound credentials from a request's `_meta`.
///
/// Streaming clients carry their x402 payment under the `x402/payment`
/// meta key rather than an HTTP header.
fn auth_from_meta(meta: Option<&Meta>) -> InboundAuth {
    let payment = meta.and_then(|m| m.0.get(PAYMENT_META_KEY));
    match payment.map(Base64Bytes::encode_json) {
        Some(Ok(encoded)) => InboundAuth::with_payment(encoded),
        _ => InboundAuth::anonymous(),
    }
}

/// Serde bridge from a relayed result document to an SDK result type.
fn into_result<R: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> Result<R, ErrorData> {
    serde_json::from_value(value)
        .map_err(|e| ErrorData::internal_error(format!("malformed upstream result: {e}"), None))
}

impl ServerHandler for McpBinding {
    fn get_info(&self) -> ServerInfo {
        let info = self.gateway.info();
        ServerInfo {
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: Implementation {
                name: info.name.clone(),
                version: info.version.clone(),
                ..Implementation::from_build_env()
            },
            instructions: info.description.clone(),
            ..ServerInfo::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        into_result(serde_json::json!({ "tools": self.gateway.list_tools() }))
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        into_result(serde_json::json!({
            "resources": self.gateway.list_resources(),
        }))
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, ErrorData> {
        into_result(serde_json::json!({ "prompts": self.gateway.list_prompts() }))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let auth = auth_from_meta(request.meta.as_ref());
        let result = self
            .gateway
            .call_tool(
                request.name.as_ref(),
                request.arguments.unwrap_or_default(),
                &auth,
            )
            .await
            .map_err(error_data)?;
        into_result(result)
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        let auth = auth_from_meta(request.meta.as_ref());
        let result = self
            .gateway
            .read_resource(request.uri.as_ref(), &auth)
            .await
            .map_err(error_data)?;
        into_result(result)
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, ErrorData> {
        let auth = auth_from_meta(request.meta.as_ref());
        let arguments = request
            .arguments
            .map(|args| {
                serde_json::to_value(args)
                    .ok()
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default()
            });
        let result = self
            .gateway
            .get_prompt(request.name.as_ref(), arguments, &auth)
            .await
            .map_err(error_data)?;
        into_result(result)
    }
}

/// Serves the gateway over stdio until the downstream client closes.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] if the server fails to start or
/// terminates abnormally.
pub async fn serve_stdio(gateway: Arc<Gateway>) -> Result<(), GatewayError> {
    let service = McpBinding::new(gateway)
        .serve(rmcp::transport::stdio())
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to serve stdio: {e}")))?;
    service
        .waiting()
        .await
        .map_err(|e| GatewayError::Internal(format!("stdio server failed: {e}")))?;
    Ok(())
}
