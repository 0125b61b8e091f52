//! The upstream session adapter.
//!
//! [`McpSession`] is the seam between the gateway and a concrete MCP
//! client: exactly the six MCP verbs plus `probe` (used by the health
//! loop) and `close`. Every failure surfaces as a single unified
//! [`UpstreamError`] whose `transient` flag hints whether a retry or
//! reconnect may help.
//!
//! [`RmcpSession`] implements the trait over an `rmcp` client service.
//! Conversions between gateway model types and SDK types go through
//! serde, so SDK field additions do not ripple through the gateway.

use std::fmt;

use mcplex::ForwardDirective;
use mcplex::facilitator::BoxFuture;
use mcplex_http::CAP_EXCEEDED_MESSAGE;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::Mutex;

use crate::model::{
    FORWARDED_HEADERS_META_KEY, PAYMENT_META_KEY, PromptDef, ResourceDef, ToolDef,
};
use crate::transport::ClientService;

/// Which capability families an upstream answered for at connect time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `tools/list` succeeded.
    pub has_tools: bool,
    /// `resources/list` succeeded.
    pub has_resources: bool,
    /// `prompts/list` succeeded.
    pub has_prompts: bool,
}

/// Unified error for anything that goes wrong talking to an upstream.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    /// Whether retrying or reconnecting may help.
    pub transient: bool,
    /// Human-readable failure description.
    pub message: String,
}

impl UpstreamError {
    /// A failure worth retrying (timeouts, broken transports).
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    /// A failure that will not go away on its own.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }

    /// The error used when a verb is invoked on a closed session.
    #[must_use]
    pub fn disconnected() -> Self {
        Self::transient("session is not connected")
    }

    /// Classifies a transport-level failure message.
    ///
    /// The paying client reports an over-cap downstream charge through
    /// the transport error chain; that one is not worth retrying.
    #[must_use]
    pub fn from_transport_message(message: String) -> Self {
        if message.contains(CAP_EXCEEDED_MESSAGE) {
            Self::fatal(CAP_EXCEEDED_MESSAGE)
        } else {
            Self::transient(message)
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for UpstreamError {}

impl From<rmcp::ServiceError> for UpstreamError {
    fn from(err: rmcp::ServiceError) -> Self {
        match err {
            rmcp::ServiceError::McpError(data) => Self::fatal(data.message),
            rmcp::ServiceError::Timeout { .. } => Self::transient(err.to_string()),
            rmcp::ServiceError::Cancelled { .. } => Self::transient(err.to_string()),
            rmcp::ServiceError::TransportSend(_) | rmcp::ServiceError::TransportClosed => {
                Self::from_transport_message(err.to_string())
            }
            other => Self::fatal(other.to_string()),
        }
    }
}

/// A tool invocation bound for an upstream.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Tool name as the upstream knows it.
    pub name: String,
    /// Tool arguments.
    pub arguments: serde_json::Map<String, serde_json::Value>,
    /// Payment forwarding instruction for this call.
    pub forward: ForwardDirective,
}

/// A resource read bound for an upstream.
#[derive(Debug, Clone)]
pub struct ResourceRead {
    /// Resource URI as the upstream knows it.
    pub uri: String,
    /// Payment forwarding instruction for this call.
    pub forward: ForwardDirective,
}

/// A prompt fetch bound for an upstream.
#[derive(Debug, Clone)]
pub struct PromptGet {
    /// Prompt name as the upstream knows it.
    pub name: String,
    /// Prompt arguments.
    pub arguments: Option<serde_json::Map<String, serde_json::Value>>,
    /// Payment forwarding instruction for this call.
    pub forward: ForwardDirective,
}

/// A live MCP client bound to one upstream.
///
/// Implementations must be safe to share across concurrent calls; if
/// the underlying client serializes requests, callers simply queue.
pub trait McpSession: Send + Sync {
    /// Lists the upstream's tools.
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDef>, UpstreamError>>;
    /// Lists the upstream's resources.
    fn list_resources(&self) -> BoxFuture<'_, Result<Vec<ResourceDef>, UpstreamError>>;
    /// Lists the upstream's prompts.
    fn list_prompts(&self) -> BoxFuture<'_, Result<Vec<PromptDef>, UpstreamError>>;
    /// Invokes a tool; the result is the raw MCP result document.
    fn call_tool(&self, call: ToolCall)
    -> BoxFuture<'_, Result<serde_json::Value, UpstreamError>>;
    /// Reads a resource; the result is the raw MCP result document.
    fn read_resource(
        &self,
        read: ResourceRead,
    ) -> BoxFuture<'_, Result<serde_json::Value, UpstreamError>>;
    /// Fetches a prompt; the result is the raw MCP result document.
    fn get_prompt(
        &self,
        get: PromptGet,
    ) -> BoxFuture<'_, Result<serde_json::Value, UpstreamError>>;
    /// Cheap health check used by the connection manager.
    fn probe(&self) -> BoxFuture<'_, Result<(), UpstreamError>>;
    /// Closes the session; further verbs fail with `disconnected`.
    fn close(&self) -> BoxFuture<'_, Result<(), UpstreamError>>;
}

/// Builds the `_meta` object carrying relayed payment material.
///
/// Passthrough attaches the client's decoded x402 payload under
/// `x402/payment` (the conventional MCP payment meta key) and the
/// original header pairs, casing intact, under `mcplex/headers`.
fn forward_meta(forward: &ForwardDirective) -> Option<serde_json::Map<String, serde_json::Value>> {
    let ForwardDirective::Passthrough { headers } = forward else {
        return None;
    };
    if headers.is_empty() {
        return None;
    }
    let mut meta = serde_json::Map::new();
    let mut header_obj = serde_json::Map::new();
    for (name, value) in headers {
        header_obj.insert(name.clone(), serde_json::Value::String(value.clone()));
        if name.eq_ignore_ascii_case(mcplex::auth::PAYMENT_HEADER)
            && let Ok(payload) =
                mcplex::Base64Bytes::from(value.as_str()).decode_json::<serde_json::Value>()
        {
            meta.insert(PAYMENT_META_KEY.to_owned(), payload);
        }
    }
    meta.insert(
        FORWARDED_HEADERS_META_KEY.to_owned(),
        serde_json::Value::Object(header_obj),
    );
    Some(meta)
}

/// [`McpSession`] backed by an `rmcp` client service.
pub struct RmcpSession {
    service: Mutex<Option<ClientService>>,
    capabilities: std::sync::Mutex<Capabilities>,
}

impl fmt::Debug for RmcpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RmcpSession").finish_non_exhaustive()
    }
}

impl RmcpSession {
    /// Wraps a freshly served client.
    #[must_use]
    pub fn new(service: ClientService) -> Self {
        Self {
            service: Mutex::new(Some(service)),
            capabilities: std::sync::Mutex::new(Capabilities::default()),
        }
    }

    /// Probes the three `list*` verbs once and caches which succeeded.
    ///
    /// A failing family marks that capability `false` without failing
    /// the session; an upstream that only serves tools is valid.
    pub async fn discover_capabilities(&self) -> Capabilities {
        let caps = Capabilities {
            has_tools: McpSession::list_tools(self).await.is_ok(),
            has_resources: McpSession::list_resources(self).await.is_ok(),
            has_prompts: McpSession::list_prompts(self).await.is_ok(),
        };
        *self.capabilities.lock().expect("capabilities lock poisoned") = caps;
        caps
    }

    /// The capabilities recorded by the last discovery.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.lock().expect("capabilities lock poisoned")
    }

    /// Runs `op` against the live service, surfacing `disconnected`
    /// when the session has been closed.
    async fn request<P, R>(
        &self,
        request_params: P,
        op: impl AsyncFnOnce(&ClientService, P) -> Result<R, rmcp::ServiceError>,
    ) -> Result<R, UpstreamError>
    where
        R: Serialize,
    {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(UpstreamError::disconnected)?;
        op(service, request_params).await.map_err(UpstreamError::from)
    }
}

/// Serde bridge from an SDK result to a gateway value.
fn to_document<R: Serialize>(result: &R) -> Result<serde_json::Value, UpstreamError> {
    serde_json::to_value(result)
        .map_err(|e| UpstreamError::fatal(format!("unserializable upstream result: {e}")))
}

/// Serde bridge from a gateway JSON document to SDK request params.
fn to_params<P: DeserializeOwned>(value: serde_json::Value) -> Result<P, UpstreamError> {
    serde_json::from_value(value)
        .map_err(|e| UpstreamError::fatal(format!("invalid request parameters: {e}")))
}

impl McpSession for RmcpSession {
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDef>, UpstreamError>> {
        Box::pin(async move {
            let result = self
                .request((), async |service, ()| {
                    service.list_tools(Default::default()).await
                })
                .await?;
            let value = to_document(&result.tools)?;
            serde_json::from_value(value)
                .map_err(|e| UpstreamError::fatal(format!("malformed tool list: {e}")))
        })
    }

    fn list_resources(&self) -> BoxFuture<'_, Result<Vec<ResourceDef>, UpstreamError>> {
        Box::pin(async move {
            let result = self
                .request((), async |service, ()| {
                    service.list_resources(Default::default()).await
                })
                .await?;
            let value = to_document(&result.resources)?;
            serde_json::from_value(value)
                .map_err(|e| UpstreamError::fatal(format!("malformed resource list: {e}")))
        })
    }

    fn list_prompts(&self) -> BoxFuture<'_, Result<Vec<PromptDef>, UpstreamError>> {
        Box::pin(async move {
            let result = self
                .request((), async |service, ()| {
                    service.list_prompts(Default::default()).await
                })
                .await?;
            let value = to_document(&result.prompts)?;
            serde_json::from_value(value)
                .map_err(|e| UpstreamError::fatal(format!("malformed prompt list: {e}")))
        })
    }

    fn call_tool(
        &self,
        call: ToolCall,
    ) -> BoxFuture<'_, Result<serde_json::Value, UpstreamError>> {
        Box::pin(async move {
            let mut request = json!({
                "name": call.name,
                "arguments": call.arguments,
            });
            if let Some(meta) = forward_meta(&call.forward)
                && let Some(obj) = request.as_object_mut()
            {
                obj.insert("_meta".to_owned(), serde_json::Value::Object(meta));
            }
            let params = to_params(request)?;
            let result = self
                .request(params, async |service, params| {
                    service.call_tool(params).await
                })
                .await?;
            to_document(&result)
        })
    }

    fn read_resource(
        &self,
        read: ResourceRead,
    ) -> BoxFuture<'_, Result<serde_json::Value, UpstreamError>> {
        Box::pin(async move {
            let mut request = json!({ "uri": read.uri });
            if let Some(meta) = forward_meta(&read.forward)
                && let Some(obj) = request.as_object_mut()
            {
                obj.insert("_meta".to_owned(), serde_json::Value::Object(meta));
            }
            let params = to_params(request)?;
            let result = self
                .request(params, async |service, params| {
                    service.read_resource(params).await
                })
                .await?;
            to_document(&result)
        })
    }

    fn get_prompt(
        &self,
        get: PromptGet,
    ) -> BoxFuture<'_, Result<serde_json::Value, UpstreamError>> {
        Box::pin(async move {
            let mut request = json!({ "name": get.name });
            if let Some(obj) = request.as_object_mut() {
                if let Some(arguments) = get.arguments.clone() {
                    obj.insert("arguments".to_owned(), serde_json::Value::Object(arguments));
                }
                if let Some(meta) = forward_meta(&get.forward) {
                    obj.insert("_meta".to_owned(), serde_json::Value::Object(meta));
                }
            }
            let params = to_params(request)?;
            let result = self
                .request(params, async |service, params| {
                    service.get_prompt(params).await
                })
                .await?;
            to_document(&result)
        })
    }

    fn probe(&self) -> BoxFuture<'_, Result<(), UpstreamError>> {
        Box::pin(async move {
            // Probe the cheapest family the upstream actually supports;
            // default to tools for an upstream that answered nothing.
            let caps = self.capabilities();
            if caps.has_resources && !caps.has_tools {
                McpSession::list_resources(self).await.map(|_| ())
            } else if caps.has_prompts && !caps.has_tools && !caps.has_resources {
                McpSession::list_prompts(self).await.map(|_| ())
            } else {
                McpSession::list_tools(self).await.map(|_| ())
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), UpstreamError>> {
        Box::pin(async move {
            if let Some(service) = self.service.lock().await.take()
                && let Err(err) = service.cancel().await
            {
                return Err(UpstreamError::fatal(format!(
                    "failed to cancel session: {err}"
                )));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_builds_payment_meta() {
        let payload = json!({"x402Version": 1, "scheme": "exact"});
        let encoded = mcplex::Base64Bytes::encode_json(&payload).unwrap();
        let forward = ForwardDirective::Passthrough {
            headers: vec![
                ("X-PaYmEnT".to_owned(), encoded.to_string()),
                ("Authorization".to_owned(), "Bearer t".to_owned()),
            ],
        };
        let meta = forward_meta(&forward).unwrap();
        assert_eq!(meta[PAYMENT_META_KEY]["scheme"], "exact");
        let headers = meta[FORWARDED_HEADERS_META_KEY].as_object().unwrap();
        assert!(headers.contains_key("X-PaYmEnT"));
        assert!(headers.contains_key("Authorization"));
    }

    #[test]
    fn direct_and_paid_forward_no_meta() {
        assert!(forward_meta(&ForwardDirective::Direct).is_none());
        let paid = ForwardDirective::Paid {
            max_value: "$1".parse().unwrap(),
        };
        assert!(forward_meta(&paid).is_none());
    }

    #[test]
    fn cap_exceeded_transport_errors_are_fatal() {
        let err = UpstreamError::from_transport_message(format!(
            "transport error: http error: {CAP_EXCEEDED_MESSAGE}: 2000000 atomic units > cap 1000000"
        ));
        assert!(!err.transient);
        assert_eq!(err.message, CAP_EXCEEDED_MESSAGE);

        let err = UpstreamError::from_transport_message("connection reset".to_owned());
        assert!(err.transient);
    }

    #[test]
    fn mcp_errors_are_not_transient() {
        let err = UpstreamError::from(rmcp::ServiceError::McpError(
            rmcp::model::ErrorData::internal_error("boom", None),
        ));
        assert!(!err.transient);
        assert!(err.message.contains("boom"));
    }
}
