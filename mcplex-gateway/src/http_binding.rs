//! HTTP wrapper around the gateway front-end.
//!
//! Exposes the MCP surface as plain HTTP:
//!
//! - `POST /message` — JSON-RPC body, equivalent to the streaming
//!   binding; payment challenges materialize as `HTTP 402` with an
//!   `X-Accept-Payment` header and the challenge document as the body
//! - `GET /sse` — legacy event stream; responses to session-tagged
//!   posts are delivered as `message` events
//! - `GET /health`, `GET /stats`, `POST /registry/refresh` —
//!   diagnostics and the administrative registry rebuild

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use dashmap::DashMap;
use futures_util::stream::Stream;
use mcplex::InboundAuth;
use mcplex::proto::PaymentRequired;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::frontend::{Gateway, GatewayError};

/// Header announcing acceptable payment terms on a 402 response.
pub const ACCEPT_PAYMENT_HEADER: &str = "X-Accept-Payment";

/// Shared state behind the router.
struct HttpState {
    gateway: Arc<Gateway>,
    sessions: DashMap<String, mpsc::Sender<String>>,
    session_counter: AtomicU64,
}

/// Builds the wrapper router.
#[must_use]
pub fn router(gateway: Arc<Gateway>) -> Router {
    let state = Arc::new(HttpState {
        gateway,
        sessions: DashMap::new(),
        session_counter: AtomicU64::new(0),
    });
    Router::new()
        .route("/message", post(post_message))
        .route("/sse", get(open_sse))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/registry/refresh", post(refresh_registry))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serves the wrapper until the token is cancelled.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] if binding or serving fails.
pub async fn serve_http(
    gateway: Arc<Gateway>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    let app = router(gateway);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to bind {addr}: {e}")))?;
    tracing::info!("gateway listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| GatewayError::Internal(format!("http server failed: {e}")))
}

/// A JSON-RPC request envelope as received on `POST /message`.
#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(default)]
    session_id: Option<String>,
}

fn rpc_result(id: Option<Value>, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: Option<Value>, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let (Some(data), Some(obj)) = (data, error.as_object_mut()) {
        obj.insert("data".to_owned(), data);
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

/// A 402 response carrying the challenge both ways: in the
/// `X-Accept-Payment` header and as the JSON body.
fn payment_required_response(challenge: &PaymentRequired) -> Response {
    let body = serde_json::to_string(challenge).unwrap_or_else(|_| "{}".to_owned());
    let mut builder = Response::builder()
        .status(StatusCode::PAYMENT_REQUIRED)
        .header(header::CONTENT_TYPE, "application/json");
    if let Ok(value) = axum::http::HeaderValue::from_str(&body) {
        builder = builder.header(ACCEPT_PAYMENT_HEADER, value);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// A 402 response for a rejected payment; same surface as a challenge
/// but carrying the failure reason instead of requirements.
fn payment_rejected_response(reason: &str) -> Response {
    let body = json!({ "x402Version": 1, "accepts": [], "error": reason }).to_string();
    Response::builder()
        .status(StatusCode::PAYMENT_REQUIRED)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn post_message(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            let reply = rpc_error(None, -32700, &format!("parse error: {err}"), None);
            return Json(reply).into_response();
        }
    };

    // Notifications get acknowledged, never answered.
    if request.id.is_none() {
        return StatusCode::ACCEPTED.into_response();
    }

    let auth = InboundAuth::from_headers(
        headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?))),
    );

    let id = request.id.clone();
    let reply = match dispatch(&state.gateway, &request, &auth).await {
        Ok(result) => rpc_result(id, result),
        Err(GatewayError::PaymentRequired(challenge)) => {
            return payment_required_response(&challenge);
        }
        Err(GatewayError::PaymentRejected(reason)) => {
            return payment_rejected_response(&reason);
        }
        Err(GatewayError::NotFound(name)) => rpc_error(
            id,
            -32601,
            &format!("method not found: {name}"),
            None,
        ),
        Err(GatewayError::Internal(message)) => rpc_error(id, -32603, &message, None),
    };

    // Session-tagged posts stream their reply over the SSE channel.
    if let Some(session_id) = query.session_id {
        if let Some(sender) = state.sessions.get(&session_id) {
            if sender.send(reply.to_string()).await.is_ok() {
                return StatusCode::ACCEPTED.into_response();
            }
        }
        state.sessions.remove(&session_id);
        return StatusCode::NOT_FOUND.into_response();
    }

    Json(reply).into_response()
}

/// Routes one JSON-RPC method to the front-end.
async fn dispatch(
    gateway: &Gateway,
    request: &RpcRequest,
    auth: &InboundAuth,
) -> Result<Value, GatewayError> {
    let params = request.params.clone().unwrap_or_else(|| json!({}));
    match request.method.as_str() {
        "initialize" => {
            let info = gateway.info();
            Ok(json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {
                    "tools": {},
                    "resources": {},
                    "prompts": {},
                },
                "serverInfo": {
                    "name": info.name,
                    "version": info.version,
                },
            }))
        }
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": gateway.list_tools() })),
        "tools/call" => {
            let name = require_str(&params, "name")?;
            let arguments = params
                .get("arguments")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            gateway.call_tool(name, arguments, auth).await
        }
        "resources/list" => Ok(json!({ "resources": gateway.list_resources() })),
        "resources/read" => {
            let uri = require_str(&params, "uri")?;
            gateway.read_resource(uri, auth).await
        }
        "prompts/list" => Ok(json!({ "prompts": gateway.list_prompts() })),
        "prompts/get" => {
            let name = require_str(&params, "name")?;
            let arguments = params.get("arguments").and_then(Value::as_object).cloned();
            gateway.get_prompt(name, arguments, auth).await
        }
        other => Err(GatewayError::NotFound(other.to_owned())),
    }
}

fn require_str<'a>(params: &'a Value, field: &str) -> Result<&'a str, GatewayError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Internal(format!("missing required parameter: {field}")))
}

async fn open_sse(
    State(state): State<Arc<HttpState>>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let counter = state.session_counter.fetch_add(1, Ordering::Relaxed);
    let session_id = format!("{nanos:x}-{counter:x}");

    let (tx, mut rx) = mpsc::channel::<String>(32);
    state.sessions.insert(session_id.clone(), tx);
    tracing::debug!(session = %session_id, "sse session opened");

    let endpoint = format!("/message?session_id={session_id}");
    let cleanup_state = Arc::clone(&state);
    let cleanup_id = session_id.clone();
    let stream = async_stream::stream! {
        yield Ok(Event::default().event("endpoint").data(endpoint));
        while let Some(payload) = rx.recv().await {
            yield Ok(Event::default().event("message").data(payload));
        }
        cleanup_state.sessions.remove(&cleanup_id);
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health(State(state): State<Arc<HttpState>>) -> Json<Value> {
    let stats = state.gateway.stats();
    let connected = stats
        .upstreams
        .iter()
        .filter(|u| u.status == Some(mcplex_mcp::SessionStatus::Connected))
        .count();
    Json(json!({
        "status": "ok",
        "version": state.gateway.info().version,
        "servers": {
            "total": stats.upstreams.len(),
            "connected": connected,
        },
    }))
}

async fn stats(State(state): State<Arc<HttpState>>) -> Json<crate::frontend::GatewayStats> {
    Json(state.gateway.stats())
}

async fn refresh_registry(State(state): State<Arc<HttpState>>) -> Json<Value> {
    let stats = state.gateway.refresh_registry().await;
    Json(json!({ "refreshed": true, "registry": stats }))
}
