//! Transport descriptors and the session factory.
//!
//! An upstream is reachable over one of four transport flavors. The
//! [`TransportFactory`] turns a validated [`TransportDescriptor`] into a
//! live `rmcp` client service:
//!
//! - `stdio` — spawn a child process and speak MCP over its pipes
//! - `http` — streamable HTTP (optionally through the paying client that
//!   reacts to downstream 402 responses)
//! - `sse` — legacy SSE pairing a `GET` event stream with a `POST` endpoint
//! - `websocket` — JSON-RPC messages over a websocket, built from a
//!   `tokio-tungstenite` sink/stream pair

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mcplex::amount::Money;
use mcplex::signer::PaymentSigner;
use mcplex_http::paying::PayingClient;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use rmcp::model::{ClientJsonRpcMessage, ServerJsonRpcMessage};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{
    SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    sse_client::SseClientConfig,
};
use rmcp::ServiceExt;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

/// A live MCP client session to one upstream.
pub type ClientService = RunningService<RoleClient, ()>;

/// How to reach one upstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportDescriptor {
    /// Child process speaking MCP over stdin/stdout.
    Stdio {
        /// Executable to spawn.
        command: String,
        /// Arguments passed to the executable.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables; the child also inherits the
        /// parent environment.
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory override; parent's when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Streamable HTTP endpoint.
    Http {
        /// Endpoint URL.
        url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Inserted as `Authorization: Bearer <key>` when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
    /// Legacy SSE transport (event stream + message post endpoint).
    Sse {
        /// URL of the `GET` event stream.
        sse_url: String,
        /// URL messages are `POST`ed to.
        post_url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Inserted as `Authorization: Bearer <key>` when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
    /// JSON-RPC over a websocket.
    Websocket {
        /// Websocket URL (`ws://` or `wss://`).
        url: String,
        /// Extra handshake headers.
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Inserted as `Authorization: Bearer <key>` when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
}

impl TransportDescriptor {
    /// Short flavor name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
            Self::Websocket { .. } => "websocket",
        }
    }

    /// Checks required fields without constructing anything.
    ///
    /// Returns one issue per missing or malformed field; an empty vector
    /// means the descriptor is usable.
    #[must_use]
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut require = |field: &str, value: &str| {
            if value.trim().is_empty() {
                issues.push(ValidationIssue {
                    field: field.to_owned(),
                    message: "must not be empty".to_owned(),
                });
            }
        };
        match self {
            Self::Stdio { command, .. } => require("command", command),
            Self::Http { url, .. } => require("url", url),
            Self::Sse {
                sse_url, post_url, ..
            } => {
                require("sse_url", sse_url);
                require("post_url", post_url);
            }
            Self::Websocket { url, .. } => require("url", url),
        }
        issues
    }
}

/// A single configuration problem found by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// The offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Errors from constructing a transport or establishing a session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The descriptor is missing required fields.
    #[error("invalid transport configuration: {0}")]
    Config(String),
    /// The child process could not be spawned.
    #[error("failed to spawn upstream process: {0}")]
    Spawn(String),
    /// The connection or MCP handshake failed.
    #[error("failed to establish session: {0}")]
    Connect(String),
    /// The connect did not finish within the configured timeout.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Whether retrying the connect may help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_))
    }
}

/// Outbound payment wiring handed to HTTP transports.
#[derive(Clone)]
pub struct OutboundPayer {
    /// Signs authorizations from the gateway credential.
    pub signer: Arc<dyn PaymentSigner>,
    /// Hard cap on any single outbound payment.
    pub max_value: Money,
}

impl fmt::Debug for OutboundPayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundPayer")
            .field("max_value", &self.max_value)
            .finish_non_exhaustive()
    }
}

/// Builds live MCP client sessions from transport descriptors.
#[derive(Debug, Clone, Default)]
pub struct TransportFactory {
    payer: Option<OutboundPayer>,
}

impl TransportFactory {
    /// A factory that never pays upstreams.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose HTTP transports answer downstream 402 responses
    /// with gateway-signed payments.
    #[must_use]
    pub fn with_payer(payer: OutboundPayer) -> Self {
        Self { payer: Some(payer) }
    }

    /// Constructs a wired MCP client for `descriptor`.
    ///
    /// The whole connect, including the MCP initialize handshake, is
    /// bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] for invalid descriptors and
    /// [`TransportError::Timeout`] / [`TransportError::Connect`] for
    /// connection failures.
    pub async fn make(
        &self,
        descriptor: &TransportDescriptor,
        timeout: Duration,
    ) -> Result<ClientService, TransportError> {
        let issues = descriptor.validate();
        if !issues.is_empty() {
            let joined = issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(TransportError::Config(joined));
        }
        tokio::time::timeout(timeout, self.make_inner(descriptor))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn make_inner(
        &self,
        descriptor: &TransportDescriptor,
    ) -> Result<ClientService, TransportError> {
        match descriptor {
            TransportDescriptor::Stdio {
                command,
                args,
                env,
                cwd,
            } => Self::connect_stdio(command, args, env, cwd.as_deref()).await,
            TransportDescriptor::Http {
                url,
                headers,
                api_key,
            } => self.connect_http(url, headers, api_key.as_deref()).await,
            TransportDescriptor::Sse {
                sse_url,
                post_url,
                headers,
                api_key,
            } => Self::connect_sse(sse_url, post_url, headers, api_key.as_deref()).await,
            TransportDescriptor::Websocket {
                url,
                headers,
                api_key,
            } => Self::connect_websocket(url, headers, api_key.as_deref()).await,
        }
    }

    async fn connect_stdio(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&std::path::Path>,
    ) -> Result<ClientService, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let transport = TokioChildProcess::new(cmd)
            .map_err(|e| TransportError::Spawn(format!("{command}: {e}")))?;
        ()
            .serve(transport)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }

    async fn connect_http(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        api_key: Option<&str>,
    ) -> Result<ClientService, TransportError> {
        let client = build_http_client(headers, api_key)?;
        let config = StreamableHttpClientTransportConfig::with_uri(url.to_owned());
        let service = match &self.payer {
            Some(payer) => {
                let paying = PayingClient::new(
                    client,
                    Arc::clone(&payer.signer),
                    payer.max_value,
                );
                let transport = StreamableHttpClientTransport::with_client(paying, config);
                ().serve(transport).await
            }
            None => {
                let transport = StreamableHttpClientTransport::with_client(client, config);
                ().serve(transport).await
            }
        };
        service.map_err(|e| TransportError::Connect(e.to_string()))
    }

    async fn connect_sse(
        sse_url: &str,
        post_url: &str,
        headers: &HashMap<String, String>,
        api_key: Option<&str>,
    ) -> Result<ClientService, TransportError> {
        let client = build_http_client(headers, api_key)?;
        let transport = SseClientTransport::start_with_client(
            client,
            SseClientConfig {
                sse_endpoint: sse_url.to_owned().into(),
                use_message_endpoint: Some(post_url.to_owned()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
        ()
            .serve(transport)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }

    async fn connect_websocket(
        url: &str,
        headers: &HashMap<String, String>,
        api_key: Option<&str>,
    ) -> Result<ClientService, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Config(format!("url: {e}")))?;
        for (name, value) in headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                tracing::warn!(header = %name, "skipping invalid websocket header");
                continue;
            };
            request.headers_mut().insert(name, value);
        }
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| TransportError::Config(format!("api_key: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (ws_sink, ws_stream) = socket.split();

        let sink = ws_sink
            .sink_map_err(WsError::Socket)
            .with(|message: ClientJsonRpcMessage| async move {
                let text = serde_json::to_string(&message).map_err(WsError::Encode)?;
                Ok::<_, WsError>(Message::Text(text.into()))
            });
        let stream = ws_stream.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ServerJsonRpcMessage>(&text) {
                        Ok(message) => Some(message),
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping unparseable websocket frame");
                            None
                        }
                    }
                }
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(error = %err, "websocket stream error");
                    None
                }
            }
        });

        ()
            .serve((Box::pin(sink), Box::pin(stream)))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

/// Sink-side websocket failure.
#[derive(Debug, thiserror::Error)]
enum WsError {
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Builds a reqwest client with merged headers and optional bearer key.
///
/// SSE streams are long-lived, so no global request timeout is set.
fn build_http_client(
    headers: &HashMap<String, String>,
    api_key: Option<&str>,
) -> Result<reqwest::Client, TransportError> {
    let mut header_map = HeaderMap::new();
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::warn!(header = %name, "skipping invalid header");
            continue;
        };
        header_map.insert(name, value);
    }
    if let Some(key) = api_key {
        let value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| TransportError::Config(format!("api_key: {e}")))?;
        header_map.insert(AUTHORIZATION, value);
    }
    reqwest::Client::builder()
        .default_headers(header_map)
        .connect_timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| TransportError::Config(e.to_string()))
}
