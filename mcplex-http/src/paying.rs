//! A streamable-HTTP client that settles downstream 402 challenges.
//!
//! When an upstream MCP server demands payment, its HTTP endpoint
//! answers `402 Payment Required` with an x402 challenge body. This
//! client reacts by signing an authorization with the gateway's outbound
//! credential and re-sending the request once, driven by an explicit
//! state machine:
//!
//! ```text
//! FirstAttempt ──2xx──▶ done
//!      │402
//!      ▼
//! Challenged ──cap exceeded──▶ fail (non-transient)
//!      │sign
//!      ▼
//! Retry ──2xx──▶ done
//!      │402
//!      ▼
//!     fail
//! ```
//!
//! The cap check sits between the first response and signing: a
//! downstream asking for more than the configured `max_value` is never
//! paid.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use mcplex::amount::Money;
use mcplex::auth::PAYMENT_HEADER;
use mcplex::encoding::Base64Bytes;
use mcplex::proto::{PaymentRequired, PaymentRequirements};
use mcplex::signer::{PaymentSigner, SignerError};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use rmcp::model::ClientJsonRpcMessage;
use rmcp::transport::common::http_header::HEADER_SESSION_ID;
use rmcp::transport::streamable_http_client::{
    StreamableHttpClient, StreamableHttpError, StreamableHttpPostResponse,
};
use sse_stream::{Error as SseError, Sse, SseStream};

/// Exact failure message for a challenge above the configured cap.
///
/// Sessions treat an error carrying this text as non-transient.
pub const CAP_EXCEEDED_MESSAGE: &str = "downstream payment exceeds cap";

/// Errors produced by the paying client.
#[derive(Debug, thiserror::Error)]
pub enum PayingError {
    /// Underlying HTTP failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a status the protocol does not allow.
    #[error("unexpected http status: {0}")]
    UnexpectedStatus(u16),
    /// The response content type was neither JSON nor an event stream.
    #[error("unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),
    /// The 402 response did not carry a usable challenge.
    #[error("malformed payment challenge: {0}")]
    MalformedChallenge(String),
    /// The challenge asks for more than the outbound payment cap.
    #[error("{CAP_EXCEEDED_MESSAGE}: {required} atomic units > cap {cap}")]
    CapExceeded {
        /// Atomic units the downstream asked for.
        required: String,
        /// The configured cap, in atomic units.
        cap: String,
    },
    /// Signing the authorization failed.
    #[error(transparent)]
    Signer(#[from] SignerError),
    /// A payload could not be serialized.
    #[error("failed to encode payment payload: {0}")]
    Encode(String),
    /// The downstream still answered 402 after being paid.
    #[error("downstream rejected payment")]
    PaymentRejected,
}

/// 402-retry state machine, reified so each transition is explicit.
enum PayState {
    /// No payment attached yet.
    FirstAttempt,
    /// The downstream challenged; the challenge is in hand.
    Challenged(Box<PaymentRequired>),
    /// An authorization was signed; resend once with it attached.
    Retry(Base64Bytes),
}

/// Streamable-HTTP client that pays downstream 402 challenges from the
/// gateway's outbound credential.
pub struct PayingClient {
    client: Client,
    signer: Arc<dyn PaymentSigner>,
    max_value: Money,
}

impl std::fmt::Debug for PayingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayingClient")
            .field("max_value", &self.max_value)
            .finish_non_exhaustive()
    }
}

impl Clone for PayingClient {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            signer: Arc::clone(&self.signer),
            max_value: self.max_value,
        }
    }
}

impl PayingClient {
    /// Creates a paying client around an existing reqwest client.
    #[must_use]
    pub fn new(client: Client, signer: Arc<dyn PaymentSigner>, max_value: Money) -> Self {
        Self {
            client,
            signer,
            max_value,
        }
    }

    /// Sends one POST, optionally with a payment header attached.
    async fn send(
        &self,
        uri: &str,
        message: &ClientJsonRpcMessage,
        session_id: Option<&str>,
        auth_header: Option<&str>,
        payment: Option<&Base64Bytes>,
    ) -> Result<Response, PayingError> {
        let mut request = self
            .client
            .post(uri)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .json(message);
        if let Some(session) = session_id {
            request = request.header(HEADER_SESSION_ID, session);
        }
        if let Some(token) = auth_header {
            request = request.bearer_auth(token);
        }
        if let Some(payment) = payment {
            let value = HeaderValue::from_bytes(payment.as_bytes())
                .map_err(|e| PayingError::Encode(e.to_string()))?;
            request = request.header(PAYMENT_HEADER, value);
        }
        Ok(request.send().await?)
    }

    /// Parses the challenge body out of a 402 response.
    async fn read_challenge(response: Response) -> Result<PaymentRequired, PayingError> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PayingError::MalformedChallenge(e.to_string()))
    }

    /// Rejects challenges above the outbound cap.
    fn check_cap(&self, requirements: &PaymentRequirements) -> Result<(), PayingError> {
        let required: u128 = requirements
            .max_amount_required
            .parse()
            .map_err(|_| {
                PayingError::MalformedChallenge(format!(
                    "non-numeric maxAmountRequired: {:?}",
                    requirements.max_amount_required
                ))
            })?;
        let cap: u128 = self
            .max_value
            .atomic_units()
            .parse()
            .unwrap_or(0);
        if required > cap {
            return Err(PayingError::CapExceeded {
                required: required.to_string(),
                cap: cap.to_string(),
            });
        }
        Ok(())
    }

    /// The full state machine for one logical POST.
    async fn post_with_payment(
        &self,
        uri: &str,
        message: &ClientJsonRpcMessage,
        session_id: Option<&str>,
        auth_header: Option<&str>,
    ) -> Result<StreamableHttpPostResponse, PayingError> {
        let mut state = PayState::FirstAttempt;
        loop {
            state = match state {
                PayState::FirstAttempt => {
                    let response = self
                        .send(uri, message, session_id, auth_header, None)
                        .await?;
                    if response.status() == StatusCode::PAYMENT_REQUIRED {
                        PayState::Challenged(Box::new(Self::read_challenge(response).await?))
                    } else {
                        return Self::finish(response).await;
                    }
                }
                PayState::Challenged(challenge) => {
                    let requirements = challenge.accepts.first().ok_or_else(|| {
                        PayingError::MalformedChallenge("empty accepts array".to_owned())
                    })?;
                    self.check_cap(requirements)?;
                    let payload = self.signer.sign(requirements)?;
                    let encoded = Base64Bytes::encode_json(&payload)
                        .map_err(|e| PayingError::Encode(e.to_string()))?;
                    tracing::debug!(
                        amount = %requirements.max_amount_required,
                        network = %requirements.network,
                        "paying downstream 402 challenge"
                    );
                    PayState::Retry(encoded)
                }
                PayState::Retry(payment) => {
                    let response = self
                        .send(uri, message, session_id, auth_header, Some(&payment))
                        .await?;
                    if response.status() == StatusCode::PAYMENT_REQUIRED {
                        return Err(PayingError::PaymentRejected);
                    }
                    return Self::finish(response).await;
                }
            };
        }
    }

    /// Converts a successful response into the transport result.
    async fn finish(response: Response) -> Result<StreamableHttpPostResponse, PayingError> {
        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Ok(StreamableHttpPostResponse::Accepted);
        }
        if !status.is_success() {
            return Err(PayingError::UnexpectedStatus(status.as_u16()));
        }
        let session_id = response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        match content_type.as_deref() {
            Some(ct) if ct.starts_with("text/event-stream") => {
                let stream = SseStream::from_byte_stream(response.bytes_stream()).boxed();
                Ok(StreamableHttpPostResponse::Sse(stream, session_id))
            }
            Some(ct) if ct.starts_with("application/json") => {
                let message = response.json().await?;
                Ok(StreamableHttpPostResponse::Json(message, session_id))
            }
            other => Err(PayingError::UnexpectedContentType(
                other.map(ToOwned::to_owned),
            )),
        }
    }
}

impl StreamableHttpClient for PayingClient {
    type Error = PayingError;

    fn post_message(
        &self,
        uri: Arc<str>,
        message: ClientJsonRpcMessage,
        session_id: Option<Arc<str>>,
        auth_header: Option<String>,
    ) -> impl std::future::Future<
        Output = Result<StreamableHttpPostResponse, StreamableHttpError<Self::Error>>,
    > + Send
    + '_ {
        async move {
            self.post_with_payment(
                uri.as_ref(),
                &message,
                session_id.as_deref(),
                auth_header.as_deref(),
            )
            .await
            .map_err(StreamableHttpError::Client)
        }
    }

    fn get_stream(
        &self,
        uri: Arc<str>,
        session_id: Arc<str>,
        last_event_id: Option<String>,
        auth_header: Option<String>,
    ) -> impl std::future::Future<
        Output = Result<BoxStream<'static, Result<Sse, SseError>>, StreamableHttpError<Self::Error>>,
    > + Send
    + '_ {
        async move {
            let mut request = self
                .client
                .get(uri.as_ref())
                .header(ACCEPT, "text/event-stream")
                .header(HEADER_SESSION_ID, session_id.as_ref());
            if let Some(last) = last_event_id {
                request = request.header("Last-Event-Id", last);
            }
            if let Some(token) = auth_header {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| StreamableHttpError::Client(PayingError::Http(e)))?;
            let status = response.status();
            if !status.is_success() {
                return Err(StreamableHttpError::Client(PayingError::UnexpectedStatus(
                    status.as_u16(),
                )));
            }
            Ok(SseStream::from_byte_stream(response.bytes_stream()).boxed())
        }
    }

    async fn delete_session(
        &self,
        uri: Arc<str>,
        session: Arc<str>,
        auth_token: Option<String>,
    ) -> Result<(), StreamableHttpError<Self::Error>> {
        let mut request = self
            .client
            .delete(uri.as_ref())
            .header(HEADER_SESSION_ID, session.as_ref());
        if let Some(token) = auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| StreamableHttpError::Client(PayingError::Http(e)))?;
        let status = response.status();
        // Many servers answer DELETE with 404/405; both mean "nothing to do".
        if status.is_success()
            || status == StatusCode::METHOD_NOT_ALLOWED
            || status == StatusCode::NOT_FOUND
        {
            Ok(())
        } else {
            Err(StreamableHttpError::Client(PayingError::UnexpectedStatus(
                status.as_u16(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcplex::signer::CredentialSigner;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn paying_client(max_value: &str) -> PayingClient {
        PayingClient::new(
            Client::new(),
            Arc::new(CredentialSigner::new("outbound-cred")),
            max_value.parse().unwrap(),
        )
    }

    fn jsonrpc_ping() -> ClientJsonRpcMessage {
        serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "ping"
        }))
        .unwrap()
    }

    fn challenge_body(amount: &str) -> serde_json::Value {
        serde_json::json!({
            "x402Version": 1,
            "accepts": [{
                "scheme": "exact",
                "network": "base-sepolia",
                "maxAmountRequired": amount,
                "resource": "/tools/echo",
                "payTo": "0xCAFE",
                "asset": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
                "maxTimeoutSeconds": 30,
                "description": "Payment for MCP tool: echo",
                "mimeType": "application/json"
            }]
        })
    }

    #[tokio::test]
    async fn passes_through_when_no_payment_demanded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_json(serde_json::json!({
                        "jsonrpc": "2.0", "id": 1, "result": {}
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = paying_client("$1.00");
        let result = client
            .post_with_payment(
                &format!("{}/mcp", server.uri()),
                &jsonrpc_ping(),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(matches!(result, StreamableHttpPostResponse::Json(..)));
    }

    #[tokio::test]
    async fn pays_once_after_a_402_challenge() {
        let server = MockServer::start().await;
        // Paid retry: the X-PAYMENT header distinguishes it.
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header_exists("X-PAYMENT"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_json(serde_json::json!({
                        "jsonrpc": "2.0", "id": 1, "result": {"paid": true}
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;
        // First attempt without payment gets the challenge.
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header("content-type", "application/json")
                    .set_body_json(challenge_body("10000")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = paying_client("$1.00");
        let result = client
            .post_with_payment(
                &format!("{}/mcp", server.uri()),
                &jsonrpc_ping(),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(matches!(result, StreamableHttpPostResponse::Json(..)));
    }

    #[tokio::test]
    async fn refuses_challenges_above_the_cap() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header("content-type", "application/json")
                    // $2.00 in atomic units, over the $1.00 cap.
                    .set_body_json(challenge_body("2000000")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = paying_client("$1.00");
        let err = client
            .post_with_payment(
                &format!("{}/mcp", server.uri()),
                &jsonrpc_ping(),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains(CAP_EXCEEDED_MESSAGE));
    }

    #[tokio::test]
    async fn attached_payment_decodes_to_signed_authorization() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header_exists("X-PAYMENT"))
            .respond_with(move |req: &Request| {
                let header = req.headers.get("X-PAYMENT").unwrap().to_str().unwrap();
                let payload: serde_json::Value =
                    Base64Bytes::from(header).decode_json().unwrap();
                assert_eq!(payload["scheme"], "exact");
                assert_eq!(payload["payload"]["signature"], "outbound-cred");
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_json(serde_json::json!({
                        "jsonrpc": "2.0", "id": 1, "result": {}
                    }))
            })
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header("content-type", "application/json")
                    .set_body_json(challenge_body("10000")),
            )
            .mount(&server)
            .await;

        let client = paying_client("$1.00");
        client
            .post_with_payment(
                &format!("{}/mcp", server.uri()),
                &jsonrpc_ping(),
                None,
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn second_402_fails_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header("content-type", "application/json")
                    .set_body_json(challenge_body("10000")),
            )
            .expect(2)
            .mount(&server)
            .await;

        let client = paying_client("$1.00");
        let err = client
            .post_with_payment(
                &format!("{}/mcp", server.uri()),
                &jsonrpc_ping(),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PayingError::PaymentRejected));
    }
}
