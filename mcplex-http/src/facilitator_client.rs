//! A [`mcplex::facilitator::Facilitator`] implementation backed by a
//! remote verification facilitator reached over HTTP.
//!
//! The client speaks to the facilitator's `POST /verify` endpoint with a
//! JSON body of `{ paymentPayload, paymentRequirements }` and interprets
//! the response as a [`Verdict`]:
//!
//! - a 2xx response is parsed as the verdict, with an unparseable body
//!   degrading to "not verified"
//! - a non-2xx response is a negative verdict carrying `HTTP <code>`
//! - transport failures (DNS, refused connection, timeout) surface as
//!   [`FacilitatorClientError`] and never reach downstream clients

use std::time::Duration;

use mcplex::facilitator::{BoxFuture, Facilitator, FacilitatorError};
use mcplex::proto::{Verdict, VerifyRequest};
use reqwest::Client;
use url::Url;

/// Default timeout for verify calls.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while talking to a remote facilitator.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    /// URL parse or join failure.
    #[error("invalid facilitator URL: {0}")]
    UrlParse(#[from] url::ParseError),
    /// The HTTP request could not be completed.
    #[error("facilitator request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A client for a remote x402 verification facilitator.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    base_url: Url,
    verify_url: Url,
    client: Client,
    timeout: Duration,
}

impl FacilitatorClient {
    /// Constructs a client from the facilitator base URL.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError::UrlParse`] if the `./verify`
    /// endpoint URL cannot be derived.
    pub fn try_new(base_url: Url) -> Result<Self, FacilitatorClientError> {
        let verify_url = base_url.join("./verify")?;
        Ok(Self {
            base_url,
            verify_url,
            client: Client::new(),
            timeout: DEFAULT_VERIFY_TIMEOUT,
        })
    }

    /// The configured base URL.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The derived `./verify` endpoint URL.
    #[must_use]
    pub const fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    /// Overrides the per-request timeout (default 30 s).
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends a verify request and interprets the response.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] only for transport-level
    /// failures; protocol-level "no" answers are negative [`Verdict`]s.
    pub async fn verify(&self, request: &VerifyRequest) -> Result<Verdict, FacilitatorClientError> {
        let response = self
            .client
            .post(self.verify_url.clone())
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "facilitator rejected verify call");
            return Ok(Verdict {
                verified: false,
                error: Some(format!("HTTP {}", status.as_u16())),
            });
        }
        match response.json::<Verdict>().await {
            Ok(verdict) => Ok(verdict),
            Err(err) => {
                tracing::warn!(error = %err, "unparseable facilitator verify response");
                Ok(Verdict::default())
            }
        }
    }
}

impl Facilitator for FacilitatorClient {
    fn verify(&self, request: VerifyRequest) -> BoxFuture<'_, Result<Verdict, FacilitatorError>> {
        Box::pin(async move {
            Self::verify(self, &request)
                .await
                .map_err(|e| FacilitatorError::Transport(e.to_string()))
        })
    }
}

/// Builds a client from a string URL, normalizing trailing slashes so
/// `.../facilitator` and `.../facilitator/` both resolve `./verify`
/// under the same path.
impl TryFrom<&str> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut normalized = value.trim_end_matches('/').to_owned();
        normalized.push('/');
        Ok(Self::try_new(Url::parse(&normalized)?)?)
    }
}

impl TryFrom<String> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}
