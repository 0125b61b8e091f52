//! Base64 payload encoding for payment headers.
//!
//! The `X-PAYMENT` header and its outbound counterpart carry
//! base64-encoded JSON documents. [`Base64Bytes`] wraps the encoded form
//! and provides the JSON round trip used by the payment mediator.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors from decoding a base64 JSON payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The value was not valid base64.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded bytes were not the expected JSON document.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Base64-encoded bytes as they appear in a payment header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64Bytes(Vec<u8>);

impl Base64Bytes {
    /// Wraps an already-encoded header value.
    #[must_use]
    pub fn new(encoded: impl Into<Vec<u8>>) -> Self {
        Self(encoded.into())
    }

    /// Encodes raw bytes into base64 form.
    #[must_use]
    pub fn encode(raw: impl AsRef<[u8]>) -> Self {
        Self(b64.encode(raw.as_ref()).into_bytes())
    }

    /// Serializes a value to JSON and encodes it as base64.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Json`] if serialization fails.
    pub fn encode_json<T: Serialize>(value: &T) -> Result<Self, DecodeError> {
        Ok(Self::encode(serde_json::to_vec(value)?))
    }

    /// Decodes back to the raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Base64`] if the data is not valid base64.
    pub fn decode(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(b64.decode(&self.0)?)
    }

    /// Decodes and deserializes the JSON document inside.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] on base64 or JSON failure.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(&self.decode()?)?)
    }

    /// The encoded bytes, suitable for use as an HTTP header value.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Base64Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Base64Bytes {
    fn from(value: &str) -> Self {
        Self(value.trim().as_bytes().to_vec())
    }
}

impl From<String> for Base64Bytes {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl fmt::Display for Base64Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}
