//! Inbound credential extraction.
//!
//! Payment-relevant headers are recognized once, at the front-end
//! boundary, and carried through the call as an [`InboundAuth`] value.
//! The raw header pairs are preserved with their original casing so
//! passthrough forwarding can relay them untouched.

use crate::encoding::Base64Bytes;

/// Header carrying a base64-encoded x402 payment payload.
pub const PAYMENT_HEADER: &str = "X-PAYMENT";

/// Header carrying a static API key.
pub const API_KEY_HEADER: &str = "X-ELIZA-API-KEY";

/// Standard authorization header; `Bearer <key>` is treated as an API key.
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Credentials presented by the downstream client on a single call.
///
/// Both an API key and a payment may be present at once: admission tries
/// the key first and falls through to the payment when the key or tier
/// does not settle the price.
#[derive(Debug, Clone, Default)]
pub struct InboundAuth {
    api_key: Option<String>,
    payment: Option<Base64Bytes>,
    forwarded: Vec<(String, String)>,
}

impl InboundAuth {
    /// No credentials at all.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Extracts credentials from raw header pairs.
    ///
    /// Header names are matched case-insensitively. The original pairs
    /// for the three recognized headers are retained verbatim, in input
    /// order, for passthrough forwarding.
    #[must_use]
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut auth = Self::default();
        let mut bearer = None;
        for (name, value) in headers {
            if name.eq_ignore_ascii_case(PAYMENT_HEADER) {
                auth.payment = Some(Base64Bytes::from(value));
                auth.forwarded.push((name.to_owned(), value.to_owned()));
            } else if name.eq_ignore_ascii_case(API_KEY_HEADER) {
                auth.api_key = Some(value.trim().to_owned());
                auth.forwarded.push((name.to_owned(), value.to_owned()));
            } else if name.eq_ignore_ascii_case(AUTHORIZATION_HEADER) {
                if let Some(token) = value.trim().strip_prefix("Bearer ") {
                    bearer = Some(token.trim().to_owned());
                }
                auth.forwarded.push((name.to_owned(), value.to_owned()));
            }
        }
        // A dedicated API key header wins over a bearer token.
        if auth.api_key.is_none() {
            auth.api_key = bearer;
        }
        auth
    }

    /// Builds an auth value carrying only an API key (test and internal use).
    #[must_use]
    pub fn with_api_key(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            forwarded: vec![(API_KEY_HEADER.to_owned(), key.clone())],
            api_key: Some(key),
            payment: None,
        }
    }

    /// Builds an auth value carrying only a payment payload.
    ///
    /// Used by bindings whose payment material arrives outside HTTP
    /// headers (e.g. MCP `_meta`).
    #[must_use]
    pub fn with_payment(payment: Base64Bytes) -> Self {
        Self {
            forwarded: vec![(PAYMENT_HEADER.to_owned(), payment.to_string())],
            api_key: None,
            payment: Some(payment),
        }
    }

    /// The presented API key, if any.
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// The presented payment payload (still base64-encoded), if any.
    #[must_use]
    pub fn payment(&self) -> Option<&Base64Bytes> {
        self.payment.as_ref()
    }

    /// The recognized header pairs with original casing, for passthrough.
    #[must_use]
    pub fn forwarded_headers(&self) -> &[(String, String)] {
        &self.forwarded
    }

    /// `true` when no credential of any kind was presented.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.api_key.is_none() && self.payment.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_headers_case_insensitively() {
        let auth = InboundAuth::from_headers([
            ("x-eliza-api-key", "K1"),
            ("X-Payment", "cGF5bG9hZA=="),
        ]);
        assert_eq!(auth.api_key(), Some("K1"));
        assert!(auth.payment().is_some());
        assert!(!auth.is_anonymous());
    }

    #[test]
    fn bearer_token_is_an_api_key() {
        let auth = InboundAuth::from_headers([("authorization", "Bearer tok-9")]);
        assert_eq!(auth.api_key(), Some("tok-9"));
    }

    #[test]
    fn dedicated_key_header_wins_over_bearer() {
        let auth = InboundAuth::from_headers([
            ("Authorization", "Bearer other"),
            ("X-ELIZA-API-KEY", "primary"),
        ]);
        assert_eq!(auth.api_key(), Some("primary"));
    }

    #[test]
    fn preserves_original_casing_for_passthrough() {
        let auth = InboundAuth::from_headers([
            ("x-PaYmEnT", "abc"),
            ("Content-Type", "application/json"),
            ("AUTHORIZATION", "Bearer t"),
        ]);
        let names: Vec<&str> = auth
            .forwarded_headers()
            .iter()
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(names, vec!["x-PaYmEnT", "AUTHORIZATION"]);
    }

    #[test]
    fn anonymous_when_nothing_recognized() {
        let auth = InboundAuth::from_headers([("Content-Type", "application/json")]);
        assert!(auth.is_anonymous());
        assert!(auth.forwarded_headers().is_empty());
    }
}
