//! Core trait for x402 payment verification.
//!
//! The gateway never interprets payment payloads itself; it delegates to
//! a facilitator, normally reached over HTTP (see the `mcplex-http`
//! crate). The trait is dyn-compatible so the mediator can hold a
//! `Arc<dyn Facilitator>` regardless of the concrete backend.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::proto::{Verdict, VerifyRequest};

/// Boxed future type alias for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur while talking to a facilitator.
///
/// These never surface to downstream clients directly; the mediator maps
/// all of them to a generic verification rejection.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FacilitatorError {
    /// The facilitator could not be reached or the connection failed.
    #[error("facilitator transport error: {0}")]
    Transport(String),
    /// The facilitator answered with a non-success HTTP status.
    #[error("facilitator returned HTTP {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
    },
    /// The in-flight call was cancelled by gateway shutdown.
    #[error("facilitator call cancelled")]
    Cancelled,
}

/// Verifies payment payloads against stated requirements.
pub trait Facilitator: Send + Sync {
    /// Checks whether `request.payment_payload` satisfies
    /// `request.payment_requirements`.
    ///
    /// A transport or protocol failure is an error; a well-formed "no"
    /// is a [`Verdict`] with `verified == false`.
    fn verify(&self, request: VerifyRequest) -> BoxFuture<'_, Result<Verdict, FacilitatorError>>;
}

impl<T: Facilitator> Facilitator for Arc<T> {
    fn verify(&self, request: VerifyRequest) -> BoxFuture<'_, Result<Verdict, FacilitatorError>> {
        self.as_ref().verify(request)
    }
}
