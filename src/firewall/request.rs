//! Buffered requests.
//!
//! A secured route's body is read at most once off the wire and replayed as
//! often as needed: input accessors parse it, transaction templates read it,
//! and the proxy forwards it byte-identical to what the client sent.

use crate::firewall::error::GateError;
use axum::{
    body::{Body, Bytes},
    http::{header::HOST, HeaderMap, Method, Request, Uri},
};

/// Upper bound on a buffered body. Requests past this are rejected before
/// any ceremony work happens.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// An immutable snapshot of an inbound request: method, target, headers, and
/// the fully buffered body.
#[derive(Debug, Clone)]
pub struct BufferedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    body: Bytes,
}

impl BufferedRequest {
    /// Drain the request body into memory.
    ///
    /// # Errors
    /// Returns an input error when the body cannot be read or exceeds
    /// [`MAX_BODY_BYTES`].
    pub async fn capture(request: Request<Body>) -> Result<Self, GateError> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|err| GateError::input(format!("failed to buffer request body: {err}")))?;

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        })
    }

    /// A cheap handle to the buffered body. Cloning `Bytes` does not copy.
    #[must_use]
    pub fn body(&self) -> Bytes {
        self.body.clone()
    }

    /// The host the client addressed, `Host` header first, then the request
    /// target's authority.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.uri.authority().map(|authority| authority.as_str()))
    }

    /// Path plus query string, as sent.
    #[must_use]
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map_or_else(|| self.uri.path(), |pq| pq.as_str())
    }
}
