//! Error taxonomy for the firewall request path.
//!
//! Every rejection maps to one of five classes; handlers convert the class to
//! an HTTP status and a structured JSON body. Error messages never include a
//! stored challenge or session secret.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum GateError {
    /// Missing or malformed client input (form field, route variable, body).
    #[error("{0}")]
    Input(String),

    /// Ceremony session absent, expired, consumed, or bound to a different
    /// principal.
    #[error("{0}")]
    CeremonyState(String),

    /// Assertion or attestation failed verification, including a transaction
    /// extension mismatch. Always fails closed.
    #[error("{0}")]
    Verification(String),

    /// An external collaborator (credential store, backend) failed.
    #[error("{0}")]
    Dependency(String),

    /// No reverse-proxy target is configured for the request's host.
    #[error("no backend target configured for host: {0}")]
    UnknownHost(String),
}

impl GateError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn ceremony(msg: impl Into<String>) -> Self {
        Self::CeremonyState(msg.into())
    }

    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    pub fn dependency(err: impl std::fmt::Display) -> Self {
        Self::Dependency(err.to_string())
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Input(_) | Self::CeremonyState(_) => StatusCode::BAD_REQUEST,
            Self::Verification(_) => StatusCode::UNAUTHORIZED,
            Self::Dependency(_) => StatusCode::BAD_GATEWAY,
            Self::UnknownHost(_) => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
