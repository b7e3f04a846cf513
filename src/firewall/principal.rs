//! Resolving "who is calling" for secured routes.
//!
//! The firewall never owns application logins; it asks the backend to map
//! the caller's existing browser session to a user id, forwarding the
//! request's cookies verbatim. An `Authorization: Bearer` token can supply a
//! fallback hint for API clients: the claim is read without signature
//! verification and is therefore a lookup key only, never an authorization
//! decision. The ceremony that follows is what authenticates the caller.

use crate::firewall::error::GateError;
use axum::http::{
    header::{AUTHORIZATION, COOKIE},
    HeaderMap,
};
use base64ct::{Base64UrlUnpadded, Encoding};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

const SESSION_TO_USER_PATH: &str = "server_context/session2user";

#[derive(Debug, Deserialize)]
struct WhoAmI {
    ok: bool,
    #[serde(default)]
    uid: i64,
}

pub struct PrincipalResolver {
    context_base: Url,
    client: reqwest::Client,
}

impl PrincipalResolver {
    #[must_use]
    pub const fn new(context_base: Url, client: reqwest::Client) -> Self {
        Self {
            context_base,
            client,
        }
    }

    /// Resolve the caller: browser session first, bearer hint as fallback.
    ///
    /// # Errors
    /// Returns the session-resolution error when neither path identifies a
    /// user.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<i64, GateError> {
        match self.user_id_from_session(headers).await {
            Ok(uid) => Ok(uid),
            Err(err) => match Self::user_id_hint_from_bearer(headers) {
                Some(uid) => {
                    debug!(uid, "resolved principal from bearer hint");
                    Ok(uid)
                }
                None => Err(err),
            },
        }
    }

    /// Ask the backend which user owns the caller's browser session.
    ///
    /// # Errors
    /// Returns a dependency error when the backend is unreachable, an input
    /// error when the session maps to no user.
    pub async fn user_id_from_session(&self, headers: &HeaderMap) -> Result<i64, GateError> {
        let url = self
            .context_base
            .join(SESSION_TO_USER_PATH)
            .map_err(GateError::dependency)?;

        let mut request = self.client.get(url);
        for cookie in headers.get_all(COOKIE) {
            request = request.header(COOKIE, cookie);
        }

        let whoami: WhoAmI = request
            .send()
            .await
            .map_err(GateError::dependency)?
            .json()
            .await
            .map_err(GateError::dependency)?;

        if !whoami.ok || whoami.uid <= 0 {
            return Err(GateError::input(
                "no authenticated user for the browser session",
            ));
        }
        Ok(whoami.uid)
    }

    /// Read the `id` claim out of a bearer token's payload without verifying
    /// the signature. A lookup hint only.
    #[must_use]
    pub fn user_id_hint_from_bearer(headers: &HeaderMap) -> Option<i64> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())?
            .strip_prefix("Bearer ")?;

        let payload = token.split('.').nth(1)?;
        let raw = Base64UrlUnpadded::decode_vec(payload.trim_end_matches('=')).ok()?;
        let claims: Value = serde_json::from_slice(&raw).ok()?;

        match claims.get("id")? {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.parse().ok(),
            _ => None,
        }
    }
}
