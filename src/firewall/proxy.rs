//! Reverse-proxy dispatch.
//!
//! Forwarding is keyed on the exact host the client addressed: a host with
//! no configured target is refused outright, never guessed. Bodies are
//! replayed from the buffered capture, so what the backend receives is
//! byte-identical to what the client sent, gate or no gate.

use crate::firewall::error::GateError;
use crate::firewall::request::BufferedRequest;
use axum::{
    body::Body,
    http::{
        header::{
            HeaderName, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_ORIGIN,
            CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
        },
        HeaderValue, Response,
    },
};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct ProxyDispatcher {
    targets: HashMap<String, Url>,
    frontend_origin: HeaderValue,
    client: reqwest::Client,
}

impl ProxyDispatcher {
    #[must_use]
    pub const fn new(
        targets: HashMap<String, Url>,
        frontend_origin: HeaderValue,
        client: reqwest::Client,
    ) -> Self {
        Self {
            targets,
            frontend_origin,
            client,
        }
    }

    /// Replay the buffered request against the backend configured for its
    /// host and translate the backend's response, with CORS headers
    /// rewritten for the configured frontend origin.
    ///
    /// # Errors
    /// Returns `UnknownHost` before any outbound call when the host has no
    /// configured target, a dependency error when the backend fails.
    pub async fn forward(&self, request: &BufferedRequest) -> Result<Response<Body>, GateError> {
        let host = request
            .host()
            .ok_or_else(|| GateError::input("request has no host"))?;

        let target = self
            .targets
            .get(host)
            .ok_or_else(|| GateError::UnknownHost(host.to_string()))?;

        let url = format!(
            "{}{}",
            target.as_str().trim_end_matches('/'),
            request.path_and_query()
        );
        debug!(%host, method = %request.method, url, "forwarding request");

        let mut outbound = self
            .client
            .request(request.method.clone(), &url)
            .body(request.body());
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) || name == HOST || name == CONTENT_LENGTH {
                continue;
            }
            outbound = outbound.header(name, value);
        }

        let upstream = outbound.send().await.map_err(GateError::dependency)?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream.bytes().await.map_err(GateError::dependency)?;

        let mut response = Response::builder().status(status);
        for (name, value) in &headers {
            if is_hop_by_hop(name)
                || name == CONTENT_LENGTH
                || name == TRANSFER_ENCODING
                || name == ACCESS_CONTROL_ALLOW_ORIGIN
                || name == ACCESS_CONTROL_ALLOW_CREDENTIALS
            {
                continue;
            }
            response = response.header(name, value);
        }
        response = response
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, self.frontend_origin.clone())
            .header(ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");

        response
            .body(Body::from(body))
            .map_err(GateError::dependency)
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request};

    fn dispatcher() -> ProxyDispatcher {
        let targets = HashMap::from([(
            "app.internal:3000".to_string(),
            Url::parse("http://127.0.0.1:59999").expect("url"),
        )]);
        ProxyDispatcher::new(
            targets,
            HeaderValue::from_static("https://localhost:8081"),
            reqwest::Client::new(),
        )
    }

    async fn buffered(host: &str) -> BufferedRequest {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/issues")
            .header(HOST, host)
            .body(Body::empty())
            .expect("request");
        BufferedRequest::capture(request).await.expect("capture")
    }

    #[tokio::test]
    async fn test_unknown_host_refused_without_outbound_call() {
        // The configured target does not listen; an attempted forward would
        // surface as a dependency error, not UnknownHost.
        let request = buffered("evil.internal:3000").await;
        let err = dispatcher().forward(&request).await.expect_err("must refuse");
        assert!(matches!(err, GateError::UnknownHost(_)));
    }

    #[tokio::test]
    async fn test_missing_host_is_input_error() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/issues")
            .body(Body::empty())
            .expect("request");
        let request = BufferedRequest::capture(request).await.expect("capture");

        let err = dispatcher().forward(&request).await.expect_err("must refuse");
        assert!(matches!(err, GateError::Input(_)));
    }

    #[test]
    fn test_hop_by_hop_classification() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("cookie")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
    }
}
