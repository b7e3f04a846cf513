//! The firewall: configuration, shared state, and the axum router that ties
//! the ceremony endpoints, the secured-route table, and the passthrough
//! proxy together.

pub mod error;
pub mod handlers;
pub mod input;
pub mod principal;
pub mod proxy;
pub mod request;
pub mod routes;

pub use error::GateError;
pub use input::{ContextFuture, ContextGetter, ContextGetters, DefaultInput, RequestReader};
pub use request::BufferedRequest;
pub use routes::{
    tx_template, Effect, EffectFn, GateSpec, PrincipalSource, RouteKind, SecuredRoute, TxTemplate,
};

use crate::session::SessionStore;
use crate::webauthn::{CeremonyEngine, CredentialStore, StepUpService};
use crate::APP_USER_AGENT;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderName, HeaderValue, Request},
    routing::{get, on, post, MethodFilter},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use principal::PrincipalResolver;
use proxy::ProxyDispatcher;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::info;
use ulid::Ulid;
use url::Url;

const X_REQUEST_ID: &str = "x-request-id";

pub struct FirewallConfig {
    /// Relying-party id, normally the firewall's public hostname.
    pub rp_id: String,
    pub rp_name: String,
    /// Origin the browser frontend is served from; used for CORS and
    /// client-data origin checks.
    pub frontend_origin: String,
    /// Exact host -> backend base URL. Requests for any other host are
    /// refused.
    pub targets: HashMap<String, Url>,
    /// Backend base URL for server-context lookups (session resolution,
    /// context getters).
    pub context_base: Url,
    /// Path prefix for the ceremony endpoints.
    pub webauthn_prefix: String,
    pub default_input: DefaultInput,
    /// Accept self-signed backend certificates. Development only.
    pub accept_invalid_backend_certs: bool,
}

/// Shared per-request state behind the router.
pub struct FirewallState {
    pub step_up: StepUpService,
    pub sessions: SessionStore,
    pub proxy: ProxyDispatcher,
    pub principal: PrincipalResolver,
    pub context: Arc<ContextGetters>,
    pub default_input: DefaultInput,
    pub frontend_origin: HeaderValue,
}

/// Builder for a configured firewall: construct, register context getters
/// and secured routes, then take the [`Router`].
pub struct Firewall {
    config: FirewallConfig,
    step_up: StepUpService,
    sessions: SessionStore,
    context: ContextGetters,
    routes: Vec<SecuredRoute>,
}

impl Firewall {
    /// # Errors
    /// Returns an error when the session key is too short.
    pub fn new(
        config: FirewallConfig,
        engine: Arc<dyn CeremonyEngine>,
        credentials: Arc<dyn CredentialStore>,
        session_key: &[u8],
    ) -> Result<Self> {
        let sessions = SessionStore::new(session_key)?;
        Ok(Self {
            config,
            step_up: StepUpService::new(engine, credentials),
            sessions,
            context: ContextGetters::new(),
            routes: Vec::new(),
        })
    }

    /// Register a named deployment-specific lookup for transaction
    /// templates.
    pub fn register_context(&mut self, name: &'static str, getter: ContextGetter) {
        self.context.insert(name, getter);
    }

    /// Add a route to the secured table.
    pub fn secure_route(&mut self, route: SecuredRoute) {
        self.routes.push(route);
    }

    /// Consume the builder and produce the router.
    ///
    /// # Errors
    /// Returns an error for an invalid frontend origin or an HTTP method the
    /// router cannot filter on.
    pub fn router(self) -> Result<Router> {
        let frontend_origin = HeaderValue::from_str(&self.config.frontend_origin)
            .context("invalid frontend origin")?;

        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .danger_accept_invalid_certs(self.config.accept_invalid_backend_certs)
            .build()
            .context("failed to build backend HTTP client")?;

        let state = Arc::new(FirewallState {
            step_up: self.step_up,
            sessions: self.sessions,
            proxy: ProxyDispatcher::new(
                self.config.targets,
                frontend_origin.clone(),
                client.clone(),
            ),
            principal: PrincipalResolver::new(self.config.context_base, client),
            context: Arc::new(self.context),
            default_input: self.config.default_input,
            frontend_origin,
        });

        let prefix = self.config.webauthn_prefix.trim_end_matches('/');
        let mut router = Router::new()
            .route(
                &format!("{prefix}/is_enabled/{{user}}"),
                get(handlers::is_enabled).options(handlers::preflight),
            )
            .route(
                &format!("{prefix}/begin_register"),
                post(handlers::begin_register).options(handlers::preflight),
            )
            .route(
                &format!("{prefix}/finish_register"),
                post(handlers::finish_register).options(handlers::preflight),
            )
            .route(
                &format!("{prefix}/begin_login"),
                post(handlers::begin_login).options(handlers::preflight),
            )
            .route(
                &format!("{prefix}/begin_attestation"),
                post(handlers::begin_attestation).options(handlers::preflight),
            )
            .route(
                &format!("{prefix}/disable"),
                post(handlers::disable).options(handlers::preflight),
            );

        for route in self.routes {
            let filter = MethodFilter::try_from(route.method.clone())
                .map_err(|err| anyhow::anyhow!("unsupported route method: {err}"))?;
            info!(method = %route.method, path = %route.path, "securing route");

            let route = Arc::new(route);
            let shared = Arc::clone(&route);
            let handler = move |State(state): State<Arc<FirewallState>>,
                                path: Option<Path<HashMap<String, String>>>,
                                request: Request<Body>| {
                let route = Arc::clone(&shared);
                async move {
                    let vars = path.map(|Path(vars)| vars).unwrap_or_default();
                    handlers::run_secured(state, route, vars, request).await
                }
            };
            router = router.route(
                &route.path,
                on(filter, handler).options(handlers::preflight),
            );
        }

        let x_request_id = HeaderName::from_static(X_REQUEST_ID);
        let router = router
            .fallback(handlers::passthrough)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestHeaderLayer::if_not_present(
                        x_request_id.clone(),
                        |_: &Request<Body>| HeaderValue::from_str(&Ulid::new().to_string()).ok(),
                    ))
                    .layer(
                        TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                            let request_id = request
                                .headers()
                                .get(X_REQUEST_ID)
                                .and_then(|value| value.to_str().ok())
                                .unwrap_or_default();
                            tracing::info_span!(
                                "request",
                                method = %request.method(),
                                uri = %request.uri(),
                                request_id,
                            )
                        }),
                    )
                    .layer(PropagateRequestIdLayer::new(x_request_id)),
            )
            .with_state(state);

        Ok(router)
    }
}

/// Serve the router over TLS until shutdown.
///
/// # Errors
/// Returns an error when binding or serving fails.
pub async fn serve_tls(router: Router, addr: SocketAddr, tls: RustlsConfig) -> Result<()> {
    info!(%addr, "listening");
    axum_server::bind_rustls(addr, tls)
        .serve(router.into_make_service())
        .await
        .context("server error")
}
