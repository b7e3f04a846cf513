use crate::firewall::{
    self, tx_template, ContextFuture, ContextGetter, DefaultInput, Firewall, FirewallConfig,
    GateSpec, PrincipalSource, SecuredRoute,
};
use crate::webauthn::{ChallengeEngine, CredentialStore, MemoryCredentialStore, PgCredentialStore};
use crate::APP_USER_AGENT;
use anyhow::{anyhow, Context, Result};
use axum::http::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub frontend_origin: String,
    pub targets: HashMap<String, Url>,
    pub context_base: Url,
    pub login_path: String,
    pub webauthn_prefix: String,
    pub rp_id: String,
    pub rp_name: String,
    pub session_key: SecretString,
    pub dsn: Option<String>,
    pub tls_cert: String,
    pub tls_key: String,
    pub default_input: DefaultInput,
    pub insecure_backend: bool,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the session key is invalid, the store cannot be
/// reached, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let session_key = hex::decode(args.session_key.expose_secret())
        .context("FIREWALL_SESSION_KEY is not valid hex")?;

    log_startup_args(&args);

    let credentials: Arc<dyn CredentialStore> = match &args.dsn {
        Some(dsn) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(dsn)
                .await
                .context("Failed to connect to the credential database")?;
            let store = PgCredentialStore::new(pool);
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            info!("no DSN configured, using in-memory credential store");
            Arc::new(MemoryCredentialStore::new())
        }
    };

    let engine = Arc::new(ChallengeEngine::new(
        args.rp_id.clone(),
        args.rp_name.clone(),
        args.frontend_origin.clone(),
    ));

    let config = FirewallConfig {
        rp_id: args.rp_id,
        rp_name: args.rp_name,
        frontend_origin: args.frontend_origin,
        targets: args.targets,
        context_base: args.context_base.clone(),
        webauthn_prefix: args.webauthn_prefix,
        default_input: args.default_input,
        accept_invalid_backend_certs: args.insecure_backend,
    };

    let mut firewall = Firewall::new(config, engine, credentials, &session_key)?;

    firewall.register_context(
        "ssh_key_name",
        ssh_key_name_getter(args.context_base, args.insecure_backend)?,
    );
    secure_routes(&mut firewall, &args.login_path);

    let tls = crate::tls::load_rustls_config(Path::new(&args.tls_cert), Path::new(&args.tls_key))?;
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    firewall::serve_tls(firewall.router()?, addr, tls).await
}

// The routes the proxied application needs gated: login, repository
// deletion, and SSH key management.
fn secure_routes(firewall: &mut Firewall, login_path: &str) {
    firewall.secure_route(SecuredRoute::gated(
        Method::POST,
        login_path,
        PrincipalSource::Field("user_name"),
        None,
    ));

    firewall.secure_route(SecuredRoute::dispatch_on(
        Method::POST,
        "/{username}/{repo}/settings",
        "action",
        vec![(
            "delete",
            GateSpec::new(
                PrincipalSource::BrowserSession,
                Some(tx_template(|_user, reader| {
                    Box::pin(async move {
                        let username = reader.path_var("username");
                        let repo = reader.path_var("repo");
                        Ok(format!("Confirm repository delete: {username}/{repo}"))
                    })
                })),
            ),
        )],
    ));

    firewall.secure_route(SecuredRoute::gated(
        Method::POST,
        "/user/settings/keys",
        PrincipalSource::BrowserSession,
        Some(tx_template(|_user, reader| {
            Box::pin(async move {
                let title = reader.get("title");
                Ok(format!("Add SSH key named: {title}"))
            })
        })),
    ));

    firewall.secure_route(SecuredRoute::gated(
        Method::POST,
        "/user/settings/keys/delete/{id}",
        PrincipalSource::BrowserSession,
        Some(tx_template(|_user, reader| {
            Box::pin(async move {
                let id = reader.path_var("id");
                let name = reader.get_context("ssh_key_name", vec![id]).await;
                Ok(format!("Delete SSH key named: {name}"))
            })
        })),
    ));
}

// Resolves an SSH key id to its display name via the backend's server
// context endpoint.
fn ssh_key_name_getter(context_base: Url, insecure: bool) -> Result<ContextGetter> {
    let client = reqwest::Client::builder()
        .user_agent(APP_USER_AGENT)
        .danger_accept_invalid_certs(insecure)
        .build()
        .context("failed to build context lookup client")?;

    Ok(Arc::new(move |args: Vec<String>| {
        let client = client.clone();
        let base = context_base.clone();
        Box::pin(async move {
            let id = args
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("ssh_key_name requires a key id"))?;
            let url = base.join(&format!("server_context/ssh_key/{id}"))?;

            let body: Value = client.get(url).send().await?.json().await?;
            body.get("Name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("ssh key {id} has no name"))
        }) as ContextFuture
    }))
}

fn log_startup_args(args: &Args) {
    let targets: Vec<String> = args
        .targets
        .iter()
        .map(|(host, url)| format!("{host} -> {url}"))
        .collect();
    info!(
        port = args.port,
        frontend_origin = %args.frontend_origin,
        targets = ?targets,
        context_base = %args.context_base,
        login_path = %args.login_path,
        rp_id = %args.rp_id,
        store = if args.dsn.is_some() { "postgres" } else { "memory" },
        insecure_backend = args.insecure_backend,
        "startup configuration"
    );
}
