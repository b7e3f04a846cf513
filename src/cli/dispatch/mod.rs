use crate::cli::actions::{server::Args, Action};
use crate::firewall::DefaultInput;
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::collections::HashMap;
use url::Url;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8081);

    let frontend_origin = matches
        .get_one::<String>("frontend-origin")
        .cloned()
        .context("missing required argument: --frontend-origin")?;

    let mut targets = HashMap::new();
    let mut first_target = None;
    for pair in matches
        .get_many::<String>("backend-target")
        .context("missing required argument: --backend-target")?
    {
        // Validated by clap, split cannot fail here.
        let (host, url) = pair
            .split_once('=')
            .context("invalid backend target pair")?;
        let url = Url::parse(url).context("invalid backend target URL")?;
        if first_target.is_none() {
            first_target = Some(url.clone());
        }
        targets.insert(host.to_string(), url);
    }

    let context_base = match matches.get_one::<String>("context-base") {
        Some(base) => Url::parse(base).context("invalid FIREWALL_CONTEXT_BASE")?,
        None => first_target.context("missing required argument: --backend-target")?,
    };

    let session_key = matches
        .get_one::<String>("session-key")
        .cloned()
        .map(SecretString::from)
        .context("missing required argument: --session-key")?;

    let default_input = if matches.get_flag("json-input") {
        DefaultInput::Json
    } else {
        DefaultInput::Form
    };

    Ok(Action::Server(Args {
        port,
        frontend_origin,
        targets,
        context_base,
        login_path: matches
            .get_one::<String>("login-path")
            .cloned()
            .unwrap_or_else(|| "/user/login".to_string()),
        webauthn_prefix: matches
            .get_one::<String>("webauthn-prefix")
            .cloned()
            .unwrap_or_else(|| "/webauthn".to_string()),
        rp_id: matches
            .get_one::<String>("rp-id")
            .cloned()
            .context("missing required argument: --rp-id")?,
        rp_name: matches
            .get_one::<String>("rp-name")
            .cloned()
            .unwrap_or_else(|| "WebAuthn Firewall".to_string()),
        session_key,
        dsn: matches.get_one::<String>("dsn").cloned(),
        tls_cert: matches
            .get_one::<String>("tls-cert")
            .cloned()
            .context("missing required argument: --tls-cert")?,
        tls_key: matches
            .get_one::<String>("tls-key")
            .cloned()
            .context("missing required argument: --tls-key")?,
        default_input,
        insecure_backend: matches.get_flag("insecure-backend"),
    }))
}
