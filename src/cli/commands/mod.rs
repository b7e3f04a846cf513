use clap::{
    builder::{
        styling::{AnsiColor, Effects, Styles},
        ValueParser,
    },
    Arg, ArgAction, ColorChoice, Command,
};

pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            // Successfully parsed as a number
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

// "host=url" pairs for --backend-target.
pub fn validator_backend_target() -> ValueParser {
    ValueParser::from(move |target: &str| -> std::result::Result<String, String> {
        let Some((host, url)) = target.split_once('=') else {
            return Err(
                "expected host=url, example: app.internal:3000=http://app.internal:3000"
                    .to_string(),
            );
        };
        if host.is_empty() {
            return Err("backend target host must not be empty".to_string());
        }
        url::Url::parse(url).map_err(|err| format!("invalid backend target URL: {err}"))?;
        Ok(target.to_string())
    })
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("webauthn-firewall")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8081")
                .env("FIREWALL_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("frontend-origin")
                .long("frontend-origin")
                .help("Origin the browser frontend is served from, example: https://localhost:8081")
                .env("FIREWALL_FRONTEND_ORIGIN")
                .required(true),
        )
        .arg(
            Arg::new("backend-target")
                .long("backend-target")
                .help("host=url pair to proxy for, repeatable")
                .env("FIREWALL_BACKEND_TARGET")
                .value_delimiter(',')
                .action(ArgAction::Append)
                .value_parser(validator_backend_target())
                .required(true),
        )
        .arg(
            Arg::new("context-base")
                .long("context-base")
                .help("Backend base URL for server context lookups (default: first backend target)")
                .env("FIREWALL_CONTEXT_BASE"),
        )
        .arg(
            Arg::new("login-path")
                .long("login-path")
                .help("Backend login path gated by the login ceremony")
                .default_value("/user/login")
                .env("FIREWALL_LOGIN_PATH"),
        )
        .arg(
            Arg::new("webauthn-prefix")
                .long("webauthn-prefix")
                .help("Path prefix for the ceremony endpoints")
                .default_value("/webauthn")
                .env("FIREWALL_WEBAUTHN_PREFIX"),
        )
        .arg(
            Arg::new("rp-id")
                .long("rp-id")
                .help("Relying party id, normally the firewall's public hostname")
                .env("FIREWALL_RP_ID")
                .required(true),
        )
        .arg(
            Arg::new("rp-name")
                .long("rp-name")
                .help("Relying party display name")
                .default_value("WebAuthn Firewall")
                .env("FIREWALL_RP_NAME"),
        )
        .arg(
            Arg::new("session-key")
                .long("session-key")
                .help("Hex-encoded ceremony session key, at least 32 bytes once decoded")
                .env("FIREWALL_SESSION_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Postgres connection string for credential records (in-memory store when absent)")
                .env("FIREWALL_DSN"),
        )
        .arg(
            Arg::new("tls-cert")
                .long("tls-cert")
                .help("PEM certificate chain for the listener")
                .env("FIREWALL_TLS_CERT")
                .required(true),
        )
        .arg(
            Arg::new("tls-key")
                .long("tls-key")
                .help("PEM private key for the listener")
                .env("FIREWALL_TLS_KEY")
                .required(true),
        )
        .arg(
            Arg::new("json-input")
                .long("json-input")
                .help("Read default inputs from JSON bodies instead of form fields")
                .env("FIREWALL_JSON_INPUT")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("insecure-backend")
                .long("insecure-backend")
                .help("Accept self-signed backend certificates (development only)")
                .env("FIREWALL_INSECURE_BACKEND")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("FIREWALL_LOG_LEVEL")
                .global(true)
                .action(ArgAction::Count)
                .value_parser(validator_log_level()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "webauthn-firewall",
            "--frontend-origin",
            "https://localhost:8081",
            "--backend-target",
            "app.internal:3000=http://app.internal:3000",
            "--rp-id",
            "localhost",
            "--session-key",
            "deadbeef",
            "--tls-cert",
            "/etc/firewall/cert.pem",
            "--tls-key",
            "/etc/firewall/key.pem",
        ]
    }

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "webauthn-firewall");
        assert_eq!(
            command.get_version().unwrap().to_string(),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_defaults() {
        let matches = new().get_matches_from(base_args());

        assert_eq!(matches.get_one::<u16>("port").copied(), Some(8081));
        assert_eq!(
            matches.get_one::<String>("login-path").map(String::as_str),
            Some("/user/login")
        );
        assert_eq!(
            matches
                .get_one::<String>("webauthn-prefix")
                .map(String::as_str),
            Some("/webauthn")
        );
        assert!(!matches.get_flag("json-input"));
        assert!(!matches.get_flag("insecure-backend"));
    }

    #[test]
    fn test_repeatable_backend_targets() {
        let mut args = base_args();
        args.extend([
            "--backend-target",
            "other.internal:3000=http://other.internal:3000",
        ]);
        let matches = new().get_matches_from(args);

        let targets: Vec<_> = matches
            .get_many::<String>("backend-target")
            .unwrap()
            .collect();
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_invalid_backend_target_rejected() {
        let mut args = base_args();
        args.extend(["--backend-target", "missing-separator"]);
        assert!(new().try_get_matches_from(args).is_err());
    }

    #[test]
    fn test_missing_session_key_rejected() {
        let args: Vec<_> = base_args()
            .into_iter()
            .filter(|arg| *arg != "--session-key" && *arg != "deadbeef")
            .collect();
        temp_env::with_var("FIREWALL_SESSION_KEY", None::<&str>, || {
            assert!(new().try_get_matches_from(args.clone()).is_err());
        });
    }

    #[test]
    fn test_check_env() {
        temp_env::with_vars(
            [
                ("FIREWALL_PORT", Some("8443")),
                ("FIREWALL_FRONTEND_ORIGIN", Some("https://localhost:8081")),
                (
                    "FIREWALL_BACKEND_TARGET",
                    Some("app.internal:3000=http://app.internal:3000"),
                ),
                ("FIREWALL_RP_ID", Some("localhost")),
                ("FIREWALL_SESSION_KEY", Some("deadbeef")),
                ("FIREWALL_TLS_CERT", Some("/etc/firewall/cert.pem")),
                ("FIREWALL_TLS_KEY", Some("/etc/firewall/key.pem")),
                ("FIREWALL_LOG_LEVEL", Some("info")),
            ],
            || {
                let matches = new().get_matches_from(vec!["webauthn-firewall"]);
                assert_eq!(matches.get_one::<u16>("port").copied(), Some(8443));
                assert_eq!(
                    matches.get_one::<String>("rp-id").map(String::as_str),
                    Some("localhost")
                );
                assert_eq!(matches.get_one::<u8>("verbosity").copied(), Some(2));
            },
        );
    }

    #[test]
    fn test_check_log_level_env() {
        // loop cover all possible value_parse
        let levels = vec!["error", "warn", "info", "debug", "trace"];
        for (index, &level) in levels.iter().enumerate() {
            temp_env::with_vars([("FIREWALL_LOG_LEVEL", Some(level))], || {
                let matches = new().get_matches_from(base_args());
                assert_eq!(
                    matches.get_one::<u8>("verbosity").copied(),
                    Some(u8::try_from(index).unwrap())
                );
            });
        }
    }
}
