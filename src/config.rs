//! Configuration loader (§4.9, ambient): env-sourced settings, parsed once
//! into an immutable record and published through a process-wide handle.
//!
//! Required keys (`HOST`, `HOST_KEY`) missing at load time are a fatal,
//! immediate panic naming the key — configuration errors are not
//! recoverable and must not surface as a `Result` deep in a request path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::auth::AuthPolicy;

mod env {
    pub const HOST: &str = "HOST";
    pub const WEB_ENDPOINT: &str = "WEB_ENDPOINT";
    pub const SSL_WEB_ENDPOINT: &str = "SSL_WEB_ENDPOINT";
    pub const CERT_FILE: &str = "CERT_FILE";
    pub const KEY_FILE: &str = "KEY_FILE";
    pub const SSH_ENDPOINT: &str = "SSH_ENDPOINT";
    pub const HOST_KEY: &str = "HOST_KEY";
    pub const PUBLIC_KEY_WHITELIST: &str = "PUBLIC_KEY_WHITELIST";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const DEBUG: &str = "DEBUG";
    pub const WEB_HIDE_INFO: &str = "WEB_HIDE_INFO";
    pub const SSL_REDIRECT: &str = "SSL_REDIRECT";
}

const DEFAULT_WEB_ENDPOINT: &str = "0.0.0.0:80";
const DEFAULT_SSL_WEB_ENDPOINT: &str = "0.0.0.0:443";
const DEFAULT_SSH_ENDPOINT: &str = "0.0.0.0:22";
const DEFAULT_LOG_LEVEL: &str = "info";

static CONFIG: OnceLock<Config> = OnceLock::new();

/// TLS certificate/key paths for the HTTPS web listener, present only when
/// both `CERT_FILE` and `KEY_FILE` are configured.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// The parsed, validated form of every key in the configuration table (§6).
/// Constructed once at startup, immutable thereafter, shared by reference
/// across every task.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub web_endpoint: SocketAddr,
    pub ssl_web_endpoint: SocketAddr,
    pub tls: Option<TlsConfig>,
    pub ssh_endpoint: SocketAddr,
    pub host_key: PathBuf,
    pub public_key_whitelist: String,
    pub log_level: String,
    pub debug: bool,
    pub web_hide_info: bool,
    pub ssl_redirect: bool,
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn required(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_endpoint(key: &str, default: &str) -> SocketAddr {
    let raw = optional(key, default);
    raw.parse()
        .unwrap_or_else(|e| panic!("{key}=\"{raw}\" is not a valid socket address: {e}"))
}

impl Config {
    fn load() -> Self {
        // Load a `.env` file if present, ahead of every other read, so local
        // development has the same configuration surface as production.
        let _ = dotenvy::dotenv();

        let host = required(env::HOST);
        let host_key = PathBuf::from(required(env::HOST_KEY));

        let cert_file = std::env::var(env::CERT_FILE).ok();
        let key_file = std::env::var(env::KEY_FILE).ok();
        let tls = match (cert_file, key_file) {
            (Some(cert_file), Some(key_file)) => Some(TlsConfig {
                cert_file: PathBuf::from(cert_file),
                key_file: PathBuf::from(key_file),
            }),
            _ => None,
        };

        Self {
            host,
            web_endpoint: parse_endpoint(env::WEB_ENDPOINT, DEFAULT_WEB_ENDPOINT),
            ssl_web_endpoint: parse_endpoint(env::SSL_WEB_ENDPOINT, DEFAULT_SSL_WEB_ENDPOINT),
            tls,
            ssh_endpoint: parse_endpoint(env::SSH_ENDPOINT, DEFAULT_SSH_ENDPOINT),
            host_key,
            public_key_whitelist: optional(env::PUBLIC_KEY_WHITELIST, ""),
            log_level: optional(env::LOG_LEVEL, DEFAULT_LOG_LEVEL),
            debug: parse_bool(&optional(env::DEBUG, "false")),
            web_hide_info: parse_bool(&optional(env::WEB_HIDE_INFO, "false")),
            ssl_redirect: parse_bool(&optional(env::SSL_REDIRECT, "false")),
        }
    }

    /// Builds the auth policy named in the loaded `PUBLIC_KEY_WHITELIST`.
    pub fn auth_policy(&self) -> AuthPolicy {
        AuthPolicy::from_whitelist(&self.public_key_whitelist)
    }

    /// The effective log filter: `DEBUG=true` always wins over `LOG_LEVEL`.
    pub fn effective_log_filter(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}

/// Initializes configuration. Must be called once at startup, before any
/// other component reads the environment.
pub fn init() -> &'static Config {
    CONFIG.get_or_init(Config::load)
}

/// Returns the global configuration. Panics if [`init`] has not run yet.
pub fn get() -> &'static Config {
    CONFIG.get().expect("config::init() must run before config::get()")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_truthy_spellings() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            assert!(parse_bool(v), "{v} should be truthy");
        }
        for v in ["0", "false", "", "no"] {
            assert!(!parse_bool(v), "{v} should be falsy");
        }
    }

    #[test]
    fn parse_endpoint_uses_default_when_unset() {
        assert_eq!(
            parse_endpoint("TUNNELGATE_TEST_UNSET_ENDPOINT", DEFAULT_WEB_ENDPOINT),
            DEFAULT_WEB_ENDPOINT.parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    #[should_panic(expected = "not a valid socket address")]
    fn parse_endpoint_panics_on_garbage() {
        std::env::set_var("TUNNELGATE_TEST_BAD_ENDPOINT", "not-an-address");
        parse_endpoint("TUNNELGATE_TEST_BAD_ENDPOINT", DEFAULT_WEB_ENDPOINT);
    }
}
