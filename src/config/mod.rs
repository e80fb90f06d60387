//! Connection options.
//!
//! Options arrive either from a connection URL's query string or from a
//! `toml` profile file. Both paths produce the same `ConnectionOptions`
//! struct; URL keys use the camelCase names consumers know.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read profile file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse profile: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Unknown option '{0}'")]
    UnknownOption(String),
    #[error("Invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },
}

/// TLS requirements for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Plain TCP
    #[default]
    Disable,
    /// TLS, certificate checked against the trust configuration
    Require,
    /// TLS, any server certificate accepted
    Trust,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionOptions {
    pub user: String,
    pub password: Option<String>,

    /// Allow several statements in one execute, separated by semicolons
    pub allow_multi_queries: bool,
    /// Negotiate the compressed protocol
    pub use_compression: bool,
    /// Prepare statements server-side (binary protocol)
    pub use_server_prep_stmts: bool,
    /// Rewrite simple batched INSERTs into one multi-values statement
    pub rewrite_batched_statements: bool,
    /// Send batches through the bulk protocol when the server supports it
    pub use_batch_multi_send: bool,
    /// Use server-side cursors driven by the statement fetch size
    pub use_cursor_fetch: bool,
    /// Answer LOCAL INFILE requests by streaming the named file
    pub allow_local_infile: bool,

    /// Credential source: "password" (URL credentials) or "gssapi"
    pub credential_type: String,
    /// PEM file holding the server RSA public key for sha256_password
    pub server_rsa_public_key_file: Option<String>,
    /// Ask the server for its RSA public key when no file is configured
    pub allow_public_key_retrieval: bool,
    /// Character encoding applied to the password before hashing
    pub password_character_encoding: String,

    pub ssl_mode: SslMode,
    /// PEM file holding the pinned server certificate
    pub server_ssl_cert: Option<String>,

    /// Follow server-issued redirects during authentication
    pub enable_redirect: bool,

    /// Socket read timeout; zero disables the watchdog
    pub socket_timeout_ms: u64,
    pub connect_timeout_ms: u64,

    /// Raise on silent data truncation instead of warning
    pub jdbc_compliant_truncation: bool,

    /// Session max_allowed_packet seed, refined from the server after connect
    pub max_allowed_packet: usize,

    /// Character budget for batch error messages before `...` elision
    pub batch_error_message_cap: usize,

    /// Blacklist duration for failed hosts
    pub blacklist_timeout_ms: u64,
}

fn default_credential_type() -> String {
    "password".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_max_allowed_packet() -> usize {
    16 * 1024 * 1024
}

fn default_batch_error_message_cap() -> usize {
    1024
}

fn default_blacklist_timeout_ms() -> u64 {
    60_000
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: None,
            allow_multi_queries: false,
            use_compression: false,
            use_server_prep_stmts: true,
            rewrite_batched_statements: false,
            use_batch_multi_send: true,
            use_cursor_fetch: false,
            allow_local_infile: false,
            credential_type: default_credential_type(),
            server_rsa_public_key_file: None,
            allow_public_key_retrieval: false,
            password_character_encoding: String::new(),
            ssl_mode: SslMode::Disable,
            server_ssl_cert: None,
            enable_redirect: false,
            socket_timeout_ms: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            jdbc_compliant_truncation: true,
            max_allowed_packet: default_max_allowed_packet(),
            batch_error_message_cap: default_batch_error_message_cap(),
            blacklist_timeout_ms: default_blacklist_timeout_ms(),
        }
    }
}

impl ConnectionOptions {
    /// Load from a toml profile file
    pub fn from_profile<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let options: ConnectionOptions = toml::from_str(&content)?;
        Ok(options)
    }

    /// Apply one URL query pair. Unknown keys are rejected at parse time.
    pub fn apply_url_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let parse_bool = |v: &str| match v {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(invalid()),
        };

        match key {
            "user" => self.user = value.to_string(),
            "password" => self.password = Some(value.to_string()),
            "allowMultiQueries" => self.allow_multi_queries = parse_bool(value)?,
            "useCompression" => self.use_compression = parse_bool(value)?,
            "useServerPrepStmts" => self.use_server_prep_stmts = parse_bool(value)?,
            "rewriteBatchedStatements" => self.rewrite_batched_statements = parse_bool(value)?,
            "useBatchMultiSend" => self.use_batch_multi_send = parse_bool(value)?,
            "useCursorFetch" => self.use_cursor_fetch = parse_bool(value)?,
            "allowLocalInfile" => self.allow_local_infile = parse_bool(value)?,
            "credentialType" => self.credential_type = value.to_string(),
            "serverRsaPublicKeyFile" => {
                self.server_rsa_public_key_file = Some(value.to_string())
            }
            "allowPublicKeyRetrieval" => self.allow_public_key_retrieval = parse_bool(value)?,
            "passwordCharacterEncoding" => {
                self.password_character_encoding = value.to_string()
            }
            "sslMode" => {
                self.ssl_mode = match value {
                    "disable" | "disabled" => SslMode::Disable,
                    "require" | "verify-ca" | "verify-full" => SslMode::Require,
                    "trust" => SslMode::Trust,
                    _ => return Err(invalid()),
                }
            }
            "useSsl" | "useSSL" => {
                if parse_bool(value)? {
                    if self.ssl_mode == SslMode::Disable {
                        self.ssl_mode = SslMode::Require;
                    }
                } else {
                    self.ssl_mode = SslMode::Disable;
                }
            }
            "trustServerCertificate" => {
                if parse_bool(value)? {
                    self.ssl_mode = SslMode::Trust;
                }
            }
            "serverSslCert" => self.server_ssl_cert = Some(value.to_string()),
            "enableRedirect" => self.enable_redirect = parse_bool(value)?,
            "socketTimeout" => {
                self.socket_timeout_ms = value.parse().map_err(|_| invalid())?
            }
            "connectTimeout" => {
                self.connect_timeout_ms = value.parse().map_err(|_| invalid())?
            }
            "jdbcCompliantTruncation" => {
                self.jdbc_compliant_truncation = parse_bool(value)?
            }
            "maxAllowedPacket" => {
                self.max_allowed_packet = value.parse().map_err(|_| invalid())?
            }
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        if self.socket_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.socket_timeout_ms))
        }
    }

    pub fn blacklist_timeout(&self) -> Duration {
        Duration::from_millis(self.blacklist_timeout_ms)
    }

    pub fn ssl_enabled(&self) -> bool {
        self.ssl_mode != SslMode::Disable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_behavior() {
        let options = ConnectionOptions::default();
        assert!(!options.allow_multi_queries);
        assert!(options.use_server_prep_stmts);
        assert!(options.use_batch_multi_send);
        assert!(!options.rewrite_batched_statements);
        assert_eq!(options.ssl_mode, SslMode::Disable);
        assert_eq!(options.batch_error_message_cap, 1024);
        assert!(options.socket_timeout().is_none());
    }

    #[test]
    fn url_options_apply() {
        let mut options = ConnectionOptions::default();
        options.apply_url_option("allowMultiQueries", "true").unwrap();
        options.apply_url_option("useCursorFetch", "1").unwrap();
        options.apply_url_option("socketTimeout", "2500").unwrap();
        options
            .apply_url_option("trustServerCertificate", "true")
            .unwrap();

        assert!(options.allow_multi_queries);
        assert!(options.use_cursor_fetch);
        assert_eq!(
            options.socket_timeout(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(options.ssl_mode, SslMode::Trust);
    }

    #[test]
    fn unknown_option_is_rejected() {
        let mut options = ConnectionOptions::default();
        let err = options.apply_url_option("noSuchOption", "1").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption(_)));
    }

    #[test]
    fn bad_bool_is_rejected() {
        let mut options = ConnectionOptions::default();
        let err = options
            .apply_url_option("useCompression", "maybe")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn use_ssl_does_not_downgrade_trust() {
        let mut options = ConnectionOptions::default();
        options
            .apply_url_option("trustServerCertificate", "true")
            .unwrap();
        options.apply_url_option("useSsl", "true").unwrap();
        assert_eq!(options.ssl_mode, SslMode::Trust);
    }

    #[test]
    fn profile_roundtrip() {
        let profile = r#"
            user = "app"
            allow_multi_queries = true
            socket_timeout_ms = 1500
            ssl_mode = "require"
        "#;
        let options: ConnectionOptions = toml::from_str(profile).unwrap();
        assert_eq!(options.user, "app");
        assert!(options.allow_multi_queries);
        assert_eq!(options.socket_timeout_ms, 1500);
        assert_eq!(options.ssl_mode, SslMode::Require);
    }
}
