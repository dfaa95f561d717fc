//! Relay configuration.
//!
//! Everything is read once from the environment at startup. Empty variables
//! count as unset.

use std::net::{IpAddr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tlsrelay_portmap::{parse_port_spec, PortMappings, PortSpecError};

pub const TARGET_VAR: &str = "TLSPROXY_TARGET";
pub const PORTS_VAR: &str = "TLSPROXY_PORTS";
pub const CERT_FILE_VAR: &str = "TLSPROXY_CERT_FILE";
pub const KEY_FILE_VAR: &str = "TLSPROXY_KEY_FILE";
pub const DEBUG_VAR: &str = "TLSPROXY_DEBUG";
pub const LISTEN_HOST_VAR: &str = "TLSPROXY_LISTEN_HOST";
pub const LOG_LEVEL_VAR: &str = "TLSPROXY_LOG_LEVEL";

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing or empty {0} env var")]
    MissingVar(&'static str),

    #[error("invalid TLSPROXY_PORTS: {0}")]
    InvalidPortSpec(#[from] PortSpecError),

    #[error("invalid TLSPROXY_LISTEN_HOST '{value}': expected an IP address")]
    InvalidListenHost { value: String },
}

/// Immutable values every listener and session reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Host dialed for every relayed connection.
    pub backend_host: String,
    /// Verbose per-connection logging.
    pub debug: bool,
}

impl RelaySettings {
    pub fn new(backend_host: impl Into<String>, debug: bool) -> Self {
        Self {
            backend_host: backend_host.into(),
            debug,
        }
    }

    /// `host:port` string dialed for a backend port.
    pub fn backend_addr(&self, backend_port: u16) -> String {
        if self.backend_host.contains(':') && !self.backend_host.starts_with('[') {
            // Bare IPv6 literal.
            format!("[{}]:{}", self.backend_host, backend_port)
        } else {
            format!("{}:{}", self.backend_host, backend_port)
        }
    }
}

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend host.
    pub target: String,

    /// Resolved listen/backend port pairs.
    pub mappings: PortMappings,

    /// PEM certificate chain.
    pub cert_file: PathBuf,

    /// PEM private key matching `cert_file`.
    pub key_file: PathBuf,

    /// Verbose connection and I/O error logging.
    pub debug: bool,

    /// Address listeners bind on. Defaults to `::`, which is dual-stack on
    /// Linux.
    pub listen_host: IpAddr,

    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Optional variables that were missing and fell back to a default.
    pub defaulted: Vec<&'static str>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let debug = var(DEBUG_VAR).is_some_and(|v| is_truthy(&v));

        let target = var(TARGET_VAR).ok_or(ConfigError::MissingVar(TARGET_VAR))?;

        let ports = var(PORTS_VAR).ok_or(ConfigError::MissingVar(PORTS_VAR))?;
        let mappings = parse_port_spec(&ports)?;

        let mut defaulted = Vec::new();
        let mut path_or_default = |key: &'static str, default: &str| match var(key) {
            Some(value) => PathBuf::from(value),
            None => {
                defaulted.push(key);
                PathBuf::from("certificates").join(default)
            }
        };
        let cert_file = path_or_default(CERT_FILE_VAR, "server.crt");
        let key_file = path_or_default(KEY_FILE_VAR, "server.key");

        let listen_host = match var(LISTEN_HOST_VAR) {
            Some(value) => value
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidListenHost { value })?,
            None => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };

        let log_level = var(LOG_LEVEL_VAR)
            .unwrap_or_else(|| if debug { "debug" } else { "info" }.to_string());

        Ok(Self {
            target,
            mappings,
            cert_file,
            key_file,
            debug,
            listen_host,
            log_level,
            defaulted,
        })
    }

    /// Settings shared by every listener and session.
    pub fn relay_settings(&self) -> Arc<RelaySettings> {
        Arc::new(RelaySettings::new(self.target.clone(), self.debug))
    }
}

/// Whether a flag value turns an option on.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "enable" | "on"
    )
}
