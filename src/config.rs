//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `RTUN_TOKEN`, `RTUN_SERVER_ADDR`,
//!    `RTUN_BIND_ADDR`
//! 2. **Config file**: path via `--config <path>`, or `rtun.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! One file serves both roles; the server reads `[server]`, the client reads
//! `[client]` and `[[tunnels]]`.
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [auth]
//! token = "shared-secret"
//! additional_scopes = ["heartbeats", "new_work_conns"]
//! max_clock_skew_secs = 900
//!
//! [server]
//! bind_addr = "0.0.0.0:7000"
//! max_pool_count = 5
//! heartbeat_timeout_secs = 90
//! user_conn_timeout_secs = 10
//! proxy_bind_addr = "0.0.0.0"
//! allow_ports = "2000-3000,3001,3003"
//! status_addr = "127.0.0.1:7500"   # optional
//!
//! [client]
//! server_addr = "relay.example.com:7000"
//! pool_count = 1
//! heartbeat_interval_secs = 30
//! heartbeat_timeout_secs = 90
//!
//! [[tunnels]]
//! name = "ssh"
//! kind = "tcp"
//! local_ip = "127.0.0.1"
//! local_port = 22
//! remote_port = 6000
//! health_check = { kind = "tcp", interval_secs = 10, timeout_secs = 3, max_failed = 3 }
//! ```

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::AuthScope;
use crate::msg::{TunnelKind, DEFAULT_MAX_MSG_LEN};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Authentication settings shared by both ends.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared token. Override with `RTUN_TOKEN`.
    #[serde(default)]
    pub token: String,
    /// Messages besides `Login` that carry a privilege key.
    #[serde(default)]
    pub additional_scopes: Vec<AuthScope>,
    /// Accepted difference between client and server clocks (default 900, 0 = unchecked).
    #[serde(default = "default_max_clock_skew")]
    pub max_clock_skew_secs: u64,
}

/// Relay (public side) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Control/work connection listener (default `0.0.0.0:7000`).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Upper bound on the pool size a client may ask for (default 5).
    #[serde(default = "default_max_pool_count")]
    pub max_pool_count: u32,
    /// Extra idle work connections accepted above the pool target (default 10).
    #[serde(default = "default_pool_slack")]
    pub pool_slack: usize,
    /// Seconds without client traffic before a session is torn down
    /// (default 90, 0 disables the check). Must be 0 on a relay serving
    /// clients that run with `heartbeat_interval_secs = 0`.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds a user connection waits for a work connection (default 10).
    #[serde(default = "default_user_conn_timeout")]
    pub user_conn_timeout_secs: u64,
    /// Largest accepted control frame payload in bytes (default 10240).
    #[serde(default = "default_max_msg_len")]
    pub max_msg_len: u64,
    /// Interface public tunnel listeners bind on (default `0.0.0.0`).
    #[serde(default = "default_proxy_bind_addr")]
    pub proxy_bind_addr: String,
    /// Public ports tunnels may bind, e.g. `"2000-3000,3001"`. Empty allows any.
    #[serde(default)]
    pub allow_ports: String,
    /// Optional read-only status HTTP listener.
    #[serde(default)]
    pub status_addr: Option<String>,
}

/// Private-side settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Relay address (default `127.0.0.1:7000`). Override with `RTUN_SERVER_ADDR`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// User name sent at login, informational.
    #[serde(default)]
    pub user: String,
    /// Idle work connections to keep on the server (default 1).
    #[serde(default = "default_pool_count")]
    pub pool_count: u32,
    /// Seconds between pings (default 30, 0 disables heartbeats). Disabling
    /// needs a relay with `heartbeat_timeout_secs = 0` too, or the relay drops
    /// the idle session.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds without a pong before the control connection is declared dead (default 90).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Connect timeout for control and work connections (default 10).
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// Exit if the very first login fails (default true).
    #[serde(default = "default_login_fail_exit")]
    pub login_fail_exit: bool,
}

/// One configured tunnel: shared fields plus the kind-specific variant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelConfig {
    #[serde(flatten)]
    pub base: TunnelBase,
    #[serde(flatten)]
    pub kind: KindConfig,
}

/// Fields every tunnel kind carries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelBase {
    pub name: String,
    #[serde(default = "default_local_ip")]
    pub local_ip: String,
    pub local_port: u16,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

/// Kind-specific tunnel fields, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum KindConfig {
    Tcp {
        #[serde(default)]
        remote_port: u16,
    },
    Udp {
        #[serde(default)]
        remote_port: u16,
    },
    Http {
        #[serde(default)]
        custom_domains: Vec<String>,
        #[serde(default)]
        subdomain: String,
    },
    Https {
        #[serde(default)]
        custom_domains: Vec<String>,
        #[serde(default)]
        subdomain: String,
    },
    Stcp {
        #[serde(default)]
        secret_key: String,
    },
    Xtcp {
        #[serde(default)]
        secret_key: String,
    },
}

impl KindConfig {
    pub fn kind(&self) -> TunnelKind {
        match self {
            Self::Tcp { .. } => TunnelKind::Tcp,
            Self::Udp { .. } => TunnelKind::Udp,
            Self::Http { .. } => TunnelKind::Http,
            Self::Https { .. } => TunnelKind::Https,
            Self::Stcp { .. } => TunnelKind::Stcp,
            Self::Xtcp { .. } => TunnelKind::Xtcp,
        }
    }
}

impl TunnelConfig {
    /// A plain TCP tunnel, mostly for tests and programmatic use.
    pub fn tcp(name: &str, local_port: u16, remote_port: u16) -> Self {
        Self {
            base: TunnelBase {
                name: name.to_string(),
                local_ip: default_local_ip(),
                local_port,
                use_encryption: false,
                use_compression: false,
                health_check: None,
            },
            kind: KindConfig::Tcp { remote_port },
        }
    }

    pub fn name(&self) -> &str {
        &self.base.name
    }
}

/// Kind of check used by a tunnel health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckKind {
    #[default]
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub kind: HealthCheckKind,
    /// Seconds between checks (default 10).
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Seconds before a check counts as failed (default 3).
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    /// Consecutive failures before the tunnel is withdrawn (default 1).
    #[serde(default = "default_health_max_failed")]
    pub max_failed: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clock_skew() -> u64 {
    900
}
fn default_bind_addr() -> String {
    "0.0.0.0:7000".to_string()
}
fn default_proxy_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_max_pool_count() -> u32 {
    5
}
fn default_pool_slack() -> usize {
    10
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_user_conn_timeout() -> u64 {
    10
}
fn default_max_msg_len() -> u64 {
    DEFAULT_MAX_MSG_LEN
}
fn default_server_addr() -> String {
    "127.0.0.1:7000".to_string()
}
fn default_pool_count() -> u32 {
    1
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_dial_timeout() -> u64 {
    10
}
fn default_login_fail_exit() -> bool {
    true
}
fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_health_interval() -> u64 {
    10
}
fn default_health_timeout() -> u64 {
    3
}
fn default_health_max_failed() -> u32 {
    1
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            additional_scopes: Vec::new(),
            max_clock_skew_secs: default_max_clock_skew(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_pool_count: default_max_pool_count(),
            pool_slack: default_pool_slack(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            user_conn_timeout_secs: default_user_conn_timeout(),
            max_msg_len: default_max_msg_len(),
            proxy_bind_addr: default_proxy_bind_addr(),
            allow_ports: String::new(),
            status_addr: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            user: String::new(),
            pool_count: default_pool_count(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            dial_timeout_secs: default_dial_timeout(),
            login_fail_exit: default_login_fail_exit(),
        }
    }
}

impl ServerConfig {
    /// `None` when the relay does not check client liveness.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout_secs > 0).then(|| Duration::from_secs(self.heartbeat_timeout_secs))
    }

    pub fn user_conn_timeout(&self) -> Duration {
        Duration::from_secs(self.user_conn_timeout_secs)
    }
}

impl ClientConfig {
    /// `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `rtun.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("rtun.toml").exists() => Self::from_file("rtun.toml")?,
            None => Config::default(),
        };

        if let Ok(token) = std::env::var("RTUN_TOKEN") {
            config.auth.token = token;
        }
        if let Ok(addr) = std::env::var("RTUN_SERVER_ADDR") {
            config.client.server_addr = addr;
        }
        if let Ok(addr) = std::env::var("RTUN_BIND_ADDR") {
            config.server.bind_addr = addr;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Reject settings that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.heartbeat_interval_secs > 0
            && self.client.heartbeat_timeout_secs <= self.client.heartbeat_interval_secs
        {
            return Err(ConfigError::Invalid(format!(
                "client.heartbeat_timeout_secs ({}) must be greater than heartbeat_interval_secs ({})",
                self.client.heartbeat_timeout_secs, self.client.heartbeat_interval_secs
            )));
        }
        parse_port_ranges(&self.server.allow_ports).map_err(ConfigError::Invalid)?;

        let mut names = HashSet::new();
        for tunnel in &self.tunnels {
            if tunnel.base.name.is_empty() {
                return Err(ConfigError::Invalid("tunnel name must not be empty".to_string()));
            }
            if !names.insert(tunnel.base.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tunnel name '{}'",
                    tunnel.base.name
                )));
            }
        }
        Ok(())
    }
}

/// Parse `"2000-3000,3001"` into inclusive ranges. Empty input yields no ranges.
pub fn parse_port_ranges(list: &str) -> Result<Vec<RangeInclusive<u16>>, String> {
    let mut ranges = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parse = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid port '{s}' in allow_ports: {e}"))
        };
        let range = match part.split_once('-') {
            Some((lo, hi)) => parse(lo)?..=parse(hi)?,
            None => {
                let port = parse(part)?;
                port..=port
            }
        };
        if range.is_empty() {
            return Err(format!("empty port range '{part}' in allow_ports"));
        }
        ranges.push(range);
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.server.max_msg_len, 10 * 1024);
        assert_eq!(config.client.pool_count, 1);
        assert_eq!(config.client.heartbeat_interval(), Some(Duration::from_secs(30)));
        assert!(config.tunnels.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_tunnels_with_kinds() {
        let config = Config::from_toml(
            r#"
            [auth]
            token = "t"
            additional_scopes = ["heartbeats"]

            [[tunnels]]
            name = "ssh"
            kind = "tcp"
            local_port = 22
            remote_port = 6000
            health_check = { kind = "tcp", interval_secs = 5 }

            [[tunnels]]
            name = "site"
            kind = "http"
            local_port = 8080
            custom_domains = ["www.example.com"]
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.additional_scopes, vec![AuthScope::Heartbeats]);
        assert_eq!(config.tunnels.len(), 2);

        let ssh = &config.tunnels[0];
        assert_eq!(ssh.name(), "ssh");
        assert_eq!(ssh.base.local_ip, "127.0.0.1");
        assert_eq!(ssh.kind, KindConfig::Tcp { remote_port: 6000 });
        let hc = ssh.base.health_check.as_ref().unwrap();
        assert_eq!(hc.interval_secs, 5);
        assert_eq!(hc.timeout_secs, 3);

        let site = &config.tunnels[1];
        assert_eq!(site.kind.kind(), TunnelKind::Http);
        assert!(matches!(&site.kind, KindConfig::Http { custom_domains, .. }
            if custom_domains == &vec!["www.example.com".to_string()]));
    }

    #[test]
    fn test_validate_heartbeat_timeout_must_exceed_interval() {
        let mut config = Config::default();
        config.client.heartbeat_interval_secs = 30;
        config.client.heartbeat_timeout_secs = 30;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.client.heartbeat_interval_secs = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_server_heartbeat_timeout_disables_check() {
        let mut config = Config::default();
        assert_eq!(config.server.heartbeat_timeout(), Some(Duration::from_secs(90)));

        config.server.heartbeat_timeout_secs = 0;
        config.client.heartbeat_interval_secs = 0;
        assert!(config.validate().is_ok());
        assert_eq!(config.server.heartbeat_timeout(), None);
    }

    #[test]
    fn test_validate_duplicate_tunnel_names() {
        let config = Config {
            tunnels: vec![TunnelConfig::tcp("web", 80, 0), TunnelConfig::tcp("web", 81, 0)],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("web")));
    }

    #[test]
    fn test_parse_port_ranges() {
        let ranges = parse_port_ranges("2000-3000, 3001,").unwrap();
        assert_eq!(ranges, vec![2000..=3000, 3001..=3001]);
        assert!(parse_port_ranges("").unwrap().is_empty());
        assert!(parse_port_ranges("3000-2000").is_err());
        assert!(parse_port_ranges("http").is_err());
        assert!(parse_port_ranges("70000").is_err());
    }
}
