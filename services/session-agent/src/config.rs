//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The session token is loaded from the SESSION_TOKEN env var or
//! token_file, never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transport::HeaderInjection;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Remote API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Static headers added to every outbound request
    #[serde(default)]
    pub headers: Vec<HeaderRule>,
}

/// Header to inject into outbound API requests
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderRule {
    pub name: String,
    pub value: String,
}

/// Realtime channel settings
#[derive(Debug, Deserialize)]
pub struct RealtimeConfig {
    pub url: String,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Session behaviour
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Realtime identity; looked up from the API when absent
    #[serde(default)]
    pub user_id: Option<String>,
    /// Email offered as the default at the re-auth prompt
    #[serde(default)]
    pub email: Option<String>,
    /// Path to a file containing a session token (alternative to SESSION_TOKEN)
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
    #[serde(default = "default_restriction_window")]
    pub plan_restriction_window_secs: u64,
    #[serde(default = "default_max_login_attempts")]
    pub max_login_attempts: u32,
}

/// Health/metrics listener
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_timeout() -> u64 {
    30
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_restriction_window() -> u64 {
    5
}

fn default_max_login_attempts() -> u32 {
    session_gate::DEFAULT_MAX_LOGIN_ATTEMPTS
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            email: None,
            token_file: None,
            token: None,
            plan_restriction_window_secs: default_restriction_window(),
            max_login_attempts: default_max_login_attempts(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Token resolution order:
    /// 1. SESSION_TOKEN env var
    /// 2. token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(token) = std::env::var("SESSION_TOKEN") {
            let token = Secret::new(token);
            if !token.is_blank() {
                config.session.token = Some(token);
            }
        } else if let Some(ref token_file) = config.session.token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.session.token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "api.base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }
        if !self.realtime.url.starts_with("ws://") && !self.realtime.url.starts_with("wss://") {
            return Err(common::Error::Config(format!(
                "realtime.url must start with ws:// or wss://, got: {}",
                self.realtime.url
            )));
        }
        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "api.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.realtime.reconnect_delay_ms == 0 {
            return Err(common::Error::Config(
                "realtime.reconnect_delay_ms must be greater than 0".into(),
            ));
        }
        if self.session.plan_restriction_window_secs == 0 {
            return Err(common::Error::Config(
                "session.plan_restriction_window_secs must be greater than 0".into(),
            ));
        }
        if self.session.max_login_attempts == 0 {
            return Err(common::Error::Config(
                "session.max_login_attempts must be greater than 0".into(),
            ));
        }
        if self.health.max_connections == 0 {
            return Err(common::Error::Config(
                "health.max_connections must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-agent.toml")
    }

    pub fn header_injections(&self) -> Vec<HeaderInjection> {
        self.api
            .headers
            .iter()
            .map(|h| HeaderInjection {
                name: h.name.clone(),
                value: h.value.clone(),
            })
            .collect()
    }

    pub fn channel_options(&self) -> realtime::ChannelOptions {
        realtime::ChannelOptions {
            url: self.realtime.url.clone(),
            reconnect_attempts: self.realtime.reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.realtime.reconnect_delay_ms),
        }
    }

    pub fn session_options(&self) -> session_gate::SessionOptions {
        session_gate::SessionOptions {
            plan_restriction_window: Duration::from_secs(self.session.plan_restriction_window_secs),
            max_login_attempts: self.session.max_login_attempts,
            ..Default::default()
        }
    }
}
