//! Configuration for channel-rpc

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::RpcError;

/// Default directory for the cached credential and session key
pub fn default_store_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("channel-rpc")
}

/// A spending allowance requested for the session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    pub asset: String,
    pub amount: String,
}

/// What the session key asks the node to be allowed to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthParams {
    /// Application name announced in the auth request
    #[serde(default = "default_application")]
    pub application: String,

    /// Requested scope
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Requested allowances
    #[serde(default)]
    pub allowances: Vec<Allowance>,

    /// Requested session lifetime in seconds
    #[serde(default = "default_session_expiry")]
    pub session_expiry_secs: u64,
}

impl Default for AuthParams {
    fn default() -> Self {
        Self {
            application: default_application(),
            scope: default_scope(),
            allowances: Vec::new(),
            session_expiry_secs: default_session_expiry(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Node WebSocket URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Directory for the cached credential and session key
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Default timeout for `send_with_response`, in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Timeout for one handshake round trip, in milliseconds
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_ms: u64,

    /// How long a received challenge may wait for approval (0 = forever)
    #[serde(default = "default_challenge_timeout")]
    pub challenge_timeout_ms: u64,

    /// Heartbeat interval while connected, in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Keepalive interval while a challenge awaits approval, in milliseconds
    #[serde(default = "default_keepalive_interval")]
    pub challenge_keepalive_ms: u64,

    /// First reconnect delay, doubled on every attempt
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_delay_ms: u64,

    /// Upper bound for a single reconnect delay
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_delay_ms: u64,

    /// Reconnect attempts before the client gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Treat a token as expired this many seconds before its `exp` claim
    #[serde(default = "default_token_skew")]
    pub token_expiry_skew_secs: u64,

    /// Handshake parameters
    #[serde(default)]
    pub auth: AuthParams,
}

fn default_url() -> String {
    "ws://localhost:8000/ws".to_string()
}

fn default_application() -> String {
    "channel-rpc".to_string()
}

fn default_scope() -> String {
    "console".to_string()
}

fn default_session_expiry() -> u64 {
    3600
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_auth_timeout() -> u64 {
    30_000
}

fn default_challenge_timeout() -> u64 {
    120_000
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_keepalive_interval() -> u64 {
    15_000
}

fn default_reconnect_base() -> u64 {
    1_000
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_token_skew() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            store_dir: default_store_dir(),
            request_timeout_ms: default_request_timeout(),
            auth_timeout_ms: default_auth_timeout(),
            challenge_timeout_ms: default_challenge_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            challenge_keepalive_ms: default_keepalive_interval(),
            reconnect_base_delay_ms: default_reconnect_base(),
            reconnect_max_delay_ms: default_reconnect_max(),
            max_retries: default_max_retries(),
            token_expiry_skew_secs: default_token_skew(),
            auth: AuthParams::default(),
        }
    }
}

impl ClientConfig {
    /// Config for a node URL with everything else defaulted
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RpcError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| RpcError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RpcError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| RpcError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configs the client cannot run with.
    pub fn validate(&self) -> Result<(), RpcError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| RpcError::Config(format!("Invalid url '{}': {}", self.url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RpcError::Config(format!(
                "Unsupported url scheme '{}', expected ws or wss",
                url.scheme()
            )));
        }
        if self.request_timeout_ms == 0 || self.auth_timeout_ms == 0 {
            return Err(RpcError::Config("Timeouts must be non-zero".into()));
        }
        if self.heartbeat_interval_ms == 0 || self.challenge_keepalive_ms == 0 {
            return Err(RpcError::Config("Heartbeat intervals must be non-zero".into()));
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(RpcError::Config(
                "reconnect_base_delay_ms exceeds reconnect_max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// `None` when challenges may wait for approval indefinitely.
    pub fn challenge_timeout(&self) -> Option<Duration> {
        (self.challenge_timeout_ms > 0).then(|| Duration::from_millis(self.challenge_timeout_ms))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn challenge_keepalive(&self) -> Duration {
        Duration::from_millis(self.challenge_keepalive_ms)
    }

    pub fn token_expiry_skew(&self) -> Duration {
        Duration::from_secs(self.token_expiry_skew_secs)
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at the max delay.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Path of the persisted session key
    pub fn session_key_path(&self) -> PathBuf {
        self.store_dir.join("session_key.json")
    }

    /// Path of the cached token
    pub fn token_path(&self) -> PathBuf {
        self.store_dir.join("token")
    }
}
