//! Relay configuration.
//!
//! Layered with the `config` crate: built-in defaults, then the TOML file, then
//! `CHATRELAY__SECTION__KEY` environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chatrelay_protocol::{
    MAX_CONTENT_BYTES, MAX_FRAME_BYTES, PING_PERIOD, PONG_WAIT, QUEUE_CAPACITY, WRITE_WAIT,
};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::ws::{DuplicateSessionPolicy, OverflowPolicy};

pub const APP_NAME: &str = "chatrelay";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub auth: AuthConfig,
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Per-session timing, limits and policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Deadline for one write to the client.
    pub write_wait_secs: u64,
    /// The client must acknowledge a keepalive within this window.
    pub pong_wait_secs: u64,
    /// Keepalive interval. Must be shorter than `pong_wait_secs`.
    pub ping_period_secs: u64,
    pub max_frame_bytes: usize,
    pub max_content_bytes: usize,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub duplicate_sessions: DuplicateSessionPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            write_wait_secs: WRITE_WAIT.as_secs(),
            pong_wait_secs: PONG_WAIT.as_secs(),
            ping_period_secs: PING_PERIOD.as_secs(),
            max_frame_bytes: MAX_FRAME_BYTES,
            max_content_bytes: MAX_CONTENT_BYTES,
            queue_capacity: QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            duplicate_sessions: DuplicateSessionPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    /// Hard limit handed to the WebSocket layer. Frames between
    /// `max_frame_bytes` and this limit get an application error instead.
    pub fn socket_message_limit(&self) -> usize {
        self.max_frame_bytes.saturating_mul(4)
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_wait_secs == 0 {
            bail!("relay.write_wait_secs must be greater than zero");
        }
        if self.ping_period_secs == 0 || self.ping_period_secs >= self.pong_wait_secs {
            bail!(
                "relay.ping_period_secs ({}) must be between 1 and relay.pong_wait_secs ({})",
                self.ping_period_secs,
                self.pong_wait_secs
            );
        }
        if self.queue_capacity == 0 {
            bail!("relay.queue_capacity must be greater than zero");
        }
        if self.max_content_bytes == 0 || self.max_content_bytes > self.max_frame_bytes {
            bail!(
                "relay.max_content_bytes ({}) must be between 1 and relay.max_frame_bytes ({})",
                self.max_content_bytes,
                self.max_frame_bytes
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret. `env:VAR_NAME` reads it from the environment.
    pub jwt_secret: Option<String>,
}

impl AuthConfig {
    pub fn resolve_jwt_secret(&self) -> Result<String> {
        let raw = self
            .jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("auth.jwt_secret is not configured"))?;

        match raw.strip_prefix("env:") {
            Some(var) => std::env::var(var)
                .with_context(|| format!("reading jwt secret from environment variable {var}")),
            None => Ok(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Remote chat service over gRPC.
    #[default]
    Grpc,
    /// In-process fan-out, for development.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub mode: BackendMode,
    pub endpoint: String,
    pub connect_timeout_secs: u64,
    /// Chats the local backend knows. Empty means every chat id exists.
    pub local_chats: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::default(),
            endpoint: "http://127.0.0.1:50051".to_string(),
            connect_timeout_secs: 5,
            local_chats: Vec::new(),
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Load configuration from `path` (optional) and the environment.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .build()
        .with_context(|| format!("loading config from {}", path.display()))?;

    let config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;
    config.relay.validate()?;
    Ok(config)
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let relay = RelayConfig::default();
        assert_eq!(relay.write_wait(), Duration::from_secs(10));
        assert_eq!(relay.pong_wait(), Duration::from_secs(60));
        assert_eq!(relay.ping_period(), Duration::from_secs(54));
        assert_eq!(relay.max_frame_bytes, 4096);
        assert_eq!(relay.max_content_bytes, 256);
        assert_eq!(relay.queue_capacity, 256);
        assert_eq!(relay.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(relay.duplicate_sessions, DuplicateSessionPolicy::Allow);
        relay.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_ping_after_pong_deadline() {
        let relay = RelayConfig {
            ping_period_secs: 60,
            ..RelayConfig::default()
        };
        assert!(relay.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_content_above_frame_limit() {
        let relay = RelayConfig {
            max_content_bytes: 8192,
            ..RelayConfig::default()
        };
        assert!(relay.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.relay, RelayConfig::default());
        assert_eq!(config.backend.mode, BackendMode::Grpc);
    }

    #[test]
    fn test_load_reads_toml_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9000

[relay]
queue_capacity = 8
overflow_policy = "disconnect"
duplicate_sessions = "reject"

[backend]
mode = "local"
local_chats = ["general", "random"]
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.relay.queue_capacity, 8);
        assert_eq!(config.relay.overflow_policy, OverflowPolicy::Disconnect);
        assert_eq!(
            config.relay.duplicate_sessions,
            DuplicateSessionPolicy::Reject
        );
        assert_eq!(config.relay.pong_wait_secs, 60);
        assert_eq!(config.backend.mode, BackendMode::Local);
        assert_eq!(config.backend.local_chats, vec!["general", "random"]);
    }

    #[test]
    fn test_load_rejects_invalid_relay_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nping_period_secs = 90").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_jwt_secret_env_indirection() {
        let auth = AuthConfig {
            jwt_secret: Some("env:CHATRELAY_TEST_SECRET_THAT_IS_UNSET".to_string()),
        };
        assert!(auth.resolve_jwt_secret().is_err());

        let auth = AuthConfig {
            jwt_secret: Some("plain".to_string()),
        };
        assert_eq!(auth.resolve_jwt_secret().unwrap(), "plain");

        assert!(AuthConfig::default().resolve_jwt_secret().is_err());
    }
}
