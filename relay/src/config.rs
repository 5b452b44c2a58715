use serde::Deserialize;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing required option: {0}")]
    MissingOption(&'static str),
    #[error("auth secret must not be empty while auth is enabled")]
    EmptyAuthSecret,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".to_string(),
            port: 7000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RedisConfig {
    pub address: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub account_identifier: String,
    pub org_identifier: String,
    pub admin_service_token: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_admin_url")]
    pub admin_url: String,
    #[serde(default = "default_client_url")]
    pub client_url: String,
    /// Selects the Redis cache variant when present.
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default = "default_auth_secret")]
    pub auth_secret: String,
    #[serde(default)]
    pub bypass_auth: bool,
    /// Non-empty restricts which environments the relay will serve.
    #[serde(default)]
    pub approved_environments: Vec<String>,
    #[serde(default = "default_true")]
    pub flag_stream_enabled: bool,
    #[serde(default = "default_flag_poll_interval_secs")]
    pub flag_poll_interval_secs: u64,
    /// `0` disables the target poll loop.
    #[serde(default = "default_minute")]
    pub target_poll_duration_secs: u64,
    /// `0` disables metric aggregation and posting.
    #[serde(default = "default_minute")]
    pub metric_post_duration_secs: u64,
    /// `0` disables the heartbeat.
    #[serde(default = "default_minute")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub listener: Listener,
}

fn default_admin_url() -> String {
    "https://app.feature-flags.io/api/1.0".to_string()
}

fn default_client_url() -> String {
    "https://config.feature-flags.io/api/1.0".to_string()
}

fn default_auth_secret() -> String {
    "secret".to_string()
}

fn default_true() -> bool {
    true
}

fn default_flag_poll_interval_secs() -> u64 {
    1
}

fn default_minute() -> u64 {
    60
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account_identifier.is_empty() {
            return Err(ConfigError::MissingOption("account_identifier"));
        }
        if self.org_identifier.is_empty() {
            return Err(ConfigError::MissingOption("org_identifier"));
        }
        if self.admin_service_token.is_empty() {
            return Err(ConfigError::MissingOption("admin_service_token"));
        }
        if self.api_keys.is_empty() {
            return Err(ConfigError::MissingOption("api_keys"));
        }
        if self.auth_secret.is_empty() && !self.bypass_auth {
            return Err(ConfigError::EmptyAuthSecret);
        }
        Ok(())
    }

    pub fn flag_poll_interval(&self) -> Duration {
        Duration::from_secs(self.flag_poll_interval_secs.max(1))
    }

    pub fn target_poll_duration(&self) -> Option<Duration> {
        match self.target_poll_duration_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn metric_post_duration(&self) -> Option<Duration> {
        match self.metric_post_duration_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Polls are bounded so a slow upstream cannot stall a tick past the
    /// next one by more than this.
    pub fn poll_timeout(&self) -> Duration {
        self.flag_poll_interval().min(Duration::from_secs(30))
    }
}
