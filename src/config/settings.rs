use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Limits and timeouts for the connection lifecycle
#[derive(Debug, Clone, Deserialize)]
pub struct SignalingConfig {
    /// Maximum open connections (pending + authenticated)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long a connection may stay unauthenticated, in milliseconds
    #[serde(default = "default_authentication_timeout_ms")]
    pub authentication_timeout_ms: u64,
    /// How long an authenticated connection may go without a ping, in milliseconds
    #[serde(default = "default_inactive_timeout_ms")]
    pub inactive_timeout_ms: u64,
    /// Sweeper period in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Outbound frames buffered per connection
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Upper bound for a single outbound send, in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

/// Shutdown drain tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSettings {
    #[serde(default = "default_sweeper_stop_timeout_ms")]
    pub sweeper_stop_timeout_ms: u64,
    #[serde(default = "default_drain_attempts")]
    pub drain_attempts: u32,
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
    #[serde(default = "default_notify_timeout_ms")]
    pub notify_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// "jwt" or "static"
    #[serde(default = "default_auth_backend")]
    pub backend: String,
    /// secret -> user id, used by the static backend
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    /// Capacity of the authentication outcome channel
    #[serde(default = "default_outcome_buffer")]
    pub outcome_buffer: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JwtConfig {
    #[serde(default)]
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_max_connections() -> usize {
    10
}

fn default_authentication_timeout_ms() -> u64 {
    20_000
}

fn default_inactive_timeout_ms() -> u64 {
    10_000
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

fn default_outbound_buffer() -> usize {
    32
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_sweeper_stop_timeout_ms() -> u64 {
    5_000
}

fn default_drain_attempts() -> u32 {
    5
}

fn default_drain_poll_interval_ms() -> u64 {
    1_000
}

fn default_notify_timeout_ms() -> u64 {
    2_000
}

fn default_auth_backend() -> String {
    "jwt".to_string()
}

fn default_outcome_buffer() -> usize {
    256
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", i64::from(default_port()))?
            .set_default("signaling.max_connections", default_max_connections() as i64)?
            .set_default(
                "signaling.authentication_timeout_ms",
                default_authentication_timeout_ms() as i64,
            )?
            .set_default("signaling.inactive_timeout_ms", default_inactive_timeout_ms() as i64)?
            .set_default("signaling.sweep_interval_ms", default_sweep_interval_ms() as i64)?
            .set_default("auth.backend", default_auth_backend())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // SERVER__PORT, SIGNALING__MAX_CONNECTIONS, JWT__SECRET, ...
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that tokio timers and channels cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zeroes = [
            ("signaling.sweep_interval_ms", self.signaling.sweep_interval_ms == 0),
            ("signaling.outbound_buffer", self.signaling.outbound_buffer == 0),
            ("auth.outcome_buffer", self.auth.outcome_buffer == 0),
        ];
        match zeroes.iter().find(|(_, is_zero)| *is_zero) {
            Some((key, _)) => Err(ConfigError::Message(format!("{} must be greater than zero", key))),
            None => Ok(()),
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl SignalingConfig {
    pub fn authentication_timeout(&self) -> Duration {
        Duration::from_millis(self.authentication_timeout_ms)
    }

    pub fn inactive_timeout(&self) -> Duration {
        Duration::from_millis(self.inactive_timeout_ms)
    }

    /// Never zero; `tokio::time::interval` panics on an empty period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            authentication_timeout_ms: default_authentication_timeout_ms(),
            inactive_timeout_ms: default_inactive_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            outbound_buffer: default_outbound_buffer(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            sweeper_stop_timeout_ms: default_sweeper_stop_timeout_ms(),
            drain_attempts: default_drain_attempts(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
            notify_timeout_ms: default_notify_timeout_ms(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: default_auth_backend(),
            credentials: HashMap::new(),
            outcome_buffer: default_outcome_buffer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8081);
    }

    #[test]
    fn test_signaling_defaults() {
        let signaling = SignalingConfig::default();
        assert_eq!(signaling.max_connections, 10);
        assert_eq!(signaling.authentication_timeout(), Duration::from_secs(20));
        assert_eq!(signaling.inactive_timeout(), Duration::from_secs(10));
        assert_eq!(signaling.sweep_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_shutdown_defaults() {
        let shutdown = ShutdownSettings::default();
        assert_eq!(shutdown.drain_attempts, 5);
        assert_eq!(shutdown.drain_poll_interval_ms, 1_000);
        assert_eq!(shutdown.sweeper_stop_timeout_ms, 5_000);
    }

    #[test]
    fn test_deserialize_partial_signaling_section() {
        let settings: Settings = Config::builder()
            .set_override("signaling.max_connections", 3i64)
            .unwrap()
            .set_override("auth.backend", "static")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.signaling.max_connections, 3);
        assert_eq!(settings.signaling.inactive_timeout_ms, 10_000);
        assert_eq!(settings.auth.backend, "static");
        assert!(settings.jwt.secret.is_empty());
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let settings: Settings = Config::builder()
            .set_override("signaling.sweep_interval_ms", 0i64)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("signaling.sweep_interval_ms"), "got {}", err);
        assert_eq!(settings.signaling.sweep_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_zero_buffers_are_rejected() {
        let mut settings: Settings = Config::builder().build().unwrap().try_deserialize().unwrap();
        assert!(settings.validate().is_ok());

        settings.signaling.outbound_buffer = 0;
        assert!(settings.validate().is_err());
        settings.signaling.outbound_buffer = 32;
        settings.auth.outcome_buffer = 0;
        assert!(settings.validate().is_err());
    }
}
