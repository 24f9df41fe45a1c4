use std::env;
use std::time::Duration;

use crate::error::{ReverbError, Result};

/// Pusher protocol version spoken by Laravel Reverb.
pub const PROTOCOL_VERSION: u8 = 7;

const DEFAULT_PORT: u16 = 443;
const DEFAULT_SCHEME: &str = "wss";
const DEFAULT_RECONNECT_DELAY_MIN: Duration = Duration::from_secs(1);
const DEFAULT_RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_MULTIPLIER: f64 = 2.0;
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration.
///
/// Values are supplied directly through the builder methods or read from
/// `REVERB_*` environment variables via [`ReverbConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ReverbConfig {
    /// Reverb application key.
    pub app_key: String,
    /// Reverb application secret, used for HMAC admission signing.
    pub app_secret: String,
    /// Server hostname.
    pub host: String,
    /// WebSocket port.
    pub port: u16,
    /// WebSocket scheme, `ws` or `wss`.
    pub scheme: String,
    /// Whether to reconnect automatically after a lost connection.
    pub reconnect_enabled: bool,
    /// Base delay for reconnect backoff.
    pub reconnect_delay_min: Duration,
    /// Cap for reconnect backoff.
    pub reconnect_delay_max: Duration,
    /// Backoff multiplier applied per attempt.
    pub reconnect_multiplier: f64,
    /// Maximum reconnect attempts; `None` means unbounded.
    pub reconnect_max_attempts: Option<u32>,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
    /// How long a subscribe call waits for the server acknowledgement.
    pub subscription_timeout: Duration,
    /// Log level string, honored by the binary's logging bootstrap.
    pub log_level: String,
    /// Client identifier reported in the handshake URL.
    pub client_name: String,
    /// Client version reported in the handshake URL.
    pub client_version: String,
}

impl ReverbConfig {
    /// Create a configuration with the required values and defaults for the
    /// rest.
    pub fn new(app_key: &str, app_secret: &str, host: &str) -> Self {
        Self {
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
            host: host.to_string(),
            port: DEFAULT_PORT,
            scheme: DEFAULT_SCHEME.to_string(),
            reconnect_enabled: true,
            reconnect_delay_min: DEFAULT_RECONNECT_DELAY_MIN,
            reconnect_delay_max: DEFAULT_RECONNECT_DELAY_MAX,
            reconnect_multiplier: DEFAULT_RECONNECT_MULTIPLIER,
            reconnect_max_attempts: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            subscription_timeout: DEFAULT_SUBSCRIPTION_TIMEOUT,
            log_level: "info".to_string(),
            client_name: "reverb-client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Read configuration from `REVERB_*` environment variables.
    ///
    /// `REVERB_APP_KEY`, `REVERB_APP_SECRET`, and `REVERB_HOST` are required;
    /// the remaining options fall back to their defaults.
    pub fn from_env() -> Result<Self> {
        let app_key = require_env("REVERB_APP_KEY")?;
        let app_secret = require_env("REVERB_APP_SECRET")?;
        let host = require_env("REVERB_HOST")?;

        let mut config = Self::new(&app_key, &app_secret, &host);

        if let Some(port) = optional_env("REVERB_PORT") {
            config.port = port
                .parse()
                .map_err(|_| ReverbError::Configuration(format!("invalid REVERB_PORT: {port}")))?;
        }
        if let Some(scheme) = optional_env("REVERB_SCHEME") {
            config.scheme = scheme;
        }
        if let Some(enabled) = optional_env("REVERB_RECONNECT_ENABLED") {
            config.reconnect_enabled = matches!(enabled.as_str(), "1" | "true" | "yes");
        }
        if let Some(secs) = optional_env("REVERB_RECONNECT_DELAY_MIN") {
            config.reconnect_delay_min = parse_secs("REVERB_RECONNECT_DELAY_MIN", &secs)?;
        }
        if let Some(secs) = optional_env("REVERB_RECONNECT_DELAY_MAX") {
            config.reconnect_delay_max = parse_secs("REVERB_RECONNECT_DELAY_MAX", &secs)?;
        }
        if let Some(mult) = optional_env("REVERB_RECONNECT_MULTIPLIER") {
            config.reconnect_multiplier = mult.parse().map_err(|_| {
                ReverbError::Configuration(format!("invalid REVERB_RECONNECT_MULTIPLIER: {mult}"))
            })?;
        }
        if let Some(max) = optional_env("REVERB_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect_max_attempts = Some(max.parse().map_err(|_| {
                ReverbError::Configuration(format!("invalid REVERB_RECONNECT_MAX_ATTEMPTS: {max}"))
            })?);
        }
        if let Some(secs) = optional_env("REVERB_PING_INTERVAL") {
            config.ping_interval = parse_secs("REVERB_PING_INTERVAL", &secs)?;
        }
        if let Some(secs) = optional_env("REVERB_SUBSCRIPTION_TIMEOUT") {
            config.subscription_timeout = parse_secs("REVERB_SUBSCRIPTION_TIMEOUT", &secs)?;
        }
        if let Some(level) = optional_env("REVERB_LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the WebSocket port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the WebSocket scheme (`ws` or `wss`).
    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    /// Enable or disable automatic reconnection.
    pub fn with_reconnect_enabled(mut self, enabled: bool) -> Self {
        self.reconnect_enabled = enabled;
        self
    }

    /// Bound the number of reconnect attempts.
    pub fn with_reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = Some(attempts);
        self
    }

    /// Set the keepalive ping interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the subscribe acknowledgement deadline.
    pub fn with_subscription_timeout(mut self, timeout: Duration) -> Self {
        self.subscription_timeout = timeout;
        self
    }

    /// Check that required values are present and coherent.
    pub fn validate(&self) -> Result<()> {
        if self.app_key.is_empty() {
            return Err(ReverbError::Configuration("app_key is required".into()));
        }
        if self.app_secret.is_empty() {
            return Err(ReverbError::Configuration("app_secret is required".into()));
        }
        if self.host.is_empty() {
            return Err(ReverbError::Configuration("host is required".into()));
        }
        if self.scheme != "ws" && self.scheme != "wss" {
            return Err(ReverbError::Configuration(format!(
                "scheme must be ws or wss, got {}",
                self.scheme
            )));
        }
        if self.reconnect_multiplier < 1.0 {
            return Err(ReverbError::Configuration(
                "reconnect_multiplier must be >= 1.0".into(),
            ));
        }
        if self.reconnect_delay_min > self.reconnect_delay_max {
            return Err(ReverbError::Configuration(
                "reconnect_delay_min exceeds reconnect_delay_max".into(),
            ));
        }
        Ok(())
    }

    /// Construct the handshake URL.
    pub fn build_url(&self) -> String {
        format!(
            "{}://{}:{}/app/{}?protocol={}&client={}&version={}",
            self.scheme,
            self.host,
            self.port,
            self.app_key,
            PROTOCOL_VERSION,
            self.client_name,
            self.client_version,
        )
    }
}

fn require_env(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ReverbError::Configuration(format!("{key} is not set")))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .parse::<f64>()
        .ok()
        .filter(|s| *s >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| ReverbError::Configuration(format!("invalid {key}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ReverbConfig::new("key", "secret", "example.com");
        assert_eq!(config.port, 443);
        assert_eq!(config.scheme, "wss");
        assert!(config.reconnect_enabled);
        assert_eq!(config.reconnect_delay_min, Duration::from_secs(1));
        assert_eq!(config.reconnect_delay_max, Duration::from_secs(30));
        assert_eq!(config.reconnect_multiplier, 2.0);
        assert_eq!(config.reconnect_max_attempts, None);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.subscription_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn build_url_carries_protocol_and_client() {
        let config = ReverbConfig::new("abc", "s3cret", "reverb.test")
            .with_scheme("ws")
            .with_port(8080);
        let url = config.build_url();
        assert!(url.starts_with("ws://reverb.test:8080/app/abc?protocol=7"));
        assert!(url.contains("client=reverb-client"));
        assert!(url.contains("version="));
    }

    #[test]
    fn validate_rejects_missing_required() {
        let config = ReverbConfig::new("", "secret", "host");
        assert!(matches!(
            config.validate(),
            Err(ReverbError::Configuration(_))
        ));

        let config = ReverbConfig::new("key", "secret", "");
        assert!(matches!(
            config.validate(),
            Err(ReverbError::Configuration(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_scheme() {
        let config = ReverbConfig::new("key", "secret", "host").with_scheme("http");
        assert!(matches!(
            config.validate(),
            Err(ReverbError::Configuration(_))
        ));
    }

    #[test]
    fn from_env_reads_reverb_variables() {
        env::set_var("REVERB_APP_KEY", "env-key");
        env::set_var("REVERB_APP_SECRET", "env-secret");
        env::set_var("REVERB_HOST", "env-host");
        env::set_var("REVERB_PORT", "8080");
        env::set_var("REVERB_SCHEME", "ws");
        env::set_var("REVERB_PING_INTERVAL", "12.5");

        let config = ReverbConfig::from_env().unwrap();
        assert_eq!(config.app_key, "env-key");
        assert_eq!(config.port, 8080);
        assert_eq!(config.scheme, "ws");
        assert_eq!(config.ping_interval, Duration::from_secs_f64(12.5));
    }
}
