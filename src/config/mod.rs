//! Configuration types for the mail client.
//!
//! Provides configuration with builder pattern and file/env loading for:
//! - Server connection and credentials
//! - Connection pooling
//! - Retry and rate-limit policies
//! - Logging

use std::path::{Path, PathBuf};
use std::time::Duration;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{MailError, MailResult};
use crate::types::ProviderType;

/// Default SMTP submission port.
pub const DEFAULT_PORT: u16 = 587;

/// Port conventionally used for implicit TLS.
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Default per-operation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix of environment variables read by [`MailerConfig::apply_env_overrides`].
pub const ENV_PREFIX: &str = "SMTP_CLIENT_";

/// How a session is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Plaintext session.
    None,
    /// Plaintext greeting upgraded with STARTTLS.
    StartTls,
    /// TLS from the first byte.
    Implicit,
}

/// Server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Secure the session (implicit TLS on port 465, STARTTLS elsewhere).
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// Provider identity.
    #[serde(default)]
    pub provider: ProviderType,
    /// Username for PLAIN authentication.
    #[serde(default)]
    pub username: Option<String>,
    /// Password for PLAIN authentication (never serialized).
    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,
    /// Per-operation timeout for dial and protocol round-trips.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Client identifier for EHLO.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Extra PEM bundle of trusted roots.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

fn default_true() -> bool { true }
fn default_port() -> u16 { DEFAULT_PORT }
fn default_timeout() -> Duration { DEFAULT_TIMEOUT }

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            use_tls: true,
            provider: ProviderType::Generic,
            username: None,
            password: None,
            timeout: DEFAULT_TIMEOUT,
            client_id: None,
            ca_cert_path: None,
        }
    }
}

impl TransportConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> MailResult<()> {
        if self.host.trim().is_empty() {
            return Err(MailError::configuration("host is required"));
        }
        if self.port == 0 {
            return Err(MailError::configuration("port must be non-zero"));
        }
        if self.timeout.is_zero() {
            return Err(MailError::configuration("timeout must be positive"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(MailError::configuration(
                "username and password must be set together",
            ));
        }
        Ok(())
    }

    /// Returns true if a username/password pair is configured.
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }

    /// Session security derived from `use_tls` and the port.
    pub fn tls_mode(&self) -> TlsMode {
        match (self.use_tls, self.port) {
            (false, _) => TlsMode::None,
            (true, IMPLICIT_TLS_PORT) => TlsMode::Implicit,
            (true, _) => TlsMode::StartTls,
        }
    }
}

/// Builder for [`TransportConfig`].
#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    host: Option<String>,
    port: u16,
    use_tls: Option<bool>,
    provider: ProviderType,
    username: Option<String>,
    password: Option<SecretString>,
    timeout: Duration,
    client_id: Option<String>,
    ca_cert_path: Option<PathBuf>,
}

impl TransportConfigBuilder {
    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enables or disables TLS.
    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = Some(use_tls);
        self
    }

    /// Sets the provider; hosted providers also fill in host and port when unset.
    pub fn provider(mut self, provider: ProviderType) -> Self {
        self.provider = provider;
        self
    }

    /// Sets PLAIN credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the per-operation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Adds a PEM bundle of trusted roots.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> MailResult<TransportConfig> {
        let endpoint = self.provider.default_endpoint();
        let host = self
            .host
            .or_else(|| endpoint.map(|(host, _)| host.to_string()))
            .ok_or_else(|| MailError::configuration("host is required"))?;
        let port = match (self.port, endpoint) {
            (0, Some((_, port))) => port,
            (0, None) => DEFAULT_PORT,
            (port, _) => port,
        };

        let config = TransportConfig {
            host,
            port,
            use_tls: self.use_tls.unwrap_or(true),
            provider: self.provider,
            username: self.username,
            password: self.password,
            timeout: if self.timeout.is_zero() { DEFAULT_TIMEOUT } else { self.timeout },
            client_id: self.client_id,
            ca_cert_path: self.ca_cert_path,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of concurrently live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum connection age before it is discarded instead of reused.
    #[serde(default = "default_max_idle", with = "humantime_serde")]
    pub max_idle: Duration,
    /// Acquire timeout.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_max_connections() -> usize { 10 }
fn default_max_idle() -> Duration { Duration::from_secs(300) }
fn default_acquire_timeout() -> Duration { Duration::from_secs(30) }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_idle: default_max_idle(),
            timeout: default_acquire_timeout(),
        }
    }
}

impl PoolConfig {
    /// Replaces zero values with the defaults.
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            max_connections: if self.max_connections == 0 { defaults.max_connections } else { self.max_connections },
            max_idle: if self.max_idle.is_zero() { defaults.max_idle } else { self.max_idle },
            timeout: if self.timeout.is_zero() { defaults.timeout } else { self.timeout },
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound on the delay.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> Duration { Duration::from_millis(500) }
fn default_max_backoff() -> Duration { Duration::from_secs(30) }
fn default_multiplier() -> f64 { 2.0 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Validates the policy.
    pub fn validate(&self) -> MailResult<()> {
        if self.max_attempts == 0 {
            return Err(MailError::configuration("max_attempts must be at least 1"));
        }
        if !(self.multiplier >= 1.0) {
            return Err(MailError::configuration("multiplier must be at least 1"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(MailError::configuration(
                "max_backoff must not be below initial_backoff",
            ));
        }
        Ok(())
    }
}

/// Rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Sustained sends per minute.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Bucket capacity.
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Enable rate limiting.
    #[serde(default)]
    pub enabled: bool,
}

fn default_requests_per_minute() -> u32 { 60 }
fn default_burst() -> u32 { 10 }

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
            enabled: false,
        }
    }
}

impl RateLimitPolicy {
    /// Validates the policy.
    pub fn validate(&self) -> MailResult<()> {
        if self.requests_per_minute == 0 {
            return Err(MailError::configuration("requests_per_minute must be at least 1"));
        }
        if self.burst == 0 {
            return Err(MailError::configuration("burst must be at least 1"));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> MailResult<()> {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(MailError::configuration(format!("unknown log level: {}", other))),
        }
    }
}

/// Complete client configuration, as loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailerConfig {
    /// Server connection settings.
    pub transport: TransportConfig,
    /// Pool settings.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Retry settings.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Rate-limit settings.
    #[serde(default)]
    pub rate_limiting: RateLimitPolicy,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MailerConfig {
    /// Parses YAML.
    pub fn from_yaml_str(s: &str) -> MailResult<Self> {
        serde_yaml::from_str(s)
            .map_err(|e| MailError::configuration("invalid YAML configuration").with_cause(e))
    }

    /// Parses JSON.
    pub fn from_json_str(s: &str) -> MailResult<Self> {
        serde_json::from_str(s)
            .map_err(|e| MailError::configuration("invalid JSON configuration").with_cause(e))
    }

    /// Loads a `.yaml`, `.yml`, or `.json` file, applies `SMTP_CLIENT_*`
    /// overrides from the process environment, then validates.
    pub fn from_file(path: impl AsRef<Path>) -> MailResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MailError::configuration(format!("cannot read {}", path.display())).with_cause(e)
        })?;

        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents)?,
            Some("json") => Self::from_json_str(&contents)?,
            _ => {
                return Err(MailError::configuration(format!(
                    "unsupported configuration format: {}",
                    path.display()
                )))
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `SMTP_CLIENT_*` overrides through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> MailResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(host) = get("HOST") {
            self.transport.host = host;
        }
        if let Some(port) = get("PORT") {
            self.transport.port = parse_env("PORT", &port)?;
        }
        if let Some(use_tls) = get("USE_TLS") {
            self.transport.use_tls = parse_env("USE_TLS", &use_tls)?;
        }
        if let Some(provider) = get("PROVIDER") {
            self.transport.provider = provider.parse().map_err(MailError::configuration)?;
        }
        if let Some(username) = get("USERNAME") {
            self.transport.username = Some(username);
        }
        if let Some(password) = get("PASSWORD") {
            self.transport.password = Some(SecretString::new(password));
        }
        if let Some(enabled) = get("RATE_LIMIT_ENABLED") {
            self.rate_limiting.enabled = parse_env("RATE_LIMIT_ENABLED", &enabled)?;
        }
        if let Some(rpm) = get("REQUESTS_PER_MINUTE") {
            self.rate_limiting.requests_per_minute = parse_env("REQUESTS_PER_MINUTE", &rpm)?;
        }
        if let Some(max) = get("MAX_CONNECTIONS") {
            self.pool.max_connections = parse_env("MAX_CONNECTIONS", &max)?;
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Validates every section.
    pub fn validate(&self) -> MailResult<()> {
        self.transport.validate()?;
        self.retry.validate()?;
        self.rate_limiting.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> MailResult<T> {
    value.trim().parse().map_err(|_| {
        MailError::configuration(format!("invalid value for {}{}: {}", ENV_PREFIX, name, value))
    })
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    #[test]
    fn test_transport_builder() {
        let config = TransportConfig::builder()
            .host("smtp.example.com")
            .credentials("user", "pass")
            .build()
            .unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.has_credentials());
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.tls_mode(), TlsMode::StartTls);
        assert_eq!(config.client_id(), "localhost");
    }

    #[test]
    fn test_provider_fills_endpoint() {
        let config = TransportConfig::builder()
            .provider(ProviderType::Office365)
            .build()
            .unwrap();
        assert_eq!(config.host, "smtp.office365.com");
        assert_eq!(config.port, 587);
    }

    #[test]
    fn test_builder_requires_host() {
        let err = TransportConfig::builder().build().unwrap_err();
        assert_eq!(err.code(), crate::errors::codes::INVALID_CONFIG);
    }

    #[test]
    fn test_tls_mode() {
        let mut config = TransportConfig::builder().host("h").port(465).build().unwrap();
        assert_eq!(config.tls_mode(), TlsMode::Implicit);
        config.use_tls = false;
        assert_eq!(config.tls_mode(), TlsMode::None);
    }

    #[test]
    fn test_pool_normalized() {
        let pool = PoolConfig {
            max_connections: 0,
            max_idle: Duration::ZERO,
            timeout: Duration::from_secs(5),
        }
        .normalized();
        assert_eq!(pool.max_connections, 10);
        assert_eq!(pool.max_idle, Duration::from_secs(300));
        assert_eq!(pool.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy { multiplier: 0.5, ..Default::default() }.validate().is_err());
        assert!(RateLimitPolicy { burst: 0, ..Default::default() }.validate().is_err());
        assert!(LoggingConfig { level: "loud".into(), ..Default::default() }.validate().is_err());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
transport:
  host: smtp.gmail.com
  port: 587
  provider: gmail
  timeout: 10s
pool:
  max_connections: 4
  max_idle: 2m
rate_limiting:
  enabled: true
  requests_per_minute: 120
  burst: 5
retry:
  max_attempts: 5
  initial_backoff: 200ms
  max_backoff: 5s
  multiplier: 1.5
logging:
  level: debug
  format: json
"#;
        let config = MailerConfig::from_yaml_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.transport.provider, ProviderType::Gmail);
        assert_eq!(config.transport.timeout, Duration::from_secs(10));
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.pool.max_idle, Duration::from_secs(120));
        assert_eq!(config.pool.timeout, Duration::from_secs(30));
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(200));
        assert!(config.rate_limiting.enabled);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = MailerConfig::from_json_str(r#"{"transport":{"host":"a"}}"#).unwrap();
        let env: HashMap<&str, &str> = [
            ("SMTP_CLIENT_HOST", "b.example.com"),
            ("SMTP_CLIENT_PORT", "2525"),
            ("SMTP_CLIENT_USERNAME", "u"),
            ("SMTP_CLIENT_PASSWORD", "p"),
            ("SMTP_CLIENT_RATE_LIMIT_ENABLED", "true"),
        ]
        .into_iter()
        .collect();

        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.transport.host, "b.example.com");
        assert_eq!(config.transport.port, 2525);
        assert_eq!(
            config.transport.password.as_ref().map(|p| p.expose_secret().as_str()),
            Some("p")
        );
        assert!(config.rate_limiting.enabled);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = MailerConfig::default();
        let err = config
            .apply_env_overrides(|k| (k == "SMTP_CLIENT_PORT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.message().contains("SMTP_CLIENT_PORT"));
    }

    #[test]
    fn test_password_not_serialized() {
        let config = TransportConfig::builder()
            .host("h")
            .credentials("u", "secret-value")
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret-value"));
    }
}
