//! Configuration management for Sliding Gate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};
use crate::ratelimit::{FailurePolicy, LimiterConfig};

/// Prefix of environment variables overriding file settings,
/// e.g. `SLIDING_GATE__LIMITER__LIMIT=50`.
pub const ENV_PREFIX: &str = "SLIDING_GATE";

/// Main configuration for Sliding Gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Shared backend connection
    #[serde(default)]
    pub redis: RedisSettings,

    /// Log output
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Which strategy backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local windows; quota is per instance
    #[default]
    Local,
    /// Shared Redis sorted sets; quota is shared by every instance
    Redis,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Maximum admissions per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Sliding window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Namespace prepended to every backend key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Client keys that are never limited
    #[serde(default)]
    pub skip_keys: Vec<String>,

    /// Request paths that are never limited
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,

    #[serde(default)]
    pub backend: BackendKind,

    /// What to do when the shared backend fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Bound on one backend round trip, in milliseconds
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// How often idle local windows are reclaimed, in seconds
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window_ms(),
            key_prefix: default_key_prefix(),
            skip_keys: Vec::new(),
            skip_paths: default_skip_paths(),
            backend: BackendKind::default(),
            failure_policy: FailurePolicy::default(),
            backend_timeout_ms: default_backend_timeout_ms(),
            janitor_interval_secs: default_janitor_interval(),
        }
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

fn default_skip_paths() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

fn default_backend_timeout_ms() -> u64 {
    200
}

fn default_janitor_interval() -> u64 {
    300
}

impl LimiterSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    /// Validate into the immutable configuration shared by the limiters.
    pub fn to_limiter_config(&self) -> Result<LimiterConfig> {
        if self.backend_timeout_ms == 0 {
            return Err(GateError::Config(
                "backend_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.janitor_interval_secs == 0 {
            return Err(GateError::Config(
                "janitor_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(LimiterConfig::new(self.limit, self.window())?
            .with_key_prefix(self.key_prefix.clone())
            .with_skip_keys(self.skip_keys.iter().cloned())
            .with_skip_paths(self.skip_paths.iter().cloned()))
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: u32,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

impl RedisSettings {
    /// Connection URL, `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional YAML file, then apply
    /// `SLIDING_GATE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    /// Like [`load`](Self::load), reading overrides from `env` instead of the
    /// process environment when it is given.
    fn load_from(path: Option<&Path>, env: Option<::config::Map<String, String>>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("limiter.skip_keys")
                    .with_list_parse_key("limiter.skip_paths")
                    .source(env),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<GateConfig>())
            .map_err(|e| GateError::Config(e.to_string()))
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| GateError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        assert_eq!(config.limiter.limit, 100);
        assert_eq!(config.limiter.window(), Duration::from_secs(60));
        assert_eq!(config.limiter.key_prefix, "rate_limit");
        assert_eq!(config.limiter.backend, BackendKind::Local);
        assert_eq!(config.limiter.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.redis.url(), "redis://localhost:6379/0");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
limiter:
  limit: 3
  window_ms: 1000
  key_prefix: api
  skip_keys: ["ip:127.0.0.1"]
  backend: redis
  failure_policy: fallback_local
redis:
  host: cache
  password: secret
  db: 2
logging:
  format: json
"#;
        let config = GateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limiter.limit, 3);
        assert_eq!(config.limiter.backend, BackendKind::Redis);
        assert_eq!(config.limiter.failure_policy, FailurePolicy::FallbackLocal);
        assert_eq!(config.limiter.skip_paths, vec!["/health", "/metrics"]);
        assert_eq!(config.redis.url(), "redis://:secret@cache:6379/2");
        assert_eq!(config.logging.format, LogFormat::Json);

        let limiter = config.limiter.to_limiter_config().unwrap();
        assert_eq!(limiter.limit(), 3);
        assert_eq!(limiter.window(), Duration::from_secs(1));
        assert_eq!(limiter.key_prefix(), "api");
    }

    #[test]
    fn test_invalid_limits_fail_fast() {
        let settings = LimiterSettings {
            limit: 0,
            ..LimiterSettings::default()
        };
        assert!(matches!(settings.to_limiter_config(), Err(GateError::Config(_))));

        let settings = LimiterSettings {
            window_ms: 0,
            ..LimiterSettings::default()
        };
        assert!(matches!(settings.to_limiter_config(), Err(GateError::Config(_))));

        let settings = LimiterSettings {
            window_ms: u64::MAX,
            ..LimiterSettings::default()
        };
        assert!(matches!(settings.to_limiter_config(), Err(GateError::Config(_))));

        let settings = LimiterSettings {
            backend_timeout_ms: 0,
            ..LimiterSettings::default()
        };
        assert!(matches!(settings.to_limiter_config(), Err(GateError::Config(_))));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = GateConfig::from_yaml("limiter: [").unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join(format!("sliding-gate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "limiter:\n  limit: 7\n  window_ms: 500\n").unwrap();

        let config = GateConfig::load_from(Some(path.as_path()), Some(::config::Map::new())).unwrap();
        let plain = GateConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(plain, config);

        assert_eq!(config.limiter.limit, 7);
        assert_eq!(config.limiter.window_ms, 500);
        assert_eq!(config.limiter.key_prefix, "rate_limit");
    }

    #[test]
    fn test_env_overrides_file() {
        let path = std::env::temp_dir().join(format!("sliding-gate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "limiter:\n  limit: 7\n  window_ms: 500\n").unwrap();

        let env: ::config::Map<String, String> = [
            ("SLIDING_GATE__LIMITER__LIMIT", "50"),
            ("SLIDING_GATE__LIMITER__FAILURE_POLICY", "fallback_local"),
            ("SLIDING_GATE__LIMITER__SKIP_KEYS", "ip:127.0.0.1,user:admin"),
            ("SLIDING_GATE__LIMITER__SKIP_PATHS", "/ready"),
            ("SLIDING_GATE__REDIS__HOST", "cache"),
            ("OTHER_APP__LIMITER__LIMIT", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = GateConfig::load_from(Some(path.as_path()), Some(env)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limiter.limit, 50);
        assert_eq!(config.limiter.window_ms, 500);
        assert_eq!(config.limiter.failure_policy, FailurePolicy::FallbackLocal);
        assert_eq!(config.limiter.skip_keys, vec!["ip:127.0.0.1", "user:admin"]);
        assert_eq!(config.limiter.skip_paths, vec!["/ready"]);
        assert_eq!(config.redis.host, "cache");
        assert_eq!(config.redis.port, 6379);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = GateConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(GateConfig::from_yaml(&yaml).unwrap(), config);
    }
}
