//! Agent configuration: an explicit schema with default values.
//!
//! The JSON layout (camelCase keys, intervals in seconds) is compatible with existing agent
//! configuration files. Unknown keys (e.g., settings of the SDK-facing HTTP layer) are ignored.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default base URL for fetching splits and segments.
pub const DEFAULT_SDK_URL: &str = "https://sdk.split.io/api";

/// Default base URL for posting impressions and metrics.
pub const DEFAULT_EVENTS_URL: &str = "https://events.split.io/api";

/// Default interval for every periodic task.
pub const DEFAULT_REFRESH_RATE: Duration = Duration::from_secs(60);

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// API key used to authenticate against the central service.
    pub api_key: String,
    /// Base URL for split and segment fetches.
    pub sdk_url: String,
    /// Base URL for impression and metric posts.
    pub events_url: String,
    /// Interval of the split synchronization task.
    #[serde(with = "seconds")]
    pub splits_refresh_rate: Duration,
    /// Interval of each segment synchronization task.
    #[serde(with = "seconds")]
    pub segments_refresh_rate: Duration,
    /// Interval of each impressions recorder task.
    #[serde(with = "seconds")]
    pub impressions_refresh_rate: Duration,
    /// Maximum number of impressions popped and posted per recorder tick.
    pub impressions_per_post: usize,
    /// Number of concurrent impressions recorder tasks.
    pub impressions_threads: usize,
    /// Interval of the metrics recorder task.
    #[serde(with = "seconds")]
    pub metrics_refresh_rate: Duration,
    /// Maximum number of metric observations popped per recorder tick.
    pub metrics_per_post: usize,
    /// Timeout of every HTTP request to the central service and the impression listener.
    #[serde(with = "seconds")]
    pub http_timeout: Duration,
    /// Random jitter subtracted from task intervals so that agents do not synchronize.
    #[serde(with = "seconds")]
    pub task_jitter: Duration,
    #[allow(missing_docs)]
    pub redis: RedisConfig,
    #[allow(missing_docs)]
    pub proxy: ProxyConfig,
    #[allow(missing_docs)]
    pub impression_listener: ImpressionListenerConfig,
    #[allow(missing_docs)]
    pub log: LogConfig,
}

impl Default for AgentConfig {
    fn default() -> AgentConfig {
        AgentConfig {
            api_key: String::new(),
            sdk_url: DEFAULT_SDK_URL.to_owned(),
            events_url: DEFAULT_EVENTS_URL.to_owned(),
            splits_refresh_rate: DEFAULT_REFRESH_RATE,
            segments_refresh_rate: DEFAULT_REFRESH_RATE,
            impressions_refresh_rate: DEFAULT_REFRESH_RATE,
            impressions_per_post: 1000,
            impressions_threads: 1,
            metrics_refresh_rate: DEFAULT_REFRESH_RATE,
            metrics_per_post: 1000,
            http_timeout: Duration::from_secs(60),
            task_jitter: Duration::ZERO,
            redis: RedisConfig::default(),
            proxy: ProxyConfig::default(),
            impression_listener: ImpressionListenerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a JSON file. Missing keys take their default values.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read.
    /// - [`Error::InvalidConfiguration`] if it is not valid configuration JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<AgentConfig> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let invalid =
            |reason: String| Error::InvalidConfiguration(format!("{}: {reason}", path.display()));

        // Derived struct deserialization also accepts sequences; only an object is a config.
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|err| invalid(err.to_string()))?;
        if !value.is_object() {
            return Err(invalid("expected a JSON object".to_owned()));
        }
        serde_json::from_value(value).map_err(|err| invalid(err.to_string()))
    }

    /// Serialize to pretty JSON, e.g. to write a default configuration file.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check that the configuration describes a runnable agent.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("splitsRefreshRate", self.splits_refresh_rate),
            ("segmentsRefreshRate", self.segments_refresh_rate),
            ("impressionsRefreshRate", self.impressions_refresh_rate),
            ("metricsRefreshRate", self.metrics_refresh_rate),
            ("httpTimeout", self.http_timeout),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| value.is_zero()) {
            return Err(Error::InvalidConfiguration(format!("{name} must be positive")));
        }
        // Jitter is subtracted from task intervals; it must leave every one of them positive.
        if let Some((name, _)) = intervals[..4]
            .iter()
            .find(|(_, value)| self.task_jitter >= *value)
        {
            return Err(Error::InvalidConfiguration(format!(
                "taskJitter must be smaller than {name}"
            )));
        }
        if self.impressions_threads == 0 {
            return Err(Error::InvalidConfiguration(
                "impressionsThreads must be at least 1".to_owned(),
            ));
        }
        if self.impressions_per_post == 0 || self.metrics_per_post == 0 {
            return Err(Error::InvalidConfiguration(
                "impressionsPerPost and metricsPerPost must be at least 1".to_owned(),
            ));
        }
        url::Url::parse(&self.sdk_url).map_err(Error::InvalidBaseUrl)?;
        url::Url::parse(&self.events_url).map_err(Error::InvalidBaseUrl)?;
        if let Some(endpoint) = self.impression_listener.endpoint() {
            url::Url::parse(endpoint).map_err(Error::InvalidBaseUrl)?;
        }
        Ok(())
    }
}

/// Connection parameters of the shared Redis store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: String,
    /// Prepended to every key, so several tenants can share one instance.
    pub prefix: String,
    /// Number of retries of a command that failed at the connection level.
    pub max_retries: usize,
    #[serde(with = "seconds")]
    pub dial_timeout: Duration,
    #[serde(with = "seconds")]
    pub read_timeout: Duration,
    #[serde(with = "seconds")]
    pub write_timeout: Duration,
    /// Maximum number of idle connections kept open.
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> RedisConfig {
        RedisConfig {
            host: "localhost".to_owned(),
            port: 6379,
            db: 0,
            password: String::new(),
            prefix: String::new(),
            max_retries: 0,
            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            pool_size: 10,
        }
    }
}

impl RedisConfig {
    /// `redis://` URL for these connection parameters.
    pub fn connection_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&format!("redis://{}:{}/{}", self.host, self.port, self.db))
            .map_err(Error::InvalidBaseUrl)?;
        if !self.password.is_empty() {
            url.set_password(Some(&self.password)).map_err(|()| {
                Error::InvalidConfiguration("redis password cannot be set".to_owned())
            })?;
        }
        Ok(url)
    }
}

/// Settings of the embedded store used in proxy mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// File to persist the embedded store to. Empty keeps the store in memory only.
    pub persist_in_file_path: String,
}

impl ProxyConfig {
    #[allow(missing_docs)]
    pub fn persist_path(&self) -> Option<PathBuf> {
        (!self.persist_in_file_path.is_empty()).then(|| PathBuf::from(&self.persist_in_file_path))
    }
}

/// Optional user endpoint that receives a copy of every impression batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImpressionListenerConfig {
    /// Listener URL. Empty disables the listener.
    pub endpoint: String,
    /// Maximum number of batches waiting for the listener forwarder. Batches beyond it are
    /// dropped.
    pub queue_size: usize,
}

impl Default for ImpressionListenerConfig {
    fn default() -> ImpressionListenerConfig {
        ImpressionListenerConfig {
            endpoint: String::new(),
            queue_size: 100,
        }
    }
}

impl ImpressionListenerConfig {
    #[allow(missing_docs)]
    pub fn endpoint(&self) -> Option<&str> {
        (!self.endpoint.is_empty()).then_some(self.endpoint.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct LogConfig {
    pub verbose: bool,
    pub debug: bool,
}

impl LogConfig {
    /// Maximum log level implied by the flags.
    pub fn level_filter(&self) -> log::LevelFilter {
        if self.verbose {
            log::LevelFilter::Trace
        } else if self.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }
}

/// (De)serialize a `Duration` as whole seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::AgentConfig;
    use crate::Error;

    #[test]
    fn missing_keys_take_defaults() {
        let config: AgentConfig = serde_json::from_str(
            r#"{
                "apiKey": "secret",
                "splitsRefreshRate": 5,
                "redis": {"prefix": "tenant", "port": 6380},
                "impressionListener": {"endpoint": "http://localhost:9000/impressions"},
                "proxy": {"port": 3000}
            }"#,
        )
        .unwrap();

        assert_eq!(config.api_key, "secret");
        assert_eq!(config.splits_refresh_rate, Duration::from_secs(5));
        assert_eq!(config.segments_refresh_rate, Duration::from_secs(60));
        assert_eq!(config.impressions_threads, 1);
        assert_eq!(config.redis.prefix, "tenant");
        assert_eq!(config.redis.port, 6380);
        assert_eq!(config.redis.host, "localhost");
        assert_eq!(
            config.impression_listener.endpoint(),
            Some("http://localhost:9000/impressions")
        );
        assert_eq!(config.proxy.persist_path(), None);
        config.validate().unwrap();
    }

    #[test]
    fn default_config_round_trips_through_json() {
        let config = AgentConfig::default();
        let json = config.to_json_pretty().unwrap();
        assert!(json.contains("\"splitsRefreshRate\": 60"));
        assert_eq!(serde_json::from_str::<AgentConfig>(&json).unwrap(), config);
    }

    #[test]
    fn zero_threads_are_rejected() {
        let config = AgentConfig {
            impressions_threads: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config = AgentConfig {
            segments_refresh_rate: Duration::ZERO,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn jitter_must_be_smaller_than_every_refresh_rate() {
        let config = AgentConfig {
            splits_refresh_rate: Duration::from_secs(5),
            task_jitter: Duration::from_secs(60),
            ..AgentConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(message)) if message.contains("splitsRefreshRate")
        ));

        let config = AgentConfig {
            task_jitter: Duration::from_secs(60),
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            task_jitter: Duration::from_secs(10),
            ..AgentConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn redis_url_includes_password_and_db() {
        let mut config = AgentConfig::default().redis;
        config.password = "p@ss".to_owned();
        config.db = 2;
        assert_eq!(
            config.connection_url().unwrap().as_str(),
            "redis://:p%40ss@localhost:6379/2"
        );
    }

    #[test]
    fn log_flags_select_level() {
        let mut config = AgentConfig::default().log;
        assert_eq!(config.level_filter(), log::LevelFilter::Info);
        config.debug = true;
        assert_eq!(config.level_filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn reads_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"impressionsPerPost": 3}"#).unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.impressions_per_post, 3);

        let invalid_files = [
            "[]",
            "[1, 2]",
            "\"agent\"",
            "{\"apiKey\": ",
            "{\"impressionsPerPost\": \"many\"}",
        ];
        for invalid in invalid_files {
            std::fs::write(&path, invalid).unwrap();
            assert!(
                matches!(
                    AgentConfig::from_file(&path),
                    Err(Error::InvalidConfiguration(_))
                ),
                "{invalid} must be rejected"
            );
        }
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AgentConfig::from_file(dir.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }
}
