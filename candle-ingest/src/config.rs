use std::fmt;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

use crate::controller::{ControllerSettings, Tuning};

/// Typed, immutable service configuration. Parsed once at startup from the
/// environment; bad values fail the process before anything connects.
#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "localhost:9092")]
    pub kafka_bootstrap_servers: String,

    #[envconfig(default = "candles")]
    pub kafka_topic: NonEmptyString,

    #[envconfig(default = "candle-ingest")]
    pub kafka_group_id: NonEmptyString,

    #[envconfig(default = "6000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "earliest")]
    pub kafka_auto_offset_reset: String,

    #[envconfig(default = "1")]
    pub kafka_initial_poll_timeout: EnvSecsDuration,

    #[envconfig(default = "500")]
    pub kafka_initial_max_batch_size: usize,

    #[envconfig(default = "localhost")]
    pub timescaledb_host: String,

    #[envconfig(default = "5432")]
    pub timescaledb_port: u16,

    #[envconfig(default = "candles")]
    pub timescaledb_dbname: String,

    #[envconfig(default = "postgres")]
    pub timescaledb_user: String,

    #[envconfig(default = "")]
    pub timescaledb_password: String,

    #[envconfig(default = "5")]
    pub timescaledb_pool_size: u32,

    #[envconfig(default = "10")]
    pub timescaledb_connection_timeout: EnvSecsDuration,

    #[envconfig(default = "candles")]
    pub timescaledb_table: NonEmptyString,

    /// Hard cap on the batch size the batcher will emit, whatever the
    /// controller asks for.
    #[envconfig(default = "1000")]
    pub insert_batch_size: usize,

    #[envconfig(default = "5")]
    pub insert_time_interval: EnvSecsDuration,

    #[envconfig(default = "3")]
    pub insert_retry_attempts: u32,

    #[envconfig(default = "1")]
    pub insert_retry_delay: EnvSecsDuration,

    #[envconfig(default = "10")]
    pub latency_window_size: usize,

    #[envconfig(default = "1.0")]
    pub latency_threshold_high: EnvSecsDuration,

    #[envconfig(default = "0.25")]
    pub latency_threshold_low: EnvSecsDuration,

    #[envconfig(default = "1")]
    pub poll_timeout_min: EnvSecsDuration,

    #[envconfig(default = "10")]
    pub poll_timeout_max: EnvSecsDuration,

    #[envconfig(default = "1")]
    pub poll_timeout_step: EnvSecsDuration,

    #[envconfig(default = "50")]
    pub batch_size_min: usize,

    #[envconfig(default = "2000")]
    pub batch_size_max: usize,

    #[envconfig(default = "50")]
    pub batch_size_step: usize,

    #[envconfig(default = "5")]
    pub cb_failure_threshold: u32,

    #[envconfig(default = "60")]
    pub cb_reset_timeout: EnvSecsDuration,

    #[envconfig(default = "30")]
    pub cb_half_open_timeout: EnvSecsDuration,

    #[envconfig(default = "30")]
    pub shutdown_grace_period: EnvSecsDuration,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(default = "8000")]
    pub metrics_port: u16,

    #[envconfig(default = "info")]
    pub log_level: LogLevel,
}

/// Enumeration of cross-field configuration errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("POLL_TIMEOUT_MIN must not exceed POLL_TIMEOUT_MAX")]
    PollTimeoutRails,
    #[error("BATCH_SIZE_MIN must be positive and not exceed BATCH_SIZE_MAX")]
    BatchSizeRails,
    #[error("LATENCY_THRESHOLD_LOW must be below LATENCY_THRESHOLD_HIGH")]
    LatencyThresholds,
    #[error("LATENCY_WINDOW_SIZE must be positive")]
    LatencyWindow,
    #[error("INSERT_BATCH_SIZE must be positive")]
    InsertBatchSize,
}

impl Config {
    /// Produce a host:port address for binding the health/metrics listener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.metrics_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout_min.0 > self.poll_timeout_max.0 {
            return Err(ConfigError::PollTimeoutRails);
        }
        if self.batch_size_min == 0 || self.batch_size_min > self.batch_size_max {
            return Err(ConfigError::BatchSizeRails);
        }
        if self.latency_threshold_low.0 >= self.latency_threshold_high.0 {
            return Err(ConfigError::LatencyThresholds);
        }
        if self.latency_window_size == 0 {
            return Err(ConfigError::LatencyWindow);
        }
        if self.insert_batch_size == 0 {
            return Err(ConfigError::InsertBatchSize);
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            window_size: self.latency_window_size,
            threshold_high: self.latency_threshold_high.0,
            threshold_low: self.latency_threshold_low.0,
            poll_timeout_min: self.poll_timeout_min.0,
            poll_timeout_max: self.poll_timeout_max.0,
            poll_timeout_step: self.poll_timeout_step.0,
            batch_size_min: self.batch_size_min,
            batch_size_max: self.batch_size_max,
            batch_size_step: self.batch_size_step,
        }
    }

    pub fn initial_tuning(&self) -> Tuning {
        Tuning {
            poll_timeout: self.kafka_initial_poll_timeout.0,
            max_batch: self.kafka_initial_max_batch_size,
        }
    }
}

/// Duration parsed from a number of seconds; fractional values allowed.
#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecsDurationError;

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvSecsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<f64>().map_err(|_| ParseEnvSecsDurationError)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(ParseEnvSecsDurationError);
        }

        Ok(EnvSecsDuration(time::Duration::from_secs_f64(secs)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Log verbosity accepted by `LOG_LEVEL`, fed to the tracing env filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLogLevelError;

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_ref() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(ParseLogLevelError),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_parse_and_validate() {
        let config = Config::init_from_hashmap(&HashMap::new()).expect("defaults should parse");
        config.validate().expect("defaults should validate");

        assert_eq!(config.bind(), "0.0.0.0:8000");
        assert_eq!(config.kafka_topic.as_str(), "candles");
        assert_eq!(
            config.insert_time_interval.0,
            time::Duration::from_secs(5)
        );
    }

    #[test]
    fn test_fractional_seconds_parse() {
        let parsed = EnvSecsDuration::from_str("0.25").unwrap();
        assert_eq!(parsed.0, time::Duration::from_millis(250));

        assert!(EnvSecsDuration::from_str("-1").is_err());
        assert!(EnvSecsDuration::from_str("soon").is_err());
    }

    #[test]
    fn test_log_level_is_case_insensitive() {
        assert_eq!(LogLevel::from_str("WARN"), Ok(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("debug"), Ok(LogLevel::Debug));
        assert!(LogLevel::from_str("verbose").is_err());
    }

    #[test]
    fn test_inverted_rails_fail_validation() {
        let mut env = HashMap::new();
        env.insert("POLL_TIMEOUT_MIN".to_owned(), "20".to_owned());
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.validate(), Err(ConfigError::PollTimeoutRails));

        let mut env = HashMap::new();
        env.insert("LATENCY_THRESHOLD_LOW".to_owned(), "2.0".to_owned());
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.validate(), Err(ConfigError::LatencyThresholds));
    }

    #[test]
    fn test_empty_topic_is_rejected() {
        let mut env = HashMap::new();
        env.insert("KAFKA_TOPIC".to_owned(), "".to_owned());
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
