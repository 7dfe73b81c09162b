//! Run configuration. See [`MonitorConfig`].

use crate::ConfigError;
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

const ENV_GPU_THRESHOLD: &str = "GPU_MONITOR_THRESHOLD";
const ENV_RUN_EVENTS: &str = "GPU_MONITOR_RUN_EVENTS";
const ENV_SAMPLE_INTERVAL_MS: &str = "GPU_MONITOR_SAMPLE_INTERVAL_MS";
const ENV_MAX_LOG_ENTRIES: &str = "GPU_MONITOR_MAX_LOG_ENTRIES";
const ENV_LOG_FILE: &str = "GPU_MONITOR_LOG_FILE";
const ENV_WORKER_COUNT: &str = "GPU_MONITOR_WORKERS";
const ENV_METRICS_PORT: &str = "GPU_MONITOR_METRICS_PORT";
const ENV_INFLUX_HOST: &str = "GPU_MONITOR_INFLUX_HOST";
const ENV_INFLUX_DATABASE: &str = "GPU_MONITOR_INFLUX_DATABASE";
const ENV_INFLUX_TOKEN: &str = "GPU_MONITOR_INFLUX_TOKEN";
const ENV_TELEGRAM_TOKEN: &str = "GPU_MONITOR_TELEGRAM_TOKEN";
const ENV_TELEGRAM_CHAT: &str = "GPU_MONITOR_TELEGRAM_CHAT_ID";

const DEFAULT_INFLUX_DATABASE: &str = "gpu_monitor";

/// Connection settings for an InfluxDB 3 server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://localhost:8181`.
    pub host: String,
    /// Database to write into.
    pub database: String,
    /// Optional bearer token.
    pub token: Option<String>,
}

/// Telegram bot credentials for the final notification.
#[derive(Clone, PartialEq, Eq)]
pub struct TelegramConfig {
    /// Bot token.
    pub bot_token: String,
    /// Destination chat.
    pub chat_id: String,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

/// Everything a single monitor run needs to know.
///
/// The defaults reproduce the stock deployment: alert above 20 °C, take 7
/// samples one second apart, and keep the 5 most recent alerts on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Alert when the GPU temperature is strictly above this (°C).
    pub gpu_threshold: f32,
    /// Total number of samples to take before shutting down.
    pub run_events: u64,
    /// Time between samples.
    pub sample_interval: Duration,
    /// Capacity of the on-disk alert ring.
    pub max_log_entries: usize,
    /// Where the alert ring is written.
    pub log_file: PathBuf,
    /// Number of idle worker tasks to run alongside the sampler.
    pub worker_count: usize,
    /// Port for the prometheus exporter, if any.
    pub metrics_port: Option<u16>,
    /// Time-series store. `None` keeps points in memory.
    pub influx: Option<InfluxConfig>,
    /// Notification transport. `None` disables the final notification.
    pub telegram: Option<TelegramConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            gpu_threshold: 20.0,
            run_events: 7,
            sample_interval: Duration::from_secs(1),
            max_log_entries: 5,
            log_file: PathBuf::from("monitor.log"),
            worker_count: 4,
            metrics_port: None,
            influx: None,
            telegram: None,
        }
    }
}

impl MonitorConfig {
    /// Build a configuration from the defaults, overridden by any
    /// `GPU_MONITOR_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`MonitorConfig::from_env`], reading variables through
    /// `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(threshold) = parse_var(&lookup, ENV_GPU_THRESHOLD)? {
            config.gpu_threshold = threshold;
        }
        if let Some(events) = parse_var(&lookup, ENV_RUN_EVENTS)? {
            config.run_events = events;
        }
        if let Some(ms) = parse_var(&lookup, ENV_SAMPLE_INTERVAL_MS)? {
            config.sample_interval = Duration::from_millis(ms);
        }
        if let Some(entries) = parse_var(&lookup, ENV_MAX_LOG_ENTRIES)? {
            config.max_log_entries = entries;
        }
        if let Some(path) = lookup(ENV_LOG_FILE) {
            config.log_file = PathBuf::from(path);
        }
        if let Some(workers) = parse_var(&lookup, ENV_WORKER_COUNT)? {
            config.worker_count = workers;
        }
        config.metrics_port = parse_var(&lookup, ENV_METRICS_PORT)?;

        config.influx = lookup(ENV_INFLUX_HOST).map(|host| InfluxConfig {
            host: host.trim_end_matches('/').to_owned(),
            database: lookup(ENV_INFLUX_DATABASE)
                .unwrap_or_else(|| DEFAULT_INFLUX_DATABASE.to_owned()),
            token: lookup(ENV_INFLUX_TOKEN),
        });

        config.telegram = match (lookup(ENV_TELEGRAM_TOKEN), lookup(ENV_TELEGRAM_CHAT)) {
            (Some(bot_token), Some(chat_id)) if !bot_token.is_empty() && !chat_id.is_empty() => {
                Some(TelegramConfig { bot_token, chat_id })
            }
            _ => None,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the values a run cannot start with: a non-finite threshold, a
    /// zero sample interval, or a zero-capacity log.
    ///
    /// Fields are public, so [`Monitor::new`](crate::Monitor::new) checks
    /// again for configs built in code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.gpu_threshold.is_finite() {
            return Err(invalid(ENV_GPU_THRESHOLD, self.gpu_threshold, "must be finite"));
        }
        if self.sample_interval.is_zero() {
            return Err(invalid(
                ENV_SAMPLE_INTERVAL_MS,
                self.sample_interval.as_millis(),
                "must be positive",
            ));
        }
        if self.max_log_entries == 0 {
            return Err(invalid(ENV_MAX_LOG_ENTRIES, 0, "must be positive"));
        }
        Ok(())
    }

    /// Create the directory that will hold the log file.
    ///
    /// This must succeed before any task is spawned. A run never starts with
    /// a log path it cannot write to.
    pub fn prepare_log_path(&self) -> Result<&Path, ConfigError> {
        if let Some(dir) = self.log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::LogDir {
                path: dir.to_owned(),
                source,
            })?;
        }
        Ok(&self.log_file)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn invalid(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = MonitorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, MonitorConfig::default());
        assert_eq!(config.run_events, 7);
        assert_eq!(config.max_log_entries, 5);
    }

    #[test]
    fn overrides_from_environment() {
        let config = MonitorConfig::from_lookup(lookup_from(&[
            (ENV_GPU_THRESHOLD, "65.5"),
            (ENV_RUN_EVENTS, "3"),
            (ENV_SAMPLE_INTERVAL_MS, "250"),
            (ENV_MAX_LOG_ENTRIES, "10"),
            (ENV_INFLUX_HOST, "http://localhost:8181/"),
            (ENV_TELEGRAM_TOKEN, "abc"),
            (ENV_TELEGRAM_CHAT, "42"),
        ]))
        .unwrap();

        assert_eq!(config.gpu_threshold, 65.5);
        assert_eq!(config.run_events, 3);
        assert_eq!(config.sample_interval, Duration::from_millis(250));
        assert_eq!(config.max_log_entries, 10);
        let influx = config.influx.unwrap();
        assert_eq!(influx.host, "http://localhost:8181");
        assert_eq!(influx.database, DEFAULT_INFLUX_DATABASE);
        assert_eq!(config.telegram.unwrap().chat_id, "42");
    }

    #[test]
    fn telegram_needs_both_credentials() {
        let config =
            MonitorConfig::from_lookup(lookup_from(&[(ENV_TELEGRAM_TOKEN, "abc")])).unwrap();
        assert!(config.telegram.is_none());
    }

    #[test]
    fn rejects_bad_values() {
        let err = MonitorConfig::from_lookup(lookup_from(&[(ENV_RUN_EVENTS, "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_RUN_EVENTS, .. }));

        let err = MonitorConfig::from_lookup(lookup_from(&[(ENV_MAX_LOG_ENTRIES, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_MAX_LOG_ENTRIES, .. }));
    }

    #[test]
    fn validate_rejects_configs_built_in_code() {
        assert!(MonitorConfig::default().validate().is_ok());

        let zero_interval = MonitorConfig {
            sample_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            zero_interval.validate(),
            Err(ConfigError::Invalid { key: ENV_SAMPLE_INTERVAL_MS, .. })
        ));

        let nan_threshold = MonitorConfig {
            gpu_threshold: f32::NAN,
            ..Default::default()
        };
        assert!(matches!(
            nan_threshold.validate(),
            Err(ConfigError::Invalid { key: ENV_GPU_THRESHOLD, .. })
        ));
    }

    #[test]
    fn zero_interval_from_environment_is_rejected() {
        let err = MonitorConfig::from_lookup(lookup_from(&[(ENV_SAMPLE_INTERVAL_MS, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_SAMPLE_INTERVAL_MS, .. }));
    }

    #[test]
    fn prepare_log_path_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MonitorConfig {
            log_file: tmp.path().join("nested/dir/monitor.log"),
            ..Default::default()
        };
        config.prepare_log_path().unwrap();
        assert!(tmp.path().join("nested/dir").is_dir());
    }

    #[test]
    fn prepare_log_path_fails_under_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let config = MonitorConfig {
            log_file: blocker.join("monitor.log"),
            ..Default::default()
        };
        assert!(matches!(
            config.prepare_log_path(),
            Err(ConfigError::LogDir { .. })
        ));
    }
}
