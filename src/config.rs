//! Layered configuration, loaded defaults → file → environment via the
//! `config` crate, split into a storage/loops/smtp/rate-limit/cache/
//! attachments/reporting section trio of nested structs.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub storage: StorageConfig,
    pub concurrency: ConcurrencyConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub smtp: SmtpConfig,
    pub http: HttpConfig,
    pub loops: LoopConfig,
    pub retention: RetentionConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            smtp: SmtpConfig::default(),
            http: HttpConfig::default(),
            loops: LoopConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `sqlite:<path>` or `postgres://...` — the scheme selects the adapter.
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { database_url: "sqlite://relaycore.db".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_sends: usize,
    pub max_concurrent_per_account: usize,
    pub attachment_concurrency: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_concurrent_sends: num_cpus::get() * 4, max_concurrent_per_account: 4, attachment_concurrency: 16 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory_capacity_bytes: u64,
    pub disk_capacity_bytes: u64,
    pub disk_dir: String,
    #[serde(with = "humantime_serde")]
    pub entry_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity_bytes: 64 * 1024 * 1024,
            disk_capacity_bytes: 1024 * 1024 * 1024,
            disk_dir: "/var/lib/relaycore/attachment-cache".to_string(),
            entry_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Literal per-attempt backoff table rather than a formula: retry 0 waits
/// `schedule[0]`, retry 1 waits `schedule[1]`, and so on; a message still
/// failing past the last entry is permanently failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "duration_seq_serde")]
    pub schedule: Vec<Duration>,
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            schedule: [60, 300, 900, 3600, 7200].into_iter().map(Duration::from_secs).collect(),
            jitter_fraction: 0.2,
        }
    }
}

mod duration_seq_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        durations
            .iter()
            .map(|d| humantime::format_duration(*d).to_string())
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|s| humantime::parse_duration(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub max_per_account: usize,
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self { max_per_account: 4, idle_ttl: Duration::from_secs(120) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub filesystem_base_dir: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30), filesystem_base_dir: "/var/lib/relaycore/attachments".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    #[serde(with = "humantime_serde")]
    pub dispatch_tick: Duration,
    #[serde(with = "humantime_serde")]
    pub report_tick: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_tick: Duration,
    pub dispatch_batch_size: usize,
    pub report_batch_size: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            dispatch_tick: Duration::from_secs(2),
            report_tick: Duration::from_secs(10),
            cleanup_tick: Duration::from_secs(3600),
            dispatch_batch_size: 200,
            report_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    #[serde(with = "humantime_serde")]
    pub default_retention: Duration,
    #[serde(with = "humantime_serde")]
    pub send_log_retention: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { default_retention: Duration::from_secs(30 * 86_400), send_log_retention: Duration::from_secs(2 * 86_400) }
    }
}

impl RelayConfig {
    /// Loads config layered defaults → optional file → `RELAYCORE_` env
    /// prefixed overrides, each layer overriding the last.
    pub fn load(config_file: Option<&str>) -> RelayResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&RelayConfig::default()).map_err(config_err)?);

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("RELAYCORE").separator("__"));

        let built = builder.build().map_err(config_err)?;
        built.try_deserialize().map_err(config_err)
    }
}

fn config_err(e: config::ConfigError) -> RelayError {
    RelayError::Configuration(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        let config = RelayConfig::load(None).unwrap();
        assert_eq!(config.smtp.max_per_account, 4);
        assert_eq!(config.loops.dispatch_batch_size, 200);
    }

    #[test]
    fn default_retry_schedule_matches_the_documented_table() {
        let config = RelayConfig::load(None).unwrap();
        let secs: Vec<u64> = config.retry.schedule.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![60, 300, 900, 3600, 7200]);
    }
}
