//! # Ingest Configuration
//!
//! Every setting can come from three places, merged in this order (later
//! wins): built-in defaults, the JSON config file, then environment
//! variables and CLI flags. `.env` files are loaded into the environment
//! first.
//!
//! The service topology and the project table only come from the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::backpressure::{HealthPolicy, ServiceDefinition};
use crate::core::consumer::RetryBackoff;
use crate::error::ConfigError;
use crate::model::Project;

const DEFAULT_CONFIG_FILE: &str = "server_ingest.conf";

/// Raw configuration from one source. Every field is optional so sources
/// can be layered.
#[allow(missing_docs)]
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Event ingestion consumer and admission monitor", version)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngestConfig {
    #[clap(long, env = "INGEST_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "INGEST_REDIS_URL", help = "Redis URL for caches, task queues and partitions.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "INGEST_PARTITIONS", value_delimiter = ',', help = "Comma separated partition list names.")]
    pub partitions: Option<Vec<String>>,

    #[clap(long, env = "INGEST_KILLSWITCH_PATH", help = "Path to the killswitch JSON file.")]
    pub killswitch_path: Option<PathBuf>,

    #[clap(long, env = "INGEST_KILLSWITCH_RELOAD_SECONDS", help = "Seconds between killswitch file reloads.")]
    pub killswitch_reload_seconds: Option<u64>,

    #[clap(long, env = "INGEST_CACHE_TTL_SECONDS", help = "Lifetime of dedup records and cached attachments.")]
    pub cache_ttl_seconds: Option<u64>,

    #[clap(long, env = "INGEST_OPERATION_TIMEOUT_MS", help = "Timeout of each cache, store and queue call.")]
    pub operation_timeout_ms: Option<u64>,

    #[clap(long, env = "INGEST_RETRY_BASE_DELAY_MS", help = "Base delay before retrying a message.")]
    pub retry_base_delay_ms: Option<u64>,

    #[clap(long, env = "INGEST_RETRY_MAX_DELAY_MS", help = "Maximum delay before retrying a message.")]
    pub retry_max_delay_ms: Option<u64>,

    #[clap(long, env = "INGEST_REPROCESS_ONLY_STUCK_EVENTS", help = "Only process events already in the processing store.")]
    pub reprocess_only_stuck_events: Option<bool>,

    #[clap(long, env = "INGEST_INTERNAL_PROJECT_ID", help = "Project id of the system's own events.")]
    pub internal_project_id: Option<u64>,

    #[clap(long, env = "INGEST_TASK_QUEUE_PREFIX", help = "Key prefix of the downstream task lists.")]
    pub task_queue_prefix: Option<String>,

    #[clap(long, env = "INGEST_MONITOR_INTERVAL_MS", help = "Interval of the admission monitor.")]
    pub monitor_interval_ms: Option<u64>,

    #[clap(long, env = "INGEST_NODE_TIMEOUT_MS", help = "Timeout of one node memory read.")]
    pub node_timeout_ms: Option<u64>,

    #[clap(long, env = "INGEST_HIGH_WATERMARK", help = "Memory fraction above which a node is pressured.")]
    pub high_watermark: Option<f64>,

    #[clap(long, env = "INGEST_MAX_UNHEALTHY_RATIO", help = "Fraction of pressured nodes a service tolerates.")]
    pub max_unhealthy_ratio: Option<f64>,

    #[clap(long, env = "INGEST_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "INGEST_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(skip)]
    pub services: Option<BTreeMap<String, Vec<String>>>,

    #[clap(skip)]
    pub projects: Option<Vec<Project>>,
}

impl IngestConfig {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: IngestConfig) -> IngestConfig {
        IngestConfig {
            config_path: other.config_path.or(self.config_path),
            redis_url: other.redis_url.or(self.redis_url),
            partitions: other.partitions.or(self.partitions),
            killswitch_path: other.killswitch_path.or(self.killswitch_path),
            killswitch_reload_seconds: other.killswitch_reload_seconds.or(self.killswitch_reload_seconds),
            cache_ttl_seconds: other.cache_ttl_seconds.or(self.cache_ttl_seconds),
            operation_timeout_ms: other.operation_timeout_ms.or(self.operation_timeout_ms),
            retry_base_delay_ms: other.retry_base_delay_ms.or(self.retry_base_delay_ms),
            retry_max_delay_ms: other.retry_max_delay_ms.or(self.retry_max_delay_ms),
            reprocess_only_stuck_events: other.reprocess_only_stuck_events.or(self.reprocess_only_stuck_events),
            internal_project_id: other.internal_project_id.or(self.internal_project_id),
            task_queue_prefix: other.task_queue_prefix.or(self.task_queue_prefix),
            monitor_interval_ms: other.monitor_interval_ms.or(self.monitor_interval_ms),
            node_timeout_ms: other.node_timeout_ms.or(self.node_timeout_ms),
            high_watermark: other.high_watermark.or(self.high_watermark),
            max_unhealthy_ratio: other.max_unhealthy_ratio.or(self.max_unhealthy_ratio),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            services: other.services.or(self.services),
            projects: other.projects.or(self.projects),
        }
    }

    fn defaults() -> IngestConfig {
        let policy = HealthPolicy::default();
        IngestConfig {
            redis_url: Some("redis://127.0.0.1:6379".to_string()),
            partitions: Some(vec!["ingest:events:0".to_string()]),
            killswitch_reload_seconds: Some(5),
            cache_ttl_seconds: Some(3600),
            operation_timeout_ms: Some(2000),
            retry_base_delay_ms: Some(100),
            retry_max_delay_ms: Some(10_000),
            reprocess_only_stuck_events: Some(false),
            task_queue_prefix: Some("ingest:tasks".to_string()),
            monitor_interval_ms: Some(5000),
            node_timeout_ms: Some(500),
            high_watermark: Some(policy.high_watermark),
            max_unhealthy_ratio: Some(policy.max_unhealthy_ratio),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    /// Reads a JSON config file.
    pub fn from_file(path: &Path) -> Result<IngestConfig, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Merges defaults, the config file and `cli` (which already carries
    /// environment values) into [`Settings`].
    pub fn resolve(cli: IngestConfig) -> Result<Settings, ConfigError> {
        let mut config = Self::defaults();

        let file_path = cli
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if file_path.exists() {
            config = config.merge(Self::from_file(&file_path)?);
        }

        config = config.merge(cli);
        Settings::try_from(config)
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Redis URL.
    pub redis_url: String,
    /// Partition list names, one worker each.
    pub partitions: Vec<String>,
    /// Killswitch file, if any.
    pub killswitch_path: Option<PathBuf>,
    /// Interval between killswitch file reloads.
    pub killswitch_reload: Duration,
    /// Lifetime of dedup records and cached attachments.
    pub cache_ttl: Duration,
    /// Timeout of each collaborator call.
    pub operation_timeout: Duration,
    /// Backoff between retries of a message.
    pub retry: RetryBackoff,
    /// Only process events already held by the processing store.
    pub reprocess_only_stuck_events: bool,
    /// The system's own project.
    pub internal_project_id: Option<u64>,
    /// Key prefix of the task lists.
    pub task_queue_prefix: String,
    /// Admission monitor interval.
    pub monitor_interval: Duration,
    /// Timeout of one node read.
    pub node_timeout: Duration,
    /// Verdict policy.
    pub health: HealthPolicy,
    /// Monitored services.
    pub services: Vec<ServiceDefinition>,
    /// Project table.
    pub projects: Vec<Project>,
    /// Log directory.
    pub log_dir: PathBuf,
    /// Log level.
    pub log_level: String,
}

impl TryFrom<IngestConfig> for Settings {
    type Error = ConfigError;

    fn try_from(config: IngestConfig) -> Result<Self, Self::Error> {
        fn required<T>(value: Option<T>, name: &str) -> Result<T, ConfigError> {
            value.ok_or_else(|| ConfigError::Invalid(format!("missing setting `{}`", name)))
        }

        let redis_url = required(config.redis_url, "redisUrl")?;
        let partitions = required(config.partitions, "partitions")?;
        if partitions.is_empty() {
            return Err(ConfigError::Invalid("no partitions configured".to_string()));
        }

        let health = HealthPolicy {
            high_watermark: required(config.high_watermark, "highWatermark")?,
            max_unhealthy_ratio: required(config.max_unhealthy_ratio, "maxUnhealthyRatio")?,
        };
        if !(0.0..=1.0).contains(&health.high_watermark) || !(0.0..=1.0).contains(&health.max_unhealthy_ratio) {
            return Err(ConfigError::Invalid("health thresholds must be within 0..=1".to_string()));
        }

        let services = match config.services {
            Some(map) => map
                .into_iter()
                .map(|(name, nodes)| ServiceDefinition { name, nodes })
                .collect(),
            None => vec![ServiceDefinition {
                name: "redis".to_string(),
                nodes: vec![redis_url.clone()],
            }],
        };

        Ok(Settings {
            partitions,
            killswitch_path: config.killswitch_path,
            killswitch_reload: Duration::from_secs(required(config.killswitch_reload_seconds, "killswitchReloadSeconds")?),
            cache_ttl: Duration::from_secs(required(config.cache_ttl_seconds, "cacheTtlSeconds")?),
            operation_timeout: Duration::from_millis(required(config.operation_timeout_ms, "operationTimeoutMs")?),
            retry: RetryBackoff {
                base: Duration::from_millis(required(config.retry_base_delay_ms, "retryBaseDelayMs")?),
                max: Duration::from_millis(required(config.retry_max_delay_ms, "retryMaxDelayMs")?),
            },
            reprocess_only_stuck_events: config.reprocess_only_stuck_events.unwrap_or(false),
            internal_project_id: config.internal_project_id,
            task_queue_prefix: required(config.task_queue_prefix, "taskQueuePrefix")?,
            monitor_interval: Duration::from_millis(required(config.monitor_interval_ms, "monitorIntervalMs")?),
            node_timeout: Duration::from_millis(required(config.node_timeout_ms, "nodeTimeoutMs")?),
            health,
            services,
            projects: config.projects.unwrap_or_default(),
            log_dir: required(config.log_dir, "logDir")?,
            log_level: required(config.log_level, "logLevel")?,
            redis_url,
        })
    }
}

/// Loads `.env`, parses CLI/env and resolves [`Settings`].
pub fn load_config() -> Result<Settings, ConfigError> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    IngestConfig::resolve(IngestConfig::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_overrides_file_which_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "redisUrl": "redis://cache:6379",
                "operationTimeoutMs": 750,
                "services": {{"cache": ["redis://cache:6379"], "store": ["redis://store-1:6379", "redis://store-2:6379"]}},
                "projects": [{{"id": 7, "organization_id": 3, "features": {{"event_attachments": true}}}}]
            }}"#
        )
        .unwrap();
        file.flush().unwrap();

        let path = file.path().to_string_lossy().to_string();
        let cli = IngestConfig::try_parse_from([
            "server_ingest",
            "--config-path",
            path.as_str(),
            "--operation-timeout-ms",
            "300",
            "--partitions",
            "p0,p1",
        ])
        .unwrap();
        let settings = IngestConfig::resolve(cli).unwrap();

        assert_eq!(settings.redis_url, "redis://cache:6379");
        assert_eq!(settings.operation_timeout, Duration::from_millis(300));
        assert_eq!(settings.partitions, vec!["p0".to_string(), "p1".to_string()]);
        assert_eq!(settings.cache_ttl, Duration::from_secs(3600));
        assert_eq!(settings.services.len(), 2);
        assert_eq!(settings.services[1].nodes.len(), 2);
        assert!(settings.projects[0].features.event_attachments);
    }

    #[test]
    fn monitors_the_main_redis_without_a_topology() {
        let cli = IngestConfig {
            config_path: Some(PathBuf::from("/nonexistent/server_ingest.conf")),
            ..Default::default()
        };
        let settings = IngestConfig::resolve(cli).unwrap();
        assert_eq!(
            settings.services,
            vec![ServiceDefinition {
                name: "redis".to_string(),
                nodes: vec!["redis://127.0.0.1:6379".to_string()],
            }]
        );
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let cli = IngestConfig {
            config_path: Some(PathBuf::from("/nonexistent/server_ingest.conf")),
            high_watermark: Some(1.5),
            ..Default::default()
        };
        assert!(matches!(IngestConfig::resolve(cli), Err(ConfigError::Invalid(_))));
    }
}
