//! Gateway configuration
//!
//! Configuration is read from a single YAML file. Every field has a default
//! so a partial file (or none at all) yields a working standalone setup.
//! Cluster definitions may additionally be split into one YAML file per
//! cluster inside `cluster_config_dir`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/objgate/objgate.yaml";

// =============================================================================
// Configuration
// =============================================================================

/// Top level configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GatewayConfig {
    pub storage: StorageConfig,
    pub clusters: Vec<ClusterConfig>,
    pub cluster_config_dir: Option<PathBuf>,
    pub timeouts: TimeoutConfig,
    pub lifecycle: LifecycleConfig,
    pub restore: RestoreConfig,
    pub recycle: RecycleConfig,
    pub log: LogConfig,
}

/// Data path sizing and admission.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StorageConfig {
    /// Objects strictly smaller than this go to the small pool.
    pub small_object_threshold: u64,
    /// Lower bound of the adaptive upload window.
    pub upload_min_chunk: u64,
    /// Upper bound of the adaptive upload window.
    pub upload_max_chunk: u64,
    /// Clusters above this usage percentage are not chosen.
    pub cluster_max_used_percent: u8,
    /// How often cluster usage is re-sampled.
    pub usage_refresh_interval: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            small_object_threshold: 512 << 10,
            upload_min_chunk: 512 << 10,
            upload_max_chunk: 8 << 20,
            cluster_max_used_percent: 85,
            usage_refresh_interval: "24h".to_string(),
        }
    }
}

/// One backend cluster.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ClusterConfig {
    /// Cluster identity (fsid).
    pub id: String,
    /// Registered backend constructor name.
    pub backend: String,
    /// Root path for file backed clusters.
    pub path: Option<PathBuf>,
    /// Selection weight per pool name. Zero or missing excludes the pool.
    pub weights: HashMap<String, u32>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: "local".to_string(),
            backend: "memory".to_string(),
            path: None,
            weights: HashMap::from([
                ("small".to_string(), 1),
                ("big".to_string(), 1),
                ("cold".to_string(), 1),
            ]),
        }
    }
}

/// Network and queue timeouts.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TimeoutConfig {
    pub queue_admission: String,
    pub connect: String,
    pub read: String,
    pub write: String,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            queue_admission: "10s".to_string(),
            connect: "10s".to_string(),
            read: "10s".to_string(),
            write: "10s".to_string(),
        }
    }
}

/// Lifecycle scanner settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LifecycleConfig {
    /// Interval between scan passes.
    pub scan_interval: String,
    /// Scan range start, hex encoded. Empty means the beginning.
    pub scan_start: String,
    /// Scan range end, hex encoded. Empty means the end.
    pub scan_end: String,
    /// Topic lifecycle jobs are published on.
    pub topic: String,
    /// Number of bus partitions (one worker each).
    pub partitions: usize,
    /// Keys fetched per range scan page.
    pub scan_batch: usize,
    /// One "day" lasts one second.
    pub debug_mode: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            scan_interval: "5s".to_string(),
            scan_start: String::new(),
            scan_end: String::new(),
            topic: "lifecycle".to_string(),
            partitions: 4,
            scan_batch: 256,
            debug_mode: false,
        }
    }
}

/// Restore orchestrator settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RestoreConfig {
    /// Lock lease in minutes.
    pub lock_minutes: u64,
    /// Lock refresh interval in minutes.
    pub refresh_minutes: u64,
    /// Freezer records fetched per page.
    pub list_limit: usize,
    /// Repeat the restore pass on an interval.
    pub enable_cron: bool,
    /// Interval between restore passes.
    pub interval: String,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            lock_minutes: 45,
            refresh_minutes: 30,
            list_limit: 100,
            enable_cron: false,
            interval: "24h".to_string(),
        }
    }
}

/// Recycle queue settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RecycleConfig {
    pub workers: usize,
    pub max_tries: u32,
    pub backoff_cap: String,
}

impl Default for RecycleConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_tries: 3,
            backoff_cap: "5s".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// =============================================================================
// Loading
// =============================================================================

impl GatewayConfig {
    /// Load configuration from `path`.
    ///
    /// When `required` is false a missing file yields the defaults.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                info!("No config at {}, using defaults", path.display());
                return Self::default().with_cluster_files();
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Self::from_yaml(&raw)?.with_cluster_files()
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_yaml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Merge per-cluster files from `cluster_config_dir`.
    fn with_cluster_files(mut self) -> Result<Self> {
        if let Some(dir) = self.cluster_config_dir.clone() {
            for cluster in load_cluster_dir(&dir)? {
                if self.clusters.iter().any(|c| c.id == cluster.id) {
                    return Err(Error::Config(format!("duplicate cluster id {}", cluster.id)));
                }
                self.clusters.push(cluster);
            }
        }
        if self.clusters.is_empty() {
            self.clusters.push(ClusterConfig::default());
        }
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        let s = &self.storage;
        if s.upload_min_chunk == 0 || s.upload_min_chunk > s.upload_max_chunk {
            return Err(Error::Config(format!(
                "upload window bounds invalid: min {} max {}",
                s.upload_min_chunk, s.upload_max_chunk
            )));
        }
        if s.cluster_max_used_percent > 100 {
            return Err(Error::Config(
                "cluster_max_used_percent must be at most 100".to_string(),
            ));
        }
        if self.lifecycle.partitions == 0 {
            return Err(Error::Config("lifecycle.partitions must be positive".to_string()));
        }
        if self.restore.refresh_minutes >= self.restore.lock_minutes {
            return Err(Error::Config(
                "restore.refresh_minutes must be shorter than restore.lock_minutes".to_string(),
            ));
        }
        parse_duration(&s.usage_refresh_interval)?;
        parse_duration(&self.lifecycle.scan_interval)?;
        parse_duration(&self.restore.interval)?;
        parse_duration(&self.recycle.backoff_cap)?;
        self.timeouts.resolve()?;
        Ok(())
    }
}

impl TimeoutConfig {
    /// Parsed timeouts.
    pub fn resolve(&self) -> Result<Timeouts> {
        Ok(Timeouts {
            queue_admission: parse_duration(&self.queue_admission)?,
            connect: parse_duration(&self.connect)?,
            read: parse_duration(&self.read)?,
            write: parse_duration(&self.write)?,
        })
    }
}

/// Resolved timeouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub queue_admission: Duration,
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        let ten = Duration::from_secs(10);
        Self {
            queue_admission: ten,
            connect: ten,
            read: ten,
            write: ten,
        }
    }
}

fn load_cluster_dir(dir: &Path) -> Result<Vec<ClusterConfig>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("failed to list {}: {}", dir.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    let mut clusters = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let cluster: ClusterConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded cluster {} from {}", cluster.id, path.display());
        clusters.push(cluster);
    }
    Ok(clusters)
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration string like "30s", "5m", "24h", "7d" or "1h30m".
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'd' | 'D' => 86400,
            'h' | 'H' => 3600,
            'm' | 'M' => 60,
            's' | 'S' => 1,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };
        total_secs = total_secs.saturating_add(num.saturating_mul(multiplier));
    }

    // Bare trailing number counts as seconds
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_secs = total_secs.saturating_add(num);
    }

    Ok(Duration::from_secs(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("5x"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("h"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.storage.upload_min_chunk, 512 * 1024);
        assert_eq!(config.storage.upload_max_chunk, 8 * 1024 * 1024);
        assert_eq!(config.storage.cluster_max_used_percent, 85);
        assert_eq!(config.restore.lock_minutes, 45);
        assert_eq!(config.restore.refresh_minutes, 30);
        assert_eq!(config.restore.list_limit, 100);
        assert_eq!(config.recycle.max_tries, 3);
        assert_eq!(config.timeouts.resolve().unwrap(), Timeouts::default());
    }

    #[test]
    fn test_from_yaml_partial() {
        let raw = r#"
storage:
  small_object_threshold: 1024
clusters:
  - id: c1
    backend: memory
    weights:
      big: 3
lifecycle:
  debug_mode: true
"#;
        let config = GatewayConfig::from_yaml(raw).unwrap();
        assert_eq!(config.storage.small_object_threshold, 1024);
        assert_eq!(config.storage.upload_max_chunk, 8 << 20);
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].weights.get("big"), Some(&3));
        assert!(config.lifecycle.debug_mode);
    }

    #[test]
    fn test_from_yaml_rejects_bad_window() {
        let raw = r#"
storage:
  upload_min_chunk: 1048576
  upload_max_chunk: 1024
"#;
        assert_matches!(GatewayConfig::from_yaml(raw), Err(Error::Config(_)));
    }

    #[test]
    fn test_load_missing_optional_uses_defaults() {
        let config =
            GatewayConfig::load(Path::new("/nonexistent/objgate.yaml"), false).unwrap();
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].id, "local");
    }

    #[test]
    fn test_load_missing_required_fails() {
        assert_matches!(
            GatewayConfig::load(Path::new("/nonexistent/objgate.yaml"), true),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_cluster_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "id: a\nbackend: memory\nweights:\n  big: 1\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "id: x").unwrap();
        let main = dir.path().join("main.yaml.conf");
        std::fs::write(
            &main,
            format!("cluster_config_dir: {}\n", dir.path().display()),
        )
        .unwrap();

        let config = GatewayConfig::load(&main, true).unwrap();
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].id, "a");
    }
}
