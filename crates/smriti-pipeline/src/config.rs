use serde::{Deserialize, Serialize};
use smriti_core::RetryPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Pipeline configuration, from a TOML file and/or `SMRITI_*` environment
/// variables. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory of the filesystem object store.
    pub storage_root: PathBuf,
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// Selects the face recognition backend by URL scheme. Only the
    /// in-process `memory://` backend is built in; binaries refuse to start
    /// with any other value.
    pub recognition_endpoint: String,
    /// Key for signing access URLs.
    pub signing_key: String,
    /// Photos per indexing batch.
    pub batch_size: usize,
    /// Concurrent recognition calls within one batch.
    pub parallelism: usize,
    /// Attempts per collaborator call, including the first.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Deadline for a single collaborator call.
    pub call_timeout_ms: u64,
    /// Minimum match confidence, on the recognition service's scale.
    pub confidence_threshold: f32,
    /// Upper bound on raw hits collected per search.
    pub max_results: usize,
    pub url_ttl_secs: u64,
    pub session_ttl_secs: u64,
    /// Recognition calls per second across all workers; 0 disables.
    pub requests_per_second: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            storage_root: data_dir.join("objects"),
            database_path: data_dir.join("smriti.db"),
            recognition_endpoint: "memory://".to_string(),
            signing_key: random_signing_key(),
            batch_size: 25,
            parallelism: 8,
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 2000,
            call_timeout_ms: 10_000,
            confidence_threshold: 90.0,
            max_results: 1000,
            url_ttl_secs: 3600,
            session_ttl_secs: 1800,
            requests_per_second: 50,
        }
    }
}

impl PipelineConfig {
    /// Load from `SMRITI_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::default().with_env().normalized()
    }

    /// Load a TOML file, then apply `SMRITI_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(file.with_env().normalized())
    }

    fn with_env(self) -> Self {
        Self {
            storage_root: env_path("SMRITI_STORAGE_ROOT", self.storage_root),
            database_path: env_path("SMRITI_DB_PATH", self.database_path),
            recognition_endpoint: std::env::var("SMRITI_RECOGNITION_ENDPOINT")
                .unwrap_or(self.recognition_endpoint),
            signing_key: std::env::var("SMRITI_SIGNING_KEY").unwrap_or(self.signing_key),
            batch_size: env_parse("SMRITI_BATCH_SIZE", self.batch_size),
            parallelism: env_parse("SMRITI_PARALLELISM", self.parallelism),
            max_attempts: env_parse("SMRITI_MAX_ATTEMPTS", self.max_attempts),
            base_backoff_ms: env_parse("SMRITI_BASE_BACKOFF_MS", self.base_backoff_ms),
            max_backoff_ms: env_parse("SMRITI_MAX_BACKOFF_MS", self.max_backoff_ms),
            call_timeout_ms: env_parse("SMRITI_CALL_TIMEOUT_MS", self.call_timeout_ms),
            confidence_threshold: env_parse(
                "SMRITI_CONFIDENCE_THRESHOLD",
                self.confidence_threshold,
            ),
            max_results: env_parse("SMRITI_MAX_RESULTS", self.max_results),
            url_ttl_secs: env_parse("SMRITI_URL_TTL_SECS", self.url_ttl_secs),
            session_ttl_secs: env_parse("SMRITI_SESSION_TTL_SECS", self.session_ttl_secs),
            requests_per_second: env_parse("SMRITI_REQUESTS_PER_SECOND", self.requests_per_second),
        }
    }

    /// Clamp values that would stall the pipeline.
    pub fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.parallelism = self.parallelism.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self.max_results = self.max_results.max(1);
        self.max_backoff_ms = self.max_backoff_ms.max(self.base_backoff_ms);
        if self.signing_key.is_empty() {
            self.signing_key = random_signing_key();
        }
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }

    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("smriti")
}

/// Per-process key; signed URLs will not verify across restarts.
fn random_signing_key() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.parallelism, 8);
        assert_eq!(cfg.confidence_threshold, 90.0);
        assert_eq!(cfg.url_ttl(), Duration::from_secs(3600));
        assert_eq!(cfg.signing_key.len(), 64);
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "batch_size = 10\nconfidence_threshold = 80.5\nsigning_key = \"secret\"\nurl_ttl_secs = 60"
        )
        .unwrap();
        let cfg = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.confidence_threshold, 80.5);
        assert_eq!(cfg.signing_key, "secret");
        assert_eq!(cfg.url_ttl_secs, 60);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.parallelism, 8);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batch_size = \"many\"").unwrap();
        assert!(matches!(
            PipelineConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_normalized_clamps() {
        let cfg = PipelineConfig {
            batch_size: 0,
            parallelism: 0,
            max_attempts: 0,
            base_backoff_ms: 500,
            max_backoff_ms: 100,
            signing_key: String::new(),
            ..PipelineConfig::default()
        }
        .normalized();
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.parallelism, 1);
        assert_eq!(cfg.max_attempts, 1);
        assert_eq!(cfg.max_backoff_ms, 500);
        assert!(!cfg.signing_key.is_empty());
    }

    #[test]
    fn test_retry_policy_view() {
        let cfg = PipelineConfig {
            max_attempts: 3,
            base_backoff_ms: 50,
            max_backoff_ms: 400,
            call_timeout_ms: 1500,
            ..PipelineConfig::default()
        };
        let p = cfg.retry_policy();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.base_delay, Duration::from_millis(50));
        assert_eq!(p.max_delay, Duration::from_millis(400));
        assert_eq!(p.call_timeout, Duration::from_millis(1500));
    }
}
