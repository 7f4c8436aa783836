//! Gate configuration.
//!
//! Every tunable lives here so services can be constructed with an explicit
//! config value instead of reading the environment at point of use.
//! `from_env()` reads `DATAGATE_*` variables and falls back to defaults;
//! `validate()` clamps values into safe ranges.

use std::path::PathBuf;
use std::time::Duration;

use crate::orchestration::similarity::LexicalMetric;

/// Bounds applied by [`GateConfig::validate`].
const MIN_RUN_TTL: Duration = Duration::from_secs(30);
const MAX_RUN_TTL: Duration = Duration::from_secs(3600);

/// Retry delay shape for step execution.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub base: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Hard ceiling on the computed delay (jitter excluded)
    pub cap: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
        }
    }
}

/// Configuration for the whole gate.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Absolute TTL for a procedure run
    pub run_ttl: Duration,
    /// How long terminal runs stay in the registry before purge
    pub run_retention: Duration,
    /// Interval for the expiry/purge sweep
    pub sweep_interval: Duration,
    /// Debounce delay between a registry mutation and the snapshot write
    pub persist_debounce: Duration,
    /// Path of the run snapshot file; `None` disables persistence
    pub snapshot_path: Option<PathBuf>,

    /// Debounce delay between an audit record and the batch flush
    pub audit_flush_debounce: Duration,
    /// In-memory audit ring size
    pub audit_ring_capacity: usize,
    /// Directory for day-partitioned audit files; `None` keeps memory only
    pub audit_dir: Option<PathBuf>,

    /// Per-entry TTL in the governance definition cache
    pub store_cache_ttl: Duration,
    /// Definition cache size ceiling (oldest-accessed evicted first)
    pub store_cache_capacity: usize,

    /// Lexical metric for purpose-text similarity
    pub similarity_metric: LexicalMetric,
    /// Score at or above which a candidate is reusable
    pub reuse_threshold: f64,
    /// Score at or above which a candidate is extendable
    pub extend_threshold: f64,
    /// TTL for the similarity corpus snapshot
    pub analysis_cache_ttl: Duration,

    /// Step retry delay shape
    pub retry: RetryConfig,

    /// Agent bus drain interval
    pub bus_drain_interval: Duration,
    /// Delivery attempts per bus message before it is dropped
    pub bus_max_attempts: u32,
    /// How long completed orchestration sessions linger before GC
    pub session_grace: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            run_ttl: Duration::from_secs(300),
            run_retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(10),
            persist_debounce: Duration::from_millis(500),
            snapshot_path: Some(PathBuf::from("./datagate-runs.json")),
            audit_flush_debounce: Duration::from_secs(2),
            audit_ring_capacity: 1000,
            audit_dir: Some(PathBuf::from("./audit")),
            store_cache_ttl: Duration::from_secs(300),
            store_cache_capacity: 256,
            similarity_metric: LexicalMetric::Jaccard,
            reuse_threshold: 0.75,
            extend_threshold: 0.6,
            analysis_cache_ttl: Duration::from_secs(300),
            retry: RetryConfig::default(),
            bus_drain_interval: Duration::from_millis(200),
            bus_max_attempts: 3,
            session_grace: Duration::from_secs(60),
        }
    }
}

impl GateConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATAGATE_RUN_TTL_SECS` - run TTL (default: 300)
    /// - `DATAGATE_RUN_RETENTION_SECS` - terminal run retention (default: 3600)
    /// - `DATAGATE_SNAPSHOT_PATH` - run snapshot file
    /// - `DATAGATE_AUDIT_DIR` - audit log directory
    /// - `DATAGATE_SIMILARITY_METRIC` - `jaccard` | `levenshtein` | `cosine`
    /// - `DATAGATE_REUSE_THRESHOLD` - reuse score threshold (default: 0.75)
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_u64("DATAGATE_RUN_TTL_SECS") {
            config.run_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DATAGATE_RUN_RETENTION_SECS") {
            config.run_retention = Duration::from_secs(secs);
        }
        if let Ok(path) = std::env::var("DATAGATE_SNAPSHOT_PATH") {
            config.snapshot_path = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("DATAGATE_AUDIT_DIR") {
            config.audit_dir = Some(PathBuf::from(dir));
        }
        if let Ok(metric) = std::env::var("DATAGATE_SIMILARITY_METRIC") {
            config.similarity_metric = match metric.to_lowercase().as_str() {
                "levenshtein" => LexicalMetric::Levenshtein,
                "cosine" => LexicalMetric::Cosine,
                _ => LexicalMetric::Jaccard,
            };
        }
        if let Some(threshold) = env_f64("DATAGATE_REUSE_THRESHOLD") {
            config.reuse_threshold = threshold;
        }

        config.validate()
    }

    /// Clamp values into safe ranges and return the corrected config.
    ///
    /// Out-of-range values are corrected rather than rejected: a gate that
    /// refuses to start over a bad tunable fails open for the operations it
    /// was supposed to govern.
    #[must_use]
    pub fn validate(mut self) -> Self {
        self.run_ttl = self.run_ttl.clamp(MIN_RUN_TTL, MAX_RUN_TTL);
        self.reuse_threshold = self.reuse_threshold.clamp(0.0, 1.0);
        self.extend_threshold = self.extend_threshold.clamp(0.0, self.reuse_threshold);
        if self.audit_ring_capacity == 0 {
            self.audit_ring_capacity = 1;
        }
        if self.store_cache_capacity == 0 {
            self.store_cache_capacity = 1;
        }
        if self.bus_max_attempts == 0 {
            self.bus_max_attempts = 1;
        }
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
