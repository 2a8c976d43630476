//! Tunable settings for caches, retries and diagnostics.
//!
//! A [`CourierConfig`] is an immutable snapshot. Components receive a
//! [`ConfigHandle`] at construction; updates publish a fresh snapshot so readers
//! never lock.

use std::{collections::BTreeMap, env, fmt, str::FromStr, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Namespace holding resolved [`crate::identity::SenderInfo`] values.
pub const LID_CACHE: &str = "lidCache";
/// Namespace memoizing structural identifier conversions.
pub const JID_CACHE: &str = "jidCache";
/// Namespace holding learned LID <-> JID mappings.
pub const LID_TO_JID_CACHE: &str = "lidToJidCache";

const DEFAULT_IDENTITY_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MEMORY_THRESHOLD: f64 = 0.85;
const DEFAULT_MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Severity levels understood by the diagnostic gate, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// Sizing of one cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Lifetime of an entry measured from its last explicit set.
    pub ttl: Duration,
    /// Upper bound on live entries.
    pub max_size: usize,
    /// Period of the background expiry sweep.
    pub cleanup_interval: Duration,
}

impl CacheSettings {
    pub fn new(ttl: Duration, max_size: usize, cleanup_interval: Duration) -> Self {
        Self {
            ttl,
            max_size,
            cleanup_interval,
        }
    }
}

/// Runtime tuning shared by the retry executor and the cache manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSettings {
    /// When false, identifier resolution recomputes on every call.
    pub enable_cache: bool,
    /// Enables the memory-pressure monitor.
    pub enable_metrics: bool,
    /// Preferred batch size for bulk acknowledgements.
    pub batch_size: usize,
    /// Default retry count for [`crate::retry::RetryPolicy::from_config`].
    pub max_retries: u32,
    /// Default base delay between retries.
    pub retry_delay: Duration,
    /// Default ceiling on the delay between retries.
    pub max_retry_delay: Duration,
    /// Maximum number of resend requests honoured for one message.
    pub max_msg_retry_count: u32,
    /// In-use / total memory ratio above which caches are trimmed.
    pub memory_threshold: f64,
    /// Sampling period of the memory-pressure monitor.
    pub memory_check_interval: Duration,
    /// Process memory budget in bytes the pressure ratio is measured against.
    /// `None` measures against the machine's total memory.
    pub memory_budget_bytes: Option<u64>,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            enable_cache: true,
            enable_metrics: true,
            batch_size: 50,
            max_retries: 5,
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(60),
            max_msg_retry_count: 3,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            memory_check_interval: DEFAULT_MEMORY_CHECK_INTERVAL,
            memory_budget_bytes: None,
        }
    }
}

/// Diagnostic switches, normally seeded from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSettings {
    pub enable_lid_logging: bool,
    pub enable_performance_logging: bool,
    pub enable_error_logging: bool,
    pub log_level: LogLevel,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            enable_lid_logging: false,
            enable_performance_logging: false,
            enable_error_logging: true,
            log_level: LogLevel::Error,
        }
    }
}

/// Complete configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Cache namespaces keyed by name.
    pub cache: BTreeMap<String, CacheSettings>,
    pub performance: PerformanceSettings,
    pub debug: DebugSettings,
}

impl Default for CourierConfig {
    fn default() -> Self {
        let mut cache = BTreeMap::new();
        cache.insert(
            LID_CACHE.to_owned(),
            CacheSettings::new(DEFAULT_IDENTITY_TTL, 10_000, Duration::from_secs(2 * 60)),
        );
        cache.insert(
            JID_CACHE.to_owned(),
            CacheSettings::new(DEFAULT_IDENTITY_TTL, 10_000, Duration::from_secs(2 * 60)),
        );
        cache.insert(
            LID_TO_JID_CACHE.to_owned(),
            CacheSettings::new(DEFAULT_IDENTITY_TTL, 5_000, Duration::from_secs(3 * 60)),
        );

        Self {
            cache,
            performance: PerformanceSettings::default(),
            debug: DebugSettings::default(),
        }
    }
}

impl CourierConfig {
    /// Defaults overlaid with `DEBUG_LID`, `DEBUG_PERFORMANCE`, `LOG_LEVEL`
    /// and `COURIER_MEMORY_BUDGET_MB`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.debug.enable_lid_logging = flag_enabled("DEBUG_LID", &mut lookup);
        config.debug.enable_performance_logging = flag_enabled("DEBUG_PERFORMANCE", &mut lookup);

        if let Some(value) = lookup("LOG_LEVEL").filter(|v| !v.trim().is_empty()) {
            config.debug.log_level =
                value
                    .parse::<LogLevel>()
                    .map_err(|reason| ConfigError::InvalidValue {
                        key: "LOG_LEVEL",
                        value: value.clone(),
                        reason,
                    })?;
        }

        if let Some(value) = lookup("COURIER_MEMORY_BUDGET_MB").filter(|v| !v.trim().is_empty()) {
            let megabytes =
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|err| ConfigError::InvalidValue {
                        key: "COURIER_MEMORY_BUDGET_MB",
                        value: value.clone(),
                        reason: err.to_string(),
                    })?;
            config.performance.memory_budget_bytes =
                (megabytes > 0).then(|| megabytes.saturating_mul(1024 * 1024));
        }

        Ok(config)
    }

    /// Settings of one namespace, if configured.
    pub fn cache_settings(&self, namespace: &str) -> Option<&CacheSettings> {
        self.cache.get(namespace)
    }

    /// Copy of `self` with `patch` applied field by field.
    pub fn merged(&self, patch: &ConfigPatch) -> Self {
        let mut next = self.clone();
        for (namespace, cache_patch) in &patch.cache {
            if let Some(settings) = next.cache.get_mut(namespace) {
                cache_patch.apply(settings);
            }
        }
        if let Some(performance) = &patch.performance {
            performance.apply(&mut next.performance);
        }
        if let Some(debug) = &patch.debug {
            debug.apply(&mut next.debug);
        }
        next
    }
}

/// Errors produced while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Partial update for one cache namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSettingsPatch {
    pub ttl: Option<Duration>,
    pub max_size: Option<usize>,
    pub cleanup_interval: Option<Duration>,
}

impl CacheSettingsPatch {
    fn apply(&self, settings: &mut CacheSettings) {
        if let Some(ttl) = self.ttl {
            settings.ttl = ttl;
        }
        if let Some(max_size) = self.max_size {
            settings.max_size = max_size;
        }
        if let Some(cleanup_interval) = self.cleanup_interval {
            settings.cleanup_interval = cleanup_interval;
        }
    }
}

/// Partial update for [`PerformanceSettings`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformancePatch {
    pub enable_cache: Option<bool>,
    pub enable_metrics: Option<bool>,
    pub batch_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub max_retry_delay: Option<Duration>,
    pub max_msg_retry_count: Option<u32>,
    pub memory_threshold: Option<f64>,
    pub memory_check_interval: Option<Duration>,
    /// `Some(None)` clears the budget.
    pub memory_budget_bytes: Option<Option<u64>>,
}

impl PerformancePatch {
    fn apply(&self, settings: &mut PerformanceSettings) {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field.clone() {
                    settings.$field = value;
                })*
            };
        }
        overlay!(
            enable_cache,
            enable_metrics,
            batch_size,
            max_retries,
            retry_delay,
            max_retry_delay,
            max_msg_retry_count,
            memory_threshold,
            memory_check_interval,
            memory_budget_bytes,
        );
    }
}

/// Partial update for [`DebugSettings`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugPatch {
    pub enable_lid_logging: Option<bool>,
    pub enable_performance_logging: Option<bool>,
    pub enable_error_logging: Option<bool>,
    pub log_level: Option<LogLevel>,
}

impl DebugPatch {
    fn apply(&self, settings: &mut DebugSettings) {
        if let Some(value) = self.enable_lid_logging {
            settings.enable_lid_logging = value;
        }
        if let Some(value) = self.enable_performance_logging {
            settings.enable_performance_logging = value;
        }
        if let Some(value) = self.enable_error_logging {
            settings.enable_error_logging = value;
        }
        if let Some(value) = self.log_level {
            settings.log_level = value;
        }
    }
}

/// Field-level patch across every section. Unknown cache namespaces are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigPatch {
    pub cache: BTreeMap<String, CacheSettingsPatch>,
    pub performance: Option<PerformancePatch>,
    pub debug: Option<DebugPatch>,
}

/// Shared, hot-swappable access to the current [`CourierConfig`].
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<ArcSwap<CourierConfig>>,
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(CourierConfig::default())
    }
}

impl fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("current", &self.current.load())
            .finish()
    }
}

impl ConfigHandle {
    pub fn new(config: CourierConfig) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<CourierConfig> {
        self.current.load_full()
    }

    /// Replace the whole configuration.
    pub fn replace(&self, config: CourierConfig) -> Arc<CourierConfig> {
        let next = Arc::new(config);
        self.current.store(Arc::clone(&next));
        next
    }

    /// Apply a patch on top of the latest snapshot and publish the result.
    pub fn merge(&self, patch: &ConfigPatch) -> Arc<CourierConfig> {
        self.current
            .rcu(|current| Arc::new(current.merged(patch)));
        self.load()
    }

    pub fn update_cache(
        &self,
        namespace: impl Into<String>,
        patch: CacheSettingsPatch,
    ) -> Arc<CourierConfig> {
        let mut cache = BTreeMap::new();
        cache.insert(namespace.into(), patch);
        self.merge(&ConfigPatch {
            cache,
            ..ConfigPatch::default()
        })
    }

    pub fn update_performance(&self, patch: PerformancePatch) -> Arc<CourierConfig> {
        self.merge(&ConfigPatch {
            performance: Some(patch),
            ..ConfigPatch::default()
        })
    }

    pub fn update_debug(&self, patch: DebugPatch) -> Arc<CourierConfig> {
        self.merge(&ConfigPatch {
            debug: Some(patch),
            ..ConfigPatch::default()
        })
    }
}

fn flag_enabled<F>(key: &'static str, lookup: &mut F) -> bool
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key).is_some_and(|value| value.trim() == "true")
}
