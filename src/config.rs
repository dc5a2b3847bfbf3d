//! Configuration management for slidegate.
//!
//! [`LimiterConfig`] is the validated, immutable configuration a limiter is
//! built from. [`Settings`] is its serialized form, loaded from YAML and
//! `SLIDEGATE_*` environment variables.
//!
//! Validation policy: an out-of-range duration is replaced by its default and
//! a warning is logged; a non-positive threshold or an unusable key prefix
//! fails the build.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SlidegateError};

/// Default bucket precision, and the fallback for invalid precisions.
pub const DEFAULT_BUCKET_PRECISION: Duration = Duration::from_secs(60);
/// Default window size, and the fallback for invalid windows.
pub const DEFAULT_WINDOW_SIZE: Duration = Duration::from_secs(60);
/// Stale bucket age when none is configured.
pub const DEFAULT_STALE_BUCKET_AGE: Duration = Duration::from_secs(3600);
/// Fallback when a zero stale bucket age is configured.
pub const FALLBACK_STALE_BUCKET_AGE: Duration = Duration::from_secs(12 * 3600);

/// Upper bound for window sizes and stale bucket ages; larger values are clamped.
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

const HOUR_SECS: u64 = 3600;

/// Validated settings of one limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    bucket_precision: Duration,
    window_size: Duration,
    threshold: i64,
    stale_bucket_age: Duration,
    key_prefix: Option<String>,
    timeout: Option<Duration>,
}

impl LimiterConfig {
    /// Start building a configuration admitting `threshold` events per window.
    pub fn builder(threshold: i64) -> LimiterConfigBuilder {
        LimiterConfigBuilder::new(threshold)
    }

    /// Width of one bucket; whole seconds dividing one hour.
    pub fn bucket_precision(&self) -> Duration {
        self.bucket_precision
    }

    /// Lookback duration, whole seconds.
    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    /// Maximum admits per window.
    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// Absolute maximum bucket age, across all precisions.
    pub fn stale_bucket_age(&self) -> Duration {
        self.stale_bucket_age
    }

    /// Prefix prepended to every key as `<prefix>:<key>`.
    pub fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref()
    }

    /// Deadline for one store round trip.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Builder for [`LimiterConfig`].
#[derive(Debug, Clone)]
pub struct LimiterConfigBuilder {
    bucket_precision: Duration,
    window_size: Duration,
    threshold: i64,
    stale_bucket_age: Duration,
    key_prefix: Option<String>,
    timeout: Option<Duration>,
}

impl LimiterConfigBuilder {
    fn new(threshold: i64) -> Self {
        Self {
            bucket_precision: DEFAULT_BUCKET_PRECISION,
            window_size: DEFAULT_WINDOW_SIZE,
            threshold,
            stale_bucket_age: DEFAULT_STALE_BUCKET_AGE,
            key_prefix: None,
            timeout: None,
        }
    }

    /// Set the bucket precision. Must be at least one second, a whole number
    /// of seconds, and divide one hour evenly; otherwise one minute is used.
    pub fn bucket_precision(mut self, precision: Duration) -> Self {
        self.bucket_precision = precision;
        self
    }

    /// Set the window to look back on. Must be at least one second, otherwise
    /// one minute is used. Sub-second parts are dropped.
    pub fn window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }

    /// Set the oldest age any bucket may reach, regardless of precision.
    /// A zero age falls back to twelve hours.
    pub fn stale_bucket_age(mut self, age: Duration) -> Self {
        self.stale_bucket_age = age;
        self
    }

    /// Namespace keys as `<prefix>:<key>`.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Bound each store round trip. A zero timeout is ignored.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate and normalize.
    pub fn build(self) -> Result<LimiterConfig> {
        if self.threshold <= 0 {
            return Err(SlidegateError::Config(format!(
                "threshold must be an integer greater than 0, got {}",
                self.threshold
            )));
        }

        if let Some(prefix) = &self.key_prefix {
            if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
                return Err(SlidegateError::Config(format!(
                    "key prefix must be non-empty and contain no whitespace, got {:?}",
                    prefix
                )));
            }
        }

        let precision = self.bucket_precision;
        let bucket_precision = if precision >= Duration::from_secs(1)
            && precision.subsec_nanos() == 0
            && HOUR_SECS % precision.as_secs() == 0
        {
            precision
        } else {
            warn!(
                requested = ?precision,
                fallback = ?DEFAULT_BUCKET_PRECISION,
                "Bucket precision must be whole seconds dividing one hour, using default"
            );
            DEFAULT_BUCKET_PRECISION
        };

        let window_size = if self.window_size > MAX_DURATION {
            warn!(
                requested = ?self.window_size,
                max = ?MAX_DURATION,
                "Window size too large, clamping"
            );
            MAX_DURATION
        } else if self.window_size >= Duration::from_secs(1) {
            Duration::from_secs(self.window_size.as_secs())
        } else {
            warn!(
                requested = ?self.window_size,
                fallback = ?DEFAULT_WINDOW_SIZE,
                "Window size must be at least one second, using default"
            );
            DEFAULT_WINDOW_SIZE
        };

        let stale_bucket_age = if self.stale_bucket_age > MAX_DURATION {
            warn!(
                requested = ?self.stale_bucket_age,
                max = ?MAX_DURATION,
                "Stale bucket age too large, clamping"
            );
            MAX_DURATION
        } else if self.stale_bucket_age.as_secs() > 0 {
            Duration::from_secs(self.stale_bucket_age.as_secs())
        } else {
            warn!(
                requested = ?self.stale_bucket_age,
                fallback = ?FALLBACK_STALE_BUCKET_AGE,
                "Stale bucket age must be at least one second, using fallback"
            );
            FALLBACK_STALE_BUCKET_AGE
        };

        let timeout = match self.timeout {
            Some(t) if t.is_zero() => {
                warn!("Zero timeout ignored, store calls will not be bounded");
                None
            }
            other => other,
        };

        Ok(LimiterConfig {
            bucket_precision,
            window_size,
            threshold: self.threshold,
            stale_bucket_age,
            key_prefix: self.key_prefix,
            timeout,
        })
    }
}

/// Serialized settings for the binary and for embedding applications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Store connection settings
    #[serde(default)]
    pub store: StoreSettings,

    /// Limiter settings
    #[serde(default)]
    pub limiter: LimiterSettings,
}

/// Store connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Redis URL; when absent the in-process store is used
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Treat `redis_url` as a comma separated list of cluster seed nodes
    #[serde(default)]
    pub cluster: bool,
}

/// Limiter settings, in whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Maximum admits per window (required)
    #[serde(default)]
    pub threshold: Option<i64>,

    #[serde(default = "default_window_size_secs")]
    pub window_size_secs: u64,

    #[serde(default = "default_bucket_precision_secs")]
    pub bucket_precision_secs: u64,

    #[serde(default = "default_stale_bucket_age_secs")]
    pub stale_bucket_age_secs: u64,

    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Store round trip deadline in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            threshold: None,
            window_size_secs: default_window_size_secs(),
            bucket_precision_secs: default_bucket_precision_secs(),
            stale_bucket_age_secs: default_stale_bucket_age_secs(),
            key_prefix: None,
            timeout_ms: None,
        }
    }
}

fn default_window_size_secs() -> u64 {
    DEFAULT_WINDOW_SIZE.as_secs()
}

fn default_bucket_precision_secs() -> u64 {
    DEFAULT_BUCKET_PRECISION.as_secs()
}

fn default_stale_bucket_age_secs() -> u64 {
    DEFAULT_STALE_BUCKET_AGE.as_secs()
}

impl LimiterSettings {
    /// Convert to a validated [`LimiterConfig`].
    pub fn to_config(&self) -> Result<LimiterConfig> {
        let threshold = self
            .threshold
            .ok_or_else(|| SlidegateError::Config("limiter.threshold is required".to_string()))?;

        let mut builder = LimiterConfig::builder(threshold)
            .window_size(Duration::from_secs(self.window_size_secs))
            .bucket_precision(Duration::from_secs(self.bucket_precision_secs))
            .stale_bucket_age(Duration::from_secs(self.stale_bucket_age_secs));

        if let Some(prefix) = &self.key_prefix {
            builder = builder.key_prefix(prefix.clone());
        }
        if let Some(ms) = self.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }

        builder.build()
    }
}

impl Settings {
    /// Load settings from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading settings");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Config(format!("Failed to parse settings: {}", e)))
    }

    /// Layer an optional YAML file under `SLIDEGATE_*` environment variables.
    ///
    /// Nested fields use a double underscore, e.g. `SLIDEGATE_LIMITER__THRESHOLD=10`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading settings");
            builder = builder.add_source(::config::File::from(path).format(::config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("SLIDEGATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SlidegateError::Config(format!("Failed to load settings: {}", e)))
    }

    /// The validated limiter configuration.
    pub fn limiter_config(&self) -> Result<LimiterConfig> {
        self.limiter.to_config()
    }
}
