//! Configuration types for harvest-dl

use crate::error::{Error, Result};
use crate::types::{ArtifactKind, ItemId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a batch run
///
/// Every field has a default, so an empty JSON object is a valid config
/// file apart from the identity list, which [`Config::validate`] requires.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Credentialed identities (at least one required)
    #[serde(default)]
    pub identities: Vec<IdentityConfig>,

    /// Ledger storage
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Output directories and naming
    #[serde(default)]
    pub paths: PathsConfig,

    /// Concurrency, pacing and timeouts
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Retry behavior for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Identity rotation thresholds
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Validation rules for document files
    #[serde(default = "default_file_validation")]
    pub file_validation: ValidationConfig,

    /// Validation rules for cover images
    #[serde(default = "default_cover_validation")]
    pub cover_validation: ValidationConfig,

    /// Login settings for the authenticator
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identities: Vec::new(),
            ledger: LedgerConfig::default(),
            paths: PathsConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            rotation: RotationConfig::default(),
            file_validation: default_file_validation(),
            cover_validation: default_cover_validation(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Load a configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| Error::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
            key: None,
        })?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.identities.is_empty() {
            return Err(Error::config(
                "identities",
                "at least one identity is required",
            ));
        }

        let mut seen = HashSet::new();
        for identity in &self.identities {
            if !seen.insert(identity.id.as_str()) {
                return Err(Error::config(
                    "identities",
                    format!("duplicate identity id '{}'", identity.id),
                ));
            }
        }

        if self.scheduler.file_concurrency == 0 || self.scheduler.cover_concurrency == 0 {
            return Err(Error::config(
                "scheduler",
                "concurrency must be at least 1 for every kind",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::config(
                "retry.max_attempts",
                "at least one attempt is required",
            ));
        }

        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                "backoff multiplier must be a finite number of at least 1.0",
            ));
        }

        if self.scheduler.batch_limit == Some(0) {
            return Err(Error::config(
                "scheduler.batch_limit",
                "batch limit must be at least 1",
            ));
        }

        if self.rotation.failure_threshold == 0 {
            return Err(Error::config(
                "rotation.failure_threshold",
                "rotation threshold must be at least 1",
            ));
        }

        for (key, rules) in [
            ("file_validation", &self.file_validation),
            ("cover_validation", &self.cover_validation),
        ] {
            if rules.min_size > rules.max_size {
                return Err(Error::config(
                    key,
                    format!(
                        "min_size ({}) is larger than max_size ({})",
                        rules.min_size, rules.max_size
                    ),
                ));
            }
        }

        Ok(())
    }

    /// Validation rules for an artifact kind
    pub fn validation_for(&self, kind: ArtifactKind) -> &ValidationConfig {
        match kind {
            ArtifactKind::File => &self.file_validation,
            ArtifactKind::Cover => &self.cover_validation,
        }
    }
}

/// One credentialed account
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Unique identifier (usually the account email)
    pub id: String,

    /// Authentication secret, passed to the authenticator untouched
    pub secret: String,

    /// Maximum downloads per local calendar day (default: 10)
    #[serde(default = "default_daily_quota")]
    pub max_daily_downloads: u32,
}

/// Ledger storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Ledger database path (default: "ebooks/ledger.db")
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

/// Output directories used when expanding a discovery manifest
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory for document files (default: "ebooks/files")
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,

    /// Directory for cover images (default: "ebooks/covers")
    #[serde(default = "default_covers_dir")]
    pub covers_dir: PathBuf,

    /// Maximum length of the generated file stem (default: 160)
    #[serde(default = "default_max_filename_length")]
    pub max_filename_length: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            files_dir: default_files_dir(),
            covers_dir: default_covers_dir(),
            max_filename_length: default_max_filename_length(),
        }
    }
}

/// Scheduling configuration (concurrency, pacing, timeouts)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent document downloads (default: 3)
    #[serde(default = "default_file_concurrency")]
    pub file_concurrency: usize,

    /// Concurrent cover downloads (default: 10)
    #[serde(default = "default_cover_concurrency")]
    pub cover_concurrency: usize,

    /// Hard timeout of one document attempt (default: 300 seconds)
    #[serde(default = "default_file_timeout", with = "duration_serde")]
    pub file_timeout: Duration,

    /// Hard timeout of one cover attempt (default: 60 seconds)
    #[serde(default = "default_cover_timeout", with = "duration_serde")]
    pub cover_timeout: Duration,

    /// Minimum gap between two requests on the same identity (default: 2000 ms)
    #[serde(default = "default_request_delay", with = "duration_millis_serde")]
    pub request_delay: Duration,

    /// How long a worker waits for an identity to free up (default: 30 seconds)
    #[serde(default = "default_acquire_wait", with = "duration_serde")]
    pub acquire_wait: Duration,

    /// Re-attempt items that failed permanently in an earlier run (default: true)
    #[serde(default = "default_true")]
    pub retry_failed: bool,

    /// Restrict a run to one artifact kind (default: both)
    #[serde(default)]
    pub only_kind: Option<ArtifactKind>,

    /// Restrict a run to these item IDs (default: every pending item)
    #[serde(default)]
    pub only_items: Vec<ItemId>,

    /// Stop dispatching after this many items in one run (default: no limit)
    #[serde(default)]
    pub batch_limit: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            file_concurrency: default_file_concurrency(),
            cover_concurrency: default_cover_concurrency(),
            file_timeout: default_file_timeout(),
            cover_timeout: default_cover_timeout(),
            request_delay: default_request_delay(),
            acquire_wait: default_acquire_wait(),
            retry_failed: true,
            only_kind: None,
            only_items: Vec::new(),
            batch_limit: None,
        }
    }
}

impl SchedulerConfig {
    /// Concurrency limit for an artifact kind
    pub fn concurrency_for(&self, kind: ArtifactKind) -> usize {
        match kind {
            ArtifactKind::File => self.file_concurrency,
            ArtifactKind::Cover => self.cover_concurrency,
        }
    }

    /// Attempt timeout for an artifact kind
    pub fn timeout_for(&self, kind: ArtifactKind) -> Duration {
        match kind {
            ArtifactKind::File => self.file_timeout,
            ArtifactKind::Cover => self.cover_timeout,
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per item, first attempt included (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 5000 ms)
    #[serde(default = "default_initial_delay", with = "duration_millis_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60000 ms)
    #[serde(default = "default_max_delay", with = "duration_millis_serde")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each retry (default: 1.5)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// Identity rotation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Consecutive failures after which an identity is rotated out for the run (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Advance the active identity after this many successes in a row (default: 10)
    ///
    /// This only spreads load; the identity stays eligible. `None` disables it.
    #[serde(default = "default_rotate_after_downloads")]
    pub rotate_after_downloads: Option<u32>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            rotate_after_downloads: default_rotate_after_downloads(),
        }
    }
}

/// Artifact validation rules for one kind
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Smallest acceptable artifact in bytes
    pub min_size: u64,

    /// Largest acceptable artifact in bytes
    pub max_size: u64,

    /// `text/html` responses shorter than this are error pages
    pub html_floor: u64,
}

/// Authenticator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Login form endpoint; without it identities get anonymous sessions
    #[serde(default)]
    pub login_url: Option<String>,

    /// Form field carrying the identity id (default: "email")
    #[serde(default = "default_login_field")]
    pub login_field: String,

    /// Form field carrying the secret (default: "password")
    #[serde(default = "default_secret_field")]
    pub secret_field: String,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Timeout of the login request (default: 30 seconds)
    #[serde(default = "default_login_timeout", with = "duration_serde")]
    pub login_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_url: None,
            login_field: default_login_field(),
            secret_field: default_secret_field(),
            user_agent: default_user_agent(),
            login_timeout: default_login_timeout(),
        }
    }
}

// Default value functions
fn default_daily_quota() -> u32 {
    10
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("ebooks/ledger.db")
}

fn default_files_dir() -> PathBuf {
    PathBuf::from("ebooks/files")
}

fn default_covers_dir() -> PathBuf {
    PathBuf::from("ebooks/covers")
}

fn default_max_filename_length() -> usize {
    160
}

fn default_file_concurrency() -> usize {
    3
}

fn default_cover_concurrency() -> usize {
    10
}

fn default_file_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_cover_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_request_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_acquire_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_rotate_after_downloads() -> Option<u32> {
    Some(10)
}

fn default_file_validation() -> ValidationConfig {
    ValidationConfig {
        min_size: 1000,
        max_size: 500 * 1024 * 1024,
        html_floor: 10_000,
    }
}

fn default_cover_validation() -> ValidationConfig {
    ValidationConfig {
        min_size: 1000,
        max_size: 20 * 1024 * 1024,
        html_floor: 10_000,
    }
}

fn default_login_field() -> String {
    "email".to_string()
}

fn default_secret_field() -> String {
    "password".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/91.0.4472.124 Safari/537.36"
        .to_string()
}

fn default_login_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds, for pacing and retry delays)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
