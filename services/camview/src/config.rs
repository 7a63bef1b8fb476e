//! Configuration for the camview service.
//!
//! Loaded from (later sources override earlier):
//! 1. Built-in defaults
//! 2. `config/camview.{toml,yaml,json}` relative to the working directory
//! 3. `/etc/camview/camview.{toml,yaml,json}`
//! 4. Environment variables, e.g. `CAMVIEW__PATHS__INCOMING_ROOT`

use crate::camera::{Camera, CameraConfig, CameraError};
use crate::storage::BackendKind;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub derivatives: DerivativeConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Expose Prometheus metrics
    #[serde(default)]
    pub metrics_enabled: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Filesystem locations
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Root of the incoming tree: `<date>/<camera>/<image>`
    pub incoming_root: PathBuf,
    /// Root of the published tree; a key prefix when using the object store
    pub storage_root: String,
    /// Directory holding the per-(date, camera) statistics files
    pub stats_dir: PathBuf,
    /// Staging area for derivatives; defaults to `<incoming_root>/.work`
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

/// Web storage backend selection
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// "local" or "remote_object_store"
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub s3: S3Config,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding the published site
    #[serde(default)]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL for S3-compatible providers
    pub endpoint_url: Option<String>,
    /// Force path-style access
    #[serde(default)]
    pub force_path_style: bool,
    /// Store objects with the reduced-redundancy storage class
    #[serde(default)]
    pub reduced_redundancy: bool,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Calendar days kept, counting today
    #[serde(default = "default_retain_days")]
    pub retain_days: u32,
}

/// Loop timing
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Polling interval between passes in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Minimum age of an incoming file before it is promoted
    #[serde(default = "default_aging_threshold_secs")]
    pub aging_threshold_secs: u64,
    /// Stop after the first pass that finds no work
    #[serde(default)]
    pub exit_when_idle: bool,
    /// Images promoted concurrently within one date directory
    #[serde(default = "default_promotion_concurrency")]
    pub promotion_concurrency: usize,
}

/// Derivative image sizes
#[derive(Debug, Clone, Deserialize)]
pub struct DerivativeConfig {
    #[serde(default = "default_medium_width")]
    pub medium_width: u32,
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

// Default value functions
fn default_service_name() -> String {
    "camview".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_backend() -> String {
    "local".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_retain_days() -> u32 {
    7
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_aging_threshold_secs() -> u64 {
    3600
}

fn default_promotion_concurrency() -> usize {
    1
}

fn default_medium_width() -> u32 {
    640
}

fn default_thumbnail_width() -> u32 {
    160
}

fn default_jpeg_quality() -> u8 {
    85
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_enabled: false,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            s3: S3Config::default(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            reduced_redundancy: false,
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retain_days: default_retain_days(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            aging_threshold_secs: default_aging_threshold_secs(),
            exit_when_idle: false,
            promotion_concurrency: default_promotion_concurrency(),
        }
    }
}

impl Default for DerivativeConfig {
    fn default() -> Self {
        Self {
            medium_width: default_medium_width(),
            thumbnail_width: default_thumbnail_width(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Config {
    /// Load configuration from config files and the environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("storage.backend", "local")?
            .set_default("retention.retain_days", 7)?
            .add_source(config::File::with_name("config/camview").required(false))
            .add_source(config::File::with_name("/etc/camview/camview").required(false))
            // CAMVIEW__PATHS__INCOMING_ROOT -> paths.incoming_root
            .add_source(
                config::Environment::with_prefix("CAMVIEW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.paths.incoming_root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "paths.incoming_root".to_string(),
            ));
        }
        if self.paths.storage_root.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "paths.storage_root".to_string(),
            ));
        }
        if self.paths.stats_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "paths.stats_dir".to_string(),
            ));
        }

        let backend = self
            .storage
            .backend
            .parse::<BackendKind>()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "storage.backend".to_string(),
                message: e.to_string(),
            })?;
        if backend == BackendKind::RemoteObjectStore && self.storage.s3.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.s3.bucket".to_string(),
            ));
        }

        if self.retention.retain_days == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "retention.retain_days".to_string(),
                message: "Must keep at least one day".to_string(),
            });
        }

        if self.schedule.promotion_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "schedule.promotion_concurrency".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.derivatives.medium_width == 0 || self.derivatives.thumbnail_width == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "derivatives.medium_width/thumbnail_width".to_string(),
                message: "Widths must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.derivatives.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "derivatives.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            if camera.shortname.is_empty() || camera.shortname.contains('/') {
                return Err(ConfigValidationError::InvalidValue {
                    field: "cameras.shortname".to_string(),
                    message: format!("{:?} is not a valid directory name", camera.shortname),
                });
            }
            if !seen.insert(camera.shortname.as_str()) {
                return Err(ConfigValidationError::InvalidValue {
                    field: "cameras.shortname".to_string(),
                    message: format!("Duplicate camera {}", camera.shortname),
                });
            }
        }

        self.cameras()?;
        Ok(())
    }

    /// Resolved camera identities.
    pub fn cameras(&self) -> Result<Vec<Camera>, ConfigValidationError> {
        self.cameras
            .iter()
            .map(|c| {
                Camera::try_from(c).map_err(|e: CameraError| ConfigValidationError::InvalidValue {
                    field: format!("cameras.{}.crop", c.shortname),
                    message: e.to_string(),
                })
            })
            .collect()
    }

    pub fn work_dir(&self) -> PathBuf {
        self.paths
            .work_dir
            .clone()
            .unwrap_or_else(|| self.paths.incoming_root.join(".work"))
    }

    /// Get the polling interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.poll_interval_secs)
    }

    /// Get the aging threshold as Duration
    pub fn aging_threshold(&self) -> Duration {
        Duration::from_secs(self.schedule.aging_threshold_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
