use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{
    DEFAULT_EVICTION_HITS_THRESHOLD, DEFAULT_MAX_REQUESTS_COUNT, Error, RegistryBuilder, Result,
};

const DEFAULT_APPLICATION: &str = "tally";
const DEFAULT_RESOLUTION_SECONDS: u32 = 60;
const DEFAULT_SERIES_RETENTION_DAYS: u32 = 90;
const DEFAULT_SNAPSHOT_RETENTION_DAYS: u32 = 365;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Settings of a [`Collector`][crate::Collector].
///
/// Create one with [`CollectorConfig::builder()`] or load one from TOML with
/// [`CollectorConfig::from_toml_str()`]. Every setting has a default, so an empty TOML document
/// is a valid configuration:
///
/// ```
/// use tally::CollectorConfig;
///
/// let config = CollectorConfig::from_toml_str(
///     r#"
///     application = "shop"
///     resolution_seconds = 30
///     no_database = true
///     "#,
/// )
/// .unwrap();
///
/// assert_eq!(config.application(), "shop");
/// assert_eq!(config.resolution().as_secs(), 30);
/// assert!(config.no_database());
/// assert!(config.storage_directory().ends_with("tally/shop"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectorConfig {
    application: String,
    resolution_seconds: u32,
    storage_directory: PathBuf,
    max_requests_count: usize,
    eviction_hits_threshold: u64,
    series_retention_days: u32,
    snapshot_retention_days: u32,
    no_database: bool,
}

/// The TOML form of the configuration. Missing keys take their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    application: Option<String>,
    resolution_seconds: Option<u32>,
    storage_directory: Option<PathBuf>,
    max_requests_count: Option<usize>,
    eviction_hits_threshold: Option<u64>,
    series_retention_days: Option<u32>,
    snapshot_retention_days: Option<u32>,
    no_database: Option<bool>,
}

impl CollectorConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> CollectorConfigBuilder {
        CollectorConfigBuilder::new()
    }

    /// Parses a configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the document is not valid TOML, contains unknown keys
    /// or holds values that fail validation.
    pub fn from_toml_str(toml_text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(toml_text)
            .map_err(|error| Error::invalid_config(format!("malformed TOML: {error}")))?;

        let mut builder = Self::builder();

        if let Some(application) = file.application {
            builder = builder.application(application);
        }
        if let Some(resolution_seconds) = file.resolution_seconds {
            builder = builder.resolution_seconds(resolution_seconds);
        }
        if let Some(storage_directory) = file.storage_directory {
            builder = builder.storage_directory(storage_directory);
        }
        if let Some(max_requests_count) = file.max_requests_count {
            builder = builder.max_requests_count(max_requests_count);
        }
        if let Some(eviction_hits_threshold) = file.eviction_hits_threshold {
            builder = builder.eviction_hits_threshold(eviction_hits_threshold);
        }
        if let Some(series_retention_days) = file.series_retention_days {
            builder = builder.series_retention_days(series_retention_days);
        }
        if let Some(snapshot_retention_days) = file.snapshot_retention_days {
            builder = builder.snapshot_retention_days(snapshot_retention_days);
        }
        if let Some(no_database) = file.no_database {
            builder = builder.no_database(no_database);
        }

        builder.build()
    }

    /// Reads and parses a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str()`][Self::from_toml_str].
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let toml_text = fs::read_to_string(path).map_err(|error| Error::io(path, error))?;

        Self::from_toml_str(&toml_text)
    }

    /// Name of the monitored application. Scopes the storage directory.
    #[must_use]
    pub fn application(&self) -> &str {
        &self.application
    }

    /// Interval between collector ticks.
    #[must_use]
    pub fn resolution(&self) -> Duration {
        Duration::from_secs(u64::from(self.resolution_seconds))
    }

    /// Where snapshots and time series are stored.
    #[must_use]
    pub fn storage_directory(&self) -> &Path {
        &self.storage_directory
    }

    /// Ceiling on distinct requests per registry.
    #[must_use]
    pub fn max_requests_count(&self) -> usize {
        self.max_requests_count
    }

    /// Hit count below which requests are evicted first on overflow.
    #[must_use]
    pub fn eviction_hits_threshold(&self) -> u64 {
        self.eviction_hits_threshold
    }

    /// How long a time series may go without samples before it is deleted.
    #[must_use]
    pub fn series_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.series_retention_days).saturating_mul(SECONDS_PER_DAY))
    }

    /// How long a snapshot may go without being written before it is deleted.
    #[must_use]
    pub fn snapshot_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.snapshot_retention_days).saturating_mul(SECONDS_PER_DAY))
    }

    /// Whether datastore connection and transaction series are suppressed.
    #[must_use]
    pub fn no_database(&self) -> bool {
        self.no_database
    }

    /// Starts building a registry with the request limits of this configuration.
    #[must_use]
    pub fn registry(&self, name: impl Into<String>) -> RegistryBuilder {
        RegistryBuilder::new()
            .name(name)
            .max_requests_count(self.max_requests_count)
            .eviction_hits_threshold(self.eviction_hits_threshold)
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            application: DEFAULT_APPLICATION.to_owned(),
            resolution_seconds: DEFAULT_RESOLUTION_SECONDS,
            storage_directory: default_storage_directory(DEFAULT_APPLICATION),
            max_requests_count: DEFAULT_MAX_REQUESTS_COUNT,
            eviction_hits_threshold: DEFAULT_EVICTION_HITS_THRESHOLD,
            series_retention_days: DEFAULT_SERIES_RETENTION_DAYS,
            snapshot_retention_days: DEFAULT_SNAPSHOT_RETENTION_DAYS,
            no_database: false,
        }
    }
}

fn default_storage_directory(application: &str) -> PathBuf {
    env::temp_dir().join("tally").join(application)
}

/// Creates instances of [`CollectorConfig`].
///
/// Use `CollectorConfig::builder()` to create a new instance of this builder.
#[derive(Debug, Default)]
pub struct CollectorConfigBuilder {
    application: Option<String>,
    resolution_seconds: Option<u32>,
    storage_directory: Option<PathBuf>,
    max_requests_count: Option<usize>,
    eviction_hits_threshold: Option<u64>,
    series_retention_days: Option<u32>,
    snapshot_retention_days: Option<u32>,
    no_database: Option<bool>,
}

impl CollectorConfigBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sets the application name. Defaults to `tally`.
    #[must_use]
    pub fn application(self, application: impl Into<String>) -> Self {
        Self {
            application: Some(application.into()),
            ..self
        }
    }

    /// Sets the tick interval in seconds. Defaults to 60. Must be positive.
    #[must_use]
    pub fn resolution_seconds(self, resolution_seconds: u32) -> Self {
        Self {
            resolution_seconds: Some(resolution_seconds),
            ..self
        }
    }

    /// Sets the storage directory. Relative paths are resolved against the temporary
    /// directory of the operating system. Defaults to `<temp>/tally/<application>`.
    #[must_use]
    pub fn storage_directory(self, storage_directory: impl Into<PathBuf>) -> Self {
        Self {
            storage_directory: Some(storage_directory.into()),
            ..self
        }
    }

    /// Sets the ceiling on distinct requests per registry. Defaults to 10 000. Must be positive.
    #[must_use]
    pub fn max_requests_count(self, max_requests_count: usize) -> Self {
        Self {
            max_requests_count: Some(max_requests_count),
            ..self
        }
    }

    /// Sets the hit count below which requests are evicted first. Defaults to 10.
    #[must_use]
    pub fn eviction_hits_threshold(self, eviction_hits_threshold: u64) -> Self {
        Self {
            eviction_hits_threshold: Some(eviction_hits_threshold),
            ..self
        }
    }

    /// Sets the time series retention in days. Defaults to 90. Must be positive.
    #[must_use]
    pub fn series_retention_days(self, series_retention_days: u32) -> Self {
        Self {
            series_retention_days: Some(series_retention_days),
            ..self
        }
    }

    /// Sets the snapshot retention in days. Defaults to 365. Must be positive.
    #[must_use]
    pub fn snapshot_retention_days(self, snapshot_retention_days: u32) -> Self {
        Self {
            snapshot_retention_days: Some(snapshot_retention_days),
            ..self
        }
    }

    /// Suppresses datastore connection and transaction series. Defaults to `false`.
    #[must_use]
    pub fn no_database(self, no_database: bool) -> Self {
        Self {
            no_database: Some(no_database),
            ..self
        }
    }

    /// Validates the settings and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a setting that must be positive is zero or the
    /// application name is empty.
    pub fn build(self) -> Result<CollectorConfig> {
        let defaults = CollectorConfig::default();

        let application = self.application.unwrap_or(defaults.application);
        if application.trim().is_empty() {
            return Err(Error::invalid_config("application name must not be empty"));
        }

        let resolution_seconds = positive(
            "resolution_seconds",
            self.resolution_seconds.unwrap_or(defaults.resolution_seconds),
        )?;
        let max_requests_count = positive(
            "max_requests_count",
            self.max_requests_count.unwrap_or(defaults.max_requests_count),
        )?;
        let series_retention_days = positive(
            "series_retention_days",
            self.series_retention_days
                .unwrap_or(defaults.series_retention_days),
        )?;
        let snapshot_retention_days = positive(
            "snapshot_retention_days",
            self.snapshot_retention_days
                .unwrap_or(defaults.snapshot_retention_days),
        )?;

        let storage_directory = match self.storage_directory {
            Some(directory) if directory.is_absolute() => directory,
            Some(directory) => env::temp_dir().join(directory),
            None => default_storage_directory(&application),
        };

        Ok(CollectorConfig {
            application,
            resolution_seconds,
            storage_directory,
            max_requests_count,
            eviction_hits_threshold: self
                .eviction_hits_threshold
                .unwrap_or(defaults.eviction_hits_threshold),
            series_retention_days,
            snapshot_retention_days,
            no_database: self.no_database.unwrap_or(defaults.no_database),
        })
    }
}

fn positive<T>(key: &str, value: T) -> Result<T>
where
    T: Default + PartialEq,
{
    if value == T::default() {
        Err(Error::invalid_config(format!("{key} must be positive")))
    } else {
        Ok(value)
    }
}
