use crate::Registry;
use crate::pal::PlatformFacade;

/// Default ceiling on the number of distinct requests a registry keeps.
pub const DEFAULT_MAX_REQUESTS_COUNT: usize = 10_000;

/// Default hit count below which a request is considered a cardinality-exploding variant
/// and is evicted first when a registry overflows.
pub const DEFAULT_EVICTION_HITS_THRESHOLD: u64 = 10;

/// Creates instances of [`Registry`].
///
/// Required parameters:
/// * `name`
///
/// Use `Registry::builder()` to create a new instance of this builder, or
/// [`CollectorConfig::registry()`][1] to start from the limits of a collector configuration.
///
/// [1]: crate::CollectorConfig::registry
#[derive(Debug)]
pub struct RegistryBuilder {
    pub(crate) name: String,
    pub(crate) error_registry: bool,
    pub(crate) job_registry: bool,
    pub(crate) child_registry_name: Option<String>,
    pub(crate) displayed: bool,

    /// Upper bound on distinct requests. Values below 1 are treated as 1.
    pub(crate) max_requests_count: usize,
    pub(crate) eviction_hits_threshold: u64,

    pub(crate) platform: PlatformFacade,
}

impl RegistryBuilder {
    pub(crate) fn new() -> Self {
        Self {
            name: String::new(),
            error_registry: false,
            job_registry: false,
            child_registry_name: None,
            displayed: true,
            max_requests_count: DEFAULT_MAX_REQUESTS_COUNT,
            eviction_hits_threshold: DEFAULT_EVICTION_HITS_THRESHOLD,
            platform: PlatformFacade::real(),
        }
    }

    /// Sets the name of the registry. This is a required property.
    ///
    /// The name must be unique within a collector. It prefixes every request identifier and
    /// names the persisted snapshot files and time series of the registry, so it should be
    /// short and file-name safe, for example `http` or `sql`.
    #[must_use]
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Marks the registry as an error registry, which keeps individual [`ErrorRecord`][1]s
    /// in addition to request statistics and does not get per-request time series.
    ///
    /// [1]: crate::ErrorRecord
    #[must_use]
    pub fn error_registry(self) -> Self {
        Self {
            error_registry: true,
            ..self
        }
    }

    /// Marks the registry as tracking background jobs.
    ///
    /// Job registries are excluded from the "registries to display" views.
    #[must_use]
    pub fn job_registry(self) -> Self {
        Self {
            job_registry: true,
            ..self
        }
    }

    /// Designates another registry of the same collector as the child of this one.
    ///
    /// Executions in the child registry that happen inside an execution of this registry are
    /// attributed to the parent request as child hits and child durations.
    #[must_use]
    pub fn child_registry(self, child_registry_name: impl Into<String>) -> Self {
        Self {
            child_registry_name: Some(child_registry_name.into()),
            ..self
        }
    }

    /// Sets whether the registry is initially displayed. Defaults to `true`.
    #[must_use]
    pub fn displayed(self, displayed: bool) -> Self {
        Self { displayed, ..self }
    }

    /// Sets the ceiling on the number of distinct requests kept in memory.
    #[must_use]
    pub fn max_requests_count(self, max_requests_count: usize) -> Self {
        Self {
            max_requests_count: max_requests_count.max(1),
            ..self
        }
    }

    /// Sets the hit count below which requests are evicted first on overflow.
    #[must_use]
    pub fn eviction_hits_threshold(self, eviction_hits_threshold: u64) -> Self {
        Self {
            eviction_hits_threshold,
            ..self
        }
    }

    #[cfg(test)]
    pub(crate) fn platform(self, platform: PlatformFacade) -> Self {
        Self { platform, ..self }
    }

    /// Builds the registry.
    ///
    /// # Panics
    ///
    /// Panics if the name has not been set.
    #[must_use]
    pub fn build(self) -> Registry {
        assert!(!self.name.is_empty(), "registry name must be set");

        Registry::new(self)
    }
}
