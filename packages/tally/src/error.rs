use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when configuring or operating a [`Collector`][crate::Collector].
///
/// The instrumentation hot path never returns errors. Only construction, persistence and
/// administrative operations do.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Two registries with the same name were supplied to the same collector.
    #[error("registry name '{name}' is used by more than one registry")]
    DuplicateRegistry {
        /// The name that was registered more than once.
        name: String,
    },

    /// A registry declared a child registry that is not part of the same collector.
    #[error("registry '{registry}' declares unknown child registry '{child}'")]
    UnknownChildRegistry {
        /// The registry that declared the child.
        registry: String,

        /// The child registry name that could not be resolved.
        child: String,
    },

    /// An operation referenced a registry name that does not exist.
    #[error("registry '{name}' not found")]
    RegistryNotFound {
        /// The name that could not be resolved.
        name: String,
    },

    /// A custom date range ends before it starts.
    #[error("date range {start}..={end} ends before it starts")]
    InvalidRange {
        /// First day of the requested range.
        start: chrono::NaiveDate,

        /// Last day of the requested range.
        end: chrono::NaiveDate,
    },

    /// The supplied configuration is not usable.
    #[error("invalid configuration: {problem}")]
    InvalidConfig {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// Reading or writing a file in the storage directory failed.
    #[error("I/O failure on '{}': {source}", path.display())]
    Io {
        /// The file or directory involved.
        path: PathBuf,

        /// The underlying failure.
        #[source]
        source: io::Error,
    },

    /// A persisted snapshot could not be encoded or decoded.
    #[error("snapshot '{}' could not be (de)serialized: {source}", path.display())]
    Serialization {
        /// The file involved.
        path: PathBuf,

        /// The underlying failure.
        #[source]
        source: serde_json::Error,
    },

    /// A telemetry source failed to produce a snapshot.
    #[error("telemetry source failed: {0}")]
    Telemetry(String),

    /// The time-series store rejected an operation.
    #[error("time-series store failure: {0}")]
    TimeSeries(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_config(problem: impl Into<String>) -> Self {
        Self::InvalidConfig {
            problem: problem.into(),
        }
    }
}

/// A specialized `Result` type for tally operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn messages_name_the_offending_item() {
        let error = Error::DuplicateRegistry {
            name: "http".to_string(),
        };
        assert!(error.to_string().contains("'http'"));

        let error = Error::UnknownChildRegistry {
            registry: "http".to_string(),
            child: "sql".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("'http'"));
        assert!(message.contains("'sql'"));
    }

    #[test]
    fn io_error_keeps_source() {
        let error = Error::io("/tmp/x", io::Error::other("disk full"));

        let source = std::error::Error::source(&error).unwrap();
        assert_eq!(source.to_string(), "disk full");
    }
}
