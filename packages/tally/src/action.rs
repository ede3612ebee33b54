use std::fmt::{self, Display};

use tracing::info;

use crate::{Collector, Result};

/// An administrative operation on a [`Collector`], as triggered from a monitoring report.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Action {
    /// Removes all statistics of the named registry.
    ClearRegistry(String),

    /// Removes all statistics of every registry.
    ClearAllRegistries,

    /// Deletes snapshot and series files that are past their retention.
    PurgeObsoleteFiles,
}

impl Action {
    /// Performs the action, returning a message describing what was done.
    ///
    /// # Errors
    ///
    /// * [`Error::RegistryNotFound`][crate::Error::RegistryNotFound] if the action names a
    ///   registry that does not exist. Nothing is changed in that case.
    /// * Any failure of the stores while purging obsolete files.
    pub fn execute(&self, collector: &Collector) -> Result<String> {
        let message = match self {
            Self::ClearRegistry(name) => {
                collector.clear_registry(name)?;
                format!("Statistics of '{name}' cleared.")
            }
            Self::ClearAllRegistries => {
                collector.clear_all_registries();
                "All statistics cleared.".to_owned()
            }
            Self::PurgeObsoleteFiles => {
                let (snapshots, series) = collector.delete_obsolete_files()?;
                format!(
                    "Deleted {snapshots} obsolete snapshot files and {series} obsolete time series."
                )
            }
        };

        info!(action = %self, "administrative action executed");
        Ok(message)
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClearRegistry(name) => write!(f, "clear registry '{name}'"),
            Self::ClearAllRegistries => f.write_str("clear all registries"),
            Self::PurgeObsoleteFiles => f.write_str("purge obsolete files"),
        }
    }
}
