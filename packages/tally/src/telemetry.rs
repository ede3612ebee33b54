//! Process and runtime telemetry harvested once per tick.
//!
//! The collector does not know how to measure heap usage, sessions or connection pools of the
//! host application. It asks one or more [`TelemetrySource`]s for a [`TelemetrySnapshot`] and
//! derives time series from whatever they report.

use std::fmt::Debug;
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::pal::{Platform, PlatformFacade};
use crate::{Millis, Result, duration_to_millis, fleet_add};

/// Supplies a telemetry snapshot on every collector tick.
///
/// A collector may have several sources, for example one per node of a fleet. Their snapshots
/// are combined field by field with [`fleet_add()`].
pub trait TelemetrySource: Debug + Send + Sync {
    /// Measures the current state.
    ///
    /// # Errors
    ///
    /// Fails if nothing could be measured. The collector logs the failure and skips the
    /// telemetry series for the tick.
    fn snapshot(&self) -> Result<TelemetrySnapshot>;
}

impl<T: TelemetrySource + ?Sized> TelemetrySource for Arc<T> {
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn snapshot(&self) -> Result<TelemetrySnapshot> {
        (**self).snapshot()
    }
}

/// Point-in-time measurements of the host process and runtime.
///
/// Every field uses a negative value to mean "not available" (never omitted). Cumulative
/// quantities (processor time, garbage collection time, transaction count) are totals since
/// process start; the collector computes per-period rates from consecutive snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct TelemetrySnapshot {
    /// Used heap memory, in bytes.
    pub used_memory: i64,

    /// Maximum heap memory, in bytes.
    pub max_memory: i64,

    /// Threads currently executing requests.
    pub active_thread_count: i32,

    /// All threads of the process.
    pub thread_count: i32,

    /// Open HTTP sessions.
    pub session_count: i32,

    /// Sum of the ages of the open HTTP sessions.
    pub session_age_sum: Millis,

    /// Datastore connections currently executing a statement.
    pub active_connection_count: i32,

    /// Datastore connections currently checked out of their pool.
    pub used_connection_count: i32,

    /// Datastore transactions since process start.
    pub transaction_count: i64,

    /// Processors available to the process.
    pub available_processors: i32,

    /// Processor time consumed by the process since start.
    pub process_cpu_time: Millis,

    /// Time spent in garbage collection since process start.
    pub garbage_collection_time: Millis,

    /// Used non-heap memory, in bytes.
    pub used_non_heap_memory: i64,

    /// Currently loaded classes or modules.
    pub loaded_classes_count: i32,

    /// Used physical memory of the system, in bytes.
    pub used_physical_memory_size: i64,

    /// Used swap space of the system, in bytes.
    pub used_swap_space_size: i64,

    /// System load average over the last minute.
    pub system_load_average: f64,

    /// Open file descriptors of the process.
    pub open_file_descriptor_count: i64,

    /// Per-node web server counters, empty if there is no embedded web server.
    pub web_servers: Vec<WebServerStats>,
}

impl TelemetrySnapshot {
    /// A snapshot in which nothing is available.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            used_memory: -1,
            max_memory: -1,
            active_thread_count: -1,
            thread_count: -1,
            session_count: -1,
            session_age_sum: -1,
            active_connection_count: -1,
            used_connection_count: -1,
            transaction_count: -1,
            available_processors: -1,
            process_cpu_time: -1,
            garbage_collection_time: -1,
            used_non_heap_memory: -1,
            loaded_classes_count: -1,
            used_physical_memory_size: -1,
            used_swap_space_size: -1,
            system_load_average: -1.0,
            open_file_descriptor_count: -1,
            web_servers: Vec::new(),
        }
    }

    /// Combines the snapshots of two nodes into one fleet-wide snapshot.
    ///
    /// Available values are summed. A value that is available on only one node is taken
    /// as-is. Web server counters of both nodes are kept.
    #[must_use]
    pub fn combine(&self, other: &Self) -> Self {
        Self {
            used_memory: fleet_add(self.used_memory, other.used_memory),
            max_memory: fleet_add(self.max_memory, other.max_memory),
            active_thread_count: fleet_add(self.active_thread_count, other.active_thread_count),
            thread_count: fleet_add(self.thread_count, other.thread_count),
            session_count: fleet_add(self.session_count, other.session_count),
            session_age_sum: fleet_add(self.session_age_sum, other.session_age_sum),
            active_connection_count: fleet_add(
                self.active_connection_count,
                other.active_connection_count,
            ),
            used_connection_count: fleet_add(
                self.used_connection_count,
                other.used_connection_count,
            ),
            transaction_count: fleet_add(self.transaction_count, other.transaction_count),
            available_processors: fleet_add(self.available_processors, other.available_processors),
            process_cpu_time: fleet_add(self.process_cpu_time, other.process_cpu_time),
            garbage_collection_time: fleet_add(
                self.garbage_collection_time,
                other.garbage_collection_time,
            ),
            used_non_heap_memory: fleet_add(self.used_non_heap_memory, other.used_non_heap_memory),
            loaded_classes_count: fleet_add(self.loaded_classes_count, other.loaded_classes_count),
            used_physical_memory_size: fleet_add(
                self.used_physical_memory_size,
                other.used_physical_memory_size,
            ),
            used_swap_space_size: fleet_add(self.used_swap_space_size, other.used_swap_space_size),
            system_load_average: fleet_add(self.system_load_average, other.system_load_average),
            open_file_descriptor_count: fleet_add(
                self.open_file_descriptor_count,
                other.open_file_descriptor_count,
            ),
            web_servers: self
                .web_servers
                .iter()
                .chain(&other.web_servers)
                .cloned()
                .collect(),
        }
    }

    /// Mean age of the open HTTP sessions in whole minutes, or -1 if unknown.
    #[must_use]
    pub fn session_mean_age_minutes(&self) -> i64 {
        if self.session_count <= 0 || self.session_age_sum < 0 {
            return -1;
        }

        self.session_age_sum
            .checked_div(i64::from(self.session_count))
            .and_then(|mean| mean.checked_div(60_000))
            .unwrap_or(-1)
    }
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self::unavailable()
    }
}

/// Counters of one embedded web server (connector) of one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct WebServerStats {
    /// Name of the server or connector.
    pub name: String,

    /// Request-processing threads currently busy.
    pub busy_threads: i32,

    /// Bytes received since start.
    pub bytes_received: i64,

    /// Bytes sent since start.
    pub bytes_sent: i64,
}

impl WebServerStats {
    /// Counters of the named server with nothing available yet.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            busy_threads: -1,
            bytes_received: -1,
            bytes_sent: -1,
        }
    }
}

/// Web server counters summed over every server of a snapshot, or `None` if there are none.
pub(crate) fn web_server_totals(servers: &[WebServerStats]) -> Option<(i64, i64, i64)> {
    if servers.is_empty() {
        return None;
    }

    Some(servers.iter().fold((-1, -1, -1), |(busy, received, sent), server| {
        (
            fleet_add(busy, i64::from(server.busy_threads)),
            fleet_add(received, server.bytes_received),
            fleet_add(sent, server.bytes_sent),
        )
    }))
}

/// Telemetry the current process can report about itself without help from the host
/// application: processor count and processor time.
#[derive(Debug, Default)]
pub struct ProcessTelemetrySource {
    platform: PlatformFacade,
}

impl ProcessTelemetrySource {
    /// Creates a source measuring the current process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn with_platform(platform: PlatformFacade) -> Self {
        Self { platform }
    }
}

impl TelemetrySource for ProcessTelemetrySource {
    fn snapshot(&self) -> Result<TelemetrySnapshot> {
        let mut snapshot = TelemetrySnapshot::unavailable();

        snapshot.available_processors = thread::available_parallelism()
            .ok()
            .and_then(|count| i32::try_from(count.get()).ok())
            .unwrap_or(-1);

        snapshot.process_cpu_time = self
            .platform
            .process_processor_time()
            .map_or(-1, duration_to_millis);

        Ok(snapshot)
    }
}
