use std::fmt::Debug;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

/// Clocks and processor time meters used by the collector and by execution contexts.
pub(crate) trait Platform: Debug + Send + Sync + 'static {
    /// Monotonic timestamp used to measure execution durations.
    fn now(&self) -> Instant;

    /// Local wall-clock time, used for calendar days and series timestamps.
    fn local_now(&self) -> DateTime<Local>;

    /// Processor time consumed so far by the current thread, if the platform can tell.
    fn thread_processor_time(&self) -> Option<Duration>;

    /// Processor time consumed so far by the whole process, if the platform can tell.
    fn process_processor_time(&self) -> Option<Duration>;
}
