use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use cpu_time::{ProcessTime, ThreadTime};

use crate::pal::abstractions::Platform;

/// Real implementation of the platform abstraction using the operating system clocks and
/// the `cpu_time` crate.
#[derive(Clone, Debug)]
pub(crate) struct RealPlatform;

impl Platform for RealPlatform {
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder to the OS.
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[cfg_attr(test, mutants::skip)] // Trivial forwarder to the OS.
    fn local_now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn thread_processor_time(&self) -> Option<Duration> {
        ThreadTime::try_now().ok().map(|time| time.as_duration())
    }

    fn process_processor_time(&self) -> Option<Duration> {
        ProcessTime::try_now().ok().map(|time| time.as_duration())
    }
}
