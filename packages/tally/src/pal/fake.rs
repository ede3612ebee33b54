use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, TimeZone};

use crate::pal::abstractions::Platform;

#[derive(Debug)]
struct FakePlatformState {
    elapsed: Duration,
    local_now: DateTime<Local>,
    thread_processor_time: Option<Duration>,
    process_processor_time: Option<Duration>,
}

/// Fake platform whose clocks only move when a test moves them.
///
/// Clones share the same state, so a test can keep one clone and hand another to the code
/// under test.
#[derive(Clone, Debug)]
pub(crate) struct FakePlatform {
    origin: Instant,
    state: Arc<Mutex<FakePlatformState>>,
}

impl FakePlatform {
    /// Creates a fake platform whose local clock starts at noon on 2024-03-15.
    pub(crate) fn new() -> Self {
        let local_now = Local
            .with_ymd_and_hms(2024, 3, 15, 12, 0, 0)
            .single()
            .expect("noon is never ambiguous");

        Self::starting_at(local_now)
    }

    pub(crate) fn starting_at(local_now: DateTime<Local>) -> Self {
        Self {
            origin: Instant::now(),
            state: Arc::new(Mutex::new(FakePlatformState {
                elapsed: Duration::ZERO,
                local_now,
                thread_processor_time: Some(Duration::ZERO),
                process_processor_time: Some(Duration::ZERO),
            })),
        }
    }

    /// Moves both the monotonic and the local clock forward.
    pub(crate) fn advance(&self, by: Duration) {
        let mut state = self
            .state
            .lock()
            .expect("FakePlatform state lock should not be poisoned");

        state.elapsed += by;
        state.local_now += chrono::Duration::from_std(by).expect("test durations are small");
    }

    pub(crate) fn set_thread_processor_time(&self, time: Option<Duration>) {
        self.state
            .lock()
            .expect("FakePlatform state lock should not be poisoned")
            .thread_processor_time = time;
    }

    pub(crate) fn set_process_processor_time(&self, time: Option<Duration>) {
        self.state
            .lock()
            .expect("FakePlatform state lock should not be poisoned")
            .process_processor_time = time;
    }
}

impl Platform for FakePlatform {
    fn now(&self) -> Instant {
        let elapsed = self
            .state
            .lock()
            .expect("FakePlatform state lock should not be poisoned")
            .elapsed;

        self.origin + elapsed
    }

    fn local_now(&self) -> DateTime<Local> {
        self.state
            .lock()
            .expect("FakePlatform state lock should not be poisoned")
            .local_now
    }

    fn thread_processor_time(&self) -> Option<Duration> {
        self.state
            .lock()
            .expect("FakePlatform state lock should not be poisoned")
            .thread_processor_time
    }

    fn process_processor_time(&self) -> Option<Duration> {
        self.state
            .lock()
            .expect("FakePlatform state lock should not be poisoned")
            .process_processor_time
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use chrono::Datelike;

    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let platform = FakePlatform::new();
        let start = platform.now();

        platform.advance(Duration::from_secs(13 * 3600));

        assert_eq!(platform.now().duration_since(start), Duration::from_secs(13 * 3600));
        assert_eq!(platform.local_now().day(), 16);
    }

    #[test]
    fn clones_share_state() {
        let platform = FakePlatform::new();
        let clone = platform.clone();

        clone.set_thread_processor_time(Some(Duration::from_millis(7)));

        assert_eq!(platform.thread_processor_time(), Some(Duration::from_millis(7)));
    }
}
