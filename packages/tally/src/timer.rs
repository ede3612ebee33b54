use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::{Collector, duration_to_millis};

const THREAD_NAME: &str = "tally-collector";

/// Runs [`Collector::collect()`] on a dedicated thread at a fixed interval.
///
/// Ticks never overlap. If a tick runs for longer than the interval, the ticks that were due in
/// the meantime are skipped, not queued.
///
/// Stopping the timer, explicitly or by dropping it, wakes and joins the thread and then
/// [stops][Collector::stop] the collector, which persists everything one final time.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use tally::{CollectionTimer, Collector, CollectorConfig, MemoryCounterStore,
///     MemoryTimeSeriesStore};
///
/// let config = CollectorConfig::builder().application("doc").build().unwrap();
/// let interval = config.resolution();
/// let http = config.registry("http").build();
///
/// let collector = Arc::new(
///     Collector::builder(config)
///         .registry(http)
///         .counter_store(Box::new(MemoryCounterStore::new()))
///         .time_series_store(Box::new(MemoryTimeSeriesStore::new()))
///         .build()
///         .unwrap(),
/// );
///
/// let timer = CollectionTimer::start(Arc::clone(&collector), interval);
/// timer.stop();
///
/// assert!(collector.is_stopped());
/// ```
#[derive(Debug)]
pub struct CollectionTimer {
    collector: Arc<Collector>,
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct StopSignal {
    requested: Mutex<bool>,
    wake: Condvar,
}

impl CollectionTimer {
    /// Starts ticking. The first tick happens one interval from now.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to create the timer thread.
    #[must_use]
    pub fn start(collector: Arc<Collector>, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let signal = Arc::new(StopSignal::default());

        let thread = {
            let collector = Arc::clone(&collector);
            let signal = Arc::clone(&signal);

            thread::Builder::new()
                .name(THREAD_NAME.to_owned())
                .spawn(move || {
                    debug!(
                        interval_ms = duration_to_millis(interval),
                        "collection timer started"
                    );
                    timer_loop(&collector, &signal, interval);
                    debug!("collection timer exiting");
                })
                .expect(
                    "failed to spawn collection timer thread: \
                     thread spawning failure is not supported",
                )
        };

        Self {
            collector,
            signal,
            thread: Some(thread),
        }
    }

    /// The collector the timer drives.
    #[must_use]
    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Stops ticking, waits for a tick in progress to finish and stops the collector.
    pub fn stop(mut self) {
        self.shut_down();
    }

    fn shut_down(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        *self.signal.requested.lock() = true;
        self.signal.wake.notify_all();

        if thread.join().is_err() {
            warn!("collection timer thread panicked");
        }

        self.collector.stop();
    }
}

impl Drop for CollectionTimer {
    fn drop(&mut self) {
        self.shut_down();
    }
}

fn timer_loop(collector: &Collector, signal: &StopSignal, interval: Duration) {
    let mut deadline = next_deadline(Instant::now(), interval, Instant::now());

    loop {
        {
            let mut requested = signal.requested.lock();

            while !*requested {
                if signal.wake.wait_until(&mut requested, deadline).timed_out() {
                    break;
                }
            }

            if *requested {
                return;
            }
        }

        run_tick(collector);

        deadline = next_deadline(deadline, interval, Instant::now());
    }
}

/// Runs one tick. A panicking tick is logged and the timer keeps going.
fn run_tick(collector: &Collector) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| collector.collect_without_errors()));

    if let Err(payload) = result {
        warn!(
            panic = panic_message(&*payload),
            "collection tick panicked, will tick again at the next interval"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// The first deadline after `now` on the grid that starts at `previous`.
fn next_deadline(previous: Instant, interval: Duration, now: Instant) -> Instant {
    let mut deadline = previous;
    let mut skipped: u32 = 0;

    loop {
        deadline = match deadline.checked_add(interval) {
            Some(deadline) => deadline,
            None => return now,
        };

        if deadline > now {
            break;
        }

        skipped = skipped.saturating_add(1);
    }

    if skipped > 0 {
        debug!(skipped, "collection tick overran, skipping overdue ticks");
    }

    deadline
}
