//! The periodic collection tick and the state it carries from one tick to the next.

use std::collections::{BTreeMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use foldhash::fast::RandomState;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::pal::{Platform, PlatformFacade};
use crate::period::start_of_day;
use crate::telemetry::web_server_totals;
use crate::{
    CollectorConfig, ContextSnapshot, CounterStore, Error, ErrorRecord, FileCounterStore,
    FileTimeSeriesStore, Millis, PeriodAggregator, PeriodView, Range, Registry, RegistrySnapshot,
    RequestStat, Result, Sample, SnapshotKey, TelemetrySnapshot, TelemetrySource,
    TimeSeriesStore, duration_to_millis,
};

/// Registry whose presence enables the HTTP session and active thread series.
const HTTP_REGISTRY_NAME: &str = "http";

type PendingWrites = BTreeMap<SnapshotKey, RegistrySnapshot>;

/// Periodically turns the cumulative totals of a fixed set of registries into per-period time
/// series, day aggregates and persisted snapshots.
///
/// Each call to [`collect()`][Self::collect] is one tick. A [`CollectionTimer`][1] can call it
/// at the configured resolution, or the host can drive it from its own scheduler. A tick:
///
/// 1. Harvests telemetry from every [`TelemetrySource`] and appends the derived series.
/// 2. Snapshots every displayed registry and subtracts the snapshot of the previous tick,
///    request by request, to get what happened during the period.
/// 3. Appends per-request and per-registry series for the period. A period without hits
///    appends [`Sample::NoData`], never zero.
/// 4. Folds the period into the aggregate of the current local day, starting a new aggregate
///    when the day changes.
/// 5. Persists every snapshot that changed. Failed writes stay queued and are retried on the
///    next tick.
/// 6. Once per day, deletes obsolete snapshot and series files and refreshes the disk usage.
///
/// Ticks never overlap, and readers of collector state such as
/// [`range_registry()`][Self::range_registry] see it either before or after a tick.
///
/// On construction, every registry is restored from its persisted cumulative snapshot, so
/// totals survive restarts. [`stop()`][Self::stop] persists everything one final time.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use tally::{Collector, CollectorConfig, MemoryCounterStore, MemoryTimeSeriesStore, Outcome,
///     Period};
///
/// let config = CollectorConfig::builder().application("doc").build().unwrap();
/// let http = config.registry("http").build();
///
/// let collector = Collector::builder(config)
///     .registry(http.clone())
///     .counter_store(Box::new(MemoryCounterStore::new()))
///     .time_series_store(Box::new(MemoryTimeSeriesStore::new()))
///     .build()
///     .unwrap();
///
/// http.record("/home GET", Duration::from_millis(12), &Outcome::success());
/// collector.collect().unwrap();
///
/// let today = collector.range_registry(Period::Day.into(), "http").unwrap();
/// assert_eq!(today.snapshot().total_hits(), 1);
///
/// collector.stop();
/// ```
///
/// [1]: crate::CollectionTimer
#[derive(Debug)]
pub struct Collector {
    config: CollectorConfig,
    registries: Vec<Registry>,
    counter_store: Box<dyn CounterStore>,
    time_series_store: Box<dyn TimeSeriesStore>,
    telemetry_sources: Vec<Box<dyn TelemetrySource>>,
    platform: PlatformFacade,

    // Held for the whole tick.
    state: Mutex<CollectorState>,
    stopped: AtomicBool,

    last_collect_duration: Mutex<Option<Duration>>,
    disk_usage: Mutex<Option<u64>>,
}

#[derive(Debug)]
struct CollectorState {
    // Same order as `Collector::registries`.
    registries: Vec<RegistryState>,
    known_series: HashSet<String, RandomState>,
    previous_telemetry: Option<(Instant, TelemetrySnapshot)>,
    cleanup_date: Option<NaiveDate>,
    pending: PendingWrites,
}

#[derive(Debug)]
struct RegistryState {
    // The cumulative snapshot taken by the previous tick. Periods are measured against it.
    baseline: RegistrySnapshot,
    generation: u64,

    today: NaiveDate,
    day: RegistrySnapshot,

    day_dirty: bool,
    cumulative_dirty: bool,
}

impl RegistryState {
    fn load(registry: &Registry, store: &dyn CounterStore, today: NaiveDate) -> Self {
        match store.read(&SnapshotKey::cumulative(registry.name())) {
            Ok(Some(snapshot)) => {
                debug!(
                    registry = registry.name(),
                    requests = snapshot.request_count(),
                    "restored cumulative snapshot"
                );
                registry.restore(snapshot);
            }
            Ok(None) => {}
            Err(error) => warn!(
                registry = registry.name(),
                %error,
                "cumulative snapshot unreadable, starting empty"
            ),
        }

        let day = match store.read(&SnapshotKey::day(registry.name(), today)) {
            Ok(Some(day)) => day,
            Ok(None) => RegistrySnapshot::empty_like(registry, start_of_day(today)),
            Err(error) => {
                warn!(
                    registry = registry.name(),
                    %today,
                    %error,
                    "day snapshot unreadable, starting the day empty"
                );
                RegistrySnapshot::empty_like(registry, start_of_day(today))
            }
        };

        let (baseline, generation) = registry.snapshot_with_generation();

        Self {
            baseline,
            generation,
            today,
            day,
            day_dirty: false,
            cumulative_dirty: false,
        }
    }

    fn roll_over(&mut self, registry: &Registry, today: NaiveDate) {
        debug!(registry = registry.name(), from = %self.today, to = %today, "day rollover");

        self.today = today;
        self.day = RegistrySnapshot::empty_like(registry, start_of_day(today));
        self.day_dirty = false;
    }

    fn queue_dirty(&mut self, registry: &Registry, pending: &mut PendingWrites) {
        if mem::take(&mut self.day_dirty) {
            pending.insert(
                SnapshotKey::day(registry.name(), self.today),
                self.day.clone(),
            );
        }

        if mem::take(&mut self.cumulative_dirty) {
            pending.insert(
                SnapshotKey::cumulative(registry.name()),
                self.baseline.clone(),
            );
        }
    }

    // The live registry is saved rather than the baseline, which is stale for registries the
    // tick skips.
    fn queue_all(&mut self, registry: &Registry, pending: &mut PendingWrites) {
        self.day_dirty = !self.day.is_empty();
        self.cumulative_dirty = false;
        self.queue_dirty(registry, pending);

        pending.insert(SnapshotKey::cumulative(registry.name()), registry.snapshot());
    }
}

impl Collector {
    /// Creates a builder for a collector with the given configuration.
    #[must_use]
    pub fn builder(config: CollectorConfig) -> CollectorBuilder {
        CollectorBuilder::new(config)
    }

    /// The configuration the collector was built with.
    #[must_use]
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// All registries, in the order they were added.
    #[must_use]
    pub fn registries(&self) -> &[Registry] {
        &self.registries
    }

    /// Looks up a registry by name.
    #[must_use]
    pub fn registry_by_name(&self, name: &str) -> Option<&Registry> {
        self.registries
            .iter()
            .find(|registry| registry.name() == name)
    }

    /// Looks up the registry a request identifier belongs to.
    #[must_use]
    pub fn registry_by_request_id(&self, id: &str) -> Option<&Registry> {
        self.registries
            .iter()
            .find(|registry| registry.is_request_id_from_this_registry(id))
    }

    /// Executions in progress that have no parent, across all displayed registries, the
    /// longest-running first.
    #[must_use]
    pub fn root_current_contexts(&self) -> Vec<ContextSnapshot> {
        let mut contexts: Vec<ContextSnapshot> = self
            .registries
            .iter()
            .filter(|registry| registry.is_displayed())
            .flat_map(Registry::current_root_contexts)
            .collect();

        contexts.sort_by(|a, b| b.elapsed().cmp(&a.elapsed()));
        contexts
    }

    /// Runs one collection tick.
    ///
    /// A failing step does not stop the tick: the remaining registries and series are still
    /// collected and snapshots that could not be written are retried on the next tick. Does
    /// nothing once the collector is stopped.
    ///
    /// # Errors
    ///
    /// Returns the first failure of the tick, after the whole tick has run.
    pub fn collect(&self) -> Result<()> {
        let mut state = self.state.lock();

        if self.stopped.load(Ordering::Relaxed) {
            debug!("collector is stopped, skipping collection");
            return Ok(());
        }

        self.tick(&mut state)
    }

    /// Runs one collection tick, logging instead of returning any failure.
    pub fn collect_without_errors(&self) {
        if let Err(error) = self.collect() {
            warn!(%error, "collection tick failed");
        }
    }

    /// Aggregates one registry over a range of days.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegistryNotFound`] if there is no registry with the given name.
    pub fn range_registry(&self, range: Range, name: &str) -> Result<PeriodView> {
        let (index, registry) = self
            .registries
            .iter()
            .enumerate()
            .find(|(_, registry)| registry.name() == name)
            .ok_or_else(|| Error::RegistryNotFound {
                name: name.to_owned(),
            })?;

        Ok(self.view(index, registry, range))
    }

    /// Aggregates every registry over a range of days.
    #[must_use]
    pub fn range_registries(&self, range: Range) -> Vec<PeriodView> {
        self.registries
            .iter()
            .enumerate()
            .map(|(index, registry)| self.view(index, registry, range))
            .collect()
    }

    /// Aggregates the registries that reports show over a range of days: the displayed ones
    /// that do not track background jobs.
    #[must_use]
    pub fn range_registries_to_display(&self, range: Range) -> Vec<PeriodView> {
        self.registries
            .iter()
            .enumerate()
            .filter(|(_, registry)| registry.is_displayed() && !registry.is_job_registry())
            .map(|(index, registry)| self.view(index, registry, range))
            .collect()
    }

    fn view(&self, index: usize, registry: &Registry, range: Range) -> PeriodView {
        let today = self.platform.local_now().date_naive();

        // Copy the day aggregate and release the lock before any file is read.
        let today_aggregate = self
            .state
            .lock()
            .registries
            .get(index)
            .filter(|state| state.today == today)
            .map_or_else(
                || RegistrySnapshot::empty_like(registry, start_of_day(today)),
                |state| state.day.clone(),
            );

        PeriodAggregator::new(&*self.counter_store).view(registry, today, &today_aggregate, range)
    }

    /// Removes all statistics of one registry.
    ///
    /// Day aggregates that were already collected are kept. The cumulative snapshot is
    /// replaced by an empty one on the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegistryNotFound`] if there is no registry with the given name.
    pub fn clear_registry(&self, name: &str) -> Result<()> {
        let registry = self
            .registry_by_name(name)
            .ok_or_else(|| Error::RegistryNotFound {
                name: name.to_owned(),
            })?;

        // Never in the middle of a tick, which would then measure the clear as a period.
        let _state = self.state.lock();
        registry.clear();

        info!(registry = name, "registry cleared");
        Ok(())
    }

    /// Removes all statistics of every registry.
    pub fn clear_all_registries(&self) {
        let _state = self.state.lock();

        for registry in &self.registries {
            registry.clear();
        }

        info!("all registries cleared");
    }

    /// Deletes snapshot and series files that have not been written to within their
    /// configured retention, returning how many of each were deleted.
    ///
    /// # Errors
    ///
    /// Fails if a store cannot enumerate or delete its files.
    pub fn delete_obsolete_files(&self) -> Result<(usize, usize)> {
        let result = {
            let mut state = self.state.lock();
            self.delete_obsolete(&mut state.known_series)
        };

        self.refresh_disk_usage();
        result
    }

    /// Bytes used by persisted snapshots and series.
    ///
    /// Measured once per day by the tick, or now if it has not been measured yet.
    #[must_use]
    pub fn disk_usage(&self) -> u64 {
        let known = *self.disk_usage.lock();
        known.unwrap_or_else(|| self.refresh_disk_usage())
    }

    /// How long the most recent tick took, if there was one.
    #[must_use]
    pub fn last_collect_duration(&self) -> Option<Duration> {
        *self.last_collect_duration.lock()
    }

    /// Whether [`stop()`][Self::stop] has completed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Runs a final tick, then persists the cumulative snapshot and the current day aggregate
    /// of every registry, whether or not they changed.
    ///
    /// Registries keep accepting executions afterwards, but nothing more is collected or
    /// persisted. Calling this again does nothing.
    pub fn stop(&self) {
        let mut guard = self.state.lock();

        if self.stopped.load(Ordering::Relaxed) {
            return;
        }

        if let Err(error) = self.tick(&mut guard) {
            warn!(%error, "final collection tick failed");
        }

        let state = &mut *guard;

        for (registry, registry_state) in self.registries.iter().zip(&mut state.registries) {
            registry_state.queue_all(registry, &mut state.pending);
        }

        if let Err(error) = self.flush(&mut state.pending) {
            warn!(
                %error,
                unwritten = state.pending.len(),
                "final persistence failed, some statistics are lost"
            );
        }

        self.stopped.store(true, Ordering::Relaxed);

        info!(application = self.config.application(), "collector stopped");
    }

    fn tick(&self, state: &mut CollectorState) -> Result<()> {
        let started = self.platform.now();
        let local_now = self.platform.local_now();
        let today = local_now.date_naive();
        let mut first_error = None;

        let CollectorState {
            registries,
            known_series,
            previous_telemetry,
            cleanup_date,
            pending,
        } = state;

        let mut series = SeriesWriter {
            store: &*self.time_series_store,
            known: &mut *known_series,
            timestamp: local_now.to_utc(),
            first_error: None,
        };

        if let Err(error) = self.collect_telemetry(&mut series, previous_telemetry, started) {
            first_error.get_or_insert(error);
        }

        for (registry, registry_state) in self.registries.iter().zip(registries.iter_mut()) {
            if registry_state.today != today {
                registry_state.roll_over(registry, today);
            }

            if !registry.is_displayed() {
                continue;
            }

            self.collect_registry(registry, registry_state, &mut series);
            registry_state.queue_dirty(registry, pending);
        }

        if let Some(error) = series.first_error {
            first_error.get_or_insert(error);
        }

        if let Err(error) = self.flush(pending) {
            first_error.get_or_insert(error);
        }

        if *cleanup_date != Some(today) {
            *cleanup_date = Some(today);

            if let Err(error) = self.delete_obsolete(known_series) {
                warn!(%error, "obsolete file cleanup failed");
                first_error.get_or_insert(error);
            }

            self.refresh_disk_usage();
        }

        let elapsed = self.platform.now().saturating_duration_since(started);
        *self.last_collect_duration.lock() = Some(elapsed);

        debug!(
            elapsed_ms = duration_to_millis(elapsed),
            pending = pending.len(),
            "collection tick finished"
        );

        first_error.map_or(Ok(()), Err)
    }

    fn collect_registry(
        &self,
        registry: &Registry,
        state: &mut RegistryState,
        series: &mut SeriesWriter<'_>,
    ) {
        let (current, generation) = registry.snapshot_with_generation();

        if generation != state.generation {
            debug!(
                registry = registry.name(),
                "registry was cleared, measuring from an empty baseline"
            );

            state.baseline = RegistrySnapshot::empty_like(registry, registry.start_date());
            state.generation = generation;
            state.cumulative_dirty = true;
        }

        let mut period = RegistrySnapshot::empty_like(registry, state.day.start_date());
        let per_request_series = !registry.is_error_registry();

        for request in current.requests() {
            let delta = period_delta(request, state.baseline.request_by_id(request.id()));

            if per_request_series {
                series.append(
                    request.id(),
                    request.name(),
                    Sample::from_sentinel(millis_as_f64(delta.mean())),
                );
            }

            if delta.hits() > 0 {
                period.add_request(&delta);
            }
        }

        if per_request_series {
            // Evicted or cleared since the previous tick.
            for gone in state
                .baseline
                .requests()
                .filter(|request| current.request_by_id(request.id()).is_none())
            {
                series.delete(gone.id());
            }
        }

        if registry.is_error_registry() {
            period.add_errors(new_errors(&state.baseline, &current));
        }

        self.append_registry_series(registry, &period, series);

        if !period.is_empty() {
            trace!(
                registry = registry.name(),
                requests = period.request_count(),
                hits = period.total_hits(),
                "period collected"
            );

            state.day.merge(&period);
            state.day.evict_overflow(
                registry.max_requests_count(),
                registry.eviction_hits_threshold(),
            );
            state.day_dirty = true;
            state.cumulative_dirty = true;
        }

        state.baseline = current;
    }

    fn append_registry_series(
        &self,
        registry: &Registry,
        period: &RegistrySnapshot,
        series: &mut SeriesWriter<'_>,
    ) {
        let name = registry.name();
        let global = period.global_request();

        let hits_rate = if global.hits() > 0 {
            Sample::Value(
                u64_as_f64(global.hits()) * 60.0 / self.config.resolution().as_secs_f64(),
            )
        } else {
            Sample::NoData
        };

        series.append(
            &format!("{name}HitsRate"),
            &format!("{name} hits per minute"),
            hits_rate,
        );

        if registry.is_error_registry() {
            return;
        }

        series.append(
            &format!("{name}MeanTimes"),
            &format!("{name} mean duration (ms)"),
            Sample::from_sentinel(millis_as_f64(global.mean())),
        );
        series.append(
            &format!("{name}SystemErrors"),
            &format!("{name} system errors (%)"),
            Sample::from_sentinel(global.system_error_percentage()),
        );
    }

    fn collect_telemetry(
        &self,
        series: &mut SeriesWriter<'_>,
        previous: &mut Option<(Instant, TelemetrySnapshot)>,
        now: Instant,
    ) -> Result<()> {
        let mut first_error = None;
        let mut snapshots = Vec::with_capacity(self.telemetry_sources.len());

        for source in &self.telemetry_sources {
            match source.snapshot() {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(error) => {
                    warn!(?source, %error, "telemetry source failed, skipping it this tick");
                    first_error.get_or_insert(error);
                }
            }
        }

        if let Some(current) = snapshots
            .into_iter()
            .reduce(|combined, snapshot| combined.combine(&snapshot))
        {
            let since_previous = previous
                .as_ref()
                .map(|(at, snapshot)| (now.saturating_duration_since(*at), snapshot));

            self.append_telemetry_series(series, &current, since_previous);

            *previous = Some((now, current));
        }

        first_error.map_or(Ok(()), Err)
    }

    fn append_telemetry_series(
        &self,
        series: &mut SeriesWriter<'_>,
        current: &TelemetrySnapshot,
        previous: Option<(Duration, &TelemetrySnapshot)>,
    ) {
        let with_database = !self.config.no_database();
        let with_http = self.registry_by_name(HTTP_REGISTRY_NAME).is_some();

        series.append_available("usedMemory", i64_as_f64(current.used_memory));

        if with_http {
            series.append_available("httpSessions", f64::from(current.session_count));
            series.append_available("activeThreads", f64::from(current.active_thread_count));
            series.append(
                "httpSessionsMeanAge",
                "httpSessionsMeanAge",
                Sample::from_sentinel(i64_as_f64(current.session_mean_age_minutes())),
            );
        }

        if with_database {
            series.append_available(
                "activeConnections",
                f64::from(current.active_connection_count),
            );
            series.append_available("usedConnections", f64::from(current.used_connection_count));
        }

        series.append_available("threadCount", f64::from(current.thread_count));
        series.append_available("loadedClassesCount", f64::from(current.loaded_classes_count));
        series.append_available("usedNonHeapMemory", i64_as_f64(current.used_non_heap_memory));
        series.append_available(
            "usedPhysicalMemorySize",
            i64_as_f64(current.used_physical_memory_size),
        );
        series.append_available("usedSwapSpaceSize", i64_as_f64(current.used_swap_space_size));
        series.append_available("systemLoad", current.system_load_average);
        series.append_available(
            "fileDescriptors",
            i64_as_f64(current.open_file_descriptor_count),
        );

        let web = web_server_totals(&current.web_servers);

        if let Some((busy_threads, _, _)) = web {
            series.append_available("webBusyThreads", i64_as_f64(busy_threads));
        }

        // Everything below is a rate and needs two snapshots.
        let Some((period, previous)) = previous else {
            return;
        };

        let processors = current.available_processors;

        if let Some(cpu) = share_of_period(
            current.process_cpu_time,
            previous.process_cpu_time,
            period,
            processors,
        ) {
            series.append_available("cpu", cpu);
        }

        if let Some(gc) = share_of_period(
            current.garbage_collection_time,
            previous.garbage_collection_time,
            period,
            processors,
        ) {
            series.append_available("gc", gc);
        }

        if with_database {
            if let Some(rate) = per_minute(
                current.transaction_count,
                previous.transaction_count,
                period,
            ) {
                series.append_available("transactionsRate", rate);
            }
        }

        if let (Some((_, received, sent)), Some((_, previous_received, previous_sent))) =
            (web, web_server_totals(&previous.web_servers))
        {
            if let Some(rate) = per_minute(received, previous_received, period) {
                series.append_available("webBytesReceived", rate);
            }

            if let Some(rate) = per_minute(sent, previous_sent, period) {
                series.append_available("webBytesSent", rate);
            }
        }
    }

    fn flush(&self, pending: &mut PendingWrites) -> Result<()> {
        let mut first_error = None;

        pending.retain(|key, snapshot| match self.counter_store.write(key, snapshot) {
            Ok(()) => {
                trace!(%key, "snapshot persisted");
                false
            }
            Err(error) => {
                warn!(%key, %error, "snapshot not persisted, will retry");
                first_error.get_or_insert(error);
                true
            }
        });

        first_error.map_or(Ok(()), Err)
    }

    fn delete_obsolete(
        &self,
        known_series: &mut HashSet<String, RandomState>,
    ) -> Result<(usize, usize)> {
        let snapshots = self
            .counter_store
            .delete_obsolete(self.config.snapshot_retention())?;
        let series = self
            .time_series_store
            .delete_obsolete_series(self.config.series_retention())?;

        if series > 0 {
            // Recreated on their next append.
            known_series.clear();
        }

        debug!(snapshots, series, "deleted obsolete files");
        Ok((snapshots, series))
    }

    fn refresh_disk_usage(&self) -> u64 {
        let snapshots = self.counter_store.disk_usage().unwrap_or_else(|error| {
            warn!(%error, "snapshot disk usage unknown");
            0
        });
        let series = self
            .time_series_store
            .total_bytes_on_disk()
            .unwrap_or_else(|error| {
                warn!(%error, "time series disk usage unknown");
                0
            });

        let total = snapshots.saturating_add(series);
        *self.disk_usage.lock() = Some(total);
        total
    }
}

/// What happened to a request since the previous tick.
fn period_delta(current: &RequestStat, previous: Option<&RequestStat>) -> RequestStat {
    let mut delta = current.clone();

    // Fewer hits than before means the request was evicted and came back in between, so
    // everything it has now happened during the period.
    if let Some(previous) = previous.filter(|previous| previous.hits() <= current.hits()) {
        delta.remove_hits(previous);
    }

    delta
}

/// Error records that appeared since the previous tick.
fn new_errors(baseline: &RegistrySnapshot, current: &RegistrySnapshot) -> Vec<ErrorRecord> {
    let newest_known = baseline.errors().last().map(ErrorRecord::time);

    current
        .errors()
        .iter()
        .filter(|error| newest_known.is_none_or(|newest| error.time() > newest))
        .cloned()
        .collect()
}

/// Percentage of the period (over all processors) taken by a cumulative time, capped at 100.
fn share_of_period(
    current: Millis,
    previous: Millis,
    period: Duration,
    processors: i32,
) -> Option<f64> {
    let used = increase(current, previous)?;
    let available = period.as_secs_f64() * 1000.0 * f64::from(processors.max(1));

    (available > 0.0).then(|| (i64_as_f64(used) * 100.0 / available).min(100.0))
}

/// Per-minute rate of a cumulative counter.
fn per_minute(current: i64, previous: i64, period: Duration) -> Option<f64> {
    let increase = increase(current, previous)?;
    let minutes = period.as_secs_f64() / 60.0;

    (minutes > 0.0).then(|| i64_as_f64(increase) / minutes)
}

/// Growth of a cumulative counter, unless either value is unavailable or it was reset.
fn increase(current: i64, previous: i64) -> Option<i64> {
    (current >= 0 && previous >= 0 && current >= previous)
        .then(|| current.saturating_sub(previous))
}

#[expect(
    clippy::cast_precision_loss,
    reason = "metric values stay far below 2^52, where f64 is exact"
)]
fn i64_as_f64(value: i64) -> f64 {
    value as f64
}

#[expect(
    clippy::cast_precision_loss,
    reason = "hit counts per period stay far below 2^52, where f64 is exact"
)]
fn u64_as_f64(value: u64) -> f64 {
    value as f64
}

fn millis_as_f64(value: Millis) -> f64 {
    i64_as_f64(value)
}

/// Appends the samples of one tick, creating series on first use.
struct SeriesWriter<'a> {
    store: &'a dyn TimeSeriesStore,
    known: &'a mut HashSet<String, RandomState>,
    timestamp: DateTime<Utc>,
    first_error: Option<Error>,
}

impl SeriesWriter<'_> {
    fn append(&mut self, key: &str, label: &str, sample: Sample) {
        if !self.known.contains(key) {
            if let Err(error) = self.store.create_series(key, label) {
                self.fail(key, error);
                return;
            }

            self.known.insert(key.to_owned());
        }

        match self.store.append(key, self.timestamp, sample) {
            Ok(()) => trace!(series = key, ?sample, "sample appended"),
            Err(error) => {
                // Maybe deleted behind our back. Create it again next time.
                self.known.remove(key);
                self.fail(key, error);
            }
        }
    }

    /// Appends a value unless it is negative, which means it was not measured.
    fn append_available(&mut self, key: &str, value: f64) {
        if value >= 0.0 {
            self.append(key, key, Sample::Value(value));
        }
    }

    fn delete(&mut self, key: &str) {
        self.known.remove(key);

        if let Err(error) = self.store.delete_series(key) {
            self.fail(key, error);
        }
    }

    fn fail(&mut self, key: &str, error: Error) {
        warn!(series = key, %error, "time series update failed");
        self.first_error.get_or_insert(error);
    }
}

/// Builds a [`Collector`].
///
/// Without explicit stores, snapshots and series are kept in files under the configured
/// storage directory.
#[derive(Debug)]
#[must_use]
pub struct CollectorBuilder {
    config: CollectorConfig,
    registries: Vec<Registry>,
    counter_store: Option<Box<dyn CounterStore>>,
    time_series_store: Option<Box<dyn TimeSeriesStore>>,
    telemetry_sources: Vec<Box<dyn TelemetrySource>>,
    platform: PlatformFacade,
}

impl CollectorBuilder {
    fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            registries: Vec::new(),
            counter_store: None,
            time_series_store: None,
            telemetry_sources: Vec::new(),
            platform: PlatformFacade::real(),
        }
    }

    /// Adds a registry. The set of registries is fixed once the collector is built.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registries.push(registry);
        self
    }

    /// Adds several registries.
    pub fn registries(mut self, registries: impl IntoIterator<Item = Registry>) -> Self {
        self.registries.extend(registries);
        self
    }

    /// Sets where snapshots are persisted.
    pub fn counter_store(self, counter_store: Box<dyn CounterStore>) -> Self {
        Self {
            counter_store: Some(counter_store),
            ..self
        }
    }

    /// Sets where time series are appended.
    pub fn time_series_store(self, time_series_store: Box<dyn TimeSeriesStore>) -> Self {
        Self {
            time_series_store: Some(time_series_store),
            ..self
        }
    }

    /// Adds a telemetry source. With several sources, their snapshots are combined.
    pub fn telemetry_source(mut self, source: Box<dyn TelemetrySource>) -> Self {
        self.telemetry_sources.push(source);
        self
    }

    #[cfg(test)]
    pub(crate) fn platform(self, platform: PlatformFacade) -> Self {
        Self { platform, ..self }
    }

    /// Builds the collector, restoring every registry from its persisted snapshot.
    ///
    /// # Errors
    ///
    /// * [`Error::DuplicateRegistry`] if two registries share a name.
    /// * [`Error::UnknownChildRegistry`] if a registry names a child registry that was not
    ///   added.
    pub fn build(self) -> Result<Collector> {
        let mut names =
            HashSet::with_capacity_and_hasher(self.registries.len(), RandomState::default());

        for registry in &self.registries {
            if !names.insert(registry.name()) {
                return Err(Error::DuplicateRegistry {
                    name: registry.name().to_owned(),
                });
            }
        }

        for registry in &self.registries {
            if let Some(child) = registry
                .child_registry_name()
                .filter(|child| !names.contains(child))
            {
                return Err(Error::UnknownChildRegistry {
                    registry: registry.name().to_owned(),
                    child: child.to_owned(),
                });
            }
        }

        let storage_directory = self.config.storage_directory().to_path_buf();

        let counter_store = self
            .counter_store
            .unwrap_or_else(|| Box::new(FileCounterStore::new(&storage_directory)));
        let time_series_store = self
            .time_series_store
            .unwrap_or_else(|| {
                Box::new(
                    FileTimeSeriesStore::new(&storage_directory)
                        .with_retention(self.config.series_retention()),
                )
            });

        let today = self.platform.local_now().date_naive();

        let registry_states = self
            .registries
            .iter()
            .map(|registry| RegistryState::load(registry, &*counter_store, today))
            .collect();

        info!(
            application = self.config.application(),
            registries = self.registries.len(),
            storage_directory = %storage_directory.display(),
            "collector created"
        );

        Ok(Collector {
            config: self.config,
            registries: self.registries,
            counter_store,
            time_series_store,
            telemetry_sources: self.telemetry_sources,
            platform: self.platform,
            state: Mutex::new(CollectorState {
                registries: registry_states,
                known_series: HashSet::default(),
                previous_telemetry: None,
                cleanup_date: None,
                pending: PendingWrites::new(),
            }),
            stopped: AtomicBool::new(false),
            last_collect_duration: Mutex::new(None),
            disk_usage: Mutex::new(None),
        })
    }
}
