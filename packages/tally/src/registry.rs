use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use foldhash::fast::RandomState;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::context::ExecutionContext;
use crate::error_record::push_bounded;
use crate::pal::{Platform, PlatformFacade};
use crate::registry_snapshot::select_eviction_victims;
use crate::request_stat::CompletedExecution;
use crate::{
    ContextSnapshot, ErrorRecord, Outcome, REQUEST_HASH_LEN, RegistryBuilder, RegistrySnapshot,
    RequestStat, duration_to_millis, request_id,
};

type RequestMap = HashMap<String, Arc<Mutex<RequestStat>>, RandomState>;

/// A named collection of request statistics for one category of instrumented calls, such as
/// HTTP requests, SQL statements or background jobs.
///
/// A registry is a cheap handle: clones refer to the same underlying statistics. Registries are
/// created through [`Registry::builder()`] and then handed to a [`Collector`][1], which
/// periodically snapshots them.
///
/// Instrumented code records executions either through [`Registry::begin()`] and
/// [`Registry::end()`] with a [`CallStack`][2] (which tracks nesting and powers the live view of
/// in-progress requests) or directly with [`Registry::record()`] when the duration is already
/// known.
///
/// # Thread safety
///
/// All operations may be called from any number of threads at the same time. Updates to
/// different requests never contend with each other except briefly when a request is seen for
/// the first time. Updates to the same request serialize on a short per-request lock.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use tally::{Outcome, Registry};
///
/// let http = Registry::builder().name("http").child_registry("sql").build();
///
/// http.record("/home GET", Duration::from_millis(12), &Outcome::success());
/// http.record("/home GET", Duration::from_millis(20), &Outcome::success());
///
/// let home = http.request_by_name("/home GET").unwrap();
/// assert_eq!(home.hits(), 2);
/// assert_eq!(home.mean(), 16);
/// ```
///
/// [1]: crate::Collector
/// [2]: crate::CallStack
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    name: String,
    error_registry: bool,
    job_registry: bool,
    child_registry_name: Option<String>,
    displayed: AtomicBool,

    max_requests_count: usize,
    eviction_hits_threshold: u64,

    requests: RwLock<RequestMap>,
    errors: Mutex<Vec<ErrorRecord>>,
    start_date: Mutex<DateTime<Utc>>,

    // Open root contexts, keyed by context key. Entries are removed when the context ends.
    root_contexts: DashMap<u64, Arc<ExecutionContext>>,

    // Incremented whenever the registry is cleared, so observers can tell that cumulative
    // totals went backwards on purpose.
    generation: AtomicU64,

    platform: PlatformFacade,
}

impl Registry {
    /// Creates a new registry builder.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub(crate) fn new(builder: RegistryBuilder) -> Self {
        let start_date = builder.platform.local_now().to_utc();

        Self {
            inner: Arc::new(RegistryInner {
                name: builder.name,
                error_registry: builder.error_registry,
                job_registry: builder.job_registry,
                child_registry_name: builder.child_registry_name,
                displayed: AtomicBool::new(builder.displayed),
                max_requests_count: builder.max_requests_count,
                eviction_hits_threshold: builder.eviction_hits_threshold,
                requests: RwLock::new(RequestMap::default()),
                errors: Mutex::new(Vec::new()),
                start_date: Mutex::new(start_date),
                root_contexts: DashMap::new(),
                generation: AtomicU64::new(0),
                platform: builder.platform,
            }),
        }
    }

    /// The name of the registry, unique within its collector.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether this registry keeps error records.
    #[must_use]
    pub fn is_error_registry(&self) -> bool {
        self.inner.error_registry
    }

    /// Whether this registry tracks background jobs.
    #[must_use]
    pub fn is_job_registry(&self) -> bool {
        self.inner.job_registry
    }

    /// The name of the registry whose executions are attributed to requests of this one.
    #[must_use]
    pub fn child_registry_name(&self) -> Option<&str> {
        self.inner.child_registry_name.as_deref()
    }

    /// Whether the registry is currently displayed in reports.
    #[must_use]
    pub fn is_displayed(&self) -> bool {
        self.inner.displayed.load(Ordering::Relaxed)
    }

    /// Shows or hides the registry in reports, for example once usage of the instrumented
    /// component has been detected at runtime.
    pub fn set_displayed(&self, displayed: bool) {
        self.inner.displayed.store(displayed, Ordering::Relaxed);
    }

    /// The ceiling on the number of distinct requests kept in memory.
    #[must_use]
    pub fn max_requests_count(&self) -> usize {
        self.inner.max_requests_count
    }

    /// The hit count below which requests are evicted first on overflow.
    #[must_use]
    pub fn eviction_hits_threshold(&self) -> u64 {
        self.inner.eviction_hits_threshold
    }

    /// When accumulation of the current totals started (creation, restore or last clear).
    #[must_use]
    pub fn start_date(&self) -> DateTime<Utc> {
        *self.inner.start_date.lock()
    }

    /// Records one completed execution whose duration was measured by the caller.
    ///
    /// Processor time is only recorded if the outcome carries it.
    pub fn record(&self, name: &str, duration: Duration, outcome: &Outcome) {
        let id = request_id(&self.inner.name, name);

        self.fold(
            id,
            name,
            &CompletedExecution {
                duration: duration_to_millis(duration),
                cpu_time: outcome.cpu_time.map(duration_to_millis),
                system_error: outcome.system_error,
                response_size: outcome.response_size,
                ..Default::default()
            },
        );
    }

    /// Records a system error: one execution of a request named after the error message, and
    /// the error record itself.
    pub fn record_system_error(&self, record: ErrorRecord, duration: Duration) {
        self.record(record.message(), duration, &Outcome::system_error());

        push_bounded(&mut self.inner.errors.lock(), [record]);
    }

    /// The most recent error records, oldest first.
    #[must_use]
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.inner.errors.lock().clone()
    }

    /// Number of distinct requests currently kept.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.inner.requests.read().len()
    }

    /// A copy of the statistics of the request with the given identifier.
    #[must_use]
    pub fn request_by_id(&self, id: &str) -> Option<RequestStat> {
        let entry = self.inner.requests.read().get(id).map(Arc::clone)?;
        let stat = entry.lock().clone();
        Some(stat)
    }

    /// A copy of the statistics of the request with the given name.
    #[must_use]
    pub fn request_by_name(&self, name: &str) -> Option<RequestStat> {
        self.request_by_id(&request_id(&self.inner.name, name))
    }

    /// Whether a request identifier belongs to this registry.
    #[must_use]
    pub fn is_request_id_from_this_registry(&self, id: &str) -> bool {
        id.len() == self.inner.name.len().saturating_add(REQUEST_HASH_LEN)
            && id.starts_with(self.inner.name.as_str())
    }

    /// Takes a point-in-time copy of all statistics in the registry.
    ///
    /// Each request is copied atomically. Requests completing while the snapshot is being taken
    /// may or may not be included.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.snapshot_with_generation().0
    }

    /// Takes a snapshot together with the clear generation it belongs to.
    ///
    /// Both are read under the same lock that [`clear()`][Self::clear] takes for writing, so a
    /// clear is either entirely before the snapshot or entirely after it.
    pub(crate) fn snapshot_with_generation(&self) -> (RegistrySnapshot, u64) {
        let map = self.inner.requests.read();

        let requests: Vec<RequestStat> = map.values().map(|entry| entry.lock().clone()).collect();
        let generation = self.generation();
        let start_date = self.start_date();
        let errors = self.errors();

        drop(map);

        (
            RegistrySnapshot::from_parts(self, start_date, requests, errors),
            generation,
        )
    }

    /// Removes all statistics and error records.
    ///
    /// Executions in progress are not affected. They complete normally and their results land
    /// in the now-empty registry.
    pub fn clear(&self) {
        let start_date = self.inner.platform.local_now().to_utc();

        {
            let mut requests = self.inner.requests.write();
            requests.clear();
            self.inner.errors.lock().clear();
            *self.inner.start_date.lock() = start_date;
            self.inner.generation.fetch_add(1, Ordering::Relaxed);
        }

        trace!(registry = %self.inner.name, "cleared");
    }

    /// Snapshots of the executions of this registry that are in progress and have no parent.
    ///
    /// Nested executions appear as children of their root.
    #[must_use]
    pub fn current_root_contexts(&self) -> Vec<ContextSnapshot> {
        // Copy references first so no map shard lock is held while inspecting contexts.
        let roots: Vec<Arc<ExecutionContext>> = self
            .inner
            .root_contexts
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let now = self.inner.platform.now();

        roots.iter().map(|context| context.snapshot(now)).collect()
    }

    /// Replaces the contents of the registry with a previously persisted snapshot.
    pub(crate) fn restore(&self, snapshot: RegistrySnapshot) {
        let (start_date, requests, errors) = snapshot.into_parts();

        let mut map = self.inner.requests.write();
        *map = requests
            .into_iter()
            .map(|(id, stat)| (id, Arc::new(Mutex::new(stat))))
            .collect();

        *self.inner.errors.lock() = errors;
        *self.inner.start_date.lock() = start_date;
    }

    /// Folds a completed execution into the statistics of a request.
    pub(crate) fn fold(&self, id: String, name: &str, execution: &CompletedExecution) {
        let existing = self.inner.requests.read().get(&id).map(Arc::clone);

        let entry = match existing {
            Some(entry) => entry,
            None => self.insert_request(id, name),
        };

        entry.lock().add_execution(execution);
    }

    fn insert_request(&self, id: String, name: &str) -> Arc<Mutex<RequestStat>> {
        let mut requests = self.inner.requests.write();

        // Another thread may have inserted it between our read and write locks.
        if let Some(existing) = requests.get(&id) {
            return Arc::clone(existing);
        }

        let entry = Arc::new(Mutex::new(RequestStat::new(&self.inner.name, name)));
        requests.insert(id.clone(), Arc::clone(&entry));

        if requests.len() > self.inner.max_requests_count {
            // The newcomer has no hits yet, so it would always be the first victim.
            let victims = select_eviction_victims(
                requests
                    .iter()
                    .filter(|(candidate, _)| **candidate != id)
                    .map(|(candidate, stat)| (candidate.as_str(), stat.lock().hits())),
                requests.len(),
                eviction_target(self.inner.max_requests_count),
                self.inner.eviction_hits_threshold,
            );

            for victim in &victims {
                requests.remove(victim);
            }

            trace!(
                registry = %self.inner.name,
                evicted = victims.len(),
                "request count over ceiling, evicted requests"
            );
        }

        entry
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Relaxed)
    }

    pub(crate) fn platform(&self) -> &PlatformFacade {
        &self.inner.platform
    }

    pub(crate) fn register_root_context(&self, key: u64, context: Arc<ExecutionContext>) {
        self.inner.root_contexts.insert(key, context);
    }

    pub(crate) fn unregister_root_context(&self, key: u64) {
        self.inner.root_contexts.remove(&key);
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether executions of `child` that happen inside executions of this registry are
    /// attributed to the enclosing request.
    pub(crate) fn attributes_children_of(&self, child: &Self) -> bool {
        self.ptr_eq(child) || self.child_registry_name() == Some(child.name())
    }
}

/// How many requests an overflowing registry keeps: 90% of its ceiling. The victim scan holds
/// the registry-wide write lock, so it runs at most once per tenth of the ceiling of new requests.
fn eviction_target(max_requests_count: usize) -> usize {
    max_requests_count.saturating_sub(max_requests_count / 10)
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.inner.name)
            .field("error_registry", &self.inner.error_registry)
            .field("job_registry", &self.inner.job_registry)
            .field("child_registry_name", &self.inner.child_registry_name)
            .field("displayed", &self.is_displayed())
            .field("max_requests_count", &self.inner.max_requests_count)
            .field("request_count", &self.request_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Registry: Send, Sync, Clone, fmt::Debug);

    fn millis(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn record_accumulates_per_name() {
        let registry = Registry::builder().name("sql").build();

        registry.record("select 1", millis(5), &Outcome::success());
        registry.record("select 1", millis(15), &Outcome::system_error());
        registry.record(
            "select 2",
            millis(1),
            &Outcome::success().with_response_size(10).with_cpu_time(millis(1)),
        );

        assert_eq!(registry.request_count(), 2);

        let first = registry.request_by_name("select 1").unwrap();
        assert_eq!(first.hits(), 2);
        assert_eq!(first.system_errors(), 1);
        assert_eq!(first.maximum(), 15);

        let second = registry.request_by_name("select 2").unwrap();
        assert_eq!(second.response_size_sum(), 10);
        assert_eq!(second.cpu_time_sum(), 1);
        assert!(registry.is_request_id_from_this_registry(second.id()));
        assert!(!registry.is_request_id_from_this_registry("sql"));
        assert!(!registry.is_request_id_from_this_registry(&second.id().replace("sql", "sqlx")));
    }

    #[test]
    fn clear_empties_and_bumps_generation() {
        let registry = Registry::builder().name("http").build();
        registry.record("/", millis(1), &Outcome::success());
        let generation = registry.generation();

        registry.clear();

        assert_eq!(registry.request_count(), 0);
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.generation(), generation + 1);
    }

    #[test]
    fn system_errors_keep_records() {
        let registry = Registry::builder().name("error").error_registry().build();

        registry.record_system_error(ErrorRecord::new(Utc::now(), "out of disk"), millis(0));
        registry.record_system_error(ErrorRecord::new(Utc::now(), "out of disk"), millis(0));

        assert_eq!(registry.errors().len(), 2);
        let request = registry.request_by_name("out of disk").unwrap();
        assert_eq!(request.hits(), 2);
        assert_eq!(request.system_errors(), 2);
    }

    #[test]
    fn overflow_evicts_rarely_hit_requests_first() {
        let registry = Registry::builder()
            .name("sql")
            .max_requests_count(3)
            .eviction_hits_threshold(2)
            .build();

        for _ in 0..5 {
            registry.record("hot", millis(1), &Outcome::success());
        }
        registry.record("cold1", millis(1), &Outcome::success());
        registry.record("cold2", millis(1), &Outcome::success());
        registry.record("newcomer", millis(1), &Outcome::success());

        assert_eq!(registry.request_count(), 3);
        assert!(registry.request_by_name("hot").is_some());
        assert!(registry.request_by_name("newcomer").is_some());
    }

    #[test]
    fn overflow_trims_below_ceiling() {
        let registry = Registry::builder()
            .name("sql")
            .max_requests_count(100)
            .eviction_hits_threshold(10)
            .build();

        for literal in 0..=100 {
            registry.record(&format!("select {literal}"), millis(1), &Outcome::success());
        }

        assert_eq!(registry.request_count(), 90);

        let survivors = registry.snapshot();

        // Room was left for new requests, so these evict nothing.
        for literal in 101..111 {
            registry.record(&format!("select {literal}"), millis(1), &Outcome::success());
        }

        assert_eq!(registry.request_count(), 100);
        assert!(
            survivors
                .requests()
                .all(|request| registry.request_by_id(request.id()).is_some())
        );
    }

    #[test]
    fn eviction_target_leaves_headroom() {
        assert_eq!(eviction_target(10_000), 9_000);
        assert_eq!(eviction_target(100), 90);
        assert_eq!(eviction_target(3), 3);
        assert_eq!(eviction_target(1), 1);
    }

    #[test]
    fn clear_advances_generation_with_snapshot() {
        let registry = Registry::builder().name("http").build();
        registry.record("/a", millis(1), &Outcome::success());

        let (before, first) = registry.snapshot_with_generation();
        registry.clear();
        let (after, second) = registry.snapshot_with_generation();

        assert_eq!(before.request_count(), 1);
        assert!(after.is_empty());
        assert_eq!(second, first + 1);
        assert_eq!(registry.generation(), second);
    }

    #[test]
    fn restore_replaces_contents() {
        let source = Registry::builder().name("http").build();
        source.record("/a", millis(7), &Outcome::success());
        let snapshot = source.snapshot();

        let target = Registry::builder().name("http").build();
        target.record("/b", millis(1), &Outcome::success());
        target.restore(snapshot.clone());

        assert_eq!(target.snapshot(), snapshot);
    }

    #[test]
    fn child_attribution_rule() {
        let http = Registry::builder().name("http").child_registry("sql").build();
        let sql = Registry::builder().name("sql").build();
        let job = Registry::builder().name("job").build();

        assert!(http.attributes_children_of(&sql));
        assert!(http.attributes_children_of(&http));
        assert!(!http.attributes_children_of(&job));
        assert!(!sql.attributes_children_of(&http));
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let registry = Registry::builder().name("http").build();

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        registry.record("/", millis(1), &Outcome::success());
                    }
                });
            }
        });

        assert_eq!(registry.request_by_name("/").unwrap().hits(), 4000);
    }
}
