use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error_record::push_bounded;
use crate::{ErrorRecord, Registry, RequestStat, request_id};

/// A point-in-time copy of the contents of a [`Registry`], or a registry-shaped aggregate
/// derived from such copies (a day, a week, a custom date range).
///
/// Snapshots are plain data: they are what gets persisted, what period views are made of and
/// what report renderers read. Every request in a snapshot was copied atomically, so no entry
/// is ever observed half-updated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    name: String,

    #[serde(default)]
    error_registry: bool,

    #[serde(default)]
    job_registry: bool,

    #[serde(default)]
    child_registry_name: Option<String>,

    /// When accumulation of the data in this snapshot started.
    start_date: DateTime<Utc>,

    requests: BTreeMap<String, RequestStat>,

    #[serde(default)]
    errors: Vec<ErrorRecord>,
}

impl RegistrySnapshot {
    /// Creates an empty snapshot with the same identity and flags as the given registry.
    pub(crate) fn empty_like(registry: &Registry, start_date: DateTime<Utc>) -> Self {
        Self {
            name: registry.name().to_owned(),
            error_registry: registry.is_error_registry(),
            job_registry: registry.is_job_registry(),
            child_registry_name: registry.child_registry_name().map(str::to_owned),
            start_date,
            requests: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        registry: &Registry,
        start_date: DateTime<Utc>,
        requests: impl IntoIterator<Item = RequestStat>,
        errors: Vec<ErrorRecord>,
    ) -> Self {
        Self {
            requests: requests
                .into_iter()
                .map(|request| (request.id().to_owned(), request))
                .collect(),
            errors,
            ..Self::empty_like(registry, start_date)
        }
    }

    /// Name of the registry this snapshot was taken from.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the snapshot comes from an error registry.
    #[must_use]
    pub fn is_error_registry(&self) -> bool {
        self.error_registry
    }

    /// Whether the snapshot comes from a job registry.
    #[must_use]
    pub fn is_job_registry(&self) -> bool {
        self.job_registry
    }

    /// Name of the child registry of the registry this snapshot was taken from, if any.
    #[must_use]
    pub fn child_registry_name(&self) -> Option<&str> {
        self.child_registry_name.as_deref()
    }

    /// When accumulation of the data in this snapshot started.
    #[must_use]
    pub fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    /// Number of distinct requests in the snapshot.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Whether the snapshot contains neither requests nor errors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.errors.is_empty()
    }

    /// All requests, in identifier order.
    pub fn requests(&self) -> impl Iterator<Item = &RequestStat> {
        self.requests.values()
    }

    /// All requests, the ones with the largest total duration first.
    #[must_use]
    pub fn requests_by_durations_sum(&self) -> Vec<&RequestStat> {
        let mut requests: Vec<_> = self.requests.values().collect();
        requests.sort_by(|a, b| b.durations_sum().cmp(&a.durations_sum()));
        requests
    }

    /// Looks up a request by its identifier.
    #[must_use]
    pub fn request_by_id(&self, id: &str) -> Option<&RequestStat> {
        self.requests.get(id)
    }

    /// Looks up a request by its name.
    #[must_use]
    pub fn request_by_name(&self, name: &str) -> Option<&RequestStat> {
        self.requests.get(&request_id(&self.name, name))
    }

    /// The sum of all requests, as one synthetic request named `<registry> global`.
    #[must_use]
    pub fn global_request(&self) -> RequestStat {
        let mut global = RequestStat::new(&self.name, format!("{} global", self.name));

        for request in self.requests.values() {
            global.add_hits(request);
        }

        global
    }

    /// Total number of hits across all requests.
    #[must_use]
    pub fn total_hits(&self) -> u64 {
        self.requests
            .values()
            .fold(0_u64, |total, request| total.saturating_add(request.hits()))
    }

    /// The most recent errors, oldest first. Only error registries have any.
    #[must_use]
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    /// Merges one request into the snapshot, adding it if it is not yet present.
    pub(crate) fn add_request(&mut self, request: &RequestStat) {
        match self.requests.get_mut(request.id()) {
            Some(existing) => existing.add_hits(request),
            None => {
                self.requests
                    .insert(request.id().to_owned(), request.clone());
            }
        }
    }

    /// Appends errors, keeping only the most recent ones.
    pub(crate) fn add_errors(&mut self, errors: impl IntoIterator<Item = ErrorRecord>) {
        push_bounded(&mut self.errors, errors);
    }

    /// Merges everything in another snapshot of the same registry into this one.
    pub(crate) fn merge(&mut self, other: &Self) {
        for request in other.requests.values() {
            self.add_request(request);
        }

        self.add_errors(other.errors.iter().cloned());
        self.start_date = self.start_date.min(other.start_date);
    }

    pub(crate) fn remove_request(&mut self, id: &str) -> Option<RequestStat> {
        self.requests.remove(id)
    }

    pub(crate) fn set_start_date(&mut self, start_date: DateTime<Utc>) {
        self.start_date = start_date;
    }

    /// Evicts requests until at most `max_requests_count` remain, low-hit requests first.
    ///
    /// Returns the identifiers of the evicted requests.
    pub(crate) fn evict_overflow(
        &mut self,
        max_requests_count: usize,
        eviction_hits_threshold: u64,
    ) -> Vec<String> {
        let victims = select_eviction_victims(
            self.requests
                .values()
                .map(|request| (request.id(), request.hits())),
            self.requests.len(),
            max_requests_count,
            eviction_hits_threshold,
        );

        for id in &victims {
            self.requests.remove(id);
        }

        victims
    }

    pub(crate) fn into_parts(
        self,
    ) -> (DateTime<Utc>, BTreeMap<String, RequestStat>, Vec<ErrorRecord>) {
        (self.start_date, self.requests, self.errors)
    }
}

/// Picks just enough requests to evict to bring `len` down to `target_len`.
///
/// Requests with fewer than `eviction_hits_threshold` hits are picked first. The order among
/// equally eligible requests is unspecified.
pub(crate) fn select_eviction_victims<'a>(
    entries: impl Iterator<Item = (&'a str, u64)>,
    len: usize,
    target_len: usize,
    eviction_hits_threshold: u64,
) -> Vec<String> {
    let excess = len.saturating_sub(target_len);

    if excess == 0 {
        return Vec::new();
    }

    let (rarely_hit, frequently_hit): (Vec<_>, Vec<_>) =
        entries.partition(|(_, hits)| *hits < eviction_hits_threshold);

    rarely_hit
        .into_iter()
        .chain(frequently_hit)
        .take(excess)
        .map(|(id, _)| id.to_owned())
        .collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::Outcome;

    fn registry_with_hits(hits: &[(&str, u64)]) -> Registry {
        let registry = Registry::builder().name("http").build();

        for (name, count) in hits {
            for _ in 0..*count {
                registry.record(name, Duration::from_millis(10), &Outcome::success());
            }
        }

        registry
    }

    #[test]
    fn lookups() {
        let snapshot = registry_with_hits(&[("/a", 2), ("/b", 1)]).snapshot();

        assert_eq!(snapshot.request_count(), 2);
        assert_eq!(snapshot.total_hits(), 3);
        assert_eq!(snapshot.request_by_name("/a").unwrap().hits(), 2);
        assert!(snapshot.request_by_name("/missing").is_none());

        let id = snapshot.request_by_name("/b").unwrap().id().to_owned();
        assert_eq!(snapshot.request_by_id(&id).unwrap().name(), "/b");
    }

    #[test]
    fn global_request_sums_everything() {
        let snapshot = registry_with_hits(&[("/a", 2), ("/b", 3)]).snapshot();

        let global = snapshot.global_request();

        assert_eq!(global.name(), "http global");
        assert_eq!(global.hits(), 5);
        assert_eq!(global.durations_sum(), 50);
    }

    #[test]
    fn ordered_by_durations_sum() {
        let snapshot = registry_with_hits(&[("/a", 1), ("/b", 3), ("/c", 2)]).snapshot();

        let names: Vec<_> = snapshot
            .requests_by_durations_sum()
            .into_iter()
            .map(RequestStat::name)
            .collect();

        assert_eq!(names, vec!["/b", "/c", "/a"]);
    }

    #[test]
    fn merge_sums_matching_requests() {
        let mut first = registry_with_hits(&[("/a", 2)]).snapshot();
        let second = registry_with_hits(&[("/a", 1), ("/b", 4)]).snapshot();

        first.merge(&second);

        assert_eq!(first.request_by_name("/a").unwrap().hits(), 3);
        assert_eq!(first.request_by_name("/b").unwrap().hits(), 4);
    }

    #[test]
    fn eviction_prefers_rarely_hit() {
        let mut snapshot =
            registry_with_hits(&[("/hot1", 20), ("/cold", 1), ("/hot2", 15)]).snapshot();

        let evicted = snapshot.evict_overflow(2, 10);

        assert_eq!(evicted.len(), 1);
        assert_eq!(snapshot.request_count(), 2);
        assert!(snapshot.request_by_name("/cold").is_none());
    }

    #[test]
    fn eviction_falls_back_to_any_request() {
        let mut snapshot = registry_with_hits(&[("/a", 20), ("/b", 20), ("/c", 20)]).snapshot();

        let evicted = snapshot.evict_overflow(1, 10);

        assert_eq!(evicted.len(), 2);
        assert_eq!(snapshot.request_count(), 1);
    }

    #[test]
    fn serde_preserves_snapshot() {
        let registry = Registry::builder().name("err").error_registry().build();
        registry.record_system_error(
            ErrorRecord::new(Utc::now(), "boom").with_stack_trace("at main"),
            Duration::from_millis(3),
        );
        let snapshot = registry.snapshot();

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: RegistrySnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, snapshot);
        assert_eq!(restored.errors().len(), 1);
        assert!(restored.is_error_registry());
    }
}
