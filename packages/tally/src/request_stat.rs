use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Millis, NO_DATA, NO_DATA_F64, fleet_add, request_id};

/// Aggregated statistics of one distinct request signature within a [`Registry`][1].
///
/// A request signature is identified by its name (an HTTP path with method, a SQL statement,
/// a job name and so on). Every completed execution of the request folds its timing into the
/// sums kept here, from which the derived values (mean, standard deviation, error percentage)
/// are computed on demand.
///
/// Values of this type returned by the crate are independent copies; mutating the live
/// statistics is only possible through the owning registry.
///
/// [1]: crate::Registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStat {
    id: String,
    name: String,

    hits: u64,
    durations_sum: Millis,
    durations_square_sum: i64,
    maximum: Millis,

    // NO_DATA if processor time was never measured for this request.
    cpu_time_sum: Millis,

    system_errors: u64,

    // NO_DATA if response sizes were never measured for this request.
    response_size_sum: i64,

    child_hits: u64,
    child_durations_sum: Millis,

    #[serde(default)]
    child_executions_by_id: BTreeMap<String, u64>,
}

/// Everything known about one completed execution, as folded into a [`RequestStat`].
#[derive(Debug, Default)]
pub(crate) struct CompletedExecution {
    pub(crate) duration: Millis,
    pub(crate) cpu_time: Option<Millis>,
    pub(crate) system_error: bool,
    pub(crate) response_size: Option<i64>,
    pub(crate) child_hits: u64,
    pub(crate) child_durations_sum: Millis,
    pub(crate) child_executions_by_id: BTreeMap<String, u64>,
}

impl RequestStat {
    /// Creates empty statistics for the request with the given name in the named registry.
    ///
    /// The identifier is derived from both names, so the same request name in two different
    /// registries yields two different identifiers.
    #[must_use]
    pub fn new(registry_name: &str, name: impl Into<String>) -> Self {
        let name = name.into();

        Self {
            id: request_id(registry_name, &name),
            name,
            hits: 0,
            durations_sum: 0,
            durations_square_sum: 0,
            maximum: 0,
            cpu_time_sum: NO_DATA,
            system_errors: 0,
            response_size_sum: NO_DATA,
            child_hits: 0,
            child_durations_sum: 0,
            child_executions_by_id: BTreeMap::new(),
        }
    }

    /// The stable identifier of the request, unique within its registry.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The human-readable name of the request.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of completed executions.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Sum of the durations of all completed executions.
    #[must_use]
    pub fn durations_sum(&self) -> Millis {
        self.durations_sum
    }

    /// Sum of the squared durations of all completed executions, in square milliseconds.
    #[must_use]
    pub fn durations_square_sum(&self) -> i64 {
        self.durations_square_sum
    }

    /// Longest observed duration.
    ///
    /// After a previous period has been subtracted (see the collector), the exact maximum of
    /// the remaining executions cannot be known. The mean of the period is used instead.
    #[must_use]
    pub fn maximum(&self) -> Millis {
        self.maximum
    }

    /// Sum of the processor time of all completed executions, or [`NO_DATA`] if not measured.
    #[must_use]
    pub fn cpu_time_sum(&self) -> Millis {
        self.cpu_time_sum
    }

    /// Number of executions that ended with a system error.
    #[must_use]
    pub fn system_errors(&self) -> u64 {
        self.system_errors
    }

    /// Sum of response sizes in bytes, or [`NO_DATA`] if not measured.
    #[must_use]
    pub fn response_size_sum(&self) -> i64 {
        self.response_size_sum
    }

    /// Number of nested child executions performed by executions of this request.
    #[must_use]
    pub fn child_hits(&self) -> u64 {
        self.child_hits
    }

    /// Total duration of nested child executions performed by executions of this request.
    #[must_use]
    pub fn child_durations_sum(&self) -> Millis {
        self.child_durations_sum
    }

    /// How many times each child request (by identifier) was executed inside this request.
    pub fn child_executions(&self) -> impl Iterator<Item = (&str, u64)> {
        self.child_executions_by_id
            .iter()
            .map(|(id, count)| (id.as_str(), *count))
    }

    /// Mean duration, or [`NO_DATA`] if there are no hits.
    #[must_use]
    pub fn mean(&self) -> Millis {
        self.per_hit(self.durations_sum)
    }

    /// Standard deviation of durations, or [`NO_DATA`] if there are no hits.
    #[must_use]
    pub fn standard_deviation(&self) -> Millis {
        if self.hits == 0 {
            return NO_DATA;
        }

        #[expect(
            clippy::cast_precision_loss,
            reason = "statistics for display - exact precision not required"
        )]
        let (hits, sum, square_sum) = (
            self.hits as f64,
            self.durations_sum as f64,
            self.durations_square_sum as f64,
        );

        let mean = sum / hits;
        // Rounding can make the variance slightly negative when all durations are equal.
        let variance = (square_sum / hits - mean * mean).max(0.0);

        #[expect(
            clippy::cast_possible_truncation,
            reason = "square root of a non-negative value bounded by i64 inputs"
        )]
        let deviation = variance.sqrt() as Millis;

        deviation
    }

    /// Percentage (0-100) of executions that ended with a system error,
    /// or [`NO_DATA_F64`] if there are no hits.
    #[must_use]
    pub fn system_error_percentage(&self) -> f64 {
        if self.hits == 0 {
            return NO_DATA_F64;
        }

        #[expect(
            clippy::cast_precision_loss,
            reason = "percentage for display - exact precision not required"
        )]
        let percentage = 100.0 * self.system_errors as f64 / self.hits as f64;

        percentage.min(100.0)
    }

    /// Mean processor time, or [`NO_DATA`] if there are no hits or it was not measured.
    #[must_use]
    pub fn cpu_time_mean(&self) -> Millis {
        if self.cpu_time_sum < 0 {
            return NO_DATA;
        }

        self.per_hit(self.cpu_time_sum)
    }

    /// Mean response size in bytes, or [`NO_DATA`] if there are no hits or it was not measured.
    #[must_use]
    pub fn response_size_mean(&self) -> i64 {
        if self.response_size_sum < 0 {
            return NO_DATA;
        }

        self.per_hit(self.response_size_sum)
    }

    /// Mean number of child executions per execution, or [`NO_DATA_F64`] if there are no hits.
    #[must_use]
    pub fn child_hits_mean(&self) -> f64 {
        if self.hits == 0 {
            return NO_DATA_F64;
        }

        #[expect(
            clippy::cast_precision_loss,
            reason = "ratio for display - exact precision not required"
        )]
        let mean = self.child_hits as f64 / self.hits as f64;

        mean
    }

    /// Mean total duration of child executions per execution,
    /// or [`NO_DATA`] if there are no hits.
    #[must_use]
    pub fn child_durations_mean(&self) -> Millis {
        self.per_hit(self.child_durations_sum)
    }

    fn per_hit(&self, sum: i64) -> i64 {
        i64::try_from(self.hits)
            .ok()
            .and_then(|hits| sum.checked_div(hits))
            .unwrap_or(NO_DATA)
    }

    /// Folds one completed execution into the statistics.
    pub(crate) fn add_execution(&mut self, execution: &CompletedExecution) {
        let duration = execution.duration.max(0);

        self.hits = self.hits.saturating_add(1);
        self.durations_sum = self.durations_sum.saturating_add(duration);
        self.durations_square_sum = self
            .durations_square_sum
            .saturating_add(duration.saturating_mul(duration));
        self.maximum = self.maximum.max(duration);

        if let Some(cpu_time) = execution.cpu_time {
            self.cpu_time_sum = fleet_add(self.cpu_time_sum, cpu_time.max(0));
        }

        if execution.system_error {
            self.system_errors = self.system_errors.saturating_add(1);
        }

        if let Some(response_size) = execution.response_size {
            self.response_size_sum = fleet_add(self.response_size_sum, response_size.max(0));
        }

        self.child_hits = self.child_hits.saturating_add(execution.child_hits);
        self.child_durations_sum = self
            .child_durations_sum
            .saturating_add(execution.child_durations_sum);

        for (child_id, count) in &execution.child_executions_by_id {
            let entry = self
                .child_executions_by_id
                .entry(child_id.clone())
                .or_insert(0);
            *entry = entry.saturating_add(*count);
        }
    }

    /// Merges statistics from another source into this one.
    ///
    /// Normally both describe the same request. Registry-wide totals are built by merging
    /// every request of a registry into one synthetic request.
    pub(crate) fn add_hits(&mut self, other: &Self) {
        self.hits = self.hits.saturating_add(other.hits);
        self.durations_sum = self.durations_sum.saturating_add(other.durations_sum);
        self.durations_square_sum = self
            .durations_square_sum
            .saturating_add(other.durations_square_sum);
        self.maximum = self.maximum.max(other.maximum);
        self.cpu_time_sum = fleet_add(self.cpu_time_sum, other.cpu_time_sum);
        self.system_errors = self.system_errors.saturating_add(other.system_errors);
        self.response_size_sum = fleet_add(self.response_size_sum, other.response_size_sum);
        self.child_hits = self.child_hits.saturating_add(other.child_hits);
        self.child_durations_sum = self
            .child_durations_sum
            .saturating_add(other.child_durations_sum);

        for (child_id, count) in &other.child_executions_by_id {
            let entry = self
                .child_executions_by_id
                .entry(child_id.clone())
                .or_insert(0);
            *entry = entry.saturating_add(*count);
        }
    }

    /// Subtracts an earlier cumulative state of the same request, leaving only what happened
    /// since that earlier state was captured.
    pub(crate) fn remove_hits(&mut self, earlier: &Self) {
        debug_assert_eq!(self.id, earlier.id, "subtracting statistics of different requests");

        self.hits = self.hits.saturating_sub(earlier.hits);
        self.durations_sum = self.durations_sum.saturating_sub(earlier.durations_sum).max(0);
        self.durations_square_sum = self
            .durations_square_sum
            .saturating_sub(earlier.durations_square_sum)
            .max(0);

        if self.cpu_time_sum >= 0 && earlier.cpu_time_sum >= 0 {
            self.cpu_time_sum = self.cpu_time_sum.saturating_sub(earlier.cpu_time_sum).max(0);
        }

        self.system_errors = self.system_errors.saturating_sub(earlier.system_errors);

        if self.response_size_sum >= 0 && earlier.response_size_sum >= 0 {
            self.response_size_sum = self
                .response_size_sum
                .saturating_sub(earlier.response_size_sum)
                .max(0);
        }

        self.child_hits = self.child_hits.saturating_sub(earlier.child_hits);
        self.child_durations_sum = self
            .child_durations_sum
            .saturating_sub(earlier.child_durations_sum)
            .max(0);

        for (child_id, count) in &earlier.child_executions_by_id {
            if let Some(entry) = self.child_executions_by_id.get_mut(child_id) {
                *entry = entry.saturating_sub(*count);

                if *entry == 0 {
                    self.child_executions_by_id.remove(child_id);
                }
            }
        }

        // The maximum of the remaining executions is unknowable if the earlier
        // maximum could have been the current one. Fall back to the mean.
        if earlier.maximum >= self.maximum {
            self.maximum = self.mean();
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::float_cmp, reason = "exact values are representable")]

    use super::*;

    fn execution(duration: Millis) -> CompletedExecution {
        CompletedExecution {
            duration,
            ..Default::default()
        }
    }

    #[test]
    fn empty_stat_reports_no_data() {
        let stat = RequestStat::new("http", "/index");

        assert_eq!(stat.hits(), 0);
        assert_eq!(stat.mean(), NO_DATA);
        assert_eq!(stat.standard_deviation(), NO_DATA);
        assert_eq!(stat.system_error_percentage(), NO_DATA_F64);
        assert_eq!(stat.cpu_time_mean(), NO_DATA);
        assert_eq!(stat.response_size_mean(), NO_DATA);
        assert_eq!(stat.child_hits_mean(), NO_DATA_F64);
    }

    #[test]
    fn executions_accumulate() {
        let mut stat = RequestStat::new("http", "/index");

        stat.add_execution(&execution(100));
        stat.add_execution(&CompletedExecution {
            duration: 300,
            system_error: true,
            cpu_time: Some(40),
            response_size: Some(1024),
            ..Default::default()
        });

        assert_eq!(stat.hits(), 2);
        assert_eq!(stat.durations_sum(), 400);
        assert_eq!(stat.durations_square_sum(), 100_000);
        assert_eq!(stat.maximum(), 300);
        assert_eq!(stat.mean(), 200);
        assert_eq!(stat.standard_deviation(), 100);
        assert_eq!(stat.system_errors(), 1);
        assert_eq!(stat.system_error_percentage(), 50.0);
        assert_eq!(stat.cpu_time_sum(), 40);
        assert_eq!(stat.cpu_time_mean(), 20);
        assert_eq!(stat.response_size_sum(), 1024);
    }

    #[test]
    fn equal_durations_have_zero_deviation() {
        let mut stat = RequestStat::new("sql", "select 1");

        for _ in 0..7 {
            stat.add_execution(&execution(33));
        }

        assert_eq!(stat.standard_deviation(), 0);
    }

    #[test]
    fn child_executions_are_recorded() {
        let mut stat = RequestStat::new("http", "/orders");

        let mut children = BTreeMap::new();
        children.insert("sqlabc".to_string(), 2);

        stat.add_execution(&CompletedExecution {
            duration: 50,
            child_hits: 2,
            child_durations_sum: 30,
            child_executions_by_id: children,
            ..Default::default()
        });

        assert_eq!(stat.child_hits(), 2);
        assert_eq!(stat.child_durations_sum(), 30);
        assert_eq!(stat.child_hits_mean(), 2.0);
        assert_eq!(stat.child_durations_mean(), 30);
        assert_eq!(stat.child_executions().collect::<Vec<_>>(), vec![("sqlabc", 2)]);
    }

    #[test]
    fn add_hits_merges_everything() {
        let mut a = RequestStat::new("http", "/x");
        a.add_execution(&execution(10));

        let mut b = RequestStat::new("http", "/x");
        b.add_execution(&CompletedExecution {
            duration: 90,
            cpu_time: Some(5),
            ..Default::default()
        });

        a.add_hits(&b);

        assert_eq!(a.hits(), 2);
        assert_eq!(a.durations_sum(), 100);
        assert_eq!(a.maximum(), 90);
        // Availability wins when only one side measured processor time.
        assert_eq!(a.cpu_time_sum(), 5);
    }

    #[test]
    fn remove_hits_yields_period_delta() {
        let mut earlier = RequestStat::new("http", "/x");
        earlier.add_execution(&execution(500));
        earlier.add_execution(&execution(100));

        let mut current = earlier.clone();
        current.add_execution(&execution(20));
        current.add_execution(&execution(40));

        let mut delta = current.clone();
        delta.remove_hits(&earlier);

        assert_eq!(delta.hits(), 2);
        assert_eq!(delta.durations_sum(), 60);
        assert_eq!(delta.durations_square_sum(), 400 + 1600);
        assert_eq!(delta.mean(), 30);
        // The earlier maximum (500) dominates, so the mean stands in for the unknown maximum.
        assert_eq!(delta.maximum(), 30);
    }

    #[test]
    fn remove_hits_keeps_maximum_when_it_grew() {
        let mut earlier = RequestStat::new("http", "/x");
        earlier.add_execution(&execution(10));

        let mut current = earlier.clone();
        current.add_execution(&execution(70));

        let mut delta = current;
        delta.remove_hits(&earlier);

        assert_eq!(delta.maximum(), 70);
    }

    #[test]
    fn remove_everything_leaves_no_data() {
        let mut stat = RequestStat::new("http", "/x");
        stat.add_execution(&execution(10));

        let earlier = stat.clone();
        stat.remove_hits(&earlier);

        assert_eq!(stat.hits(), 0);
        assert_eq!(stat.mean(), NO_DATA);
        assert_eq!(stat.maximum(), NO_DATA);
    }

    #[test]
    fn remove_hits_drops_exhausted_child_counts() {
        let mut children = BTreeMap::new();
        children.insert("sql1".to_string(), 1);

        let mut earlier = RequestStat::new("http", "/x");
        earlier.add_execution(&CompletedExecution {
            duration: 1,
            child_hits: 1,
            child_executions_by_id: children.clone(),
            ..Default::default()
        });

        let mut current = earlier.clone();
        current.remove_hits(&earlier);

        assert_eq!(current.child_executions().count(), 0);
    }

    #[test]
    fn serde_preserves_all_fields() {
        let mut stat = RequestStat::new("http", "/x");
        stat.add_execution(&CompletedExecution {
            duration: 12,
            cpu_time: Some(3),
            system_error: true,
            response_size: Some(99),
            child_hits: 1,
            child_durations_sum: 4,
            child_executions_by_id: BTreeMap::from([("sqlq".to_string(), 1)]),
        });

        let json = serde_json::to_string(&stat).unwrap();
        let restored: RequestStat = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, stat);
    }
}
