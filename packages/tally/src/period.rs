use std::fmt::{self, Display};

use chrono::{DateTime, Datelike, Days, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use tracing::warn;

use crate::{CounterStore, Error, Registry, RegistrySnapshot, Result, SnapshotKey};

/// A calendar period relative to the current local day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Period {
    /// The current day.
    Day,

    /// The current ISO week, from Monday to the current day.
    Week,

    /// The current month, from its first day to the current day.
    Month,

    /// The current year, from January 1 to the current day.
    Year,

    /// Everything since the registry was created or last cleared.
    All,
}

/// A time window to aggregate registry data over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Range {
    /// A calendar period relative to the current day.
    Period(Period),

    /// An arbitrary inclusive range of days. Create with [`Range::custom()`].
    #[non_exhaustive]
    Custom {
        /// First day of the range.
        start: NaiveDate,

        /// Last day of the range.
        end: NaiveDate,
    },
}

impl Range {
    /// An inclusive range of days.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRange`] if `end` is before `start`.
    pub fn custom(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidRange { start, end });
        }

        Ok(Self::Custom { start, end })
    }

    /// The first and last day the range covers, or `None` for [`Period::All`].
    #[must_use]
    pub fn days(&self, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
        match *self {
            Self::Period(Period::Day) => Some((today, today)),
            Self::Period(Period::Week) => Some((
                today
                    .checked_sub_days(Days::new(u64::from(
                        today.weekday().num_days_from_monday(),
                    )))
                    .unwrap_or(today),
                today,
            )),
            Self::Period(Period::Month) => Some((today.with_day(1).unwrap_or(today), today)),
            Self::Period(Period::Year) => Some((today.with_ordinal(1).unwrap_or(today), today)),
            Self::Period(Period::All) => None,
            Self::Custom { start, end } => Some((start, end)),
        }
    }
}

impl From<Period> for Range {
    fn from(period: Period) -> Self {
        Self::Period(period)
    }
}

impl Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Period(Period::Day) => f.write_str("day"),
            Self::Period(Period::Week) => f.write_str("week"),
            Self::Period(Period::Month) => f.write_str("month"),
            Self::Period(Period::Year) => f.write_str("year"),
            Self::Period(Period::All) => f.write_str("all"),
            Self::Custom { start, end } => write!(f, "{start}..={end}"),
        }
    }
}

/// Registry data aggregated over a [`Range`].
///
/// Days whose snapshot is missing or unreadable contribute nothing. Their number is reported
/// so that a renderer can flag the data as partial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeriodView {
    range: Range,
    snapshot: RegistrySnapshot,
    missing_days: u32,
    unreadable_days: u32,
}

impl PeriodView {
    /// The range the data was aggregated over.
    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    /// The aggregated data.
    #[must_use]
    pub fn snapshot(&self) -> &RegistrySnapshot {
        &self.snapshot
    }

    /// Consumes the view, returning the aggregated data.
    #[must_use]
    pub fn into_snapshot(self) -> RegistrySnapshot {
        self.snapshot
    }

    /// Days in the range for which no snapshot was ever written.
    ///
    /// Usually these are days the application did not run.
    #[must_use]
    pub fn missing_days(&self) -> u32 {
        self.missing_days
    }

    /// Days in the range whose snapshot exists but could not be read.
    #[must_use]
    pub fn unreadable_days(&self) -> u32 {
        self.unreadable_days
    }

    /// Whether every day of the range contributed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing_days == 0 && self.unreadable_days == 0
    }
}

/// Builds [`PeriodView`]s of a registry from persisted day snapshots.
#[derive(Debug)]
pub struct PeriodAggregator<'a> {
    store: &'a dyn CounterStore,
}

impl<'a> PeriodAggregator<'a> {
    /// Creates an aggregator reading day snapshots from the given store.
    #[must_use]
    pub fn new(store: &'a dyn CounterStore) -> Self {
        Self { store }
    }

    /// Aggregates a registry over a range.
    ///
    /// * The current day comes from `today_aggregate`, the in-memory aggregate that the
    ///   collector keeps for `today`.
    /// * Other days come from the store. Days after `today` are ignored.
    /// * [`Period::All`] is the live registry itself.
    #[must_use]
    pub fn view(
        &self,
        registry: &Registry,
        today: NaiveDate,
        today_aggregate: &RegistrySnapshot,
        range: Range,
    ) -> PeriodView {
        let Some((start, end)) = range.days(today) else {
            return PeriodView {
                range,
                snapshot: registry.snapshot(),
                missing_days: 0,
                unreadable_days: 0,
            };
        };

        let mut snapshot = RegistrySnapshot::empty_like(registry, start_of_day(start));
        let mut missing_days: u32 = 0;
        let mut unreadable_days: u32 = 0;

        for date in start.iter_days().take_while(|date| *date <= end.min(today)) {
            if date == today {
                snapshot.merge(today_aggregate);
                continue;
            }

            match self.store.read(&SnapshotKey::day(registry.name(), date)) {
                Ok(Some(day)) => snapshot.merge(&day),
                Ok(None) => missing_days = missing_days.saturating_add(1),
                Err(error) => {
                    warn!(
                        registry = registry.name(),
                        %date,
                        %error,
                        "day snapshot unreadable, skipping it"
                    );
                    unreadable_days = unreadable_days.saturating_add(1);
                }
            }
        }

        // Merging keeps the earliest start date, which may predate the range.
        snapshot.set_start_date(start_of_day(start));

        PeriodView {
            range,
            snapshot,
            missing_days,
            unreadable_days,
        }
    }
}

/// The instant a local calendar day begins.
pub(crate) fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);

    // Where midnight does not exist because of a daylight saving jump, treat it as UTC.
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map_or_else(|| midnight.and_utc(), |local| local.to_utc())
}
