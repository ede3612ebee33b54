//! Fixed-step numeric time series that the collector appends one sample to per tick.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, Result};

const SERIES_EXTENSION: &str = "series";
const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// One point of a time series.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub enum Sample {
    /// A measured value.
    Value(f64),

    /// Nothing could be measured in the period, for example a mean duration in a period
    /// without hits. Distinct from a measured zero.
    NoData,
}

impl Sample {
    /// The measured value, if any.
    #[must_use]
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Value(value) => Some(value),
            Self::NoData => None,
        }
    }

    /// Converts a derived metric that uses a negative sentinel for "no data".
    #[must_use]
    pub fn from_sentinel(value: f64) -> Self {
        if value < 0.0 {
            Self::NoData
        } else {
            Self::Value(value)
        }
    }
}

/// Storage of the time series the collector appends to.
///
/// The collector creates a series before appending to it for the first time and deletes
/// the series of requests that disappear from their registry.
pub trait TimeSeriesStore: Debug + Send + Sync {
    /// Creates a series if it does not exist yet. The label describes it to humans.
    ///
    /// # Errors
    ///
    /// Fails if the series cannot be created.
    fn create_series(&self, key: &str, label: &str) -> Result<()>;

    /// Appends a sample to an existing series.
    ///
    /// # Errors
    ///
    /// Fails if the series does not exist or cannot be written.
    fn append(&self, key: &str, timestamp: DateTime<Utc>, sample: Sample) -> Result<()>;

    /// Deletes a series. Deleting a series that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// Fails if the series exists but cannot be deleted.
    fn delete_series(&self, key: &str) -> Result<()>;

    /// Deletes series that have not been appended to for longer than `older_than`.
    ///
    /// Returns the number of deleted series.
    ///
    /// # Errors
    ///
    /// Fails if the stored series cannot be enumerated.
    fn delete_obsolete_series(&self, older_than: Duration) -> Result<usize>;

    /// Total size of all stored series, in bytes.
    ///
    /// # Errors
    ///
    /// Fails if the stored series cannot be enumerated.
    fn total_bytes_on_disk(&self) -> Result<u64>;
}

impl<T: TimeSeriesStore + ?Sized> TimeSeriesStore for Arc<T> {
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn create_series(&self, key: &str, label: &str) -> Result<()> {
        (**self).create_series(key, label)
    }

    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn append(&self, key: &str, timestamp: DateTime<Utc>, sample: Sample) -> Result<()> {
        (**self).append(key, timestamp, sample)
    }

    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn delete_series(&self, key: &str) -> Result<()> {
        (**self).delete_series(key)
    }

    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn delete_obsolete_series(&self, older_than: Duration) -> Result<usize> {
        (**self).delete_obsolete_series(older_than)
    }

    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn total_bytes_on_disk(&self) -> Result<u64> {
        (**self).total_bytes_on_disk()
    }
}

#[derive(Debug)]
struct MemorySeries {
    label: String,
    samples: VecDeque<(DateTime<Utc>, Sample)>,
    last_append: SystemTime,
}

/// Keeps a bounded number of the most recent samples of every series in memory.
#[derive(Debug)]
pub struct MemoryTimeSeriesStore {
    capacity: usize,
    series: Mutex<HashMap<String, MemorySeries>>,
}

impl MemoryTimeSeriesStore {
    /// By default a day of samples at the default one-minute resolution is kept.
    pub const DEFAULT_CAPACITY: usize = 1440;

    /// Creates a store keeping up to [`Self::DEFAULT_CAPACITY`] samples per series.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates a store keeping up to `capacity` samples per series (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Keys of all series, in no particular order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.series.lock().keys().cloned().collect()
    }

    /// Whether the series exists.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.series.lock().contains_key(key)
    }

    /// The label of a series.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<String> {
        self.series.lock().get(key).map(|series| series.label.clone())
    }

    /// The retained samples of a series, oldest first. Empty if the series does not exist.
    #[must_use]
    pub fn samples(&self, key: &str) -> Vec<(DateTime<Utc>, Sample)> {
        self.series
            .lock()
            .get(key)
            .map(|series| series.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The most recent sample of a series.
    #[must_use]
    pub fn last_sample(&self, key: &str) -> Option<Sample> {
        self.series
            .lock()
            .get(key)
            .and_then(|series| series.samples.back())
            .map(|(_, sample)| *sample)
    }
}

impl Default for MemoryTimeSeriesStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSeriesStore for MemoryTimeSeriesStore {
    fn create_series(&self, key: &str, label: &str) -> Result<()> {
        self.series
            .lock()
            .entry(key.to_owned())
            .or_insert_with(|| MemorySeries {
                label: label.to_owned(),
                samples: VecDeque::new(),
                last_append: SystemTime::now(),
            });

        Ok(())
    }

    fn append(&self, key: &str, timestamp: DateTime<Utc>, sample: Sample) -> Result<()> {
        let mut all_series = self.series.lock();

        let series = all_series
            .get_mut(key)
            .ok_or_else(|| Error::TimeSeries(format!("series '{key}' does not exist")))?;

        if series.samples.len() >= self.capacity {
            series.samples.pop_front();
        }

        series.samples.push_back((timestamp, sample));
        series.last_append = SystemTime::now();

        Ok(())
    }

    fn delete_series(&self, key: &str) -> Result<()> {
        self.series.lock().remove(key);
        Ok(())
    }

    fn delete_obsolete_series(&self, older_than: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut series = self.series.lock();
        let before = series.len();

        series.retain(|_, series| {
            now.duration_since(series.last_append).unwrap_or_default() <= older_than
        });

        Ok(before.saturating_sub(series.len()))
    }

    fn total_bytes_on_disk(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Appends samples to one text file per series, one `timestamp,value` line per sample.
///
/// The first line of each file holds the label. A sample without data has an empty value.
///
/// Samples older than the retention window are dropped by compacting the file, at most once per
/// day (or once per window, if that is shorter) for each series. A series file therefore never
/// holds much more than one window of samples.
#[derive(Debug)]
pub struct FileTimeSeriesStore {
    directory: PathBuf,
    retention: Duration,

    // Unix timestamp at which each series is compacted next. Series appended to for the first
    // time by this process are compacted right away.
    next_compaction: Mutex<HashMap<String, i64>>,
}

impl FileTimeSeriesStore {
    /// Samples are kept for 90 days unless configured otherwise.
    pub const DEFAULT_RETENTION: Duration = Duration::from_secs(90 * 24 * 60 * 60);

    /// Creates a store in the given directory. The directory is created on first use.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            retention: Self::DEFAULT_RETENTION,
            next_compaction: Mutex::new(HashMap::new()),
        }
    }

    /// Sets how long samples are kept.
    #[must_use]
    pub fn with_retention(self, retention: Duration) -> Self {
        Self { retention, ..self }
    }

    /// The directory the series are stored in.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// How long samples are kept.
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn retention_secs(&self) -> i64 {
        i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX)
    }

    fn compaction_interval_secs(&self) -> i64 {
        self.retention_secs().min(SECONDS_PER_DAY)
    }

    /// Compacts the series if it is due, as of the timestamp of the sample being appended.
    fn compact_if_due(&self, key: &str, path: &Path, now: i64) -> Result<()> {
        let mut next_compaction = self.next_compaction.lock();

        let due = next_compaction.get(key).is_none_or(|next| now >= *next);

        if !due {
            return Ok(());
        }

        let dropped = compact(path, now.saturating_sub(self.retention_secs()))?;

        next_compaction.insert(
            key.to_owned(),
            now.saturating_add(self.compaction_interval_secs()),
        );

        if dropped > 0 {
            debug!(series = key, dropped, "dropped samples past retention");
        }

        Ok(())
    }

    fn path_of(&self, key: &str) -> PathBuf {
        let file_stem: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        self.directory
            .join(format!("{file_stem}.{SERIES_EXTENSION}"))
    }

    fn series_files(&self) -> Result<Vec<(PathBuf, fs::Metadata)>> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(Error::io(&self.directory, error)),
        };

        let mut files = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|error| Error::io(&self.directory, error))?;
            let path = entry.path();

            if path.extension().and_then(|extension| extension.to_str()) != Some(SERIES_EXTENSION) {
                continue;
            }

            let metadata = entry.metadata().map_err(|error| Error::io(&path, error))?;
            files.push((path, metadata));
        }

        Ok(files)
    }
}

impl TimeSeriesStore for FileTimeSeriesStore {
    fn create_series(&self, key: &str, label: &str) -> Result<()> {
        let path = self.path_of(key);

        if path.exists() {
            return Ok(());
        }

        fs::create_dir_all(&self.directory).map_err(|error| Error::io(&self.directory, error))?;

        let label = label.replace(['\r', '\n'], " ");
        fs::write(&path, format!("# {label}\n")).map_err(|error| Error::io(path, error))
    }

    fn append(&self, key: &str, timestamp: DateTime<Utc>, sample: Sample) -> Result<()> {
        let path = self.path_of(key);

        if !path.exists() {
            return Err(Error::TimeSeries(format!("series '{key}' does not exist")));
        }

        self.compact_if_due(key, &path, timestamp.timestamp())?;

        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|error| match error.kind() {
                io::ErrorKind::NotFound => {
                    Error::TimeSeries(format!("series '{key}' does not exist"))
                }
                _ => Error::io(&path, error),
            })?;

        let line = match sample {
            Sample::Value(value) => format!("{},{value}\n", timestamp.timestamp()),
            Sample::NoData => format!("{},\n", timestamp.timestamp()),
        };

        file.write_all(line.as_bytes())
            .map_err(|error| Error::io(path, error))
    }

    fn delete_series(&self, key: &str) -> Result<()> {
        let path = self.path_of(key);
        self.next_compaction.lock().remove(key);

        match fs::remove_file(&path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => Err(Error::io(path, error)),
            _ => Ok(()),
        }
    }

    fn delete_obsolete_series(&self, older_than: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut deleted: usize = 0;

        for (path, metadata) in self.series_files()? {
            let modified = metadata.modified().map_err(|error| Error::io(&path, error))?;

            if now.duration_since(modified).unwrap_or_default() > older_than {
                fs::remove_file(&path).map_err(|error| Error::io(&path, error))?;
                debug!(path = %path.display(), "deleted obsolete time series");
                deleted = deleted.saturating_add(1);
            }
        }

        Ok(deleted)
    }

    fn total_bytes_on_disk(&self) -> Result<u64> {
        Ok(self
            .series_files()?
            .iter()
            .fold(0_u64, |total, (_, metadata)| total.saturating_add(metadata.len())))
    }
}

/// Rewrites a series file without the samples older than `cutoff`, returning how many were
/// dropped. The file is left untouched if nothing is dropped.
fn compact(path: &Path, cutoff: i64) -> Result<usize> {
    let contents = fs::read_to_string(path).map_err(|error| Error::io(path, error))?;

    let mut kept = String::with_capacity(contents.len());
    let mut dropped: usize = 0;

    for line in contents.lines() {
        let expired = line
            .split_once(',')
            .and_then(|(timestamp, _)| timestamp.parse::<i64>().ok())
            .is_some_and(|timestamp| timestamp < cutoff);

        if expired {
            dropped = dropped.saturating_add(1);
        } else {
            kept.push_str(line);
            kept.push('\n');
        }
    }

    if dropped == 0 {
        return Ok(0);
    }

    let temporary_path = path.with_extension("tmp");

    let mut file =
        fs::File::create(&temporary_path).map_err(|error| Error::io(&temporary_path, error))?;
    file.write_all(kept.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|error| Error::io(&temporary_path, error))?;
    drop(file);

    fs::rename(&temporary_path, path).map_err(|error| Error::io(path, error))?;

    Ok(dropped)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use chrono::TimeZone;

    use super::*;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, minute, 0).unwrap()
    }

    #[test]
    fn sentinel_conversion() {
        assert_eq!(Sample::from_sentinel(-1.0), Sample::NoData);
        assert_eq!(Sample::from_sentinel(0.0), Sample::Value(0.0));
        assert_eq!(Sample::Value(2.5).value(), Some(2.5));
        assert_eq!(Sample::NoData.value(), None);
    }

    #[test]
    fn memory_store_requires_series() {
        let store = MemoryTimeSeriesStore::new();

        assert!(matches!(
            store.append("httpHitsRate", at(0), Sample::Value(1.0)),
            Err(Error::TimeSeries(_))
        ));

        store.create_series("httpHitsRate", "http hits per minute").unwrap();
        store.append("httpHitsRate", at(0), Sample::Value(1.0)).unwrap();
        store.append("httpHitsRate", at(1), Sample::NoData).unwrap();

        assert_eq!(
            store.samples("httpHitsRate"),
            vec![(at(0), Sample::Value(1.0)), (at(1), Sample::NoData)]
        );
        assert_eq!(store.label("httpHitsRate").unwrap(), "http hits per minute");
    }

    #[test]
    fn memory_store_is_bounded() {
        let store = MemoryTimeSeriesStore::with_capacity(2);
        store.create_series("k", "k").unwrap();

        for minute in 0..5 {
            store.append("k", at(minute), Sample::Value(f64::from(minute))).unwrap();
        }

        assert_eq!(store.samples("k").len(), 2);
        assert_eq!(store.last_sample("k"), Some(Sample::Value(4.0)));
    }

    #[test]
    fn memory_store_deletes() {
        let store = MemoryTimeSeriesStore::new();
        store.create_series("a", "a").unwrap();
        store.create_series("b", "b").unwrap();

        store.delete_series("a").unwrap();
        store.delete_series("never existed").unwrap();
        assert_eq!(store.keys(), vec!["b".to_owned()]);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(store.delete_obsolete_series(Duration::from_millis(5)).unwrap(), 1);
        assert!(!store.contains("b"));
    }

    #[test]
    fn file_store_appends_lines() {
        let directory = tempfile::tempdir().unwrap();
        let store = FileTimeSeriesStore::new(directory.path());

        store.create_series("sql0123/x", "select\n1").unwrap();
        store.append("sql0123/x", at(0), Sample::Value(12.5)).unwrap();
        store.append("sql0123/x", at(1), Sample::NoData).unwrap();

        let contents = fs::read_to_string(directory.path().join("sql0123_x.series")).unwrap();
        assert_eq!(
            contents,
            format!("# select 1\n{},12.5\n{},\n", at(0).timestamp(), at(1).timestamp())
        );
        assert!(store.total_bytes_on_disk().unwrap() > 0);
    }

    #[test]
    fn file_store_drops_samples_past_retention() {
        let directory = tempfile::tempdir().unwrap();
        let store = FileTimeSeriesStore::new(directory.path())
            .with_retention(Duration::from_secs(10 * 60));
        let path = directory.path().join("cpu.series");

        store.create_series("cpu", "cpu").unwrap();

        // Five hours of samples at one per minute.
        let start = at(0);
        for minute in 0..300 {
            let timestamp = start + chrono::Duration::minutes(minute);
            store.append("cpu", timestamp, Sample::Value(1.0)).unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        let samples = contents.lines().skip(1).count();

        // At most the window plus one compaction interval, which equals the window here.
        assert!(samples <= 21, "{samples} samples kept");
        assert!(contents.starts_with("# cpu\n"));

        let newest = (start + chrono::Duration::minutes(299)).timestamp();
        assert!(contents.ends_with(&format!("{newest},1\n")));
    }

    #[test]
    fn file_store_compacts_series_left_by_previous_process() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("cpu.series");

        let previous = FileTimeSeriesStore::new(directory.path());
        previous.create_series("cpu", "cpu").unwrap();
        previous.append("cpu", at(0), Sample::Value(1.0)).unwrap();
        previous.append("cpu", at(1), Sample::Value(2.0)).unwrap();

        let store = FileTimeSeriesStore::new(directory.path())
            .with_retention(Duration::from_secs(60));
        store.append("cpu", at(30), Sample::Value(3.0)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("# cpu\n{},3\n", at(30).timestamp()));
        assert!(!directory.path().join("cpu.tmp").exists());
    }

    #[test]
    fn file_store_requires_series_and_cleans_up() {
        let directory = tempfile::tempdir().unwrap();
        let store = FileTimeSeriesStore::new(directory.path().join("series"));

        assert!(matches!(
            store.append("missing", at(0), Sample::NoData),
            Err(Error::TimeSeries(_))
        ));

        store.create_series("cpu", "cpu").unwrap();
        assert_eq!(store.delete_obsolete_series(Duration::from_secs(3600)).unwrap(), 0);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(store.delete_obsolete_series(Duration::from_millis(10)).unwrap(), 1);

        store.delete_series("cpu").unwrap();
        assert_eq!(store.total_bytes_on_disk().unwrap(), 0);
    }
}
