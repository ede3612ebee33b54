//! Durable storage of registry snapshots.
//!
//! A collector keeps two kinds of snapshot per registry: the cumulative ("all time") state,
//! which is what the registry is restored from after a restart, and one aggregate per calendar
//! day, which period views are built from.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, RegistrySnapshot, Result};

const SNAPSHOT_EXTENSION: &str = "json";

/// Identifies one persisted snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum SnapshotKey {
    /// The cumulative state of a registry since its creation or last clear.
    Cumulative {
        /// Name of the registry.
        registry: String,
    },

    /// The aggregate of one calendar day (local time) of a registry.
    Day {
        /// Name of the registry.
        registry: String,

        /// The day the aggregate covers.
        date: NaiveDate,
    },
}

impl SnapshotKey {
    /// Key of the cumulative snapshot of a registry.
    #[must_use]
    pub fn cumulative(registry: impl Into<String>) -> Self {
        Self::Cumulative {
            registry: registry.into(),
        }
    }

    /// Key of the day aggregate of a registry.
    #[must_use]
    pub fn day(registry: impl Into<String>, date: NaiveDate) -> Self {
        Self::Day {
            registry: registry.into(),
            date,
        }
    }

    /// Name of the registry the snapshot belongs to.
    #[must_use]
    pub fn registry(&self) -> &str {
        match self {
            Self::Cumulative { registry } | Self::Day { registry, .. } => registry,
        }
    }

    /// The file name under which the snapshot is stored, e.g. `http.json` or
    /// `http_20240315.json`.
    #[must_use]
    pub fn file_name(&self) -> String {
        match self {
            Self::Cumulative { registry } => format!("{registry}.{SNAPSHOT_EXTENSION}"),
            Self::Day { registry, date } => {
                format!("{registry}_{}.{SNAPSHOT_EXTENSION}", date.format("%Y%m%d"))
            }
        }
    }
}

impl Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Durable storage of registry snapshots.
///
/// Failures are reported as errors. The collector logs them and carries on: a failed read
/// means "start empty" or "skip this day", a failed write is retried on the next tick.
pub trait CounterStore: Debug + Send + Sync {
    /// Reads a snapshot. Returns `Ok(None)` if it was never written.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot exists but cannot be read or decoded.
    fn read(&self, key: &SnapshotKey) -> Result<Option<RegistrySnapshot>>;

    /// Writes a snapshot, replacing any previous version atomically.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot cannot be encoded or stored. The previous version, if any, is
    /// left intact.
    fn write(&self, key: &SnapshotKey, snapshot: &RegistrySnapshot) -> Result<()>;

    /// Deletes snapshots that have not been written for longer than `max_age`.
    ///
    /// Returns the number of deleted snapshots.
    ///
    /// # Errors
    ///
    /// Fails if the storage cannot be enumerated.
    fn delete_obsolete(&self, max_age: Duration) -> Result<usize>;

    /// Total size of all stored snapshots, in bytes.
    ///
    /// # Errors
    ///
    /// Fails if the storage cannot be enumerated.
    fn disk_usage(&self) -> Result<u64>;
}

impl<T: CounterStore + ?Sized> CounterStore for Arc<T> {
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn read(&self, key: &SnapshotKey) -> Result<Option<RegistrySnapshot>> {
        (**self).read(key)
    }

    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn write(&self, key: &SnapshotKey, snapshot: &RegistrySnapshot) -> Result<()> {
        (**self).write(key, snapshot)
    }

    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn delete_obsolete(&self, max_age: Duration) -> Result<usize> {
        (**self).delete_obsolete(max_age)
    }

    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn disk_usage(&self) -> Result<u64> {
        (**self).disk_usage()
    }
}

/// Stores snapshots as JSON files in one directory.
///
/// Every write goes to a temporary sibling file that is then renamed over the target, so a
/// crash mid-write leaves either the old or the new snapshot, never a torn one.
#[derive(Debug)]
pub struct FileCounterStore {
    directory: PathBuf,
}

impl FileCounterStore {
    /// Creates a store in the given directory. The directory is created on first write.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// The directory the snapshots are stored in.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_of(&self, key: &SnapshotKey) -> PathBuf {
        self.directory.join(key.file_name())
    }

    /// Snapshot files in the directory. A missing directory has none.
    fn snapshot_files(&self) -> Result<Vec<(PathBuf, fs::Metadata)>> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(Error::io(&self.directory, error)),
        };

        let mut files = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|error| Error::io(&self.directory, error))?;
            let path = entry.path();

            if path.extension().and_then(|extension| extension.to_str()) != Some(SNAPSHOT_EXTENSION)
            {
                continue;
            }

            let metadata = entry.metadata().map_err(|error| Error::io(&path, error))?;

            if metadata.is_file() {
                files.push((path, metadata));
            }
        }

        Ok(files)
    }
}

impl CounterStore for FileCounterStore {
    fn read(&self, key: &SnapshotKey) -> Result<Option<RegistrySnapshot>> {
        let path = self.path_of(key);

        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(Error::io(path, error)),
        };

        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| Error::Serialization { path, source })
    }

    fn write(&self, key: &SnapshotKey, snapshot: &RegistrySnapshot) -> Result<()> {
        let path = self.path_of(key);
        let temporary_path = path.with_extension("tmp");

        fs::create_dir_all(&self.directory).map_err(|error| Error::io(&self.directory, error))?;

        let contents = serde_json::to_vec(snapshot).map_err(|source| Error::Serialization {
            path: path.clone(),
            source,
        })?;

        let mut file =
            fs::File::create(&temporary_path).map_err(|error| Error::io(&temporary_path, error))?;
        file.write_all(&contents)
            .and_then(|()| file.sync_all())
            .map_err(|error| Error::io(&temporary_path, error))?;
        drop(file);

        fs::rename(&temporary_path, &path).map_err(|error| Error::io(&path, error))
    }

    fn delete_obsolete(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut deleted: usize = 0;

        for (path, metadata) in self.snapshot_files()? {
            let modified = metadata.modified().map_err(|error| Error::io(&path, error))?;

            // A modification time in the future counts as fresh.
            let age = now.duration_since(modified).unwrap_or_default();

            if age > max_age {
                fs::remove_file(&path).map_err(|error| Error::io(&path, error))?;
                debug!(path = %path.display(), "deleted obsolete snapshot");
                deleted = deleted.saturating_add(1);
            }
        }

        Ok(deleted)
    }

    fn disk_usage(&self) -> Result<u64> {
        Ok(self
            .snapshot_files()?
            .iter()
            .fold(0_u64, |total, (_, metadata)| total.saturating_add(metadata.len())))
    }
}

#[derive(Debug)]
struct StoredSnapshot {
    json: String,
    written_at: SystemTime,
}

/// Keeps snapshots in memory, for tests and for deployments that do not need durability.
///
/// Snapshots are kept in encoded form, so what comes back out has made the same round trip
/// through serialization as a file-backed snapshot would.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    snapshots: Mutex<HashMap<SnapshotKey, StoredSnapshot>>,
    fail_writes: AtomicBool,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail (or succeed again), simulating a full disk.
    pub fn set_fail_writes(&self, fail_writes: bool) {
        self.fail_writes.store(fail_writes, Ordering::Relaxed);
    }

    /// Stores an undecodable snapshot under the key, simulating a file damaged by a crash.
    pub fn insert_corrupt(&self, key: SnapshotKey) {
        self.snapshots.lock().insert(
            key,
            StoredSnapshot {
                json: "{\"truncated".to_owned(),
                written_at: SystemTime::now(),
            },
        );
    }

    /// Whether a snapshot (readable or not) is stored under the key.
    #[must_use]
    pub fn contains(&self, key: &SnapshotKey) -> bool {
        self.snapshots.lock().contains_key(key)
    }

    /// Number of stored snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// Whether no snapshots are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl CounterStore for MemoryCounterStore {
    fn read(&self, key: &SnapshotKey) -> Result<Option<RegistrySnapshot>> {
        let snapshots = self.snapshots.lock();

        let Some(stored) = snapshots.get(key) else {
            return Ok(None);
        };

        serde_json::from_str(&stored.json)
            .map(Some)
            .map_err(|source| Error::Serialization {
                path: PathBuf::from(key.file_name()),
                source,
            })
    }

    fn write(&self, key: &SnapshotKey, snapshot: &RegistrySnapshot) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::io(
                key.file_name(),
                io::Error::new(io::ErrorKind::StorageFull, "simulated write failure"),
            ));
        }

        let json = serde_json::to_string(snapshot).map_err(|source| Error::Serialization {
            path: PathBuf::from(key.file_name()),
            source,
        })?;

        self.snapshots.lock().insert(
            key.clone(),
            StoredSnapshot {
                json,
                written_at: SystemTime::now(),
            },
        );

        Ok(())
    }

    fn delete_obsolete(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut snapshots = self.snapshots.lock();
        let before = snapshots.len();

        snapshots.retain(|_, stored| {
            now.duration_since(stored.written_at).unwrap_or_default() <= max_age
        });

        Ok(before.saturating_sub(snapshots.len()))
    }

    fn disk_usage(&self) -> Result<u64> {
        Ok(self
            .snapshots
            .lock()
            .values()
            .map(|stored| stored.json.len() as u64)
            .sum())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{Outcome, Registry};

    assert_impl_all!(FileCounterStore: Send, Sync);
    assert_impl_all!(MemoryCounterStore: Send, Sync);

    fn sample_snapshot() -> RegistrySnapshot {
        let registry = Registry::builder().name("http").build();
        registry.record("/a", Duration::from_millis(12), &Outcome::success());
        registry.record("/b", Duration::from_millis(3), &Outcome::system_error());
        registry.snapshot()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn file_names() {
        assert_eq!(SnapshotKey::cumulative("http").file_name(), "http.json");
        assert_eq!(SnapshotKey::day("sql", date(5)).file_name(), "sql_20240305.json");
        assert_eq!(SnapshotKey::day("sql", date(5)).registry(), "sql");
    }

    #[test]
    fn file_store_round_trip() {
        let directory = tempfile::tempdir().unwrap();
        let store = FileCounterStore::new(directory.path().join("nested"));
        let key = SnapshotKey::cumulative("http");
        let snapshot = sample_snapshot();

        assert!(store.read(&key).unwrap().is_none());

        store.write(&key, &snapshot).unwrap();

        assert_eq!(store.read(&key).unwrap().unwrap(), snapshot);
        assert!(store.disk_usage().unwrap() > 0);
        assert!(!store.directory().join("http.tmp").exists());
    }

    #[test]
    fn file_store_reports_corrupt_file() {
        let directory = tempfile::tempdir().unwrap();
        let store = FileCounterStore::new(directory.path());
        fs::write(directory.path().join("http.json"), b"not json").unwrap();

        let error = store.read(&SnapshotKey::cumulative("http")).unwrap_err();

        assert!(matches!(error, Error::Serialization { .. }));
    }

    #[test]
    fn file_store_deletes_only_old_files() {
        let directory = tempfile::tempdir().unwrap();
        let store = FileCounterStore::new(directory.path());
        store
            .write(&SnapshotKey::day("http", date(1)), &sample_snapshot())
            .unwrap();
        fs::write(directory.path().join("unrelated.txt"), b"keep").unwrap();

        assert_eq!(store.delete_obsolete(Duration::from_secs(3600)).unwrap(), 0);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(store.delete_obsolete(Duration::from_millis(10)).unwrap(), 1);
        assert!(directory.path().join("unrelated.txt").exists());
        assert_eq!(store.disk_usage().unwrap(), 0);
    }

    #[test]
    fn file_store_in_missing_directory_is_empty() {
        let directory = tempfile::tempdir().unwrap();
        let store = FileCounterStore::new(directory.path().join("absent"));

        assert_eq!(store.disk_usage().unwrap(), 0);
        assert_eq!(store.delete_obsolete(Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn memory_store_round_trip_and_failures() {
        let store = MemoryCounterStore::new();
        let key = SnapshotKey::day("http", date(2));
        let snapshot = sample_snapshot();

        store.write(&key, &snapshot).unwrap();
        assert_eq!(store.read(&key).unwrap().unwrap(), snapshot);
        assert_eq!(store.len(), 1);

        store.set_fail_writes(true);
        assert!(matches!(store.write(&key, &snapshot), Err(Error::Io { .. })));

        store.insert_corrupt(SnapshotKey::cumulative("http"));
        assert!(store.read(&SnapshotKey::cumulative("http")).is_err());
    }
}
