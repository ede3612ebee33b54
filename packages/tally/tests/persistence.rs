//! Statistics survive a restart through the file-backed stores.

use std::time::Duration;

use tally::{
    Collector, CollectorConfig, CounterStore, ErrorRecord, FileCounterStore, Outcome, Period,
    Range, Registry, SnapshotKey,
};

fn config(directory: &std::path::Path) -> CollectorConfig {
    CollectorConfig::builder()
        .application("persistence")
        .storage_directory(directory)
        .build()
        .unwrap()
}

fn registries(config: &CollectorConfig) -> (Registry, Registry, Registry) {
    (
        config.registry("http").child_registry("sql").build(),
        config.registry("sql").build(),
        config.registry("error").error_registry().build(),
    )
}

#[test]
fn restart_restores_cumulative_totals() {
    let directory = tempfile::tempdir().unwrap();
    let config = config(directory.path());

    let (http, sql, errors) = registries(&config);
    let collector = Collector::builder(config.clone())
        .registries([http.clone(), sql.clone(), errors.clone()])
        .build()
        .unwrap();

    http.record("/", Duration::from_millis(10), &Outcome::success());
    collector.collect().unwrap();
    http.record("/", Duration::from_millis(30), &Outcome::system_error());
    sql.record("select 1", Duration::from_millis(2), &Outcome::success());
    errors.record_system_error(
        ErrorRecord::new(chrono::Utc::now(), "disk full").with_request("/upload POST"),
        Duration::ZERO,
    );
    collector.stop();

    let before = [http.snapshot(), sql.snapshot(), errors.snapshot()];

    let (http, sql, errors) = registries(&config);
    let collector = Collector::builder(config)
        .registries([http.clone(), sql.clone(), errors.clone()])
        .build()
        .unwrap();

    let after = [http.snapshot(), sql.snapshot(), errors.snapshot()];

    for (before, after) in before.iter().zip(&after) {
        assert_eq!(before.total_hits(), after.total_hits());
        assert!(before.requests().eq(after.requests()));
        assert_eq!(before.errors(), after.errors());
    }

    // Today's aggregate was restored too, so the day still adds up to everything.
    let today = collector
        .range_registry(Period::Day.into(), "http")
        .unwrap();
    assert_eq!(today.snapshot().total_hits(), 2);

    let all = collector
        .range_registry(Period::All.into(), "http")
        .unwrap();
    assert_eq!(
        today.snapshot().global_request().durations_sum(),
        all.snapshot().global_request().durations_sum()
    );

    collector.stop();
}

#[test]
fn store_round_trip_and_corruption() {
    let directory = tempfile::tempdir().unwrap();
    let store = FileCounterStore::new(directory.path());

    let registry = Registry::builder().name("http").build();
    registry.record("/a", Duration::from_millis(3), &Outcome::success().with_response_size(100));
    let snapshot = registry.snapshot();

    let key = SnapshotKey::cumulative("http");
    store.write(&key, &snapshot).unwrap();
    assert_eq!(store.read(&key).unwrap(), Some(snapshot));
    assert!(store.disk_usage().unwrap() > 0);

    std::fs::write(directory.path().join(key.file_name()), b"{ not json").unwrap();
    assert!(store.read(&key).is_err());

    // A collector treats an unreadable snapshot as a fresh start.
    let config = config(directory.path());
    let restored = config.registry("http").build();
    let collector = Collector::builder(config)
        .registry(restored.clone())
        .build()
        .unwrap();

    assert!(restored.snapshot().is_empty());

    let range = Range::custom(
        chrono::Local::now().date_naive(),
        chrono::Local::now().date_naive(),
    )
    .unwrap();
    assert!(collector.range_registry(range, "http").is_ok());

    collector.stop();
}
