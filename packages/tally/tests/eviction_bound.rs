//! A registry never keeps more distinct requests than its ceiling.

use std::time::Duration;

use tally::{Outcome, Registry};

#[test]
fn cardinality_stays_bounded() {
    let registry = Registry::builder()
        .name("sql")
        .max_requests_count(100)
        .eviction_hits_threshold(10)
        .build();

    // Frequently executed statements.
    for index in 0..20 {
        for _ in 0..50 {
            registry.record(
                &format!("select * from table_{index}"),
                Duration::from_millis(1),
                &Outcome::success(),
            );
        }
    }

    // Statements with unbound literals, each seen once.
    for literal in 0..5_000 {
        registry.record(
            &format!("select * from users where id = {literal}"),
            Duration::from_millis(1),
            &Outcome::success(),
        );

        assert!(registry.request_count() <= 100);
    }

    // Overflow trims to 90% of the ceiling, leaving room for new requests.
    assert!(registry.request_count() >= 90);

    for index in 0..20 {
        let stat = registry
            .request_by_name(&format!("select * from table_{index}"))
            .unwrap();
        assert_eq!(stat.hits(), 50);
    }
}

#[test]
fn frequently_hit_requests_are_evicted_when_nothing_else_is_left() {
    let registry = Registry::builder()
        .name("sql")
        .max_requests_count(5)
        .eviction_hits_threshold(2)
        .build();

    for index in 0..50 {
        for _ in 0..3 {
            registry.record(
                &format!("statement {index}"),
                Duration::from_millis(1),
                &Outcome::success(),
            );
        }
    }

    assert!(registry.request_count() <= 5);
    assert!(registry.request_by_name("statement 49").is_some());
}
