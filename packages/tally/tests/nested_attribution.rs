//! Executions nested inside other executions are attributed to the enclosing request.

use std::thread;
use std::time::Duration;

use tally::{CallStack, Outcome, Registry};

#[test]
fn child_execution_is_attributed_to_parent() {
    let http = Registry::builder().name("http").child_registry("sql").build();
    let sql = Registry::builder().name("sql").build();
    let mut stack = CallStack::new("worker-1");

    let request = http.begin(&mut stack, "/checkout POST");
    let query = sql.begin(&mut stack, "insert into orders");
    thread::sleep(Duration::from_millis(5));
    let query_duration = sql.end(&mut stack, query, &Outcome::success());
    http.end(&mut stack, request, &Outcome::success());

    let checkout = http.request_by_name("/checkout POST").unwrap();
    let insert = sql.request_by_name("insert into orders").unwrap();

    assert_eq!(checkout.hits(), 1);
    assert_eq!(checkout.child_hits(), 1);
    assert_eq!(checkout.child_durations_sum(), insert.durations_sum());
    assert!(checkout.durations_sum() >= insert.durations_sum());
    assert_eq!(
        insert.durations_sum(),
        i64::try_from(query_duration.as_millis()).unwrap()
    );
    assert!(insert.durations_sum() >= 5);

    // The parent knows which child request it executed.
    let children: Vec<_> = checkout.child_executions().collect();
    assert_eq!(children, vec![(insert.id(), 1)]);

    // The child has its own statistics, with no children of its own.
    assert_eq!(insert.hits(), 1);
    assert_eq!(insert.child_hits(), 0);
}

#[test]
fn unrelated_registries_are_not_attributed() {
    let http = Registry::builder().name("http").child_registry("sql").build();
    let cache = Registry::builder().name("cache").build();
    let mut stack = CallStack::new("worker-2");

    let request = http.begin(&mut stack, "/home GET");
    let lookup = cache.begin(&mut stack, "get user");
    cache.end(&mut stack, lookup, &Outcome::success());
    http.end(&mut stack, request, &Outcome::success());

    assert_eq!(http.request_by_name("/home GET").unwrap().child_hits(), 0);
    assert_eq!(cache.request_by_name("get user").unwrap().hits(), 1);
}

#[test]
fn live_view_shows_open_tree() {
    let http = Registry::builder().name("http").child_registry("sql").build();
    let sql = Registry::builder().name("sql").build();
    let mut stack = CallStack::new("worker-3");
    stack.set_remote_user(Some("alice"));

    let request = http.begin(&mut stack, "/report GET");
    let query = sql.begin(&mut stack, "select * from sales");

    let roots = http.current_root_contexts();
    assert_eq!(roots.len(), 1);

    let root = roots.first().unwrap();
    assert_eq!(root.request_name(), "/report GET");
    assert_eq!(root.thread_label(), "worker-3");
    assert_eq!(root.remote_user(), Some("alice"));
    assert_eq!(root.children().len(), 1);
    assert_eq!(
        root.children().first().unwrap().request_name(),
        "select * from sales"
    );

    // Child executions are not roots of their own registry.
    assert!(sql.current_root_contexts().is_empty());

    sql.end(&mut stack, query, &Outcome::success());
    http.end(&mut stack, request, &Outcome::success());

    assert!(http.current_root_contexts().is_empty());
}

#[test]
fn abandoned_execution_is_not_recorded() {
    let http = Registry::builder().name("http").build();
    let mut stack = CallStack::new("worker-4");

    let request = http.begin(&mut stack, "/abandoned");
    drop(request);

    assert!(http.current_root_contexts().is_empty());
    assert!(http.request_by_name("/abandoned").is_none());

    let request = http.begin(&mut stack, "/next");
    assert_eq!(stack.depth(), 1);
    http.end(&mut stack, request, &Outcome::success());
    assert_eq!(http.request_by_name("/next").unwrap().hits(), 1);
}
