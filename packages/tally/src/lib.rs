#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! # tally
//!
//! Request statistics for long-running applications: hit counts, durations, processor time,
//! errors and nesting of instrumented calls, rolled up periodically into time series, daily
//! aggregates and crash-safe snapshots.
//!
//! # Registries
//!
//! A [`Registry`] collects statistics for one category of instrumented calls, such as HTTP
//! requests, SQL statements or background jobs. Every distinct request name gets a
//! [`RequestStat`] with its hits, duration sum and square sum, maximum, processor time, system
//! errors and response sizes, from which means and deviations are derived.
//!
//! Durations that the caller already measured are recorded directly:
//!
//! ```
//! use std::time::Duration;
//!
//! use tally::{Outcome, Registry};
//!
//! let sql = Registry::builder().name("sql").build();
//!
//! sql.record("select * from orders", Duration::from_millis(4), &Outcome::success());
//! sql.record("select * from orders", Duration::from_millis(8), &Outcome::system_error());
//!
//! let orders = sql.request_by_name("select * from orders").unwrap();
//! assert_eq!(orders.hits(), 2);
//! assert_eq!(orders.mean(), 6);
//! assert_eq!(orders.system_error_percentage(), 50.0);
//! ```
//!
//! # Nested executions
//!
//! To measure an execution and attribute the calls made inside it, begin and end it on a
//! [`CallStack`] that represents the logical task (a thread, or an async task) doing the work.
//! An execution that begins while another is open becomes its child. When the child ends, it
//! counts as a child hit of the parent request if the parent's registry names the child's
//! registry as its child registry:
//!
//! ```
//! use tally::{CallStack, Outcome, Registry};
//!
//! let http = Registry::builder().name("http").child_registry("sql").build();
//! let sql = Registry::builder().name("sql").build();
//!
//! let mut stack = CallStack::for_current_thread();
//!
//! let request = http.begin(&mut stack, "/orders GET");
//! let query = sql.begin(&mut stack, "select * from orders");
//! sql.end(&mut stack, query, &Outcome::success());
//! http.end(&mut stack, request, &Outcome::success().with_response_size(512));
//!
//! let orders = http.request_by_name("/orders GET").unwrap();
//! assert_eq!(orders.child_hits(), 1);
//! assert_eq!(sql.request_by_name("select * from orders").unwrap().hits(), 1);
//! ```
//!
//! Executions in progress that have no parent are visible through
//! [`Registry::current_root_contexts()`] and [`Collector::root_current_contexts()`].
//!
//! # Collection
//!
//! A [`Collector`] owns a fixed set of registries. Each tick (every minute by default, driven
//! by a [`CollectionTimer`] or by the host) it measures what happened since the previous tick,
//! appends it to time series, folds it into the aggregate of the current day and persists the
//! snapshots that changed. Periods can then be viewed over a day, week, month, year or a
//! custom range of days through [`Collector::range_registry()`].
//!
//! Numeric metrics that some platforms cannot measure use negative values to mean "not
//! available". Fleet-wide values are combined with [`fleet_add()`], which never lets an
//! unavailable value distort an available one.
//!
//! # Errors
//!
//! Recording never fails. Construction, persistence and administrative operations return
//! [`Result`], while the collection tick logs failures through `tracing` and keeps going.

mod action;
mod collector;
mod config;
mod context;
mod data_types;
mod error;
mod error_record;
mod fleet;
mod outcome;
mod pal;
mod period;
mod registry;
mod registry_builder;
mod registry_snapshot;
mod request_stat;
mod storage;
mod telemetry;
mod time_series;
mod timer;

pub use action::*;
pub use collector::*;
pub use config::*;
pub use context::*;
pub use data_types::*;
pub(crate) use data_types::{REQUEST_HASH_LEN, duration_to_millis, request_id};
pub use error::*;
pub use error_record::*;
pub use fleet::*;
pub use outcome::*;
pub use period::*;
pub use registry::*;
pub use registry_builder::*;
pub use registry_snapshot::*;
pub use request_stat::*;
pub use storage::*;
pub use telemetry::*;
pub use time_series::*;
pub use timer::*;
