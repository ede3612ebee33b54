use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::pal::Platform;
use crate::request_stat::CompletedExecution;
use crate::{Millis, Outcome, Registry, duration_to_millis, request_id};

static NEXT_CONTEXT_KEY: AtomicU64 = AtomicU64::new(0);

/// One traced execution that has begun and not yet ended.
///
/// Contexts form a tree: an execution that begins while another one is open on the same
/// [`CallStack`] becomes its child, even when the two belong to different registries (an HTTP
/// request executing SQL statements). Only the code that owns the call stack mutates a context.
/// Other threads may read it at any time through [`ContextSnapshot`]s.
#[derive(Debug)]
pub struct ExecutionContext {
    key: u64,
    registry: Registry,
    request_name: String,
    thread_label: Arc<str>,
    remote_user: Option<Arc<str>>,

    started_at: Instant,
    cpu_started_at: Option<Duration>,

    parent: Option<Weak<ExecutionContext>>,
    children: Mutex<Vec<Arc<ExecutionContext>>>,

    child_hits: AtomicU64,
    child_durations_sum: AtomicI64,
    child_executions_by_id: Mutex<BTreeMap<String, u64>>,

    // Set once the context has been ended or its handle dropped without ending it.
    closed: AtomicBool,
}

impl ExecutionContext {
    /// Name of the request being executed.
    #[must_use]
    pub fn request_name(&self) -> &str {
        &self.request_name
    }

    /// The registry the execution will be recorded in.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Whether the execution has no enclosing execution.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Time elapsed since the execution began.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.registry
            .platform()
            .now()
            .saturating_duration_since(self.started_at)
    }

    /// Takes a snapshot of this context and its open descendants as of `now`.
    pub(crate) fn snapshot(&self, now: Instant) -> ContextSnapshot {
        let children: Vec<Arc<Self>> = self.children.lock().iter().map(Arc::clone).collect();

        ContextSnapshot {
            registry_name: self.registry.name().to_owned(),
            request_name: self.request_name.clone(),
            thread_label: self.thread_label.to_string(),
            remote_user: self.remote_user.as_deref().map(str::to_owned),
            elapsed: now.saturating_duration_since(self.started_at),
            child_hits: self.child_hits.load(Ordering::Relaxed),
            child_durations_sum: self.child_durations_sum.load(Ordering::Relaxed),
            children: children.iter().map(|child| child.snapshot(now)).collect(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Removes the context from wherever it is visible to live views.
    fn detach(self: &Arc<Self>) {
        self.closed.store(true, Ordering::Relaxed);

        match self.parent.as_ref().and_then(Weak::upgrade) {
            Some(parent) => parent
                .children
                .lock()
                .retain(|child| !Arc::ptr_eq(child, self)),
            None => self.registry.unregister_root_context(self.key),
        }
    }

    fn add_child_execution(&self, child_id: String, duration: Millis) {
        self.child_hits.fetch_add(1, Ordering::Relaxed);
        self.child_durations_sum
            .fetch_add(duration, Ordering::Relaxed);

        let mut executions = self.child_executions_by_id.lock();
        let count = executions.entry(child_id).or_insert(0);
        *count = count.saturating_add(1);
    }
}

/// The stack of open executions of one logical task.
///
/// A call stack replaces ambient per-thread state: whoever runs a unit of work (a thread, an
/// async task, a request handler) owns one call stack and passes it to every
/// [`Registry::begin()`] and [`Registry::end()`] made on behalf of that work. Executions begun
/// while another is open on the same stack become its children.
///
/// # Example
///
/// ```
/// use tally::{CallStack, Outcome, Registry};
///
/// let http = Registry::builder().name("http").child_registry("sql").build();
/// let sql = Registry::builder().name("sql").build();
///
/// let mut stack = CallStack::new("worker-1");
///
/// let request = http.begin(&mut stack, "/orders GET");
/// let query = sql.begin(&mut stack, "select * from orders");
/// sql.end(&mut stack, query, &Outcome::success());
/// http.end(&mut stack, request, &Outcome::success());
///
/// assert_eq!(http.request_by_name("/orders GET").unwrap().child_hits(), 1);
/// ```
#[derive(Debug)]
pub struct CallStack {
    label: Arc<str>,
    remote_user: Option<Arc<str>>,
    frames: Vec<Arc<ExecutionContext>>,
}

impl CallStack {
    /// Creates an empty call stack. The label identifies the owner in live views.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Arc::from(label.into()),
            remote_user: None,
            frames: Vec::new(),
        }
    }

    /// Creates an empty call stack labeled after the current thread.
    #[must_use]
    pub fn for_current_thread() -> Self {
        let current = thread::current();

        match current.name() {
            Some(name) => Self::new(name),
            None => Self::new(format!("{:?}", current.id())),
        }
    }

    /// Sets the remote user on whose behalf executions begun from now on run.
    pub fn set_remote_user(&mut self, remote_user: Option<&str>) {
        self.remote_user = remote_user.map(Arc::from);
    }

    /// The label identifying the owner of the stack.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of open executions on the stack.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether no execution is open on the stack.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The innermost open execution, if any.
    #[must_use]
    pub fn current(&self) -> Option<&ExecutionContext> {
        self.frames.last().map(AsRef::as_ref)
    }

    fn drop_closed_frames(&mut self) {
        while self.frames.last().is_some_and(|frame| frame.is_closed()) {
            self.frames.pop();
        }
    }

    /// Removes a context from the stack, returning whether it was the innermost frame.
    ///
    /// Frames above it belong to executions that were never ended. They are detached and
    /// discarded.
    fn remove(&mut self, context: &Arc<ExecutionContext>) -> bool {
        let Some(position) = self
            .frames
            .iter()
            .rposition(|frame| Arc::ptr_eq(frame, context))
        else {
            return false;
        };

        let innermost = position.saturating_add(1) == self.frames.len();

        for abandoned in self.frames.drain(position..).skip(1) {
            warn!(
                registry = abandoned.registry.name(),
                request = %abandoned.request_name,
                "execution was never ended, discarding it"
            );
            abandoned.detach();
        }

        innermost
    }
}

/// Proof that an execution has begun, to be handed back to [`Registry::end()`].
///
/// Dropping a handle without ending the execution discards the execution: nothing is recorded
/// and the execution disappears from live views.
#[derive(Debug)]
#[must_use = "an execution that is never ended is never recorded"]
pub struct ContextHandle {
    context: Arc<ExecutionContext>,
    ended: bool,
}

impl ContextHandle {
    /// The context of the execution.
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        if !self.ended {
            trace!(
                registry = self.context.registry.name(),
                request = %self.context.request_name,
                "execution handle dropped without ending"
            );
            self.context.detach();
        }
    }
}

/// Read-only copy of an open execution and its open descendants, for live views of
/// in-progress requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextSnapshot {
    registry_name: String,
    request_name: String,
    thread_label: String,
    remote_user: Option<String>,
    elapsed: Duration,
    child_hits: u64,
    child_durations_sum: Millis,
    children: Vec<ContextSnapshot>,
}

impl ContextSnapshot {
    /// Name of the registry the execution will be recorded in.
    #[must_use]
    pub fn registry_name(&self) -> &str {
        &self.registry_name
    }

    /// Name of the request being executed.
    #[must_use]
    pub fn request_name(&self) -> &str {
        &self.request_name
    }

    /// Label of the call stack (usually a thread) running the execution.
    #[must_use]
    pub fn thread_label(&self) -> &str {
        &self.thread_label
    }

    /// Remote user on whose behalf the execution runs, if known.
    #[must_use]
    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    /// How long the execution had been running when the snapshot was taken.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Child executions completed so far inside this execution.
    #[must_use]
    pub fn child_hits(&self) -> u64 {
        self.child_hits
    }

    /// Total duration of child executions completed so far inside this execution.
    #[must_use]
    pub fn child_durations_sum(&self) -> Millis {
        self.child_durations_sum
    }

    /// Child executions still in progress.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        &self.children
    }
}

impl Registry {
    /// Begins a traced execution of the named request on the given call stack.
    ///
    /// If another execution is open on the stack, the new one becomes its child. Otherwise it
    /// is a root execution and is visible through [`Registry::current_root_contexts()`] until
    /// it ends.
    pub fn begin(&self, stack: &mut CallStack, request_name: impl Into<String>) -> ContextHandle {
        stack.drop_closed_frames();

        let platform = self.platform();
        let parent = stack.frames.last().map(Arc::clone);

        let context = Arc::new(ExecutionContext {
            key: NEXT_CONTEXT_KEY.fetch_add(1, Ordering::Relaxed),
            registry: self.clone(),
            request_name: request_name.into(),
            thread_label: Arc::clone(&stack.label),
            remote_user: stack.remote_user.as_ref().map(Arc::clone),
            started_at: platform.now(),
            cpu_started_at: platform.thread_processor_time(),
            parent: parent.as_ref().map(Arc::downgrade),
            children: Mutex::new(Vec::new()),
            child_hits: AtomicU64::new(0),
            child_durations_sum: AtomicI64::new(0),
            child_executions_by_id: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        });

        match &parent {
            Some(parent) => parent.children.lock().push(Arc::clone(&context)),
            None => self.register_root_context(context.key, Arc::clone(&context)),
        }

        stack.frames.push(Arc::clone(&context));

        trace!(
            registry = self.name(),
            request = %context.request_name,
            depth = stack.frames.len(),
            "execution begun"
        );

        ContextHandle {
            context,
            ended: false,
        }
    }

    /// Ends a traced execution, records it and returns its duration.
    ///
    /// The execution is recorded in the registry that began it. If its parent execution
    /// belongs to the same registry or to a registry that designates this one as its child,
    /// the execution is also attributed to the parent request as a child hit.
    ///
    /// Ending executions out of order is a bug in the instrumentation. It is tolerated: the
    /// execution is still recorded and executions begun after it that were never ended are
    /// discarded.
    pub fn end(
        &self,
        stack: &mut CallStack,
        mut handle: ContextHandle,
        outcome: &Outcome,
    ) -> Duration {
        handle.ended = true;
        let context = Arc::clone(&handle.context);
        let registry = &context.registry;

        debug_assert!(
            self.ptr_eq(registry),
            "execution ended through a registry that did not begin it"
        );

        let innermost = stack.remove(&context);

        if !innermost {
            warn!(
                registry = registry.name(),
                request = %context.request_name,
                "execution ended out of order"
            );
        }

        debug_assert!(innermost, "execution ended out of order");

        let platform = registry.platform();
        let duration = platform.now().saturating_duration_since(context.started_at);

        let cpu_time = outcome.cpu_time.or_else(|| {
            let started = context.cpu_started_at?;
            let finished = platform.thread_processor_time()?;
            Some(finished.saturating_sub(started))
        });

        let duration_millis = duration_to_millis(duration);
        let id = request_id(registry.name(), &context.request_name);

        let execution = CompletedExecution {
            duration: duration_millis,
            cpu_time: cpu_time.map(duration_to_millis),
            system_error: outcome.system_error,
            response_size: outcome.response_size,
            child_hits: context.child_hits.load(Ordering::Relaxed),
            child_durations_sum: context.child_durations_sum.load(Ordering::Relaxed),
            child_executions_by_id: mem::take(&mut *context.child_executions_by_id.lock()),
        };

        context.detach();

        if let Some(parent) = context.parent.as_ref().and_then(Weak::upgrade) {
            if parent.registry.attributes_children_of(registry) {
                parent.add_child_execution(id.clone(), duration_millis);
            }
        }

        registry.fold(id, &context.request_name, &execution);

        trace!(
            registry = registry.name(),
            request = %context.request_name,
            duration_ms = duration_millis,
            "execution ended"
        );

        duration
    }
}
