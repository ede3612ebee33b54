use std::time::Duration;

/// How an instrumented execution ended, supplied when the execution is recorded.
///
/// The default outcome is a success with no response size and with processor time measured
/// automatically where the platform supports it.
///
/// # Example
///
/// ```
/// use tally::Outcome;
///
/// let ok = Outcome::success().with_response_size(512);
/// let failed = Outcome::system_error();
///
/// assert!(!ok.is_system_error());
/// assert!(failed.is_system_error());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub(crate) system_error: bool,
    pub(crate) response_size: Option<i64>,
    pub(crate) cpu_time: Option<Duration>,
}

impl Outcome {
    /// The execution completed normally, or failed in a recoverable (functional) way.
    #[must_use]
    pub const fn success() -> Self {
        Self {
            system_error: false,
            response_size: None,
            cpu_time: None,
        }
    }

    /// The execution failed with an unrecoverable, system-level fault.
    #[must_use]
    pub const fn system_error() -> Self {
        Self {
            system_error: true,
            response_size: None,
            cpu_time: None,
        }
    }

    /// Records the size of the response produced by the execution, in bytes.
    #[must_use]
    pub fn with_response_size(self, bytes: u64) -> Self {
        Self {
            response_size: Some(i64::try_from(bytes).unwrap_or(i64::MAX)),
            ..self
        }
    }

    /// Overrides the processor time of the execution instead of measuring it.
    #[must_use]
    pub fn with_cpu_time(self, cpu_time: Duration) -> Self {
        Self {
            cpu_time: Some(cpu_time),
            ..self
        }
    }

    /// Whether the execution ended with a system error.
    #[must_use]
    pub fn is_system_error(&self) -> bool {
        self.system_error
    }
}
