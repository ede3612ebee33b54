use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many error records an error registry keeps. Older records are discarded first.
pub const MAX_ERROR_RECORDS: usize = 100;

/// One system error captured by an error registry, kept for diagnostic display.
///
/// Unlike request statistics, error records are not aggregated: the registry keeps the most
/// recent [`MAX_ERROR_RECORDS`] of them verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    time: DateTime<Utc>,
    message: String,
    remote_user: Option<String>,
    request: Option<String>,
    stack_trace: Option<String>,
}

impl ErrorRecord {
    /// Creates a record of an error that happened at the given time.
    #[must_use]
    pub fn new(time: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            time,
            message: message.into(),
            remote_user: None,
            request: None,
            stack_trace: None,
        }
    }

    /// Attaches the identity of the remote user on whose behalf the failing call ran.
    #[must_use]
    pub fn with_remote_user(mut self, remote_user: impl Into<String>) -> Self {
        self.remote_user = Some(remote_user.into());
        self
    }

    /// Attaches the name of the request during which the error happened.
    #[must_use]
    pub fn with_request(mut self, request: impl Into<String>) -> Self {
        self.request = Some(request.into());
        self
    }

    /// Attaches a captured stack trace or other multi-line diagnostic.
    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// When the error happened.
    #[must_use]
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The remote user on whose behalf the failing call ran, if known.
    #[must_use]
    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    /// The request during which the error happened, if known.
    #[must_use]
    pub fn request(&self) -> Option<&str> {
        self.request.as_deref()
    }

    /// The captured stack trace, if any.
    #[must_use]
    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }
}

impl Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.time.format("%Y-%m-%d %H:%M:%S"), self.message)?;

        if let Some(request) = &self.request {
            write!(f, " [{request}]")?;
        }

        if let Some(remote_user) = &self.remote_user {
            write!(f, " ({remote_user})")?;
        }

        Ok(())
    }
}

/// Appends records to a bounded error list, discarding the oldest beyond [`MAX_ERROR_RECORDS`].
pub(crate) fn push_bounded(
    errors: &mut Vec<ErrorRecord>,
    records: impl IntoIterator<Item = ErrorRecord>,
) {
    errors.extend(records);

    let excess = errors.len().saturating_sub(MAX_ERROR_RECORDS);
    errors.drain(..excess);
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, second).unwrap()
    }

    #[test]
    fn display_includes_context() {
        let record = ErrorRecord::new(at(5), "connection reset")
            .with_request("/checkout POST")
            .with_remote_user("alice");

        assert_eq!(
            record.to_string(),
            "2024-01-02 03:04:05 connection reset [/checkout POST] (alice)"
        );
    }

    #[test]
    fn bounded_list_keeps_newest() {
        let mut errors = Vec::new();

        push_bounded(
            &mut errors,
            (0..MAX_ERROR_RECORDS + 5).map(|i| ErrorRecord::new(at(0), format!("e{i}"))),
        );

        assert_eq!(errors.len(), MAX_ERROR_RECORDS);
        assert_eq!(errors.first().unwrap().message(), "e5");
        assert_eq!(
            errors.last().unwrap().message(),
            format!("e{}", MAX_ERROR_RECORDS + 4)
        );
    }
}
