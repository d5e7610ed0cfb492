//! Failure taxonomy for workflow execution.
//!
//! Every failure that crosses a phase or queue boundary is classified into
//! one of four kinds, which drive retry behavior:
//! - rate-limit: always retried after the long fixed delay, up to the ceiling
//! - transient: exponential backoff up to the ceiling
//! - validation: surfaced immediately with guidance, never retried blindly
//! - lifecycle: clean abort, not an error at all

use std::fmt;
use std::time::Duration;

/// The backend signalled capacity exhaustion for this credential.
#[derive(Debug, Clone)]
pub struct RateLimited {
    pub message: String,
}

impl RateLimited {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rate limited: {}", self.message)
    }
}

impl std::error::Error for RateLimited {}

/// Input or output failed validation; retrying the same call will not help.
///
/// `guidance` is user-facing text explaining what to change.
#[derive(Debug, Clone)]
pub struct ValidationFailed {
    pub message: String,
    pub guidance: Option<String>,
}

impl ValidationFailed {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            guidance: None,
        }
    }

    pub fn with_guidance(message: impl Into<String>, guidance: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            guidance: Some(guidance.into()),
        }
    }
}

impl fmt::Display for ValidationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed: {}", self.message)
    }
}

impl std::error::Error for ValidationFailed {}

/// The owning task was deleted, completed, or cancelled while the workflow
/// was running. Not a failure: the run aborts cleanly with no retry and no
/// failure notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAbort {
    TaskDeleted,
    TaskCompleted,
    TaskCancelled,
}

impl LifecycleAbort {
    pub fn reason(&self) -> &'static str {
        match self {
            LifecycleAbort::TaskDeleted => "task deleted",
            LifecycleAbort::TaskCompleted => "task already completed",
            LifecycleAbort::TaskCancelled => "task cancelled",
        }
    }
}

impl fmt::Display for LifecycleAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workflow aborted: {}", self.reason())
    }
}

impl std::error::Error for LifecycleAbort {}

/// Classification of a boundary failure, driving retry semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimit,
    Transient,
    Validation,
    Lifecycle,
}

/// Classifies an error that reached a phase or queue boundary.
///
/// Typed errors are recognized by downcast; backend errors that arrive as
/// plain text are sniffed for rate-limit signatures. Everything else is
/// transient.
pub fn classify_failure(err: &anyhow::Error) -> FailureKind {
    if err.downcast_ref::<LifecycleAbort>().is_some() {
        return FailureKind::Lifecycle;
    }
    if err.downcast_ref::<RateLimited>().is_some() {
        return FailureKind::RateLimit;
    }
    if err.downcast_ref::<ValidationFailed>().is_some() {
        return FailureKind::Validation;
    }
    if is_rate_limit_signature(&format!("{:#}", err)) {
        return FailureKind::RateLimit;
    }
    FailureKind::Transient
}

/// Returns true if an error message looks like a backend capacity signal.
pub fn is_rate_limit_signature(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("429")
        || lower.contains("overloaded")
        || lower.contains("quota exceeded")
}

/// Exponential backoff delay for non-rate-limit retries: `base * 2^(attempt-1)`.
///
/// `attempt` is 1-based; attempt 1 waits exactly `base`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}
