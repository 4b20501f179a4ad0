//! Scheduler error types.

use quotafleet_core::{AccountId, RequestId, UnixMillis};
use thiserror::Error;

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur during scheduler operations.
///
/// `Inconsistency` is the distinguished internal-consistency class: it means
/// the caller's view and the scheduler's state have diverged in a way that
/// would corrupt the accounting invariants. Callers must treat it as fatal
/// to the operation (log, drop the tick, alert) rather than retry.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("request already exists: {0}")]
    RequestExists(RequestId),

    #[error("account already exists: {0}")]
    AccountExists(AccountId),

    #[error("empty request id")]
    EmptyRequestId,

    #[error("update time {now_ms}ms precedes state time {state_ms}ms")]
    TimeReversal { now_ms: UnixMillis, state_ms: UnixMillis },

    #[error("internal consistency violation: {0}")]
    Inconsistency(String),
}
