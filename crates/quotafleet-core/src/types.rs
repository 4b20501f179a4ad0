//! Identifier aliases, label sets, priority tiers, and logical time.

use std::collections::BTreeSet;

/// Unique identifier for a quota account.
pub type AccountId = String;

/// Unique identifier for a worker in the fleet.
pub type WorkerId = String;

/// Unique identifier for a task request.
pub type RequestId = String;

/// Logical time in Unix milliseconds.
///
/// The scheduler never reads a wall clock; callers advance time explicitly,
/// which keeps every pass replayable.
pub type UnixMillis = u64;

/// A set of capability labels. A `BTreeSet` keeps iteration order stable so
/// derived keys and candidate orderings are deterministic.
pub type LabelSet = BTreeSet<String>;

/// Priority tier index. Lower is higher priority.
pub type Priority = usize;

/// Number of paid priority tiers.
pub const NUM_PRIORITIES: usize = 5;

/// Sentinel tier for jobs running on spare capacity. Jobs here consume no
/// quota and accrue no cost.
pub const FREE_BUCKET: Priority = NUM_PRIORITIES;

/// Seconds elapsed between two logical timestamps.
pub fn elapsed_seconds(from: UnixMillis, to: UnixMillis) -> f64 {
    to.saturating_sub(from) as f64 / 1000.0
}
