//! Point-in-time serialization of a scheduler.
//!
//! Callers that checkpoint persist a [`Snapshot`] between ticks and rebuild
//! an equivalent scheduler from it. The encoding is whatever serde
//! produces; stability of the format across versions is not promised.

use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::state::State;

/// Everything needed to reconstruct an equivalent scheduler: the mutable
/// state (balances, queued requests, workers with their running tasks) and
/// the configuration (account policies, global flags).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: State,
    pub config: SchedulerConfig,
}
