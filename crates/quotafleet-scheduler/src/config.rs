//! Per-instance scheduler configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use quotafleet_core::{AccountConfig, AccountId, UnixMillis};

use crate::fanout::FanoutGrouping;

/// Tunables and account policies for one scheduler instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Quota policy per account.
    pub accounts: HashMap<AccountId, AccountConfig>,
    /// Kill-switch: when set, passes never preempt running tasks.
    pub disable_preemption: bool,
    /// Idle workers left unconfirmed for longer than this stop matching.
    /// `None` means idle workers never expire.
    pub worker_expiration_ms: Option<UnixMillis>,
    /// How requests are grouped for `max_fanout` enforcement.
    pub fanout_grouping: FanoutGrouping,
}
