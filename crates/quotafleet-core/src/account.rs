//! Quota account policy and the ledger-advance math.

use serde::{Deserialize, Serialize};

use crate::balance::Balance;
use crate::types::NUM_PRIORITIES;

/// Balance above which an account's running jobs become candidates for
/// promotion into a tier.
pub const PROMOTE_THRESHOLD: f64 = 5.0;

/// Balance below which an account's running jobs become candidates for
/// demotion out of a tier.
pub const DEMOTE_THRESHOLD: f64 = -5.0;

/// Per-account quota policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Quota accrued per second, per tier.
    pub charge_rate: Balance,
    /// Caps each tier's balance at `charge_rate[tier] * max_charge_seconds`.
    pub max_charge_seconds: f64,
    /// Maximum concurrently running paid jobs per fanout group.
    /// 0 means unlimited.
    pub max_fanout: u32,
    /// If true, this account's jobs never run in the free bucket.
    pub disable_free_tasks: bool,
}

impl AccountConfig {
    /// Policy with the given recharge rate and cap window, unlimited fanout,
    /// free tasks allowed.
    pub fn new(charge_rate: Balance, max_charge_seconds: f64) -> Self {
        Self {
            charge_rate,
            max_charge_seconds,
            max_fanout: 0,
            disable_free_tasks: false,
        }
    }

    /// Limit the number of concurrently running paid jobs per fanout group.
    pub fn with_max_fanout(mut self, max_fanout: u32) -> Self {
        self.max_fanout = max_fanout;
        self
    }

    /// Keep this account's jobs out of the free bucket.
    pub fn without_free_tasks(mut self) -> Self {
        self.disable_free_tasks = true;
        self
    }

    /// Advance `balance` by `elapsed_secs` of logical time.
    ///
    /// Each tier first pays for its running jobs, then recharges toward its
    /// cap. A tier already at or above cap after the spend (a preemption
    /// refund) is neither recharged nor reduced: refunds drain through
    /// spend, never by clawback.
    pub fn advance(
        &self,
        balance: &mut Balance,
        elapsed_secs: f64,
        running_per_tier: &[usize; NUM_PRIORITIES],
    ) {
        for tier in 0..NUM_PRIORITIES {
            let mut value = balance[tier] - elapsed_secs * running_per_tier[tier] as f64;
            let cap = self.charge_rate[tier] * self.max_charge_seconds;
            if value < cap {
                value = (value + elapsed_secs * self.charge_rate[tier]).min(cap);
            }
            balance[tier] = value;
        }
    }
}
