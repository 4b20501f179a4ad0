//! Per-group burst throttling.
//!
//! `max_fanout` bounds how many paid jobs a fanout group may run at once.
//! Requests beyond the allowance fall back to the free bucket for the tick
//! while keeping their FIFO position.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::state::TaskRequest;

/// How requests are partitioned for `max_fanout` enforcement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutGrouping {
    /// One group per account.
    PerAccount,
    /// One group per account and distinct provisionable-label combination.
    #[default]
    AccountAndProvisionableLabels,
}

impl FanoutGrouping {
    /// Grouping key for a request, or `None` for accountless requests,
    /// which are never throttled.
    fn key_for(self, request: &TaskRequest) -> Option<String> {
        if request.account_id.is_empty() {
            return None;
        }
        match self {
            Self::PerAccount => Some(request.account_id.clone()),
            Self::AccountAndProvisionableLabels => {
                let mut key = request.account_id.clone();
                for label in &request.provisionable_labels {
                    // Unit separator: effectively impossible in ids/labels.
                    key.push('\u{1f}');
                    key.push_str(label);
                }
                Some(key)
            }
        }
    }
}

/// Tracks how many more paid jobs each fanout group may start before it is
/// throttled. Groups are initialized lazily on first touch.
pub(crate) struct FanoutCounter<'a> {
    remaining: HashMap<String, i64>,
    config: &'a SchedulerConfig,
}

impl<'a> FanoutCounter<'a> {
    pub(crate) fn new(config: &'a SchedulerConfig) -> Self {
        Self {
            remaining: HashMap::new(),
            config,
        }
    }

    fn limit_for(&self, request: &TaskRequest) -> i64 {
        match self.config.accounts.get(&request.account_id) {
            Some(account) if account.max_fanout > 0 => i64::from(account.max_fanout),
            // max_fanout of 0, and accounts we know nothing about,
            // mean unlimited.
            _ => i64::MAX,
        }
    }

    /// Charge one running or newly assigned job against the request's group.
    pub(crate) fn count(&mut self, request: &TaskRequest) {
        let Some(key) = self.config.fanout_grouping.key_for(request) else {
            return;
        };
        let limit = self.limit_for(request);
        *self.remaining.entry(key).or_insert(limit) -= 1;
    }

    /// Remaining allowance for the request's group.
    pub(crate) fn remaining(&mut self, request: &TaskRequest) -> i64 {
        match self.config.fanout_grouping.key_for(request) {
            None => i64::MAX,
            Some(key) => {
                let limit = self.limit_for(request);
                *self.remaining.entry(key).or_insert(limit)
            }
        }
    }

    /// Whether the request's group has exhausted its allowance.
    pub(crate) fn is_throttled(&mut self, request: &TaskRequest) -> bool {
        self.remaining(request) <= 0
    }
}
