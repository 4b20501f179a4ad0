//! The scheduler facade: the entry points collaborators drive.

use std::collections::HashMap;

use quotafleet_core::{
    AccountConfig, AccountId, Balance, LabelSet, NUM_PRIORITIES, UnixMillis, WorkerId,
    elapsed_seconds,
};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::pass::Pass;
use crate::snapshot::Snapshot;
use crate::state::{Assignment, State, TaskRequest};

/// A quota scheduler for a single worker pool.
///
/// Owns one `State`/`SchedulerConfig` pair. Instances are independent and
/// cheap to construct; the core is single-threaded and synchronous, so
/// callers serialize access themselves. Time is a logical input:
/// [`Scheduler::update_time`] is the only way balances advance, which makes
/// every sequence of operations replayable.
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduler {
    pub(crate) state: State,
    pub(crate) config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(now: UnixMillis) -> Self {
        Self {
            state: State::new(now),
            config: SchedulerConfig::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Instance-level tunables (preemption kill-switch, worker expiration,
    /// fanout grouping).
    pub fn config_mut(&mut self) -> &mut SchedulerConfig {
        &mut self.config
    }

    /// Register an account with its policy and optional starting balance.
    /// Conflicts if the account already exists.
    pub fn add_account(
        &mut self,
        id: impl Into<AccountId>,
        account: AccountConfig,
        initial_balance: Option<Balance>,
    ) -> SchedulerResult<()> {
        let id = id.into();
        if self.config.accounts.contains_key(&id) {
            return Err(SchedulerError::AccountExists(id));
        }
        self.state
            .balances
            .insert(id.clone(), initial_balance.unwrap_or_default());
        self.config.accounts.insert(id, account);
        Ok(())
    }

    /// Remove an account's policy and balance. Tasks of the removed account
    /// keep running at their current tier, but accrued cost is no longer
    /// refunded if they are preempted.
    pub fn remove_account(&mut self, id: &str) {
        self.config.accounts.remove(id);
        self.state.balances.remove(id);
    }

    /// Enqueue a new request. Conflicts if the id is already known.
    pub fn add_request(&mut self, request: TaskRequest, now: UnixMillis) -> SchedulerResult<()> {
        self.state.add_request(request, now)
    }

    /// Register a worker as idle with the given labels, or confirm an
    /// existing idle worker's timestamp.
    pub fn mark_idle(&mut self, worker_id: &str, labels: LabelSet, now: UnixMillis) {
        self.state.mark_idle(worker_id, labels, now);
    }

    /// Reconciliation hook: the caller asserts the request is running on
    /// the worker. Stale disagreeing records are deleted without refunding
    /// or charging any account.
    pub fn notify_task_running(&mut self, request_id: &str, worker_id: &str, now: UnixMillis) {
        self.state.notify_task_running(request_id, worker_id, now);
    }

    /// Reconciliation hook: the caller asserts the request is finished.
    pub fn notify_task_absent(&mut self, request_id: &str, now: UnixMillis) {
        self.state.notify_task_absent(request_id, now);
    }

    /// Remove a worker from the fleet, re-enqueueing any task it was
    /// running.
    pub fn remove_worker(&mut self, worker_id: &str) {
        self.state.remove_worker(worker_id);
    }

    /// Advance logical time: charge accounts for their running jobs, accrue
    /// cost on running tasks, and recharge balances toward their caps.
    /// Balances of unconfigured accounts lapse.
    pub fn update_time(&mut self, now: UnixMillis) -> SchedulerResult<()> {
        let state = &mut self.state;
        if now < state.last_update_ms {
            return Err(SchedulerError::TimeReversal {
                now_ms: now,
                state_ms: state.last_update_ms,
            });
        }
        let elapsed = elapsed_seconds(state.last_update_ms, now);

        // Count running paid jobs per account per tier, accruing cost as we
        // go. Free-bucket jobs consume no quota and accrue none.
        let mut running: HashMap<AccountId, [usize; NUM_PRIORITIES]> = HashMap::new();
        for worker in state.workers.values_mut() {
            if let Some(run) = worker.running.as_mut() {
                if run.priority < NUM_PRIORITIES {
                    running.entry(run.request.account_id.clone()).or_default()[run.priority] += 1;
                    run.cost[run.priority] += elapsed;
                }
            }
        }

        let none_running = [0usize; NUM_PRIORITIES];
        let mut balances = HashMap::with_capacity(self.config.accounts.len());
        for (id, account) in &self.config.accounts {
            let mut balance = state.balances.get(id).copied().unwrap_or_default();
            account.advance(&mut balance, elapsed, running.get(id).unwrap_or(&none_running));
            balances.insert(id.clone(), balance);
        }
        state.balances = balances;
        state.last_update_ms = now;
        Ok(())
    }

    /// Execute one full scheduling pass and return the assignments for the
    /// caller to enact, in decision order.
    pub fn run_once(&mut self, now: UnixMillis) -> SchedulerResult<Vec<Assignment>> {
        Pass::new(&self.config, &mut self.state, now).run()
    }

    /// Whether the request is currently running on the given worker.
    pub fn is_assigned(&self, request_id: &str, worker_id: &str) -> bool {
        self.state
            .workers
            .get(worker_id)
            .and_then(|worker| worker.running.as_ref())
            .is_some_and(|run| run.request.id == request_id)
    }

    /// Look up a queued (not yet running) request.
    pub fn get_request(&self, request_id: &str) -> Option<&TaskRequest> {
        self.state.queued.get(request_id)
    }

    /// Point-in-time copy of the whole scheduler for checkpointing.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state.clone(),
            config: self.config.clone(),
        }
    }

    /// Rebuild an equivalent scheduler from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            state: snapshot.state,
            config: snapshot.config,
        }
    }

    /// The worker currently running the request, if any.
    pub fn running_on(&self, request_id: &str) -> Option<&WorkerId> {
        self.state.worker_running(request_id).map(|worker| &worker.id)
    }
}
