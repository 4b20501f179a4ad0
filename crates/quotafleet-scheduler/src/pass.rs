//! One tick of the scheduling algorithm.
//!
//! A pass walks the priority tiers from highest to lowest. At each tier it
//! matches idle workers to queued requests (provision-aware first, then base
//! labels only), promotes or demotes running tasks against their account's
//! balance trend, preempts cheaper lower-priority tasks, and finally gives
//! requests throttled mid-pass one more chance in the free bucket.
//!
//! Candidate collections come out of unordered maps, so every
//! order-dependent step sorts by a stable key (worker id, cost then worker
//! id, account id) before acting. Given the same state, a pass always
//! produces the same assignments.

use std::collections::HashSet;

use tracing::{debug, info};

use quotafleet_core::{
    AccountId, Balance, DEMOTE_THRESHOLD, FREE_BUCKET, LabelSet, NUM_PRIORITIES, PROMOTE_THRESHOLD,
    Priority, UnixMillis, WorkerId,
};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::fanout::FanoutCounter;
use crate::matching::{Match, compute_match};
use crate::state::{Assignment, AssignmentKind, State, TaskRequest, Worker};

/// A queued request's matching attributes for the duration of one pass.
struct PassRequest {
    request: TaskRequest,
    matched: bool,
    /// The account disables free tasks, so this request must not be
    /// scheduled from the free bucket.
    skip_if_free: bool,
}

/// Working set for a single scheduling tick. Mutated as assignments land.
pub(crate) struct Pass<'a> {
    config: &'a SchedulerConfig,
    state: &'a mut State,
    now: UnixMillis,
    /// Eligible idle workers, sorted by id.
    idle: Vec<WorkerId>,
    requests: Vec<PassRequest>,
    /// Per-tier FIFO lists of indices into `requests`; the last entry is
    /// the free bucket.
    tiers: Vec<Vec<usize>>,
    /// Allowance left per fanout group. Seeded from running tasks, spent by
    /// new assignments.
    fanout: FanoutCounter<'a>,
}

impl<'a> Pass<'a> {
    pub(crate) fn new(config: &'a SchedulerConfig, state: &'a mut State, now: UnixMillis) -> Self {
        let mut fanout = FanoutCounter::new(config);
        let mut idle = Vec::new();
        for worker in state.workers.values() {
            match &worker.running {
                Some(run) => fanout.count(&run.request),
                None if worker_eligible(config, worker, now) => idle.push(worker.id.clone()),
                None => {
                    debug!(worker = %worker.id, "idle worker expired, skipping for this pass");
                }
            }
        }
        idle.sort();

        // FIFO by enqueue time is the definitive tie-break; request id only
        // disambiguates simultaneous arrivals.
        let mut queued: Vec<&TaskRequest> = state.queued.values().collect();
        queued.sort_by(|a, b| (a.enqueue_ms, &a.id).cmp(&(b.enqueue_ms, &b.id)));

        let mut requests = Vec::with_capacity(queued.len());
        let mut tiers = vec![Vec::new(); NUM_PRIORITIES + 1];
        for request in queued {
            let priority = if fanout.is_throttled(request) {
                FREE_BUCKET
            } else {
                state
                    .balances
                    .get(&request.account_id)
                    .map_or(FREE_BUCKET, Balance::best_priority)
            };
            let skip_if_free = config
                .accounts
                .get(&request.account_id)
                .is_some_and(|account| account.disable_free_tasks);
            if priority == FREE_BUCKET && skip_if_free {
                // Zero chance of matching this tick; not worth considering.
                continue;
            }
            tiers[priority].push(requests.len());
            requests.push(PassRequest {
                request: request.clone(),
                matched: false,
                skip_if_free,
            });
        }

        Self {
            config,
            state,
            now,
            idle,
            requests,
            tiers,
            fanout,
        }
    }

    /// Run the full pass and return the assignments in decision order.
    pub(crate) fn run(mut self) -> SchedulerResult<Vec<Assignment>> {
        let mut output = Vec::new();
        for priority in 0..NUM_PRIORITIES {
            self.match_idle_workers(priority, true, &mut output)?;
            self.match_idle_workers(priority, false, &mut output)?;
            self.reprioritize(priority)?;
            if !self.config.disable_preemption {
                self.preempt(priority, &mut output)?;
            }
            self.carry_forward_throttled(priority);
        }

        // The final free-bucket pass only matches idle workers; nothing is
        // reprioritized or preempted at the lowest tier.
        self.match_idle_workers(FREE_BUCKET, true, &mut output)?;
        self.match_idle_workers(FREE_BUCKET, false, &mut output)?;
        Ok(output)
    }

    /// Steps 1 and 2: match idle workers to the tier's queue.
    fn match_idle_workers(
        &mut self,
        priority: Priority,
        require_provision_match: bool,
        output: &mut Vec<Assignment>,
    ) -> SchedulerResult<()> {
        for worker_id in self.idle.clone() {
            let Some(labels) = self.state.workers.get(&worker_id).map(|w| w.labels.clone())
            else {
                continue;
            };
            let Some(idx) = self.pick_request(&labels, priority, require_provision_match) else {
                continue;
            };

            let assignment = Assignment {
                kind: AssignmentKind::IdleWorker,
                worker_id: worker_id.clone(),
                request_id: self.requests[idx].request.id.clone(),
                task_to_abort: None,
                priority,
                at_ms: self.now,
            };
            self.state.apply_assignment(&assignment)?;
            self.note_assigned(idx);
            self.idle.retain(|id| *id != worker_id);
            debug!(
                worker = %assignment.worker_id,
                request = %assignment.request_id,
                priority,
                "assigned request to idle worker"
            );
            output.push(assignment);
        }
        Ok(())
    }

    /// The best matchable request at `priority` for a worker with these
    /// labels, honoring throttling and the free-bucket policy.
    fn pick_request(
        &mut self,
        worker_labels: &LabelSet,
        priority: Priority,
        require_provision_match: bool,
    ) -> Option<usize> {
        for (idx, m) in self.matches_at(worker_labels, priority) {
            if require_provision_match && !m.provision_match {
                continue;
            }
            if self.should_skip(idx, priority) {
                continue;
            }
            return Some(idx);
        }
        None
    }

    /// Matchable tier-`priority` requests for a worker, best quality first.
    /// The sort is stable, so FIFO order decides among equal qualities.
    fn matches_at(&self, worker_labels: &LabelSet, priority: Priority) -> Vec<(usize, Match)> {
        let mut matches: Vec<(usize, Match)> = self.tiers[priority]
            .iter()
            .filter_map(|&idx| {
                let item = &self.requests[idx];
                if item.matched {
                    return None;
                }
                compute_match(worker_labels, &item.request).map(|m| (idx, m))
            })
            .collect();
        matches.sort_by(|a, b| b.1.quality.cmp(&a.1.quality));
        matches
    }

    fn should_skip(&mut self, idx: usize, priority: Priority) -> bool {
        if priority != FREE_BUCKET {
            self.fanout.is_throttled(&self.requests[idx].request)
        } else {
            self.requests[idx].skip_if_free
        }
    }

    /// Bookkeeping shared by idle matches and preemptions.
    fn note_assigned(&mut self, idx: usize) {
        self.fanout.count(&self.requests[idx].request);
        self.requests[idx].matched = true;
    }

    /// Step 3: promote running tasks into this tier or demote them out of
    /// it, following each account's balance trend.
    fn reprioritize(&mut self, priority: Priority) -> SchedulerResult<()> {
        let mut account_ids: Vec<AccountId> = self.state.balances.keys().cloned().collect();
        account_ids.sort();

        for account_id in account_ids {
            let balance = self.state.balances[&account_id];
            let Some(account) = self.config.accounts.get(&account_id) else {
                return Err(SchedulerError::Inconsistency(format!(
                    "balance exists for unconfigured account {account_id}"
                )));
            };
            let value = balance[priority];
            let demote = value < DEMOTE_THRESHOLD;
            let promote = value > PROMOTE_THRESHOLD;
            if !demote && !promote {
                continue;
            }

            let running_at = self.running_for(&account_id, |p| p == priority);
            let net_rate = account.charge_rate[priority] - running_at.len() as f64;

            if demote && net_rate < 0.0 {
                self.demote(running_at, net_rate, priority);
            } else if promote && net_rate > 0.0 {
                let running_below = self.running_for(&account_id, |p| p > priority);
                self.promote(running_below, net_rate, priority);
            }
        }
        Ok(())
    }

    /// The account's running tasks on tiers accepted by `tier_matches`, as
    /// (cost, worker id) sorted ascending for deterministic selection.
    fn running_for(
        &self,
        account_id: &str,
        tier_matches: impl Fn(Priority) -> bool,
    ) -> Vec<(Balance, WorkerId)> {
        let mut found: Vec<(Balance, WorkerId)> = self
            .state
            .workers
            .values()
            .filter_map(|worker| {
                let run = worker.running.as_ref()?;
                (run.request.account_id == account_id && tier_matches(run.priority))
                    .then(|| (run.cost, worker.id.clone()))
            })
            .collect();
        found.sort_by(|a, b| a.0.lex_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        found
    }

    /// Demote `ceil(-net_rate)` of the account's tier-`priority` tasks one
    /// tier down, shedding the most expensive obligations first.
    fn demote(&mut self, candidates: Vec<(Balance, WorkerId)>, net_rate: f64, priority: Priority) {
        let count = candidates.len().min((-net_rate).ceil() as usize);
        for (_, worker_id) in candidates.into_iter().rev().take(count) {
            self.set_priority(&worker_id, priority + 1, "demoting running task");
        }
    }

    /// Promote `ceil(net_rate)` of the account's below-tier tasks up to
    /// `priority`, cheapest first since they carry the least quota risk.
    fn promote(&mut self, candidates: Vec<(Balance, WorkerId)>, net_rate: f64, priority: Priority) {
        let count = candidates.len().min(net_rate.ceil() as usize);
        for (_, worker_id) in candidates.into_iter().take(count) {
            self.set_priority(&worker_id, priority, "promoting running task");
        }
    }

    fn set_priority(&mut self, worker_id: &str, priority: Priority, action: &'static str) {
        if let Some(run) = self
            .state
            .workers
            .get_mut(worker_id)
            .and_then(|worker| worker.running.as_mut())
        {
            debug!(
                worker = %worker_id,
                request = %run.request.id,
                from = run.priority,
                to = priority,
                "{action}"
            );
            run.priority = priority;
        }
    }

    /// Step 4: replace cheaper lower-priority running tasks with tier-
    /// `priority` requests, reimbursing the victim's account.
    fn preempt(&mut self, priority: Priority, output: &mut Vec<Assignment>) -> SchedulerResult<()> {
        let mut candidates: Vec<(Balance, WorkerId)> = Vec::new();
        // An account already running below this tier may not preempt into
        // it; otherwise an account denied promotion could thrash its way up
        // through preemption instead.
        let mut banned: HashSet<AccountId> = HashSet::new();
        for worker in self.state.workers.values() {
            if let Some(run) = &worker.running {
                if run.priority > priority {
                    candidates.push((run.cost, worker.id.clone()));
                    banned.insert(run.request.account_id.clone());
                }
            }
        }
        // Cheapest victims first.
        candidates.sort_by(|a, b| a.0.lex_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (victim_cost, worker_id) in candidates {
            let Some(worker) = self.state.workers.get(&worker_id) else {
                continue;
            };
            let labels = worker.labels.clone();
            let Some(victim_id) = worker.running.as_ref().map(|run| run.request.id.clone())
            else {
                continue;
            };
            let Some(idx) = self.pick_preemptor(&labels, priority, &banned, &victim_cost) else {
                continue;
            };

            let assignment = Assignment {
                kind: AssignmentKind::Preempt,
                worker_id: worker_id.clone(),
                request_id: self.requests[idx].request.id.clone(),
                task_to_abort: Some(victim_id),
                priority,
                at_ms: self.now,
            };
            self.state.apply_assignment(&assignment)?;
            self.note_assigned(idx);
            info!(
                worker = %assignment.worker_id,
                request = %assignment.request_id,
                aborted = assignment.task_to_abort.as_deref().unwrap_or_default(),
                priority,
                "preempted running task"
            );
            output.push(assignment);
        }
        Ok(())
    }

    /// The best tier-`priority` request allowed to preempt this victim:
    /// unmatched, base-label match, non-banned account, non-throttled, and
    /// a balance that is not less than the victim's accrued cost.
    fn pick_preemptor(
        &mut self,
        worker_labels: &LabelSet,
        priority: Priority,
        banned: &HashSet<AccountId>,
        victim_cost: &Balance,
    ) -> Option<usize> {
        for (idx, _) in self.matches_at(worker_labels, priority) {
            if banned.contains(&self.requests[idx].request.account_id) {
                continue;
            }
            if self.fanout.is_throttled(&self.requests[idx].request) {
                continue;
            }
            let balance = self
                .state
                .balances
                .get(&self.requests[idx].request.account_id)
                .copied()
                .unwrap_or_default();
            if balance.lex_less(victim_cost) {
                continue;
            }
            return Some(idx);
        }
        None
    }

    /// Step 5: requests whose group ran out of allowance during this tier
    /// get one more chance at the final free-bucket pass.
    fn carry_forward_throttled(&mut self, priority: Priority) {
        for idx in self.tiers[priority].clone() {
            let item = &self.requests[idx];
            if item.matched || item.skip_if_free {
                continue;
            }
            if self.fanout.is_throttled(&self.requests[idx].request) {
                self.tiers[FREE_BUCKET].push(idx);
            }
        }
    }
}

fn worker_eligible(config: &SchedulerConfig, worker: &Worker, now: UnixMillis) -> bool {
    match config.worker_expiration_ms {
        Some(expiration) => now.saturating_sub(worker.confirmed_ms) <= expiration,
        None => true,
    }
}
