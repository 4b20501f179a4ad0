//! Mutable scheduler state: queued requests, workers, and account balances.
//!
//! All mutation funnels through this module. The pass algorithm decides;
//! `apply_assignment` is the single path by which a decision changes the
//! state. Reconciliation entry points (`mark_idle`, `notify_task_running`,
//! `notify_task_absent`) resolve disagreements with the external source of
//! truth by deleting the stale record, never by touching account balances.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use quotafleet_core::{AccountId, Balance, LabelSet, Priority, RequestId, UnixMillis, WorkerId};

use crate::error::{SchedulerError, SchedulerResult};

/// A task request, queued until a pass assigns it to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: RequestId,
    /// Account this request charges to. An id with no configured account
    /// schedules in the free bucket.
    pub account_id: AccountId,
    /// Labels a worker must have for this request to run on it.
    pub base_labels: LabelSet,
    /// Labels a worker should ideally have; a setup task can provision
    /// missing ones, so they are preferred rather than required.
    pub provisionable_labels: LabelSet,
    pub enqueue_ms: UnixMillis,
    /// Last time an external caller confirmed this request's existence.
    /// Reconciliation bookkeeping only; never consulted by scheduling logic.
    pub confirmed_ms: UnixMillis,
}

impl TaskRequest {
    pub fn new(
        id: impl Into<RequestId>,
        account_id: impl Into<AccountId>,
        base_labels: LabelSet,
        provisionable_labels: LabelSet,
        enqueue_ms: UnixMillis,
    ) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            base_labels,
            provisionable_labels,
            enqueue_ms,
            confirmed_ms: enqueue_ms,
        }
    }

    fn confirm(&mut self, now: UnixMillis) {
        if now > self.confirmed_ms {
            self.confirmed_ms = now;
        }
    }
}

/// The running assignment occupying a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    /// The request this run was started from.
    pub request: TaskRequest,
    /// Current tier; reprioritization moves it between ticks.
    pub priority: Priority,
    /// Cost accrued so far. Only ever increases while the task runs.
    pub cost: Balance,
}

/// A worker that can run one task at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    /// Capability labels this worker possesses.
    pub labels: LabelSet,
    /// The task currently running here, if any.
    pub running: Option<TaskRun>,
    /// Last time an external caller confirmed this worker's state.
    pub confirmed_ms: UnixMillis,
}

impl Worker {
    pub fn is_idle(&self) -> bool {
        self.running.is_none()
    }

    /// Freshness of this record: the newest confirmation of either the
    /// worker itself or the request it is running.
    fn latest_confirmed_ms(&self) -> UnixMillis {
        match &self.running {
            Some(run) => self.confirmed_ms.max(run.request.confirmed_ms),
            None => self.confirmed_ms,
        }
    }

    fn confirm(&mut self, now: UnixMillis) {
        if now > self.confirmed_ms {
            self.confirmed_ms = now;
        }
    }
}

/// Which kind of decision an assignment is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    /// Start a request on an idle worker.
    IdleWorker,
    /// Abort the running task on a busy worker and start a request there.
    Preempt,
}

/// One scheduling decision, emitted by a pass for the caller to enact
/// against the real fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub kind: AssignmentKind,
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    /// Set for preemptions: the request that must be aborted on the worker.
    pub task_to_abort: Option<RequestId>,
    /// Tier the new task will run at.
    pub priority: Priority,
    pub at_ms: UnixMillis,
}

/// The mutable aggregate one scheduler instance operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub(crate) queued: HashMap<RequestId, TaskRequest>,
    pub(crate) balances: HashMap<AccountId, Balance>,
    pub(crate) workers: HashMap<WorkerId, Worker>,
    pub(crate) last_update_ms: UnixMillis,
}

impl State {
    pub(crate) fn new(now: UnixMillis) -> Self {
        Self {
            queued: HashMap::new(),
            balances: HashMap::new(),
            workers: HashMap::new(),
            last_update_ms: now,
        }
    }

    /// The worker currently running `request_id`, if any. Workers are the
    /// authoritative source for running tasks.
    pub(crate) fn worker_running(&self, request_id: &str) -> Option<&Worker> {
        self.workers
            .values()
            .find(|worker| {
                worker
                    .running
                    .as_ref()
                    .is_some_and(|run| run.request.id == request_id)
            })
    }

    /// Enqueue a new request. Conflicts if the id is already queued or
    /// running anywhere.
    pub(crate) fn add_request(
        &mut self,
        mut request: TaskRequest,
        now: UnixMillis,
    ) -> SchedulerResult<()> {
        if request.id.is_empty() {
            return Err(SchedulerError::EmptyRequestId);
        }
        if self.queued.contains_key(&request.id) || self.worker_running(&request.id).is_some() {
            return Err(SchedulerError::RequestExists(request.id));
        }
        request.confirm(now);
        self.queued.insert(request.id.clone(), request);
        Ok(())
    }

    /// Register a worker as idle with the given labels, or confirm an
    /// existing worker. Calls older than our knowledge of the worker are
    /// ignored (out-of-order delivery; a later call self-heals). A worker we
    /// believed busy reporting idle means its task completed: the stale run
    /// is dropped without touching any balance.
    pub(crate) fn mark_idle(&mut self, worker_id: &str, labels: LabelSet, now: UnixMillis) {
        if !self.workers.contains_key(worker_id) {
            self.workers.insert(
                worker_id.to_string(),
                Worker {
                    id: worker_id.to_string(),
                    labels,
                    running: None,
                    confirmed_ms: now,
                },
            );
            return;
        }
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return;
        };

        if now < worker.latest_confirmed_ms() {
            return;
        }

        worker.labels = labels;
        worker.confirm(now);

        if let Some(run) = worker.running.take() {
            warn!(
                worker = %worker_id,
                request = %run.request.id,
                "idle report contradicts running task, dropping the task"
            );
        }
    }

    /// Authoritative notice that `request_id` is running on `worker_id`.
    /// Where our state disagrees and is no newer, the stale records are
    /// deleted; no account is refunded or charged.
    pub(crate) fn notify_task_running(
        &mut self,
        request_id: &str,
        worker_id: &str,
        now: UnixMillis,
    ) {
        let known = self.queued.contains_key(request_id) || self.worker_running(request_id).is_some();
        if !known {
            // The request is news to us; trust the notification over any
            // older opinion of the worker.
            self.delete_worker_if_older(worker_id, now, request_id);
            return;
        }

        let confirmed_ms = match self.worker_running(request_id) {
            Some(worker) => worker
                .running
                .as_ref()
                .map(|run| run.request.confirmed_ms)
                .unwrap_or_default(),
            None => self.queued[request_id].confirmed_ms,
        };
        if now < confirmed_ms {
            return;
        }

        let alleged = self.worker_running(request_id).map(|worker| worker.id.clone());
        if alleged.as_deref() == Some(worker_id) {
            // Already correct; just refresh the timestamps.
            if let Some(worker) = self.workers.get_mut(worker_id) {
                worker.confirm(now);
                if let Some(run) = worker.running.as_mut() {
                    run.request.confirm(now);
                }
            }
            return;
        }

        if let Some(alleged_id) = alleged {
            warn!(
                request = %request_id,
                believed = %alleged_id,
                actual = %worker_id,
                "request running on unexpected worker, deleting stale record"
            );
            self.workers.remove(&alleged_id);
        }
        self.delete_worker_if_older(worker_id, now, request_id);
    }

    /// Authoritative notice that `request_id` is neither queued nor running.
    pub(crate) fn notify_task_absent(&mut self, request_id: &str, now: UnixMillis) {
        if let Some(worker) = self.worker_running(request_id) {
            if now >= worker.latest_confirmed_ms() {
                let worker_id = worker.id.clone();
                debug!(request = %request_id, worker = %worker_id, "running task reported absent");
                self.workers.remove(&worker_id);
            }
            return;
        }
        if let Some(request) = self.queued.get(request_id) {
            if now >= request.confirmed_ms {
                self.queued.remove(request_id);
            }
        }
    }

    /// Gracefully remove a worker from the fleet. Any task it was running
    /// goes back in the queue with its place in line intact.
    pub(crate) fn remove_worker(&mut self, worker_id: &str) {
        let Some(mut worker) = self.workers.remove(worker_id) else {
            return;
        };
        if let Some(run) = worker.running.take() {
            debug!(
                worker = %worker_id,
                request = %run.request.id,
                "re-enqueueing task from removed worker"
            );
            self.queued.insert(run.request.id.clone(), run.request);
        }
    }

    /// Delete the worker (and any task it is running) if its record is no
    /// newer than `now`.
    fn delete_worker_if_older(&mut self, worker_id: &str, now: UnixMillis, cause: &str) {
        let Some(worker) = self.workers.get(worker_id) else {
            return;
        };
        if now < worker.latest_confirmed_ms() {
            return;
        }
        if let Some(run) = &worker.running {
            warn!(
                worker = %worker_id,
                request = %run.request.id,
                cause = %cause,
                "worker running unexpected task, deleting stale record"
            );
        }
        self.workers.remove(worker_id);
    }

    fn refund_account(&mut self, account_id: &str, cost: &Balance) {
        if let Some(balance) = self.balances.get_mut(account_id) {
            balance.add(cost);
        }
    }

    fn charge_account(&mut self, account_id: &str, cost: &Balance) {
        if let Some(balance) = self.balances.get_mut(account_id) {
            balance.sub(cost);
        }
    }

    /// Apply one assignment. This is the only place matching decisions
    /// mutate the state; violated preconditions mean the caller and the
    /// scheduler have diverged and surface as `Inconsistency`.
    pub(crate) fn apply_assignment(&mut self, assignment: &Assignment) -> SchedulerResult<()> {
        self.check_assignment(assignment)?;

        let mut initial_cost = Balance::default();
        if assignment.kind == AssignmentKind::Preempt {
            // Checked above: the worker exists and runs the expected task.
            if let Some(run) = self
                .workers
                .get_mut(&assignment.worker_id)
                .and_then(|worker| worker.running.take())
            {
                initial_cost = run.cost;
                let victim_account = run.request.account_id.clone();
                // The victim's request returns to the queue with its
                // original enqueue time, keeping its FIFO position.
                self.queued.insert(run.request.id.clone(), run.request);
                self.refund_account(&victim_account, &initial_cost);
                if let Some(preemptor) = self
                    .queued
                    .get(&assignment.request_id)
                    .map(|request| request.account_id.clone())
                {
                    self.charge_account(&preemptor, &initial_cost);
                }
            }
        }

        if let Some(request) = self.queued.remove(&assignment.request_id) {
            if let Some(worker) = self.workers.get_mut(&assignment.worker_id) {
                worker.running = Some(TaskRun {
                    request,
                    priority: assignment.priority,
                    cost: initial_cost,
                });
            }
        }
        Ok(())
    }

    fn check_assignment(&self, assignment: &Assignment) -> SchedulerResult<()> {
        if !self.queued.contains_key(&assignment.request_id) {
            return Err(SchedulerError::Inconsistency(format!(
                "no queued request {}",
                assignment.request_id
            )));
        }
        let Some(worker) = self.workers.get(&assignment.worker_id) else {
            return Err(SchedulerError::Inconsistency(format!(
                "no worker {}",
                assignment.worker_id
            )));
        };
        match (assignment.kind, &worker.running) {
            (AssignmentKind::IdleWorker, Some(run)) => Err(SchedulerError::Inconsistency(format!(
                "worker {} is not idle, it is running {}",
                assignment.worker_id, run.request.id
            ))),
            (AssignmentKind::Preempt, None) => Err(SchedulerError::Inconsistency(format!(
                "worker {} is idle, expected it to be running {:?}",
                assignment.worker_id, assignment.task_to_abort
            ))),
            (AssignmentKind::Preempt, Some(run))
                if assignment.task_to_abort.as_deref() != Some(run.request.id.as_str()) =>
            {
                Err(SchedulerError::Inconsistency(format!(
                    "worker {} is running {}, expected {:?}",
                    assignment.worker_id, run.request.id, assignment.task_to_abort
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels<const N: usize>(names: [&str; N]) -> LabelSet {
        names.into_iter().map(String::from).collect()
    }

    fn make_request(id: &str, account: &str, t: UnixMillis) -> TaskRequest {
        TaskRequest::new(id, account, labels([]), labels([]), t)
    }

    fn idle_assignment(request: &str, worker: &str) -> Assignment {
        Assignment {
            kind: AssignmentKind::IdleWorker,
            worker_id: worker.to_string(),
            request_id: request.to_string(),
            task_to_abort: None,
            priority: 0,
            at_ms: 0,
        }
    }

    fn make_running(state: &mut State, request: &str, worker: &str, account: &str) {
        state.add_request(make_request(request, account, 0), 0).unwrap();
        state.mark_idle(worker, labels([]), 0);
        state.apply_assignment(&idle_assignment(request, worker)).unwrap();
    }

    #[test]
    fn add_request_rejects_duplicates_and_empty_ids() {
        let mut state = State::new(0);
        state.add_request(make_request("r1", "a1", 0), 0).unwrap();
        assert!(matches!(
            state.add_request(make_request("r1", "a1", 0), 1),
            Err(SchedulerError::RequestExists(_))
        ));
        assert!(matches!(
            state.add_request(make_request("", "a1", 0), 1),
            Err(SchedulerError::EmptyRequestId)
        ));

        // Running requests conflict too.
        state.mark_idle("w1", labels([]), 0);
        state.apply_assignment(&idle_assignment("r1", "w1")).unwrap();
        assert!(matches!(
            state.add_request(make_request("r1", "a1", 0), 2),
            Err(SchedulerError::RequestExists(_))
        ));
    }

    #[test]
    fn apply_idle_assignment_moves_request_onto_worker() {
        let mut state = State::new(0);
        make_running(&mut state, "r1", "w1", "a1");
        assert!(state.queued.is_empty());
        let run = state.workers["w1"].running.as_ref().unwrap();
        assert_eq!(run.request.id, "r1");
        assert_eq!(run.cost, Balance::default());
    }

    #[test]
    fn apply_assignment_rejects_busy_worker() {
        let mut state = State::new(0);
        make_running(&mut state, "r1", "w1", "a1");
        state.add_request(make_request("r2", "a1", 0), 0).unwrap();
        assert!(matches!(
            state.apply_assignment(&idle_assignment("r2", "w1")),
            Err(SchedulerError::Inconsistency(_))
        ));
        // The failed assignment left the queue untouched.
        assert!(state.queued.contains_key("r2"));
    }

    #[test]
    fn apply_assignment_rejects_unknown_ids() {
        let mut state = State::new(0);
        assert!(matches!(
            state.apply_assignment(&idle_assignment("ghost", "w1")),
            Err(SchedulerError::Inconsistency(_))
        ));
    }

    #[test]
    fn apply_preempt_rejects_wrong_victim() {
        let mut state = State::new(0);
        make_running(&mut state, "r1", "w1", "a1");
        state.add_request(make_request("r2", "a2", 0), 0).unwrap();
        let assignment = Assignment {
            kind: AssignmentKind::Preempt,
            worker_id: "w1".to_string(),
            request_id: "r2".to_string(),
            task_to_abort: Some("other".to_string()),
            priority: 0,
            at_ms: 0,
        };
        assert!(matches!(
            state.apply_assignment(&assignment),
            Err(SchedulerError::Inconsistency(_))
        ));
        assert_eq!(
            state.workers["w1"].running.as_ref().unwrap().request.id,
            "r1"
        );
    }

    #[test]
    fn apply_preempt_transfers_cost_and_requeues_victim() {
        let mut state = State::new(0);
        state.balances.insert("a1".to_string(), Balance::default());
        state.balances.insert("a2".to_string(), Balance::from_slice(&[2.0]));
        make_running(&mut state, "r1", "w1", "a1");
        if let Some(run) = state.workers.get_mut("w1").and_then(|w| w.running.as_mut()) {
            run.cost = Balance::from_slice(&[0.5, 0.5]);
        }
        state.add_request(make_request("r2", "a2", 0), 0).unwrap();

        let assignment = Assignment {
            kind: AssignmentKind::Preempt,
            worker_id: "w1".to_string(),
            request_id: "r2".to_string(),
            task_to_abort: Some("r1".to_string()),
            priority: 0,
            at_ms: 0,
        };
        state.apply_assignment(&assignment).unwrap();

        // Victim requeued, new task starts carrying the victim's cost.
        assert!(state.queued.contains_key("r1"));
        let run = state.workers["w1"].running.as_ref().unwrap();
        assert_eq!(run.request.id, "r2");
        assert_eq!(run.cost, Balance::from_slice(&[0.5, 0.5]));
        // Refund and charge are the same amount.
        assert_eq!(state.balances["a1"], Balance::from_slice(&[0.5, 0.5]));
        assert_eq!(state.balances["a2"], Balance::from_slice(&[1.5, -0.5]));
    }

    #[test]
    fn mark_idle_ignores_stale_calls() {
        let mut state = State::new(0);
        state.mark_idle("w1", labels(["x"]), 10);
        state.mark_idle("w1", labels(["y"]), 5);
        assert_eq!(state.workers["w1"].labels, labels(["x"]));
        assert_eq!(state.workers["w1"].confirmed_ms, 10);
    }

    #[test]
    fn mark_idle_drops_contradicted_running_task() {
        let mut state = State::new(0);
        make_running(&mut state, "r1", "w1", "a1");
        state.mark_idle("w1", labels([]), 5);
        assert!(state.workers["w1"].is_idle());
        assert!(!state.queued.contains_key("r1"));
    }

    #[test]
    fn notify_running_confirms_agreement() {
        let mut state = State::new(0);
        make_running(&mut state, "r1", "w1", "a1");
        state.notify_task_running("r1", "w1", 7);
        let worker = &state.workers["w1"];
        assert_eq!(worker.confirmed_ms, 7);
        assert_eq!(worker.running.as_ref().unwrap().request.confirmed_ms, 7);
    }

    #[test]
    fn notify_running_deletes_stale_worker_for_unknown_request() {
        let mut state = State::new(0);
        state.mark_idle("w1", labels([]), 0);
        state.notify_task_running("ghost", "w1", 5);
        assert!(!state.workers.contains_key("w1"));
    }

    #[test]
    fn notify_running_deletes_mismatched_worker_records() {
        let mut state = State::new(0);
        make_running(&mut state, "r1", "w1", "a1");
        state.mark_idle("w2", labels([]), 0);
        state.notify_task_running("r1", "w2", 5);
        // Both the believed worker and the actual one were stale.
        assert!(!state.workers.contains_key("w1"));
        assert!(!state.workers.contains_key("w2"));
    }

    #[test]
    fn notify_absent_removes_queued_and_running() {
        let mut state = State::new(0);
        state.add_request(make_request("r1", "a1", 0), 0).unwrap();
        state.notify_task_absent("r1", 5);
        assert!(state.queued.is_empty());

        make_running(&mut state, "r2", "w1", "a1");
        state.notify_task_absent("r2", 5);
        assert!(!state.workers.contains_key("w1"));
        assert!(state.queued.is_empty());
    }

    #[test]
    fn remove_worker_requeues_running_task() {
        let mut state = State::new(0);
        make_running(&mut state, "r1", "w1", "a1");
        state.remove_worker("w1");
        assert!(!state.workers.contains_key("w1"));
        assert!(state.queued.contains_key("r1"));
    }
}
