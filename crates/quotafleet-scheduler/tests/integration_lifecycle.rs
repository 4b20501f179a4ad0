//! Integration tests driving the scheduler through its public surface only.
//!
//! These tests prove that:
//! 1. A mixed fleet converges over several ticks: idle matching, fanout
//!    throttling, and preemption cooperate without losing a request
//! 2. Preemption transfers exactly the victim's accrued cost between the
//!    two accounts involved
//! 3. A snapshot taken mid-flight restores to a scheduler with identical
//!    future behavior
//! 4. Reconciliation notices repair a diverged view without touching any
//!    account balance
//!
//! Balances are observed through the serialized snapshot, the same channel
//! a checkpointing caller would use.

use quotafleet_core::{AccountConfig, Balance, FREE_BUCKET, LabelSet};
use quotafleet_scheduler::{AssignmentKind, Scheduler, TaskRequest};

// ── Helpers ──────────────────────────────────────────────────────

fn labels<const N: usize>(names: [&str; N]) -> LabelSet {
    names.into_iter().map(String::from).collect()
}

fn request(id: &str, account: &str, base: LabelSet, t: u64) -> TaskRequest {
    TaskRequest::new(id, account, base, labels([]), t)
}

/// Read an account's balance out of the serialized snapshot.
fn balance_of(s: &Scheduler, account: &str) -> Vec<f64> {
    let snapshot = serde_json::to_value(s.snapshot()).unwrap();
    snapshot["state"]["balances"][account]
        .as_array()
        .expect("account has a balance entry")
        .iter()
        .map(|v| v.as_f64().unwrap())
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────

#[test]
fn fleet_converges_across_ticks() {
    let mut s = Scheduler::new(0);
    s.add_account(
        "ci",
        AccountConfig::new(Balance::from_slice(&[1.0, 1.0]), 10.0).with_max_fanout(2),
        Some(Balance::from_slice(&[5.0])),
    )
    .unwrap();
    s.add_account(
        "batch",
        AccountConfig::new(Balance::from_slice(&[0.0, 0.5]), 10.0),
        Some(Balance::from_slice(&[0.0, 2.0])),
    )
    .unwrap();

    for i in 0..3 {
        s.mark_idle(&format!("w{i}"), labels([]), 0);
    }
    s.add_request(request("ci-1", "ci", labels([]), 0), 0).unwrap();
    s.add_request(request("ci-2", "ci", labels([]), 1), 1).unwrap();
    s.add_request(request("ci-3", "ci", labels([]), 2), 2).unwrap();
    s.add_request(request("batch-1", "batch", labels([]), 3), 3).unwrap();

    let first = s.run_once(10).unwrap();

    // Three workers, four requests: ci gets its fanout allowance of two at
    // tier 0, batch-1 runs at tier 1, and ci-3 waits its turn.
    assert_eq!(first.len(), 3);
    assert!(s.is_assigned("ci-1", "w0"));
    assert!(s.is_assigned("ci-2", "w1"));
    assert!(s.is_assigned("batch-1", "w2"));
    assert_eq!(
        first.iter().map(|a| a.priority).collect::<Vec<_>>(),
        vec![0, 0, 1]
    );
    assert!(s.get_request("ci-3").is_some());

    // A new worker appears, but ci's fanout allowance is spent by the two
    // running jobs, so ci-3 falls back to the free bucket.
    s.update_time(1_000).unwrap();
    s.mark_idle("w3", labels([]), 1_000);
    let second = s.run_once(1_000).unwrap();

    assert_eq!(second.len(), 1);
    assert_eq!(second[0].priority, FREE_BUCKET);
    assert!(s.is_assigned("ci-3", "w3"));

    // ci-1 and ci-3 finish; a worker returns, and with fanout headroom back
    // the next ci request is paid again.
    s.notify_task_absent("ci-1", 2_000);
    s.notify_task_absent("ci-3", 2_000);
    s.mark_idle("w0", labels([]), 2_000);
    s.add_request(request("ci-4", "ci", labels([]), 2_000), 2_000).unwrap();
    s.update_time(2_000).unwrap();
    let third = s.run_once(2_000).unwrap();

    assert_eq!(third.len(), 1);
    assert_eq!(third[0].priority, 0);
    assert!(s.is_assigned("ci-4", "w0"));
}

#[test]
fn preemption_moves_cost_between_accounts() {
    let mut s = Scheduler::new(0);
    // `batch` holds tier-1 quota only, so its request runs at tier 1.
    s.add_account(
        "batch",
        AccountConfig::new(Balance::default(), 0.0),
        Some(Balance::from_slice(&[0.0, 3.0])),
    )
    .unwrap();
    s.mark_idle("w1", labels([]), 0);
    s.add_request(request("victim", "batch", labels([]), 0), 0).unwrap();
    let setup = s.run_once(0).unwrap();
    assert_eq!(setup[0].priority, 1);

    // Two seconds of runtime: the victim accrues (0, 2) of cost and drains
    // the same amount from its account.
    s.update_time(2_000).unwrap();
    assert_eq!(balance_of(&s, "batch"), vec![0.0, 1.0, 0.0, 0.0, 0.0]);

    s.add_account(
        "urgent",
        AccountConfig::new(Balance::default(), 0.0),
        Some(Balance::from_slice(&[5.0])),
    )
    .unwrap();
    s.add_request(request("takeover", "urgent", labels([]), 2_000), 2_000)
        .unwrap();
    let assignments = s.run_once(2_000).unwrap();

    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].kind, AssignmentKind::Preempt);
    assert_eq!(assignments[0].task_to_abort.as_deref(), Some("victim"));
    assert!(s.is_assigned("takeover", "w1"));
    assert!(s.get_request("victim").is_some());

    // The victim's cost moved from `urgent` to `batch`, nothing else.
    assert_eq!(balance_of(&s, "batch"), vec![0.0, 3.0, 0.0, 0.0, 0.0]);
    assert_eq!(balance_of(&s, "urgent"), vec![5.0, -2.0, 0.0, 0.0, 0.0]);
}

#[test]
fn snapshot_restores_equivalent_scheduler() {
    let mut s = Scheduler::new(0);
    s.add_account(
        "ci",
        AccountConfig::new(Balance::from_slice(&[1.0]), 5.0).with_max_fanout(1),
        Some(Balance::from_slice(&[2.0])),
    )
    .unwrap();
    s.mark_idle("w1", labels(["gpu"]), 0);
    s.add_request(request("r1", "ci", labels(["gpu"]), 0), 0).unwrap();
    s.add_request(request("r2", "ci", labels([]), 1), 1).unwrap();
    s.run_once(0).unwrap();
    s.update_time(1_500).unwrap();

    // Round-trip through the wire format a checkpointing caller would use.
    let encoded = serde_json::to_string(&s.snapshot()).unwrap();
    let mut restored = Scheduler::from_snapshot(serde_json::from_str(&encoded).unwrap());
    assert_eq!(restored, s);

    // Both copies see the same future.
    s.mark_idle("w2", labels([]), 2_000);
    restored.mark_idle("w2", labels([]), 2_000);
    s.update_time(3_000).unwrap();
    restored.update_time(3_000).unwrap();
    assert_eq!(s.run_once(3_000).unwrap(), restored.run_once(3_000).unwrap());
    assert_eq!(restored, s);
}

#[test]
fn reconciliation_repairs_diverged_state_without_touching_balances() {
    let mut s = Scheduler::new(0);
    s.add_account(
        "ci",
        AccountConfig::new(Balance::default(), 0.0),
        Some(Balance::from_slice(&[2.0])),
    )
    .unwrap();
    s.mark_idle("w1", labels([]), 0);
    s.add_request(request("r1", "ci", labels([]), 0), 0).unwrap();
    s.run_once(0).unwrap();
    assert!(s.is_assigned("r1", "w1"));
    let before = balance_of(&s, "ci");

    // The fleet says r1 actually runs on w2, a worker we have never seen.
    // Our record of w1 is stale and gets deleted; no refund happens.
    s.notify_task_running("r1", "w2", 1_000);
    assert!(!s.is_assigned("r1", "w1"));
    assert_eq!(balance_of(&s, "ci"), before);

    // The worker reports back idle and picks up fresh work as if nothing
    // happened.
    s.mark_idle("w1", labels([]), 2_000);
    s.add_request(request("r2", "ci", labels([]), 2_000), 2_000).unwrap();
    let assignments = s.run_once(2_000).unwrap();
    assert_eq!(assignments.len(), 1);
    assert!(s.is_assigned("r2", "w1"));
}
