//! Quota-based preemptive priority scheduling for a worker fleet.
//!
//! The scheduler matches pending task requests to idle or
//! lower-priority-occupied workers. Every request belongs to a quota
//! account; accounts accrue per-tier balance over logical time, and each
//! scheduling tick walks the tiers from highest to lowest:
//!
//! 1. Match idle workers to requests whose provisionable labels they satisfy
//! 2. Match remaining idle workers on base labels alone
//! 3. Promote or demote running tasks against their account's balance trend
//! 4. Preempt cheaper lower-priority tasks, refunding the victim's account
//!    and charging the preemptor
//! 5. Give requests throttled mid-pass one more chance in the free bucket
//!
//! The core is single-threaded, synchronous, and does no I/O: callers feed
//! it account configuration, requests, and worker notifications, then enact
//! the [`state::Assignment`] list each [`Scheduler::run_once`] returns.
//!
//! # Components
//!
//! - **`scheduler`** — the facade collaborators drive
//! - **`pass`** — one tick of the multi-step algorithm
//! - **`state`** — queued requests, workers, balances, and the single
//!   mutation path for assignments
//! - **`fanout`** — per-group burst throttling
//! - **`matching`** — label containment and match quality
//! - **`config`** — per-instance tunables and account policies
//! - **`snapshot`** — point-in-time serialization for checkpointing callers

pub mod config;
pub mod error;
pub mod fanout;
pub mod scheduler;
pub mod snapshot;
pub mod state;

mod matching;
mod pass;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use fanout::FanoutGrouping;
pub use scheduler::Scheduler;
pub use snapshot::Snapshot;
pub use state::{Assignment, AssignmentKind, State, TaskRequest, TaskRun, Worker};
