//! Shared vocabulary for the quotafleet scheduler.
//!
//! This crate holds the types every other quotafleet crate speaks in:
//!
//! - **`types`** — identifier aliases, label sets, priority tiers, logical time
//! - **`balance`** — the per-tier balance vector used for quota and accrued cost
//! - **`account`** — quota account policy and the ledger-advance math

pub mod account;
pub mod balance;
pub mod types;

pub use account::{AccountConfig, DEMOTE_THRESHOLD, PROMOTE_THRESHOLD};
pub use balance::Balance;
pub use types::*;
