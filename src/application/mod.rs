//! Coordination layer between push signals, polling loops and manual refreshes.
//!
//! The `ConvergenceScheduler` is the only synchronization point: checkout reconciliation
//! and live quote refetches both run through it, keyed by their logical target, so
//! overlapping triggers for one target never race each other.

pub mod checkout;
pub mod convergence;
pub mod latch;
pub mod ledger_client;
pub mod live_quotes;
pub mod quotes;
pub mod subscriptions;
pub mod transitions;
