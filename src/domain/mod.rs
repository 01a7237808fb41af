//! Domain types and the ports through which the core reaches its collaborators.

pub mod event;
pub mod ids;
pub mod ledger;
pub mod ports;
pub mod quote;
