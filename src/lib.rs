//! freightvault
//!
//! Back-office core for a freight forwarder: PostgreSQL + filesystem backups
//! with validated, rollback-safe restores, and banded sea-freight pricing.

pub mod backup;
pub mod cli;
pub mod config;
pub mod errors;
pub mod models;
pub mod pricing;
pub mod restore;
pub mod schedule;
pub mod store;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;
