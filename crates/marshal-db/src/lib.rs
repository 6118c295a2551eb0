//! Persistence layer for the marshal execution engine.
//!
//! Every durable state transition in the system flows through this crate:
//! executions and their steps, the append-only event log, the lease-based
//! queue and its dead-letter table, per-asset locks, timeout policies, and
//! approval gates.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
