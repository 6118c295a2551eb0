//! Query modules, one per table group.

pub mod approvals;
pub mod dlq;
pub mod events;
pub mod executions;
pub mod locks;
pub mod policies;
pub mod queue;
pub mod steps;
