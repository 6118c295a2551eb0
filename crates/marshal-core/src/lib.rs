//! Core domain logic for the marshal execution engine.
//!
//! The flow from a submitted plan to a terminated execution:
//!
//! ```text
//! submit::Submitter        front door: validate, dedup, classify, route
//!   -> queue::QueueManager lease-based dispatch for background work
//!   -> worker::WorkerPool  supervised consumers
//!   -> engine::Engine      step-by-step execution under the safety layer
//! ```
//!
//! The safety layer (idempotency, per-asset mutex, secrets + masking, RBAC,
//! cancellation, timeouts) lives in [`safety`]; side-effecting capabilities
//! are reached only through the narrow traits in [`adapters`].

pub mod adapters;
pub mod config;
pub mod engine;
pub mod monitor;
pub mod plan;
pub mod queue;
pub mod safety;
pub mod submit;
pub mod worker;
