//! The safety layer: everything that keeps a plan from hurting anyone.
//!
//! - [`idempotency`] -- duplicate submission collapse
//! - [`mutex`] -- per-asset lease locks with heartbeats
//! - [`secrets`] -- just-in-time secret resolution
//! - [`masking`] -- sink-level log masking
//! - [`rbac`] -- worker-side authorization
//! - [`cancellation`] -- cooperative cancellation with cleanup
//! - [`timeout`] -- SLA-driven timeout enforcement

pub mod cancellation;
pub mod idempotency;
pub mod masking;
pub mod mutex;
pub mod rbac;
pub mod secrets;
pub mod timeout;
