//! Saga orchestrator
//!
//! Drives each payment through its step sequence, records every transition
//! as an event, and unwinds completed steps LIFO when a step fails.
//!
//! See `engine.rs` for the driving loop and `snapshot.rs` for state
//! save/restore.

pub mod engine;
pub mod snapshot;

// Re-export main types for convenience
pub use engine::{
    CancelOutcome, CoreConfig, DriveResult, PaymentOrchestrator, StatusView, SubmitAck,
};
pub use snapshot::StateSnapshot;
