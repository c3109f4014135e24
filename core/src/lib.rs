//! Payment Orchestration Core
//!
//! Multi-tenant payment orchestration engine: accepts initiation requests,
//! validates them, reserves customer limits and funds, routes to a clearing
//! channel, and coordinates settlement with compensation on failure.
//!
//! # Architecture
//!
//! - **core**: injectable clock, id generation, tenant context
//! - **models**: domain types (Payment, SagaInstance, reservations, holds,
//!   events, queued messages, routing rules, fraud toggles)
//! - **events**: append-only event log with the transactional outbox
//! - **limits**: multi-level limit reservation engine
//! - **resilience**: circuit breaker, retry, bulkhead, health monitor,
//!   offline message queue
//! - **accounts**: uniform adapter over heterogeneous core-banking backends
//! - **routing**: priority-ordered rule evaluation to a clearing system
//! - **fraud**: toggle resolution and score ingestion with fallback
//! - **orchestrator**: the saga driving loop and compensation engine
//! - **contracts**: interfaces the core consumes from the outside world
//!
//! # Critical Invariants
//!
//! 1. All money values are i64 (minor units)
//! 2. No component reads the wall clock directly; time is injected
//! 3. Every state transition commits atomically with its outbox event
//! 4. Every read and write is filtered by the caller's tenant context

// Module declarations
pub mod accounts;
pub mod contracts;
pub mod core;
pub mod error;
pub mod events;
pub mod fraud;
pub mod limits;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod resilience;
pub mod rng;
pub mod routing;

// Re-exports for convenience
pub use crate::core::{Clock, Deadline, IdGenerator, ManualClock, SystemClock, TenantContext};
pub use error::{CoreError, FailureClass};
pub use models::{
    payment::{Money, Payment, PaymentStatus, PaymentType},
    saga::{SagaInstance, SagaStatus, SagaStep},
};
pub use orchestrator::{CoreConfig, DriveResult, PaymentOrchestrator, SubmitAck};
