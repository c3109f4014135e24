//! Event log and outbox
//!
//! Append-only store of `EventEnvelope`s with per-saga, gap-free sequence
//! numbers, plus the outbox tail that tracks which events still await
//! publication.
//!
//! `append` is called inside the same state commit as the business mutation
//! it describes; publication happens later and never rolls business state
//! back.
//!
//! # Critical Invariants
//!
//! 1. Append-only: events are never mutated or removed
//! 2. `(saga_id, seq)` is unique; `seq` is strictly increasing per saga
//! 3. An event committed before another (same saga) has the smaller seq
//! 4. Publication preserves per-saga order; duplicates are possible,
//!    reordering is not

mod outbox;

pub use outbox::{OutboxPolicy, OutboxPublisher, PublishReport};

use crate::core::TenantContext;
use crate::error::CoreError;
use crate::models::event::{EventBody, EventEnvelope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Publication state of one outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxState {
    /// Awaiting publication (or between backoff attempts)
    Pending,

    /// Delivered to the sink at least once
    Published,

    /// Attempt cap exhausted; parked for operator attention
    Poison,
}

/// Outbox bookkeeping for one appended event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub saga_id: String,
    pub seq: u64,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub state: OutboxState,
}

/// Append-only event store with outbox tracking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventStore {
    events: Vec<EventEnvelope>,
    next_seq: BTreeMap<String, u64>,
    outbox: Vec<OutboxEntry>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event for a saga, assigning the next sequence number and
    /// enqueueing it for publication. Returns the assigned seq.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        ctx: &TenantContext,
        saga_id: &str,
        event_id: String,
        body: EventBody,
        causation_id: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> u64 {
        let seq = {
            let next = self.next_seq.entry(saga_id.to_string()).or_insert(1);
            let seq = *next;
            *next += 1;
            seq
        };

        self.events.push(EventEnvelope {
            event_id,
            saga_id: saga_id.to_string(),
            seq,
            occurred_at,
            correlation_id: saga_id.to_string(),
            causation_id,
            tenant_id: ctx.tenant_id().to_string(),
            business_unit_id: ctx.business_unit_id().to_string(),
            body,
        });

        self.outbox.push(OutboxEntry {
            saga_id: saga_id.to_string(),
            seq,
            attempts: 0,
            next_attempt_at: occurred_at,
            state: OutboxState::Pending,
        });

        seq
    }

    /// Number of events appended across all sagas.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All events, in commit order. Cross-tenant listing is reserved for
    /// operator tooling and tests; tenant-scoped reads use the guarded
    /// queries below.
    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    /// Events for one saga in seq order, guarded by tenant context.
    pub fn events_for_saga(
        &self,
        ctx: &TenantContext,
        saga_id: &str,
    ) -> Result<Vec<&EventEnvelope>, CoreError> {
        let events: Vec<&EventEnvelope> = self
            .events
            .iter()
            .filter(|e| e.saga_id == saga_id)
            .collect();
        if let Some(first) = events.first() {
            ctx.guard_row(&first.tenant_id, &first.business_unit_id)?;
        }
        Ok(events)
    }

    /// Events of one type for one saga, guarded by tenant context.
    pub fn events_of_type(
        &self,
        ctx: &TenantContext,
        saga_id: &str,
        event_type: &str,
    ) -> Result<Vec<&EventEnvelope>, CoreError> {
        Ok(self
            .events_for_saga(ctx, saga_id)?
            .into_iter()
            .filter(|e| e.event_type() == event_type)
            .collect())
    }

    /// Highest seq assigned for a saga, 0 when none.
    pub fn last_seq(&self, saga_id: &str) -> u64 {
        self.next_seq
            .get(saga_id)
            .map(|next| next - 1)
            .unwrap_or(0)
    }

    /// Find the envelope for `(saga_id, seq)`.
    pub fn find(&self, saga_id: &str, seq: u64) -> Option<&EventEnvelope> {
        self.events
            .iter()
            .find(|e| e.saga_id == saga_id && e.seq == seq)
    }

    /// Entries still awaiting publication.
    pub fn pending_outbox(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.outbox
            .iter()
            .filter(|e| e.state == OutboxState::Pending)
    }

    /// Poisoned entries, for operator attention.
    pub fn poisoned_outbox(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.outbox
            .iter()
            .filter(|e| e.state == OutboxState::Poison)
    }

    pub(crate) fn outbox(&self) -> &[OutboxEntry] {
        &self.outbox
    }

    pub(crate) fn outbox_mut(&mut self) -> &mut Vec<OutboxEntry> {
        &mut self.outbox
    }

    pub(crate) fn envelope_for_entry(&self, entry: &OutboxEntry) -> Option<&EventEnvelope> {
        self.find(&entry.saga_id, entry.seq)
    }
}
