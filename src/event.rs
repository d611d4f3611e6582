//! Outbox event definitions and statistics tracking.
//!
//! An [`OutboxEvent`] is a durable intent to publish: it is inserted in the
//! same database transaction as the business write that caused it, then
//! picked up and published by the background dispatcher.
//!
//! # Event lifecycle
//! Events move through a small directed lattice:
//! - `pending` → `sent` or `failed`
//! - `failed` → `sent`, `failed` (next retry) or `dead`
//!
//! `sent` and `dead` are terminal; the dispatcher never touches them again.
//!
//! # Statistics tracking
//! [`OutboxStats`] carries per-status counts for monitoring the relay's
//! backlog and dead-letter volume.

use std::str::FromStr;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::error::Error;

/// Publication status of an outbox row.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::AsRefStr,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Sent,
    Failed,
    Dead,
}

impl TryFrom<String> for EventStatus {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

/// A persisted outbox row.
///
/// Created by [`crate::outbox::Outbox::emit`] inside the caller's
/// transaction; mutated only by the dispatcher's settlement calls.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxEvent {
    /// Globally unique identifier, generated at emit time.
    pub event_id: Uuid,
    /// Category of the emitting entity, e.g. `"order"`.
    pub aggregate_type: String,
    /// Identifier of the entity instance the event belongs to.
    pub aggregate_id: String,
    /// Name of the domain event, e.g. `"order.placed"`.
    pub event_type: String,
    /// Opaque event body, stored as JSONB.
    pub payload: serde_json::Value,
    /// Optional transport headers, stored as JSONB.
    pub headers: Option<serde_json::Value>,
    #[sqlx(try_from = "String")]
    pub status: EventStatus,
    /// Number of publish attempts that have returned an error.
    pub attempts: i32,
    /// Retry eligibility time; set only while `status = failed`.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Claim lease held by a dispatcher between claim and settlement; an
    /// expired lease means the claiming worker is presumed crashed.
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Terminal success time; set only once `status = sent`.
    pub published_at: Option<DateTime<Utc>>,
    /// Message from the most recent failed publish attempt.
    pub last_error: Option<String>,
    /// Time the row exhausted its retry budget; set only once `status = dead`.
    pub dead_at: Option<DateTime<Utc>>,
}

/// Validated input to `emit`.
///
/// The three name fields must be non-empty and the payload must be a real
/// JSON document; [`EventDraft::validate`] enforces this before anything
/// touches the database.
#[derive(Debug, Clone, Builder)]
pub struct EventDraft {
    #[builder(into)]
    pub aggregate_type: String,
    #[builder(into)]
    pub aggregate_id: String,
    #[builder(into)]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub headers: Option<serde_json::Value>,
}

impl EventDraft {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.aggregate_type.trim().is_empty() {
            return Err(Error::invalid_event("aggregate_type must be non-empty"));
        }
        if self.aggregate_id.trim().is_empty() {
            return Err(Error::invalid_event("aggregate_id must be non-empty"));
        }
        if self.event_type.trim().is_empty() {
            return Err(Error::invalid_event("event_type must be non-empty"));
        }
        if self.payload.is_null() {
            return Err(Error::invalid_event("payload is required"));
        }
        Ok(())
    }
}

/// Per-status row counts for one outbox table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, FromRow)]
pub struct OutboxStats {
    /// Rows waiting for their first publish attempt.
    pub pending: i64,
    /// Rows published and settled.
    pub sent: i64,
    /// Rows scheduled for a retry.
    pub failed: i64,
    /// Rows that exhausted their retry budget.
    pub dead: i64,
}
