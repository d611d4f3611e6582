use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// Processing status of an inbox record.
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
pub enum InboxStatus {
    Processing,
    Processed,
    Failed,
}

impl TryFrom<String> for InboxStatus {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

/// Processing lease and result for one message at one consumer.
///
/// At most one row exists per `(consumer, message_id)`; the composite
/// primary key is what makes duplicate deliveries detectable.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InboxRecord {
    pub consumer: String,
    pub message_id: String,
    #[sqlx(try_from = "String")]
    pub status: InboxStatus,
    /// Lease expiry; a `processing` row past this point may be taken over.
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Number of lease takeovers this record has seen.
    pub retry_count: i32,
}
