use serde::Deserialize;

pub mod defaults {
    pub const DATABASE_URL: &str = "postgres://localhost/sluice";
    pub const OUTBOX_TABLE: &str = "outbox_events";
    pub const INBOX_TABLE: &str = "inbox_records";

    pub const POLL_INTERVAL_MS: u64 = 1000;
    pub const BATCH_SIZE: usize = 50;
    pub const MAX_ATTEMPTS: u32 = 10;
    pub const INITIAL_BACKOFF_MS: u64 = 1000;
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const CLAIM_TTL_MS: u64 = 30_000;

    pub const LOCK_TTL_MS: u64 = 300_000;
}

/// Connection-level configuration, loadable from `SLUICE_`-prefixed
/// environment variables.
#[derive(Clone, Deserialize, Default)]
pub struct Config {
    pub database_url: Option<String>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("SLUICE_").from_env::<Self>()?)
    }

    pub fn database_url(&self) -> &str {
        self.database_url
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or(defaults::DATABASE_URL)
    }
}

/// Options for the background dispatcher. Every field falls back to the
/// matching `defaults` constant.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct DispatcherConfig {
    pub poll_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub claim_ttl_ms: Option<u64>,
    pub table_name: Option<String>,
}

impl DispatcherConfig {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("SLUICE_").from_env::<Self>()?)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.unwrap_or(defaults::POLL_INTERVAL_MS)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(defaults::BATCH_SIZE)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(defaults::MAX_ATTEMPTS)
    }

    pub fn initial_backoff_ms(&self) -> u64 {
        self.initial_backoff_ms
            .unwrap_or(defaults::INITIAL_BACKOFF_MS)
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
            .unwrap_or(defaults::BACKOFF_MULTIPLIER)
    }

    /// How long a claimed row stays invisible to other workers before it
    /// is considered abandoned. Must outlast a publish plus settlement.
    pub fn claim_ttl_ms(&self) -> u64 {
        self.claim_ttl_ms.unwrap_or(defaults::CLAIM_TTL_MS)
    }

    pub fn table_name(&self) -> &str {
        self.table_name
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or(defaults::OUTBOX_TABLE)
    }
}

/// Options for the inbox idempotency gate.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct InboxConfig {
    pub ttl_ms: Option<u64>,
    pub table_name: Option<String>,
}

impl InboxConfig {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("SLUICE_INBOX_").from_env::<Self>()?)
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms.unwrap_or(defaults::LOCK_TTL_MS)
    }

    pub fn table_name(&self) -> &str {
        self.table_name
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or(defaults::INBOX_TABLE)
    }
}

/// Options for the emit façade.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct OutboxConfig {
    pub table_name: Option<String>,
}

impl OutboxConfig {
    pub fn table_name(&self) -> &str {
        self.table_name
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or(defaults::OUTBOX_TABLE)
    }
}
