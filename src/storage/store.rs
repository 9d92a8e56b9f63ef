use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Serialize };
use std::time::Duration;

/// Emails per inbox; older entries are evicted on insert.
pub const INBOX_CAP: usize = 100;

/// Both inbox keys expire this long after the last write.
pub const INBOX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One received message. Serialized as JSON into the per-address mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Email {
    #[serde(default)]
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// The shared KV-backed store both the SMTP and HTTP planes rendezvous
/// through. Single production implementation (Redis) plus an in-memory
/// implementation for tests.
///
/// Key layout:
/// - `inbox:<addr>`          ordered set, member=email-id, score=unix-seconds
/// - `emails:<addr>`         mapping email-id -> JSON payload
/// - `active_address:<addr>` "1", TTL = registration window
/// - `nonce:<uuid>`          "1", TTL = signature window
/// - `ratelimit:<prefix>:<ip>` counter, TTL = window
#[async_trait]
pub trait EmailStore: Send + Sync {
    /// Append one email to the address inbox. Assigns a UUID if the id is
    /// empty, evicts beyond [`INBOX_CAP`] and resets both key TTLs.
    async fn save_email(&self, address: &str, email: Email) -> anyhow::Result<()>;

    /// All stored emails, newest first. Entries whose payload is missing
    /// from the mapping are skipped with a log line, not errors.
    async fn get_emails(&self, address: &str) -> anyhow::Result<Vec<Email>>;

    /// A single email, or `None` if absent. Absence is not an error.
    async fn get_email(&self, address: &str, email_id: &str) -> anyhow::Result<Option<Email>>;

    /// Remove one email from both representations. Idempotent.
    async fn delete_email(&self, address: &str, email_id: &str) -> anyhow::Result<()>;

    /// Drop the whole inbox; returns the number of keys removed.
    async fn clear_inbox(&self, address: &str) -> anyhow::Result<i64>;

    /// Mark the address active for `ttl`, replacing any existing marker.
    async fn register_address(&self, address: &str, ttl: Duration) -> anyhow::Result<()>;

    /// True iff the active marker exists.
    async fn is_address_active(&self, address: &str) -> anyhow::Result<bool>;

    /// Sliding-window-free counter: first touch in the window sets the
    /// counter with the window TTL, later touches increment. Returns
    /// `(allowed, remaining)` where allowed iff count <= limit.
    async fn check_rate_limit(
        &self,
        key: &str,
        limit: u32,
        window: Duration
    ) -> anyhow::Result<(bool, u32)>;

    /// Atomic set-if-absent. Returns true iff this call created the key,
    /// i.e. the nonce was unused.
    async fn check_and_store_nonce(&self, nonce: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Liveness probe.
    async fn ping(&self) -> anyhow::Result<()>;
}
