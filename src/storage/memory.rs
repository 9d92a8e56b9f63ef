//! In-memory [`EmailStore`] used by tests. Mirrors the Redis semantics:
//! newest-first listing, cap eviction on insert, set-if-absent nonces and
//! TTL-anchored rate-limit windows.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{ Duration, Instant };
use uuid::Uuid;

use super::store::{ Email, EmailStore, INBOX_CAP };

struct Entry {
    id: String,
    score: i64,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    inboxes: HashMap<String, Vec<Entry>>,
    payloads: HashMap<String, HashMap<String, Email>>,
    active: HashMap<String, Instant>,
    nonces: HashMap<String, Instant>,
    counters: HashMap<String, (u32, Instant)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_ping: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ping` report the store as down.
    pub fn set_unavailable(&self, down: bool) {
        *self.fail_ping.lock().unwrap() = down;
    }
}

#[async_trait]
impl EmailStore for MemoryStore {
    async fn save_email(&self, address: &str, mut email: Email) -> anyhow::Result<()> {
        if email.id.is_empty() {
            email.id = Uuid::new_v4().to_string();
        }

        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let seq = inner.seq;

        let entries = inner.inboxes.entry(address.to_string()).or_default();
        entries.retain(|e| e.id != email.id);
        entries.push(Entry {
            id: email.id.clone(),
            score: Utc::now().timestamp(),
            seq,
        });
        entries.sort_by_key(|e| (e.score, e.seq));

        let mut evicted = Vec::new();
        while entries.len() > INBOX_CAP {
            evicted.push(entries.remove(0).id);
        }

        let payloads = inner.payloads.entry(address.to_string()).or_default();
        payloads.insert(email.id.clone(), email);
        for id in evicted {
            payloads.remove(&id);
        }
        Ok(())
    }

    async fn get_emails(&self, address: &str) -> anyhow::Result<Vec<Email>> {
        let inner = self.inner.lock().unwrap();
        let Some(entries) = inner.inboxes.get(address) else {
            return Ok(Vec::new());
        };
        let payloads = inner.payloads.get(address);
        Ok(
            entries
                .iter()
                .rev()
                .filter_map(|e| payloads.and_then(|p| p.get(&e.id)).cloned())
                .collect()
        )
    }

    async fn get_email(&self, address: &str, email_id: &str) -> anyhow::Result<Option<Email>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.payloads.get(address).and_then(|p| p.get(email_id)).cloned())
    }

    async fn delete_email(&self, address: &str, email_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entries) = inner.inboxes.get_mut(address) {
            entries.retain(|e| e.id != email_id);
        }
        if let Some(payloads) = inner.payloads.get_mut(address) {
            payloads.remove(email_id);
        }
        Ok(())
    }

    async fn clear_inbox(&self, address: &str) -> anyhow::Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = 0;
        if inner.inboxes.remove(address).is_some() {
            removed += 1;
        }
        if inner.payloads.remove(address).is_some() {
            removed += 1;
        }
        Ok(removed)
    }

    async fn register_address(&self, address: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.active.insert(address.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn is_address_active(&self, address: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let active = match inner.active.get(address) {
            Some(expiry) => *expiry > Instant::now(),
            None => false,
        };
        if !active {
            inner.active.remove(address);
        }
        Ok(active)
    }

    async fn check_rate_limit(
        &self,
        key: &str,
        limit: u32,
        window: Duration
    ) -> anyhow::Result<(bool, u32)> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let counter = inner.counters.entry(key.to_string()).or_insert((0, now + window));
        if counter.1 <= now {
            *counter = (0, now + window);
        }
        counter.0 += 1;
        let count = counter.0;
        Ok((count <= limit, limit.saturating_sub(count)))
    }

    async fn check_and_store_nonce(&self, nonce: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let spent = match inner.nonces.get(nonce) {
            Some(expiry) => *expiry > now,
            None => false,
        };
        if !spent {
            inner.nonces.insert(nonce.to_string(), now + ttl);
        }
        Ok(!spent)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        if *self.fail_ping.lock().unwrap() {
            anyhow::bail!("store unavailable");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(id: &str, subject: &str) -> Email {
        Email {
            id: id.to_string(),
            from: "sender@example.com".to_string(),
            to: vec!["a".repeat(40)],
            subject: subject.to_string(),
            body: "body".to_string(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn inbox_caps_at_newest_hundred() {
        let store = MemoryStore::new();
        let addr = "a".repeat(40);
        for i in 0..101 {
            store.save_email(&addr, email(&format!("id-{:03}", i), "s")).await.unwrap();
        }

        let emails = store.get_emails(&addr).await.unwrap();
        assert_eq!(emails.len(), INBOX_CAP);
        assert_eq!(emails[0].id, "id-100");
        assert!(emails.iter().all(|e| e.id != "id-000"));
        assert!(store.get_email(&addr, "id-000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_is_newest_first() {
        let store = MemoryStore::new();
        let addr = "b".repeat(40);
        for i in 0..5 {
            store.save_email(&addr, email(&format!("id-{}", i), "s")).await.unwrap();
        }
        let ids: Vec<String> = store
            .get_emails(&addr).await.unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["id-4", "id-3", "id-2", "id-1", "id-0"]);
    }

    #[tokio::test]
    async fn save_assigns_id_when_empty() {
        let store = MemoryStore::new();
        let addr = "c".repeat(40);
        let mut e = email("", "no id yet");
        e.id = String::new();
        store.save_email(&addr, e).await.unwrap();

        let emails = store.get_emails(&addr).await.unwrap();
        assert_eq!(emails.len(), 1);
        assert!(Uuid::parse_str(&emails[0].id).is_ok());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        let addr = "d".repeat(40);
        store.save_email(&addr, email("id-1", "s")).await.unwrap();

        store.delete_email(&addr, "id-1").await.unwrap();
        store.delete_email(&addr, "id-1").await.unwrap();
        store.delete_email(&addr, "never-existed").await.unwrap();
        assert!(store.get_emails(&addr).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_reports_removed_keys() {
        let store = MemoryStore::new();
        let addr = "e".repeat(40);
        assert_eq!(store.clear_inbox(&addr).await.unwrap(), 0);
        store.save_email(&addr, email("id-1", "s")).await.unwrap();
        assert_eq!(store.clear_inbox(&addr).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn registration_expires() {
        let store = MemoryStore::new();
        let addr = "f".repeat(40);
        assert!(!store.is_address_active(&addr).await.unwrap());

        store.register_address(&addr, Duration::from_secs(60)).await.unwrap();
        assert!(store.is_address_active(&addr).await.unwrap());

        store.register_address(&addr, Duration::ZERO).await.unwrap();
        assert!(!store.is_address_active(&addr).await.unwrap());
    }

    #[tokio::test]
    async fn nonce_single_use() {
        let store = MemoryStore::new();
        assert!(store.check_and_store_nonce("n-1", Duration::from_secs(300)).await.unwrap());
        assert!(!store.check_and_store_nonce("n-1", Duration::from_secs(300)).await.unwrap());
        // an expired nonce may be reused
        assert!(store.check_and_store_nonce("n-2", Duration::ZERO).await.unwrap());
        assert!(store.check_and_store_nonce("n-2", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn rate_limit_counts_down_then_denies() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);
        for i in 0..3 {
            let (allowed, remaining) = store.check_rate_limit("inbox:1.2.3.4", 3, window).await.unwrap();
            assert!(allowed);
            assert_eq!(remaining, 2 - i);
        }
        let (allowed, remaining) = store.check_rate_limit("inbox:1.2.3.4", 3, window).await.unwrap();
        assert!(!allowed);
        assert_eq!(remaining, 0);

        // distinct keys have distinct windows
        let (allowed, _) = store.check_rate_limit("inbox:5.6.7.8", 3, window).await.unwrap();
        assert!(allowed);
    }
}
