use anyhow::{ Context, Result };
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{ AsyncCommands, ExistenceCheck, SetExpiry, SetOptions };
use std::time::Duration;
use tracing::{ debug, info, warn };
use uuid::Uuid;

use super::store::{ Email, EmailStore, INBOX_CAP, INBOX_TTL };

fn inbox_key(address: &str) -> String {
    format!("inbox:{}", address)
}

fn emails_key(address: &str) -> String {
    format!("emails:{}", address)
}

fn active_key(address: &str) -> String {
    format!("active_address:{}", address)
}

fn nonce_key(nonce: &str) -> String {
    format!("nonce:{}", nonce)
}

fn ratelimit_key(key: &str) -> String {
    format!("ratelimit:{}", key)
}

/// Redis-backed [`EmailStore`]. The connection manager multiplexes one
/// process-wide connection shared by the SMTP and HTTP planes and
/// reconnects on failure.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(addr: &str, password: &str) -> Result<Self> {
        let (host, port) = split_host_port(addr);
        debug!("Connecting to Redis at {}:{}", host, port);

        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                db: 0,
                password: if password.is_empty() { None } else { Some(password.to_string()) },
                ..Default::default()
            },
        };

        let client = redis::Client::open(info).context("Invalid Redis connection info")?;
        let conn = client
            .get_connection_manager().await
            .with_context(|| format!("Failed to connect to Redis at {}", addr))?;

        info!("Redis connected at {}", addr);
        Ok(Self { conn })
    }
}

fn split_host_port(addr: &str) -> (&str, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let host = if host.is_empty() { "localhost" } else { host };
            (host, port.parse().unwrap_or(6379))
        }
        None => (addr, 6379),
    }
}

#[async_trait]
impl EmailStore for RedisStore {
    async fn save_email(&self, address: &str, mut email: Email) -> Result<()> {
        if email.id.is_empty() {
            email.id = Uuid::new_v4().to_string();
        }

        let payload = serde_json::to_string(&email)?;
        let zkey = inbox_key(address);
        let hkey = emails_key(address);
        let score = Utc::now().timestamp() as f64;
        let ttl = INBOX_TTL.as_secs() as i64;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .zadd(&zkey, &email.id, score).ignore()
            .hset(&hkey, &email.id, payload).ignore()
            // keep the newest INBOX_CAP members
            .zremrangebyrank(&zkey, 0, -(INBOX_CAP as isize) - 1).ignore()
            .expire(&zkey, ttl).ignore()
            .expire(&hkey, ttl).ignore()
            .query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_emails(&self, address: &str) -> Result<Vec<Email>> {
        let zkey = inbox_key(address);
        let hkey = emails_key(address);

        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrevrange(&zkey, 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&hkey)
            .arg(&ids)
            .query_async(&mut conn).await?;

        let mut emails = Vec::with_capacity(raw.len());
        for (id, item) in ids.iter().zip(raw) {
            let Some(data) = item else {
                warn!("Skipping email with missing payload: {}", id);
                continue;
            };
            match serde_json::from_str::<Email>(&data) {
                Ok(email) => emails.push(email),
                Err(e) => warn!("Skipping unparsable email {}: {}", id, e),
            }
        }
        Ok(emails)
    }

    async fn get_email(&self, address: &str, email_id: &str) -> Result<Option<Email>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.hget(emails_key(address), email_id).await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn delete_email(&self, address: &str, email_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .zrem(inbox_key(address), email_id).ignore()
            .hdel(emails_key(address), email_id).ignore()
            .query_async(&mut conn).await?;
        Ok(())
    }

    async fn clear_inbox(&self, address: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(&[inbox_key(address), emails_key(address)]).await?;
        Ok(removed)
    }

    async fn register_address(&self, address: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(active_key(address), "1", ttl.as_secs()).await?;
        Ok(())
    }

    async fn is_address_active(&self, address: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(active_key(address)).await?;
        Ok(exists)
    }

    async fn check_rate_limit(
        &self,
        key: &str,
        limit: u32,
        window: Duration
    ) -> Result<(bool, u32)> {
        let key = ratelimit_key(key);
        let mut conn = self.conn.clone();

        // SET NX anchors the TTL to the first request in the window.
        let opts = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::EX(window.as_secs()));
        let created: bool = conn.set_options(&key, 1, opts).await?;

        let count: i64 = if created { 1 } else { conn.incr(&key, 1).await? };

        let remaining = (limit as i64 - count).max(0) as u32;
        Ok((count <= limit as i64, remaining))
    }

    async fn check_and_store_nonce(&self, nonce: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let opts = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::EX(ttl.as_secs()));
        let created: bool = conn.set_options(nonce_key(nonce), "1", opts).await?;
        Ok(created)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn).await
            .context("Redis ping failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::split_host_port;

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("localhost:6379"), ("localhost", 6379));
        assert_eq!(split_host_port("redis.internal:7000"), ("redis.internal", 7000));
        assert_eq!(split_host_port(":6380"), ("localhost", 6380));
        assert_eq!(split_host_port("justhost"), ("justhost", 6379));
    }
}
