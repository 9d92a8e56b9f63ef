use std::sync::Arc;
use std::time::Duration;

use anyhow::{ anyhow, Context, Result };
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

use crate::{ api, protocol, storage::{ EmailStore, RedisStore }, utils::config::Config };

/// Process-wide shared state: the configuration and the one store both
/// planes coordinate through. There is no other cross-plane channel.
pub struct Runtime {
    pub config: Arc<Config>,
    pub store: Arc<dyn EmailStore>,
}

impl Runtime {
    /// Connect to the store and verify it answers before any listener
    /// starts; an unreachable store is a startup failure, not a degraded
    /// mode.
    pub async fn connect(config: Arc<Config>) -> Result<Self> {
        let store = RedisStore::connect(&config.redis_addr, &config.redis_password).await?;

        tokio::time
            ::timeout(Duration::from_secs(5), store.ping()).await
            .map_err(|_| anyhow!("Redis ping timed out"))?
            .with_context(|| format!("Failed to reach Redis at {}", config.redis_addr))?;
        info!("Connected to Redis at {}", config.redis_addr);

        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    /// Spawn the SMTP and HTTP servers. Each runs until it fails or the
    /// shutdown signal flips.
    pub fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>, tasks: &mut JoinSet<Result<()>>) {
        {
            let rt = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tasks.spawn(async move { protocol::smtp::run_smtp_server(rt, shutdown).await });
        }
        {
            let rt = Arc::clone(&self);
            tasks.spawn(async move { api::run_api(rt, shutdown).await });
        }
    }
}
