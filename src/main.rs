mod api;
mod identity;
mod protocol;
mod runtime;
mod storage;
mod utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ anyhow, Result };
use tokio::signal::unix::{ signal, SignalKind };
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{ error, info };

use crate::runtime::Runtime;
use crate::utils::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env());
    let runtime = Arc::new(Runtime::connect(config.clone()).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    info!("coresend starting for domain {}", config.domain);
    runtime.run(shutdown_rx, &mut tasks);

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down servers...");
        }
        finished = tasks.join_next() => {
            // A listener died before any shutdown was requested.
            return match finished {
                Some(Ok(Err(e))) => Err(e),
                Some(Err(e)) => Err(anyhow!("server task panicked: {}", e)),
                _ => Err(anyhow!("server exited unexpectedly")),
            };
        }
    }

    let _ = shutdown_tx.send(true);

    let drain = async {
        while let Some(finished) = tasks.join_next().await {
            match finished {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server shutdown error: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        error!("Drain window elapsed, forcing shutdown");
    }

    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}
