// ABOUTME: Relay hub entry point: config load, PID lock, tracing, and startup
// ABOUTME: Runs until interrupted, then releases the lock on the way out

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chathub::agent::ProcessInvoker;
use chathub::broker::RedisBroker;
use chathub::pidlock::PidLock;
use chathub::{Config, RelayHub};

#[tokio::main]
async fn main() -> Result<()> {
    // Panics in spawned tasks should be loud, not silent
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {}", info);
    }));

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load configuration")?;

    // Held for the whole process lifetime; released by Drop on exit
    let _lock = PidLock::acquire(&config.lock.pid_file)?;

    let broker = Arc::new(RedisBroker::new(&config.broker.url)?);
    let invoker = Arc::new(ProcessInvoker::new(config.agent.clone()));
    let hub = Arc::new(RelayHub::new(config, broker, invoker)?);

    hub.run().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    Ok(())
}
