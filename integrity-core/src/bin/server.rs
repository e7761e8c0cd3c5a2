//! Integrity engine server binary

use integrity_core::{Config, IntegrityEngine};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("INTEGRITY_CONFIG") {
        Ok(path) => Config::from_file(path)?,
        Err(_) => Config::from_env()?,
    };

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(service = %config.service_name, "Starting integrity engine");

    let sweep_interval = Duration::from_secs(config.idempotency.sweep_interval_secs);
    let engine = IntegrityEngine::open(config)?;

    let report = engine.reconciler().run()?;
    if !report.is_clean() {
        tracing::error!(findings = report.findings.len(), "Drift found at startup");
    }

    let sweeper = tokio::spawn(Arc::new(engine.sweeper()).start(sweep_interval));

    let mut events = engine.events().subscribe();
    let relay = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => tracing::debug!(
                    id = %envelope.id,
                    subject = envelope.event.subject(),
                    "Event published"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down integrity engine");
    sweeper.abort();
    relay.abort();
    Ok(())
}
