//! Mailroom Worker Service
//!
//! A background worker that periodically drains the durable email queue.
//!
//! ## Architecture
//!
//! ```text
//! Redis (mailroom:queue:*)
//!   ↓ (process_queue tick)
//! DeliveryService
//!   ↓ (renders nothing - rows are pre-rendered)
//! EmailProvider (SMTP for real delivery, mock for local runs)
//!   ↓
//! mark_sent / mark_failed (retry with exponential backoff)
//! ```
//!
//! The library core spawns no timers; this binary is the periodic trigger.
//! It also runs an occasional maintenance pass that purges old terminal
//! rows, and shuts down gracefully on ctrl-c.

use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{Result, WrapErr};
use mailroom::{
    DeliveryConfig, DeliveryService, EmailProvider, MockProvider, ProviderKind, RedisQueue,
    SmtpProvider, TemplateEngine,
};
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Worker-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Redis connection string.
    pub redis_url: String,
    /// How often to run a processing tick.
    pub poll_interval: Duration,
    /// How often to run the maintenance purge.
    pub purge_interval: Duration,
    /// Age past which terminal rows are purged.
    pub purge_age: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            poll_interval: Duration::from_millis(
                std::env::var("EMAIL_POLL_INTERVAL_MS")
                    .unwrap_or_else(|_| "500".to_string())
                    .parse()
                    .unwrap_or(500),
            ),
            purge_interval: Duration::from_secs(
                std::env::var("EMAIL_PURGE_INTERVAL_SECS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .unwrap_or(3600),
            ),
            purge_age: Duration::from_secs(
                std::env::var("EMAIL_PURGE_AGE_DAYS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse::<u64>()
                    .unwrap_or(30)
                    * 24
                    * 60
                    * 60,
            ),
        }
    }
}

/// Run the email worker.
///
/// Wires configuration, Redis, the template engine and the selected
/// provider, then ticks `process_queue` until shutdown.
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DeliveryConfig::default();
    let settings = WorkerSettings::default();

    info!(
        provider = %config.provider,
        batch_size = config.batch_size,
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        "Starting mailroom worker"
    );

    info!("Connecting to Redis...");
    let client =
        redis::Client::open(settings.redis_url.as_str()).wrap_err("Invalid Redis URL")?;
    let redis = ConnectionManager::new(client)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let queue = Arc::new(RedisQueue::new(redis));
    let templates = Arc::new(TemplateEngine::new().wrap_err("Failed to build template engine")?);

    match config.provider {
        ProviderKind::Smtp => {
            let provider = match SmtpProvider::from_env() {
                Ok(provider) => provider,
                Err(err) => {
                    warn!(error = %err, "SMTP not fully configured, using local relay");
                    SmtpProvider::local().wrap_err("Failed to build SMTP provider")?
                }
            };
            let service = DeliveryService::new(queue, templates, provider, config);
            run_worker(service, settings).await
        }
        ProviderKind::Mock => {
            let service = DeliveryService::new(queue, templates, MockProvider::new(), config);
            run_worker(service, settings).await
        }
    }
}

async fn run_worker<P: EmailProvider + 'static>(
    service: DeliveryService<P>,
    settings: WorkerSettings,
) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(err) = service.health_check().await {
        warn!(error = %err, "Initial health check failed, continuing anyway");
    }

    let mut tick = tokio::time::interval(settings.poll_interval);
    let mut last_purge = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Received shutdown signal, stopping worker");
                    break;
                }
            }
            _ = tick.tick() => {
                match service.process_queue().await {
                    Ok(summary) if summary.processed > 0 => {
                        info!(
                            processed = summary.processed,
                            sent = summary.sent,
                            retried = summary.retried,
                            failed = summary.failed,
                            "Processed batch"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(error = %err, "Queue processing tick failed");
                    }
                }

                if last_purge.elapsed() >= settings.purge_interval {
                    match service.purge_old(settings.purge_age).await {
                        Ok(removed) if removed > 0 => {
                            info!(removed = removed, "Purged old queue rows");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "Maintenance purge failed");
                        }
                    }
                    last_purge = Instant::now();
                }
            }
        }
    }

    info!("Mailroom worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.purge_age, Duration::from_secs(30 * 24 * 60 * 60));
    }
}
