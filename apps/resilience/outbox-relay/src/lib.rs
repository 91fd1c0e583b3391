//! Outbox Relay
//!
//! Forwards transactional outbox records from PostgreSQL to Redis Streams.
//!
//! ## Architecture
//!
//! ```text
//! transactional_messages (PENDING, stale)
//!   ↓ OutboxForwarder (every OUTBOX_POLL_INTERVAL_MS)
//! Redis Stream <topic>
//! ```
//!
//! With `LEADER_LOCK_ENABLED`, replicas queue on an etcd-backed fair lock and
//! only the holder forwards. Losing the etcd session stops the relay.

pub mod config;
pub mod connect;
pub mod leader;
pub mod retry;

use coordination::{DistributedLock, EtcdCoordinator, SessionState};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr, eyre};
use messaging::RedisStreamPublisher;
use migration::{Migrator, MigratorTrait};
use outbox::{OutboxForwarder, OutboxService, PgOutboxStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::connect::{connect_etcd, connect_postgres, connect_redis};
use crate::leader::acquire_leadership;

/// Run the relay until SIGINT/SIGTERM
///
/// # Errors
///
/// Returns an error if configuration is invalid, a backing service stays
/// unreachable after retries, migrations fail, or the leader session is lost.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    let config = AppConfig::from_env().wrap_err("Failed to load relay configuration")?;
    core_config::tracing::init_tracing(&environment, &config.service_name);

    messaging::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    info!(
        service = %config.service_name,
        environment = ?environment,
        poll_interval_ms = config.outbox.poll_interval.as_millis() as u64,
        batch_size = config.outbox.batch_size,
        leader_lock = config.leader.is_some(),
        "Starting outbox relay"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "Error waiting for shutdown signal");
            }
            let _ = shutdown_tx.send(true);
        });
    }

    let result = serve(&config, shutdown_tx, shutdown_rx).await;

    core_config::tracing::shutdown_tracing();
    info!("Outbox relay stopped");
    result
}

async fn serve(
    config: &AppConfig,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let db = connect_postgres(&config.database, &config.connect_retry)
        .await
        .wrap_err("Failed to connect to PostgreSQL")?;

    if config.run_migrations {
        info!("Running database migrations...");
        Migrator::up(&db, None)
            .await
            .wrap_err("Failed to run migrations")?;
    }

    let redis = connect_redis(&config.redis_url, &config.connect_retry)
        .await
        .wrap_err("Failed to connect to Redis")?;
    let publisher = RedisStreamPublisher::new(redis).with_max_length(config.stream_max_length);

    // Leadership, when enabled, gates everything below
    let session_lost = Arc::new(AtomicBool::new(false));
    let mut leadership = None;
    if let Some(leader) = &config.leader {
        let coordinator = Arc::new(
            connect_etcd(&leader.coordination, &config.connect_retry)
                .await
                .wrap_err("Failed to connect to etcd")?,
        );
        let mut lock = DistributedLock::with_options(
            coordinator.clone(),
            leader.resource.clone(),
            leader.coordination.lock_options(),
        )
        .await
        .wrap_err("Failed to prepare leader lock")?;

        let attempt_timeout = leader.coordination.lock_wait_timeout;
        if !acquire_leadership(&mut lock, attempt_timeout, &shutdown_rx)
            .await
            .wrap_err("Failed to acquire leadership")?
        {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }

        watch_session(&coordinator, shutdown_tx.clone(), session_lost.clone());
        leadership = Some((coordinator, lock));
    }

    let store = Arc::new(PgOutboxStore::new(db).with_stale_after(config.outbox.stale_after));
    let service = Arc::new(OutboxService::new(
        store,
        Arc::new(publisher),
        config.outbox.clone(),
    ));
    let forwarder = OutboxForwarder::new(service);

    forwarder.run(shutdown_rx).await;

    if let Some((coordinator, mut lock)) = leadership {
        if let Err(e) = lock.unlock().await {
            warn!(error = %e, "Failed to release leadership");
        }
        drop(lock);
        if let Ok(coordinator) = Arc::try_unwrap(coordinator) {
            if let Err(e) = coordinator.close().await {
                warn!(error = %e, "Failed to close coordination session");
            }
        }
    }

    if session_lost.load(Ordering::SeqCst) {
        return Err(eyre!("Coordination session lost while leading"));
    }
    Ok(())
}

/// Stop the relay if the etcd session expires: the lock is no longer ours.
fn watch_session(
    coordinator: &EtcdCoordinator,
    shutdown_tx: Arc<watch::Sender<bool>>,
    session_lost: Arc<AtomicBool>,
) {
    let mut events = coordinator.session_events();
    tokio::spawn(async move {
        if events
            .wait_for(|state| *state == SessionState::Expired)
            .await
            .is_ok()
        {
            error!("Coordination session expired, giving up leadership");
            session_lost.store(true, Ordering::SeqCst);
            let _ = shutdown_tx.send(true);
        }
    });
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
