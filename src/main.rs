use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use courtside::allocator::Allocator;
use courtside::catalog;
use courtside::clock::{Clock, SystemClock};
use courtside::config::Config;
use courtside::ledger::{Ledger, WalLedger};
use courtside::mail::MailSink;
use courtside::notify::{Fanout, NotificationSink, NotifyHub};
use courtside::policy::SlotPolicy;
use courtside::server::{self, ServerContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    courtside::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = WalLedger::open(&config.wal_path(), clock.clone(), config.zone)?;

    let seeds = match &config.catalog {
        Some(path) => catalog::load(path)?,
        None => catalog::default_catalog(),
    };
    catalog::seed(&ledger, &seeds).await?;

    let policy = match &config.slot_policy {
        Some(path) => SlotPolicy::load(path)?,
        None => SlotPolicy::default(),
    };

    let hub: Arc<dyn NotificationSink> = Arc::new(NotifyHub::new());
    let mail: Arc<dyn NotificationSink> = Arc::new(MailSink::new(&config.mail, config.zone)?);
    let sink = Arc::new(Fanout::new(vec![hub, mail]));

    let allocator = Allocator::new(
        Arc::new(ledger.clone()) as Arc<dyn Ledger>,
        policy,
        clock,
        config.zone,
        sink,
    )
    .with_retry(config.retry.clone())
    .with_notify_timeout(config.notify_timeout);
    let ctx = Arc::new(ServerContext::new(Arc::new(allocator), config.admins.clone()));

    tokio::spawn(courtside::compactor::run_compactor(
        ledger,
        config.compact_threshold,
    ));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("courtside listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  utc offset: {}", config.zone.offset());
    info!("  mail: {}", config.mail.transport);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("cannot listen for SIGTERM: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(courtside::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(courtside::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(courtside::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let ctx = ctx.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = server::process_connection(socket, ctx).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(courtside::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("courtside stopped");
    Ok(())
}
