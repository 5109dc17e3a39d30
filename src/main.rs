use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use pharma_wms as wms;
use wms::audit::TracingAuditSink;
use wms::context::OperationContext;
use wms::events::{process_events, EventSender};
use wms::master_data::InMemoryMasterData;
use wms::notifications::EventBusNotifier;
use wms::services::factory::{ServiceContainer, ServiceFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = wms::config::load_config().context("loading configuration")?;
    wms::config::init_tracing(&cfg.log_level, cfg.log_json);

    let db_pool = wms::db::establish_connection_from_app_config(&cfg)
        .await
        .context("connecting to database")?;
    if cfg.auto_migrate {
        wms::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }

    let (event_sender, event_rx) = EventSender::channel(cfg.event_channel_capacity);
    let event_task = tokio::spawn(process_events(event_rx, Vec::new()));

    let factory = ServiceFactory::new(
        Arc::new(db_pool),
        event_sender.clone(),
        Arc::new(TracingAuditSink),
        Arc::new(EventBusNotifier::new(event_sender)),
        Arc::new(InMemoryMasterData::new()),
    )
    .with_config(&cfg);
    let services = ServiceContainer::new(&factory);
    drop(factory);

    // Startup sweep: anything that expired while the process was down.
    let ctx = OperationContext::system();
    match services.batches.expire_batches(&ctx, chrono::Utc::now().date_naive()).await {
        Ok(summary) => info!(
            expired_batches = summary.expired_batches.len(),
            expired_allocations = summary.expired_allocations,
            "Expiry sweep finished"
        ),
        Err(e) => warn!(error = %e, "Expiry sweep failed"),
    }
    if let Err(e) = services.batches.notify_expiring_batches(None).await {
        warn!(error = %e, "Expiry warning failed");
    }

    info!(
        environment = %cfg.environment,
        strategy = %services.allocations.default_strategy(),
        "pharma-wms ready"
    );

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    drop(services);
    if let Err(e) = event_task.await {
        warn!(error = %e, "Event loop terminated abnormally");
    }
    Ok(())
}
