//! Herald worker: runs the notification dispatcher, reminder scheduler,
//! notification intake, retention cleanup and the operator API in one process.

mod retention;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_api::routes::create_router;
use herald_api::state::AppState;
use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::redis_pool::create_redis_pool;
use herald_common::types::DeliveryChannel;
use herald_notifier::backoff::RetryPolicy;
use herald_notifier::batcher::{BatchSettings, DispatchBatcher};
use herald_notifier::discord::DiscordWebhookProvider;
use herald_notifier::provider::ChannelRouter;
use herald_notifier::renderer::HandlebarsRenderer;
use herald_notifier::store::{CachedNotificationStore, NotificationStore, PgNotificationStore};
use herald_notifier::{NotificationDispatcher, NotificationIntake, ReminderRoutes};
use herald_scheduler::calendar::parse_timezone;
use herald_scheduler::reminder::ReminderScheduler;
use herald_scheduler::store::PgScheduleStore;

/// Capacity of the intake and due-signal channels.
const CHANNEL_CAPACITY: usize = 256;

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_worker=info,herald_notifier=info,herald_scheduler=info,herald_api=info,tower_http=info")
        }))
        .json()
        .init();

    tracing::info!("Herald worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let pg_store = PgNotificationStore::new(pool.clone());
    let notifications: Arc<dyn NotificationStore> = match &config.redis_url {
        Some(url) => {
            let redis = create_redis_pool(url).await?;
            tracing::info!(ttl_secs = config.cache_ttl_secs, "Notification cache enabled");
            Arc::new(CachedNotificationStore::new(pg_store, redis, config.cache_ttl_secs))
        }
        None => {
            tracing::info!("REDIS_URL not set, notification cache disabled");
            Arc::new(pg_store)
        }
    };

    // Delivery pipeline
    let discord = DiscordWebhookProvider::new()?.with_username("Herald");
    let router = ChannelRouter::new().with_provider(DeliveryChannel::Chat, Arc::new(discord));
    let batcher = Arc::new(DispatchBatcher::new(
        Arc::new(router),
        BatchSettings::from_config(&config.dispatch),
    ));
    let dispatcher = Arc::new(NotificationDispatcher::new(
        notifications.clone(),
        Arc::new(HandlebarsRenderer::new()?),
        batcher,
        RetryPolicy::from_config(&config.dispatch),
        config.dispatch.dispatch_tick_interval,
    ));

    // Reminders
    let (signal_tx, signal_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let scheduler = Arc::new(ReminderScheduler::new(
        Arc::new(PgScheduleStore::new(pool.clone())),
        signal_tx,
        parse_timezone(&config.scheduler_timezone)?,
        config.dispatch.scheduler_tick_interval,
    ));

    let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let routes = ReminderRoutes::new(
        config.reminder_routes.clone(),
        config.reminder_default_recipient.clone(),
    );
    if config.reminder_routes.is_empty() && config.reminder_default_recipient.is_none() {
        tracing::warn!("No reminder routes configured, due reminders will be dropped");
    }
    let intake = Arc::new(NotificationIntake::new(notifications.clone(), dispatcher.clone(), routes));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { dispatcher.run(shutdown).await }));
    }
    {
        let scheduler = scheduler.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { scheduler.run(shutdown).await }));
    }
    {
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            intake.run(request_rx, signal_rx, shutdown).await
        }));
    }
    tasks.push(tokio::spawn(retention::run(
        notifications.clone(),
        config.retention_days,
        shutdown_rx.clone(),
    )));

    // Operator API
    let bind_addr = config.api_bind_addr.clone();
    let state = AppState::new(config, notifications, scheduler, request_tx);
    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "API server listening");

    let mut api_shutdown = shutdown_rx.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    // Run until Ctrl+C or the API server dies
    let mut server_done = false;
    tokio::select! {
        result = &mut server => {
            server_done = true;
            match result {
                Ok(Ok(())) => tracing::warn!("API server exited"),
                Ok(Err(e)) => tracing::error!(error = %e, "API server exited with error"),
                Err(e) => tracing::error!(error = %e, "API server task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    let _ = shutdown_tx.send(true);

    if !server_done {
        if let Err(e) = server.await {
            tracing::error!(error = %e, "API server task failed during shutdown");
        }
    }
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task failed during shutdown");
        }
    }

    tracing::info!("Herald worker stopped.");
    Ok(())
}
