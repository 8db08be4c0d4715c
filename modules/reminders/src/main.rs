use std::sync::Arc;

use event_bus::{AmqpBus, EventBus, EventPublisher, InMemoryBus, EVENTS_EXCHANGE};
use event_consumer::{
    cancel_on_signal, spawn_idempotency_cleanup, ConsumerMetrics, ConsumerRuntime,
    PgIdempotencyStore,
};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reminders::config::{BusType, Config, SERVICE_NAME};
use reminders::routes::{self, AppState};
use reminders::{db, handlers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reminders=debug,event_consumer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        service = SERVICE_NAME,
        bus_type = ?config.bus_type,
        queue = %config.consumer.queue_name(),
        "Starting reminder service"
    );

    let pool = db::create_pool(&config.consumer.database_url).await?;
    db::run_migrations(&pool).await?;
    let store = Arc::new(PgIdempotencyStore::new(pool.clone()));
    store.ensure_schema().await?;

    // Consuming and publishing run on separate channels
    let (consumer_bus, publisher_bus, broker): (Arc<dyn EventBus>, Arc<dyn EventBus>, Option<AmqpBus>) =
        match config.bus_type {
            BusType::Amqp => {
                let bus = AmqpBus::connect(&config.consumer.rabbitmq_url, SERVICE_NAME).await?;
                let publisher = bus.open_channel().await?;
                (Arc::new(bus.clone()), Arc::new(publisher), Some(bus))
            }
            BusType::InMemory => {
                tracing::warn!("Running on the in-memory bus; events stay inside this process");
                let bus = InMemoryBus::new();
                (Arc::new(bus.channel()), Arc::new(bus.channel()), None)
            }
        };

    let registry = Registry::new();
    let metrics = ConsumerMetrics::new(&registry)?;

    let publisher = EventPublisher::new(Arc::clone(&publisher_bus), EVENTS_EXCHANGE);
    publisher.declare().await?;

    let mut runtime = ConsumerRuntime::new(config.consumer.clone(), consumer_bus, publisher, Arc::clone(&store))
        .with_metrics(metrics);
    handlers::register(&mut runtime);

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let cleanup = spawn_idempotency_cleanup(
        Arc::clone(&store),
        config.consumer.idempotency_retention_days,
        config.consumer.idempotency_cleanup_interval,
        shutdown.clone(),
    );

    let app = routes::router(Arc::new(AppState {
        db: pool,
        broker,
        registry,
    }));
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "HTTP server listening");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let consumed = runtime.run(shutdown.clone()).await;
    // A runtime that stops on its own takes the rest of the process with it
    shutdown.cancel();
    drop(runtime);

    if let Err(e) = cleanup.await {
        tracing::error!(error = %e, "Idempotency cleanup task failed");
    }
    server.await??;
    publisher_bus.close().await?;

    consumed?;
    tracing::info!("Reminder service stopped");
    Ok(())
}
