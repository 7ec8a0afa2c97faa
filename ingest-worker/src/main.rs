//! Consume login events from a queue, mask their PII and append them to `user_logins`.
use std::sync::Arc;

use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ingest_common::metrics::{serve, setup_metrics_recorder};
use ingest_common::queue::QueueClient;
use ingest_common::sink::{PgSink, Sink};
use ingest_common::sqs::SqsQueue;
use ingest_worker::config::Config;
use ingest_worker::error::WorkerError;
use ingest_worker::handlers::app;
use ingest_worker::worker::LoginWorker;

async fn shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully, finishing the message in flight...");
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env()?;
    config.validate()?;

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker".to_string(), config.liveness_deadline());
    let recorder_handle = setup_metrics_recorder()?;

    let queue = SqsQueue::new(&config.sqs_queue_config()).await;
    let dead_letter_queue = config.dead_letter_queue_config().map(|dead_letter_config| -> Arc<dyn QueueClient> {
        Arc::new(SqsQueue::from_client(queue.client().clone(), &dead_letter_config))
    });
    let sink = Arc::new(
        PgSink::new(
            config.table_name.as_str(),
            &config.database_url,
            config.max_pg_connections,
        )
        .await?,
    );

    for line in config.banner() {
        info!("{}", line);
    }
    info!(
        queue_url = queue.queue_url(),
        dead_letter = dead_letter_queue.is_some(),
        table = config.table_name.as_str(),
        "login ingest worker ready"
    );

    let worker = LoginWorker::new(
        &config.worker_name,
        Arc::new(queue),
        dead_letter_queue,
        sink.clone(),
        config.poll_interval.0,
        config.request_timeout.0,
        config.retry_policy.provide(),
        worker_liveness,
    );

    let bind = config.bind();
    let http_server = tokio::spawn(async move {
        let router = app(liveness, Some(recorder_handle));
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve http endpoints on {}: {}", bind, e);
        }
    });

    worker.run(shutdown_signal()).await;

    http_server.abort();
    sink.close().await;
    info!("database connections closed, goodbye");

    Ok(())
}
