//! Herald delivery service binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_directory::{CloudControllerClient, UaaClient};
use herald_notifier::{SmtpMailer, SmtpSettings};
use herald_postal::cryptography::Cryptographer;
use herald_postal::gc::MessageGc;
use herald_postal::generator::WorkerGenerator;
use herald_postal::loader::SpaceAndOrgLoader;
use herald_postal::messages::{MessageStore, PgMessageStore};
use herald_postal::preferences::{PgPreferenceStore, PgReceiptStore};
use herald_postal::queue::{JobQueue, PgQueue, QueueConfig, RetryPolicy};
use herald_postal::templates::{PgTemplateStore, TemplatesLoader};
use herald_postal::worker::{DeliveryServices, DeliveryWorker, WorkerSettings};

use herald_server::background::spawn_singletons;
use herald_server::routes::create_router;
use herald_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "herald_server=info,herald_postal=info,herald_notifier=info,herald_directory=info",
            )
        }))
        .json()
        .init();

    tracing::info!("Herald starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    let mailer = SmtpMailer::new(SmtpSettings {
        host: config.smtp_host.clone(),
        port: config.smtp_port,
        user: config.smtp_user.clone(),
        pass: config.smtp_pass.clone(),
        tls: config.smtp_tls,
        timeout: Duration::from_secs(config.smtp_timeout_secs),
    })?;

    if config.test_mode {
        tracing::info!("Test mode, skipping SMTP capability check");
    } else if let Err(e) = mailer.verify_tls().await {
        tracing::error!(error = %e, "SMTP startup check failed");
        return Err(e.into());
    }

    let directory_timeout = Duration::from_secs(config.directory_timeout_secs);
    let cloud_controller =
        CloudControllerClient::new(&config.cc_host, config.verify_ssl, directory_timeout)?;
    let uaa = UaaClient::new(
        &config.uaa_host,
        &config.uaa_client_id,
        &config.uaa_client_secret,
        config.verify_ssl,
        directory_timeout,
    )?;

    let queue: Arc<dyn JobQueue> = Arc::new(PgQueue::new(
        pool.clone(),
        QueueConfig {
            lease: config.queue_lease(),
            max_retries: config.max_retries,
        },
    ));
    let messages: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(pool.clone()));

    let services = DeliveryServices {
        queue: queue.clone(),
        messages: messages.clone(),
        loader: SpaceAndOrgLoader::new(Arc::new(cloud_controller)),
        users: Arc::new(uaa),
        templates: Arc::new(TemplatesLoader::new(PgTemplateStore::new(pool.clone()))),
        mailer: Arc::new(mailer),
        crypto: Cryptographer::new(&config.encryption_key)?,
        preferences: Arc::new(PgPreferenceStore::new(pool.clone())),
        receipts: Arc::new(PgReceiptStore::new(pool.clone())),
    };
    let settings = WorkerSettings {
        sender: config.sender.clone(),
        poll_interval: config.queue_poll_interval(),
        retry: RetryPolicy::new(
            Duration::from_secs(config.retry_base_secs),
            Duration::from_secs(config.retry_max_secs),
        ),
        lease: config.queue_lease(),
    };

    let generator =
        WorkerGenerator::new(config.instance_index, config.instance_count, config.worker_count)?;
    let mut tasks = generator.spawn(|id| {
        DeliveryWorker::new(id, services.clone(), settings.clone()).run()
    });

    let gc = MessageGc::new(messages, config.message_lifetime(), config.gc_interval());
    tasks.extend(spawn_singletons(config.instance_index, gc, queue.clone()));

    let state = AppState::new(queue, config.instance_index, config.worker_count);
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Health server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    // In-flight leases expire and are picked up by other instances.
    for task in tasks {
        task.abort();
    }

    tracing::info!("Herald stopped.");
    Ok(())
}
