use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradevault::application::handlers::webhook_handler::{router, AppState};
use tradevault::application::services::alert_intake::AlertIntakeService;
use tradevault::application::services::notify_worker::NotifyWorker;
use tradevault::auth::WebhookAuth;
use tradevault::config::AppConfig;
use tradevault::infrastructure::telegram_transport::TelegramTransport;
use tradevault::persistence::accounts::AccountRepository;
use tradevault::persistence::inbound::{InboundDedupeStore, WebhookIntakeBox};
use tradevault::persistence::init_database_with;
use tradevault::persistence::order_ledger::OrderLedger;
use tradevault::persistence::outbox::NotificationOutbox;
use tradevault::persistence::system_config::SystemConfigStore;
use tradevault::rate_limit::{create_rate_limiter, RateLimiterConfig};
use tradevault::task_runner::CircuitBreakerConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradevault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    info!("TradeVault starting with {:?}", config);

    let pool = init_database_with(&config.database).await?;

    let system_config = SystemConfigStore::new(pool.clone());
    let current = system_config.load().await?;
    info!(
        "System configuration v{}: trading {}, daily loss limit {}, weekly loss limit {}",
        current.version,
        if current.trading_enabled { "enabled" } else { "DISABLED" },
        current.daily_loss_limit,
        current.weekly_loss_limit
    );

    let outbox = NotificationOutbox::new(pool.clone());
    if config.alert_route.target.is_empty() {
        warn!("ALERT_TARGET is not set: operational alerts will not be deliverable");
    }
    let ledger = OrderLedger::new(
        pool.clone(),
        outbox.clone(),
        config.alert_route.clone(),
    );

    let accounts = AccountRepository::new(pool.clone());
    let account = match config.webhook.account_id {
        Some(id) => accounts.get(id).await?,
        None => {
            let account = accounts.create("default").await?;
            warn!(
                "WEBHOOK_ACCOUNT_ID is not set, webhook orders go to account {} ({})",
                account.id, account.name
            );
            account
        }
    };

    // Notification workers
    let telegram = match config.telegram_bot_token.as_ref() {
        Some(token) => Some(Arc::new(TelegramTransport::new(token.as_str())?)),
        None => {
            warn!("TELEGRAM_BOT_TOKEN is not set: telegram notifications will fail and be retried");
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handles = Vec::with_capacity(config.outbox.workers);
    for _ in 0..config.outbox.workers {
        let mut worker = NotifyWorker::new(outbox.clone(), config.outbox.clone());
        if let Some(transport) = telegram.as_ref() {
            worker = worker.with_transport(transport.clone());
        }
        let shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            let result = worker.run(CircuitBreakerConfig::default(), shutdown).await;
            (worker.id().to_string(), result)
        }));
    }
    info!("Started {} notification worker(s)", worker_handles.len());

    // Webhook server
    let intake = AlertIntakeService::new(
        InboundDedupeStore::new(pool.clone()),
        WebhookIntakeBox::new(pool.clone()),
        ledger,
        account.id,
        config.webhook.adapter_settings(),
    );
    let state = AppState {
        pool: pool.clone(),
        intake,
        auth: WebhookAuth::new(config.webhook.secret_token.clone()),
        limiter: create_rate_limiter(RateLimiterConfig {
            requests_per_minute: config.webhook.rate_limit_per_minute,
        }),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.webhook.bind_addr).await?;
    info!("Listening on {}", config.webhook.bind_addr);

    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    info!("Server started successfully. Press Ctrl+C to stop.");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Server shutting down gracefully...");

    // Leased entries of a stopped worker become eligible again once the lease expires
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        match handle.await {
            Ok((id, Ok(()))) => info!("Worker {} stopped", id),
            Ok((id, Err(e))) => error!("Worker {} ended with error: {}", id, e),
            Err(e) => error!("Worker task panicked: {}", e),
        }
    }

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}
