//! # Hook Relay
//!
//! Accepts webhook requests over HTTP, stores them in a durable AMQP queue
//! and forwards them to internal services from a lock-guarded periodic
//! worker, with retries and a dead-letter queue.

pub mod api;
pub mod auth;
pub mod config;
pub mod consts;
pub mod front;
pub mod metric;
pub mod models;
pub mod scheduler;
pub mod services;

use envconfig::Envconfig;
use logfire::config::{MetricsOptions, SendToLogfire};
use ntex::web;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[ntex::main]
async fn main() -> anyhow::Result<()> {
    let app_config = config::AppConfig::init_from_env()?;
    app_config.validate()?;

    // Initialize logging and metrics
    let mut logfire_config = logfire::configure()
        .install_panic_handler()
        .with_metrics(Some(MetricsOptions::default()))
        .send_to_logfire(SendToLogfire::IfTokenPresent);
    if !app_config.logfire_token.is_empty() {
        logfire_config = logfire_config.with_token(&app_config.logfire_token);
    }
    let shutdown_handler = logfire_config.finish()?;

    let token_manager = Arc::new(auth::token::TokenManager::new(
        &app_config.jwt_signing_algorithm,
        &app_config.jwt_private_key_pem(),
    )?);
    tracing::info!(algorithm = %token_manager.algorithm(), "token manager ready");

    let queue: services::ImplDurableQueue = Arc::new(
        services::broker::AmqpQueue::connect(
            &app_config.amqp_url,
            &app_config.webhook_queue_name,
            &app_config.webhook_dead_letter_queue_name,
            app_config.publish_confirm_timeout(),
        )
        .await?,
    );
    let locker: services::ImplLocker =
        Arc::new(services::lock::RedisLocker::connect(&app_config.redis_url).await?);
    let sender: services::ImplHookSender = Arc::new(
        services::dispatcher::HttpHookSender::new(app_config.http_timeout())?,
    );

    let auth_gate = Arc::new(auth::gate::AuthGate::new(
        token_manager.clone(),
        app_config.paid_only_services(),
    ));
    let app_state = front::AppState {
        gateway: Arc::new(api::enqueue::EnqueueGateway::new(auth_gate, queue.clone())),
        rate_limiter: Arc::new(services::rate_limit::KeyedRateLimiter::per_minute(
            app_config.hook_rate_limit_per_minute,
        )),
    };

    // Start the delivery worker, every instance runs one but only the lock
    // holder drains the queue on a given tick
    let delivery_job = Arc::new(api::delivery::DeliveryJob::new(
        queue,
        sender,
        token_manager,
        api::delivery::DeliverySettings::from_config(&app_config),
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let cancel = CancellationToken::new();
    let worker = ntex::rt::spawn(
        scheduler::ExclusivePeriodicTask::new(
            app_config.tick_interval(),
            consts::DELIVERY_LOCK_KEY,
            locker,
        )
        .run(delivery_job, stop_rx, cancel.clone()),
    );

    let server_result = run_server(&app_config, app_state).await;

    // Let the tick in progress settle its messages before exiting
    let _ = stop_tx.send(true);
    cancel.cancel();
    if worker.await.is_err() {
        tracing::error!("delivery worker ended abnormally");
    }

    shutdown_handler.shutdown()?;

    server_result
}

/// Configures and starts the web server
async fn run_server(app_config: &config::AppConfig, app_state: front::AppState) -> anyhow::Result<()> {
    let server_addr = (app_config.web_server_host.clone(), app_config.web_server_port);

    tracing::info!(
        host = %server_addr.0,
        port = server_addr.1,
        env = %app_config.env,
        prod = app_config.is_prod(),
        "starting hook relay"
    );

    web::server(move || {
        web::App::new()
            .wrap(web::middleware::Logger::default())
            .wrap(web::middleware::Compress::default())
            .state(app_state.clone())
            .configure(front::routes::hooks)
            .default_service(web::route().to(front::hook::serve_not_found))
    })
    .bind(server_addr)?
    .run()
    .await
    .map_err(|e| anyhow::anyhow!("Server error: {}", e))
}
