//! Notification Worker Service
//!
//! Consumes user lifecycle events from RabbitMQ and sends the matching emails.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ (notification-service.user-events)
//!   ↓ (durable queue, manual ack)
//! ResilientConsumer<LapinConnector>
//!   ↓ (RawMessage)
//! EventRouter
//!   ↓ (renders templates)
//! TemplateEngine (Handlebars)
//!   ↓ (sends emails)
//! SmtpProvider
//! ```
//!
//! The consumer reconnects on its own after broker restarts; SIGINT/SIGTERM
//! trigger an orderly stop that waits for in-flight messages.

pub mod config;

use amqp_worker::{
    init_metrics, ConnectionEndpoint, Connector, ConsumerConfig, LapinConnector, ResilientConsumer,
};
use config::WorkerSettings;
use core_config::amqp::AmqpConfig;
use core_config::smtp::SmtpConfig;
use core_config::{Environment, FromEnv};
use domain_notifications::{
    EmailProvider, EventRouter, PasswordResetRequestedProcessor, SmtpProvider, TemplateEngine,
    UserRegisteredProcessor,
};
use eyre::{Result, WrapErr};
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

const CONNECTION_NAME: &str = "notification-service";

/// Router with every processor this service knows about
pub fn build_router(
    settings: &WorkerSettings,
    provider: Arc<dyn EmailProvider>,
    templates: Arc<TemplateEngine>,
) -> EventRouter {
    EventRouter::new(settings.queue_name.clone())
        .register(UserRegisteredProcessor::new())
        .register(PasswordResetRequestedProcessor::new(
            provider,
            templates,
            settings.reset_password_base_url.clone(),
        ))
}

pub fn consumer_config(settings: &WorkerSettings, amqp: &AmqpConfig) -> ConsumerConfig {
    let config = ConsumerConfig::new(settings.queue_name.clone());
    match amqp.prefetch {
        Some(prefetch) => config.with_prefetch(prefetch),
        None => config,
    }
}

pub fn endpoint(amqp: &AmqpConfig) -> Result<ConnectionEndpoint> {
    Ok(ConnectionEndpoint::parse(&amqp.url, amqp.vhost.clone())
        .wrap_err("Invalid RabbitMQ connection settings")?
        .with_heartbeat(amqp.heartbeat))
}

/// Start `consumer`, run until `shutdown` resolves, then stop it.
///
/// The consumer is stopped even when `shutdown` reports an error; that error
/// is returned afterwards.
pub async fn serve<C, F>(consumer: &ResilientConsumer<C>, shutdown: F) -> Result<()>
where
    C: Connector,
    F: Future<Output = Result<()>>,
{
    consumer
        .start()
        .await
        .wrap_err_with(|| format!("Failed to start consumer for queue {}", consumer.queue_name()))?;

    info!(queue = %consumer.queue_name(), endpoint = %consumer.endpoint(), "Notification worker running");

    let signal = shutdown.await;

    info!(in_flight = consumer.in_flight_count(), "Stopping consumer");
    consumer.stop().await;
    info!("Notification worker stopped");

    signal
}

/// Run the notification worker
///
/// # Errors
///
/// Returns an error if configuration is invalid, the SMTP provider cannot be
/// built, or the consumer exhausts its start retries.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let settings = WorkerSettings::from_env().wrap_err("Failed to load worker settings")?;
    let amqp = AmqpConfig::from_env().wrap_err("Failed to load RabbitMQ configuration")?;
    let smtp = SmtpConfig::from_env().wrap_err("Failed to load SMTP configuration")?;

    info!(
        environment = ?environment,
        queue = %settings.queue_name,
        reset_password_base_url = %settings.reset_password_base_url,
        email_verification_base_url = %settings.email_verification_base_url,
        "Starting notification worker"
    );

    init_metrics(settings.metrics_addr());

    let endpoint = endpoint(&amqp)?;

    let provider = SmtpProvider::new(&smtp).wrap_err("Failed to create SMTP provider")?;
    if let Err(e) = provider.health_check().await {
        warn!(host = %smtp.host, port = smtp.port, error = %e, "SMTP relay not reachable yet");
    }

    let templates = match &settings.templates_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Loading templates from directory");
            TemplateEngine::with_directory(dir)
        }
        None => TemplateEngine::new(),
    };

    let router = build_router(&settings, Arc::new(provider), Arc::new(templates));
    info!(events = ?router.events(), "Event router ready");

    let connector = LapinConnector::new().with_connection_name(CONNECTION_NAME);
    let consumer = ResilientConsumer::new(
        connector,
        endpoint,
        consumer_config(&settings, &amqp),
        router,
    )
    .wrap_err("Invalid consumer configuration")?;

    serve(&consumer, shutdown_signal()).await
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
            result
        },
        result = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
            result
        },
    }
}
