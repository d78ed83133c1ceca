//! Relay device events from Kafka to live clients through a push-messaging service.
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use telemetry_relay::config::Config;
use telemetry_relay::consumer::RelayConsumer;
use telemetry_relay::error::ConfigError;
use telemetry_relay::health::HealthRegistry;
use telemetry_relay::relay::Relay;
use telemetry_relay::server::{router, serve, setup_metrics_recorder};
use telemetry_relay::signalr::SignalRSink;
use telemetry_relay::sink::{LogSink, NotificationSink, SinkKind};

fn setup_tracing() -> Result<(), anyhow::Error> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse()?),
    );
    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

fn build_sink(config: &Config) -> Result<Arc<dyn NotificationSink>, anyhow::Error> {
    match config.sink {
        SinkKind::Log => Ok(Arc::new(LogSink {})),
        SinkKind::SignalR => {
            let missing = ConfigError::MissingSetting("SIGNALR_CONNECTION_STRING", "signalr");
            let connection = config.signalr_connection_string.as_ref().ok_or(missing)?;
            let sink = SignalRSink::new(
                connection,
                config.signalr_hub.as_str(),
                config.http_timeout.0,
                config.signalr_token_ttl()?,
            )
            .context("failed to create signalr sink")?;

            info!(url = %sink.url(), "relaying to signalr hub");
            Ok(Arc::new(sink))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing()?;
    info!("starting telemetry relay");

    let config = Config::init_from_env().context("invalid configuration")?;

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness.register("relay-consumer", time::Duration::seconds(30));

    let recorder = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let bind = config.bind();
    let app = router(liveness, Some(recorder));
    tokio::task::spawn(async move {
        if let Err(e) = serve(app, &bind).await {
            tracing::error!(error = %e, %bind, "health server stopped");
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        _ = shutdown_tx.send(true);
    });

    let relay = Relay::new(build_sink(&config)?, config.event_type.as_str());
    let consumer = RelayConsumer::new(&config, relay, consumer_liveness)?;
    consumer.run(shutdown_rx).await?;

    info!("telemetry relay shut down");
    Ok(())
}
