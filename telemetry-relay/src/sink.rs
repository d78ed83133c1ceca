use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use tracing::info;

use crate::envelope::Notification;
use crate::error::{ConfigError, RecordError, SinkError};
use crate::transform::RoutingTarget;

/// A push-messaging service that fans notifications out to connected clients.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver a message to every client subscribed to `target`.
    async fn send(&self, target: &str, arguments: Vec<String>) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    SignalR,
    Log,
}

impl FromStr for SinkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "signalr" => Ok(SinkKind::SignalR),
            "log" => Ok(SinkKind::Log),
            _ => Err(ConfigError::UnknownSink(s.to_owned())),
        }
    }
}

/// Writes notifications to the log instead of delivering them. Meant for local development.
pub struct LogSink {}

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, target: &str, arguments: Vec<String>) -> Result<(), SinkError> {
        for argument in arguments {
            info!(routing_target = target, notification = %argument, "notification");
        }

        Ok(())
    }
}

/// Serialize a deliverable notification and hand it to the sink as a single argument.
pub async fn dispatch(
    sink: &dyn NotificationSink,
    target: RoutingTarget,
    notification: &Notification,
) -> Result<(), RecordError> {
    let payload = notification.to_json()?;

    let start = Instant::now();
    let result = sink.send(target.as_str(), vec![payload]).await;
    metrics::histogram!("relay_dispatch_duration_seconds", "target" => target.as_str())
        .record(start.elapsed().as_secs_f64());

    result.map_err(RecordError::from)
}
