use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::error::ConfigError;
use crate::signalr::ConnectionString;
use crate::sink::SinkKind;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub bind_host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub bind_port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(from = "KAFKA_TOPIC", default = "device_events")]
    pub kafka_topic: String,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "telemetry-relay")]
    pub kafka_consumer_group: String,

    // earliest, latest
    #[envconfig(from = "KAFKA_CONSUMER_OFFSET_RESET", default = "latest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(from = "BATCH_SIZE", default = "100")]
    pub batch_size: usize,

    #[envconfig(from = "BATCH_TIMEOUT_MS", default = "500")]
    pub batch_timeout: EnvMsDuration,

    #[envconfig(from = "EVENT_TYPE", default = "IoTHub")]
    pub event_type: NonEmptyString,

    #[envconfig(from = "SINK", default = "signalr")]
    pub sink: SinkKind,

    #[envconfig(from = "SIGNALR_CONNECTION_STRING")]
    pub signalr_connection_string: Option<ConnectionString>,

    #[envconfig(from = "SIGNALR_HUB", default = "telemetry")]
    pub signalr_hub: NonEmptyString,

    #[envconfig(from = "SIGNALR_TOKEN_TTL_SECS", default = "3600")]
    pub signalr_token_ttl_secs: u64,

    #[envconfig(from = "HTTP_TIMEOUT_MS", default = "5000")]
    pub http_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }

    /// Lifetime of the access tokens minted for the SignalR hub.
    pub fn signalr_token_ttl(&self) -> Result<chrono::Duration, ConfigError> {
        i64::try_from(self.signalr_token_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .filter(|ttl| *ttl > chrono::Duration::zero())
            .filter(|ttl| chrono::Utc::now().checked_add_signed(*ttl).is_some())
            .ok_or(ConfigError::InvalidTokenTtl(self.signalr_token_ttl_secs))
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
