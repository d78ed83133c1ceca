pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod health;
pub mod record;
pub mod relay;
pub mod server;
pub mod signalr;
pub mod sink;
pub mod transform;
