#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use telemetry_relay::error::SinkError;
use telemetry_relay::record::{keys, InboundRecord};
use telemetry_relay::sink::NotificationSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub target: String,
    pub arguments: Vec<String>,
}

/// Records every call, optionally failing the calls whose target is in `fail_targets`.
#[derive(Default)]
pub struct MemorySink {
    pub sent: Mutex<Vec<SentMessage>>,
    pub fail_targets: Vec<&'static str>,
}

impl MemorySink {
    pub fn failing_on(targets: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            fail_targets: targets.to_vec(),
            ..Default::default()
        })
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .flat_map(|message| message.arguments)
            .map(|argument| serde_json::from_str(&argument).unwrap())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn send(&self, target: &str, arguments: Vec<String>) -> Result<(), SinkError> {
        self.sent.lock().unwrap().push(SentMessage {
            target: target.to_owned(),
            arguments,
        });

        if self.fail_targets.contains(&target) {
            return Err(SinkError::Rejected {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: "hub unavailable".to_owned(),
            });
        }
        Ok(())
    }
}

pub fn device_record(source: &str, sequence_number: &str, body: &str) -> InboundRecord {
    InboundRecord::new(body.to_owned())
        .with_system_property(keys::MESSAGE_SOURCE, source)
        .with_system_property(keys::DEVICE_ID, "sensor-1")
        .with_system_property(keys::ENQUEUE_TIME, "2024-03-01T10:15:30.123Z")
        .with_system_property(keys::SEQUENCE_NUMBER, sequence_number)
}
