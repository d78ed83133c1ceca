use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::RecordMetadata;

/// The normalized notification forwarded to live clients.
///
/// Consumers parse it by key, field order carries no meaning. A `None` payload
/// means the notification must not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// The stream sequence number. Only unique within a partition.
    pub event_id: String,
    pub event_type: String,
    pub event_source: String,
    pub device_id: String,
    pub event_time: String,
    pub dt_data_schema: String,
    pub data: Option<String>,
}

impl Notification {
    pub fn new(event_type: &str, metadata: &RecordMetadata) -> Self {
        Self {
            event_id: metadata.sequence_number.clone(),
            event_type: event_type.to_owned(),
            event_source: metadata.category.name().to_owned(),
            device_id: metadata.device_id.clone(),
            event_time: format_event_time(&metadata.enqueued_at),
            dt_data_schema: metadata.schema_id.clone(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Option<String>) -> Self {
        self.data = data;
        self
    }

    pub fn is_deliverable(&self) -> bool {
        self.data.is_some()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Render a timestamp as `YYYY-MM-DDTHH:mm:ss.sssZ`.
pub fn format_event_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
