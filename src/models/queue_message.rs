use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A webhook waiting in the durable queue.
///
/// `id` is generated once at enqueue time and survives every retry, so
/// receivers can use it to drop duplicates of an at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub method: String,
    pub service_name: String,
    #[serde(with = "raw_body")]
    pub body: Vec<u8>,
    pub failed_count: u32,
    // records written before the 401/403 cap existed carry no counter
    #[serde(default)]
    pub auth_failed_count: u32,
}

impl QueueMessage {
    pub fn new(service_name: &str, method: &str, body: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            service_name: service_name.to_string(),
            body,
            failed_count: 0,
            auth_failed_count: 0,
        }
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    /// Counts a generic delivery failure and returns the new total
    pub fn record_failure(&mut self) -> u32 {
        self.failed_count = self.failed_count.saturating_add(1);
        self.failed_count
    }

    /// Counts a 401/403 answer, `failed_count` is left untouched
    pub fn record_auth_failure(&mut self) -> u32 {
        self.auth_failed_count = self.auth_failed_count.saturating_add(1);
        self.auth_failed_count
    }
}

/// A fetched message plus the broker handle needed to ack it.
///
/// The tag is only valid on the channel that fetched it and only until
/// it is acked or released.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub delivery_tag: u64,
    pub message: QueueMessage,
}

/// Keeps the body as base64 so any byte sequence survives the JSON record.
mod raw_body {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
