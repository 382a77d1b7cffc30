//! Stream and subscription model definitions.
//!
//! # Purpose
//! Defines the serialized shape of event streams, subscriptions and the
//! events they deliver, plus the default/clamp rules applied when a spec
//! is created or updated.
use crate::error::EventsError;
use fabgate_ws::DistributionMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Special `fromBlock` value meaning "subscribe from the current block".
pub const FROM_BLOCK_NEWEST: &str = "newest";
/// Block the stream until the sink accepts the batch.
pub const ERROR_HANDLING_BLOCK: &str = "block";
/// Retry up to the stream's retry envelope, then skip to the next batch.
pub const ERROR_HANDLING_SKIP: &str = "skip";
/// Largest batch size a user can configure.
pub const MAX_BATCH_SIZE: u64 = 1000;
/// Entries held in the per-stream LRU cache of block timestamps.
pub const DEFAULT_TIMESTAMP_CACHE_SIZE: usize = 1000;

pub const STREAM_ID_PREFIX: &str = "es-";
pub const SUB_ID_PREFIX: &str = "sb-";
pub const CHECKPOINT_ID_PREFIX: &str = "cp-";
pub const STREAM_PATH_PREFIX: &str = "/eventstreams";
pub const SUB_PATH_PREFIX: &str = "/subscriptions";

pub const STREAM_TYPE_WEBHOOK: &str = "webhook";
pub const STREAM_TYPE_WEBSOCKET: &str = "websocket";

const DEFAULT_BATCH_TIMEOUT_MS: u64 = 5000;
const DEFAULT_BLOCKED_RETRY_DELAY_SEC: u64 = 30;
const DEFAULT_WEBHOOK_REQUEST_TIMEOUT_SEC: u32 = 120;

/// Configuration of one delivery pipeline: a sink plus batching policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(rename = "createdISO8601", default)]
    pub created: String,
    #[serde(default)]
    pub suspended: bool,
    #[serde(rename = "type", default)]
    pub stream_type: String,
    #[serde(default)]
    pub batch_size: u64,
    #[serde(rename = "batchTimeoutMS", default)]
    pub batch_timeout_ms: u64,
    #[serde(default)]
    pub error_handling: String,
    #[serde(default)]
    pub retry_timeout_sec: u64,
    #[serde(default)]
    pub blocked_retry_delay_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket: Option<WebSocketInfo>,
    /// Attach block timestamps to generated events.
    #[serde(default)]
    pub timestamps: bool,
    #[serde(default)]
    pub timestamp_cache_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookInfo {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub tls_skip_host_verify: bool,
    #[serde(default)]
    pub request_timeout_sec: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketInfo {
    #[serde(default)]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_mode: Option<DistributionMode>,
}

impl StreamInfo {
    /// Apply the documented defaults and clamps in place.
    pub fn normalize(&mut self) {
        self.stream_type = self.stream_type.to_lowercase();
        if self.batch_size == 0 {
            self.batch_size = 1;
        } else if self.batch_size > MAX_BATCH_SIZE {
            self.batch_size = MAX_BATCH_SIZE;
        }
        if self.batch_timeout_ms == 0 {
            self.batch_timeout_ms = DEFAULT_BATCH_TIMEOUT_MS;
        }
        if self.blocked_retry_delay_sec == 0 {
            self.blocked_retry_delay_sec = DEFAULT_BLOCKED_RETRY_DELAY_SEC;
        }
        self.error_handling = normalize_error_handling(&self.error_handling);
        if self.timestamp_cache_size == 0 {
            self.timestamp_cache_size = DEFAULT_TIMESTAMP_CACHE_SIZE;
        }
        if let Some(webhook) = self.webhook.as_mut() {
            if webhook.request_timeout_sec == 0 {
                webhook.request_timeout_sec = DEFAULT_WEBHOOK_REQUEST_TIMEOUT_SEC;
            }
        }
    }

    /// Structural checks performed on create, after [`Self::normalize`].
    pub fn validate(&self) -> Result<(), EventsError> {
        match self.stream_type.as_str() {
            STREAM_TYPE_WEBHOOK => {
                let webhook = self.webhook.as_ref().ok_or_else(|| {
                    EventsError::Validation(
                        "webhook configuration is required for type webhook".to_string(),
                    )
                })?;
                if webhook.url.is_empty() {
                    return Err(EventsError::Validation(
                        "webhook url is required".to_string(),
                    ));
                }
                reqwest::Url::parse(&webhook.url).map_err(|_| {
                    EventsError::Validation(format!("invalid webhook url: {}", webhook.url))
                })?;
                Ok(())
            }
            STREAM_TYPE_WEBSOCKET => Ok(()),
            other => Err(EventsError::Validation(format!(
                "unknown event stream type: {other}"
            ))),
        }
    }

    pub fn is_error_handling_block(&self) -> bool {
        self.error_handling == ERROR_HANDLING_BLOCK
    }
}

pub(crate) fn normalize_error_handling(raw: &str) -> String {
    if raw.to_lowercase() == ERROR_HANDLING_BLOCK {
        ERROR_HANDLING_BLOCK.to_string()
    } else {
        ERROR_HANDLING_SKIP.to_string()
    }
}

/// One filtered event source bound to one stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(rename = "createdISO8601", default)]
    pub created: String,
    #[serde(default)]
    pub channel_id: String,
    /// Id of the stream this subscription feeds.
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub filter: EventFilter,
    /// `"newest"` or a decimal block number.
    #[serde(default)]
    pub from_block: String,
}

/// Predicates evaluated by the ledger adapter when it routes events to a
/// listener.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default)]
    pub chaincode_id: String,
    /// Optional regular expression applied to the event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_type: Option<BlockType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum BlockType {
    #[serde(rename = "tx")]
    Tx,
    #[serde(rename = "config")]
    Config,
}

/// One chaincode event as delivered to a sink.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventEntry {
    pub sub_id: String,
    pub block_number: u64,
    pub transaction_id: String,
    pub transaction_index: u32,
    pub event_index: u32,
    pub chaincode_id: String,
    pub event_name: String,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    /// Block timestamp (unix seconds), attached when the stream has
    /// `timestamps` enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook_stream() -> StreamInfo {
        StreamInfo {
            stream_type: "webhook".to_string(),
            webhook: Some(WebhookInfo {
                url: "https://example.com/hook".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn normalize_applies_defaults() {
        let mut spec = webhook_stream();
        spec.normalize();
        assert_eq!(spec.batch_size, 1);
        assert_eq!(spec.batch_timeout_ms, 5000);
        assert_eq!(spec.blocked_retry_delay_sec, 30);
        assert_eq!(spec.error_handling, ERROR_HANDLING_SKIP);
        assert_eq!(spec.timestamp_cache_size, 1000);
        assert_eq!(
            spec.webhook.as_ref().expect("webhook").request_timeout_sec,
            120
        );
    }

    #[test]
    fn normalize_clamps_batch_size() {
        let mut spec = webhook_stream();
        spec.batch_size = 50_000;
        spec.normalize();
        assert_eq!(spec.batch_size, MAX_BATCH_SIZE);
    }

    #[test]
    fn error_handling_is_case_insensitive() {
        let mut spec = webhook_stream();
        spec.error_handling = "BLOCK".to_string();
        spec.normalize();
        assert_eq!(spec.error_handling, ERROR_HANDLING_BLOCK);

        let mut spec = webhook_stream();
        spec.error_handling = "anything else".to_string();
        spec.normalize();
        assert_eq!(spec.error_handling, ERROR_HANDLING_SKIP);
    }

    #[test]
    fn validate_rejects_unknown_type() {
        let mut spec = webhook_stream();
        spec.stream_type = "Carrier-Pigeon".to_string();
        spec.normalize();
        assert!(matches!(spec.validate(), Err(EventsError::Validation(_))));
    }

    #[test]
    fn validate_rejects_missing_or_bad_webhook_url() {
        let mut spec = webhook_stream();
        spec.webhook = None;
        spec.normalize();
        assert!(matches!(spec.validate(), Err(EventsError::Validation(_))));

        let mut spec = webhook_stream();
        spec.webhook.as_mut().expect("webhook").url = "not a url".to_string();
        spec.normalize();
        assert!(matches!(spec.validate(), Err(EventsError::Validation(_))));
    }

    #[test]
    fn stream_info_uses_wire_field_names() {
        let mut spec = webhook_stream();
        spec.id = "es-1".to_string();
        spec.created = "2026-08-02T00:00:00Z".to_string();
        spec.normalize();
        let value = serde_json::to_value(&spec).expect("json");
        assert_eq!(value["type"], "webhook");
        assert_eq!(value["batchTimeoutMS"], 5000);
        assert_eq!(value["createdISO8601"], "2026-08-02T00:00:00Z");
        assert_eq!(value["batchSize"], 1);
        assert_eq!(value["errorHandling"], "skip");
    }

    #[test]
    fn subscription_round_trips_from_wire_json() {
        let parsed: SubscriptionInfo = serde_json::from_str(
            r#"{
                "channelId": "ch1",
                "stream": "es-1",
                "filter": {"chaincodeId": "asset", "eventFilter": "Created.*"},
                "fromBlock": "100"
            }"#,
        )
        .expect("parse");
        assert_eq!(parsed.channel_id, "ch1");
        assert_eq!(parsed.stream, "es-1");
        assert_eq!(parsed.filter.chaincode_id, "asset");
        assert_eq!(parsed.from_block, "100");
    }

    #[test]
    fn event_entry_serializes_camel_case() {
        let entry = EventEntry {
            sub_id: "sb-1".to_string(),
            block_number: 42,
            transaction_id: "tx-1".to_string(),
            transaction_index: 0,
            event_index: 1,
            chaincode_id: "asset".to_string(),
            event_name: "AssetCreated".to_string(),
            payload: serde_json::json!({"id": "a1"}),
            timestamp: None,
        };
        let value = serde_json::to_value(&entry).expect("json");
        assert_eq!(value["subId"], "sb-1");
        assert_eq!(value["blockNumber"], 42);
        assert_eq!(value["eventName"], "AssetCreated");
        assert!(value.get("timestamp").is_none());
    }
}
