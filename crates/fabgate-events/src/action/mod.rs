//! Sink actions: the delivery targets of dispatched batches.
//!
//! An action attempts exactly one delivery of one batch; the stream's
//! processor owns retry, backoff and the block/skip policy.
use crate::error::EventsError;
use crate::model::{EventEntry, STREAM_TYPE_WEBHOOK, STREAM_TYPE_WEBSOCKET, StreamInfo};
use async_trait::async_trait;
use fabgate_ws::WsChannels;
use std::sync::Arc;
use thiserror::Error;

mod webhook;
mod websocket;

pub(crate) use webhook::WebhookAction;
pub(crate) use websocket::WebSocketAction;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("webhook POST failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(u16),
    #[error("webhook target {0} resolves to a disallowed address")]
    UnsafeAddress(String),
    #[error("webhook target {0} did not resolve")]
    Unresolvable(String),
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Channel(#[from] fabgate_ws::WsChannelError),
}

#[async_trait]
pub(crate) trait Action: Send + Sync {
    async fn attempt_batch(
        &self,
        batch_number: u64,
        attempt: u64,
        events: &[EventEntry],
    ) -> Result<(), ActionError>;
}

/// Construct the action for a normalized, validated stream spec.
pub(crate) fn build_action(
    spec: &StreamInfo,
    channels: Arc<WsChannels>,
    allow_private_ips: bool,
) -> Result<Arc<dyn Action>, EventsError> {
    match spec.stream_type.as_str() {
        STREAM_TYPE_WEBHOOK => {
            let info = spec.webhook.as_ref().ok_or_else(|| {
                EventsError::Validation(
                    "webhook configuration is required for type webhook".to_string(),
                )
            })?;
            Ok(Arc::new(WebhookAction::new(info, allow_private_ips)?))
        }
        STREAM_TYPE_WEBSOCKET => {
            let info = spec.websocket.clone().unwrap_or_default();
            Ok(Arc::new(WebSocketAction::new(channels, &info)))
        }
        other => Err(EventsError::Validation(format!(
            "unknown event stream type: {other}"
        ))),
    }
}
