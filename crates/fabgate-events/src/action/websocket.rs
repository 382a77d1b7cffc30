//! WebSocket sink: hand the batch to a named topic channel and wait for
//! a consumer ack.
use super::{Action, ActionError};
use crate::model::{EventEntry, WebSocketInfo};
use async_trait::async_trait;
use fabgate_ws::{DistributionMode, WsChannels};
use std::sync::Arc;

pub(crate) struct WebSocketAction {
    channels: Arc<WsChannels>,
    topic: String,
    mode: DistributionMode,
}

impl WebSocketAction {
    pub(crate) fn new(channels: Arc<WsChannels>, info: &WebSocketInfo) -> Self {
        Self {
            channels,
            topic: info.topic.clone(),
            mode: info.distribution_mode.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Action for WebSocketAction {
    async fn attempt_batch(
        &self,
        batch_number: u64,
        attempt: u64,
        events: &[EventEntry],
    ) -> Result<(), ActionError> {
        tracing::debug!(
            topic = %self.topic,
            batch = batch_number,
            attempt,
            events = events.len(),
            "handing batch to websocket channel"
        );
        let payload = serde_json::to_value(events)?;
        self.channels
            .deliver(&self.topic, self.mode, batch_number, payload)
            .await?;
        Ok(())
    }
}
