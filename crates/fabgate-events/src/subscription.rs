//! One filtered event source bound to one stream.
//!
//! A subscription owns its ledger-listener lifecycle and its block
//! high-water-mark. It never registers a listener on construction; the
//! owning stream's poller drives (re)registration off the `filter_stale`
//! flag so that checkpoint state is always consulted first.
use crate::error::EventsError;
use crate::ledger::{EventSink, LedgerClient, LedgerEvent, ListenerId};
use crate::model::{EventEntry, FROM_BLOCK_NEWEST, SubscriptionInfo};
use crate::stream::EventEnvelope;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct ListenerState {
    filter_stale: bool,
    reset_requested: bool,
    listener: Option<ListenerId>,
}

pub(crate) struct Subscription {
    info: RwLock<SubscriptionInfo>,
    ledger: Arc<dyn LedgerClient>,
    // Next block to process; advanced only by acked batches.
    hwm: Arc<AtomicU64>,
    deleting: AtomicBool,
    state: Mutex<ListenerState>,
}

impl Subscription {
    /// Validate and wrap a subscription spec. Used both for new
    /// subscriptions and for specs rehydrated from the store.
    pub(crate) fn new(
        mut info: SubscriptionInfo,
        ledger: Arc<dyn LedgerClient>,
    ) -> Result<Arc<Self>, EventsError> {
        if info.channel_id.is_empty() {
            return Err(EventsError::Validation(
                r#"missing required parameter "channelId""#.to_string(),
            ));
        }
        if info.stream.is_empty() {
            return Err(EventsError::Validation(
                r#"missing required parameter "stream""#.to_string(),
            ));
        }
        if info.from_block.is_empty() {
            info.from_block = FROM_BLOCK_NEWEST.to_string();
        }
        if info.from_block != FROM_BLOCK_NEWEST && info.from_block.parse::<u64>().is_err() {
            return Err(EventsError::Validation(format!(
                "fromBlock must be \"{FROM_BLOCK_NEWEST}\" or a decimal block number, got {}",
                info.from_block
            )));
        }
        if let Some(pattern) = &info.filter.event_filter {
            regex::Regex::new(pattern).map_err(|err| {
                EventsError::Validation(format!("invalid event filter regexp: {err}"))
            })?;
        }
        Ok(Arc::new(Self {
            info: RwLock::new(info),
            ledger,
            hwm: Arc::new(AtomicU64::new(0)),
            deleting: AtomicBool::new(false),
            state: Mutex::new(ListenerState {
                filter_stale: true,
                reset_requested: false,
                listener: None,
            }),
        }))
    }

    pub(crate) fn id(&self) -> String {
        self.info.read().expect("info lock").id.clone()
    }

    pub(crate) fn stream_id(&self) -> String {
        self.info.read().expect("info lock").stream.clone()
    }

    pub(crate) fn info(&self) -> SubscriptionInfo {
        self.info.read().expect("info lock").clone()
    }

    pub(crate) fn block_hwm(&self) -> u64 {
        self.hwm.load(Ordering::SeqCst)
    }

    /// Recover the HWM from a persisted checkpoint entry. A plain store,
    /// not a max: a reset is allowed to rewind the subscription.
    pub(crate) fn set_checkpoint_block_height(&self, height: u64) {
        self.hwm.store(height, Ordering::SeqCst);
    }

    /// Starting height for a subscription with no checkpoint entry.
    pub(crate) async fn initial_block_height(&self) -> Result<u64, EventsError> {
        let (channel, from_block) = {
            let info = self.info.read().expect("info lock");
            (info.channel_id.clone(), info.from_block.clone())
        };
        let height = if from_block.is_empty() || from_block == FROM_BLOCK_NEWEST {
            self.ledger.chain_height(&channel).await?
        } else {
            from_block.parse::<u64>().map_err(|_| {
                EventsError::Validation(format!("invalid fromBlock: {from_block}"))
            })?
        };
        self.hwm.store(height, Ordering::SeqCst);
        Ok(height)
    }

    /// Register the ledger listener from `from_block` and wire its events
    /// into the owning stream's input channel. Any previous listener is
    /// unregistered first. The cancel token abandons event hand-off when
    /// the owning pipeline generation is being torn down, so a blocked
    /// send cannot wedge an update.
    pub(crate) async fn restart_filter(
        self: Arc<Self>,
        events: mpsc::Sender<EventEnvelope>,
        from_block: u64,
        cancel: CancellationToken,
    ) -> Result<(), EventsError> {
        let previous = self.state.lock().expect("state lock").listener.take();
        if let Some(previous) = previous {
            let _ = self.ledger.unregister_listener(previous).await;
        }
        let (channel, filter) = {
            let info = self.info.read().expect("info lock");
            (info.channel_id.clone(), info.filter.clone())
        };
        let subscription = Arc::downgrade(&self);
        let sink: EventSink = Arc::new(move |event: LedgerEvent| {
            let subscription = subscription.clone();
            let events = events.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                let Some(subscription) = subscription.upgrade() else {
                    return;
                };
                if subscription.is_deleting() {
                    return;
                }
                let envelope = EventEnvelope::new(
                    subscription.entry_from(event),
                    subscription.channel_id(),
                    subscription.hwm.clone(),
                );
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    // A send error means the stream is gone; the listener
                    // itself is torn down by the poller or manager.
                    _ = events.send(envelope) => {}
                }
            })
        });
        let listener = self
            .ledger
            .register_listener(&channel, &filter, from_block, sink)
            .await?;
        let mut state = self.state.lock().expect("state lock");
        state.listener = Some(listener);
        state.filter_stale = false;
        Ok(())
    }

    /// Unregister the listener and mark the filter stale. With `deleting`
    /// set, all further listener work on this subscription is skipped.
    pub(crate) async fn unsubscribe(&self, deleting: bool) {
        let listener = {
            let mut state = self.state.lock().expect("state lock");
            state.filter_stale = true;
            state.reset_requested = false;
            state.listener.take()
        };
        if deleting {
            self.deleting.store(true, Ordering::SeqCst);
        }
        if let Some(listener) = listener {
            if let Err(err) = self.ledger.unregister_listener(listener).await {
                tracing::warn!(
                    subscription = %self.id(),
                    error = %err,
                    "failed to unregister ledger listener"
                );
            }
        }
    }

    pub(crate) async fn close(&self) {
        self.unsubscribe(false).await;
    }

    /// Ask the poller to unsubscribe, clear the checkpoint entry and
    /// re-register on its next cycle.
    pub(crate) fn request_reset(&self) {
        self.state.lock().expect("state lock").reset_requested = true;
    }

    pub(crate) fn set_from_block(&self, from_block: String) {
        self.info.write().expect("info lock").from_block = from_block;
    }

    pub(crate) fn mark_filter_stale(&self) {
        self.state.lock().expect("state lock").filter_stale = true;
    }

    pub(crate) fn filter_stale(&self) -> bool {
        self.state.lock().expect("state lock").filter_stale
    }

    pub(crate) fn reset_requested(&self) -> bool {
        self.state.lock().expect("state lock").reset_requested
    }

    pub(crate) fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }

    fn channel_id(&self) -> String {
        self.info.read().expect("info lock").channel_id.clone()
    }

    fn entry_from(&self, event: LedgerEvent) -> EventEntry {
        EventEntry {
            sub_id: self.id(),
            block_number: event.block_number,
            transaction_id: event.transaction_id,
            transaction_index: event.transaction_index,
            event_index: event.event_index,
            chaincode_id: event.chaincode_id,
            event_name: event.event_name,
            payload: event.payload,
            timestamp: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::{MockLedger, chaincode_event};
    use crate::model::EventFilter;

    fn spec(from_block: &str) -> SubscriptionInfo {
        SubscriptionInfo {
            id: "sb-test".to_string(),
            channel_id: "ch1".to_string(),
            stream: "es-test".to_string(),
            filter: EventFilter {
                chaincode_id: "asset".to_string(),
                ..Default::default()
            },
            from_block: from_block.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_missing_required_fields() {
        let ledger = Arc::new(MockLedger::new());
        let mut missing_channel = spec("newest");
        missing_channel.channel_id.clear();
        assert!(matches!(
            Subscription::new(missing_channel, ledger.clone()),
            Err(EventsError::Validation(_))
        ));

        let mut missing_stream = spec("newest");
        missing_stream.stream.clear();
        assert!(matches!(
            Subscription::new(missing_stream, ledger.clone()),
            Err(EventsError::Validation(_))
        ));

        assert!(matches!(
            Subscription::new(spec("not-a-number"), ledger.clone()),
            Err(EventsError::Validation(_))
        ));

        let mut bad_filter = spec("newest");
        bad_filter.filter.event_filter = Some("(unclosed".to_string());
        assert!(matches!(
            Subscription::new(bad_filter, ledger),
            Err(EventsError::Validation(_))
        ));
    }

    #[test]
    fn empty_from_block_defaults_to_newest() {
        let ledger = Arc::new(MockLedger::new());
        let sub = Subscription::new(spec(""), ledger).expect("new");
        assert_eq!(sub.info().from_block, FROM_BLOCK_NEWEST);
    }

    #[tokio::test]
    async fn initial_block_height_uses_chain_height_for_newest() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_chain_height(42);
        let sub = Subscription::new(spec("newest"), ledger).expect("new");
        assert_eq!(sub.initial_block_height().await.expect("height"), 42);
        assert_eq!(sub.block_hwm(), 42);
    }

    #[tokio::test]
    async fn initial_block_height_parses_decimal() {
        let ledger = Arc::new(MockLedger::new());
        let sub = Subscription::new(spec("100"), ledger).expect("new");
        assert_eq!(sub.initial_block_height().await.expect("height"), 100);
    }

    #[tokio::test]
    async fn restart_filter_routes_events_into_the_stream() {
        let ledger = Arc::new(MockLedger::new());
        let sub = Subscription::new(spec("1"), ledger.clone()).expect("new");
        let (tx, mut rx) = mpsc::channel(8);
        sub.clone().restart_filter(tx, 1, CancellationToken::new()).await.expect("restart");
        assert!(!sub.filter_stale());

        ledger
            .emit_block(
                "ch1",
                7,
                vec![chaincode_event(7, 0, "asset", "Created", serde_json::json!({}))],
            )
            .await;
        let envelope = rx.recv().await.expect("event");
        assert_eq!(envelope.entry.sub_id, "sb-test");
        assert_eq!(envelope.entry.block_number, 7);

        // Completion advances the HWM past the delivered block.
        envelope.complete();
        assert_eq!(sub.block_hwm(), 8);
    }

    #[tokio::test]
    async fn checkpoint_height_can_rewind_for_reset() {
        let ledger = Arc::new(MockLedger::new());
        let sub = Subscription::new(spec("1"), ledger).expect("new");
        sub.set_checkpoint_block_height(50);
        assert_eq!(sub.block_hwm(), 50);
        // A reset re-seeds the HWM at the requested block, even backwards.
        sub.set_checkpoint_block_height(10);
        assert_eq!(sub.block_hwm(), 10);
    }

    #[tokio::test]
    async fn unsubscribe_marks_stale_and_unregisters() {
        let ledger = Arc::new(MockLedger::new());
        let sub = Subscription::new(spec("1"), ledger.clone()).expect("new");
        let (tx, _rx) = mpsc::channel(8);
        sub.clone().restart_filter(tx, 1, CancellationToken::new()).await.expect("restart");
        assert_eq!(ledger.listener_count(), 1);

        sub.unsubscribe(false).await;
        assert!(sub.filter_stale());
        assert!(!sub.is_deleting());
        assert_eq!(ledger.listener_count(), 0);

        sub.unsubscribe(true).await;
        assert!(sub.is_deleting());
    }

    #[tokio::test]
    async fn deleting_subscription_drops_events() {
        let ledger = Arc::new(MockLedger::new());
        let sub = Subscription::new(spec("1"), ledger.clone()).expect("new");
        let (tx, mut rx) = mpsc::channel(8);
        sub.clone().restart_filter(tx, 1, CancellationToken::new()).await.expect("restart");
        sub.deleting.store(true, Ordering::SeqCst);
        ledger
            .emit_block(
                "ch1",
                2,
                vec![chaincode_event(2, 0, "asset", "Created", serde_json::json!({}))],
            )
            .await;
        assert!(rx.try_recv().is_err());
    }
}
