//! Per-stream delivery pipeline and state machine.
//!
//! # Purpose
//! Each event stream runs three cooperating tasks:
//! - the **poller** keeps subscription listeners registered against the
//!   ledger and persists checkpoints as high-water-marks advance,
//! - the **dispatcher** drains the stream's input channel into batches,
//!   flushing on size or timeout,
//! - the **processor** pops queued batches and drives the sink action
//!   through the retry envelope.
//!
//! The tasks share one mutex-guarded runtime state plus a `Notify` used as
//! a condition variable, and are all woken by a single
//! cancellation token when the stream is updated or shut down.
//!
//! `in_flight` counts events the dispatcher has accepted that are not yet
//! acked or skipped. It rises by one per accepted event and falls by the
//! batch length exactly once when the processor finishes with a batch,
//! whether that batch was delivered, skipped, or abandoned for a
//! suspend/update (abandoned events come back through a stale-filter
//! restart from the checkpoint).
use crate::action::{Action, build_action};
use crate::error::EventsError;
use crate::manager::Registry;
use crate::model::{EventEntry, StreamInfo, normalize_error_handling};
use crate::subscription::Subscription;
use lru::LruCache;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_EXPONENTIAL_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const DEFAULT_EXPONENTIAL_BACKOFF_FACTOR: f64 = 2.0;

/// Gateway-level settings shared by every stream.
#[derive(Debug, Clone)]
pub struct EventStreamConf {
    pub polling_interval: Duration,
    pub webhooks_allow_private_ips: bool,
    /// Ceiling on accepted-but-unacked events per stream; the dispatcher
    /// stops accepting once it is reached, pushing back on the ledger
    /// adapter through the bounded input channel.
    pub max_in_flight: u64,
}

impl Default for EventStreamConf {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
            webhooks_allow_private_ips: false,
            max_in_flight: 10_000,
        }
    }
}

/// One event in flight from a subscription to a sink, carrying the hook
/// that advances the subscription's HWM once its batch is acked.
pub(crate) struct EventEnvelope {
    pub(crate) entry: EventEntry,
    pub(crate) channel_id: String,
    hwm: Arc<AtomicU64>,
}

impl EventEnvelope {
    pub(crate) fn new(entry: EventEntry, channel_id: String, hwm: Arc<AtomicU64>) -> Self {
        Self {
            entry,
            channel_id,
            hwm,
        }
    }

    /// Batch-complete callback: the HWM moves to the block after this
    /// event, and never backwards.
    pub(crate) fn complete(&self) {
        self.hwm
            .fetch_max(self.entry.block_number + 1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Runtime {
    in_flight: u64,
    batch_queue: VecDeque<Vec<EventEnvelope>>,
    batch_count: u64,
    stopped: bool,
    suspended: bool,
    update_in_progress: bool,
    poller_done: bool,
    processor_done: bool,
}

pub(crate) struct EventStream {
    id: String,
    registry: Arc<Registry>,
    spec: RwLock<StreamInfo>,
    action: RwLock<Arc<dyn Action>>,
    runtime: Mutex<Runtime>,
    notify: Notify,
    event_tx: mpsc::Sender<EventEnvelope>,
    event_rx: Mutex<Option<mpsc::Receiver<EventEnvelope>>>,
    // One token per start_event_handlers generation. Update and stop
    // cancel every outstanding token: the dispatcher survives
    // suspend/resume cycles and so may still hold an older generation's
    // token than the poller and processor.
    tokens: Mutex<Vec<CancellationToken>>,
    stop_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    // Block-timestamp LRU shared by all subscriptions of this stream.
    ts_cache: tokio::sync::Mutex<LruCache<u64, u64>>,
    polling_interval: Duration,
    initial_retry_delay: Duration,
    backoff_factor: f64,
}

enum RetryOutcome {
    Delivered,
    Failed(crate::action::ActionError),
    Interrupted,
}

enum ProcessorWake {
    Exit,
    ExitOnUpdate,
    Batch(u64, Vec<EventEnvelope>),
}

impl EventStream {
    /// Normalize and validate the spec, construct the sink action and
    /// start the pipeline. Must run inside a tokio runtime.
    pub(crate) fn new(
        registry: Arc<Registry>,
        mut spec: StreamInfo,
    ) -> Result<Arc<Self>, EventsError> {
        if spec.id.is_empty() {
            return Err(EventsError::Validation(
                "event stream has no id".to_string(),
            ));
        }
        spec.normalize();
        spec.validate()?;
        let action = build_action(
            &spec,
            registry.ws.clone(),
            registry.conf.webhooks_allow_private_ips,
        )?;

        let mut polling_interval = registry.conf.polling_interval;
        if polling_interval.is_zero() {
            polling_interval = Duration::from_millis(10);
        }
        let cache_size =
            NonZeroUsize::new(spec.timestamp_cache_size).unwrap_or(NonZeroUsize::MIN);
        let (event_tx, event_rx) = mpsc::channel(1);
        let suspended = spec.suspended;

        let stream = Arc::new(Self {
            id: spec.id.clone(),
            registry,
            spec: RwLock::new(spec),
            action: RwLock::new(action),
            runtime: Mutex::new(Runtime {
                suspended,
                ..Default::default()
            }),
            notify: Notify::new(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            tokens: Mutex::new(Vec::new()),
            stop_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            ts_cache: tokio::sync::Mutex::new(LruCache::new(cache_size)),
            polling_interval,
            initial_retry_delay: DEFAULT_EXPONENTIAL_BACKOFF_INITIAL,
            backoff_factor: DEFAULT_EXPONENTIAL_BACKOFF_FACTOR,
        });
        Self::start_event_handlers(&stream, false);
        Ok(stream)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn spec_snapshot(&self) -> StreamInfo {
        self.spec.read().expect("spec lock").clone()
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> u64 {
        self.runtime.lock().expect("runtime lock").in_flight
    }

    fn start_event_handlers(stream: &Arc<EventStream>, resume: bool) {
        let token = CancellationToken::new();
        stream.tokens.lock().expect("tokens lock").push(token.clone());
        let mut handles = stream.handles.lock().expect("handles lock");
        handles.push(tokio::spawn(Self::poller_loop(
            stream.clone(),
            token.clone(),
        )));
        handles.push(tokio::spawn(Self::processor_loop(
            stream.clone(),
            token.clone(),
        )));
        // On resume the dispatcher never terminated, so only a full start
        // (create or post-update) launches it.
        if !resume {
            handles.push(tokio::spawn(Self::dispatcher_loop(stream.clone(), token)));
        }
    }

    pub(crate) fn event_sender(&self) -> mpsc::Sender<EventEnvelope> {
        self.event_tx.clone()
    }

    fn suspend_or_stop(&self) -> bool {
        let runtime = self.runtime.lock().expect("runtime lock");
        runtime.suspended || runtime.stopped
    }

    // True while the pipeline holds at least a full batch of unacked
    // events; the poller then avoids feeding it more work.
    fn is_blocked(&self) -> bool {
        let batch_size = self.spec.read().expect("spec lock").batch_size;
        let in_flight = self.runtime.lock().expect("runtime lock").in_flight;
        let blocked = in_flight >= batch_size;
        if blocked {
            tracing::warn!(
                stream = %self.id,
                in_flight,
                batch_size,
                "stream is currently blocked"
            );
        }
        blocked
    }

    fn cancel_all_tokens(&self) {
        for token in self.tokens.lock().expect("tokens lock").drain(..) {
            token.cancel();
        }
    }

    /// Lazy stop: flags the pipeline down and wakes every phase.
    pub(crate) fn stop(&self) {
        self.runtime.lock().expect("runtime lock").stopped = true;
        self.stop_token.cancel();
        self.cancel_all_tokens();
        self.notify.notify_waiters();
    }

    /// Stop the processor and poller, leaving queued state intact. The
    /// dispatcher keeps accepting events up to the in-flight ceiling.
    pub(crate) fn suspend(&self) {
        self.runtime.lock().expect("runtime lock").suspended = true;
        self.spec.write().expect("spec lock").suspended = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn resume(self: Arc<Self>) -> Result<(), EventsError> {
        {
            let mut runtime = self.runtime.lock().expect("runtime lock");
            if !runtime.processor_done || !runtime.poller_done {
                return Err(EventsError::Internal(
                    "stream handlers have not fully stopped, resume again once in-flight work has drained"
                        .to_string(),
                ));
            }
            runtime.suspended = false;
            runtime.processor_done = false;
            runtime.poller_done = false;
        }
        self.spec.write().expect("spec lock").suspended = false;
        Self::start_event_handlers(&self, true);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Apply a new spec. Quiesces all three phases, merges the mutable
    /// fields, rebuilds the sink action and restarts the pipeline. The
    /// stream type is immutable.
    pub(crate) async fn update(
        self: Arc<Self>,
        new_spec: StreamInfo,
    ) -> Result<StreamInfo, EventsError> {
        // Validate before interrupting anything so a rejected update
        // leaves the stream running untouched.
        {
            let spec = self.spec.read().expect("spec lock");
            if !new_spec.stream_type.is_empty()
                && new_spec.stream_type.to_lowercase() != spec.stream_type
            {
                return Err(EventsError::Validation(
                    "the type of an event stream cannot be changed".to_string(),
                ));
            }
            if spec.stream_type == crate::model::STREAM_TYPE_WEBHOOK {
                if let Some(webhook) = &new_spec.webhook {
                    if webhook.url.is_empty() {
                        return Err(EventsError::Validation(
                            "webhook url is required".to_string(),
                        ));
                    }
                    reqwest::Url::parse(&webhook.url).map_err(|_| {
                        EventsError::Validation(format!("invalid webhook url: {}", webhook.url))
                    })?;
                }
            }
        }

        tracing::info!(stream = %self.id, "updating event stream");
        {
            let mut runtime = self.runtime.lock().expect("runtime lock");
            runtime.update_in_progress = true;
        }
        self.notify.notify_waiters();
        self.cancel_all_tokens();
        let handles: Vec<JoinHandle<()>> = {
            let mut handles = self.handles.lock().expect("handles lock");
            handles.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        let updated = {
            let mut spec = self.spec.write().expect("spec lock");
            apply_update(&mut spec, new_spec);
            spec.clone()
        };
        let action = build_action(
            &updated,
            self.registry.ws.clone(),
            self.registry.conf.webhooks_allow_private_ips,
        )?;
        *self.action.write().expect("action lock") = action;

        {
            let mut runtime = self.runtime.lock().expect("runtime lock");
            runtime.poller_done = false;
            runtime.processor_done = false;
            runtime.update_in_progress = false;
        }
        Self::start_event_handlers(&self, false);
        Ok(updated)
    }

    async fn mark_all_subscriptions_stale(&self) {
        // Stale subscriptions restart from the checkpoint if and when the
        // poller runs again.
        for subscription in self.registry.subscriptions_for_stream(&self.id).await {
            subscription.mark_filter_stale();
        }
    }

    // ---- poller ---------------------------------------------------------

    async fn poller_loop(stream: Arc<EventStream>, token: CancellationToken) {
        let mut checkpoint: Option<HashMap<String, u64>> = None;
        while !stream.suspend_or_stop() {
            if checkpoint.is_none() {
                match stream.registry.load_checkpoint(&stream.id) {
                    Ok(loaded) => checkpoint = Some(loaded),
                    Err(err) => {
                        tracing::error!(stream = %stream.id, error = %err, "failed to load checkpoint");
                    }
                }
            }
            let subscriptions = stream.registry.subscriptions_for_stream(&stream.id).await;
            if let Some(checkpoint) = checkpoint.as_mut() {
                // While blocked only checkpoint bookkeeping runs; no new
                // filter registrations that would feed a full pipeline.
                if !stream.is_blocked() {
                    for subscription in &subscriptions {
                        if let Err(err) = stream
                            .poll_subscription(subscription, checkpoint, &token)
                            .await
                        {
                            tracing::error!(
                                stream = %stream.id,
                                subscription = %subscription.id(),
                                error = %err,
                                "subscription error"
                            );
                        }
                    }
                }
                let mut changed = false;
                for subscription in &subscriptions {
                    let id = subscription.id();
                    let previous = checkpoint.get(&id).copied().unwrap_or(0);
                    let hwm = subscription.block_hwm();
                    changed = changed || previous == 0 || previous != hwm;
                    checkpoint.insert(id, hwm);
                }
                if changed {
                    if let Err(err) = stream.registry.store_checkpoint(&stream.id, checkpoint) {
                        tracing::error!(stream = %stream.id, error = %err, "failed to store checkpoint");
                    }
                }
            }
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(stream = %stream.id, "stream update in progress, exiting event poller");
                    break;
                }
                _ = stream.stop_token.cancelled() => break,
                _ = tokio::time::sleep(stream.polling_interval) => {}
            }
        }
        stream.mark_all_subscriptions_stale().await;
        stream.runtime.lock().expect("runtime lock").poller_done = true;
    }

    async fn poll_subscription(
        &self,
        subscription: &Arc<Subscription>,
        checkpoint: &mut HashMap<String, u64>,
        token: &CancellationToken,
    ) -> Result<(), EventsError> {
        // Resets run on the polling task to avoid racing the listener: it
        // is just an unsubscribe plus dropping the checkpoint entry.
        if subscription.reset_requested() {
            subscription.unsubscribe(false).await;
            checkpoint.remove(&subscription.id());
        }
        if subscription.filter_stale() && !subscription.is_deleting() {
            let block_height = match checkpoint.get(&subscription.id()).copied() {
                Some(height) if height > 0 => {
                    subscription.set_checkpoint_block_height(height);
                    height
                }
                _ => subscription.initial_block_height().await?,
            };
            subscription
                .clone()
                .restart_filter(self.event_sender(), block_height, token.clone())
                .await?;
        }
        Ok(())
    }

    // ---- dispatcher -----------------------------------------------------

    async fn dispatcher_loop(stream: Arc<EventStream>, token: CancellationToken) {
        let Some(mut events) = stream.event_rx.lock().expect("event rx lock").take() else {
            return;
        };
        let (batch_size, batch_timeout, timestamps) = {
            let spec = stream.spec.read().expect("spec lock");
            (
                spec.batch_size.max(1) as usize,
                Duration::from_millis(spec.batch_timeout_ms),
                spec.timestamps,
            )
        };
        let max_in_flight = stream.registry.conf.max_in_flight;
        let mut current: Vec<EventEnvelope> = Vec::new();
        let mut deadline = tokio::time::Instant::now();

        'dispatch: loop {
            // Refuse further accepts past the in-flight ceiling; the
            // bounded input channel then pushes back on the listeners.
            loop {
                let notified = stream.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let over = {
                    stream.runtime.lock().expect("runtime lock").in_flight >= max_in_flight
                };
                if !over {
                    break;
                }
                tokio::select! {
                    _ = &mut notified => {}
                    _ = token.cancelled() => break 'dispatch,
                    _ = stream.stop_token.cancelled() => break 'dispatch,
                }
            }

            if current.is_empty() {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!(stream = %stream.id, "stream update in progress, not waiting for new events");
                        break;
                    }
                    _ = stream.stop_token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            stream.accept_event(&mut current, event, timestamps).await;
                            deadline = tokio::time::Instant::now() + batch_timeout;
                        }
                        None => break,
                    }
                }
            } else {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!(stream = %stream.id, "stream update in progress, will not dispatch batch");
                        break;
                    }
                    _ = stream.stop_token.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {
                        stream.flush_batch(&mut current);
                        continue;
                    }
                    event = events.recv() => match event {
                        Some(event) => stream.accept_event(&mut current, event, timestamps).await,
                        None => {
                            tracing::info!(stream = %stream.id, "event stream stopped while waiting for batch to fill");
                            break;
                        }
                    }
                }
            }
            if current.len() >= batch_size {
                stream.flush_batch(&mut current);
            }
        }

        // Events accepted into a never-flushed batch are handed back to
        // the source: they reappear through a filter restart.
        if !current.is_empty() {
            let mut runtime = stream.runtime.lock().expect("runtime lock");
            runtime.in_flight = runtime.in_flight.saturating_sub(current.len() as u64);
        }
        *stream.event_rx.lock().expect("event rx lock") = Some(events);
        stream.notify.notify_waiters();
    }

    async fn accept_event(
        &self,
        current: &mut Vec<EventEnvelope>,
        mut event: EventEnvelope,
        timestamps: bool,
    ) {
        if timestamps {
            if let Some(timestamp) = self.lookup_block_timestamp(&event).await {
                event.entry.timestamp = Some(timestamp);
            }
        }
        self.runtime.lock().expect("runtime lock").in_flight += 1;
        current.push(event);
    }

    async fn lookup_block_timestamp(&self, event: &EventEnvelope) -> Option<u64> {
        let block_number = event.entry.block_number;
        {
            let mut cache = self.ts_cache.lock().await;
            if let Some(timestamp) = cache.get(&block_number) {
                return Some(*timestamp);
            }
        }
        match self
            .registry
            .ledger
            .block_timestamp(&event.channel_id, block_number)
            .await
        {
            Ok(timestamp) => {
                self.ts_cache.lock().await.put(block_number, timestamp);
                Some(timestamp)
            }
            Err(err) => {
                tracing::warn!(
                    stream = %self.id,
                    block = block_number,
                    error = %err,
                    "failed to look up block timestamp"
                );
                None
            }
        }
    }

    fn flush_batch(&self, current: &mut Vec<EventEnvelope>) {
        if current.is_empty() {
            return;
        }
        let batch = std::mem::take(current);
        metrics::histogram!("fabgate_batch_size").record(batch.len() as f64);
        self.runtime
            .lock()
            .expect("runtime lock")
            .batch_queue
            .push_back(batch);
        self.notify.notify_waiters();
    }

    // ---- processor ------------------------------------------------------

    async fn processor_loop(stream: Arc<EventStream>, token: CancellationToken) {
        'process: loop {
            let wake = loop {
                let notified = stream.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let mut runtime = stream.runtime.lock().expect("runtime lock");
                    if runtime.update_in_progress {
                        break ProcessorWake::ExitOnUpdate;
                    }
                    if runtime.suspended || runtime.stopped {
                        break ProcessorWake::Exit;
                    }
                    if let Some(batch) = runtime.batch_queue.pop_front() {
                        runtime.batch_count += 1;
                        break ProcessorWake::Batch(runtime.batch_count, batch);
                    }
                }
                notified.await;
            };
            match wake {
                ProcessorWake::Exit => break 'process,
                ProcessorWake::ExitOnUpdate => {
                    token.cancelled().await;
                    tracing::info!(stream = %stream.id, "stream update in progress, exiting batch processor");
                    break 'process;
                }
                ProcessorWake::Batch(batch_number, batch) => {
                    stream.process_batch(&token, batch_number, batch).await;
                }
            }
        }
        stream.runtime.lock().expect("runtime lock").processor_done = true;
    }

    /// Drive one batch to completion. Never returns an error: the
    /// block/skip policy decides whether a failed batch blocks the stream
    /// or is skipped after the retry envelope is exhausted.
    async fn process_batch(
        &self,
        token: &CancellationToken,
        batch_number: u64,
        events: Vec<EventEnvelope>,
    ) {
        if events.is_empty() {
            return;
        }
        let (error_handling_block, blocked_retry_delay) = {
            let spec = self.spec.read().expect("spec lock");
            (
                spec.is_error_handling_block(),
                Duration::from_secs(spec.blocked_retry_delay_sec),
            )
        };
        let mut processed = false;
        let mut interrupted = false;
        let mut attempt: u64 = 0;
        while !self.suspend_or_stop() && !processed && !interrupted {
            if attempt > 0 {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(blocked_retry_delay) => {}
                }
            }
            attempt += 1;
            tracing::info!(
                stream = %self.id,
                batch = batch_number,
                events = events.len(),
                first_block = events[0].entry.block_number,
                last_block = events[events.len() - 1].entry.block_number,
                "dispatching batch"
            );
            let entries: Vec<EventEntry> =
                events.iter().map(|event| event.entry.clone()).collect();
            match self
                .perform_action_with_retry(token, batch_number, &entries)
                .await
            {
                RetryOutcome::Delivered => processed = true,
                RetryOutcome::Interrupted => interrupted = true,
                RetryOutcome::Failed(err) => {
                    tracing::error!(
                        stream = %self.id,
                        batch = batch_number,
                        attempt,
                        error = %err,
                        blocked = error_handling_block,
                        "batch delivery failed"
                    );
                    if !error_handling_block {
                        metrics::counter!("fabgate_batches_skipped_total").increment(1);
                        processed = true;
                    }
                }
            }
        }

        // The batch is out of the pipeline now on every path.
        {
            let mut runtime = self.runtime.lock().expect("runtime lock");
            runtime.in_flight = runtime.in_flight.saturating_sub(events.len() as u64);
        }
        self.notify.notify_waiters();

        if !processed || self.suspend_or_stop() {
            return;
        }
        // Advance HWMs via the last event per subscription in the batch.
        let mut last_per_sub: HashMap<&str, &EventEnvelope> = HashMap::new();
        for event in &events {
            last_per_sub.insert(event.entry.sub_id.as_str(), event);
        }
        for event in last_per_sub.values() {
            event.complete();
        }
        metrics::counter!("fabgate_batches_delivered_total").increment(1);
    }

    async fn perform_action_with_retry(
        &self,
        token: &CancellationToken,
        batch_number: u64,
        events: &[EventEntry],
    ) -> RetryOutcome {
        let action = self.action.read().expect("action lock").clone();
        let retry_timeout =
            Duration::from_secs(self.spec.read().expect("spec lock").retry_timeout_sec);
        let started = std::time::Instant::now();
        let mut delay = self.initial_retry_delay;
        let mut attempt: u64 = 0;
        loop {
            if self.suspend_or_stop() {
                return RetryOutcome::Interrupted;
            }
            if attempt > 0 {
                tracing::info!(
                    stream = %self.id,
                    batch = batch_number,
                    delay_secs = delay.as_secs_f64(),
                    "waiting before re-attempting batch"
                );
                tokio::select! {
                    _ = token.cancelled() => return RetryOutcome::Interrupted,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = delay.mul_f64(self.backoff_factor);
            }
            attempt += 1;
            match action.attempt_batch(batch_number, attempt, events).await {
                Ok(()) => return RetryOutcome::Delivered,
                Err(err) => {
                    if started.elapsed() >= retry_timeout {
                        return RetryOutcome::Failed(err);
                    }
                }
            }
        }
    }
}

// Merge the mutable fields of `new_spec` into `spec`, with the same
// zero-means-unchanged rules the REST PATCH contract documents.
fn apply_update(spec: &mut StreamInfo, new_spec: StreamInfo) {
    if let (Some(webhook), Some(new_webhook)) = (spec.webhook.as_mut(), new_spec.webhook) {
        webhook.url = new_webhook.url;
        webhook.headers = new_webhook.headers;
        webhook.tls_skip_host_verify = new_webhook.tls_skip_host_verify;
        webhook.request_timeout_sec = if new_webhook.request_timeout_sec == 0 {
            120
        } else {
            new_webhook.request_timeout_sec
        };
    }
    if let (Some(websocket), Some(new_websocket)) = (spec.websocket.as_mut(), new_spec.websocket)
    {
        websocket.topic = new_websocket.topic;
        websocket.distribution_mode = new_websocket.distribution_mode;
    }
    if new_spec.batch_size != 0 && new_spec.batch_size <= crate::model::MAX_BATCH_SIZE {
        spec.batch_size = new_spec.batch_size;
    }
    if new_spec.batch_timeout_ms != 0 {
        spec.batch_timeout_ms = new_spec.batch_timeout_ms;
    }
    if new_spec.blocked_retry_delay_sec != 0 {
        spec.blocked_retry_delay_sec = new_spec.blocked_retry_delay_sec;
    }
    spec.error_handling = normalize_error_handling(&new_spec.error_handling);
    if !new_spec.name.is_empty() {
        spec.name = new_spec.name;
    }
    spec.timestamps = new_spec.timestamps;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ERROR_HANDLING_BLOCK, ERROR_HANDLING_SKIP, WebhookInfo};

    fn webhook_spec() -> StreamInfo {
        let mut spec = StreamInfo {
            id: "es-1".to_string(),
            stream_type: "webhook".to_string(),
            webhook: Some(WebhookInfo {
                url: "https://example.com/hook".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        spec.normalize();
        spec
    }

    #[test]
    fn apply_update_merges_mutable_fields() {
        let mut spec = webhook_spec();
        let new_spec = StreamInfo {
            name: "renamed".to_string(),
            batch_size: 50,
            batch_timeout_ms: 250,
            blocked_retry_delay_sec: 5,
            error_handling: "Block".to_string(),
            timestamps: true,
            webhook: Some(WebhookInfo {
                url: "https://example.com/v2".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        apply_update(&mut spec, new_spec);
        assert_eq!(spec.name, "renamed");
        assert_eq!(spec.batch_size, 50);
        assert_eq!(spec.batch_timeout_ms, 250);
        assert_eq!(spec.blocked_retry_delay_sec, 5);
        assert_eq!(spec.error_handling, ERROR_HANDLING_BLOCK);
        assert!(spec.timestamps);
        let webhook = spec.webhook.as_ref().expect("webhook");
        assert_eq!(webhook.url, "https://example.com/v2");
        assert_eq!(webhook.request_timeout_sec, 120);
    }

    #[test]
    fn apply_update_keeps_zero_valued_fields() {
        let mut spec = webhook_spec();
        spec.batch_size = 10;
        spec.batch_timeout_ms = 1000;
        apply_update(&mut spec, StreamInfo::default());
        assert_eq!(spec.batch_size, 10);
        assert_eq!(spec.batch_timeout_ms, 1000);
        // An absent errorHandling normalizes back to skip.
        assert_eq!(spec.error_handling, ERROR_HANDLING_SKIP);
    }

    #[test]
    fn envelope_completion_is_monotonic() {
        let hwm = Arc::new(AtomicU64::new(0));
        let entry = EventEntry {
            sub_id: "sb-1".to_string(),
            block_number: 9,
            transaction_id: "tx".to_string(),
            transaction_index: 0,
            event_index: 0,
            chaincode_id: "cc".to_string(),
            event_name: "E".to_string(),
            payload: serde_json::Value::Null,
            timestamp: None,
        };
        let envelope = EventEnvelope::new(entry, "ch1".to_string(), hwm.clone());
        envelope.complete();
        assert_eq!(hwm.load(Ordering::SeqCst), 10);
        // Completing again (redelivery) never regresses the HWM.
        hwm.store(25, Ordering::SeqCst);
        envelope.complete();
        assert_eq!(hwm.load(Ordering::SeqCst), 25);
    }
}
