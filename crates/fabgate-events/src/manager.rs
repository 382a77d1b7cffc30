//! Registry of event streams and subscriptions.
//!
//! # Purpose
//! The subscription manager owns the flat registries behind the REST
//! surface: it creates, persists, recovers and destroys streams and
//! subscriptions, and brokers checkpoint reads/writes for the stream
//! pollers. Components reference each other by id through the registry,
//! never by direct pointer, so there are no ownership cycles.
use crate::error::{EventsError, KvError};
use crate::kvstore::KvStore;
use crate::ledger::LedgerClient;
use crate::model::{
    CHECKPOINT_ID_PREFIX, FROM_BLOCK_NEWEST, STREAM_ID_PREFIX, STREAM_PATH_PREFIX, SUB_ID_PREFIX,
    SUB_PATH_PREFIX, StreamInfo, SubscriptionInfo, now_rfc3339,
};
use crate::stream::{EventStream, EventStreamConf};
use crate::subscription::Subscription;
use fabgate_ws::WsChannels;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Shared state a stream's pipeline needs from the manager side. Streams
/// hold this, never the manager itself.
pub(crate) struct Registry {
    pub(crate) conf: EventStreamConf,
    pub(crate) db: Arc<dyn KvStore>,
    pub(crate) ledger: Arc<dyn LedgerClient>,
    pub(crate) ws: Arc<WsChannels>,
    pub(crate) subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
}

impl Registry {
    /// Snapshot of the subscriptions bound to one stream.
    pub(crate) async fn subscriptions_for_stream(
        &self,
        stream_id: &str,
    ) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .await
            .values()
            .filter(|subscription| subscription.stream_id() == stream_id)
            .cloned()
            .collect()
    }

    /// An absent checkpoint record is an empty map, not an error.
    pub(crate) fn load_checkpoint(
        &self,
        stream_id: &str,
    ) -> Result<HashMap<String, u64>, EventsError> {
        let key = format!("{CHECKPOINT_ID_PREFIX}{stream_id}");
        match self.db.get(&key)? {
            None => Ok(HashMap::new()),
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                EventsError::Store(KvError::Corrupt {
                    key,
                    message: err.to_string(),
                })
            }),
        }
    }

    pub(crate) fn store_checkpoint(
        &self,
        stream_id: &str,
        checkpoint: &HashMap<String, u64>,
    ) -> Result<(), EventsError> {
        let key = format!("{CHECKPOINT_ID_PREFIX}{stream_id}");
        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|err| EventsError::Store(KvError::Io(err.to_string())))?;
        tracing::debug!(key = %key, "storing checkpoint");
        self.db.put(&key, &bytes)?;
        Ok(())
    }

    pub(crate) fn delete_checkpoint(&self, stream_id: &str) {
        let key = format!("{CHECKPOINT_ID_PREFIX}{stream_id}");
        if let Err(err) = self.db.delete(&key) {
            tracing::error!(key = %key, error = %err, "failed to delete checkpoint");
        }
    }
}

pub struct SubscriptionManager {
    registry: Arc<Registry>,
    streams: RwLock<HashMap<String, Arc<EventStream>>>,
    // Serializes all mutating operations; reads go straight to the maps.
    ops: Mutex<()>,
    closed: AtomicBool,
}

impl SubscriptionManager {
    pub fn new(
        conf: EventStreamConf,
        ledger: Arc<dyn LedgerClient>,
        ws: Arc<WsChannels>,
        db: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            registry: Arc::new(Registry {
                conf,
                db,
                ledger,
                ws,
                subscriptions: RwLock::new(HashMap::new()),
            }),
            streams: RwLock::new(HashMap::new()),
            ops: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Rehydrate every persisted stream, then every subscription. Bad
    /// records are logged and skipped so one corrupt entry cannot take
    /// down recovery of the rest.
    pub async fn init(&self) -> Result<(), EventsError> {
        let _guard = self.ops.lock().await;
        self.recover_streams().await?;
        self.recover_subscriptions().await?;
        Ok(())
    }

    async fn recover_streams(&self) -> Result<(), EventsError> {
        for (key, value) in self.registry.db.iterate_prefix(STREAM_ID_PREFIX)? {
            let spec: StreamInfo = match serde_json::from_slice(&value) {
                Ok(spec) => spec,
                Err(err) => {
                    tracing::error!(key = %key, error = %err, "failed to recover stream record");
                    continue;
                }
            };
            match EventStream::new(self.registry.clone(), spec) {
                Ok(stream) => {
                    self.streams
                        .write()
                        .await
                        .insert(stream.id().to_string(), stream);
                }
                Err(err) => {
                    tracing::error!(key = %key, error = %err, "failed to recover stream");
                }
            }
        }
        Ok(())
    }

    async fn recover_subscriptions(&self) -> Result<(), EventsError> {
        for (key, value) in self.registry.db.iterate_prefix(SUB_ID_PREFIX)? {
            let info: SubscriptionInfo = match serde_json::from_slice(&value) {
                Ok(info) => info,
                Err(err) => {
                    tracing::error!(key = %key, error = %err, "failed to recover subscription record");
                    continue;
                }
            };
            if !self.streams.read().await.contains_key(&info.stream) {
                tracing::warn!(
                    subscription = %info.id,
                    stream = %info.stream,
                    "recovered subscription references a missing stream"
                );
            }
            match Subscription::new(info, self.registry.ledger.clone()) {
                Ok(subscription) => {
                    self.registry
                        .subscriptions
                        .write()
                        .await
                        .insert(subscription.id(), subscription);
                }
                Err(err) => {
                    tracing::error!(key = %key, error = %err, "failed to recover subscription");
                }
            }
        }
        Ok(())
    }

    /// Stop every stream and close every subscription. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("event stream subscription manager shutting down");
        let _guard = self.ops.lock().await;
        for stream in self.streams.write().await.drain().map(|(_, s)| s) {
            stream.stop();
        }
        for subscription in self
            .registry
            .subscriptions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
        {
            subscription.close().await;
        }
    }

    // ---- streams --------------------------------------------------------

    pub async fn add_stream(&self, mut spec: StreamInfo) -> Result<StreamInfo, EventsError> {
        let _guard = self.ops.lock().await;
        spec.id = format!("{STREAM_ID_PREFIX}{}", Uuid::new_v4());
        spec.created = now_rfc3339();
        spec.path = format!("{STREAM_PATH_PREFIX}/{}", spec.id);
        let stream = EventStream::new(self.registry.clone(), spec)?;
        let snapshot = stream.spec_snapshot();
        self.streams
            .write()
            .await
            .insert(snapshot.id.clone(), stream);
        self.store_stream(&snapshot)?;
        Ok(snapshot)
    }

    pub async fn streams(&self) -> Vec<StreamInfo> {
        self.streams
            .read()
            .await
            .values()
            .map(|stream| stream.spec_snapshot())
            .collect()
    }

    pub async fn stream_by_id(&self, id: &str) -> Result<StreamInfo, EventsError> {
        Ok(self.stream_arc(id).await?.spec_snapshot())
    }

    pub async fn update_stream(
        &self,
        id: &str,
        new_spec: StreamInfo,
    ) -> Result<StreamInfo, EventsError> {
        let _guard = self.ops.lock().await;
        let stream = self.stream_arc(id).await?;
        let updated = stream.update(new_spec).await?;
        self.store_stream(&updated)?;
        Ok(updated)
    }

    pub async fn suspend_stream(&self, id: &str) -> Result<(), EventsError> {
        let _guard = self.ops.lock().await;
        let stream = self.stream_arc(id).await?;
        stream.suspend();
        self.store_stream(&stream.spec_snapshot())?;
        Ok(())
    }

    pub async fn resume_stream(&self, id: &str) -> Result<(), EventsError> {
        let _guard = self.ops.lock().await;
        let stream = self.stream_arc(id).await?;
        stream.clone().resume()?;
        self.store_stream(&stream.spec_snapshot())?;
        Ok(())
    }

    /// Delete a stream, cascading over its subscriptions and checkpoint.
    pub async fn delete_stream(&self, id: &str) -> Result<(), EventsError> {
        let _guard = self.ops.lock().await;
        let stream = self.stream_arc(id).await?;
        for subscription in self.registry.subscriptions_for_stream(id).await {
            if let Err(err) = self.delete_subscription_record(&subscription).await {
                tracing::error!(
                    subscription = %subscription.id(),
                    error = %err,
                    "failed to delete subscription while deleting stream"
                );
            }
        }
        self.streams.write().await.remove(id);
        stream.stop();
        self.registry.db.delete(id)?;
        self.registry.delete_checkpoint(id);
        Ok(())
    }

    // ---- subscriptions --------------------------------------------------

    pub async fn add_subscription(
        &self,
        mut spec: SubscriptionInfo,
    ) -> Result<SubscriptionInfo, EventsError> {
        let _guard = self.ops.lock().await;
        if !spec.stream.is_empty() && !self.streams.read().await.contains_key(&spec.stream) {
            return Err(EventsError::NotFound(format!(
                "stream {} not found",
                spec.stream
            )));
        }
        spec.id = format!("{SUB_ID_PREFIX}{}", Uuid::new_v4());
        spec.created = now_rfc3339();
        spec.path = format!("{SUB_PATH_PREFIX}/{}", spec.id);
        let subscription = Subscription::new(spec, self.registry.ledger.clone())?;
        let info = subscription.info();
        self.registry
            .subscriptions
            .write()
            .await
            .insert(info.id.clone(), subscription);
        self.store_subscription(&info)?;
        Ok(info)
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry
            .subscriptions
            .read()
            .await
            .values()
            .map(|subscription| subscription.info())
            .collect()
    }

    pub async fn subscriptions_for_stream(&self, stream_id: &str) -> Vec<SubscriptionInfo> {
        self.registry
            .subscriptions_for_stream(stream_id)
            .await
            .iter()
            .map(|subscription| subscription.info())
            .collect()
    }

    pub async fn subscription_by_id(&self, id: &str) -> Result<SubscriptionInfo, EventsError> {
        Ok(self.subscription_arc(id).await?.info())
    }

    /// Rewind or fast-forward a subscription. The listener restart happens
    /// on the owning stream's next poll cycle.
    pub async fn reset_subscription(
        &self,
        id: &str,
        initial_block: &str,
    ) -> Result<(), EventsError> {
        let _guard = self.ops.lock().await;
        let subscription = self.subscription_arc(id).await?;
        let from_block = if initial_block.is_empty() || initial_block == FROM_BLOCK_NEWEST {
            FROM_BLOCK_NEWEST.to_string()
        } else {
            initial_block.parse::<u64>().map_err(|_| {
                EventsError::Validation(format!(
                    "initialBlock must be \"{FROM_BLOCK_NEWEST}\" or a decimal block number"
                ))
            })?;
            initial_block.to_string()
        };
        subscription.set_from_block(from_block);
        self.store_subscription(&subscription.info())?;
        subscription.request_reset();
        Ok(())
    }

    pub async fn delete_subscription(&self, id: &str) -> Result<(), EventsError> {
        let _guard = self.ops.lock().await;
        let subscription = self.subscription_arc(id).await?;
        self.delete_subscription_record(&subscription).await
    }

    // ---- internals ------------------------------------------------------

    async fn delete_subscription_record(
        &self,
        subscription: &Arc<Subscription>,
    ) -> Result<(), EventsError> {
        let id = subscription.id();
        self.registry.subscriptions.write().await.remove(&id);
        subscription.unsubscribe(true).await;
        self.registry.db.delete(&id)?;
        Ok(())
    }

    async fn stream_arc(&self, id: &str) -> Result<Arc<EventStream>, EventsError> {
        self.streams
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EventsError::NotFound(format!("stream {id} not found")))
    }

    async fn subscription_arc(&self, id: &str) -> Result<Arc<Subscription>, EventsError> {
        self.registry
            .subscriptions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EventsError::NotFound(format!("subscription {id} not found")))
    }

    fn store_stream(&self, spec: &StreamInfo) -> Result<(), EventsError> {
        let bytes = serde_json::to_vec_pretty(spec)
            .map_err(|err| EventsError::Store(KvError::Io(err.to_string())))?;
        self.registry.db.put(&spec.id, &bytes)?;
        Ok(())
    }

    fn store_subscription(&self, info: &SubscriptionInfo) -> Result<(), EventsError> {
        let bytes = serde_json::to_vec_pretty(info)
            .map_err(|err| EventsError::Store(KvError::Io(err.to_string())))?;
        self.registry.db.put(&info.id, &bytes)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn stream_for_tests(&self, id: &str) -> Arc<EventStream> {
        self.stream_arc(id).await.expect("stream")
    }
}
