// In-process WebSocket topic channels.
// Event streams hand batches to a named topic here; the gateway's /ws
// handler attaches connected clients as consumers. Delivery is either
// broadcast (every consumer sees the batch) or workload distribution
// (exactly one consumer, round-robin), and the sender is only told the
// batch succeeded once a consumer acks it.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use utoipa::ToSchema;

pub type Result<T> = std::result::Result<T, WsChannelError>;

#[derive(thiserror::Error, Debug)]
pub enum WsChannelError {
    #[error("no consumers attached to topic {0}")]
    NoConsumers(String),
    #[error("batch {batch_number} on topic {topic} was rejected: {message}")]
    Rejected {
        topic: String,
        batch_number: u64,
        message: String,
    },
    #[error("timed out waiting for ack of batch {batch_number} on topic {topic}")]
    AckTimeout { topic: String, batch_number: u64 },
}

/// How a topic hands batches to its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum DistributionMode {
    #[serde(rename = "broadcast")]
    Broadcast,
    #[serde(rename = "workloadDistribution")]
    WorkloadDistribution,
}

impl Default for DistributionMode {
    fn default() -> Self {
        DistributionMode::Broadcast
    }
}

const DEFAULT_TOPIC_CAPACITY: usize = 1024;
const WORKER_QUEUE_CAPACITY: usize = 64;
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

enum AckOutcome {
    Ack,
    Nack(String),
}

/// One batch in flight to consumers. The first consumer to call
/// [`DeliveredBatch::ack`] or [`DeliveredBatch::nack`] settles it;
/// later calls are ignored.
pub struct DeliveredBatch {
    topic: String,
    batch_number: u64,
    events: serde_json::Value,
    settle: Mutex<Option<oneshot::Sender<AckOutcome>>>,
}

impl DeliveredBatch {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn batch_number(&self) -> u64 {
        self.batch_number
    }

    pub fn events(&self) -> &serde_json::Value {
        &self.events
    }

    pub fn ack(&self) {
        self.settle_with(AckOutcome::Ack);
    }

    pub fn nack(&self, message: impl Into<String>) {
        self.settle_with(AckOutcome::Nack(message.into()));
    }

    fn settle_with(&self, outcome: AckOutcome) {
        let sender = self.settle.lock().expect("settle lock").take();
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

pub type Delivery = Arc<DeliveredBatch>;

struct WorkerPool {
    senders: Vec<mpsc::Sender<Delivery>>,
    next: usize,
}

struct Topic {
    // Live fan-out for broadcast consumers.
    sender: broadcast::Sender<Delivery>,
    // Round-robin pool for workload-distribution consumers.
    workers: Mutex<WorkerPool>,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            workers: Mutex::new(WorkerPool {
                senders: Vec::new(),
                next: 0,
            }),
        }
    }

    // Pick the next live worker, pruning senders whose consumer went away.
    fn next_worker(&self) -> Option<mpsc::Sender<Delivery>> {
        let mut pool = self.workers.lock().expect("worker pool lock");
        pool.senders.retain(|sender| !sender.is_closed());
        if pool.senders.is_empty() {
            return None;
        }
        let index = pool.next % pool.senders.len();
        pool.next = pool.next.wrapping_add(1);
        Some(pool.senders[index].clone())
    }
}

/// Registry of named topic channels.
///
/// ```
/// use fabgate_ws::{DistributionMode, WsChannels};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let channels = WsChannels::new();
///     let mut consumer = channels.subscribe("topic-1").await;
///     let deliver = channels.deliver(
///         "topic-1",
///         DistributionMode::Broadcast,
///         1,
///         serde_json::json!([{"blockNumber": 10}]),
///     );
///     let ack = async {
///         let batch = consumer.recv().await.expect("recv");
///         batch.ack();
///     };
///     let (result, ()) = tokio::join!(deliver, ack);
///     result.expect("delivered");
/// });
/// ```
pub struct WsChannels {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    topic_capacity: usize,
    ack_timeout: Duration,
}

impl Default for WsChannels {
    fn default() -> Self {
        Self::new()
    }
}

impl WsChannels {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            topic_capacity: DEFAULT_TOPIC_CAPACITY,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    async fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().await.get(name) {
            return topic.clone();
        }
        let mut guard = self.topics.write().await;
        guard
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(self.topic_capacity)))
            .clone()
    }

    /// Attach a broadcast consumer to `topic`. Every broadcast delivery is
    /// fanned out to all attached consumers.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Delivery> {
        self.topic(topic).await.sender.subscribe()
    }

    /// Attach a workload-distribution consumer to `topic`. Deliveries in
    /// workload-distribution mode go to exactly one attached consumer.
    /// Detach by dropping the receiver.
    pub async fn attach_worker(&self, topic: &str) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
        let topic = self.topic(topic).await;
        topic
            .workers
            .lock()
            .expect("worker pool lock")
            .senders
            .push(tx);
        rx
    }

    /// Hand a batch to the topic's consumers and wait for the ack.
    ///
    /// Returns an error when no consumer is attached, a consumer nacks the
    /// batch, or nobody acks within the ack timeout. The caller owns retry.
    pub async fn deliver(
        &self,
        topic: &str,
        mode: DistributionMode,
        batch_number: u64,
        events: serde_json::Value,
    ) -> Result<()> {
        let (settle_tx, settle_rx) = oneshot::channel();
        let batch = Arc::new(DeliveredBatch {
            topic: topic.to_string(),
            batch_number,
            events,
            settle: Mutex::new(Some(settle_tx)),
        });

        let state = self.topic(topic).await;
        tracing::debug!(topic, batch_number, ?mode, "delivering batch to topic");
        match mode {
            DistributionMode::Broadcast => {
                if state.sender.send(batch.clone()).is_err() {
                    tracing::warn!(topic, batch_number, "no consumers attached to topic");
                    return Err(WsChannelError::NoConsumers(topic.to_string()));
                }
            }
            DistributionMode::WorkloadDistribution => {
                // Walk the pool until one live worker accepts the batch.
                let mut delivered = false;
                let mut remaining = {
                    let pool = state.workers.lock().expect("worker pool lock");
                    pool.senders.len()
                };
                while remaining > 0 {
                    let Some(worker) = state.next_worker() else {
                        break;
                    };
                    if worker.send(batch.clone()).await.is_ok() {
                        delivered = true;
                        break;
                    }
                    remaining -= 1;
                }
                if !delivered {
                    return Err(WsChannelError::NoConsumers(topic.to_string()));
                }
            }
        }

        match tokio::time::timeout(self.ack_timeout, settle_rx).await {
            Ok(Ok(AckOutcome::Ack)) => Ok(()),
            Ok(Ok(AckOutcome::Nack(message))) => Err(WsChannelError::Rejected {
                topic: topic.to_string(),
                batch_number,
                message,
            }),
            // The sender half lives inside the batch we still hold, so a
            // closed channel only happens if all consumer clones are gone.
            Ok(Err(_)) | Err(_) => Err(WsChannelError::AckTimeout {
                topic: topic.to_string(),
                batch_number,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_delivers_and_acks() {
        let channels = WsChannels::new();
        let mut consumer = channels.subscribe("orders").await;
        let deliver = channels.deliver(
            "orders",
            DistributionMode::Broadcast,
            1,
            serde_json::json!([{"blockNumber": 7}]),
        );
        let ack = async {
            let batch = consumer.recv().await.expect("recv");
            assert_eq!(batch.batch_number(), 1);
            assert_eq!(batch.topic(), "orders");
            batch.ack();
        };
        let (result, ()) = tokio::join!(deliver, ack);
        result.expect("delivered");
    }

    #[tokio::test]
    async fn nack_surfaces_as_rejection() {
        let channels = WsChannels::new();
        let mut consumer = channels.subscribe("orders").await;
        let deliver = channels.deliver(
            "orders",
            DistributionMode::Broadcast,
            3,
            serde_json::json!([]),
        );
        let nack = async {
            let batch = consumer.recv().await.expect("recv");
            batch.nack("consumer rejected");
        };
        let (result, ()) = tokio::join!(deliver, nack);
        match result {
            Err(WsChannelError::Rejected {
                batch_number,
                message,
                ..
            }) => {
                assert_eq!(batch_number, 3);
                assert_eq!(message, "consumer rejected");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let channels = WsChannels::new().with_ack_timeout(Duration::from_millis(50));
        let mut consumer = channels.subscribe("orders").await;
        let deliver = channels.deliver(
            "orders",
            DistributionMode::Broadcast,
            1,
            serde_json::json!([]),
        );
        let sit_on_it = async {
            let _batch = consumer.recv().await.expect("recv");
            // Never ack.
        };
        let (result, ()) = tokio::join!(deliver, sit_on_it);
        assert!(matches!(result, Err(WsChannelError::AckTimeout { .. })));
    }

    #[tokio::test]
    async fn broadcast_without_consumers_fails_fast() {
        let channels = WsChannels::new();
        let result = channels
            .deliver(
                "empty",
                DistributionMode::Broadcast,
                1,
                serde_json::json!([]),
            )
            .await;
        assert!(matches!(result, Err(WsChannelError::NoConsumers(_))));
    }

    #[tokio::test]
    async fn workload_distribution_round_robins() {
        let channels = WsChannels::new();
        let worker_a = channels.attach_worker("jobs").await;
        let worker_b = channels.attach_worker("jobs").await;

        let consume = |mut rx: mpsc::Receiver<Delivery>| async move {
            let mut seen = Vec::new();
            while let Some(batch) = rx.recv().await {
                seen.push(batch.batch_number());
                batch.ack();
                if seen.len() == 2 {
                    break;
                }
            }
            seen
        };

        let deliver_all = async {
            for batch_number in 1..=4u64 {
                channels
                    .deliver(
                        "jobs",
                        DistributionMode::WorkloadDistribution,
                        batch_number,
                        serde_json::json!([]),
                    )
                    .await
                    .expect("deliver");
            }
        };
        let (_, seen_a, seen_b) = tokio::join!(
            deliver_all,
            consume(worker_a),
            consume(worker_b)
        );
        let mut all: Vec<u64> = seen_a.into_iter().chain(seen_b).collect();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn dropped_worker_is_pruned() {
        let channels = WsChannels::new();
        let worker_a = channels.attach_worker("jobs").await;
        let mut worker_b = channels.attach_worker("jobs").await;
        drop(worker_a);

        let deliver = channels.deliver(
            "jobs",
            DistributionMode::WorkloadDistribution,
            1,
            serde_json::json!([]),
        );
        let ack = async {
            let batch = worker_b.recv().await.expect("recv");
            batch.ack();
        };
        let (result, ()) = tokio::join!(deliver, ack);
        result.expect("delivered to surviving worker");
    }

    #[tokio::test]
    async fn workload_distribution_without_workers_fails_fast() {
        let channels = WsChannels::new();
        let result = channels
            .deliver(
                "empty",
                DistributionMode::WorkloadDistribution,
                1,
                serde_json::json!([]),
            )
            .await;
        assert!(matches!(result, Err(WsChannelError::NoConsumers(_))));
    }

    #[test]
    fn distribution_mode_serializes_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&DistributionMode::Broadcast).expect("json"),
            "\"broadcast\""
        );
        assert_eq!(
            serde_json::to_string(&DistributionMode::WorkloadDistribution).expect("json"),
            "\"workloadDistribution\""
        );
    }
}
