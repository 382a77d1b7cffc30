//! WebSocket endpoint bridging connected clients onto the topic channels.
//!
//! Protocol: a client sends `{"type":"listen","topic":...,"distributionMode":...}`
//! to attach to a topic, then receives batch frames
//! `{"topic":...,"batchNumber":n,"events":[...]}` and must answer each with
//! `{"type":"ack",...}` or `{"type":"error",...}`. An unanswered batch
//! counts as a delivery failure once the channel's ack timeout elapses.
use crate::app::AppState;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use fabgate_ws::{Delivery, DistributionMode, WsChannels};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    Listen {
        topic: String,
        #[serde(default)]
        distribution_mode: Option<DistributionMode>,
    },
    #[serde(rename_all = "camelCase")]
    Ack { topic: String, batch_number: u64 },
    #[serde(rename_all = "camelCase")]
    Error {
        topic: String,
        batch_number: u64,
        #[serde(default)]
        message: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchFrame<'a> {
    topic: &'a str,
    batch_number: u64,
    events: &'a serde_json::Value,
}

type PendingAcks = Arc<Mutex<HashMap<(String, u64), Delivery>>>;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.channels.clone()))
}

async fn handle_socket(socket: WebSocket, channels: Arc<WsChannels>) {
    tracing::info!("new websocket connection");
    let (mut sink, mut stream) = socket.split();
    // Single writer task; consumer tasks and the command loop all feed it.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
    let mut consumers: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(ClientCommand::Listen {
                    topic,
                    distribution_mode,
                }) => {
                    let mode = distribution_mode.unwrap_or_default();
                    tracing::info!(topic = %topic, ?mode, "websocket client listening");
                    consumers.push(
                        spawn_consumer(&channels, topic, mode, out_tx.clone(), pending.clone())
                            .await,
                    );
                }
                Ok(ClientCommand::Ack {
                    topic,
                    batch_number,
                }) => {
                    let batch = pending
                        .lock()
                        .expect("pending lock")
                        .remove(&(topic, batch_number));
                    if let Some(batch) = batch {
                        batch.ack();
                    }
                }
                Ok(ClientCommand::Error {
                    topic,
                    batch_number,
                    message,
                }) => {
                    let batch = pending
                        .lock()
                        .expect("pending lock")
                        .remove(&(topic, batch_number));
                    if let Some(batch) = batch {
                        batch.nack(if message.is_empty() {
                            "client rejected batch".to_string()
                        } else {
                            message
                        });
                    }
                }
                Err(err) => {
                    let reply = serde_json::json!({"error": format!("invalid request: {err}")});
                    if out_tx.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            },
            Ok(Message::Ping(data)) => {
                if out_tx.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "websocket error");
                break;
            }
        }
    }

    for consumer in consumers {
        consumer.abort();
    }
    writer.abort();
    tracing::info!("websocket connection closed");
}

async fn spawn_consumer(
    channels: &Arc<WsChannels>,
    topic: String,
    mode: DistributionMode,
    out_tx: mpsc::Sender<Message>,
    pending: PendingAcks,
) -> tokio::task::JoinHandle<()> {
    match mode {
        DistributionMode::Broadcast => {
            let mut rx = channels.subscribe(&topic).await;
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(batch) => {
                            if forward(&topic, batch, &out_tx, &pending).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(topic = %topic, skipped, "websocket consumer lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        }
        DistributionMode::WorkloadDistribution => {
            let mut rx = channels.attach_worker(&topic).await;
            tokio::spawn(async move {
                while let Some(batch) = rx.recv().await {
                    if forward(&topic, batch, &out_tx, &pending).await.is_err() {
                        break;
                    }
                }
            })
        }
    }
}

async fn forward(
    topic: &str,
    batch: Delivery,
    out_tx: &mpsc::Sender<Message>,
    pending: &PendingAcks,
) -> Result<(), ()> {
    let frame = BatchFrame {
        topic,
        batch_number: batch.batch_number(),
        events: batch.events(),
    };
    let Ok(text) = serde_json::to_string(&frame) else {
        return Ok(());
    };
    pending
        .lock()
        .expect("pending lock")
        .insert((topic.to_string(), batch.batch_number()), batch);
    out_tx.send(Message::Text(text)).await.map_err(|_| ())
}
