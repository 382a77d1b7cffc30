//! Full-path test: REST-created websocket stream delivering ledger events
//! to a real WebSocket client over the /ws endpoint, with batch acks
//! advancing the persisted checkpoint.
use fabgate_events::kvstore::{KvStore, MemoryKv};
use fabgate_events::ledger::mock::{MockLedger, chaincode_event};
use fabgate_events::{EventStreamConf, SubscriptionManager};
use fabgate_ws::WsChannels;
use futures::{SinkExt, StreamExt};
use gateway::app::{AppState, build_router};
use gateway::receipts::ReceiptStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

struct TestServer {
    addr: std::net::SocketAddr,
    ledger: Arc<MockLedger>,
    manager: Arc<SubscriptionManager>,
    db: Arc<MemoryKv>,
}

async fn start_server() -> TestServer {
    let ledger = Arc::new(MockLedger::new());
    let channels = Arc::new(WsChannels::new());
    let db = Arc::new(MemoryKv::new());
    let manager = Arc::new(SubscriptionManager::new(
        EventStreamConf {
            polling_interval: Duration::from_millis(10),
            webhooks_allow_private_ips: true,
            max_in_flight: 10_000,
        },
        ledger.clone(),
        channels.clone(),
        db.clone(),
    ));
    let state = AppState {
        manager: manager.clone(),
        channels,
        ledger: ledger.clone(),
        receipts: Arc::new(ReceiptStore::new()),
    };
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("serve");
    });
    TestServer {
        addr,
        ledger,
        manager,
        db,
    }
}

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_json(socket: &mut WsClient) -> serde_json::Value {
    let frame = tokio::time::timeout(Duration::from_secs(10), socket.next())
        .await
        .expect("frame before timeout")
        .expect("stream open")
        .expect("frame");
    match frame {
        Message::Text(text) => serde_json::from_str(&text).expect("json frame"),
        other => panic!("unexpected websocket frame: {other:?}"),
    }
}

#[tokio::test]
async fn websocket_stream_delivers_batches_and_checkpoints_on_ack() {
    let server = start_server().await;

    let (mut socket, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .expect("connect");
    socket
        .send(Message::Text(
            serde_json::json!({"type": "listen", "topic": "e2e"}).to_string(),
        ))
        .await
        .expect("listen");

    let stream = server
        .manager
        .add_stream(fabgate_events::model::StreamInfo {
            stream_type: "websocket".to_string(),
            batch_size: 2,
            batch_timeout_ms: 200,
            websocket: Some(fabgate_events::model::WebSocketInfo {
                topic: "e2e".to_string(),
                distribution_mode: None,
            }),
            ..Default::default()
        })
        .await
        .expect("stream");
    let sub = server
        .manager
        .add_subscription(fabgate_events::model::SubscriptionInfo {
            channel_id: "ch1".to_string(),
            stream: stream.id.clone(),
            filter: fabgate_events::model::EventFilter {
                chaincode_id: "asset".to_string(),
                ..Default::default()
            },
            from_block: "1".to_string(),
            ..Default::default()
        })
        .await
        .expect("subscription");

    // Give the poller a beat to register, then commit one block with two
    // matching events.
    for _ in 0..200 {
        if server.ledger.listener_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.ledger.listener_count(), 1);
    server
        .ledger
        .emit_block(
            "ch1",
            5,
            vec![
                chaincode_event(5, 0, "asset", "Created", serde_json::json!({"id": "a1"})),
                chaincode_event(5, 1, "asset", "Created", serde_json::json!({"id": "a2"})),
            ],
        )
        .await;

    let frame = next_json(&mut socket).await;
    assert_eq!(frame["topic"], "e2e");
    let batch_number = frame["batchNumber"].as_u64().expect("batch number");
    let events = frame["events"].as_array().expect("events");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["blockNumber"], 5);
    assert_eq!(events[0]["subId"], sub.id);

    socket
        .send(Message::Text(
            serde_json::json!({
                "type": "ack",
                "topic": "e2e",
                "batchNumber": batch_number
            })
            .to_string(),
        ))
        .await
        .expect("ack");

    // The ack lets the checkpoint advance past the delivered block.
    let checkpoint_key = format!("cp-{}", stream.id);
    let mut checkpointed = false;
    for _ in 0..200 {
        if let Some(bytes) = server.db.get(&checkpoint_key).expect("get") {
            let checkpoint: HashMap<String, u64> =
                serde_json::from_slice(&bytes).expect("checkpoint");
            if checkpoint.get(&sub.id) == Some(&6) {
                checkpointed = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(checkpointed, "checkpoint never reached block 6");

    // And the pipeline keeps flowing: the next block arrives as a fresh
    // batch flushed by the timeout.
    server
        .ledger
        .emit_block(
            "ch1",
            6,
            vec![chaincode_event(6, 0, "asset", "Created", serde_json::json!({"id": "a3"}))],
        )
        .await;
    let frame = next_json(&mut socket).await;
    let events = frame["events"].as_array().expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["blockNumber"], 6);
    socket
        .send(Message::Text(
            serde_json::json!({
                "type": "ack",
                "topic": "e2e",
                "batchNumber": frame["batchNumber"].as_u64().expect("batch number")
            })
            .to_string(),
        ))
        .await
        .expect("ack");

    let _ = socket.close(None).await;
    server.manager.close().await;
}

#[tokio::test]
async fn malformed_websocket_command_gets_an_error_reply() {
    let server = start_server().await;
    let (mut socket, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .expect("connect");
    socket
        .send(Message::Text("{\"type\": \"dance\"}".to_string()))
        .await
        .expect("send");
    let reply = next_json(&mut socket).await;
    assert!(reply["error"].as_str().expect("error").contains("invalid request"));
    let _ = socket.close(None).await;
}
