//! Ledger client capability.
//!
//! # Purpose
//! The streaming engine only needs a narrow slice of a ledger connection:
//! register/unregister a filtered block listener from a given height, query
//! the current height, look up block timestamps, and invoke chaincode for
//! the transaction submission path. Everything else about the ledger is an
//! external concern. Errors are opaque and retryable at the caller's
//! discretion.
use crate::error::LedgerError;
use crate::model::EventFilter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use utoipa::ToSchema;

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Handle to a registered block/chaincode-event listener.
pub type ListenerId = u64;

/// One chaincode event as observed on the ledger, before it is bound to a
/// subscription.
#[derive(Debug, Clone)]
pub struct LedgerEvent {
    pub block_number: u64,
    pub transaction_id: String,
    pub transaction_index: u32,
    pub event_index: u32,
    pub chaincode_id: String,
    pub event_name: String,
    pub payload: serde_json::Value,
}

/// Receipt of a committed chaincode invocation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_id: String,
    pub block_number: u64,
    pub status: String,
}

pub type EventSinkFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback installed with a listener. The adapter awaits the returned
/// future, so a slow consumer pushes back on event delivery.
pub type EventSink = Arc<dyn Fn(LedgerEvent) -> EventSinkFuture + Send + Sync>;

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Register a listener for events matching `filter` on `channel`,
    /// starting at `from_block`. Events flow to `sink` in ledger order.
    async fn register_listener(
        &self,
        channel: &str,
        filter: &EventFilter,
        from_block: u64,
        sink: EventSink,
    ) -> LedgerResult<ListenerId>;

    async fn unregister_listener(&self, listener: ListenerId) -> LedgerResult<()>;

    /// Height of the channel, i.e. the number of the next block.
    async fn chain_height(&self, channel: &str) -> LedgerResult<u64>;

    async fn block_timestamp(&self, channel: &str, block_number: u64) -> LedgerResult<u64>;

    async fn invoke(
        &self,
        channel: &str,
        chaincode: &str,
        function: &str,
        args: &[String],
    ) -> LedgerResult<TxReceipt>;
}

pub mod mock {
    //! In-process ledger simulator.
    //!
    //! Keeps the full emitted block history, so a listener registered at an
    //! old height replays matching history before going live, the way a
    //! real block listener would.
    use super::*;
    use regex::Regex;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Debug, Clone)]
    pub struct InvokeRecord {
        pub channel: String,
        pub chaincode: String,
        pub function: String,
        pub args: Vec<String>,
    }

    #[derive(Debug, Clone)]
    pub struct RegistrationRecord {
        pub channel: String,
        pub chaincode_id: String,
        pub from_block: u64,
    }

    struct CompiledFilter {
        chaincode_id: String,
        event_name: Option<Regex>,
    }

    impl CompiledFilter {
        fn compile(filter: &EventFilter) -> LedgerResult<Self> {
            let event_name = match &filter.event_filter {
                Some(pattern) => Some(Regex::new(pattern).map_err(|err| {
                    LedgerError::Registration(format!("invalid event filter: {err}"))
                })?),
                None => None,
            };
            Ok(Self {
                chaincode_id: filter.chaincode_id.clone(),
                event_name,
            })
        }

        fn matches(&self, event: &LedgerEvent) -> bool {
            if !self.chaincode_id.is_empty() && self.chaincode_id != event.chaincode_id {
                return false;
            }
            match &self.event_name {
                Some(regex) => regex.is_match(&event.event_name),
                None => true,
            }
        }
    }

    struct Listener {
        channel: String,
        filter: CompiledFilter,
        sink: EventSink,
    }

    #[derive(Default)]
    struct Inner {
        next_listener: ListenerId,
        height: u64,
        listeners: HashMap<ListenerId, Listener>,
        history: Vec<(String, u64, Vec<LedgerEvent>)>,
        invocations: Vec<InvokeRecord>,
        registrations: Vec<RegistrationRecord>,
    }

    pub struct MockLedger {
        inner: Mutex<Inner>,
        fail_registrations: AtomicBool,
        fail_invocations: AtomicBool,
        timestamp_lookups: AtomicU64,
    }

    impl Default for MockLedger {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockLedger {
        pub fn new() -> Self {
            Self {
                inner: Mutex::new(Inner {
                    height: 1,
                    ..Default::default()
                }),
                fail_registrations: AtomicBool::new(false),
                fail_invocations: AtomicBool::new(false),
                timestamp_lookups: AtomicU64::new(0),
            }
        }

        pub fn set_chain_height(&self, height: u64) {
            self.inner.lock().expect("ledger lock").height = height;
        }

        pub fn set_fail_registrations(&self, fail: bool) {
            self.fail_registrations.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_invocations(&self, fail: bool) {
            self.fail_invocations.store(fail, Ordering::SeqCst);
        }

        pub fn listener_count(&self) -> usize {
            self.inner.lock().expect("ledger lock").listeners.len()
        }

        pub fn registrations(&self) -> Vec<RegistrationRecord> {
            self.inner.lock().expect("ledger lock").registrations.clone()
        }

        pub fn invocations(&self) -> Vec<InvokeRecord> {
            self.inner.lock().expect("ledger lock").invocations.clone()
        }

        pub fn timestamp_lookups(&self) -> u64 {
            self.timestamp_lookups.load(Ordering::SeqCst)
        }

        /// Commit a block of chaincode events on `channel` and deliver the
        /// matching ones to every live listener. Also remembered so later
        /// registrations can replay it.
        pub async fn emit_block(
            &self,
            channel: &str,
            block_number: u64,
            events: Vec<LedgerEvent>,
        ) {
            let deliveries: Vec<(EventSink, Vec<LedgerEvent>)> = {
                let mut inner = self.inner.lock().expect("ledger lock");
                inner
                    .history
                    .push((channel.to_string(), block_number, events.clone()));
                inner.height = inner.height.max(block_number + 1);
                inner
                    .listeners
                    .values()
                    .filter(|listener| listener.channel == channel)
                    .map(|listener| {
                        let matching = events
                            .iter()
                            .filter(|event| listener.filter.matches(event))
                            .cloned()
                            .collect();
                        (listener.sink.clone(), matching)
                    })
                    .collect()
            };
            for (sink, events) in deliveries {
                for event in events {
                    sink(event).await;
                }
            }
        }
    }

    /// Shorthand for building the events fed to [`MockLedger::emit_block`].
    pub fn chaincode_event(
        block_number: u64,
        transaction_index: u32,
        chaincode_id: &str,
        event_name: &str,
        payload: serde_json::Value,
    ) -> LedgerEvent {
        LedgerEvent {
            block_number,
            transaction_id: format!("tx-{block_number}-{transaction_index}"),
            transaction_index,
            event_index: 0,
            chaincode_id: chaincode_id.to_string(),
            event_name: event_name.to_string(),
            payload,
        }
    }

    #[async_trait]
    impl LedgerClient for MockLedger {
        async fn register_listener(
            &self,
            channel: &str,
            filter: &EventFilter,
            from_block: u64,
            sink: EventSink,
        ) -> LedgerResult<ListenerId> {
            if self.fail_registrations.load(Ordering::SeqCst) {
                return Err(LedgerError::Unavailable(
                    "listener registration disabled".to_string(),
                ));
            }
            let compiled = CompiledFilter::compile(filter)?;
            let (replay, listener_id) = {
                let mut inner = self.inner.lock().expect("ledger lock");
                inner.next_listener += 1;
                let listener_id = inner.next_listener;
                inner.registrations.push(RegistrationRecord {
                    channel: channel.to_string(),
                    chaincode_id: filter.chaincode_id.clone(),
                    from_block,
                });
                let replay: Vec<LedgerEvent> = inner
                    .history
                    .iter()
                    .filter(|(c, block, _)| c == channel && *block >= from_block)
                    .flat_map(|(_, _, events)| events.iter())
                    .filter(|event| compiled.matches(event))
                    .cloned()
                    .collect();
                inner.listeners.insert(
                    listener_id,
                    Listener {
                        channel: channel.to_string(),
                        filter: compiled,
                        sink: sink.clone(),
                    },
                );
                (replay, listener_id)
            };
            for event in replay {
                sink(event).await;
            }
            Ok(listener_id)
        }

        async fn unregister_listener(&self, listener: ListenerId) -> LedgerResult<()> {
            self.inner
                .lock()
                .expect("ledger lock")
                .listeners
                .remove(&listener);
            Ok(())
        }

        async fn chain_height(&self, _channel: &str) -> LedgerResult<u64> {
            Ok(self.inner.lock().expect("ledger lock").height)
        }

        async fn block_timestamp(&self, _channel: &str, block_number: u64) -> LedgerResult<u64> {
            self.timestamp_lookups.fetch_add(1, Ordering::SeqCst);
            // Deterministic synthetic clock: one second per block.
            Ok(1_700_000_000 + block_number)
        }

        async fn invoke(
            &self,
            channel: &str,
            chaincode: &str,
            function: &str,
            args: &[String],
        ) -> LedgerResult<TxReceipt> {
            if self.fail_invocations.load(Ordering::SeqCst) {
                return Err(LedgerError::Invoke("endorsement failed".to_string()));
            }
            let mut inner = self.inner.lock().expect("ledger lock");
            inner.invocations.push(InvokeRecord {
                channel: channel.to_string(),
                chaincode: chaincode.to_string(),
                function: function.to_string(),
                args: args.to_vec(),
            });
            let block_number = inner.height;
            inner.height += 1;
            Ok(TxReceipt {
                transaction_id: format!("tx-{}", uuid::Uuid::new_v4()),
                block_number,
                status: "VALID".to_string(),
            })
        }
    }

}
