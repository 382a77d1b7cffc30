//! In-memory registry of transaction receipts for the async submission
//! path. Bounded: the oldest receipts fall off once the capacity is hit.
use fabgate_events::ledger::TxReceipt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use utoipa::ToSchema;

const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRecord {
    pub id: String,
    /// `pending`, `success` or `failed`.
    pub status: String,
    pub channel: String,
    pub chaincode: String,
    pub received: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Default)]
struct ReceiptLog {
    order: VecDeque<String>,
    by_id: HashMap<String, ReceiptRecord>,
}

pub struct ReceiptStore {
    log: Mutex<ReceiptLog>,
    capacity: usize,
}

impl Default for ReceiptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiptStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            log: Mutex::new(ReceiptLog::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn add(&self, record: ReceiptRecord) {
        let mut log = self.log.lock().expect("receipt lock");
        log.order.push_back(record.id.clone());
        log.by_id.insert(record.id.clone(), record);
        while log.order.len() > self.capacity {
            if let Some(evicted) = log.order.pop_front() {
                log.by_id.remove(&evicted);
            }
        }
    }

    /// Settle a pending receipt with the invocation outcome.
    pub fn complete(&self, id: &str, outcome: Result<TxReceipt, String>) {
        let mut log = self.log.lock().expect("receipt lock");
        if let Some(record) = log.by_id.get_mut(id) {
            match outcome {
                Ok(receipt) => {
                    record.status = "success".to_string();
                    record.transaction_id = Some(receipt.transaction_id);
                    record.block_number = Some(receipt.block_number);
                }
                Err(message) => {
                    record.status = "failed".to_string();
                    record.error_message = Some(message);
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<ReceiptRecord> {
        self.log.lock().expect("receipt lock").by_id.get(id).cloned()
    }

    /// Newest receipts first, up to `limit`.
    pub fn list(&self, limit: usize) -> Vec<ReceiptRecord> {
        let log = self.log.lock().expect("receipt lock");
        log.order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| log.by_id.get(id).cloned())
            .collect()
    }
}
