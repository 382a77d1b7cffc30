use thiserror::Error;

/// Failures raised by the embedded key-value store.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("failed to open key-value store at {path}: {message}")]
    Open { path: String, message: String },
    #[error("key-value store i/o error: {0}")]
    Io(String),
    #[error("corrupt record under key {key}: {message}")]
    Corrupt { key: String, message: String },
}

/// Failures raised by the ledger client. Opaque to the caller and
/// retryable at its discretion.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("listener registration failed: {0}")]
    Registration(String),
    #[error("chaincode invoke failed: {0}")]
    Invoke(String),
}

/// Error surface of the event streaming subsystem. The REST layer maps
/// `Validation` to 400, `NotFound` to 404 and everything else to 500.
#[derive(Debug, Error)]
pub enum EventsError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] KvError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EventsError>;
