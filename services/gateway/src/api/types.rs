//! Request/response payloads for the REST surface.
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error body shape shared by every failing endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(default)]
    pub initial_block: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SuspendedResponse {
    pub id: String,
    pub suspended: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ResumedResponse {
    pub id: String,
    pub resumed: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeletedResponse {
    pub id: String,
    pub deleted: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ResetResponse {
    pub id: String,
    pub reset: String,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct TxHeaders {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub signer: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    #[serde(default)]
    pub headers: TxHeaders,
    #[serde(default)]
    pub chaincode: String,
    #[serde(rename = "func", default)]
    pub function: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Standard reply for asynchronously dispatched transactions.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AsyncSentReply {
    pub sent: bool,
    pub id: String,
}
