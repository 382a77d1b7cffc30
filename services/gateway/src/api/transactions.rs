//! Transaction submission and receipt handlers.
//!
//! Synchronous dispatch (`?fly-sync=true`) invokes the chaincode and
//! returns the receipt inline. The default asynchronous path replies 202
//! with a request id and settles the receipt in the registry once the
//! invocation completes.
use crate::api::error::{ApiError, api_bad_request, api_internal, api_not_found};
use crate::api::types::{AsyncSentReply, TransactionRequest};
use crate::app::AppState;
use crate::receipts::ReceiptRecord;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use fabgate_events::ledger::{LedgerClient, TxReceipt};
use std::collections::HashMap;
use uuid::Uuid;

const RECEIPT_LIST_LIMIT: usize = 100;

#[utoipa::path(
    post,
    path = "/transactions",
    tag = "transactions",
    request_body = TransactionRequest,
    params(
        ("fly-sync" = Option<bool>, Query, description = "Wait for the commit and return the receipt inline")
    ),
    responses(
        (status = 200, description = "Transaction committed", body = TxReceipt),
        (status = 202, description = "Transaction dispatched", body = AsyncSentReply),
        (status = 400, description = "Invalid transaction body", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn send_transaction(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    payload: Result<Json<TransactionRequest>, JsonRejection>,
) -> Result<axum::response::Response, ApiError> {
    let Json(request) =
        payload.map_err(|err| api_bad_request(format!("invalid transaction body: {err}")))?;
    if request.headers.channel.is_empty() {
        return Err(api_bad_request(r#"missing required parameter "channel""#));
    }
    if request.chaincode.is_empty() {
        return Err(api_bad_request(r#"missing required parameter "chaincode""#));
    }
    if request.function.is_empty() {
        return Err(api_bad_request(r#"missing required parameter "func""#));
    }

    let sync = params
        .get("fly-sync")
        .map(|value| value == "true")
        .unwrap_or(false);
    if sync {
        let receipt = state
            .ledger
            .invoke(
                &request.headers.channel,
                &request.chaincode,
                &request.function,
                &request.args,
            )
            .await
            .map_err(|err| api_internal(format!("transaction failed: {err}")))?;
        return Ok(Json(receipt).into_response());
    }

    let id = format!("r-{}", Uuid::new_v4());
    state.receipts.add(ReceiptRecord {
        id: id.clone(),
        status: "pending".to_string(),
        channel: request.headers.channel.clone(),
        chaincode: request.chaincode.clone(),
        received: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        transaction_id: None,
        block_number: None,
        error_message: None,
    });
    let ledger = state.ledger.clone();
    let receipts = state.receipts.clone();
    let receipt_id = id.clone();
    tokio::spawn(async move {
        let outcome: Result<TxReceipt, String> = ledger
            .invoke(
                &request.headers.channel,
                &request.chaincode,
                &request.function,
                &request.args,
            )
            .await
            .map_err(|err| err.to_string());
        if let Err(err) = &outcome {
            tracing::error!(receipt = %receipt_id, error = %err, "async transaction failed");
        }
        receipts.complete(&receipt_id, outcome);
    });
    Ok((StatusCode::ACCEPTED, Json(AsyncSentReply { sent: true, id })).into_response())
}

#[utoipa::path(
    get,
    path = "/receipts",
    tag = "transactions",
    responses(
        (status = 200, description = "Most recent receipts", body = [ReceiptRecord])
    )
)]
pub(crate) async fn list_receipts(State(state): State<AppState>) -> Json<Vec<ReceiptRecord>> {
    Json(state.receipts.list(RECEIPT_LIST_LIMIT))
}

#[utoipa::path(
    get,
    path = "/receipts/{receiptId}",
    tag = "transactions",
    params(("receiptId" = String, Path, description = "Receipt identifier")),
    responses(
        (status = 200, description = "Fetch receipt", body = ReceiptRecord),
        (status = 404, description = "Receipt not found", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn get_receipt(
    Path(receipt_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ReceiptRecord>, ApiError> {
    state
        .receipts
        .get(&receipt_id)
        .map(Json)
        .ok_or_else(|| api_not_found(format!("receipt {receipt_id} not found")))
}
