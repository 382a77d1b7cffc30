//! REST API surface of the gateway.
use crate::api::types::StatusResponse;
use axum::Json;

pub mod error;
pub mod openapi;
pub mod streams;
pub mod subscriptions;
pub mod transactions;
pub mod types;

#[utoipa::path(
    get,
    path = "/status",
    tag = "system",
    responses(
        (status = 200, description = "Gateway liveness", body = StatusResponse)
    )
)]
pub(crate) async fn status() -> Json<StatusResponse> {
    Json(StatusResponse { ok: true })
}
