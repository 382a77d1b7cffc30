//! Event stream API handlers.
//!
//! # Purpose
//! Implements stream CRUD, suspend/resume and delete, delegating to the
//! subscription manager.
use crate::api::error::{ApiError, api_bad_request};
use crate::api::types::{DeletedResponse, ResumedResponse, SuspendedResponse};
use crate::app::AppState;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use fabgate_events::model::StreamInfo;

#[utoipa::path(
    post,
    path = "/eventstreams",
    tag = "eventstreams",
    request_body = StreamInfo,
    responses(
        (status = 200, description = "Stream created", body = StreamInfo),
        (status = 400, description = "Invalid stream spec", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn create_stream(
    State(state): State<AppState>,
    payload: Result<Json<StreamInfo>, JsonRejection>,
) -> Result<Json<StreamInfo>, ApiError> {
    let Json(spec) =
        payload.map_err(|err| api_bad_request(format!("invalid event stream body: {err}")))?;
    Ok(Json(state.manager.add_stream(spec).await?))
}

#[utoipa::path(
    get,
    path = "/eventstreams",
    tag = "eventstreams",
    responses(
        (status = 200, description = "List streams", body = [StreamInfo])
    )
)]
pub(crate) async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamInfo>> {
    Json(state.manager.streams().await)
}

#[utoipa::path(
    get,
    path = "/eventstreams/{streamId}",
    tag = "eventstreams",
    params(("streamId" = String, Path, description = "Stream identifier")),
    responses(
        (status = 200, description = "Fetch stream", body = StreamInfo),
        (status = 404, description = "Stream not found", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn get_stream(
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<StreamInfo>, ApiError> {
    Ok(Json(state.manager.stream_by_id(&stream_id).await?))
}

#[utoipa::path(
    patch,
    path = "/eventstreams/{streamId}",
    tag = "eventstreams",
    params(("streamId" = String, Path, description = "Stream identifier")),
    request_body = StreamInfo,
    responses(
        (status = 200, description = "Stream updated", body = StreamInfo),
        (status = 400, description = "Invalid update (e.g. type change)", body = crate::api::types::ErrorBody),
        (status = 404, description = "Stream not found", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn update_stream(
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
    payload: Result<Json<StreamInfo>, JsonRejection>,
) -> Result<Json<StreamInfo>, ApiError> {
    let Json(spec) =
        payload.map_err(|err| api_bad_request(format!("invalid event stream body: {err}")))?;
    Ok(Json(state.manager.update_stream(&stream_id, spec).await?))
}

#[utoipa::path(
    post,
    path = "/eventstreams/{streamId}/suspend",
    tag = "eventstreams",
    params(("streamId" = String, Path, description = "Stream identifier")),
    responses(
        (status = 200, description = "Stream suspended", body = SuspendedResponse),
        (status = 404, description = "Stream not found", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn suspend_stream(
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SuspendedResponse>, ApiError> {
    state.manager.suspend_stream(&stream_id).await?;
    Ok(Json(SuspendedResponse {
        id: stream_id,
        suspended: "true".to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/eventstreams/{streamId}/resume",
    tag = "eventstreams",
    params(("streamId" = String, Path, description = "Stream identifier")),
    responses(
        (status = 200, description = "Stream resumed", body = ResumedResponse),
        (status = 404, description = "Stream not found", body = crate::api::types::ErrorBody),
        (status = 500, description = "Stream has not drained yet", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn resume_stream(
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ResumedResponse>, ApiError> {
    state.manager.resume_stream(&stream_id).await?;
    Ok(Json(ResumedResponse {
        id: stream_id,
        resumed: "true".to_string(),
    }))
}

#[utoipa::path(
    delete,
    path = "/eventstreams/{streamId}",
    tag = "eventstreams",
    params(("streamId" = String, Path, description = "Stream identifier")),
    responses(
        (status = 200, description = "Stream and its subscriptions deleted", body = DeletedResponse),
        (status = 404, description = "Stream not found", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn delete_stream(
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<DeletedResponse>, ApiError> {
    state.manager.delete_stream(&stream_id).await?;
    Ok(Json(DeletedResponse {
        id: stream_id,
        deleted: "true".to_string(),
    }))
}
