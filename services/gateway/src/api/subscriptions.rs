//! Subscription API handlers, nested under their owning stream.
use crate::api::error::{ApiError, api_bad_request, api_not_found};
use crate::api::types::{DeletedResponse, ResetRequest, ResetResponse};
use crate::app::AppState;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use fabgate_events::model::SubscriptionInfo;

#[utoipa::path(
    post,
    path = "/eventstreams/{streamId}/subscriptions",
    tag = "subscriptions",
    params(("streamId" = String, Path, description = "Stream identifier")),
    request_body = SubscriptionInfo,
    responses(
        (status = 200, description = "Subscription created", body = SubscriptionInfo),
        (status = 400, description = "Invalid subscription spec", body = crate::api::types::ErrorBody),
        (status = 404, description = "Stream not found", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn create_subscription(
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
    payload: Result<Json<SubscriptionInfo>, JsonRejection>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let Json(mut spec) =
        payload.map_err(|err| api_bad_request(format!("invalid subscription body: {err}")))?;
    // The path owns the binding; any stream id in the body is ignored.
    spec.stream = stream_id;
    Ok(Json(state.manager.add_subscription(spec).await?))
}

#[utoipa::path(
    get,
    path = "/eventstreams/{streamId}/subscriptions",
    tag = "subscriptions",
    params(("streamId" = String, Path, description = "Stream identifier")),
    responses(
        (status = 200, description = "List the stream's subscriptions", body = [SubscriptionInfo]),
        (status = 404, description = "Stream not found", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn list_subscriptions(
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<SubscriptionInfo>>, ApiError> {
    state.manager.stream_by_id(&stream_id).await?;
    Ok(Json(state.manager.subscriptions_for_stream(&stream_id).await))
}

#[utoipa::path(
    get,
    path = "/eventstreams/{streamId}/subscriptions/{subscriptionId}",
    tag = "subscriptions",
    params(
        ("streamId" = String, Path, description = "Stream identifier"),
        ("subscriptionId" = String, Path, description = "Subscription identifier")
    ),
    responses(
        (status = 200, description = "Fetch subscription", body = SubscriptionInfo),
        (status = 404, description = "Subscription not found", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn get_subscription(
    Path((stream_id, subscription_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let info = state.manager.subscription_by_id(&subscription_id).await?;
    if info.stream != stream_id {
        return Err(api_not_found(format!(
            "subscription {subscription_id} not found"
        )));
    }
    Ok(Json(info))
}

#[utoipa::path(
    delete,
    path = "/eventstreams/{streamId}/subscriptions/{subscriptionId}",
    tag = "subscriptions",
    params(
        ("streamId" = String, Path, description = "Stream identifier"),
        ("subscriptionId" = String, Path, description = "Subscription identifier")
    ),
    responses(
        (status = 200, description = "Subscription deleted", body = DeletedResponse),
        (status = 404, description = "Subscription not found", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn delete_subscription(
    Path((stream_id, subscription_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let info = state.manager.subscription_by_id(&subscription_id).await?;
    if info.stream != stream_id {
        return Err(api_not_found(format!(
            "subscription {subscription_id} not found"
        )));
    }
    state.manager.delete_subscription(&subscription_id).await?;
    Ok(Json(DeletedResponse {
        id: subscription_id,
        deleted: "true".to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/eventstreams/{streamId}/subscriptions/{subscriptionId}/reset",
    tag = "subscriptions",
    params(
        ("streamId" = String, Path, description = "Stream identifier"),
        ("subscriptionId" = String, Path, description = "Subscription identifier")
    ),
    request_body = ResetRequest,
    responses(
        (status = 200, description = "Subscription reset requested", body = ResetResponse),
        (status = 400, description = "Invalid initial block", body = crate::api::types::ErrorBody),
        (status = 404, description = "Subscription not found", body = crate::api::types::ErrorBody)
    )
)]
pub(crate) async fn reset_subscription(
    Path((stream_id, subscription_id)): Path<(String, String)>,
    State(state): State<AppState>,
    payload: Result<Json<ResetRequest>, JsonRejection>,
) -> Result<Json<ResetResponse>, ApiError> {
    let Json(request) =
        payload.map_err(|err| api_bad_request(format!("invalid reset body: {err}")))?;
    let info = state.manager.subscription_by_id(&subscription_id).await?;
    if info.stream != stream_id {
        return Err(api_not_found(format!(
            "subscription {subscription_id} not found"
        )));
    }
    state
        .manager
        .reset_subscription(&subscription_id, &request.initial_block)
        .await?;
    Ok(Json(ResetResponse {
        id: subscription_id,
        reset: "true".to_string(),
    }))
}
