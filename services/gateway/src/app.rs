//! Gateway HTTP application wiring.
//!
//! # Purpose
//! Builds the Axum router, configures middleware, and defines the shared
//! application state injected into handlers.
use crate::api;
use crate::api::openapi::ApiDoc;
use crate::receipts::ReceiptStore;
use crate::ws;
use axum::{Json, Router};
use fabgate_events::SubscriptionManager;
use fabgate_events::ledger::LedgerClient;
use fabgate_ws::WsChannels;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SubscriptionManager>,
    pub channels: Arc<WsChannels>,
    pub ledger: Arc<dyn LedgerClient>,
    pub receipts: Arc<ReceiptStore>,
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            )
        });

    Router::new()
        .route("/status", axum::routing::get(api::status))
        .route(
            "/eventstreams",
            axum::routing::get(api::streams::list_streams).post(api::streams::create_stream),
        )
        .route(
            "/eventstreams/:streamId",
            axum::routing::get(api::streams::get_stream)
                .patch(api::streams::update_stream)
                .delete(api::streams::delete_stream),
        )
        .route(
            "/eventstreams/:streamId/suspend",
            axum::routing::post(api::streams::suspend_stream),
        )
        .route(
            "/eventstreams/:streamId/resume",
            axum::routing::post(api::streams::resume_stream),
        )
        .route(
            "/eventstreams/:streamId/subscriptions",
            axum::routing::get(api::subscriptions::list_subscriptions)
                .post(api::subscriptions::create_subscription),
        )
        .route(
            "/eventstreams/:streamId/subscriptions/:subscriptionId",
            axum::routing::get(api::subscriptions::get_subscription)
                .delete(api::subscriptions::delete_subscription),
        )
        .route(
            "/eventstreams/:streamId/subscriptions/:subscriptionId/reset",
            axum::routing::post(api::subscriptions::reset_subscription),
        )
        .route(
            "/transactions",
            axum::routing::post(api::transactions::send_transaction),
        )
        .route(
            "/receipts",
            axum::routing::get(api::transactions::list_receipts),
        )
        .route(
            "/receipts/:receiptId",
            axum::routing::get(api::transactions::get_receipt),
        )
        .route("/ws", axum::routing::get(ws::ws_handler))
        .route(
            "/openapi.json",
            axum::routing::get(|| async { Json(ApiDoc::openapi()) }),
        )
        .layer(trace_layer)
        .with_state(state)
}
