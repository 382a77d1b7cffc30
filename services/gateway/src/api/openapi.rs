//! Generated OpenAPI document for the gateway API.
use crate::api;
use crate::api::types::{
    AsyncSentReply, DeletedResponse, ErrorBody, ResetRequest, ResetResponse, ResumedResponse,
    StatusResponse, SuspendedResponse, TransactionRequest, TxHeaders,
};
use crate::receipts::ReceiptRecord;
use fabgate_events::ledger::TxReceipt;
use fabgate_events::model::{
    BlockType, EventEntry, EventFilter, StreamInfo, SubscriptionInfo, WebSocketInfo, WebhookInfo,
};
use fabgate_ws::DistributionMode;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "fabgate",
        version = "v1",
        description = "REST/WebSocket gateway for a permissioned ledger"
    ),
    paths(
        api::status,
        api::streams::create_stream,
        api::streams::list_streams,
        api::streams::get_stream,
        api::streams::update_stream,
        api::streams::suspend_stream,
        api::streams::resume_stream,
        api::streams::delete_stream,
        api::subscriptions::create_subscription,
        api::subscriptions::list_subscriptions,
        api::subscriptions::get_subscription,
        api::subscriptions::delete_subscription,
        api::subscriptions::reset_subscription,
        api::transactions::send_transaction,
        api::transactions::list_receipts,
        api::transactions::get_receipt
    ),
    components(schemas(
        ErrorBody,
        StatusResponse,
        ResetRequest,
        SuspendedResponse,
        ResumedResponse,
        DeletedResponse,
        ResetResponse,
        TransactionRequest,
        TxHeaders,
        AsyncSentReply,
        TxReceipt,
        ReceiptRecord,
        StreamInfo,
        WebhookInfo,
        WebSocketInfo,
        DistributionMode,
        SubscriptionInfo,
        EventFilter,
        BlockType,
        EventEntry
    )),
    tags(
        (name = "system", description = "Liveness and discovery"),
        (name = "eventstreams", description = "Event stream management"),
        (name = "subscriptions", description = "Subscription management"),
        (name = "transactions", description = "Transaction submission and receipts")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_includes_core_paths() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.iter().any(|p| p.as_str() == "/eventstreams"));
        assert!(
            paths
                .iter()
                .any(|p| p.as_str() == "/eventstreams/{streamId}/subscriptions/{subscriptionId}/reset")
        );
        assert!(paths.iter().any(|p| p.as_str() == "/transactions"));
    }
}
