//! API error type and helpers.
//!
//! # Purpose
//! Centralizes the HTTP error shape: a JSON `{"error": "..."}` body with
//! 400 for validation, 404 for missing resources and 500 for everything
//! internal.
use crate::api::types::ErrorBody;
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use fabgate_events::EventsError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<EventsError> for ApiError {
    fn from(err: EventsError) -> Self {
        let status = match &err {
            EventsError::Validation(_) => StatusCode::BAD_REQUEST,
            EventsError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => {
                tracing::error!(error = %err, "event stream operation failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError {
            status,
            body: ErrorBody {
                error: err.to_string(),
            },
        }
    }
}

pub fn api_bad_request(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        body: ErrorBody {
            error: message.into(),
        },
    }
}

pub fn api_not_found(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        body: ErrorBody {
            error: message.into(),
        },
    }
}

pub fn api_internal(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorBody {
            error: message.into(),
        },
    }
}
