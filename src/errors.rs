use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::DbErr;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

/// Error body shape shared by every endpoint, kept stable for clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Stable machine-readable code, e.g. `INSUFFICIENT_INVENTORY`.
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: String,
}

/// The service-wide error sum type. Business errors map 1:1 onto the HTTP
/// taxonomy; database and queue failures surface as `INTERNAL_ERROR`.
/// Invariant violations (a reservation pointing at a deleted batch, a check
/// constraint tripping on a path that pre-validated) are programmer errors
/// and are allowed to bubble as database errors rather than being retried.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidQuantity(String),

    #[error("batch {0} not found")]
    BatchNotFound(i64),

    #[error("no reservation exists for order {0}")]
    OrderNotFound(String),

    #[error("insufficient inventory on batch {batch_id}: requested {requested}, available {available}")]
    InsufficientInventory {
        batch_id: i64,
        requested: i32,
        available: i32,
    },

    #[error("order {0} already holds a conflicting reservation set")]
    OrderAlreadyReserved(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("WMS API error: {0}")]
    WmsApiError(String),

    #[error("queue error: {0}")]
    QueueError(String),

    #[error("database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl ServiceError {
    pub fn db_error(err: DbErr) -> Self {
        ServiceError::DatabaseError(err)
    }

    /// The stable error code surfaced in responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidQuantity(_) => "INVALID_QUANTITY",
            ServiceError::BatchNotFound(_) => "BATCH_NOT_FOUND",
            ServiceError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            ServiceError::InsufficientInventory { .. } => "INSUFFICIENT_INVENTORY",
            ServiceError::OrderAlreadyReserved(_) => "ORDER_ALREADY_RESERVED",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::WmsApiError(_) => "WMS_API_ERROR",
            ServiceError::QueueError(_)
            | ServiceError::DatabaseError(_)
            | ServiceError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidQuantity(_) => StatusCode::BAD_REQUEST,
            ServiceError::BatchNotFound(_)
            | ServiceError::OrderNotFound(_)
            | ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InsufficientInventory { .. }
            | ServiceError::OrderAlreadyReserved(_) => StatusCode::CONFLICT,
            ServiceError::WmsApiError(_)
            | ServiceError::QueueError(_)
            | ServiceError::DatabaseError(_)
            | ServiceError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured context attached to the error body, where there is any.
    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ServiceError::InsufficientInventory {
                batch_id,
                requested,
                available,
            } => Some(json!({
                "batchId": batch_id,
                "requested": requested,
                "available": available,
            })),
            ServiceError::BatchNotFound(batch_id) => Some(json!({ "batchId": batch_id })),
            ServiceError::OrderNotFound(order_id)
            | ServiceError::OrderAlreadyReserved(order_id) => {
                Some(json!({ "orderId": order_id }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal failure detail stays in the logs, not the response.
        let message = match &self {
            ServiceError::DatabaseError(e) => {
                tracing::error!(error = %e, "database error reached the HTTP boundary");
                "internal error".to_string()
            }
            ServiceError::QueueError(e) => {
                tracing::error!(error = %e, "queue error reached the HTTP boundary");
                "internal error".to_string()
            }
            ServiceError::InternalError(e) => {
                tracing::error!(error = %e, "unexpected error reached the HTTP boundary");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            code: self.code().to_string(),
            message,
            details: self.details(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(json!({ "error": body }))).into_response()
    }
}
