use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use crate::entities::outbox_event::{self, Entity as OutboxEventEntity, OutboxStatus};
use crate::entities::sync_request::{self, Entity as SyncRequestEntity, SyncRequestStatus};
use crate::errors::ServiceError;
use crate::events::{ForceWmsSync, FORCE_SYNC_TOPIC};
use crate::message_queue::Message;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/inventory/adjust", post(adjust_inventory))
        .route("/wms/sync", post(request_wms_sync))
        .route("/wms/sync/{id}", get(get_wms_sync))
        .route("/outbox", get(list_outbox))
        .route("/outbox/{id}/retry", post(retry_outbox))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdjustRequest {
    pub batch_id: i64,
    pub quantity_delta: i32,
    pub reason: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdjustResponse {
    pub status: String,
    pub new_available_quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WmsSyncRequestBody {
    pub batch_id: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WmsSyncQueued {
    pub request_id: i64,
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WmsSyncStatus {
    pub id: i64,
    pub requested_by: String,
    pub reason: String,
    pub batch_id: Option<i64>,
    pub priority: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<sync_request::Model> for WmsSyncStatus {
    fn from(model: sync_request::Model) -> Self {
        let status = match model.status {
            SyncRequestStatus::Pending => "PENDING",
            SyncRequestStatus::InProgress => "IN_PROGRESS",
            SyncRequestStatus::Done => "DONE",
            SyncRequestStatus::Failed => "FAILED",
        };
        Self {
            id: model.id,
            requested_by: model.requested_by,
            reason: model.reason,
            batch_id: model.batch_id,
            priority: model.priority,
            status: status.to_string(),
            created_at: model.created_at,
            updated_at: model.updated_at,
            completed_at: model.completed_at,
            error: model.error,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
    pub id: i64,
    pub event_type: String,
    pub status: String,
    pub retry_count: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Apply a signed manual adjustment to one batch.
#[utoipa::path(
    post,
    path = "/admin/inventory/adjust",
    request_body = AdjustRequest,
    responses(
        (status = 200, description = "Adjustment applied", body = AdjustResponse),
        (status = 400, description = "Adjustment would violate quantity bounds", body = crate::errors::ErrorResponse),
        (status = 404, description = "Batch not found", body = crate::errors::ErrorResponse),
    ),
    tag = "admin"
)]
pub async fn adjust_inventory(
    State(state): State<AppState>,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<AdjustResponse>, ServiceError> {
    let new_available = state
        .inventory_service
        .adjust(request.batch_id, request.quantity_delta, &request.reason)
        .await?;

    Ok(Json(AdjustResponse {
        status: "ok".to_string(),
        new_available_quantity: new_available,
    }))
}

/// Queue a WMS reconciliation, optionally scoped to one batch.
#[utoipa::path(
    post,
    path = "/admin/wms/sync",
    request_body = WmsSyncRequestBody,
    responses(
        (status = 202, description = "Sync queued", body = WmsSyncQueued),
        (status = 500, description = "Internal error", body = crate::errors::ErrorResponse),
    ),
    tag = "admin"
)]
pub async fn request_wms_sync(
    State(state): State<AppState>,
    Json(body): Json<WmsSyncRequestBody>,
) -> Result<impl IntoResponse, ServiceError> {
    let request = sync_request::ActiveModel {
        requested_by: Set("admin-api".to_string()),
        reason: Set(body.reason.unwrap_or_else(|| "manual sync".to_string())),
        batch_id: Set(body.batch_id),
        priority: Set(0),
        status: Set(SyncRequestStatus::Pending),
        completed_at: Set(None),
        error: Set(None),
        ..Default::default()
    }
    .insert(&*state.db)
    .await
    .map_err(ServiceError::db_error)?;

    let command = ForceWmsSync {
        sync_request_id: request.id,
        batch_id: request.batch_id,
    };
    let payload = serde_json::to_value(&command)
        .map_err(|e| ServiceError::InternalError(e.to_string()))?;

    state
        .queue
        .publish(Message::new(request.id, FORCE_SYNC_TOPIC, payload))
        .await
        .map_err(|e| ServiceError::QueueError(e.to_string()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WmsSyncQueued {
            request_id: request.id,
            status: "queued".to_string(),
        }),
    ))
}

/// Inspect one sync request.
#[utoipa::path(
    get,
    path = "/admin/wms/sync/{id}",
    params(("id" = i64, Path, description = "Sync request id")),
    responses(
        (status = 200, description = "Sync request", body = WmsSyncStatus),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse),
    ),
    tag = "admin"
)]
pub async fn get_wms_sync(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<WmsSyncStatus>, ServiceError> {
    let request = SyncRequestEntity::find_by_id(id)
        .one(&*state.db)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("sync request {id} not found")))?;

    Ok(Json(WmsSyncStatus::from(request)))
}

/// Recent outbox rows still awaiting delivery or parked as FAILED.
#[utoipa::path(
    get,
    path = "/admin/outbox",
    responses(
        (status = 200, description = "Undelivered outbox rows", body = [OutboxItem]),
    ),
    tag = "admin"
)]
pub async fn list_outbox(
    State(state): State<AppState>,
) -> Result<Json<Vec<OutboxItem>>, ServiceError> {
    let rows = OutboxEventEntity::find()
        .filter(outbox_event::Column::Status.ne(OutboxStatus::Sent))
        .order_by_desc(outbox_event::Column::CreatedAt)
        .limit(100)
        .all(&*state.db)
        .await
        .map_err(ServiceError::db_error)?;

    let items = rows
        .into_iter()
        .map(|row| OutboxItem {
            id: row.id,
            event_type: row.event_type,
            status: match row.status {
                OutboxStatus::Pending => "PENDING".to_string(),
                OutboxStatus::Sent => "SENT".to_string(),
                OutboxStatus::Failed => "FAILED".to_string(),
            },
            retry_count: row.retry_count,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
        .collect();

    Ok(Json(items))
}

/// Re-queue a FAILED outbox row for the dispatcher. This is the operator
/// action the dispatcher deliberately leaves to humans.
#[utoipa::path(
    post,
    path = "/admin/outbox/{id}/retry",
    params(("id" = i64, Path, description = "Outbox event id")),
    responses(
        (status = 200, description = "Event re-queued"),
        (status = 404, description = "No FAILED event with this id", body = crate::errors::ErrorResponse),
    ),
    tag = "admin"
)]
pub async fn retry_outbox(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let row = OutboxEventEntity::find_by_id(id)
        .one(&*state.db)
        .await
        .map_err(ServiceError::db_error)?
        .filter(|row| row.status == OutboxStatus::Failed)
        .ok_or_else(|| ServiceError::NotFound(format!("no FAILED outbox event {id}")))?;

    let mut active: outbox_event::ActiveModel = row.into();
    active.status = Set(OutboxStatus::Pending);
    active.error = Set(None);
    active
        .update(&*state.db)
        .await
        .map_err(ServiceError::db_error)?;

    Ok(Json(json!({ "ok": true, "id": id })))
}
