use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::batch;
use crate::errors::ServiceError;
use crate::services::inventory::ReserveLine;
use crate::AppState;

/// Create the inventory router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/reserve", post(reserve_inventory))
        .route("/release", post(release_inventory))
        .route("/{sku}", get(get_inventory))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReserveLineRequest {
    pub batch_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub order_id: String,
    pub lines: Vec<ReserveLineRequest>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub order_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub status: String,
    pub order_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchAvailability {
    pub id: i64,
    pub external_batch_id: Option<String>,
    pub lot_number: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub total_quantity: i32,
    pub unallocatable_quantity: i32,
    pub available_quantity: i32,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

impl From<batch::Model> for BatchAvailability {
    fn from(model: batch::Model) -> Self {
        Self {
            id: model.id,
            external_batch_id: model.external_batch_id,
            lot_number: model.lot_number,
            expires_at: model.expires_at,
            total_quantity: model.total_quantity,
            unallocatable_quantity: model.unallocatable_quantity,
            available_quantity: model.available_quantity,
            version: model.version,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SkuInventoryResponse {
    pub sku_code: String,
    pub total_available: i64,
    pub batches: Vec<BatchAvailability>,
}

/// Reserve inventory for an order. Replaying the same request is a no-op
/// success; a different request under the same order id conflicts.
#[utoipa::path(
    post,
    path = "/inventory/reserve",
    request_body = ReserveRequest,
    responses(
        (status = 201, description = "Inventory reserved", body = OrderAck),
        (status = 400, description = "Invalid quantity", body = crate::errors::ErrorResponse),
        (status = 404, description = "Batch not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Insufficient inventory or conflicting reservation", body = crate::errors::ErrorResponse),
    ),
    tag = "inventory"
)]
pub async fn reserve_inventory(
    State(state): State<AppState>,
    Json(request): Json<ReserveRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let lines: Vec<ReserveLine> = request
        .lines
        .iter()
        .map(|l| ReserveLine {
            batch_id: l.batch_id,
            quantity: l.quantity,
        })
        .collect();

    state
        .inventory_service
        .reserve(&request.order_id, &lines)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(OrderAck {
            status: "ok".to_string(),
            order_id: request.order_id,
        }),
    ))
}

/// Release every reservation an order holds.
#[utoipa::path(
    post,
    path = "/inventory/release",
    request_body = ReleaseRequest,
    responses(
        (status = 200, description = "Inventory released", body = OrderAck),
        (status = 404, description = "Order has no reservations", body = crate::errors::ErrorResponse),
    ),
    tag = "inventory"
)]
pub async fn release_inventory(
    State(state): State<AppState>,
    Json(request): Json<ReleaseRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    state
        .inventory_service
        .release(&request.order_id, request.reason.as_deref())
        .await?;

    Ok(Json(OrderAck {
        status: "ok".to_string(),
        order_id: request.order_id,
    }))
}

/// Available inventory for a SKU, batches ordered by expiry then id.
#[utoipa::path(
    get,
    path = "/inventory/{sku}",
    params(("sku" = String, Path, description = "SKU code")),
    responses(
        (status = 200, description = "Availability by batch", body = SkuInventoryResponse),
    ),
    tag = "inventory"
)]
pub async fn get_inventory(
    State(state): State<AppState>,
    Path(sku): Path<String>,
) -> Result<Json<SkuInventoryResponse>, ServiceError> {
    let availability = state.inventory_service.get_available_inventory(&sku).await?;

    Ok(Json(SkuInventoryResponse {
        sku_code: availability.sku_code,
        total_available: availability.total_available,
        batches: availability
            .batches
            .into_iter()
            .map(BatchAvailability::from)
            .collect(),
    }))
}
