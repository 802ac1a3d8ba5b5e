use axum::Json;
use utoipa::OpenApi;

use crate::errors::ErrorResponse;
use crate::handlers::{admin, inventory};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Inventory API",
        description = "Authoritative available-to-promise inventory with asynchronous WMS integration",
    ),
    paths(
        inventory::reserve_inventory,
        inventory::release_inventory,
        inventory::get_inventory,
        admin::adjust_inventory,
        admin::request_wms_sync,
        admin::get_wms_sync,
        admin::list_outbox,
        admin::retry_outbox,
    ),
    components(schemas(
        inventory::ReserveRequest,
        inventory::ReserveLineRequest,
        inventory::ReleaseRequest,
        inventory::OrderAck,
        inventory::BatchAvailability,
        inventory::SkuInventoryResponse,
        admin::AdjustRequest,
        admin::AdjustResponse,
        admin::WmsSyncRequestBody,
        admin::WmsSyncQueued,
        admin::WmsSyncStatus,
        admin::OutboxItem,
        ErrorResponse,
    )),
    tags(
        (name = "inventory", description = "Hot-path reservation and availability"),
        (name = "admin", description = "Operator surface: adjustments, WMS sync, outbox"),
    )
)]
pub struct ApiDoc;

/// Serves the generated OpenAPI document.
pub async fn serve_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
