//! HTTP surface: routes, status codes, and the stable error body shape.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use inventory_api::{api_router, config::AppConfig, message_queue, AppState};

use common::*;

async fn test_app() -> (axum::Router, std::sync::Arc<sea_orm::DatabaseConnection>) {
    let db = setup_db().await;
    let config = AppConfig::new("sqlite::memory:".into(), "memory://".into());
    let queue = message_queue::connect(&config.broker_url).await.unwrap();
    let state = AppState::new(db.clone(), config, queue);
    (api_router(state), db)
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn reserve_endpoint_returns_201_then_conflicts() {
    let (app, db) = test_app().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 100, None, None).await;

    let body = json!({
        "orderId": "ord-1",
        "lines": [{"batchId": batch.id, "quantity": 10}],
    });

    let (status, response) = send(&app, "POST", "/inventory/reserve", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(response["status"], "ok");
    assert_eq!(response["orderId"], "ord-1");

    // Identical replay: still success.
    let (status, _) = send(&app, "POST", "/inventory/reserve", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);

    // Different lines: conflict with the stable error code.
    let conflicting = json!({
        "orderId": "ord-1",
        "lines": [{"batchId": batch.id, "quantity": 20}],
    });
    let (status, response) = send(&app, "POST", "/inventory/reserve", Some(conflicting)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(response["error"]["code"], "ORDER_ALREADY_RESERVED");
}

#[tokio::test]
async fn insufficient_inventory_carries_context_fields() {
    let (app, db) = test_app().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 5, None, None).await;

    let body = json!({
        "orderId": "ord-1",
        "lines": [{"batchId": batch.id, "quantity": 6}],
    });
    let (status, response) = send(&app, "POST", "/inventory/reserve", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(response["error"]["code"], "INSUFFICIENT_INVENTORY");
    assert_eq!(response["error"]["details"]["batchId"], batch.id);
    assert_eq!(response["error"]["details"]["requested"], 6);
    assert_eq!(response["error"]["details"]["available"], 5);
}

#[tokio::test]
async fn release_endpoint_maps_missing_orders_to_404() {
    let (app, _db) = test_app().await;

    let body = json!({"orderId": "ghost"});
    let (status, response) = send(&app, "POST", "/inventory/release", Some(body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(response["error"]["code"], "ORDER_NOT_FOUND");
}

#[tokio::test]
async fn sku_inventory_projection_is_sorted_and_summed() {
    let (app, db) = test_app().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let soon = chrono::Utc::now() + chrono::Duration::days(5);
    let b_open = seed_batch(&db, sku.id, 4, None, None).await;
    let b_soon = seed_batch(&db, sku.id, 6, None, Some(soon)).await;

    let (status, response) = send(&app, "GET", "/inventory/SKU-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["skuCode"], "SKU-1");
    assert_eq!(response["totalAvailable"], 10);

    let batches = response["batches"].as_array().unwrap();
    assert_eq!(batches[0]["id"], b_soon.id);
    assert_eq!(batches[1]["id"], b_open.id);
}

#[tokio::test]
async fn admin_adjust_returns_new_quantity() {
    let (app, db) = test_app().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 50, None, None).await;

    let body = json!({
        "batchId": batch.id,
        "quantityDelta": -7,
        "reason": "cycle count",
    });
    let (status, response) = send(&app, "POST", "/admin/inventory/adjust", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["newAvailableQuantity"], 43);

    let missing = json!({
        "batchId": 999,
        "quantityDelta": 1,
        "reason": "x",
    });
    let (status, response) = send(&app, "POST", "/admin/inventory/adjust", Some(missing)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(response["error"]["code"], "BATCH_NOT_FOUND");
}

#[tokio::test]
async fn wms_sync_round_trip_through_admin_api() {
    let (app, _db) = test_app().await;

    let (status, response) = send(
        &app,
        "POST",
        "/admin/wms/sync",
        Some(json!({"reason": "nightly drift check"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(response["status"], "queued");
    let request_id = response["requestId"].as_i64().unwrap();

    let (status, response) =
        send(&app, "GET", &format!("/admin/wms/sync/{request_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "PENDING");
    assert_eq!(response["reason"], "nightly drift check");

    let (status, response) = send(&app, "GET", "/admin/wms/sync/99999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(response["error"]["code"], "NOT_FOUND");
}
