//! Inventory API Library
//!
//! Authoritative available-to-promise inventory with a transactional outbox
//! and asynchronous WMS integration. The relational store is the single
//! source of truth; the broker carries only derived notifications.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod message_queue;
pub mod migrator;
pub mod openapi;
pub mod services;
pub mod wms;

use std::sync::Arc;

use axum::{routing::get, Router};
use sea_orm::DatabaseConnection;

use crate::message_queue::MessageQueue;
use crate::services::inventory::InventoryService;

/// Everything a request handler needs, owned in one place and constructed at
/// startup. There is no global state: the pool and the broker handle live
/// here and are shut down by `main` in reverse construction order.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub queue: Arc<dyn MessageQueue>,
    pub inventory_service: InventoryService,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        let inventory_service = InventoryService::new(db.clone());
        Self {
            db,
            config,
            queue,
            inventory_service,
        }
    }
}

/// Builds the HTTP API router.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .nest("/inventory", handlers::inventory::router())
        .nest("/admin", handlers::admin::router())
        .route("/health", get(handlers::health::health_check))
        .route("/api-docs/openapi.json", get(openapi::serve_openapi))
        .with_state(state)
}
