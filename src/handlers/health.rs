use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// Liveness probe: reports whether the database answers a ping.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let db_ok = state.db.ping().await.is_ok();
    Json(json!({
        "status": if db_ok { "healthy" } else { "degraded" },
        "database": db_ok,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
