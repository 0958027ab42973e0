use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use super::AppState;

/// GET /health
/// Liveness plus how many registered devices have reported at least once.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let registered = state.devices.len().await;
    let online = state.devices.online().await;

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "devices": {
                "registered": registered,
                "online": online,
            }
        })),
    )
}
