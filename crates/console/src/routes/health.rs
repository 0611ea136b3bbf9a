use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /health
///
/// Reports service uptime and whether the Bitcoin node answers RPC calls.
pub async fn health_check(State(state): State<SharedState>) -> Json<Value> {
    let btc = match state.rpc.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "bitcoin node health probe failed");
            "error"
        }
    };

    Json(json!({
        "status": "ok",
        "btc": btc,
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}
