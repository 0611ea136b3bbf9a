use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::error::ApiError;
use crate::state::SharedState;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// GET /api/metrics
pub async fn get_metrics(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let body = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, TEXT_FORMAT)], body))
}
