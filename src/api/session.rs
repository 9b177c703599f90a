use axum::{extract::State, Json};
use serde_json::json;

use crate::{
    app::AppState,
    error::{AppError, AppResult},
    wechat::session::SessionUpdate,
};

/// Merge the posted fields into the stored WeChat session and persist it.
/// A payload with no recognized fields is a client error.
pub async fn update_session(
    State(state): State<AppState>,
    Json(payload): Json<SessionUpdate>,
) -> AppResult<Json<serde_json::Value>> {
    if payload.is_empty() {
        return Err(AppError::BadRequest(
            "session payload has no usable fields".to_string(),
        ));
    }
    let merged = state.session.apply(payload)?;
    Ok(Json(json!({ "message": "session saved", "session": merged })))
}
