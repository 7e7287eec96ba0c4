use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and a config summary. Credentials are never echoed.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "status": "chat-relay is running",
        "config": {
            "upstream_chat_url": state.upstream_chat_url(),
            "backend_base_url": state.backend_base_url(),
            "base_path": config.server.base_path,
            "timeout_secs": config.server.timeout,
            "log_level": config.features.log_level,
        }
    }))
}
