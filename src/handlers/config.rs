use crate::{
    config::AppConfig,
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};

/// Public view of the configuration. The API key is reduced to a flag.
fn config_view(config: &AppConfig) -> Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "gemini": {
            "api_key_configured": config.gemini.api_key.is_some(),
            "chat_model": config.gemini.chat_model,
            "live_model": config.gemini.live_model,
            "rest_base_url": config.gemini.rest_base_url,
            "live_url": config.gemini.live_url,
            "input_sample_rate": config.gemini.input_sample_rate,
            "request_timeout_secs": config.gemini.request_timeout_secs
        },
        "tutor": {
            "native_lang": config.tutor.native_lang,
            "target_lang": config.tutor.target_lang,
            "difficulty": config.tutor.difficulty,
            "tone": config.tutor.tone
        },
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "heartbeat_interval_secs": config.performance.heartbeat_interval_secs,
            "client_timeout_secs": config.performance.client_timeout_secs
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(updated.clone())
        .map_err(AppError::ValidationError)?;

    tracing::info!("Configuration updated at runtime");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&updated)
    })))
}
