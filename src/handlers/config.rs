use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.get_config()
    })))
}

/// Partial runtime update, e.g. `{"dispatch": {"default_concurrency": 4}}`.
///
/// `server`, `backend` and `cache` are fixed at startup; a body naming any of
/// them is a 400 and changes nothing.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    tracing::info!(
        default_concurrency = current_config.dispatch.default_concurrency,
        max_concurrency = current_config.dispatch.max_concurrency,
        downmix = %current_config.audio.downmix,
        "Runtime configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::backend::testing::ScriptedBackend;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_update_then_read_back() {
        let state = AppState::for_tests(Arc::new(ScriptedBackend::default()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"dispatch": {"max_concurrency": 8}}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        assert_eq!(state.get_config().dispatch.max_concurrency, 8);

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["dispatch"]["max_concurrency"], 8);
        assert_eq!(body["config"]["backend"]["kind"], "isolated");
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let state = AppState::for_tests(Arc::new(ScriptedBackend::default()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"dispatch": {"default_concurrency": 0}}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().dispatch.default_concurrency, 3);
    }

    #[actix_web::test]
    async fn test_startup_section_update_is_rejected() {
        let state = AppState::for_tests(Arc::new(ScriptedBackend::default()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"backend": {"kind": "remote"}, "dispatch": {"max_concurrency": 8}}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let config = state.get_config();
        assert_eq!(config.dispatch.max_concurrency, 5);
        assert_eq!(config.backend.kind.to_string(), "isolated");
    }
}
