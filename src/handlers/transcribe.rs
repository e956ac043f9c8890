//! Single-shot transcription endpoint.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct TranscribeRequest {
    pub audio_url: String,
}

#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    pub text: String,
}

/// `POST /api/v1/transcribe`
///
/// Answers 409 while a single-request backend is still working on the
/// previous call and 504 once the configured deadline passes.
pub async fn transcribe(
    state: web::Data<AppState>,
    body: web::Json<TranscribeRequest>,
) -> Result<HttpResponse, AppError> {
    let audio_url = body.audio_url.trim();
    if audio_url.is_empty() {
        return Err(AppError::ValidationError("audio_url cannot be empty".to_string()));
    }

    let timeout = state.get_config().dispatch.request_timeout();
    let result = state.single.transcribe(audio_url, timeout).await;
    state.record_single(result.is_ok());

    let text = result.map_err(|e| {
        tracing::warn!(url = %audio_url, code = e.code(), error = %e, "Single-shot transcription failed");
        AppError::Dispatch(e)
    })?;

    Ok(HttpResponse::Ok().json(TranscribeResponse { text }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::transcription::backend::testing::ScriptedBackend;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::json;
    use std::sync::Arc;

    async fn call(state: AppState, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/transcribe", web::post().to(transcribe)),
        )
        .await;
        let req = test::TestRequest::post().uri("/transcribe").set_json(body).to_request();
        let resp = test::call_service(&app, req).await;
        let status = resp.status();
        (status, test::read_body_json(resp).await)
    }

    #[actix_web::test]
    async fn test_transcribe_returns_text() {
        let backend = Arc::new(ScriptedBackend::with(&[("https://x/a.mp3", Ok("hello"))]));
        let state = AppState::for_tests(backend);

        let (status, body) = call(state.clone(), json!({"audio_url": "https://x/a.mp3"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "hello");
        assert_eq!(state.get_metrics_snapshot().dispatch.single_requests, 1);
    }

    #[actix_web::test]
    async fn test_backend_failure_maps_to_status() {
        let backend = Arc::new(ScriptedBackend::with(&[(
            "https://x/a.mp3",
            Err(DispatchError::BackendUnavailable("no READY".into())),
        )]));

        let (status, body) = call(AppState::for_tests(backend), json!({"audio_url": "https://x/a.mp3"})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["type"], "backend_unavailable");
    }

    #[actix_web::test]
    async fn test_empty_url_is_rejected() {
        let backend = Arc::new(ScriptedBackend::default());
        let (status, _) = call(AppState::for_tests(backend.clone()), json!({"audio_url": "  "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(backend.calls(), 0);
    }
}
