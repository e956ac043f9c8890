//! Batch endpoints: run a batch over free text, cancel running batches.

use crate::dispatch::process_batch;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub text: String,
    /// Worker count; clamped to `[1, dispatch.max_concurrency]`
    pub concurrency: Option<usize>,
}

/// `POST /api/v1/batch`
///
/// Always answers 200 with the substituted text; per-link failures only show
/// up as untouched links and in `stats`.
pub async fn run_batch(
    state: web::Data<AppState>,
    body: web::Json<BatchRequest>,
) -> Result<HttpResponse, AppError> {
    let BatchRequest { text, concurrency } = body.into_inner();
    let concurrency = state.get_config().dispatch.clamp_concurrency(concurrency);

    let batch = state.begin_batch();
    let report = process_batch(&state.queue, &text, concurrency, batch.token()).await;
    state.finish_batch(&report.stats);
    drop(batch);

    Ok(HttpResponse::Ok().json(report))
}

/// `POST /api/v1/batch/cancel`
pub async fn cancel_batches(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let active = state.cancel_batches();
    tracing::info!(active_batches = active, "Batch cancellation requested");

    Ok(HttpResponse::Ok().json(json!({
        "status": "cancelled",
        "active_batches": active,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::backend::testing::ScriptedBackend;
    use actix_web::{test, App};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    #[actix_web::test]
    async fn test_batch_substitutes_links() {
        let backend = Arc::new(ScriptedBackend::with(&[
            ("https://x/a.mp3", Ok("hello")),
            ("x/b.WAV", Ok("world")),
        ]));
        let state = AppState::for_tests(backend.clone());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/batch", web::post().to(run_batch)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/batch")
            .set_json(json!({"text": "https://x/a.mp3, x/b.WAV and https://x/a.mp3", "concurrency": 50}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["substituted"], "hello, world and hello");
        assert_eq!(body["results"]["x/b.WAV"], "world");
        assert_eq!(body["stats"]["concurrency"], 2);
        assert_eq!(backend.calls(), 2);
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);

        let dispatch = state.get_metrics_snapshot().dispatch;
        assert_eq!(dispatch.batches, 1);
        assert_eq!(dispatch.active_batches, 0);
        assert_eq!(dispatch.jobs_completed, 2);
    }

    #[actix_web::test]
    async fn test_cancel_reports_active_batches() {
        let state = AppState::for_tests(Arc::new(ScriptedBackend::default()));
        let running = state.begin_batch();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/batch/cancel", web::post().to(cancel_batches)),
        )
        .await;

        let req = test::TestRequest::post().uri("/batch/cancel").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["active_batches"], 1);
        assert!(running.token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_releases_batch() {
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_secs(60)),
            ..ScriptedBackend::with(&[("https://x/a.mp3", Ok("slow"))])
        });
        let state = AppState::for_tests(backend);

        // The client goes away after a second; the handler future is dropped
        let request = run_batch(
            web::Data::new(state.clone()),
            web::Json(BatchRequest {
                text: "https://x/a.mp3".to_string(),
                concurrency: None,
            }),
        );
        assert!(tokio::time::timeout(Duration::from_secs(1), request).await.is_err());

        let dispatch = state.get_metrics_snapshot().dispatch;
        assert_eq!(dispatch.batches, 1);
        assert_eq!(dispatch.active_batches, 0);
    }
}
