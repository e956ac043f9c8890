use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn cache_stats(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({ "entries": state.cache.len() })))
}

/// Drop every cached transcript, in memory and on disk.
pub async fn clear_cache(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let removed = state.cache.len();
    state.cache.clear()?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "cleared",
        "removed": removed,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::backend::testing::ScriptedBackend;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_clear_empties_cache() {
        let state = AppState::for_tests(Arc::new(ScriptedBackend::default()));
        state.cache.put("https://x/a.mp3", "hello").unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/cache", web::get().to(cache_stats))
                .route("/cache", web::delete().to(clear_cache)),
        )
        .await;

        let req = test::TestRequest::get().uri("/cache").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["entries"], 1);

        let req = test::TestRequest::delete().uri("/cache").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["removed"], 1);
        assert_eq!(state.cache.get("https://x/a.mp3"), None);
    }
}
