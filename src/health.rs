use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let backend_ready = state.backend.is_ready();

    HttpResponse::Ok().json(json!({
        "status": if backend_ready { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "clip-transcriber",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "backend": {
            "name": state.backend.name(),
            "kind": config.backend.kind,
            "ready": backend_ready,
            "single_request": state.backend.single_request(),
            "single_shot_busy": state.single.is_busy()
        },
        "cache": {
            "entries": state.cache.len(),
            "persistent": config.cache.enabled
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "active_batches": metrics.dispatch.active_batches
        },
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    let dispatch = &metrics.dispatch;
    let jobs_finished = dispatch.jobs_completed + dispatch.jobs_failed;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "requests_per_second": ratio(metrics.request_count, uptime_seconds)
        },
        "endpoints": endpoint_stats,
        "dispatch": {
            "single_requests": dispatch.single_requests,
            "single_failures": dispatch.single_failures,
            "batches": dispatch.batches,
            "active_batches": dispatch.active_batches,
            "jobs_completed": dispatch.jobs_completed,
            "jobs_failed": dispatch.jobs_failed,
            "jobs_cancelled": dispatch.jobs_cancelled,
            "cache_hits": dispatch.cache_hits,
            "cache_hit_rate": ratio(dispatch.cache_hits, jobs_finished)
        },
        "memory": get_memory_info()
    }))
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        0.0
    }
}

/// Resident and virtual size from `/proc`. Linux only.
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::backend::testing::ScriptedBackend;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_health_reports_backend_and_cache() {
        let state = AppState::for_tests(Arc::new(ScriptedBackend::default()));
        state.cache.put("https://x/a.mp3", "hello").unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"]["name"], "clip-transcriber");
        assert_eq!(body["backend"]["name"], "scripted");
        assert_eq!(body["backend"]["kind"], "isolated");
        assert_eq!(body["cache"]["entries"], 1);
    }

    #[actix_web::test]
    async fn test_metrics_include_dispatch_counters() {
        let state = AppState::for_tests(Arc::new(ScriptedBackend::default()));
        state.record_single(false);
        state.record_endpoint_request("POST /api/v1/transcribe", 12, true);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["dispatch"]["single_requests"], 1);
        assert_eq!(body["dispatch"]["single_failures"], 1);
        assert_eq!(body["endpoints"][0]["endpoint"], "POST /api/v1/transcribe");
        assert_eq!(body["endpoints"][0]["error_rate"], 1.0);
    }
}
