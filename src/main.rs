//! # Clip Transcriber - Main Application Entry Point
//!
//! An HTTP service that turns links to short audio clips into text, one at a
//! time or in batches embedded in free text.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **audio**: fetch, decode, down-mix, resample, WAV encoding
//! - **transcription**: backend trait, the isolated model host with its
//!   request correlator, and the remote inference client
//! - **dispatch**: single-shot and batch front doors, the bounded queue
//! - **cache**: durable URL to transcript mapping
//! - **state / health / middleware / handlers**: the HTTP surface
//! - **error**: dispatch failures and their HTTP mapping

mod audio;
mod cache;
mod config;
mod device;
mod dispatch;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod transcription;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use cache::ResultCache;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::BackendFactory;

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting clip-transcriber v{}", env!("CARGO_PKG_VERSION"));
    info!(
        backend = %config.backend.kind,
        default_concurrency = config.dispatch.default_concurrency,
        max_concurrency = config.dispatch.max_concurrency,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let cache = Arc::new(ResultCache::from_config(&config.cache));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let shared = config.into_shared();
    let backend = BackendFactory::create(&shared).await?;
    info!(backend = backend.name(), cached = cache.len(), "Transcription services ready");

    let app_state = AppState::new(shared, backend, cache);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/transcribe", web::post().to(handlers::transcribe))
                    .route("/batch", web::post().to(handlers::run_batch))
                    .route("/batch/cancel", web::post().to(handlers::cancel_batches))
                    .route("/cache", web::get().to(handlers::cache_stats))
                    .route("/cache", web::delete().to(handlers::clear_cache)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            let running = app_state.cancel_batches();
            if running > 0 {
                info!(running, "Cancelled running batches");
            }
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise `clip_transcriber=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clip_transcriber=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers, falling back to Ctrl+C: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
