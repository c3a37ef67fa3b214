mod api;
mod archive;
mod cache;
mod config;
mod error;
mod models;
mod overlap;
mod streaming;
mod svdrp;
mod vdr;

use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Json},
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::archive::ArchiveManager;
use crate::streaming::StreamManager;
use crate::svdrp::{SvdrpClient, VdrBackend};
use crate::vdr::VdrService;

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: config::Config,
    pub vdr: Arc<VdrService>,
    pub streams: Arc<StreamManager>,
    pub archive: Arc<ArchiveManager>,
}

// ─── Health endpoint ────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let svdrp_connected = state.vdr.backend_alive().await;

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "svdrp_connected": svdrp_connected,
        "streams_active": state.streams.active_streams(),
        "archive_jobs_active": state.archive.active_count(),
        "archive_jobs_total": state.archive.job_count(),
    }))
}

// ─── Version header middleware ──────────────────────────────────────────────

async fn version_header_middleware(request: Request, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        HeaderName::from_static("x-vdrweb-version"),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let log_level = std::env::var("VDRWEB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let cfg = config::Config::from_env();

    // ── Core subsystems ─────────────────────────────────────────────────
    let backend: Arc<dyn VdrBackend> = Arc::new(SvdrpClient::new(
        cfg.svdrp_host.clone(),
        cfg.svdrp_port,
        cfg.svdrp_timeout,
    ));
    let vdr = Arc::new(VdrService::new(backend, &cfg));
    let streams = Arc::new(StreamManager::new(&cfg));
    let archive = Arc::new(ArchiveManager::new(&cfg));

    // Background sweeper: reaps streams nobody has watched for a while.
    let shutdown = CancellationToken::new();
    streams.spawn_sweeper(shutdown.clone());

    let bind_addr = cfg.bind_addr.clone();
    let state = Arc::new(AppState {
        config: cfg,
        vdr,
        streams,
        archive,
    });

    // A dead backend is worth knowing about at startup, but the service
    // still comes up — pages degrade until VDR is reachable again.
    if !state.vdr.backend_alive().await {
        warn!(
            "SVDRP backend at {}:{} is not reachable yet",
            state.config.svdrp_host, state.config.svdrp_port
        );
    }

    // ── Build router ────────────────────────────────────────────────────

    let app = Router::new()
        // Health (no auth required)
        .route("/health", get(health_handler))
        // Channels
        .route("/api/channels", get(api::channels))
        .route(
            "/api/channels/current",
            get(api::current_channel).post(api::set_channel),
        )
        // EPG
        .route("/api/epg", get(api::epg))
        .route("/api/epg/now", get(api::epg_now))
        .route("/api/epg/search", post(api::epg_search))
        // Timers
        .route("/api/timers", get(api::timers).post(api::create_timer))
        .route(
            "/api/timers/:id",
            put(api::update_timer).delete(api::delete_timer),
        )
        .route("/api/timers/:id/toggle", post(api::toggle_timer))
        .route("/api/timers/from-event", post(api::timer_from_event))
        // Recordings
        .route("/api/recordings", get(api::recordings))
        .route("/api/recordings/:id", delete(api::delete_recording))
        // Remote control & cache
        .route("/api/remote/:key", post(api::remote_key))
        .route("/api/cache/invalidate", post(api::invalidate_cache))
        // Live streaming
        .route(
            "/watch/stream/:channel/index.m3u8",
            get(streaming::playlist_handler),
        )
        .route(
            "/watch/stream/:channel/:segment",
            get(streaming::segment_handler),
        )
        // Archive jobs
        .route("/recordings/archive/start", post(archive::start_handler))
        .route("/recordings/archive/job/poll", get(archive::poll_handler))
        .route(
            "/recordings/archive/job/cancel",
            post(archive::cancel_handler),
        )
        .route("/recordings/archive/jobs", get(archive::jobs_handler))
        // Middleware
        .layer(middleware::from_fn(version_header_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    // ── Serve ───────────────────────────────────────────────────────────

    info!("vdrweb listening on http://{bind_addr}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("invalid bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    // ── Teardown ────────────────────────────────────────────────────────
    info!("shutting down");
    shutdown.cancel();
    state.streams.stop_all();
    state.vdr.shutdown().await;
    // Give the stream waiters a moment to collect their children.
    tokio::time::sleep(Duration::from_millis(200)).await;
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
