mod auth;
mod config;
mod dispatch;
mod history;
mod ingest;
mod predict;
mod sessions;
mod stores;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use auth::AuthVerifier;
use config::{DeploymentConfig, EngineConfig};
use history::SpeedHistory;
use ingest::AppState;
use sessions::SessionRegistry;
use stores::{GeoIndex, TelemetryStore};

// ─── Global startup time (for uptime reporting) ──────────────────────────────
static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

/// "redis" or "local", resolved once at startup.
static STORE_MODE: OnceLock<&'static str> = OnceLock::new();

// ─── Time Sync Endpoint ───────────────────────────────────────────────────────

async fn time_sync() -> axum::Json<serde_json::Value> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    axum::Json(json!({ "serverTime": now }))
}

// ─── Health Endpoint ──────────────────────────────────────────────────────────
// GET /health → { status, version, mode, uptimeSecs }

async fn health_check() -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": STORE_MODE.get().copied().unwrap_or("local"),
        "uptimeSecs": uptime_secs,
    }))
}

// ─── Store Sweeper Task ───────────────────────────────────────────────────────

async fn run_store_sweeper(state: AppState) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        state.geo.sweep().await;
        state.telemetry.sweep().await;
        state.history.sweep(ingest::now_ms());
        tracing::debug!(
            "sweep done — {} session bindings, {} history windows",
            state.sessions.len(),
            state.history.len()
        );
    }
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let startup_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "v2v_backend=info".into()),
        )
        .init();

    info!(
        "V2V collision-risk backend v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let deploy = DeploymentConfig::from_env();

    // Shared stores: Redis when configured, otherwise in-process maps.
    // A configured-but-unreachable Redis is fatal; the core refuses to
    // serve without its stores.
    let (geo, telemetry) = match &deploy.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).context("invalid REDIS_URL")?;
            let conn = client
                .get_connection_manager()
                .await
                .context("redis unreachable")?;
            STORE_MODE.set("redis").ok();
            info!("Connected to redis — shared store mode");
            (GeoIndex::redis(conn.clone()), TelemetryStore::redis(conn))
        }
        None => {
            STORE_MODE.set("local").ok();
            warn!("REDIS_URL not set — in-process stores, single instance only");
            (GeoIndex::memory(), TelemetryStore::memory())
        }
    };

    let state = AppState {
        cfg: Arc::new(EngineConfig::from_env()),
        geo: Arc::new(geo),
        telemetry: Arc::new(telemetry),
        history: Arc::new(SpeedHistory::new()),
        sessions: Arc::new(SessionRegistry::new()),
        auth: Arc::new(AuthVerifier::new(deploy.auth_jwt_secret.as_deref())),
    };

    tokio::spawn(run_store_sweeper(state.clone()));

    let cors = CorsLayer::new()
        .allow_origin(deploy.cors_allow_origin())
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sync", get(time_sync))
        .route("/ws", get(ingest::ws_handler))
        .with_state(state)
        .layer(cors);

    let addr = format!("0.0.0.0:{}", deploy.port);
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown");
        })
        .await
        .context("server error")?;

    Ok(())
}
