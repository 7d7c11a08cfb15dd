use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    batch::{ChannelGate, MeasureOptions},
    config::AppConfig,
    error::ScanError,
    pipeline,
    run::{RunKind, RunRegistry, RunStatus},
    scanner::ScanOptions,
    speedtest::SpeedtestCli,
    store::load_store,
    tunnel::Tunnel,
};

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    registry: RunRegistry,
    gate: Arc<ChannelGate>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: RunRegistry::new(),
            gate: Arc::new(ChannelGate::new()),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ScanRequest {
    pub pings: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub workers: Option<usize>,
    pub all_addresses: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MeasureRequest {
    pub batch_size: Option<usize>,
    pub interactive: bool,
    pub selected: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContinueRequest {
    pub proceed: bool,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scan/start", post(post_scan))
        .route("/measure/start", post(post_measure))
        .route("/measure/continue", post(post_continue))
        .route("/stop", post(post_stop))
        .route("/status", get(get_status))
        .route("/log", get(get_log))
        .route("/results", get(get_results))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub async fn spawn_server(bind: &str, config: AppConfig) -> Result<()> {
    let app = router(AppState::new(config));
    info!("serving control plane on http://{bind}");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

/// Empty bodies mean "all defaults".
fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": format!("invalid request: {e}") })),
        )
            .into_response()
    })
}

fn conflict(e: ScanError) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "status": "error", "message": e.to_string() })),
    )
        .into_response()
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let mut snap = serde_json::to_value(app.registry.status().await).unwrap_or_default();
    if let Some(obj) = snap.as_object_mut() {
        obj.insert("awaiting_decision".into(), app.gate.is_waiting().await.into());
    }
    (StatusCode::OK, Json(snap))
}

async fn get_log(State(app): State<AppState>) -> impl IntoResponse {
    let lines = match app.registry.current().await {
        Some(ctx) => ctx.recent_lines().await,
        None => Vec::new(),
    };
    (StatusCode::OK, Json(json!({ "lines": lines })))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    match load_store(&app.config.results_file) {
        Ok(Some(store)) => (StatusCode::OK, Json(json!(store))).into_response(),
        Ok(None) => (StatusCode::OK, Json(json!({}))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn post_stop(State(app): State<AppState>) -> impl IntoResponse {
    match app.registry.stop().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "stopping" }))).into_response(),
        Err(e) => conflict(e),
    }
}

async fn post_continue(
    State(app): State<AppState>,
    Json(req): Json<ContinueRequest>,
) -> impl IntoResponse {
    if app.gate.resolve(req.proceed).await {
        (StatusCode::OK, Json(json!({ "status": "resumed", "proceed": req.proceed }))).into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({ "status": "error", "message": "no batch is waiting for a decision" })),
        )
            .into_response()
    }
}

async fn post_scan(
    State(app): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    let req: ScanRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let defaults = ScanOptions::default();
    let opts = ScanOptions {
        pings: req.pings.unwrap_or(defaults.pings),
        timeout: req
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout),
        workers: req.workers.unwrap_or(defaults.workers),
        all_addresses: req.all_addresses,
    };

    let (guard, ctx) = match app.registry.try_begin(RunKind::Scan).await {
        Ok(pair) => pair,
        Err(e) => return conflict(e),
    };

    let config = app.config.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let deps = match pipeline::system_deps(&config) {
            Ok(d) => d,
            Err(e) => {
                error!("scan error: {e:#}");
                ctx.finish(RunStatus::Error, format!("{e:#}")).await;
                return;
            }
        };
        if let Err(e) = pipeline::run_scan_phase(&config, &opts, &deps, &ctx).await {
            error!("scan error: {e:#}");
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response()
}

async fn post_measure(
    State(app): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    let req: MeasureRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if !app.config.has_vpn_credentials() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "VPN credentials are not configured" })),
        )
            .into_response();
    }

    let opts = MeasureOptions {
        config_dir: app.config.vpn_config_dir.clone(),
        batch_size: req.batch_size.unwrap_or(MeasureOptions::default().batch_size),
        interactive: req.interactive,
        only: (!req.selected.is_empty()).then(|| req.selected.into_iter().collect::<HashSet<_>>()),
    };

    let (guard, ctx) = match app.registry.try_begin(RunKind::Measure).await {
        Ok(pair) => pair,
        Err(e) => return conflict(e),
    };

    let config = app.config.clone();
    let gate = app.gate.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let mut tunnel = pipeline::system_tunnel(&config);
        let meter = SpeedtestCli::new();
        if let Err(e) = pipeline::run_measure_phase(
            &config,
            &opts,
            None,
            &mut tunnel,
            &meter,
            gate.as_ref(),
            &ctx,
        )
        .await
        {
            error!("measurement error: {e:#}");
        }
        tunnel.disconnect().await;
    });

    (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response()
}
