use crate::state::FilterState;
use crate::storage::Storage;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use icmpgate_common::FilterEngine;
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub filter: Arc<FilterState>,
    pub engine: Arc<FilterEngine>,
    pub storage: Arc<Storage>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    inspected_total: Counter,
    dropped_total: Counter,
    tracked_sources: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let inspected_total = Counter::default();
        let dropped_total = Counter::default();
        let tracked_sources = Gauge::default();

        registry.register(
            "icmpgate_inspected_total",
            "Total number of inspected ICMP datagrams",
            inspected_total.clone(),
        );
        registry.register(
            "icmpgate_dropped_total",
            "Total number of dropped echo requests",
            dropped_total.clone(),
        );
        registry.register(
            "icmpgate_tracked_sources",
            "Source addresses currently being dropped",
            tracked_sources.clone(),
        );

        Self {
            registry,
            inspected_total,
            dropped_total,
            tracked_sources,
        }
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    dropped_total: u64,
    tracked_sources: usize,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    inspected_total: u64,
    passed_total: u64,
    dropped_total: u64,
    tracked_sources: usize,
    drops_per_second: f64,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/offenders", get(get_offenders))
        .route("/api/history", get(get_history))
        .route("/api/stream", get(ws_handler))
        .route(
            "/metrics",
            get({
                let m = metrics.clone();
                let s = state.clone();
                move || get_metrics(s.clone(), m.clone())
            }),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| s.parse::<IpNet>().ok())
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    // If there is no ConnectInfo, allow (should not happen with into_make_service_with_connect_info).
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        dropped_total: state.engine.snapshot_count(),
        tracked_sources: state.filter.tracked_sources.load(Ordering::Relaxed),
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    let inspected_total = state.filter.inspected_total.load(Ordering::Relaxed);
    let passed_total = state.filter.passed_total.load(Ordering::Relaxed);
    let dropped_total = state.engine.snapshot_count();
    let tracked_sources = state.filter.tracked_sources.load(Ordering::Relaxed);

    let drops_per_second = if uptime > 0 {
        dropped_total as f64 / uptime as f64
    } else {
        0.0
    };

    Json(StatsResponse {
        uptime_seconds: uptime,
        inspected_total,
        passed_total,
        dropped_total,
        tracked_sources,
        drops_per_second,
    })
}

async fn get_offenders(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut offenders: Vec<_> = state
        .filter
        .offenders
        .iter()
        .map(|entry| {
            let (addr, stats) = entry.pair();
            serde_json::json!({
                "source": addr.to_string(),
                "stats": stats
            })
        })
        .collect();

    offenders.sort_by(|a, b| {
        let drops_a = a["stats"]["drops"].as_u64().unwrap_or(0);
        let drops_b = b["stats"]["drops"].as_u64().unwrap_or(0);
        drops_b.cmp(&drops_a)
    });

    offenders.truncate(50);

    Json(serde_json::json!({
        "offenders": offenders,
        "dropped_total": state.engine.snapshot_count(),
    }))
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(100).min(1000);
    match state.storage.query_history(limit) {
        Ok(data) => Json(serde_json::json!(data)),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    // Sync the atomic state into the prometheus registry. The counters are
    // monotonic, so they advance by the delta since the last scrape.
    let inspected = state.filter.inspected_total.load(Ordering::Relaxed);
    let dropped = state.engine.snapshot_count();
    let tracked = state.filter.tracked_sources.load(Ordering::Relaxed);

    let current_inspected = metrics.inspected_total.get();
    if inspected > current_inspected {
        metrics.inspected_total.inc_by(inspected - current_inspected);
    }
    let current_dropped = metrics.dropped_total.get();
    if dropped > current_dropped {
        metrics.dropped_total.inc_by(dropped - current_dropped);
    }
    metrics.tracked_sources.set(tracked as i64);

    let mut buf = String::new();
    encode(&mut buf, &metrics.registry).unwrap();
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));

    loop {
        interval.tick().await;

        let stats = serde_json::json!({
            "inspected_total": state.filter.inspected_total.load(Ordering::Relaxed),
            "dropped_total": state.engine.snapshot_count(),
            "tracked_sources": state.filter.tracked_sources.load(Ordering::Relaxed),
        });

        if socket
            .send(Message::Text(stats.to_string().into()))
            .await
            .is_err()
        {
            break;
        }
    }
}
