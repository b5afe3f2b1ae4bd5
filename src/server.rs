//! HTTP surface: one axum listener per enabled market class.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use http::{header, StatusCode};
use serde_json::json;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace};

use crate::forwarder::Forwarder;
use crate::market::MarketClass;
use crate::metrics::StatusCounters;
use crate::quota::QuotaController;
use crate::registry::Registry;
use crate::resolver::{self, Route};
use crate::util::QueryParams;

/// Mirrors the upstream write budget so slow forwards still finish.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(75);

/// Shared state of one class listener.
#[derive(Clone)]
pub struct AppState {
    pub class: MarketClass,
    pub registry: Arc<Registry>,
    pub forwarder: Arc<Forwarder>,
    pub quota: Arc<QuotaController>,
    pub counters: Arc<StatusCounters>,
    pub fake_klines: bool,
    pub always_show_forwards: bool,
}

/// Router for one class listener: `/status` plus a catch-all dispatcher.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .fallback(dispatch)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the shutdown signal fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let class = state.class;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {class} listener to {addr}"))?;
    info!("{class} market proxy listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .with_context(|| format!("{class} listener failed"))?;
    Ok(())
}

async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let started = Instant::now();
    state.counters.record_request();

    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let query = QueryParams::parse(uri.query());

    let response = match resolver::resolve(&method, &path, &query) {
        Route::Klines {
            symbol,
            interval,
            limit,
        } => klines(&state, &symbol, &interval, limit, req).await,
        Route::Depth { symbol, limit } => depth(&state, &symbol, limit, req).await,
        Route::Ticker { symbol } => ticker(&state, &symbol, req).await,
        Route::ExchangeInfo => exchange_info(&state).await,
        Route::Forward => forward(&state, req).await,
    };

    if response.status().is_server_error() {
        state.counters.record_error();
    }
    debug!(
        "{} request {} {} served in {:?}",
        state.class,
        method,
        uri,
        started.elapsed()
    );
    response
}

async fn klines(
    state: &AppState,
    symbol: &str,
    interval: &str,
    limit: usize,
    req: Request,
) -> Response {
    let Some(window) = state.registry.klines(symbol, interval).await else {
        trace!("{} {symbol}@{interval} kline proxying via REST", state.class);
        return forward(state, req).await;
    };

    let rows = resolver::kline_rows(
        &window,
        limit,
        state.fake_klines,
        Utc::now().timestamp_millis(),
    );
    json_response("websocket", json!(rows).to_string())
}

async fn depth(state: &AppState, symbol: &str, limit: usize, req: Request) -> Response {
    let Some(snapshot) = state.registry.depth(symbol).await else {
        trace!("{} {symbol} depth proxying via REST", state.class);
        return forward(state, req).await;
    };
    json_response("websocket", resolver::depth_body(&snapshot, limit).to_string())
}

async fn ticker(state: &AppState, symbol: &str, req: Request) -> Response {
    let Some(snapshot) = state.registry.ticker(symbol).await else {
        trace!("{} {symbol} ticker24hr proxying via REST", state.class);
        return forward(state, req).await;
    };
    trace!(
        "{} {symbol} ticker24hr delivered via websocket cache",
        state.class
    );
    match serde_json::to_string(&*snapshot) {
        Ok(body) => json_response("websocket", body),
        Err(_) => internal_error(),
    }
}

async fn exchange_info(state: &AppState) -> Response {
    let Some(body) = state.registry.exchange_info().await else {
        return plain_status(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"error":"exchangeInfo not available"}"#,
        );
    };
    json_response("apicache", body.as_ref().clone())
}

async fn forward(state: &AppState, req: Request) -> Response {
    state.counters.record_forward();
    let line = format!(
        "{} request {} {} is not cachable",
        state.class,
        req.method(),
        req.uri()
    );
    if state.always_show_forwards {
        info!("{line}");
    } else {
        trace!("{line}");
    }
    state.forwarder.forward(req).await
}

async fn status(State(state): State<AppState>) -> Response {
    let ban = state.quota.ban_status(state.class);
    let (weight_used, weight_limit) = state.quota.weight_info(state.class);
    let body = json!({
        "proxy_status": state.counters.snapshot(),
        "class": state.class.to_string(),
        "streams": state.registry.stream_count(),
        "ban_info": {
            "banned": ban.is_some(),
            "recovery_time": ban.map(|b| b.until_rfc3339()),
        },
        "weight": { "used": weight_used, "limit": weight_limit },
        "config": {
            "fake_kline_enabled": state.fake_klines,
            "always_show_forwards": state.always_show_forwards,
        },
    });
    json_ok(body.to_string())
}

fn json_response(source: &str, body: impl Into<Body>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header("Data-Source", source)
        .body(body.into())
        .unwrap_or_else(|_| internal_error())
}

fn json_ok(body: impl Into<Body>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap_or_else(|_| internal_error())
}

fn plain_status(status: StatusCode, body: &'static str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| internal_error())
}

fn internal_error() -> Response {
    let mut resp = Response::new(Body::from(r#"{"error":"internal server error"}"#));
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp
}

/// Shared state of the auxiliary listener.
#[derive(Clone)]
pub struct AuxState {
    pub counters: Arc<StatusCounters>,
    pub quota: Arc<QuotaController>,
}

async fn aux_health() -> Response {
    plain_status(StatusCode::OK, r#"{"status":"ok"}"#)
}

async fn aux_status(State(state): State<AuxState>) -> Response {
    let per_class: Vec<_> = MarketClass::ALL
        .iter()
        .map(|&class| {
            let ban = state.quota.ban_status(class);
            let (used, limit) = state.quota.weight_info(class);
            json!({
                "class": class.to_string(),
                "banned": ban.is_some(),
                "recovery_time": ban.map(|b| b.until_rfc3339()),
                "weight": { "used": used, "limit": limit },
            })
        })
        .collect();
    json_ok(
        json!({
            "proxy_status": state.counters.snapshot(),
            "classes": per_class,
        })
        .to_string(),
    )
}

/// Minimal auxiliary listener: `/health` and a cross-class `/status`.
pub async fn serve_aux(
    addr: SocketAddr,
    counters: Arc<StatusCounters>,
    quota: Arc<QuotaController>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = Router::new()
        .route("/health", get(aux_health))
        .route("/status", get(aux_status))
        .layer(TraceLayer::new_for_http())
        .with_state(AuxState { counters, quota });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status listener to {addr}"))?;
    info!("status listener on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("status listener failed")?;
    Ok(())
}
