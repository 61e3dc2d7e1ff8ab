//! Read side of the service: latest totals, historical rows and metrics.

use std::net::SocketAddr;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use pv_client::domain::RealtimeDataPoint;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::{metrics_server, pipeline::PropagationError, store::LatestPowerStore};

#[derive(Clone)]
pub struct ApiState {
    pub store: LatestPowerStore,
    pub pool: Option<PgPool>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct TotalPowerResponse {
    pub total_power_kw: f64,
    pub plants: usize,
}

#[derive(Debug, Deserialize)]
pub struct TimeRange {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/realtime/total", get(total_handler))
        .route("/realtime/total/ledger", get(ledger_total_handler))
        .route("/realtime/data", get(data_handler))
        .with_state(state)
}

pub async fn serve(bind_addr: &str, state: ApiState) -> Result<(), PropagationError> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| PropagationError::Configuration(format!("invalid http.bind_addr {bind_addr}: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| PropagationError::Configuration(format!("failed to bind {addr}: {e}")))?;

    tracing::info!(%addr, "serving realtime API");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(state).into_make_service()).await {
            tracing::error!(error = %e, "realtime API server error");
        }
    });
    Ok(())
}

async fn metrics_handler() -> String {
    metrics_server::render()
}

async fn total_handler(State(state): State<ApiState>) -> Json<TotalPowerResponse> {
    let (total_power_kw, plants) = state.store.totals();
    Json(TotalPowerResponse { total_power_kw, plants })
}

/// Total derived from the latest ledger row per plant; survives restarts.
async fn ledger_total_handler(State(state): State<ApiState>) -> Response {
    let Some(pool) = state.pool else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no database configured").into_response();
    };

    match pv_client::db::get_total_realtime_power(&pool).await {
        Ok(total_power_kw) => Json(serde_json::json!({ "total_power_kw": total_power_kw })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "ledger total query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "query failed").into_response()
        }
    }
}

async fn data_handler(State(state): State<ApiState>, Query(range): Query<TimeRange>) -> Response {
    if range.end <= range.start {
        return (StatusCode::BAD_REQUEST, "end must be after start").into_response();
    }
    let Some(pool) = state.pool else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no database configured").into_response();
    };

    match pv_client::db::get_real_time_data(&pool, range.start, range.end).await {
        Ok(rows) => Json::<Vec<RealtimeDataPoint>>(rows).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "realtime data query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "query failed").into_response()
        }
    }
}
