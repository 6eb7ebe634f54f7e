use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use tracing::info;

use sitelens_core::{RouteId, RouteReport};

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

fn parse_route_id(raw: &str) -> AppResult<RouteId> {
    RouteId::parse(raw).ok_or_else(|| AppError::bad_request(format!("invalid route id '{raw}'")))
}

/// Every known route in discovery order.
pub async fn list_reports_handler(State(state): State<AppState>) -> Json<Vec<RouteReport>> {
    Json(state.runtime.reports())
}

pub async fn get_report_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<RouteReport>> {
    let id = parse_route_id(&id)?;
    state
        .runtime
        .report(&id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("route {id} not found")))
}

pub async fn rescan_route_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let id = parse_route_id(&id)?;
    let report = state.runtime.rescan_route(&id)?;
    info!(route = %report.route.path, "rescan requested");
    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// Rescans every route that is idle; busy routes are skipped.
pub async fn rescan_all_handler(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let accepted = state.runtime.rescan_all()?;
    info!(routes = accepted.len(), "full rescan requested");
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}
