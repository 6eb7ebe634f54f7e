use std::collections::BTreeMap;

use axum::{extract::State, response::Json};
use serde::Serialize;
use serde_json::{Value, json};

use sitelens_config::ConfigSource;
use sitelens_core::browser::pool::PoolStats;
use sitelens_core::budget::{self, BudgetResult};
use sitelens_core::orchestration::config::{Device, DiscoveryMode, Throttle};
use sitelens_core::{ScanSession, ScanStatus};

use crate::infra::app_state::AppState;

/// Settings that shaped this scan, as shown next to the report list.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSettingsView {
    pub device: Device,
    pub throttle: Throttle,
    pub categories: Vec<String>,
    pub discovery_mode: DiscoveryMode,
    pub max_routes: usize,
    pub max_concurrency: usize,
    pub render_javascript: bool,
    pub cache_enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanMetaResponse {
    pub site: String,
    pub session: ScanSession,
    pub route_count: usize,
    /// Mean score per category over completed routes, on a 0-100 scale.
    pub category_means: BTreeMap<String, u8>,
    pub budget: BudgetResult,
    pub settings: ScanSettingsView,
    pub pool: PoolStats,
    pub config_source: ConfigSource,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatusResponse {
    pub status: ScanStatus,
    pub route_count: u32,
    pub scanned_count: u32,
    pub failed_count: u32,
    pub pending_count: u32,
    pub cancelled: bool,
}

impl From<&ScanSession> for ScanStatusResponse {
    fn from(session: &ScanSession) -> Self {
        Self {
            status: session.status,
            route_count: session.route_count,
            scanned_count: session.scanned_count,
            failed_count: session.failed_count,
            pending_count: session.pending_count(),
            cancelled: session.status == ScanStatus::Cancelled,
        }
    }
}

pub async fn scan_meta_handler(State(state): State<AppState>) -> Json<ScanMetaResponse> {
    let runtime = &state.runtime;
    let scan = runtime.config();
    let reports = runtime.reports();

    Json(ScanMetaResponse {
        site: scan.site.clone(),
        session: runtime.session(),
        route_count: reports.len(),
        category_means: budget::category_means(&reports),
        budget: budget::evaluate(&reports, &scan.budget),
        settings: ScanSettingsView {
            device: scan.audit.device,
            throttle: scan.audit.throttle,
            categories: scan.audit.categories.clone(),
            discovery_mode: scan.discovery.mode,
            max_routes: scan.discovery.max_routes,
            max_concurrency: scan.pipeline.max_concurrency,
            render_javascript: scan.pipeline.render_javascript,
            cache_enabled: scan.cache.enabled,
        },
        pool: runtime.pool_stats(),
        config_source: state.config().metadata.source.clone(),
    })
}

pub async fn scan_status_handler(State(state): State<AppState>) -> Json<ScanStatusResponse> {
    Json(ScanStatusResponse::from(&state.runtime.session()))
}

pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let session = state.runtime.session();
    Json(json!({
        "status": "ok",
        "scan": session.status.as_str(),
        "observers": state.live.observer_count(),
    }))
}
