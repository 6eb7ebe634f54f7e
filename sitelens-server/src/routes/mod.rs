use axum::{
    Router,
    routing::{get, post},
};

use crate::handlers::{reports, scan, websocket};
use crate::infra::app_state::AppState;

pub mod paths {
    pub const REPORTS: &str = "/reports";
    pub const REPORT: &str = "/reports/{id}";
    pub const RESCAN_ALL: &str = "/reports/rescan";
    pub const RESCAN_ROUTE: &str = "/reports/{id}/rescan";
    pub const SCAN_META: &str = "/scan-meta";
    pub const SCAN_STATUS: &str = "/scan/status";
    pub const HEALTH: &str = "/health";
    pub const WEBSOCKET: &str = "/ws";

    /// Concrete path for a single report.
    pub fn report(id: &str) -> String {
        format!("/reports/{id}")
    }

    pub fn rescan_route(id: &str) -> String {
        format!("/reports/{id}/rescan")
    }
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route(paths::REPORTS, get(reports::list_reports_handler))
        .route(paths::RESCAN_ALL, post(reports::rescan_all_handler))
        .route(paths::REPORT, get(reports::get_report_handler))
        .route(paths::RESCAN_ROUTE, post(reports::rescan_route_handler))
        .route(paths::SCAN_META, get(scan::scan_meta_handler))
        .route(paths::SCAN_STATUS, get(scan::scan_status_handler))
        .route(paths::HEALTH, get(scan::health_handler))
        .route(paths::WEBSOCKET, get(websocket::websocket_handler))
}
