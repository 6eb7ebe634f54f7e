use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::PgPool;

use super::{RouteHistoryStatus, ScanHistoryStore};
use crate::error::{Result, ScanError};
use crate::types::{RouteReport, ScanId, ScanSession};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// History backed by the `scans` / `scan_routes` tables.
#[derive(Debug, Clone)]
pub struct PostgresScanHistory {
    pool: PgPool,
}

impl PostgresScanHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| ScanError::Storage(format!("Failed to connect to history database: {e}")))?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| ScanError::Storage(format!("Failed to run history migrations: {e}")))?;
        Ok(Self::new(pool))
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn scores_json(report: &RouteReport) -> Result<serde_json::Value> {
    let scores = report
        .score
        .as_ref()
        .map(|score| score.categories.clone())
        .unwrap_or_default();
    Ok(serde_json::to_value(scores)?)
}

#[async_trait]
impl ScanHistoryStore for PostgresScanHistory {
    async fn create_scan(&self, session: &ScanSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scans (
                id, site, config_fingerprint, status,
                route_count, scanned_count, failed_count,
                started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(session.id.to_uuid())
        .bind(&session.site)
        .bind(&session.config_fingerprint)
        .bind(session.status.as_str())
        .bind(count(session.route_count))
        .bind(count(session.scanned_count))
        .bind(count(session.failed_count))
        .bind(session.started_at)
        .bind(session.completed_at)
        .execute(self.pool())
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to insert scan: {e}")))?;
        Ok(())
    }

    async fn add_scan_route(&self, scan_id: ScanId, report: &RouteReport) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_routes (scan_id, route_id, path, status, scores, from_cache, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (scan_id, route_id) DO UPDATE
            SET status = EXCLUDED.status,
                scores = EXCLUDED.scores,
                from_cache = EXCLUDED.from_cache,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(scan_id.to_uuid())
        .bind(report.id().as_str())
        .bind(&report.route.path)
        .bind(RouteHistoryStatus::of(report).as_str())
        .bind(scores_json(report)?)
        .bind(report.from_cache)
        .bind(report.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to insert scan route: {e}")))?;
        Ok(())
    }

    async fn update_scan(&self, session: &ScanSession) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scans
            SET status = $2,
                route_count = $3,
                scanned_count = $4,
                failed_count = $5,
                completed_at = $6
            WHERE id = $1
            "#,
        )
        .bind(session.id.to_uuid())
        .bind(session.status.as_str())
        .bind(count(session.route_count))
        .bind(count(session.scanned_count))
        .bind(count(session.failed_count))
        .bind(session.completed_at)
        .execute(self.pool())
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to update scan: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(ScanError::NotFound(format!("scan {}", session.id)));
        }
        Ok(())
    }

    async fn update_scan_route(&self, scan_id: ScanId, report: &RouteReport) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scan_routes
            SET status = $3, scores = $4, from_cache = $5, updated_at = $6
            WHERE scan_id = $1 AND route_id = $2
            "#,
        )
        .bind(scan_id.to_uuid())
        .bind(report.id().as_str())
        .bind(RouteHistoryStatus::of(report).as_str())
        .bind(scores_json(report)?)
        .bind(report.from_cache)
        .bind(report.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to update scan route: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(ScanError::NotFound(format!(
                "route {} in scan {scan_id}",
                report.id()
            )));
        }
        Ok(())
    }

    async fn update_scan_scores(
        &self,
        scan_id: ScanId,
        means: &BTreeMap<String, u8>,
    ) -> Result<()> {
        sqlx::query("UPDATE scans SET category_means = $2 WHERE id = $1")
            .bind(scan_id.to_uuid())
            .bind(serde_json::to_value(means)?)
            .execute(self.pool())
            .await
            .map_err(|e| ScanError::Storage(format!("Failed to update scan scores: {e}")))?;
        Ok(())
    }
}
