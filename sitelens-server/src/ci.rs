//! `sitelens ci`: run one scan to completion and gate on the budget.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use sitelens_core::budget::BudgetResult;
use sitelens_core::{RouteReport, ScanSession, TaskStatus};

/// Exit code for configuration or runtime errors that prevented a verdict.
pub const EXIT_FATAL: u8 = 2;

/// A route that did not produce a usable audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteProblem {
    pub path: String,
    /// `None` when the route never reached a terminal state.
    pub failed_task: Option<String>,
    pub error: Option<String>,
}

/// Routes that failed or never finished, in report order.
pub fn route_problems(reports: &[RouteReport]) -> Vec<RouteProblem> {
    reports
        .iter()
        .filter(|report| !report.is_complete())
        .map(|report| {
            let failed = report
                .tasks
                .iter()
                .find(|(_, state)| state.status == TaskStatus::Failed);
            RouteProblem {
                path: report.route.path.clone(),
                failed_task: failed.map(|(task, _)| task.as_str().to_string()),
                error: failed.and_then(|(_, state)| state.last_error.clone()),
            }
        })
        .collect()
}

/// Result file written by `--output`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CiReport<'a> {
    pub session: &'a ScanSession,
    pub budget: &'a BudgetResult,
    pub problems: Vec<RouteProblem>,
}

pub fn write_report(path: &Path, report: &CiReport<'_>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to encode CI report")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write CI report to {}", path.display()))
}

/// Human-readable summary printed at the end of a CI run.
pub fn render_summary(session: &ScanSession, problems: &[RouteProblem], result: &BudgetResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "sitelens: {} ({})", session.site, session.status.as_str());
    let _ = writeln!(
        out,
        "  routes: {}  scanned: {}  failed: {}",
        session.route_count, session.scanned_count, session.failed_count
    );

    if result.categories.is_empty() {
        let _ = writeln!(out, "  no budget configured");
    }
    for category in &result.categories {
        let verdict = match category.pass {
            Some(true) => "PASS",
            Some(false) => "FAIL",
            None => "GAP ",
        };
        match category.actual_mean {
            Some(mean) => {
                let _ = writeln!(
                    out,
                    "  {verdict} {:<16} {:>3} / {:<3} ({} routes)",
                    category.category, mean, category.threshold, category.coverage
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "  {verdict} {:<16}   - / {:<3} (no scored routes)",
                    category.category, category.threshold
                );
            }
        }
    }

    if !problems.is_empty() {
        let _ = writeln!(out, "  unscanned or failed routes:");
        for problem in problems {
            match (&problem.failed_task, &problem.error) {
                (Some(task), Some(error)) => {
                    let _ = writeln!(out, "    {} [{task}] {error}", problem.path);
                }
                (Some(task), None) => {
                    let _ = writeln!(out, "    {} [{task}]", problem.path);
                }
                _ => {
                    let _ = writeln!(out, "    {} [not scanned]", problem.path);
                }
            }
        }
    }

    let failed: Vec<&str> = result
        .failed_categories()
        .into_iter()
        .map(|c| c.category.as_str())
        .collect();
    if failed.is_empty() {
        let _ = writeln!(out, "budget passed");
    } else {
        let _ = writeln!(out, "budget failed: {}", failed.join(", "));
    }
    let gaps = result.coverage_gaps();
    if !gaps.is_empty() {
        let _ = writeln!(out, "coverage gaps: {}", gaps.join(", "));
    }
    out
}
