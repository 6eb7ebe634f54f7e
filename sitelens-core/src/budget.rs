//! CI gating over a finished report set.
//!
//! Scores are averaged per category over the routes that actually produced
//! a score for it; unscored routes are excluded rather than counted as zero.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::RouteReport;

/// Exit code for a passing budget.
pub const EXIT_PASS: i32 = 0;
/// Exit code when at least one budgeted category misses its threshold.
pub const EXIT_BUDGET_FAILED: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBudgetResult {
    pub category: String,
    pub threshold: u8,
    /// Rounded mean on the 0-100 scale; `None` when nothing was scored.
    pub actual_mean: Option<u8>,
    /// `None` for a coverage gap: the category is neither passed nor failed.
    pub pass: Option<bool>,
    /// Number of reports that contributed a score.
    pub coverage: usize,
    pub coverage_gap: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetResult {
    pub passed: bool,
    pub categories: Vec<CategoryBudgetResult>,
    /// Reports considered, scored or not.
    pub report_count: usize,
}

impl BudgetResult {
    pub fn exit_code(&self) -> i32 {
        if self.passed {
            EXIT_PASS
        } else {
            EXIT_BUDGET_FAILED
        }
    }

    pub fn failed_categories(&self) -> Vec<&CategoryBudgetResult> {
        self.categories
            .iter()
            .filter(|c| c.pass == Some(false))
            .collect()
    }

    pub fn coverage_gaps(&self) -> Vec<&str> {
        self.categories
            .iter()
            .filter(|c| c.coverage_gap)
            .map(|c| c.category.as_str())
            .collect()
    }
}

fn category_mean<'a>(
    reports: impl IntoIterator<Item = &'a RouteReport>,
    category: &str,
) -> (Option<u8>, usize) {
    let scores: Vec<f64> = reports
        .into_iter()
        .filter_map(|report| report.category_score(category))
        .collect();
    if scores.is_empty() {
        return (None, 0);
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let scaled = (mean * 100.0).round().clamp(0.0, 100.0) as u8;
    (Some(scaled), scores.len())
}

/// Compares per-category means against `budget` thresholds (0-100).
pub fn evaluate(reports: &[RouteReport], budget: &BTreeMap<String, u8>) -> BudgetResult {
    let categories: Vec<CategoryBudgetResult> = budget
        .iter()
        .map(|(category, &threshold)| {
            let (actual_mean, coverage) = category_mean(reports, category);
            CategoryBudgetResult {
                category: category.clone(),
                threshold,
                actual_mean,
                pass: actual_mean.map(|mean| mean >= threshold),
                coverage,
                coverage_gap: actual_mean.is_none(),
            }
        })
        .collect();

    BudgetResult {
        passed: categories.iter().all(|c| c.pass != Some(false)),
        categories,
        report_count: reports.len(),
    }
}

/// Rounded mean of every category that at least one report scored.
pub fn category_means(reports: &[RouteReport]) -> BTreeMap<String, u8> {
    let mut names: Vec<&str> = reports
        .iter()
        .filter(|report| report.is_complete())
        .filter_map(|report| report.score.as_ref())
        .flat_map(|score| score.categories.keys().map(String::as_str))
        .collect();
    names.sort_unstable();
    names.dedup();

    names
        .into_iter()
        .filter_map(|name| {
            let (mean, _) = category_mean(reports, name);
            mean.map(|mean| (name.to_string(), mean))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Route, RouteId, ScoreSummary, TaskName, TaskStatus};

    fn scored(path: &str, scores: &[(&str, f64)]) -> RouteReport {
        let mut report = RouteReport::new(Route {
            id: RouteId::from_path(path),
            url: format!("https://example.com{path}"),
            path: path.into(),
            dynamic: false,
            definition: None,
        });
        for task in TaskName::CHAIN {
            report.transition(task, TaskStatus::Running, None);
            report.transition(task, TaskStatus::Complete, None);
        }
        report.score = Some(ScoreSummary::from_categories(
            scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        ));
        report
    }

    fn budget(entries: &[(&str, u8)]) -> BTreeMap<String, u8> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn mean_at_or_above_threshold_passes() {
        let reports = vec![
            scored("/", &[("performance", 0.9)]),
            scored("/about", &[("performance", 0.7)]),
        ];

        let result = evaluate(&reports, &budget(&[("performance", 75)]));
        assert!(result.passed);
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.categories[0].actual_mean, Some(80));

        let result = evaluate(&reports, &budget(&[("performance", 85)]));
        assert!(!result.passed);
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.failed_categories()[0].category, "performance");
    }

    #[test]
    fn unscored_category_is_a_gap_not_a_failure() {
        let reports = vec![scored("/", &[("performance", 0.95)])];
        let result = evaluate(&reports, &budget(&[("performance", 90), ("seo", 90)]));
        assert!(result.passed);
        assert_eq!(result.coverage_gaps(), vec!["seo"]);
        let seo = &result.categories[1];
        assert_eq!(seo.pass, None);
        assert_eq!(seo.coverage, 0);
    }

    #[test]
    fn reports_without_a_score_are_excluded_from_the_mean() {
        let mut failed = scored("/broken", &[]);
        failed.score = None;
        let reports = vec![scored("/", &[("accessibility", 0.6)]), failed];
        let means = category_means(&reports);
        assert_eq!(means.get("accessibility"), Some(&60));

        let result = evaluate(&reports, &budget(&[("accessibility", 60)]));
        assert!(result.passed);
        assert_eq!(result.categories[0].coverage, 1);
        assert_eq!(result.report_count, 2);
    }
}
