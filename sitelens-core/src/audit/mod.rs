//! Audit engine seam. Each invocation audits one URL through a browser the
//! pool lent out, identified by its remote-debugging port.

pub mod process;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use process::ProcessAuditEngine;

use crate::error::{Result, ScanError};
use crate::orchestration::config::{AuditConfig, Device, Throttle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditOptions {
    pub device: Device,
    pub throttle: Throttle,
    pub categories: Vec<String>,
    pub timeout: Duration,
}

impl AuditOptions {
    pub fn from_config(config: &AuditConfig, timeout: Duration) -> Self {
        Self {
            device: config.device,
            throttle: config.throttle,
            categories: config.categories.clone(),
            timeout,
        }
    }
}

/// Raw reports produced by one audit run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditOutput {
    pub html: String,
    pub json: String,
}

impl AuditOutput {
    /// Scores in `[0, 1]` keyed by category id (`categories.<id>.score`).
    /// Categories the engine could not score (`null`) are left out.
    pub fn category_scores(&self) -> Result<BTreeMap<String, f64>> {
        let report: serde_json::Value = serde_json::from_str(&self.json)?;
        let categories = report
            .get("categories")
            .and_then(|c| c.as_object())
            .ok_or_else(|| ScanError::Audit("audit report has no categories".into()))?;

        Ok(categories
            .iter()
            .filter_map(|(id, category)| {
                let score = category.get("score")?.as_f64()?;
                Some((id.clone(), score.clamp(0.0, 1.0)))
            })
            .collect())
    }
}

#[async_trait]
pub trait AuditEngine: Send + Sync + fmt::Debug {
    async fn run_audit(&self, url: &str, options: &AuditOptions, port: u16)
    -> Result<AuditOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_category_scores() {
        let output = AuditOutput {
            html: String::new(),
            json: r#"{
                "categories": {
                    "performance": {"id": "performance", "score": 0.91},
                    "seo": {"id": "seo", "score": 1},
                    "pwa": {"id": "pwa", "score": null}
                }
            }"#
            .into(),
        };
        let scores = output.category_scores().unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores["performance"], 0.91);
        assert_eq!(scores["seo"], 1.0);
    }

    #[test]
    fn report_without_categories_is_an_audit_error() {
        let output = AuditOutput {
            html: String::new(),
            json: "{}".into(),
        };
        assert!(matches!(
            output.category_scores(),
            Err(ScanError::Audit(_))
        ));
    }
}
