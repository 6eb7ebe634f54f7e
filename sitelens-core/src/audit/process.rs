use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AuditEngine, AuditOptions, AuditOutput};
use crate::error::{Result, ScanError};
use crate::orchestration::config::{AuditConfig, Device, Throttle};

/// Runs the audit CLI as a separate OS process per route.
///
/// Reports are written to a private temp dir (`--output-path`) and read back
/// once the process exits; the process is killed if it outlives the timeout.
#[derive(Debug, Clone)]
pub struct ProcessAuditEngine {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl ProcessAuditEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    fn command(&self, url: &str, options: &AuditOptions, port: u16, output_path: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(url)
            .arg(format!("--port={port}"))
            .args(["--output", "json", "--output", "html"])
            .arg(format!("--output-path={output_path}"))
            .arg(format!("--only-categories={}", options.categories.join(",")))
            .arg("--quiet");
        if options.device == Device::Desktop {
            cmd.arg("--preset=desktop");
        }
        let throttling = match options.throttle {
            Throttle::Simulate => "simulate",
            Throttle::Devtools => "devtools",
            Throttle::Off => "provided",
        };
        cmd.arg(format!("--throttling-method={throttling}"));
        cmd.args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AuditEngine for ProcessAuditEngine {
    async fn run_audit(
        &self,
        url: &str,
        options: &AuditOptions,
        port: u16,
    ) -> Result<AuditOutput> {
        let workdir = tempfile::Builder::new().prefix("sitelens-audit-").tempdir()?;
        let base = workdir.path().join("report");
        let base_str = base.to_string_lossy().into_owned();

        let child = self
            .command(url, options, port, &base_str)
            .spawn()
            .map_err(|e| {
                ScanError::Audit(format!("failed to spawn {}: {e}", self.binary.display()))
            })?;

        let output = match tokio::time::timeout(options.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            // Dropping the future drops the child, which kills it.
            Err(_) => return Err(ScanError::AuditTimeout(options.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            warn!(target: "scan::pipeline", url, port, status = %output.status, "audit process failed");
            if stderr.contains("ECONNREFUSED") || stderr.contains("Unable to connect to Chrome") {
                return Err(ScanError::BrowserCrash(format!(
                    "audit could not reach browser on port {port}: {tail}"
                )));
            }
            return Err(ScanError::Audit(format!(
                "audit exited with {}: {tail}",
                output.status
            )));
        }

        let json = tokio::fs::read_to_string(format!("{base_str}.report.json")).await?;
        let html = tokio::fs::read_to_string(format!("{base_str}.report.html")).await?;
        debug!(target: "scan::pipeline", url, json_bytes = json.len(), html_bytes = html.len(), "audit reports read");
        Ok(AuditOutput { html, json })
    }
}
