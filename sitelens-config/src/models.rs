use std::path::PathBuf;

use serde::Serialize;
use sitelens_core::RouteDefinition;
use sitelens_core::orchestration::ScanConfig;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5678;

/// Fully resolved configuration for one sitelens process.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub scan: ScanConfig,
    pub routes: Vec<RouteDefinition>,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// `host:port`, suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where the scan settings came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigSource {
    /// Path passed to the loader directly (`--config`).
    Explicit { path: PathBuf },
    /// Path taken from `SITELENS_CONFIG_PATH`.
    EnvPath { path: PathBuf },
    /// `SITELENS_CONFIG_JSON`.
    InlineJson,
    /// First default location found on disk.
    DefaultFile { path: PathBuf },
    /// Nothing found; built-in defaults only.
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            ConfigSource::Explicit { path }
            | ConfigSource::EnvPath { path }
            | ConfigSource::DefaultFile { path } => Some(path),
            ConfigSource::InlineJson | ConfigSource::Defaults => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigMetadata {
    pub source: ConfigSource,
    pub env_file_loaded: bool,
    /// Which CLI overrides were applied, by field name.
    pub overrides: Vec<&'static str>,
}

/// Command-line values that win over every other source.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub site: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub concurrency: Option<usize>,
}

impl CliOverrides {
    pub(crate) fn apply(&self, server: &mut ServerConfig, scan: &mut ScanConfig) -> Vec<&'static str> {
        let mut applied = Vec::new();
        if let Some(site) = &self.site {
            scan.site = site.clone();
            applied.push("site");
        }
        if let Some(host) = &self.host {
            server.host = host.clone();
            applied.push("host");
        }
        if let Some(port) = self.port {
            server.port = port;
            applied.push("port");
        }
        if let Some(concurrency) = self.concurrency {
            scan.pipeline.max_concurrency = concurrency;
            applied.push("concurrency");
        }
        applied
    }
}

/// Non-fatal finding surfaced while loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

impl ConfigWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }
}
