use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sitelens_core::RouteDefinition;
use sitelens_core::orchestration::ScanConfig;

/// Raw configuration as written in a TOML or JSON file.
///
/// ```toml
/// [server]
/// port = 8080
///
/// [scan]
/// site = "https://example.com"
///
/// [scan.budget]
/// performance = 80
///
/// [[routes]]
/// name = "blog-post"
/// path = "/blog/:slug"
/// ```
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: FileServerConfig,
    pub scan: ScanConfig,
    /// Host route definitions, used for static enumeration and sampling
    /// groups.
    pub routes: Vec<RouteDefinition>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,
    pub site: Option<String>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub cache_dir: Option<PathBuf>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds from an arbitrary variable source; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        Self {
            config_path: var("SITELENS_CONFIG_PATH").map(PathBuf::from),
            config_json: var("SITELENS_CONFIG_JSON"),
            site: var("SITELENS_SITE"),
            server_host: var("SERVER_HOST"),
            server_port: var("SERVER_PORT").and_then(|s| s.trim().parse().ok()),
            cache_dir: var("SITELENS_CACHE_DIR").map(PathBuf::from),
        }
    }
}
