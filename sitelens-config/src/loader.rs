use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use sitelens_core::ScanError;
use sitelens_core::orchestration::config::DiscoveryMode;
use thiserror::Error;

use crate::models::{CliOverrides, Config, ConfigMetadata, ConfigSource, ConfigWarning, ServerConfig};
use crate::sources::{EnvConfig, FileConfig};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("sitelens.toml"),
        PathBuf::from("sitelens.json"),
        PathBuf::from("config/sitelens.toml"),
        PathBuf::from("config/sitelens.json"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Skip reading any `.env` file.
    pub skip_env_file: bool,
    /// Directory default locations are resolved against; the working
    /// directory when unset.
    pub base_dir: Option<PathBuf>,
    pub overrides: CliOverrides,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
    env: Option<EnvConfig>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options, env: None }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_base_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.options.base_dir = Some(dir.into());
        self
    }

    pub fn with_overrides(mut self, overrides: CliOverrides) -> Self {
        self.options.overrides = overrides;
        self
    }

    /// Uses `env` instead of the process environment. No `.env` file is
    /// read in this mode.
    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.env = Some(env);
        self.options.skip_env_file = true;
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;
        let env = self.env.clone().unwrap_or_else(EnvConfig::gather);

        let (file_config, source) = self.load_file_config(&env)?;
        let (config, warnings) = self.compose_config(file_config, source, env, env_file_loaded)?;

        for warning in &warnings {
            tracing::warn!(hint = warning.hint.as_deref(), "{}", warning.message);
        }
        tracing::debug!(source = ?config.metadata.source, "configuration loaded");

        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        if self.options.skip_env_file {
            return Ok(false);
        }
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        loaded.or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            other => Err(ConfigLoadError::EnvFile(other)),
        })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, ConfigSource), ConfigLoadError> {
        if let Some(path) = &self.options.config_path {
            let file = read_required(path)?;
            return Ok((Some(file), ConfigSource::Explicit { path: path.clone() }));
        }

        if let Some(path) = &env.config_path {
            let file = read_required(path)?;
            return Ok((Some(file), ConfigSource::EnvPath { path: path.clone() }));
        }

        if let Some(raw) = &env.config_json {
            let file = serde_json::from_str(raw).map_err(|source| ConfigLoadError::ParseJson {
                origin: "SITELENS_CONFIG_JSON".into(),
                source,
            })?;
            return Ok((Some(file), ConfigSource::InlineJson));
        }

        let base = self.options.base_dir.clone().unwrap_or_default();
        let found = DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| base.join(candidate))
            .find(|candidate| candidate.is_file());
        match found {
            Some(path) => {
                let file = parse_file(&path)?;
                Ok((Some(file), ConfigSource::DefaultFile { path }))
            }
            None => Ok((None, ConfigSource::Defaults)),
        }
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        source: ConfigSource,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<(Config, Vec<ConfigWarning>), ConfigLoadError> {
        let mut warnings = Vec::new();
        if source == ConfigSource::Defaults {
            warnings.push(ConfigWarning::with_hint(
                "No sitelens.toml detected; using built-in defaults",
                "Set SITELENS_CONFIG_PATH or create sitelens.toml next to the binary",
            ));
        }

        let FileConfig {
            server: file_server,
            mut scan,
            routes,
        } = file_config.unwrap_or_default();

        let defaults = ServerConfig::default();
        let mut server = ServerConfig {
            host: env
                .server_host
                .clone()
                .or(file_server.host)
                .unwrap_or(defaults.host),
            port: env.server_port.or(file_server.port).unwrap_or(defaults.port),
        };

        if let Some(site) = env.site {
            scan.site = site;
        }
        if let Some(dir) = env.cache_dir {
            scan.cache.root = dir;
        }

        let overrides = self.options.overrides.apply(&mut server, &mut scan);

        scan.validate().map_err(ConfigLoadError::Validation)?;

        for category in scan.budget.keys() {
            if !scan.audit.categories.contains(category) {
                warnings.push(ConfigWarning::with_hint(
                    format!("budget category '{category}' is never audited"),
                    "It will be reported as a coverage gap; add it to scan.audit.categories",
                ));
            }
        }

        if scan.discovery.mode == DiscoveryMode::StaticDefinitions && routes.is_empty() {
            warnings.push(ConfigWarning::with_hint(
                "static-definitions discovery without any [[routes]]",
                "Only the site root and discovery.urls will be scanned",
            ));
        }

        let config = Config {
            server,
            scan,
            routes,
            metadata: ConfigMetadata {
                source,
                env_file_loaded,
                overrides,
            },
        };
        Ok((config, warnings))
    }
}

fn read_required(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    if !path.is_file() {
        return Err(ConfigLoadError::MissingConfig {
            path: path.to_path_buf(),
        });
    }
    parse_file(path)
}

fn parse_file(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&contents).map_err(|source| ConfigLoadError::ParseJson {
            origin: path.display().to_string(),
            source,
        })
    } else {
        toml::from_str(&contents).map_err(|source| ConfigLoadError::ParseToml {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON configuration from {origin}")]
    ParseJson {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid scan configuration: {0}")]
    Validation(#[source] ScanError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: Vec<ConfigWarning>,
}

impl ConfigLoad {
    /// Discards warnings; they have already been logged.
    pub fn into_config(self) -> Config {
        self.config
    }
}

/// Loads with process defaults and CLI overrides, for binaries that only
/// want the result.
pub fn load_with_overrides(
    config_path: Option<PathBuf>,
    overrides: CliOverrides,
) -> anyhow::Result<Config> {
    use anyhow::Context;

    let mut loader = ConfigLoader::new().with_overrides(overrides);
    if let Some(path) = config_path {
        loader = loader.with_config_path(path);
    }
    let load = loader.load().context("loading sitelens configuration")?;
    Ok(load.into_config())
}
