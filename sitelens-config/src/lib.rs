//! # sitelens-config
//!
//! Resolves the effective [`Config`] for a sitelens process. Sources are
//! consulted in a fixed order: an explicit path, `SITELENS_CONFIG_PATH`,
//! inline `SITELENS_CONFIG_JSON`, the first default file that exists, and
//! finally built-in defaults. Environment and CLI overrides are applied on
//! top, then the scan settings are validated.

pub mod loader;
pub mod models;
pub mod sources;

pub use loader::{
    ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions, load_with_overrides,
};
pub use models::{
    CliOverrides, Config, ConfigMetadata, ConfigSource, ConfigWarning, ServerConfig,
};
pub use sources::{EnvConfig, FileConfig};
