use figment::{
    providers::{Format, Toml},
    Figment,
};
use std::path::{Path, PathBuf};

use super::{types::Config, ConfigError};

/// Load configuration from file, then apply `REFINERY_*` environment
/// variable overrides.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let mut config: Config = Figment::new()
        .merge(Toml::file(path))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a TOML string (useful for testing).
/// Environment overrides are not applied.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Non-empty `REFINERY_LISTEN`, `REFINERY_DB` and
/// `REFINERY_TRUSTED_CIDRS` override the corresponding config fields.
fn apply_env_overrides(config: &mut Config) {
    if let Some(v) = non_empty_env("REFINERY_LISTEN") {
        config.listen_addr = v;
    }
    if let Some(v) = non_empty_env("REFINERY_DB") {
        config.db_path = PathBuf::from(v);
    }
    if let Some(v) = non_empty_env("REFINERY_TRUSTED_CIDRS") {
        config.trusted_cidrs = v;
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
