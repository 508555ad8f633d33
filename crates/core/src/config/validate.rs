use std::collections::HashSet;

use super::{types::Config, ConfigError};

/// Validate configuration before anything starts serving.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.pool.size == 0 {
        return Err(ConfigError::ValidationError(
            "pool.size must be at least 1".to_string(),
        ));
    }
    if config.listen_addr.is_empty() {
        return Err(ConfigError::ValidationError(
            "listen_addr cannot be empty".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for (i, pipeline) in config.pipelines.iter().enumerate() {
        if pipeline.name.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "pipelines[{}]: name is required",
                i
            )));
        }
        if !names.insert(pipeline.name.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "pipelines[{}]: duplicate name {:?}",
                i, pipeline.name
            )));
        }
        if pipeline.paths.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "pipeline {:?}: paths is required",
                pipeline.name
            )));
        }
        if pipeline.command.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "pipeline {:?}: command is required",
                pipeline.name
            )));
        }
        if pipeline.target.format.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "pipeline {:?}: target.format is required",
                pipeline.name
            )));
        }
    }

    Ok(())
}
