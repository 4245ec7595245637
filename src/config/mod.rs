mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Read, parse and validate one config file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load the first of `paths` that exists.
///
/// Missing files are skipped; a file that exists but does not load is an
/// error rather than a fall-through to the next candidate.
pub fn load_first<I, P>(paths: I) -> Result<Option<(PathBuf, Config)>, ConfigError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    for path in paths {
        let path = path.as_ref();
        if !path.is_file() {
            continue;
        }
        let config = load_config(path)?;
        return Ok(Some((path.to_path_buf(), config)));
    }
    Ok(None)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let health = &self.health;
        if health.stream_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "health.stream_buffer_size must be at least 1".into(),
            ));
        }
        if health.degraded_threshold_secs > health.unhealthy_threshold_secs {
            return Err(ConfigError::Invalid(format!(
                "health.degraded_threshold_secs ({}) exceeds health.unhealthy_threshold_secs ({})",
                health.degraded_threshold_secs, health.unhealthy_threshold_secs
            )));
        }
        if !(0.0..1.0).contains(&health.schema_change_reload_jitter) {
            return Err(ConfigError::Invalid(
                "health.schema_change_reload_jitter must be in [0, 1)".into(),
            ));
        }
        if health.signal_when_schema_change && health.schema_change_reload_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "health.schema_change_reload_interval_secs must be positive".into(),
            ));
        }
        if self.monitor.enabled && self.monitor.probe_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "monitor.probe_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
