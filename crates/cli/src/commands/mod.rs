pub mod config_cmd;
pub mod guard;
pub mod run;

use std::path::Path;
use taskpilot_config::{ConfigError, FlowConfig};

/// Load the configuration from `path`, or from the default location.
///
/// Environment overrides apply either way.
pub fn load_config(path: Option<&Path>) -> Result<FlowConfig, ConfigError> {
    match path {
        Some(path) => {
            let mut config = FlowConfig::load_from(path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            Ok(config)
        }
        None => FlowConfig::load(),
    }
}
