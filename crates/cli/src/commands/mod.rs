pub mod check;
pub mod init;
pub mod run;

use cadenza_config::{AppConfig, ConfigError};
use std::path::Path;

/// Load `name` from `config_dir`, or the defaults when no name is given.
pub fn load_config(config_dir: &Path, name: Option<&str>) -> Result<AppConfig, ConfigError> {
    match name {
        Some(name) => AppConfig::load_named(config_dir, name),
        None => Ok(AppConfig {
            config_dir: config_dir.to_path_buf(),
            ..AppConfig::default()
        }),
    }
}
