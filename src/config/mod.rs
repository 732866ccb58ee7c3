//! Configuration: settings file and application paths

mod loading;
mod paths;

pub use loading::LoadingConfig;
pub use paths::{config_file, data_file, ensure_dirs, PathConfig};

/// Settings file name
pub const CONFIG_FILE: &str = "stemdeck.json";
/// Default log file name
pub const LOG_FILE: &str = "stemdeck.log";
