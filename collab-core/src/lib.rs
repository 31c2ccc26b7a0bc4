//! Application configuration and logging shared by the collab binaries

pub mod config;
pub mod logging;

pub use config::{load_config, Config, LoggingConfig};
pub use logging::init_logging;
