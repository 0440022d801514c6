//! Configuration for netplay peers.
//!
//! Settings persist as `config.ron` in the user's config directory. Command-line
//! flags override whatever was loaded.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, DebugConfig, NetworkConfig, PlayerConfig, SessionSettings, default_config_dir,
};
pub use error::ConfigError;
