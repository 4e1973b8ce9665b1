//! Configuration for the volume store tools.
//!
//! Settings persist to disk as RON files and can be overridden from the
//! command line via clap. Unknown fields are ignored and missing sections fall
//! back to defaults, so older config files keep loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{AttributeConfig, Config, DebugConfig, ReplayConfig, TreeConfig};
pub use error::ConfigError;
