//! Configuration for the empire client and server.
//!
//! Settings persist to disk as RON files, with CLI overrides via clap and
//! forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Account, Config, DebugConfig, NetworkConfig, ReconnectSettings, ServerSettings, SessionConfig,
};
pub use error::ConfigError;
