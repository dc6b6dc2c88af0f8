pub mod config;
pub mod types;

pub use config::{RelayConfig, Settings};
pub use types::Cli;
