//! # Meridian Launcher
//!
//! The process entry point for all three cluster roles. One binary, one
//! config file; the subcommand picks whether this process runs as the
//! dispatcher, an entity server, or a gate.

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod signals;

pub use app::run;
pub use cli::{CliArgs, Role};
pub use config::AppConfig;
