//! Command-line interface handling for the meridian launcher.
//!
//! Argument parsing is built with `clap`'s builder API; every option here
//! overrides the corresponding configuration-file setting.

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};

use crate::config::AppConfig;

/// Which cluster role this process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dispatcher,
    Server,
    Gate,
}

/// Parsed command line arguments.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// The selected role subcommand.
    pub role: Role,
    /// Path to the configuration file.
    pub config_path: PathBuf,
    /// Optional override for the dispatcher listen/dial address.
    pub dispatcher_addr: Option<String>,
    /// Optional override for the server id.
    pub server_id: Option<u16>,
    /// Optional override for the gate id.
    pub gate_id: Option<u16>,
    /// Optional override for the log level.
    pub log_level: Option<String>,
    /// Whether to force JSON log output.
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses command line arguments.
    pub fn parse() -> Self {
        let matches = Command::new("Meridian")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Distributed entity server framework")
            .subcommand_required(true)
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .global(true)
                    .default_value("meridian.toml"),
            )
            .arg(
                Arg::new("dispatcher-addr")
                    .short('d')
                    .long("dispatcher-addr")
                    .value_name("ADDRESS")
                    .help("Dispatcher address (listen for the dispatcher role, dial otherwise)")
                    .global(true),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)")
                    .global(true),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .global(true)
                    .action(ArgAction::SetTrue),
            )
            .subcommand(Command::new("dispatcher").about("Run the cluster dispatcher"))
            .subcommand(
                Command::new("server").about("Run an entity server").arg(
                    Arg::new("server-id")
                        .long("server-id")
                        .value_name("ID")
                        .help("This server's stable numeric id")
                        .value_parser(clap::value_parser!(u16)),
                ),
            )
            .subcommand(
                Command::new("gate").about("Run a client gate").arg(
                    Arg::new("gate-id")
                        .long("gate-id")
                        .value_name("ID")
                        .help("This gate's stable numeric id")
                        .value_parser(clap::value_parser!(u16)),
                ),
            )
            .get_matches();

        let (role, sub) = match matches.subcommand() {
            Some(("dispatcher", sub)) => (Role::Dispatcher, sub),
            Some(("server", sub)) => (Role::Server, sub),
            Some(("gate", sub)) => (Role::Gate, sub),
            _ => unreachable!("subcommand_required"),
        };

        Self {
            role,
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .expect("default config path is always set"),
            ),
            dispatcher_addr: matches.get_one::<String>("dispatcher-addr").cloned(),
            server_id: sub.get_one::<u16>("server-id").copied(),
            gate_id: sub.get_one::<u16>("gate-id").copied(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }

    /// Applies CLI overrides onto a loaded configuration.
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(addr) = &self.dispatcher_addr {
            config.dispatcher.address = addr.clone();
        }
        if let Some(id) = self.server_id {
            config.server.id = id;
        }
        if let Some(id) = self.gate_id {
            config.gate.id = id;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}
