//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Netplay peer command-line arguments.
///
/// Values given here override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "netplay-host", about = "Host or join a netplay session")]
pub struct CliArgs {
    /// Host a new session.
    #[arg(long, conflicts_with = "join")]
    pub host: bool,

    /// Join the session at `host[:port]`, `ipv6` or `[ipv6]:port`.
    #[arg(long, value_name = "ADDR")]
    pub join: Option<String>,

    /// Player name.
    #[arg(long)]
    pub name: Option<String>,

    /// Game port (listen port when hosting).
    #[arg(long)]
    pub port: Option<u16>,

    /// Session password.
    #[arg(long)]
    pub password: Option<String>,

    /// Map offered to joiners when hosting, relative to the data directory.
    #[arg(long, value_name = "FILE")]
    pub map: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// Address to join, with the configured game port filled in when none is given.
    pub fn join_address(&self, config: &Config) -> Option<String> {
        let port = config.network.game_port;
        self.join.as_ref().map(|addr| {
            if has_port(addr) {
                addr.clone()
            } else if addr.contains(':') && !addr.starts_with('[') {
                format!("[{addr}]:{port}")
            } else {
                format!("{addr}:{port}")
            }
        })
    }
}

/// Whether `addr` ends in `:port`. A bare IPv6 address never does.
fn has_port(addr: &str) -> bool {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return false;
    };
    let bracketed = host.starts_with('[') && host.ends_with(']');
    (bracketed || !host.contains(':')) && port.parse::<u16>().is_ok()
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref name) = args.name {
            self.player.name = name.clone();
        }
        if let Some(port) = args.port {
            self.network.game_port = port;
        }
        if let Some(ref password) = args.password {
            self.player.password = password.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
