// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "mbridge",
    version,
    about = "Medbridge healthcare integration engine",
    long_about = "Runs the channel runtime: ingests clinical messages over TCP/MLLP, \
                  applies per-channel filter/transform/routing scripts, and fans them \
                  out to downstream systems with durable queues and retries."
)]
pub struct Cli {
    /// Path to the server configuration file (default: ./mbridge.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the engine (the default when no subcommand is given)
    Run,
    /// Print the default configuration as TOML
    Config,
    /// Hash a password for a user record
    HashPassword {
        password: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_run() {
        let cli = Cli::parse_from(["mbridge"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_config_flag_and_subcommand() {
        let cli = Cli::parse_from(["mbridge", "--config", "/etc/mbridge.toml", "run"]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/etc/mbridge.toml")));
        assert!(matches!(cli.command, Some(Command::Run)));
    }

    #[test]
    fn test_hash_password_subcommand() {
        let cli = Cli::parse_from(["mbridge", "hash-password", "hunter2"]);
        match cli.command {
            Some(Command::HashPassword { password }) => assert_eq!(password, "hunter2"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
