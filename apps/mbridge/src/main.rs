// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use medbridge_server::cli::{Cli, Command};
use medbridge_server::config::Config;
use medbridge_server::{auth, logging, run};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Config => {
            println!("{}", toml::to_string_pretty(&Config::default())?);
            Ok(())
        }
        Command::HashPassword { password } => {
            println!("{}", auth::hash_password(&password));
            Ok(())
        }
        Command::Run => {
            let config = Config::load(cli.config.as_deref())
                .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
            let _log_guard = logging::init_logging(&config.log)
                .map_err(|e| anyhow::anyhow!("logging setup failed: {e}"))?;

            tracing::info!(
                server_id = %config.server.server_id,
                version = env!("CARGO_PKG_VERSION"),
                "starting mbridge"
            );

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(run(config))
        }
    }
}
