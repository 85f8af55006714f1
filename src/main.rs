//! `bgpd` binary entry point: a thin driver over [`bgp_speaker::Speaker`].

// SPDX-License-Identifier: AGPL-3.0-or-later

use bgp_speaker::cli::{Cli, Command};
use bgp_speaker::config::Config;
use bgp_speaker::Speaker;
use clap::Parser;

fn setup_logger() {
    let config = simplelog::ConfigBuilder::new().set_time_format_rfc3339().build();
    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        config,
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )
    .expect("failed to initialize logger");
}

#[tokio::main]
async fn main() {
    setup_logger();
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => {
            let config = match Config::load(&config) {
                Ok(config) => config,
                Err(e) => {
                    log::error!("failed to load configuration: {e}");
                    std::process::exit(1);
                }
            };
            let speaker = Speaker::new(&config);
            if let Err(e) = speaker.run().await {
                log::error!("speaker exited: {e}");
                std::process::exit(1);
            }
        }
    }
}
