//! Command line entry point.
//!
//! A thin `clap`-derived surface over [`crate::speaker::Speaker`]. It
//! contains no protocol logic of its own.

// SPDX-License-Identifier: AGPL-3.0-or-later

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bgpd", about = "An RFC 4271 BGP-4 speaker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a configuration file, start the speaker, and block.
    Run {
        /// Path to the TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
}
