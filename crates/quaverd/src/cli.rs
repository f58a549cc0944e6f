//! Command-line interface definitions.
//!
//! This module contains the `clap`-powered argument surface and nothing
//! else, so the rest of the crate stays reusable from tests.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "quaverd")]
pub struct Args {
    /// Control socket path (overrides the config file)
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Player worker command, whitespace-split (overrides the config file)
    #[arg(long)]
    pub worker: Option<String>,

    /// Configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,
}
