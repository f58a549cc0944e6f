//! quaverd: control daemon for a privilege-separated music player.
//!
//! The daemon is the authority over one playlist and one playback state
//! machine. Clients connect over a local socket and submit framed commands;
//! audio decoding happens in a separate worker process that receives opened
//! track files over a socketpair and reports progress back.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use quaverd::config::Config;
use quaverd::server::Server;
use quaverd::worker::Worker;
use quaverd::{cli, control};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,quaverd=info")),
        )
        .init();

    let cfg = Config::load(&args)?;

    let listener = control::bind_control_socket(&cfg.socket_path)?;
    tracing::info!(socket = %cfg.socket_path.display(), "listening");

    let worker = Worker::spawn(&cfg.worker_command)?;
    tracing::info!(command = %cfg.worker_command, "player worker started");

    // Don't leave the socket behind on an interrupt.
    let socket_for_signal = cfg.socket_path.clone();
    let _ = ctrlc::set_handler(move || {
        let _ = std::fs::remove_file(&socket_for_signal);
        std::process::exit(130);
    });

    let mut server = Server::new(listener, worker);
    let result = server.run();
    let _ = std::fs::remove_file(&cfg.socket_path);
    result
}
