//! Daemon configuration: built-in defaults, an optional TOML file, and CLI
//! overrides, in ascending priority.

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::Args;

/// Worker command used when neither flag nor file names one.
const DEFAULT_WORKER: &str = "quaver-player";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    socket: Option<PathBuf>,
    worker: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub socket_path: PathBuf,
    pub worker_command: String,
}

impl Config {
    pub fn load(args: &Args) -> Result<Config> {
        let file = match &args.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                toml::from_str::<FileConfig>(&text)
                    .with_context(|| format!("parse config {}", path.display()))?
            }
            None => FileConfig::default(),
        };

        Ok(Config {
            socket_path: args
                .socket
                .clone()
                .or(file.socket)
                .unwrap_or_else(default_socket_path),
            worker_command: args
                .worker
                .clone()
                .or(file.worker)
                .unwrap_or_else(|| DEFAULT_WORKER.to_string()),
        })
    }
}

/// Per-user default: the runtime dir when the session provides one, else a
/// uid-suffixed name under the system temp dir.
fn default_socket_path() -> PathBuf {
    if let Some(dir) = env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("quaverd.sock");
    }
    let uid = nix::unistd::Uid::current();
    env::temp_dir().join(format!("quaverd-{uid}"))
}
