//! quaverd crate entry points.
//!
//! The daemon owns a playlist, a three-state player, and a framed-message
//! channel to the decoding worker; control clients drive it over a local
//! socket. Everything runs on one thread behind [`reactor::Reactor`].

/// Command-line argument definitions.
pub mod cli;
/// Configuration loading (defaults, TOML file, CLI overrides).
pub mod config;
/// Control socket, client connections, and command dispatch.
pub mod control;
/// The state-owning daemon core and its run loop.
pub mod server;

pub mod channel;
pub mod player;
pub mod playlist;
pub mod reactor;
pub mod worker;
