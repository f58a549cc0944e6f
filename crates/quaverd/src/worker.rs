//! Channel to the player worker subprocess.
//!
//! The worker owns the decoders and the output device; the daemon only tells
//! it what to do: open a track (the file arrives as a passed descriptor),
//! resume, pause, stop. The worker reports playback position, end-of-track,
//! and decode errors back over the same framed channel.
//!
//! The daemon spawns the configured worker command with its socketpair end
//! inherited; the descriptor number is published in [`WORKER_FD_ENV`].

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command};

use anyhow::{Context, Result, bail};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use quaver_proto::{MsgKind, PositionRecord};

use crate::channel::{Channel, ReadOutcome};

/// Environment variable carrying the worker's socketpair descriptor number.
pub const WORKER_FD_ENV: &str = "QUAVER_WORKER_FD";

/// One event reported by the worker.
#[derive(Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Progress report: seconds played and total duration.
    Position { position: i64, duration: i64 },
    /// The current track played to its end.
    TrackDone,
    /// The current track could not be decoded further.
    DecodeError(String),
}

pub struct Worker {
    channel: Channel,
    child: Option<Child>,
}

impl Worker {
    /// Create the socketpair and spawn `command` (whitespace-split, no shell)
    /// with the far end inherited.
    pub fn spawn(command: &str) -> Result<Worker> {
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            bail!("empty player worker command");
        };

        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .context("socketpair for player worker")?;

        // The worker's end must survive exec.
        fcntl(theirs.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))
            .context("clear close-on-exec on worker descriptor")?;

        let child = Command::new(program)
            .args(parts)
            .env(WORKER_FD_ENV, theirs.as_raw_fd().to_string())
            .spawn()
            .with_context(|| format!("spawn player worker {program:?}"))?;
        drop(theirs);

        let channel = Channel::new(UnixStream::from(ours)).context("worker channel")?;
        Ok(Worker { channel, child: Some(child) })
    }

    /// Wrap an already-connected stream; used by tests to stand in for a
    /// spawned worker.
    pub fn from_stream(stream: UnixStream) -> io::Result<Worker> {
        Ok(Worker { channel: Channel::new(stream)?, child: None })
    }

    pub fn fd(&self) -> RawFd {
        self.channel.as_raw_fd()
    }

    /// Hand the worker an open track file and start decoding it.
    pub fn open_track(&mut self, file: OwnedFd) -> io::Result<()> {
        self.send(MsgKind::WorkerOpen, Some(file))
    }

    pub fn resume(&mut self) -> io::Result<()> {
        self.send(MsgKind::WorkerResume, None)
    }

    pub fn pause(&mut self) -> io::Result<()> {
        self.send(MsgKind::WorkerPause, None)
    }

    pub fn stop(&mut self) -> io::Result<()> {
        self.send(MsgKind::WorkerStop, None)
    }

    /// Forward a seek record verbatim.
    pub fn seek(&mut self, payload: &[u8]) -> io::Result<()> {
        self.channel
            .compose(MsgKind::Seek, std::process::id(), None, payload)?;
        self.channel.flush()
    }

    fn send(&mut self, kind: MsgKind, fd: Option<OwnedFd>) -> io::Result<()> {
        self.channel.compose(kind, std::process::id(), fd, &[])?;
        self.channel.flush()
    }

    pub fn has_pending_output(&self) -> bool {
        self.channel.has_pending_output()
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.channel.flush()
    }

    /// Drain the channel and parse every complete event.
    ///
    /// Channel EOF means the worker died; that is unrecoverable for the
    /// daemon and surfaces as an error here.
    pub fn handle_readable(&mut self) -> io::Result<Vec<WorkerEvent>> {
        if self.channel.read_available()? == ReadOutcome::Eof {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "player worker closed its channel",
            ));
        }

        let mut events = Vec::new();
        while let Some(msg) = self.channel.next_message()? {
            match msg.known_kind() {
                Some(MsgKind::WorkerPosition) => {
                    let rec = PositionRecord::decode(&msg.payload)?;
                    events.push(WorkerEvent::Position {
                        position: rec.position,
                        duration: rec.duration,
                    });
                }
                Some(MsgKind::WorkerEof) => events.push(WorkerEvent::TrackDone),
                Some(MsgKind::WorkerError) => {
                    events.push(WorkerEvent::DecodeError(
                        String::from_utf8_lossy(&msg.payload).into_owned(),
                    ));
                }
                _ => {
                    tracing::debug!(kind = msg.kind, "ignoring unexpected worker message");
                }
            }
        }
        Ok(events)
    }

    /// Reap the spawned child, if any, returning a printable exit status.
    pub fn reap(&mut self) -> Option<String> {
        let mut child = self.child.take()?;
        match child.wait() {
            Ok(status) => Some(status.to_string()),
            Err(e) => Some(format!("wait failed: {e}")),
        }
    }
}
