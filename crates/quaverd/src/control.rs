//! Control socket: listener setup, client connections, command dispatch.
//!
//! Every accepted client speaks the framed protocol from `quaver-proto`.
//! Commands mutate the playlist and the player state machine, forward to the
//! player worker, and fan notifications out to monitor-subscribed clients.
//! A single playlist-replace transaction may be in flight at a time, bound
//! to the connection that opened it.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::socket::{AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind, listen, socket};
use nix::sys::stat::{Mode, umask};
use quaver_proto::{self as proto, ModeRecord, MsgKind, PlayState, SeekRecord, ShowEntry};

use crate::channel::{Channel, Message, ReadOutcome};
use crate::playlist::Playlist;
use crate::reactor::Interest;
use crate::server::Server;

/// Listen backlog on the control socket.
const CONTROL_BACKLOG: i32 = 5;

/// How long to keep the listener parked after running out of descriptors.
const ACCEPT_RETRY: Duration = Duration::from_secs(1);

/// One accepted control client.
pub struct Conn {
    pub(crate) channel: Channel,
    /// Set by the MONITOR command; grants broadcast notifications.
    pub(crate) monitor: bool,
    /// Sender PID as last claimed in a frame header.
    pub(crate) pid: Option<u32>,
}

/// The in-flight playlist-replace transaction, bound to one connection.
pub(crate) struct Transaction {
    pub(crate) owner: RawFd,
    pub(crate) staging: Playlist,
}

/// Create the control socket at `path`: remove any stale entry, bind with a
/// mask that keeps the inode group-accessible at most, chmod to 0660, and
/// listen without blocking.
pub fn bind_control_socket(path: &Path) -> Result<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("remove stale socket {}", path.display()));
        }
    }

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("create control socket")?;
    let addr = UnixAddr::new(path).context("control socket address")?;

    let old_umask = umask(Mode::from_bits_truncate(0o117));
    let bound = bind(fd.as_raw_fd(), &addr);
    umask(old_umask);
    bound.with_context(|| format!("bind {}", path.display()))?;

    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o660)) {
        let _ = fs::remove_file(path);
        return Err(e).with_context(|| format!("chmod {}", path.display()));
    }
    let backlog = Backlog::new(CONTROL_BACKLOG).context("listen backlog")?;
    if let Err(e) = listen(&fd, backlog) {
        let _ = fs::remove_file(path);
        return Err(e).with_context(|| format!("listen on {}", path.display()));
    }

    Ok(UnixListener::from(fd))
}

impl Server {
    /// Accept one connection per readiness event.
    pub(crate) fn accept_ready(&mut self) {
        match self.listener.accept() {
            Ok((stream, _addr)) => {
                let channel = match Channel::new(stream) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping fresh connection");
                        return;
                    }
                };
                let fd = channel.as_raw_fd();
                self.conns.insert(fd, Conn { channel, monitor: false, pid: None });
                self.reactor.register(fd, Interest::READ);
                tracing::debug!(fd, "client connected");
            }
            Err(e) => self.accept_failed(e),
        }
    }

    /// Handle an accept failure; descriptor exhaustion parks the listener
    /// until the retry timer fires or a connection closes.
    pub(crate) fn accept_failed(&mut self, err: io::Error) {
        if is_fd_exhaustion(&err) {
            tracing::warn!(error = %err, "out of descriptors, pausing accept");
            self.reactor.unregister(self.listener_fd);
            self.reactor.schedule_timer(ACCEPT_RETRY);
            return;
        }
        match err.kind() {
            io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted => {}
            _ => tracing::warn!(error = %err, "accept failed"),
        }
    }

    /// Re-register the parked listener (retry timer fired).
    pub(crate) fn resume_accept(&mut self) {
        self.reactor.register(self.listener_fd, Interest::READ);
    }

    /// Tear a connection down: abort its transaction, drop the socket, and
    /// un-park the listener if it was waiting for a free descriptor.
    pub(crate) fn close_conn(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.remove(&fd) else {
            return;
        };
        if self.tx.as_ref().is_some_and(|t| t.owner == fd) {
            tracing::debug!(fd, "aborting transaction of closed connection");
            self.tx = None;
        }
        self.reactor.unregister(fd);
        tracing::debug!(fd, pid = conn.pid, "client disconnected");
        drop(conn);

        // A descriptor is available again.
        if self.reactor.timer_pending() {
            self.reactor.cancel_timer();
            self.resume_accept();
        }
    }

    /// Handle readiness on one client connection.
    pub(crate) fn conn_event(&mut self, fd: RawFd, readable: bool, writable: bool) -> io::Result<()> {
        if readable {
            let eof = match self.conns.get_mut(&fd).map(|c| c.channel.read_available()) {
                None => return Ok(()),
                Some(Ok(ReadOutcome::Drained)) => false,
                Some(Ok(ReadOutcome::Eof)) => true,
                Some(Err(e)) => {
                    tracing::warn!(fd, error = %e, "read error");
                    self.close_conn(fd);
                    return Ok(());
                }
            };

            // Dispatch whatever arrived before a hangup, then close.
            loop {
                let next = match self.conns.get_mut(&fd) {
                    Some(c) => c.channel.next_message(),
                    None => break,
                };
                match next {
                    Ok(Some(msg)) => self.dispatch(fd, msg)?,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(fd, error = %e, "protocol error");
                        self.close_conn(fd);
                        return Ok(());
                    }
                }
            }

            if eof {
                self.close_conn(fd);
                return Ok(());
            }
        }

        if writable {
            if let Some(c) = self.conns.get_mut(&fd) {
                if let Err(e) = c.channel.flush() {
                    tracing::warn!(fd, error = %e, "write error");
                    self.close_conn(fd);
                }
            }
        }
        Ok(())
    }

    /// Validate and execute one inbound command.
    ///
    /// Errors are fatal to the daemon only when the worker channel breaks;
    /// per-command protocol violations are answered with an error frame and
    /// the connection stays open.
    pub(crate) fn dispatch(&mut self, fd: RawFd, msg: Message) -> io::Result<()> {
        if msg.pid != 0 {
            if let Some(conn) = self.conns.get_mut(&fd) {
                conn.pid = Some(msg.pid);
            }
        }
        let Some(kind) = msg.known_kind() else {
            tracing::debug!(fd, kind = msg.kind, "ignoring unknown message type");
            return Ok(());
        };
        tracing::debug!(fd, ?kind, "dispatch");

        match kind {
            MsgKind::Play => {
                self.cmd_play()?;
                self.notify(MsgKind::Play);
            }
            MsgKind::TogglePlay => {
                let entered = self.cmd_toggle_play()?;
                self.notify(entered);
            }
            MsgKind::Pause => {
                if self.cmd_pause()? {
                    self.notify(MsgKind::Pause);
                }
            }
            MsgKind::Stop => {
                if self.cmd_stop()? {
                    self.notify(MsgKind::Stop);
                }
            }
            MsgKind::Flush => {
                let stopped = self.player.state == PlayState::Stopped;
                self.playlist.truncate(stopped);
                self.notify(MsgKind::Commit);
            }
            MsgKind::Show => self.send_playlist(fd),
            MsgKind::Status => self.send_status(fd),
            MsgKind::Next => {
                self.cmd_next()?;
                self.notify(MsgKind::Next);
            }
            MsgKind::Prev => {
                self.cmd_prev()?;
                self.notify(MsgKind::Prev);
            }
            MsgKind::Jump => match proto::decode_path_record(&msg.payload) {
                Ok(target) => {
                    if self.playlist.jump_to(&target).is_some() {
                        self.cmd_restart_current()?;
                        self.notify(MsgKind::Jump);
                    } else {
                        self.reply_error(fd, "not found");
                    }
                }
                Err(_) => {
                    self.reply_error(fd, payload_error(proto::PATH_RECORD_LEN, &msg.payload));
                }
            },
            MsgKind::Mode => match ModeRecord::decode(&msg.payload) {
                Ok(rec) => {
                    self.player.apply_mode(&rec);
                    self.notify(MsgKind::Mode);
                }
                Err(_) => {
                    self.reply_error(fd, payload_error(proto::MODE_RECORD_LEN, &msg.payload));
                }
            },
            MsgKind::Seek => match SeekRecord::decode(&msg.payload) {
                Ok(_) => {
                    // No decoder to steer while stopped.
                    if self.player.state != PlayState::Stopped {
                        self.worker.seek(&msg.payload)?;
                        self.notify(MsgKind::Seek);
                    }
                }
                Err(_) => {
                    self.reply_error(fd, payload_error(proto::SEEK_RECORD_LEN, &msg.payload));
                }
            },
            MsgKind::Begin => {
                if self.tx.is_some() {
                    self.reply_error(fd, "locked");
                } else {
                    self.tx = Some(Transaction { owner: fd, staging: Playlist::new() });
                    self.reply(fd, MsgKind::Begin, &[]);
                }
            }
            MsgKind::Add => match proto::decode_path_record(&msg.payload) {
                Ok(path) if !path.as_os_str().is_empty() => {
                    let owns = self.tx.as_ref().map(|t| t.owner == fd);
                    match owns {
                        Some(false) => self.reply_error(fd, "locked"),
                        Some(true) => {
                            if let Some(t) = self.tx.as_mut() {
                                t.staging.enqueue(path);
                            }
                            self.reply(fd, MsgKind::Add, &msg.payload);
                        }
                        None => {
                            self.playlist.enqueue(path);
                            self.reply(fd, MsgKind::Add, &msg.payload);
                            self.notify(MsgKind::Add);
                        }
                    }
                }
                Ok(_) => self.reply_error(fd, "empty path"),
                Err(_) => {
                    self.reply_error(fd, payload_error(proto::PATH_RECORD_LEN, &msg.payload));
                }
            },
            MsgKind::Commit => {
                if !self.tx.as_ref().is_some_and(|t| t.owner == fd) {
                    self.reply_error(fd, "locked");
                } else {
                    match proto::decode_commit_offset(&msg.payload) {
                        Ok(offset) => {
                            if let Some(tx) = self.tx.take() {
                                self.playlist.replace_with(tx.staging, offset);
                            }
                            self.reconcile_cursor_after_swap()?;
                            self.reply(fd, MsgKind::Commit, &[]);
                            self.notify(MsgKind::Commit);
                        }
                        Err(_) => {
                            self.reply_error(
                                fd,
                                payload_error(proto::OFFSET_RECORD_LEN, &msg.payload),
                            );
                        }
                    }
                }
            }
            MsgKind::Monitor => {
                if let Some(conn) = self.conns.get_mut(&fd) {
                    conn.monitor = true;
                }
            }
            MsgKind::Error
            | MsgKind::WorkerOpen
            | MsgKind::WorkerResume
            | MsgKind::WorkerPause
            | MsgKind::WorkerStop
            | MsgKind::WorkerPosition
            | MsgKind::WorkerEof
            | MsgKind::WorkerError => self.reply_error(fd, "unexpected command"),
        }
        Ok(())
    }

    /// Stream the playlist back on `fd`, one entry per frame, closed by an
    /// empty frame.
    fn send_playlist(&mut self, fd: RawFd) {
        let cursor = self.playlist.cursor();
        let mut frames = Vec::with_capacity(self.playlist.len() + 1);
        for (i, track) in self.playlist.tracks().iter().enumerate() {
            let entry = ShowEntry { path: track.clone(), current: Some(i) == cursor };
            match entry.encode() {
                Ok(buf) => frames.push(buf),
                Err(e) => {
                    tracing::warn!(path = %track.display(), error = %e, "skipping playlist entry")
                }
            }
        }
        for buf in &frames {
            self.reply(fd, MsgKind::Show, buf);
        }
        self.reply(fd, MsgKind::Show, &[]);
    }

    fn send_status(&mut self, fd: RawFd) {
        let current = self.playlist.current().map(Path::to_path_buf);
        match self.player.status(self.playlist.cursor(), current).encode() {
            Ok(buf) => self.reply(fd, MsgKind::Status, &buf),
            Err(e) => {
                tracing::warn!(error = %e, "cannot encode status");
                self.reply_error(fd, "status unavailable");
            }
        }
    }

    /// Queue a reply frame on one connection. Compose failures only drop
    /// the frame; the connection's fate is decided on its next write.
    pub(crate) fn reply(&mut self, fd: RawFd, kind: MsgKind, payload: &[u8]) {
        let pid = std::process::id();
        if let Some(conn) = self.conns.get_mut(&fd) {
            if let Err(e) = conn.channel.compose(kind, pid, None, payload) {
                tracing::warn!(fd, error = %e, "dropping reply");
            }
        }
    }

    pub(crate) fn reply_error(&mut self, fd: RawFd, text: &str) {
        tracing::debug!(fd, text, "command rejected");
        self.reply(fd, MsgKind::Error, text.as_bytes());
    }

    /// Broadcast a notification to every monitor-subscribed connection.
    pub(crate) fn notify(&mut self, kind: MsgKind) {
        let payload = self.player.event(kind).encode();
        let pid = std::process::id();
        for (&fd, conn) in self.conns.iter_mut() {
            if !conn.monitor {
                continue;
            }
            if let Err(e) = conn.channel.compose(MsgKind::Monitor, pid, None, &payload) {
                tracing::debug!(fd, error = %e, "notification dropped");
            }
        }
    }
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == nix::libc::EMFILE || code == nix::libc::ENFILE
    )
}

/// Pick the error-frame text for a rejected payload.
fn payload_error(expected: usize, payload: &[u8]) -> &'static str {
    if payload.len() != expected { "wrong size" } else { "malformed payload" }
}
