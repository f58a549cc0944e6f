//! Daemon core: one struct owns every piece of mutable state (listener,
//! connections, playlist, player state, transaction, worker channel) and
//! drives the reactor. Each ready source is handled to completion before the
//! next wait, which is the whole concurrency story: no locks, no handler
//! overlap.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use quaver_proto::{MsgKind, PlayState};

use crate::control::{Conn, Transaction};
use crate::player::PlayerState;
use crate::playlist::Playlist;
use crate::reactor::{Interest, Reactor, Readiness};
use crate::worker::{Worker, WorkerEvent};

pub struct Server {
    pub(crate) reactor: Reactor,
    pub(crate) listener: UnixListener,
    pub(crate) listener_fd: RawFd,
    pub(crate) conns: BTreeMap<RawFd, Conn>,
    pub(crate) playlist: Playlist,
    pub(crate) player: PlayerState,
    pub(crate) tx: Option<Transaction>,
    pub(crate) worker: Worker,
}

impl Server {
    pub fn new(listener: UnixListener, worker: Worker) -> Server {
        let listener_fd = listener.as_raw_fd();
        let mut reactor = Reactor::new();
        reactor.register(listener_fd, Interest::READ);
        reactor.register(worker.fd(), Interest::READ);
        Server {
            reactor,
            listener,
            listener_fd,
            conns: BTreeMap::new(),
            playlist: Playlist::new(),
            player: PlayerState::default(),
            tx: None,
            worker,
        }
    }

    /// Serve until a fatal error. Per-client failures never reach here; a
    /// dead worker does.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if let Err(e) = self.turn(None) {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    let status = self.worker.reap().unwrap_or_else(|| "unknown".into());
                    anyhow::bail!("player worker exited ({status})");
                }
                return Err(e).context("event loop");
            }
        }
    }

    /// One reactor cycle: wait, then handle everything that is ready.
    ///
    /// `timeout` bounds the wait; tests use it to step the loop.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let turn = self.reactor.wait(timeout)?;
        if turn.timer_fired {
            self.resume_accept();
        }
        for Readiness { fd, readable, writable } in turn.ready {
            if fd == self.listener_fd {
                if readable {
                    self.accept_ready();
                }
            } else if fd == self.worker.fd() {
                self.worker_event(readable, writable)?;
            } else {
                self.conn_event(fd, readable, writable)?;
            }
        }
        self.refresh_interests();
        Ok(())
    }

    /// Re-derive write interest from buffer occupancy after a batch of
    /// dispatches.
    fn refresh_interests(&mut self) {
        for (&fd, conn) in &self.conns {
            let want = if conn.channel.has_pending_output() {
                Interest::READ_WRITE
            } else {
                Interest::READ
            };
            if self.reactor.interest(fd) != Some(want) {
                self.reactor.modify(fd, want);
            }
        }
        let wfd = self.worker.fd();
        let want = if self.worker.has_pending_output() {
            Interest::READ_WRITE
        } else {
            Interest::READ
        };
        if self.reactor.interest(wfd) != Some(want) {
            self.reactor.modify(wfd, want);
        }
    }

    pub(crate) fn worker_event(&mut self, readable: bool, writable: bool) -> io::Result<()> {
        if writable {
            self.worker.flush()?;
        }
        if readable {
            for event in self.worker.handle_readable()? {
                match event {
                    WorkerEvent::Position { position, duration } => {
                        self.player.position = position;
                        self.player.duration = duration;
                    }
                    WorkerEvent::TrackDone => {
                        // A stale end-of-track can trail a STOP; only a
                        // playing track has somewhere to advance to.
                        if self.player.state == PlayState::Playing {
                            self.track_finished()?;
                        }
                    }
                    WorkerEvent::DecodeError(text) => {
                        tracing::warn!(error = %text, "player worker reported an error");
                        if self.player.state != PlayState::Stopped {
                            self.worker.stop()?;
                            self.player.state = PlayState::Stopped;
                            self.player.clear_track();
                            self.notify(MsgKind::Stop);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The current track played out: pick the next one per the mode flags.
    fn track_finished(&mut self) -> io::Result<()> {
        self.player.clear_track();

        if self.player.mode.repeat_one {
            if self.start_current_track()? {
                self.notify(MsgKind::Play);
            } else {
                self.notify(MsgKind::Stop);
            }
            return Ok(());
        }

        let mode = self.player.mode;
        if self.playlist.advance(mode.repeat_all, mode.consume) && self.start_current_track()? {
            self.notify(MsgKind::Next);
        } else {
            self.player.state = PlayState::Stopped;
            self.notify(MsgKind::Stop);
        }
        Ok(())
    }

    pub(crate) fn cmd_play(&mut self) -> io::Result<()> {
        match self.player.state {
            PlayState::Stopped => {
                self.resume_playback()?;
            }
            PlayState::Playing => {}
            PlayState::Paused => {
                self.worker.resume()?;
                self.player.state = PlayState::Playing;
            }
        }
        Ok(())
    }

    /// Returns the notification kind for the state actually entered.
    pub(crate) fn cmd_toggle_play(&mut self) -> io::Result<MsgKind> {
        match self.player.state {
            PlayState::Stopped => {
                self.resume_playback()?;
                Ok(MsgKind::Play)
            }
            PlayState::Playing => {
                self.worker.pause()?;
                self.player.state = PlayState::Paused;
                Ok(MsgKind::Pause)
            }
            PlayState::Paused => {
                self.worker.resume()?;
                self.player.state = PlayState::Playing;
                Ok(MsgKind::Play)
            }
        }
    }

    /// Returns whether anything happened (false: was not playing).
    pub(crate) fn cmd_pause(&mut self) -> io::Result<bool> {
        if self.player.state != PlayState::Playing {
            return Ok(false);
        }
        self.worker.pause()?;
        self.player.state = PlayState::Paused;
        Ok(true)
    }

    /// Returns whether anything happened (false: was already stopped).
    pub(crate) fn cmd_stop(&mut self) -> io::Result<bool> {
        if self.player.state == PlayState::Stopped {
            return Ok(false);
        }
        self.worker.stop()?;
        self.player.state = PlayState::Stopped;
        self.player.clear_track();
        Ok(true)
    }

    pub(crate) fn cmd_next(&mut self) -> io::Result<()> {
        self.worker.stop()?;
        self.player.clear_track();
        let mode = self.player.mode;
        if self.playlist.advance(mode.repeat_all, mode.consume) {
            self.start_current_track()?;
        } else {
            self.player.state = PlayState::Stopped;
        }
        Ok(())
    }

    pub(crate) fn cmd_prev(&mut self) -> io::Result<()> {
        self.worker.stop()?;
        self.player.clear_track();
        if self.playlist.previous(self.player.mode.repeat_all) {
            self.start_current_track()?;
        } else {
            self.player.state = PlayState::Stopped;
        }
        Ok(())
    }

    /// Restart playback at the cursor (JUMP landed on a track).
    pub(crate) fn cmd_restart_current(&mut self) -> io::Result<()> {
        self.worker.stop()?;
        self.player.clear_track();
        self.start_current_track()?;
        Ok(())
    }

    /// After a playlist swap the cursor may have gone away; playback cannot
    /// outlive it.
    pub(crate) fn reconcile_cursor_after_swap(&mut self) -> io::Result<()> {
        if self.player.state != PlayState::Stopped && self.playlist.cursor().is_none() {
            self.worker.stop()?;
            self.player.state = PlayState::Stopped;
            self.player.clear_track();
        }
        Ok(())
    }

    /// Start playing from the cursor, falling back to the head when unset.
    fn resume_playback(&mut self) -> io::Result<bool> {
        if !self.playlist.ensure_current() {
            self.player.state = PlayState::Stopped;
            return Ok(false);
        }
        self.start_current_track()
    }

    /// Open the current track and hand it to the worker. Unreadable tracks
    /// are skipped (advancing per the mode flags) for at most one pass over
    /// the list; an exhausted list lands in Stopped.
    fn start_current_track(&mut self) -> io::Result<bool> {
        let mut attempts = self.playlist.len();
        while attempts > 0 {
            let Some(path) = self.playlist.current().map(Path::to_path_buf) else {
                break;
            };
            match File::open(&path) {
                Ok(file) => {
                    self.player.clear_track();
                    self.worker.open_track(OwnedFd::from(file))?;
                    self.player.state = PlayState::Playing;
                    return Ok(true);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unplayable track");
                    let mode = self.player.mode;
                    if !self.playlist.advance(mode.repeat_all, mode.consume) {
                        break;
                    }
                    attempts -= 1;
                }
            }
        }
        self.player.state = PlayState::Stopped;
        self.player.clear_track();
        Ok(false)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::testutil::server;
    use quaver_proto::ModeFlags;
    use std::io::Write;

    fn track(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(b"not really flac").unwrap();
        path
    }

    fn worker_kinds(far: &mut crate::channel::Channel) -> Vec<MsgKind> {
        far.read_available().unwrap();
        let mut kinds = Vec::new();
        while let Some(msg) = far.next_message().unwrap() {
            kinds.push(msg.known_kind().unwrap());
        }
        kinds
    }

    #[test]
    fn play_with_empty_playlist_stays_stopped() {
        let (mut srv, mut far, _path, _dir) = server();
        srv.cmd_play().unwrap();
        assert_eq!(srv.player.state, PlayState::Stopped);
        assert!(worker_kinds(&mut far).is_empty());
    }

    #[test]
    fn play_opens_current_track_for_the_worker() {
        let (mut srv, mut far, _path, dir) = server();
        srv.playlist.enqueue(track(&dir, "a.flac"));
        srv.cmd_play().unwrap();

        assert_eq!(srv.player.state, PlayState::Playing);
        assert_eq!(srv.playlist.cursor(), Some(0));
        far.read_available().unwrap();
        let msg = far.next_message().unwrap().unwrap();
        assert_eq!(msg.known_kind(), Some(MsgKind::WorkerOpen));
        assert!(msg.fd.is_some());
    }

    #[test]
    fn pause_resume_roundtrip() {
        let (mut srv, mut far, _path, dir) = server();
        srv.playlist.enqueue(track(&dir, "a.flac"));
        srv.cmd_play().unwrap();
        assert!(srv.cmd_pause().unwrap());
        assert_eq!(srv.player.state, PlayState::Paused);
        // Pause while paused is a no-op.
        assert!(!srv.cmd_pause().unwrap());

        srv.cmd_play().unwrap();
        assert_eq!(srv.player.state, PlayState::Playing);
        assert_eq!(
            worker_kinds(&mut far),
            vec![MsgKind::WorkerOpen, MsgKind::WorkerPause, MsgKind::WorkerResume]
        );
    }

    #[test]
    fn toggle_twice_returns_to_the_same_state() {
        let (mut srv, _far, _path, dir) = server();
        srv.playlist.enqueue(track(&dir, "a.flac"));
        srv.cmd_play().unwrap();

        assert_eq!(srv.cmd_toggle_play().unwrap(), MsgKind::Pause);
        assert_eq!(srv.cmd_toggle_play().unwrap(), MsgKind::Play);
        assert_eq!(srv.player.state, PlayState::Playing);
    }

    #[test]
    fn stop_when_stopped_is_a_noop() {
        let (mut srv, mut far, _path, _dir) = server();
        assert!(!srv.cmd_stop().unwrap());
        assert!(worker_kinds(&mut far).is_empty());
    }

    #[test]
    fn unplayable_tracks_are_skipped() {
        let (mut srv, mut far, _path, dir) = server();
        srv.playlist.enqueue(dir.path().join("missing-1"));
        srv.playlist.enqueue(dir.path().join("missing-2"));
        srv.playlist.enqueue(track(&dir, "good.flac"));
        srv.cmd_play().unwrap();

        assert_eq!(srv.player.state, PlayState::Playing);
        assert_eq!(srv.playlist.cursor(), Some(2));
        assert_eq!(worker_kinds(&mut far), vec![MsgKind::WorkerOpen]);
    }

    #[test]
    fn all_tracks_unplayable_lands_stopped() {
        let (mut srv, mut far, _path, dir) = server();
        srv.playlist.enqueue(dir.path().join("missing-1"));
        srv.playlist.enqueue(dir.path().join("missing-2"));
        srv.cmd_play().unwrap();

        assert_eq!(srv.player.state, PlayState::Stopped);
        assert!(worker_kinds(&mut far).is_empty());
    }

    #[test]
    fn end_of_track_advances_and_repeats_per_mode() {
        let (mut srv, mut far, _path, dir) = server();
        srv.playlist.enqueue(track(&dir, "a.flac"));
        srv.playlist.enqueue(track(&dir, "b.flac"));
        srv.player.mode = ModeFlags { repeat_one: false, repeat_all: true, consume: false };
        srv.cmd_play().unwrap();

        srv.track_finished().unwrap();
        assert_eq!(srv.playlist.cursor(), Some(1));
        srv.track_finished().unwrap();
        // repeat_all wrapped back to the head.
        assert_eq!(srv.playlist.cursor(), Some(0));
        assert_eq!(srv.player.state, PlayState::Playing);
        assert_eq!(
            worker_kinds(&mut far),
            vec![MsgKind::WorkerOpen, MsgKind::WorkerOpen, MsgKind::WorkerOpen]
        );
    }

    #[test]
    fn end_of_track_with_repeat_one_stays_put() {
        let (mut srv, _far, _path, dir) = server();
        srv.playlist.enqueue(track(&dir, "a.flac"));
        srv.playlist.enqueue(track(&dir, "b.flac"));
        srv.player.mode.repeat_one = true;
        srv.cmd_play().unwrap();

        srv.track_finished().unwrap();
        assert_eq!(srv.playlist.cursor(), Some(0));
        assert_eq!(srv.player.state, PlayState::Playing);
    }

    #[test]
    fn end_of_track_consume_removes_played() {
        let (mut srv, _far, _path, dir) = server();
        let a = track(&dir, "a.flac");
        let b = track(&dir, "b.flac");
        srv.playlist.enqueue(a);
        srv.playlist.enqueue(b.clone());
        srv.player.mode.consume = true;
        srv.cmd_play().unwrap();

        srv.track_finished().unwrap();
        assert_eq!(srv.playlist.tracks(), &[b]);
        assert_eq!(srv.playlist.cursor(), Some(0));
    }

    #[test]
    fn playlist_exhaustion_stops() {
        let (mut srv, _far, _path, dir) = server();
        srv.playlist.enqueue(track(&dir, "a.flac"));
        srv.cmd_play().unwrap();

        srv.track_finished().unwrap();
        assert_eq!(srv.player.state, PlayState::Stopped);
        assert_eq!(srv.playlist.cursor(), None);
        assert_eq!(srv.playlist.len(), 1);
    }

    #[test]
    fn next_and_prev_move_the_cursor() {
        let (mut srv, mut far, _path, dir) = server();
        srv.playlist.enqueue(track(&dir, "a.flac"));
        srv.playlist.enqueue(track(&dir, "b.flac"));
        srv.cmd_play().unwrap();

        srv.cmd_next().unwrap();
        assert_eq!(srv.playlist.cursor(), Some(1));
        assert_eq!(srv.player.state, PlayState::Playing);

        srv.cmd_prev().unwrap();
        assert_eq!(srv.playlist.cursor(), Some(0));
        assert_eq!(srv.player.state, PlayState::Playing);

        let kinds = worker_kinds(&mut far);
        assert_eq!(
            kinds,
            vec![
                MsgKind::WorkerOpen,
                MsgKind::WorkerStop,
                MsgKind::WorkerOpen,
                MsgKind::WorkerStop,
                MsgKind::WorkerOpen,
            ]
        );
    }

    #[test]
    fn commit_swap_without_cursor_stops_playback() {
        let (mut srv, mut far, _path, dir) = server();
        srv.playlist.enqueue(track(&dir, "a.flac"));
        srv.cmd_play().unwrap();

        srv.playlist.replace_with(Playlist::new(), 0);
        srv.reconcile_cursor_after_swap().unwrap();
        assert_eq!(srv.player.state, PlayState::Stopped);
        assert_eq!(
            worker_kinds(&mut far),
            vec![MsgKind::WorkerOpen, MsgKind::WorkerStop]
        );
    }
}
