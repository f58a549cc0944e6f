//! Poll-driven readiness dispatcher.
//!
//! The daemon is single-threaded: one [`Reactor`] tracks every descriptor of
//! interest plus a single one-shot timer, and each [`Reactor::wait`] call
//! returns the sources that are ready. The caller (the server loop) owns all
//! mutable state and handles each ready source to completion before waiting
//! again, so no two handlers ever run concurrently.
//!
//! Readiness is level-triggered (plain poll(2)): a source stays ready until
//! it is drained, so handlers that stop at EAGAIN never lose events.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

/// Readiness interest for one registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Interest = Interest { readable: true, writable: false };
    pub const READ_WRITE: Interest = Interest { readable: true, writable: true };

    fn poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.readable {
            flags |= PollFlags::POLLIN;
        }
        if self.writable {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// One ready descriptor, as reported by [`Reactor::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// The outcome of one wait: ready descriptors plus whether the one-shot
/// timer elapsed.
#[derive(Debug, Default)]
pub struct Turn {
    pub ready: Vec<Readiness>,
    pub timer_fired: bool,
}

#[derive(Debug, Default)]
pub struct Reactor {
    entries: BTreeMap<RawFd, Interest>,
    timer: Option<Instant>,
}

impl Reactor {
    pub fn new() -> Reactor {
        Reactor::default()
    }

    /// Start watching `fd`. Registering an already-watched descriptor
    /// replaces its interest set.
    pub fn register(&mut self, fd: RawFd, interest: Interest) {
        self.entries.insert(fd, interest);
    }

    /// Change the interest set of a watched descriptor.
    pub fn modify(&mut self, fd: RawFd, interest: Interest) {
        self.entries.insert(fd, interest);
    }

    /// Stop watching `fd`. Must be called before the descriptor is closed.
    pub fn unregister(&mut self, fd: RawFd) {
        self.entries.remove(&fd);
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.entries.get(&fd).copied()
    }

    /// Arm the one-shot timer to elapse `after` from now, replacing any
    /// previously scheduled timer.
    pub fn schedule_timer(&mut self, after: Duration) {
        self.timer = Some(Instant::now() + after);
    }

    pub fn cancel_timer(&mut self) {
        self.timer = None;
    }

    /// True iff a scheduled timer has neither fired nor been cancelled.
    pub fn timer_pending(&self) -> bool {
        self.timer.is_some()
    }

    /// Wait for readiness or timer expiry.
    ///
    /// `timeout` bounds the wait independently of the timer; `None` waits
    /// until something happens. An interrupted poll returns an empty turn.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Turn> {
        let now = Instant::now();
        let deadline = match (self.timer, timeout.map(|t| now + t)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };
        let poll_timeout = match deadline {
            Some(d) => {
                let nanos = d.saturating_duration_since(now).as_nanos();
                let ms = (nanos + 999_999) / 1_000_000;
                PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
            }
            None => PollTimeout::NONE,
        };

        // A registered descriptor is owned by the caller and stays open until
        // it is unregistered, so borrowing it for the duration of one poll
        // call is sound.
        let mut fds: Vec<PollFd> = self
            .entries
            .iter()
            .map(|(&fd, &interest)| {
                PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, interest.poll_flags())
            })
            .collect();

        let mut turn = Turn::default();
        match poll(&mut fds, poll_timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(turn),
            Err(e) => return Err(io::Error::from(e)),
        }

        // `fds` was built from `entries` in iteration order, so zipping the
        // two walks matching pairs.
        for (pfd, &fd) in fds.iter().zip(self.entries.keys()) {
            let revents = pfd.revents().unwrap_or(PollFlags::empty());
            // Hangups and errors surface as readable so the owner's read
            // path observes the EOF or the pending socket error.
            let readable = revents
                .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL);
            let writable = revents.contains(PollFlags::POLLOUT);
            if readable || writable {
                turn.ready.push(Readiness { fd, readable, writable });
            }
        }

        if let Some(armed) = self.timer {
            if Instant::now() >= armed {
                self.timer = None;
                turn.timer_fired = true;
            }
        }

        Ok(turn)
    }
}
