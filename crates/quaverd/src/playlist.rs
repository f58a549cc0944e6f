//! Ordered track list with an active-index cursor.
//!
//! The cursor is `None` ("no current") only while playback is stopped; the
//! server enforces that pairing. All cursor motion honoring the repeat and
//! consume flags lives here so it can be tested without sockets.

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct Playlist {
    tracks: Vec<PathBuf>,
    cursor: Option<usize>,
}

impl Playlist {
    pub fn new() -> Playlist {
        Playlist::default()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[PathBuf] {
        &self.tracks
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current(&self) -> Option<&Path> {
        self.cursor.map(|i| self.tracks[i].as_path())
    }

    /// Append a track; the cursor does not move.
    pub fn enqueue(&mut self, track: PathBuf) {
        self.tracks.push(track);
    }

    /// Point the cursor at the head if it is unset. Returns whether a
    /// current track exists afterwards.
    pub fn ensure_current(&mut self) -> bool {
        if self.cursor.is_none() && !self.tracks.is_empty() {
            self.cursor = Some(0);
        }
        self.cursor.is_some()
    }

    /// Forget the active position; the next resume starts from the head.
    pub fn reset(&mut self) {
        self.cursor = None;
    }

    /// Move the cursor one track forward.
    ///
    /// With `consume`, the just-played track is removed and the cursor stays
    /// on the slot its successor fell into. Past the end, `repeat_all` wraps
    /// to the head; otherwise the cursor unsets. Returns whether a current
    /// track exists afterwards.
    pub fn advance(&mut self, repeat_all: bool, consume: bool) -> bool {
        let Some(cur) = self.cursor else {
            return self.ensure_current();
        };

        let next = if consume {
            self.tracks.remove(cur);
            cur
        } else {
            cur + 1
        };

        self.cursor = if next < self.tracks.len() {
            Some(next)
        } else if repeat_all && !self.tracks.is_empty() {
            Some(0)
        } else {
            None
        };
        self.cursor.is_some()
    }

    /// Move the cursor one track back, wrapping to the tail with
    /// `repeat_all`. Returns whether a current track exists afterwards.
    pub fn previous(&mut self, repeat_all: bool) -> bool {
        let Some(cur) = self.cursor else {
            return self.ensure_current();
        };

        self.cursor = if cur > 0 {
            Some(cur - 1)
        } else if repeat_all && !self.tracks.is_empty() {
            Some(self.tracks.len() - 1)
        } else {
            None
        };
        self.cursor.is_some()
    }

    /// Point the cursor at the first track matching `target`: an exact path
    /// match wins, else the first track containing `target` as a substring.
    pub fn jump_to(&mut self, target: &Path) -> Option<usize> {
        let needle = target.as_os_str().as_bytes();
        let pos = self
            .tracks
            .iter()
            .position(|t| t.as_path() == target)
            .or_else(|| {
                self.tracks
                    .iter()
                    .position(|t| contains(t.as_os_str().as_bytes(), needle))
            })?;
        self.cursor = Some(pos);
        Some(pos)
    }

    /// Drop everything after the current track, or everything when stopped.
    pub fn truncate(&mut self, stopped: bool) {
        match self.cursor {
            Some(cur) if !stopped => self.tracks.truncate(cur + 1),
            _ => {
                self.tracks.clear();
                self.reset();
            }
        }
    }

    /// Replace the whole list with `staging` in one step, placing the cursor
    /// at `offset` when it lands inside the new list and unsetting it
    /// otherwise.
    pub fn replace_with(&mut self, staging: Playlist, offset: i64) {
        self.tracks = staging.tracks;
        self.cursor = usize::try_from(offset)
            .ok()
            .filter(|&i| i < self.tracks.len());
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
