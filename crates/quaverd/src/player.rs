//! Daemon-side view of playback: the three-state machine value, the mode
//! flags, and the latest position report from the worker.

use std::path::PathBuf;

use quaver_proto::{EventRecord, ModeFlags, ModeRecord, MsgKind, PlayState, StatusRecord};

#[derive(Debug, Default)]
pub struct PlayerState {
    pub state: PlayState,
    pub mode: ModeFlags,
    /// Seconds into the current track, per the worker's last report.
    pub position: i64,
    /// Current track duration in seconds, 0 while unknown.
    pub duration: i64,
}

impl PlayerState {
    /// Apply one tri-valued directive per mode flag.
    pub fn apply_mode(&mut self, rec: &ModeRecord) {
        self.mode.repeat_one = rec.repeat_one.apply(self.mode.repeat_one);
        self.mode.repeat_all = rec.repeat_all.apply(self.mode.repeat_all);
        self.mode.consume = rec.consume.apply(self.mode.consume);
    }

    /// Forget per-track progress when a track ends or playback stops.
    pub fn clear_track(&mut self) {
        self.position = 0;
        self.duration = 0;
    }

    /// Build a monitor notification for `kind` from the current snapshot.
    pub fn event(&self, kind: MsgKind) -> EventRecord {
        EventRecord {
            kind,
            position: self.position,
            duration: self.duration,
            mode: self.mode,
        }
    }

    /// Build a STATUS reply for the given playlist position.
    pub fn status(&self, cursor: Option<usize>, path: Option<PathBuf>) -> StatusRecord {
        StatusRecord {
            state: self.state,
            cursor,
            path,
            position: self.position,
            duration: self.duration,
            mode: self.mode,
        }
    }
}
