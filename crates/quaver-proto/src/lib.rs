//! Shared wire-protocol primitives for `quaverd`, its control clients, and
//! the player worker.
//!
//! Both channels (control socket and worker socketpair) carry the same framed
//! stream. Frames allow:
//! - submitting playback and playlist commands without reconnecting
//! - asynchronous notifications interleaved with command replies
//! - passing an open file descriptor out-of-band when a track starts
//!
//! Frame format (all integers little-endian):
//! - kind: u32
//! - flags: u32 (bit 0: a file descriptor accompanies this frame)
//! - pid: u32 (sender PID, 0 if not supplied)
//! - len: u32 (header + payload; at most [`MAX_FRAME_LEN`])
//! - payload: `[u8; len - 16]`
//!
//! File descriptors never appear in the byte stream itself; they travel as
//! `SCM_RIGHTS` control messages alongside the first byte of their frame.
//!
//! Payloads for MODE, SEEK, COMMIT, ADD, JUMP, SHOW, STATUS and monitor
//! events are fixed-size records defined below. Path records are
//! [`PATH_RECORD_LEN`] bytes, NUL-terminated. The tag values are fixed and
//! must match the client's.

use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 16;

/// Maximum total frame size (header + payload).
pub const MAX_FRAME_LEN: usize = 16384;

/// Maximum payload a single frame may carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

/// Size of a NUL-terminated on-wire path record.
pub const PATH_RECORD_LEN: usize = 1024;

/// Header flag: an open file descriptor accompanies this frame.
pub const FLAG_FD: u32 = 0x1;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    // Control client -> daemon. Replies reuse the request kind; SHOW replies
    // are a run of Show frames closed by an empty Show frame.
    Play = 0x01,
    TogglePlay = 0x02,
    Pause = 0x03,
    Stop = 0x04,
    Next = 0x05,
    Prev = 0x06,
    Jump = 0x07,
    Mode = 0x08,
    Seek = 0x09,
    Flush = 0x0A,
    Show = 0x0B,
    Status = 0x0C,
    Begin = 0x0D,
    Add = 0x0E,
    Commit = 0x0F,
    Monitor = 0x10,

    /// Daemon -> client: textual error reply.
    Error = 0x1F,

    // Daemon -> worker.
    WorkerOpen = 0x20,
    WorkerResume = 0x21,
    WorkerPause = 0x22,
    WorkerStop = 0x23,

    // Worker -> daemon.
    WorkerPosition = 0x30,
    WorkerEof = 0x31,
    WorkerError = 0x32,
}

impl MsgKind {
    /// Map a raw tag back to a known kind. Unknown tags are a dispatch
    /// concern (logged and ignored), not a framing error.
    pub fn from_u32(v: u32) -> Option<Self> {
        let k = match v {
            0x01 => MsgKind::Play,
            0x02 => MsgKind::TogglePlay,
            0x03 => MsgKind::Pause,
            0x04 => MsgKind::Stop,
            0x05 => MsgKind::Next,
            0x06 => MsgKind::Prev,
            0x07 => MsgKind::Jump,
            0x08 => MsgKind::Mode,
            0x09 => MsgKind::Seek,
            0x0A => MsgKind::Flush,
            0x0B => MsgKind::Show,
            0x0C => MsgKind::Status,
            0x0D => MsgKind::Begin,
            0x0E => MsgKind::Add,
            0x0F => MsgKind::Commit,
            0x10 => MsgKind::Monitor,
            0x1F => MsgKind::Error,
            0x20 => MsgKind::WorkerOpen,
            0x21 => MsgKind::WorkerResume,
            0x22 => MsgKind::WorkerPause,
            0x23 => MsgKind::WorkerStop,
            0x30 => MsgKind::WorkerPosition,
            0x31 => MsgKind::WorkerEof,
            0x32 => MsgKind::WorkerError,
            _ => return None,
        };
        Some(k)
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw tag; see [`MsgKind::from_u32`].
    pub kind: u32,
    pub flags: u32,
    pub pid: u32,
    /// Total frame length, header included.
    pub len: u32,
}

impl FrameHeader {
    pub fn payload_len(&self) -> usize {
        self.len as usize - HEADER_LEN
    }
}

/// Encode a frame header.
pub fn encode_header(kind: MsgKind, flags: u32, pid: u32, payload_len: usize) -> io::Result<[u8; HEADER_LEN]> {
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "payload too large"));
    }
    let len = (HEADER_LEN + payload_len) as u32;
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&(kind as u32).to_le_bytes());
    out[4..8].copy_from_slice(&flags.to_le_bytes());
    out[8..12].copy_from_slice(&pid.to_le_bytes());
    out[12..16].copy_from_slice(&len.to_le_bytes());
    Ok(out)
}

/// Parse and validate a frame header.
///
/// The caller should then collect exactly `len - 16` bytes of payload.
pub fn parse_header(buf: &[u8; HEADER_LEN]) -> io::Result<FrameHeader> {
    let kind = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let flags = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let pid = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    let len = u32::from_le_bytes(buf[12..16].try_into().unwrap());

    if (len as usize) < HEADER_LEN || (len as usize) > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame length {len}"),
        ));
    }
    Ok(FrameHeader { kind, flags, pid, len })
}

/// Playback state, as carried in status replies.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    #[default]
    Stopped = 0,
    Playing = 1,
    Paused = 2,
}

impl PlayState {
    pub fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            0 => Ok(PlayState::Stopped),
            1 => Ok(PlayState::Playing),
            2 => Ok(PlayState::Paused),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown play state {v}"),
            )),
        }
    }
}

/// One mutation directive for a single mode flag.
///
/// Wire encoding: `0x00` set false, `0x01` set true, `0x02` toggle,
/// `0xFF` leave unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeDirective {
    #[default]
    Unchanged,
    Toggle,
    Set(bool),
}

impl ModeDirective {
    /// Apply the directive to the current flag value.
    pub fn apply(self, current: bool) -> bool {
        match self {
            ModeDirective::Unchanged => current,
            ModeDirective::Toggle => !current,
            ModeDirective::Set(v) => v,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ModeDirective::Set(false) => 0x00,
            ModeDirective::Set(true) => 0x01,
            ModeDirective::Toggle => 0x02,
            ModeDirective::Unchanged => 0xFF,
        }
    }

    fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            0x00 => Ok(ModeDirective::Set(false)),
            0x01 => Ok(ModeDirective::Set(true)),
            0x02 => Ok(ModeDirective::Toggle),
            0xFF => Ok(ModeDirective::Unchanged),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown mode directive {v:#x}"),
            )),
        }
    }
}

/// Snapshot of the three playback mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeFlags {
    pub repeat_one: bool,
    pub repeat_all: bool,
    pub consume: bool,
}

impl ModeFlags {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.push(self.repeat_one as u8);
        out.push(self.repeat_all as u8);
        out.push(self.consume as u8);
    }

    fn decode_from(buf: &[u8]) -> ModeFlags {
        ModeFlags {
            repeat_one: buf[0] != 0,
            repeat_all: buf[1] != 0,
            consume: buf[2] != 0,
        }
    }
}

/// MODE command payload: one directive per flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeRecord {
    pub repeat_one: ModeDirective,
    pub repeat_all: ModeDirective,
    pub consume: ModeDirective,
}

/// Exact size of a MODE payload.
pub const MODE_RECORD_LEN: usize = 3;

impl ModeRecord {
    pub fn encode(&self) -> Vec<u8> {
        vec![
            self.repeat_one.to_u8(),
            self.repeat_all.to_u8(),
            self.consume.to_u8(),
        ]
    }

    pub fn decode(payload: &[u8]) -> io::Result<Self> {
        if payload.len() != MODE_RECORD_LEN {
            return Err(wrong_size(MODE_RECORD_LEN, payload.len()));
        }
        Ok(ModeRecord {
            repeat_one: ModeDirective::from_u8(payload[0])?,
            repeat_all: ModeDirective::from_u8(payload[1])?,
            consume: ModeDirective::from_u8(payload[2])?,
        })
    }
}

/// SEEK command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRecord {
    /// Target position in seconds; an offset from the current position when
    /// `relative` is set.
    pub offset: i64,
    pub relative: bool,
}

/// Exact size of a SEEK payload.
pub const SEEK_RECORD_LEN: usize = 9;

impl SeekRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SEEK_RECORD_LEN);
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.push(self.relative as u8);
        out
    }

    pub fn decode(payload: &[u8]) -> io::Result<Self> {
        if payload.len() != SEEK_RECORD_LEN {
            return Err(wrong_size(SEEK_RECORD_LEN, payload.len()));
        }
        Ok(SeekRecord {
            offset: i64::from_le_bytes(payload[0..8].try_into().unwrap()),
            relative: payload[8] != 0,
        })
    }
}

/// Exact size of a COMMIT payload.
pub const OFFSET_RECORD_LEN: usize = 8;

/// Encode a COMMIT payload: the cursor position to preserve in the swapped-in
/// playlist.
pub fn encode_commit_offset(offset: i64) -> Vec<u8> {
    offset.to_le_bytes().to_vec()
}

/// Decode a COMMIT payload.
pub fn decode_commit_offset(payload: &[u8]) -> io::Result<i64> {
    if payload.len() != OFFSET_RECORD_LEN {
        return Err(wrong_size(OFFSET_RECORD_LEN, payload.len()));
    }
    Ok(i64::from_le_bytes(payload.try_into().unwrap()))
}

/// Encode an ADD/JUMP path record: NUL-terminated, NUL-padded to
/// [`PATH_RECORD_LEN`].
pub fn encode_path_record(path: &Path) -> io::Result<Vec<u8>> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= PATH_RECORD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path too long"));
    }
    if bytes.contains(&0) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"));
    }
    let mut out = vec![0u8; PATH_RECORD_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Decode a path record. The record must be exactly [`PATH_RECORD_LEN`] bytes
/// and NUL-terminated; the path itself may be empty.
pub fn decode_path_record(payload: &[u8]) -> io::Result<PathBuf> {
    if payload.len() != PATH_RECORD_LEN {
        return Err(wrong_size(PATH_RECORD_LEN, payload.len()));
    }
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unterminated path record"))?;
    Ok(PathBuf::from(std::ffi::OsString::from_vec(payload[..end].to_vec())))
}

/// One frame of a SHOW reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowEntry {
    pub path: PathBuf,
    /// Set on the entry the playlist cursor points at.
    pub current: bool,
}

/// Exact size of a SHOW reply entry.
pub const SHOW_ENTRY_LEN: usize = PATH_RECORD_LEN + 1;

impl ShowEntry {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut out = encode_path_record(&self.path)?;
        out.push(self.current as u8);
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> io::Result<Self> {
        if payload.len() != SHOW_ENTRY_LEN {
            return Err(wrong_size(SHOW_ENTRY_LEN, payload.len()));
        }
        Ok(ShowEntry {
            path: decode_path_record(&payload[..PATH_RECORD_LEN])?,
            current: payload[PATH_RECORD_LEN] != 0,
        })
    }
}

/// STATUS reply payload: a one-shot snapshot of the player.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusRecord {
    pub state: PlayState,
    /// Playlist cursor; on the wire, -1 encodes "no current".
    pub cursor: Option<usize>,
    /// Current track, empty when the cursor is unset.
    pub path: Option<PathBuf>,
    /// Seconds into the current track.
    pub position: i64,
    /// Track duration in seconds, 0 when unknown.
    pub duration: i64,
    pub mode: ModeFlags,
}

/// Exact size of a STATUS payload.
pub const STATUS_RECORD_LEN: usize = PATH_RECORD_LEN + 1 + 8 + 8 + 8 + 3;

impl StatusRecord {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut out = match &self.path {
            Some(p) => encode_path_record(p)?,
            None => vec![0u8; PATH_RECORD_LEN],
        };
        out.push(self.state as u8);
        let cursor = self.cursor.and_then(|c| i64::try_from(c).ok()).unwrap_or(-1);
        out.extend_from_slice(&cursor.to_le_bytes());
        out.extend_from_slice(&self.position.to_le_bytes());
        out.extend_from_slice(&self.duration.to_le_bytes());
        self.mode.encode_into(&mut out);
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> io::Result<Self> {
        if payload.len() != STATUS_RECORD_LEN {
            return Err(wrong_size(STATUS_RECORD_LEN, payload.len()));
        }
        let path = decode_path_record(&payload[..PATH_RECORD_LEN])?;
        let rest = &payload[PATH_RECORD_LEN..];
        let cursor = i64::from_le_bytes(rest[1..9].try_into().unwrap());
        Ok(StatusRecord {
            state: PlayState::from_u8(rest[0])?,
            cursor: usize::try_from(cursor).ok(),
            path: if path.as_os_str().is_empty() { None } else { Some(path) },
            position: i64::from_le_bytes(rest[9..17].try_into().unwrap()),
            duration: i64::from_le_bytes(rest[17..25].try_into().unwrap()),
            mode: ModeFlags::decode_from(&rest[25..28]),
        })
    }
}

/// Monitor notification payload.
///
/// `kind` mirrors the command (or worker transition) that caused the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: MsgKind,
    pub position: i64,
    pub duration: i64,
    pub mode: ModeFlags,
}

/// Exact size of a monitor notification payload.
pub const EVENT_RECORD_LEN: usize = 4 + 8 + 8 + 3;

impl EventRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EVENT_RECORD_LEN);
        out.extend_from_slice(&(self.kind as u32).to_le_bytes());
        out.extend_from_slice(&self.position.to_le_bytes());
        out.extend_from_slice(&self.duration.to_le_bytes());
        self.mode.encode_into(&mut out);
        out
    }

    pub fn decode(payload: &[u8]) -> io::Result<Self> {
        if payload.len() != EVENT_RECORD_LEN {
            return Err(wrong_size(EVENT_RECORD_LEN, payload.len()));
        }
        let raw = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let kind = MsgKind::from_u32(raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unknown event kind {raw:#x}")))?;
        Ok(EventRecord {
            kind,
            position: i64::from_le_bytes(payload[4..12].try_into().unwrap()),
            duration: i64::from_le_bytes(payload[12..20].try_into().unwrap()),
            mode: ModeFlags::decode_from(&payload[20..23]),
        })
    }
}

/// Worker position-report payload: seconds played and total duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRecord {
    pub position: i64,
    pub duration: i64,
}

/// Exact size of a worker position report.
pub const POSITION_RECORD_LEN: usize = 16;

impl PositionRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(POSITION_RECORD_LEN);
        out.extend_from_slice(&self.position.to_le_bytes());
        out.extend_from_slice(&self.duration.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> io::Result<Self> {
        if payload.len() != POSITION_RECORD_LEN {
            return Err(wrong_size(POSITION_RECORD_LEN, payload.len()));
        }
        Ok(PositionRecord {
            position: i64::from_le_bytes(payload[0..8].try_into().unwrap()),
            duration: i64::from_le_bytes(payload[8..16].try_into().unwrap()),
        })
    }
}

fn wrong_size(expected: usize, got: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("wrong size: expected {expected}, got {got}"),
    )
}
