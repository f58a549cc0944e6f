//! End-to-end protocol tests: a real daemon instance on a scratch socket,
//! driven one reactor turn at a time, with plain blocking clients on the
//! other side and the worker channel held by the test.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use quaver_proto::{
    self as proto, EventRecord, ModeDirective, ModeRecord, MsgKind, PlayState, PositionRecord,
    SeekRecord, ShowEntry, StatusRecord,
};
use quaverd::channel::Channel;
use quaverd::control::bind_control_socket;
use quaverd::server::Server;
use quaverd::worker::Worker;
use tempfile::TempDir;

struct Daemon {
    server: Server,
    worker_far: Channel,
    socket: PathBuf,
    dir: TempDir,
}

fn daemon() -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.sock");
    let listener = bind_control_socket(&socket).unwrap();
    let (near, far) = UnixStream::pair().unwrap();
    let server = Server::new(listener, Worker::from_stream(near).unwrap());
    Daemon {
        server,
        worker_far: Channel::new(far).unwrap(),
        socket,
        dir,
    }
}

impl Daemon {
    /// Run a few bounded reactor turns so pending I/O settles.
    fn spin(&mut self) {
        for _ in 0..4 {
            self.server.turn(Some(Duration::from_millis(20))).unwrap();
        }
    }

    fn connect(&mut self) -> Client {
        let stream = UnixStream::connect(&self.socket).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        self.spin();
        Client { stream }
    }

    /// Create a readable file to stand in for a track.
    fn track(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        File::create(&path)
            .unwrap()
            .write_all(b"not really audio")
            .unwrap();
        path
    }

    /// Collect every command kind the worker end has received.
    fn worker_kinds(&mut self) -> Vec<MsgKind> {
        self.worker_far.read_available().unwrap();
        let mut kinds = Vec::new();
        while let Some(msg) = self.worker_far.next_message().unwrap() {
            kinds.push(msg.known_kind().unwrap());
        }
        kinds
    }

    /// Inject a worker report and let the daemon process it.
    fn worker_sends(&mut self, kind: MsgKind, payload: &[u8]) {
        self.worker_far.compose(kind, 0, None, payload).unwrap();
        self.worker_far.flush().unwrap();
        self.spin();
    }
}

struct Client {
    stream: UnixStream,
}

impl Client {
    fn send(&mut self, kind: MsgKind, payload: &[u8]) {
        let hdr = proto::encode_header(kind, 0, std::process::id(), payload.len()).unwrap();
        self.stream.write_all(&hdr).unwrap();
        self.stream.write_all(payload).unwrap();
    }

    fn recv(&mut self) -> (MsgKind, Vec<u8>) {
        let mut hdr = [0u8; proto::HEADER_LEN];
        self.stream.read_exact(&mut hdr).unwrap();
        let hdr = proto::parse_header(&hdr).unwrap();
        let mut payload = vec![0u8; hdr.payload_len()];
        self.stream.read_exact(&mut payload).unwrap();
        (MsgKind::from_u32(hdr.kind).unwrap(), payload)
    }

    /// Receive one monitor notification and decode it.
    fn recv_event(&mut self) -> EventRecord {
        let (kind, payload) = self.recv();
        assert_eq!(kind, MsgKind::Monitor);
        EventRecord::decode(&payload).unwrap()
    }

    fn status(&mut self, d: &mut Daemon) -> StatusRecord {
        self.send(MsgKind::Status, &[]);
        d.spin();
        let (kind, payload) = self.recv();
        assert_eq!(kind, MsgKind::Status);
        StatusRecord::decode(&payload).unwrap()
    }

    fn show(&mut self, d: &mut Daemon) -> Vec<ShowEntry> {
        self.send(MsgKind::Show, &[]);
        d.spin();
        let mut entries = Vec::new();
        loop {
            let (kind, payload) = self.recv();
            assert_eq!(kind, MsgKind::Show);
            if payload.is_empty() {
                return entries;
            }
            entries.push(ShowEntry::decode(&payload).unwrap());
        }
    }

    fn add(&mut self, d: &mut Daemon, path: &Path) {
        self.send(MsgKind::Add, &proto::encode_path_record(path).unwrap());
        d.spin();
        let (kind, payload) = self.recv();
        assert_eq!(kind, MsgKind::Add);
        assert_eq!(proto::decode_path_record(&payload).unwrap(), path);
    }
}

#[test]
fn pause_resume_with_monitor() {
    let mut d = daemon();
    let mut a = d.connect();
    let mut b = d.connect();

    b.send(MsgKind::Monitor, &[]);
    d.spin();

    let track = d.track("one.flac");
    a.add(&mut d, &track);
    assert_eq!(b.recv_event().kind, MsgKind::Add);

    a.send(MsgKind::Play, &[]);
    d.spin();
    assert_eq!(b.recv_event().kind, MsgKind::Play);
    assert_eq!(d.worker_kinds(), vec![MsgKind::WorkerOpen]);
    assert_eq!(a.status(&mut d).state, PlayState::Playing);

    a.send(MsgKind::Pause, &[]);
    d.spin();
    assert_eq!(b.recv_event().kind, MsgKind::Pause);
    assert_eq!(d.worker_kinds(), vec![MsgKind::WorkerPause]);
    assert_eq!(a.status(&mut d).state, PlayState::Paused);

    a.send(MsgKind::Play, &[]);
    d.spin();
    assert_eq!(b.recv_event().kind, MsgKind::Play);
    assert_eq!(d.worker_kinds(), vec![MsgKind::WorkerResume]);
    assert_eq!(a.status(&mut d).state, PlayState::Playing);
}

#[test]
fn pause_when_stopped_is_ignored() {
    let mut d = daemon();
    let mut a = d.connect();
    let mut b = d.connect();
    b.send(MsgKind::Monitor, &[]);
    d.spin();

    a.send(MsgKind::Pause, &[]);
    a.send(MsgKind::Stop, &[]);
    d.spin();

    // Neither no-op produced a worker command.
    assert!(d.worker_kinds().is_empty());
    assert_eq!(a.status(&mut d).state, PlayState::Stopped);

    // A probe command proves the no-ops emitted no notification: the probe's
    // event is the first thing the monitor sees.
    a.send(MsgKind::Mode, &ModeRecord::default().encode());
    d.spin();
    assert_eq!(b.recv_event().kind, MsgKind::Mode);
}

#[test]
fn transaction_exclusivity() {
    let mut d = daemon();
    let mut a = d.connect();
    let mut b = d.connect();
    let mut c = d.connect();

    b.send(MsgKind::Monitor, &[]);
    d.spin();

    a.send(MsgKind::Begin, &[]);
    d.spin();
    assert_eq!(a.recv().0, MsgKind::Begin);

    // Another connection cannot touch the transaction.
    b.send(MsgKind::Add, &proto::encode_path_record(Path::new("/x")).unwrap());
    d.spin();
    let (kind, payload) = b.recv();
    assert_eq!(kind, MsgKind::Error);
    assert_eq!(payload, b"locked");

    a.add(&mut d, Path::new("/x"));
    a.add(&mut d, Path::new("/y"));
    a.send(MsgKind::Commit, &proto::encode_commit_offset(0));
    d.spin();
    assert_eq!(a.recv().0, MsgKind::Commit);

    // Monitors observe only the final swap.
    assert_eq!(b.recv_event().kind, MsgKind::Commit);

    let entries = c.show(&mut d);
    assert_eq!(
        entries.iter().map(|e| e.path.clone()).collect::<Vec<_>>(),
        vec![PathBuf::from("/x"), PathBuf::from("/y")]
    );
    assert!(entries[0].current);
    assert!(!entries[1].current);
}

#[test]
fn transaction_aborts_on_disconnect() {
    let mut d = daemon();
    let mut a = d.connect();

    a.send(MsgKind::Begin, &[]);
    d.spin();
    assert_eq!(a.recv().0, MsgKind::Begin);
    a.send(MsgKind::Add, &proto::encode_path_record(Path::new("/x")).unwrap());
    d.spin();
    drop(a);
    d.spin();

    // The staged playlist is gone and the lock is free.
    let mut b = d.connect();
    b.send(MsgKind::Begin, &[]);
    d.spin();
    assert_eq!(b.recv().0, MsgKind::Begin);
    b.send(MsgKind::Commit, &proto::encode_commit_offset(-1));
    d.spin();
    assert_eq!(b.recv().0, MsgKind::Commit);
    assert!(b.show(&mut d).is_empty());
}

#[test]
fn mode_directives_combine() {
    let mut d = daemon();
    let mut a = d.connect();

    let rec = ModeRecord {
        repeat_one: ModeDirective::Unchanged,
        repeat_all: ModeDirective::Toggle,
        consume: ModeDirective::Set(true),
    };
    a.send(MsgKind::Mode, &rec.encode());
    d.spin();

    let status = a.status(&mut d);
    assert!(!status.mode.repeat_one);
    assert!(status.mode.repeat_all);
    assert!(status.mode.consume);
}

#[test]
fn wrong_size_mode_is_rejected_and_connection_survives() {
    let mut d = daemon();
    let mut a = d.connect();

    a.send(MsgKind::Mode, &[0u8; proto::MODE_RECORD_LEN - 1]);
    d.spin();
    let (kind, payload) = a.recv();
    assert_eq!(kind, MsgKind::Error);
    assert_eq!(payload, b"wrong size");

    let status = a.status(&mut d);
    assert_eq!(status.mode, Default::default());
}

#[test]
fn flush_truncates_and_notifies() {
    let mut d = daemon();
    let mut a = d.connect();
    let mut b = d.connect();
    b.send(MsgKind::Monitor, &[]);
    d.spin();

    a.add(&mut d, Path::new("/a"));
    a.add(&mut d, Path::new("/b"));
    assert_eq!(b.recv_event().kind, MsgKind::Add);
    assert_eq!(b.recv_event().kind, MsgKind::Add);

    // Stopped: flush drops everything.
    a.send(MsgKind::Flush, &[]);
    d.spin();
    assert_eq!(b.recv_event().kind, MsgKind::Commit);
    assert!(a.show(&mut d).is_empty());
}

#[test]
fn jump_matches_by_substring() {
    let mut d = daemon();
    let mut a = d.connect();

    let one = d.track("alpha.flac");
    let two = d.track("beta.flac");
    a.add(&mut d, &one);
    a.add(&mut d, &two);

    a.send(MsgKind::Jump, &proto::encode_path_record(Path::new("beta.flac")).unwrap());
    d.spin();
    let status = a.status(&mut d);
    assert_eq!(status.state, PlayState::Playing);
    assert_eq!(status.cursor, Some(1));
    assert_eq!(status.path, Some(two));
    assert_eq!(d.worker_kinds(), vec![MsgKind::WorkerStop, MsgKind::WorkerOpen]);

    a.send(MsgKind::Jump, &proto::encode_path_record(Path::new("nothing-here")).unwrap());
    d.spin();
    let (kind, payload) = a.recv();
    assert_eq!(kind, MsgKind::Error);
    assert_eq!(payload, b"not found");
}

#[test]
fn seek_is_forwarded_only_while_active() {
    let mut d = daemon();
    let mut a = d.connect();

    let seek = SeekRecord { offset: 30, relative: false };
    a.send(MsgKind::Seek, &seek.encode());
    d.spin();
    assert!(d.worker_kinds().is_empty());

    let track = d.track("one.flac");
    a.add(&mut d, &track);
    a.send(MsgKind::Play, &[]);
    d.spin();
    a.send(MsgKind::Seek, &seek.encode());
    d.spin();

    let kinds = d.worker_kinds();
    assert_eq!(kinds, vec![MsgKind::WorkerOpen, MsgKind::Seek]);
}

#[test]
fn position_reports_land_in_status() {
    let mut d = daemon();
    let mut a = d.connect();

    let track = d.track("one.flac");
    a.add(&mut d, &track);
    a.send(MsgKind::Play, &[]);
    d.spin();

    let pos = PositionRecord { position: 5, duration: 100 };
    d.worker_sends(MsgKind::WorkerPosition, &pos.encode());

    let status = a.status(&mut d);
    assert_eq!(status.position, 5);
    assert_eq!(status.duration, 100);
}

#[test]
fn end_of_track_without_repeat_stops() {
    let mut d = daemon();
    let mut a = d.connect();
    let mut b = d.connect();
    b.send(MsgKind::Monitor, &[]);
    d.spin();

    let track = d.track("one.flac");
    a.add(&mut d, &track);
    a.send(MsgKind::Play, &[]);
    d.spin();
    assert_eq!(b.recv_event().kind, MsgKind::Add);
    assert_eq!(b.recv_event().kind, MsgKind::Play);

    d.worker_sends(MsgKind::WorkerEof, &[]);
    assert_eq!(b.recv_event().kind, MsgKind::Stop);
    assert_eq!(a.status(&mut d).state, PlayState::Stopped);
}

#[test]
fn decode_error_stops_and_notifies() {
    let mut d = daemon();
    let mut a = d.connect();
    let mut b = d.connect();
    b.send(MsgKind::Monitor, &[]);
    d.spin();

    let track = d.track("one.flac");
    a.add(&mut d, &track);
    a.send(MsgKind::Play, &[]);
    d.spin();
    assert_eq!(b.recv_event().kind, MsgKind::Add);
    assert_eq!(b.recv_event().kind, MsgKind::Play);

    d.worker_sends(MsgKind::WorkerError, b"corrupt stream");
    assert_eq!(b.recv_event().kind, MsgKind::Stop);
    assert_eq!(a.status(&mut d).state, PlayState::Stopped);
    assert!(d.worker_kinds().contains(&MsgKind::WorkerStop));
}
