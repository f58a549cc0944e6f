//! Buffered framed-message channel over one Unix stream socket.
//!
//! Wraps a non-blocking socket with an inbound byte buffer, an inbound
//! file-descriptor queue, and an outbound chunk queue. Reads drain until
//! EAGAIN; writes flush until EAGAIN. EOF and fatal errors are reported
//! distinctly from would-block so the owner can decide the socket's fate.
//!
//! Descriptors passed with a frame travel as `SCM_RIGHTS` control messages
//! attached to the frame's first byte: they are queued on receipt and paired
//! with the next parsed message whose [`quaver_proto::FLAG_FD`] bit is set.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use quaver_proto as proto;

/// One complete inbound message.
#[derive(Debug)]
pub struct Message {
    /// Raw type tag; unknown tags are the dispatcher's concern.
    pub kind: u32,
    /// Sender PID as claimed in the header, 0 if absent.
    pub pid: u32,
    pub fd: Option<OwnedFd>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn known_kind(&self) -> Option<proto::MsgKind> {
        proto::MsgKind::from_u32(self.kind)
    }
}

/// Result of draining the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Everything currently available was buffered.
    Drained,
    /// The peer closed its end.
    Eof,
}

struct OutChunk {
    buf: Vec<u8>,
    off: usize,
    fd: Option<OwnedFd>,
}

pub struct Channel {
    stream: UnixStream,
    inbuf: Vec<u8>,
    in_fds: VecDeque<OwnedFd>,
    out: VecDeque<OutChunk>,
}

impl Channel {
    /// Wrap `stream`, switching it to non-blocking mode.
    pub fn new(stream: UnixStream) -> io::Result<Channel> {
        stream.set_nonblocking(true)?;
        Ok(Channel {
            stream,
            inbuf: Vec::new(),
            in_fds: VecDeque::new(),
            out: VecDeque::new(),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Drain the socket into the inbound buffer, collecting any passed
    /// descriptors. Stops at EAGAIN.
    pub fn read_available(&mut self) -> io::Result<ReadOutcome> {
        let mut buf = [0u8; 4096];
        loop {
            let (n, fds) = {
                let mut iov = [IoSliceMut::new(&mut buf)];
                let mut space = nix::cmsg_space!([RawFd; 4]);
                match recvmsg::<()>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                ) {
                    Ok(msg) => {
                        let mut fds = Vec::new();
                        if let Ok(cmsgs) = msg.cmsgs() {
                            for cmsg in cmsgs {
                                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                                    for fd in raw {
                                        // The kernel just handed us these
                                        // descriptors; we are their sole owner.
                                        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                                    }
                                }
                            }
                        }
                        (msg.bytes, fds)
                    }
                    Err(Errno::EAGAIN) => return Ok(ReadOutcome::Drained),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(io::Error::from(e)),
                }
            };

            self.in_fds.extend(fds);
            if n == 0 {
                return Ok(ReadOutcome::Eof);
            }
            self.inbuf.extend_from_slice(&buf[..n]);
        }
    }

    /// Parse the next complete message out of the inbound buffer.
    ///
    /// Returns `Ok(None)` while no full frame is buffered. Malformed framing
    /// (bad length, fd flag without a queued descriptor) is an error; the
    /// owner should close the connection.
    pub fn next_message(&mut self) -> io::Result<Option<Message>> {
        if self.inbuf.len() < proto::HEADER_LEN {
            return Ok(None);
        }
        let hdr_bytes: &[u8; proto::HEADER_LEN] =
            self.inbuf[..proto::HEADER_LEN].try_into().unwrap();
        let hdr = proto::parse_header(hdr_bytes)?;
        let total = hdr.len as usize;
        if self.inbuf.len() < total {
            return Ok(None);
        }

        let payload = self.inbuf[proto::HEADER_LEN..total].to_vec();
        self.inbuf.drain(..total);

        let fd = if hdr.flags & proto::FLAG_FD != 0 {
            match self.in_fds.pop_front() {
                Some(fd) => Some(fd),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame announces a file descriptor but none arrived",
                    ));
                }
            }
        } else {
            None
        };

        Ok(Some(Message { kind: hdr.kind, pid: hdr.pid, fd, payload }))
    }

    /// Append a frame to the outbound queue. Fails only if the payload
    /// exceeds the frame size limit.
    pub fn compose(
        &mut self,
        kind: proto::MsgKind,
        pid: u32,
        fd: Option<OwnedFd>,
        payload: &[u8],
    ) -> io::Result<()> {
        let flags = if fd.is_some() { proto::FLAG_FD } else { 0 };
        let hdr = proto::encode_header(kind, flags, pid, payload.len())?;
        let mut buf = Vec::with_capacity(proto::HEADER_LEN + payload.len());
        buf.extend_from_slice(&hdr);
        buf.extend_from_slice(payload);
        self.out.push_back(OutChunk { buf, off: 0, fd });
        Ok(())
    }

    /// Write as much of the outbound queue as the socket accepts.
    /// Would-block is not an error; the owner re-tries on the next writable
    /// event.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(chunk) = self.out.front_mut() {
            let iov = [IoSlice::new(&chunk.buf[chunk.off..])];
            let raw_fds;
            let cmsgs: Vec<ControlMessage> = match chunk.fd {
                Some(ref fd) => {
                    raw_fds = [fd.as_raw_fd()];
                    vec![ControlMessage::ScmRights(&raw_fds)]
                }
                None => Vec::new(),
            };
            // MSG_NOSIGNAL: a hung-up peer must surface as EPIPE, not kill
            // the daemon.
            match sendmsg::<()>(
                self.stream.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Ok(n) => {
                    // The descriptor rides with the first byte written; once
                    // any of the chunk went out, our copy can be dropped.
                    chunk.fd = None;
                    chunk.off += n;
                    if chunk.off >= chunk.buf.len() {
                        self.out.pop_front();
                    }
                }
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
        Ok(())
    }

    pub fn has_pending_output(&self) -> bool {
        !self.out.is_empty()
    }
}
