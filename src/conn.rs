//! Framed NDMP control connections.
//!
//! A connection is either REMOTE (a socket carrying length-prefixed
//! frames) or RESIDENT (an in-process shortcut: the session
//! dispatches canonical requests to itself without serialization).
//! Each remote connection speaks exactly one protocol version,
//! negotiated by `NOTIFY_CONNECTED` at accept time.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::OwnedFd;
use std::time::Instant;

use anyhow::{bail, format_err, Error};
use nix::poll::{poll, PollFd, PollFlags};

use ndmp_api_types::{NdmpError, NDMP4VER};

use crate::chan::Chan;
use crate::msg::{
    ConnectedReason, Header, MessageCode, MessageType, NotifyConnectedRequest, RequestBody,
    WireFrame,
};

const CONN_BUF_LEN: usize = 64 * 1024;
const FRAME_LEN_MAX: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Remote,
    Resident,
}

/// Outcome classification of one outgoing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ok,
    /// Header clean, error in the reply body
    ReplyError,
    /// Error in the reply header
    HdrError,
    /// Round trip exceeded the connection time limit (advisory)
    ReplyLate,
    /// Transport or protocol failure
    Botch,
}

pub struct Conn {
    pub conn_type: ConnType,
    pub protocol_version: u16,
    pub chan: Chan,
    pub next_sequence: u32,
    /// Seconds after which a clean reply is tattled as late. 0 is off.
    pub time_limit: u32,
    pub sent_time: Option<Instant>,
    pub received_time: Option<Instant>,
    pub last_message: Option<MessageCode>,
    pub last_call_status: CallStatus,
    pub last_header_error: NdmpError,
    pub last_reply_error: NdmpError,
    pub snoop: bool,
    /// Unsolicited requests seen while waiting for a reply; the
    /// session dispatches them after the call completes.
    pub unexpected: VecDeque<WireFrame>,
    accum: Vec<u8>,
}

impl Conn {
    fn new(conn_type: ConnType, name: &'static str) -> Self {
        let mut chan = Chan::new(name);
        if conn_type == ConnType::Remote {
            chan.set_buffer(CONN_BUF_LEN);
        }
        Conn {
            conn_type,
            protocol_version: NDMP4VER,
            chan,
            next_sequence: 1,
            time_limit: 0,
            sent_time: None,
            received_time: None,
            last_message: None,
            last_call_status: CallStatus::Ok,
            last_header_error: NdmpError::NoErr,
            last_reply_error: NdmpError::NoErr,
            snoop: false,
            unexpected: VecDeque::new(),
            accum: Vec::new(),
        }
    }

    /// In-process connection; the session is both ends.
    pub fn resident(name: &'static str) -> Self {
        Conn::new(ConnType::Resident, name)
    }

    /// Server side: adopt an accepted control socket and offer our
    /// protocol version with `NOTIFY_CONNECTED`.
    pub fn accept(fd: OwnedFd, name: &'static str) -> Result<Self, Error> {
        let mut conn = Conn::new(ConnType::Remote, name);
        conn.chan.start_read(fd);
        conn.send_request_frame(&RequestBody::NotifyConnected(NotifyConnectedRequest {
            reason: ConnectedReason::Connected,
            protocol_version: NDMP4VER,
            text_reason: String::new(),
        }))?;
        Ok(conn)
    }

    /// Client side: connect to a control endpoint and pick up the
    /// offered protocol version.
    pub fn connect(addr: SocketAddr, name: &'static str) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr)?;
        let fd: OwnedFd = stream.into();
        let mut conn = Conn::new(ConnType::Remote, name);
        conn.chan.start_read(fd);

        let frame = conn.recv_frame(30_000)?;
        match crate::msg::request_to_canonical(frame.body) {
            Ok(RequestBody::NotifyConnected(notice)) => {
                if notice.reason == ConnectedReason::Refused {
                    bail!("control connection refused: {}", notice.text_reason);
                }
                conn.protocol_version = notice.protocol_version.min(NDMP4VER);
            }
            other => bail!("expected NOTIFY_CONNECTED, got {:?}", other),
        }
        Ok(conn)
    }

    pub fn fileno(&self) -> Option<std::os::fd::RawFd> {
        self.chan.fd()
    }

    /*
     * Framing
     */

    fn write_all_blocking(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let fd = self
            .chan
            .fd()
            .ok_or_else(|| format_err!("connection has no transport"))?;
        let mut off = 0;
        while off < bytes.len() {
            let n = unsafe {
                libc::write(
                    fd,
                    bytes[off..].as_ptr() as *const libc::c_void,
                    bytes.len() - off,
                )
            };
            if n >= 0 {
                off += n as usize;
                continue;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                let mut pfd = [PollFd::new(fd, PollFlags::POLLOUT)];
                poll(&mut pfd, 10_000).map_err(|e| format_err!("poll: {}", e))?;
                continue;
            }
            return Err(err.into());
        }
        Ok(())
    }

    pub fn send_frame(&mut self, frame: &WireFrame) -> Result<(), Error> {
        if self.snoop {
            log::debug!("{} Send {:?} {}", self.chan.name, frame.header.message_type, frame.header.message);
        }
        let body = serde_json::to_vec(frame)?;
        let mut buf = Vec::with_capacity(body.len() + 4);
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);
        self.write_all_blocking(&buf)
    }

    /// Send a request body at this connection's version with a fresh
    /// sequence number. Returns the sequence used.
    pub fn send_request_frame(&mut self, body: &RequestBody) -> Result<u32, Error> {
        let wire = crate::msg::request_from_canonical(self.protocol_version, body)
            .map_err(|err| format_err!("request not expressible at v{}: {}", self.protocol_version, err))?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let header = Header {
            sequence,
            time_stamp: unix_time(),
            message_type: MessageType::Request,
            message: body.code(),
            reply_sequence: 0,
            error: NdmpError::NoErr,
        };
        self.send_frame(&WireFrame { header, body: wire })?;
        Ok(sequence)
    }

    fn drain_chan(&mut self) {
        let n = self.chan.n_ready();
        if n > 0 {
            self.accum.extend_from_slice(self.chan.peek());
            self.chan.consume(n);
        }
    }

    /// A complete frame is already sitting in the receive buffer.
    pub fn has_buffered_frame(&mut self) -> bool {
        self.drain_chan();
        if self.accum.len() < 4 {
            return false;
        }
        let len = u32::from_be_bytes(self.accum[..4].try_into().unwrap_or([0; 4])) as usize;
        len <= FRAME_LEN_MAX && self.accum.len() >= 4 + len
    }

    /// Decode one frame from already buffered bytes, if complete.
    pub fn try_next_frame(&mut self) -> Result<Option<WireFrame>, Error> {
        self.drain_chan();
        if self.accum.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.accum[..4].try_into().unwrap_or([0; 4])) as usize;
        if len > FRAME_LEN_MAX {
            bail!("oversized frame ({} bytes)", len);
        }
        if self.accum.len() < 4 + len {
            return Ok(None);
        }
        let frame: WireFrame = serde_json::from_slice(&self.accum[4..4 + len])?;
        self.accum.drain(..4 + len);
        if self.snoop {
            log::debug!("{} Recv {:?} {}", self.chan.name, frame.header.message_type, frame.header.message);
        }
        Ok(Some(frame))
    }

    /// Blocking receive with a millisecond budget.
    pub fn recv_frame(&mut self, max_delay_ms: i32) -> Result<WireFrame, Error> {
        let deadline = Instant::now() + std::time::Duration::from_millis(max_delay_ms as u64);
        loop {
            if let Some(frame) = self.try_next_frame()? {
                return Ok(frame);
            }
            if self.chan.eof {
                bail!("{}: connection closed by peer", self.chan.name);
            }
            let now = Instant::now();
            if now >= deadline {
                bail!("{}: receive timed out", self.chan.name);
            }
            let fd = self
                .chan
                .fd()
                .ok_or_else(|| format_err!("connection has no transport"))?;
            let left = (deadline - now).as_millis() as i32;
            let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
            poll(&mut pfd, left.max(1)).map_err(|err| format_err!("poll: {}", err))?;
            let revents = pfd[0].revents().unwrap_or(PollFlags::empty());
            self.chan.after_poll(revents);
        }
    }

    /// Send a request and wait for the matching reply, stashing any
    /// interleaved unsolicited requests for later dispatch.
    pub fn call_remote(&mut self, body: &RequestBody) -> Result<WireFrame, Error> {
        let code = body.code();
        self.last_message = Some(code);
        self.last_call_status = CallStatus::Botch;
        let sequence = self.send_request_frame(body)?;
        self.sent_time = Some(Instant::now());

        loop {
            let frame = self.recv_frame(300_000)?;
            if frame.header.message_type == MessageType::Reply
                && frame.header.reply_sequence == sequence
            {
                self.received_time = Some(Instant::now());
                return Ok(frame);
            }
            if frame.header.message_type == MessageType::Request {
                self.unexpected.push_back(frame);
                continue;
            }
            log::info!(
                "{} Unexpected message, probably reply w/ wrong reply_sequence",
                self.chan.name
            );
        }
    }

    /// Round trip exceeded the advisory time limit?
    pub fn reply_was_late(&self) -> bool {
        if self.time_limit == 0 {
            return false;
        }
        match (self.sent_time, self.received_time) {
            (Some(sent), Some(received)) if received > sent => {
                (received - sent).as_secs() > self.time_limit as u64
            }
            _ => false,
        }
    }

    /// Abandon the transport; buffered frames are lost.
    pub fn destruct(&mut self) {
        self.chan.cleanup();
        self.accum.clear();
        self.unexpected.clear();
    }

    pub fn is_remote(&self) -> bool {
        self.conn_type == ConnType::Remote
    }

    /// Local socket address, used to steer multi-homed image stream
    /// listens.
    pub fn local_sockaddr(&self) -> Option<SocketAddr> {
        let fd = self.chan.fd()?;
        sockaddr_of(fd, false)
    }

    pub fn peer_sockaddr(&self) -> Option<SocketAddr> {
        let fd = self.chan.fd()?;
        sockaddr_of(fd, true)
    }
}

pub fn unix_time() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

pub(crate) fn sockaddr_of(fd: std::os::fd::RawFd, peer: bool) -> Option<SocketAddr> {
    use nix::sys::socket::{getpeername, getsockname, SockaddrStorage};
    let ss: SockaddrStorage = if peer {
        getpeername(fd).ok()?
    } else {
        getsockname(fd).ok()?
    };
    let sin = ss.as_sockaddr_in()?;
    Some(SocketAddr::from((std::net::Ipv4Addr::from(sin.ip()), sin.port())))
}

/// Socket pair helper for tests and resident image streams.
pub fn socketpair_fds() -> Result<(OwnedFd, OwnedFd), Error> {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::fd::FromRawFd;
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;
    // socketpair hands back raw fds which we own from here on
    let a = unsafe { OwnedFd::from_raw_fd(a) };
    let b = unsafe { OwnedFd::from_raw_fd(b) };
    Ok((a, b))
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("type", &self.conn_type)
            .field("version", &self.protocol_version)
            .field("chan", &self.chan.pp())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndmp_api_types::NDMP3VER;
    use std::io::Write;

    #[test]
    fn test_frame_round_trip_over_socketpair() {
        let (a, b) = socketpair_fds().unwrap();
        let mut tx = Conn::new(ConnType::Remote, "#T");
        tx.chan.start_read(a);
        let mut rx = Conn::new(ConnType::Remote, "#R");
        rx.chan.start_read(b);
        tx.protocol_version = NDMP3VER;

        let seq = tx
            .send_request_frame(&RequestBody::TapeGetState)
            .unwrap();
        assert_eq!(seq, 1);

        let frame = rx.recv_frame(5_000).unwrap();
        assert_eq!(frame.header.sequence, 1);
        assert_eq!(frame.header.message, MessageCode::TapeGetState);
        assert!(frame.body.is_request());
        assert_eq!(frame.body.protocol_version(), NDMP3VER);
    }

    #[test]
    fn test_partial_frames_reassemble() {
        let (a, b) = socketpair_fds().unwrap();
        let mut rx = Conn::new(ConnType::Remote, "#R");
        rx.chan.start_read(b);

        let frame = WireFrame {
            header: Header::request(MessageCode::TapeClose),
            body: crate::msg::request_from_canonical(NDMP3VER, &RequestBody::TapeClose)
                .unwrap(),
        };
        let body = serde_json::to_vec(&frame).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);

        // dribble the frame one half at a time
        let mid = buf.len() / 2;
        let mut file = std::fs::File::from(a);
        file.write_all(&buf[..mid]).unwrap();
        file.flush().unwrap();

        let mut pfd = [PollFd::new(rx.chan.fd().unwrap(), PollFlags::POLLIN)];
        poll(&mut pfd, 1000).unwrap();
        rx.chan.after_poll(pfd[0].revents().unwrap());
        assert!(rx.try_next_frame().unwrap().is_none());

        file.write_all(&buf[mid..]).unwrap();
        let frame = rx.recv_frame(5_000).unwrap();
        assert_eq!(frame.header.message, MessageCode::TapeClose);
    }
}
