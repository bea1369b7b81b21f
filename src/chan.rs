//! Buffered, non-blocking duplex byte channel over a file descriptor.
//!
//! Channels never block the cooperative scheduler: all fd I/O happens
//! in [`Chan::after_poll`] after the session multiplexer reported
//! readiness, and moves at most one buffer worth of bytes per pass.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::PollFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanMode {
    /// Unused
    Idle,
    /// Listen socket, `ready` set on a pending accept
    Listen,
    /// Connected fd whose transfer direction is not yet committed
    Pending,
    /// Fill the buffer from the fd
    Read,
    /// Drain the buffer to the fd
    Write,
    /// In-process buffer shared between two agents, no fd
    Resident,
    Closed,
}

pub struct Chan {
    pub name: &'static str,
    pub mode: ChanMode,
    fd: Option<OwnedFd>,
    data: Vec<u8>,
    beg_ix: usize,
    end_ix: usize,
    /// Fresh input arrived (or a connection is waiting on a listen
    /// socket) since the flag was last cleared.
    pub ready: bool,
    pub eof: bool,
    pub error: bool,
    pub saved_errno: i32,
}

impl Chan {
    pub fn new(name: &'static str) -> Self {
        Chan {
            name,
            mode: ChanMode::Idle,
            fd: None,
            data: Vec::new(),
            beg_ix: 0,
            end_ix: 0,
            ready: false,
            eof: false,
            error: false,
            saved_errno: 0,
        }
    }

    pub fn set_buffer(&mut self, len: usize) {
        self.data = vec![0; len];
        self.beg_ix = 0;
        self.end_ix = 0;
    }

    pub fn buffer_len(&self) -> usize {
        self.data.len()
    }

    fn set_nonblocking(fd: RawFd) {
        if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
            let mut flags = OFlag::from_bits_truncate(flags);
            flags.insert(OFlag::O_NONBLOCK);
            let _ = fcntl(fd, FcntlArg::F_SETFL(flags));
        }
    }

    pub fn start_listen(&mut self, fd: OwnedFd) {
        Self::set_nonblocking(fd.as_raw_fd());
        self.fd = Some(fd);
        self.mode = ChanMode::Listen;
    }

    pub fn start_pending(&mut self, fd: OwnedFd) {
        Self::set_nonblocking(fd.as_raw_fd());
        self.fd = Some(fd);
        self.mode = ChanMode::Pending;
    }

    pub fn start_read(&mut self, fd: OwnedFd) {
        Self::set_nonblocking(fd.as_raw_fd());
        self.fd = Some(fd);
        self.mode = ChanMode::Read;
    }

    pub fn start_write(&mut self, fd: OwnedFd) {
        Self::set_nonblocking(fd.as_raw_fd());
        self.fd = Some(fd);
        self.mode = ChanMode::Write;
    }

    pub fn start_resident(&mut self) {
        self.mode = ChanMode::Resident;
    }

    pub fn pending_to_read(&mut self) {
        debug_assert_eq!(self.mode, ChanMode::Pending);
        self.mode = ChanMode::Read;
    }

    pub fn pending_to_write(&mut self) {
        debug_assert_eq!(self.mode, ChanMode::Pending);
        self.mode = ChanMode::Write;
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }

    /// Drop the fd and return the channel to idle. Buffered bytes are
    /// discarded.
    pub fn cleanup(&mut self) {
        self.fd = None;
        self.mode = ChanMode::Idle;
        self.beg_ix = 0;
        self.end_ix = 0;
        self.ready = false;
        self.eof = false;
        self.error = false;
        self.saved_errno = 0;
    }

    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Bytes queued for the consumer.
    pub fn n_ready(&self) -> usize {
        self.end_ix - self.beg_ix
    }

    /// Free space for the producer, after compaction.
    pub fn n_avail(&mut self) -> usize {
        self.compact();
        self.data.len() - self.end_ix
    }

    /// Free space measured against a full record: zero unless at
    /// least `record_size` bytes fit.
    pub fn n_avail_record(&mut self, record_size: usize) -> usize {
        let avail = self.n_avail();
        if avail < record_size {
            0
        } else {
            avail
        }
    }

    fn compact(&mut self) {
        if self.beg_ix == self.end_ix {
            self.beg_ix = 0;
            self.end_ix = 0;
        } else if self.beg_ix > 0 {
            self.data.copy_within(self.beg_ix..self.end_ix, 0);
            self.end_ix -= self.beg_ix;
            self.beg_ix = 0;
        }
    }

    pub fn peek(&self) -> &[u8] {
        &self.data[self.beg_ix..self.end_ix]
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.n_ready());
        self.beg_ix += n;
        if self.beg_ix == self.end_ix {
            self.beg_ix = 0;
            self.end_ix = 0;
        }
    }

    pub fn space(&mut self) -> &mut [u8] {
        self.compact();
        let end = self.end_ix;
        &mut self.data[end..]
    }

    pub fn produce(&mut self, n: usize) {
        debug_assert!(self.end_ix + n <= self.data.len());
        self.end_ix += n;
    }

    /// Copy as much of `bytes` as fits into the buffer.
    pub fn put(&mut self, bytes: &[u8]) -> usize {
        let space = self.space();
        let n = space.len().min(bytes.len());
        space[..n].copy_from_slice(&bytes[..n]);
        self.produce(n);
        n
    }

    /// Events this channel wants from the multiplexer, if any.
    pub fn poll_interest(&mut self) -> Option<(RawFd, PollFlags)> {
        let fd = self.fd()?;
        match self.mode {
            ChanMode::Listen => Some((fd, PollFlags::POLLIN)),
            ChanMode::Read => {
                if !self.eof && self.n_avail() > 0 {
                    Some((fd, PollFlags::POLLIN))
                } else {
                    None
                }
            }
            ChanMode::Write => {
                if self.n_ready() > 0 {
                    Some((fd, PollFlags::POLLOUT))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Perform the non-blocking I/O the multiplexer said is possible.
    pub fn after_poll(&mut self, revents: PollFlags) {
        match self.mode {
            ChanMode::Listen => {
                if revents.contains(PollFlags::POLLIN) {
                    self.ready = true;
                }
            }
            ChanMode::Read => {
                if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                    self.do_read();
                }
            }
            ChanMode::Write => {
                if revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR) {
                    self.do_write();
                }
                if self.eof && self.n_ready() == 0 {
                    self.fd = None; // propagate EOF to the peer
                }
            }
            _ => {}
        }
    }

    fn do_read(&mut self) {
        let fd = match self.fd() {
            Some(fd) => fd,
            None => return,
        };
        let space = self.space();
        if space.is_empty() {
            return;
        }
        let mut file = FdIo(fd);
        match file.read(space) {
            Ok(0) => {
                self.eof = true;
            }
            Ok(n) => {
                self.produce(n);
                self.ready = true;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                self.eof = true;
                self.error = true;
                self.saved_errno = err.raw_os_error().unwrap_or(0);
            }
        }
    }

    fn do_write(&mut self) {
        let fd = match self.fd() {
            Some(fd) => fd,
            None => return,
        };
        if self.n_ready() == 0 {
            return;
        }
        let mut file = FdIo(fd);
        match file.write(self.peek()) {
            Ok(n) => self.consume(n),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                self.eof = true;
                self.error = true;
                self.saved_errno = err.raw_os_error().unwrap_or(0);
            }
        }
    }

    /// One line status for debug tattling.
    pub fn pp(&self) -> String {
        format!(
            "{} mode={:?} ready={} {}..{}/{}{}{}",
            self.name,
            self.mode,
            self.ready,
            self.beg_ix,
            self.end_ix,
            self.data.len(),
            if self.eof { " EOF" } else { "" },
            if self.error { " ERROR" } else { "" },
        )
    }
}

/// Borrowed-fd Read/Write shim; does not close on drop.
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_buffer_accounting() {
        let mut ch = Chan::new("test");
        ch.set_buffer(16);
        ch.start_resident();

        assert_eq!(ch.put(b"0123456789"), 10);
        assert_eq!(ch.n_ready(), 10);
        assert_eq!(ch.n_avail(), 6);

        ch.consume(8);
        // compaction makes the full tail usable again
        assert_eq!(ch.n_avail(), 14);
        assert_eq!(ch.peek(), b"89");

        assert_eq!(ch.n_avail_record(15), 0);
        assert_eq!(ch.n_avail_record(14), 14);
    }

    #[test]
    fn test_put_partial() {
        let mut ch = Chan::new("test");
        ch.set_buffer(4);
        assert_eq!(ch.put(b"abcdef"), 4);
        assert_eq!(ch.peek(), b"abcd");
    }
}
