//! Image stream plumbing between the DATA and TAPE (MOVER) agents.
//!
//! Two logical endpoints share one transport. When both sides of a
//! session agree on LOCAL addressing the bytes pass through a single
//! in-process channel and the remote transport is marked EXCLUDE;
//! otherwise one side listens on TCP, the other connects, and the
//! channel rides the socket.
//!
//! Endpoint status transitions relative to "mine":
//!
//! ```text
//!   event              MINE     PEER     REMOTE
//!   listen/LOCAL       LISTEN   IDLE     EXCLUDE
//!   listen/TCP         LISTEN   REMOTE   LISTEN
//!   connect/LOCAL      CONN'ED  ACC'ED   EXCLUDE
//!   connect/TCP        CONN'ED  REMOTE   CONN'ED
//!   tcp accept         ACC'ED   REMOTE   ACC'ED
//! ```

use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use ndmp_api_types::{AddrType, DataAddr, NdmpError, NdmpResult, TcpAddr};

use crate::chan::Chan;
use crate::conn::sockaddr_of;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsConnectStatus {
    Idle,
    Listen,
    Accepted,
    Connected,
    Disconnected,
    Closed,
    Botched,
    /// The other end of this transport lives in another process
    Remote,
    /// LOCAL linkage in effect, the remote transport is unused
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Idle,
    Read,
    Write,
}

/// Which endpoint an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndSel {
    Data,
    Tape,
}

pub struct EndPoint {
    pub name: &'static str,
    pub connect_status: IsConnectStatus,
    pub transfer_mode: TransferMode,
    pub addr_type: Option<AddrType>,
}

impl EndPoint {
    fn new(name: &'static str) -> Self {
        EndPoint {
            name,
            connect_status: IsConnectStatus::Idle,
            transfer_mode: TransferMode::Idle,
            addr_type: None,
        }
    }

    fn reset(&mut self) {
        let name = self.name;
        *self = EndPoint::new(name);
    }
}

pub struct RemoteTransport {
    pub connect_status: IsConnectStatus,
    pub listen_chan: Chan,
    pub listen_addr: Option<TcpAddr>,
    pub local_addr: Option<TcpAddr>,
    pub peer_addr: Option<TcpAddr>,
}

/// Hints for picking the IP a TCP listen advertises: prefer the
/// address the CONTROL agent connected through, fall back to the
/// configured hostname.
#[derive(Debug, Clone, Default)]
pub struct ListenHint {
    pub control_ip: Option<Ipv4Addr>,
    pub hostname: String,
}

pub struct ImageStream {
    pub data_ep: EndPoint,
    pub tape_ep: EndPoint,
    pub remote: RemoteTransport,
    /// The transfer channel. Resident for LOCAL linkage, fd-backed
    /// for TCP.
    pub chan: Chan,
    buflen: usize,
}

impl ImageStream {
    pub fn new(record_size: usize) -> Self {
        let mut is = ImageStream {
            data_ep: EndPoint::new("DATA"),
            tape_ep: EndPoint::new("TAPE"),
            remote: RemoteTransport {
                connect_status: IsConnectStatus::Idle,
                listen_chan: Chan::new("image-stream-listen"),
                listen_addr: None,
                local_addr: None,
                peer_addr: None,
            },
            chan: Chan::new("image-stream"),
            buflen: record_size,
        };
        is.chan.set_buffer(record_size);
        is
    }

    /// Resize the transfer buffer. Takes effect immediately while
    /// the transport is idle, otherwise at its next initialization.
    pub fn set_record_size(&mut self, record_size: usize) {
        self.buflen = record_size;
        if self.chan.mode == crate::chan::ChanMode::Idle {
            self.chan.set_buffer(record_size);
        }
    }

    pub fn reinit_remote(&mut self) {
        self.remote.connect_status = IsConnectStatus::Idle;
        self.remote.listen_chan.cleanup();
        self.remote.listen_addr = None;
        self.remote.local_addr = None;
        self.remote.peer_addr = None;
        self.chan.cleanup();
        self.chan.set_buffer(self.buflen);
    }

    fn eps_mut(&mut self, which: EndSel) -> (&mut EndPoint, &mut EndPoint) {
        match which {
            EndSel::Data => (&mut self.data_ep, &mut self.tape_ep),
            EndSel::Tape => (&mut self.tape_ep, &mut self.data_ep),
        }
    }

    /*
     * Audits -- state checks without side effects
     */

    pub fn audit_ep_listen(&mut self, which: EndSel, addr_type: AddrType) -> NdmpResult<()> {
        let (mine, peer) = self.eps_mut(which);
        if mine.connect_status != IsConnectStatus::Idle {
            log::info!("IS {}_LISTEN: {} not idle", mine.name, mine.name);
            return Err(NdmpError::IllegalState);
        }
        if peer.connect_status != IsConnectStatus::Idle {
            log::info!("IS {}_LISTEN: {} not idle", mine.name, peer.name);
            return Err(NdmpError::IllegalState);
        }
        match addr_type {
            AddrType::Local | AddrType::Tcp => Ok(()),
            AddrType::AsConnected => Err(NdmpError::IllegalArgs),
        }
    }

    pub fn audit_ep_connect(&mut self, which: EndSel, addr_type: AddrType) -> NdmpResult<()> {
        let (mine, peer) = self.eps_mut(which);
        if mine.connect_status != IsConnectStatus::Idle {
            log::info!("IS {}_CONNECT: {} not idle", mine.name, mine.name);
            return Err(NdmpError::IllegalState);
        }
        match addr_type {
            AddrType::Local => {
                if peer.connect_status != IsConnectStatus::Listen {
                    log::info!("IS {}_CONNECT: LOCAL {} not LISTEN", mine.name, peer.name);
                    return Err(NdmpError::IllegalState);
                }
                if peer.addr_type != Some(AddrType::Local) {
                    log::info!("IS {}_CONNECT: LOCAL {} not LOCAL", mine.name, peer.name);
                    return Err(NdmpError::IllegalState);
                }
                Ok(())
            }
            AddrType::Tcp => {
                if peer.connect_status != IsConnectStatus::Idle {
                    log::info!("IS {}_CONNECT: TCP {} not IDLE", mine.name, peer.name);
                    return Err(NdmpError::IllegalState);
                }
                Ok(())
            }
            AddrType::AsConnected => Err(NdmpError::IllegalArgs),
        }
    }

    /*
     * Semantic actions
     */

    pub fn ep_listen(
        &mut self,
        which: EndSel,
        addr_type: AddrType,
        hint: &ListenHint,
    ) -> NdmpResult<DataAddr> {
        self.audit_ep_listen(which, addr_type)?;

        match addr_type {
            AddrType::Local => {
                let (mine, _) = self.eps_mut(which);
                mine.addr_type = Some(AddrType::Local);
                mine.connect_status = IsConnectStatus::Listen;
                self.remote.connect_status = IsConnectStatus::Exclude;
                Ok(DataAddr::Local)
            }
            AddrType::Tcp => {
                let listen_addr = self.tcp_listen(hint)?;
                let (mine, peer) = self.eps_mut(which);
                mine.addr_type = Some(AddrType::Tcp);
                mine.connect_status = IsConnectStatus::Listen;
                peer.connect_status = IsConnectStatus::Remote;
                Ok(DataAddr::Tcp(listen_addr))
            }
            AddrType::AsConnected => Err(NdmpError::IllegalArgs),
        }
    }

    pub fn ep_connect(&mut self, which: EndSel, addr: &DataAddr) -> NdmpResult<()> {
        self.audit_ep_connect(which, addr.addr_type())?;

        match addr {
            DataAddr::Local => {
                let (mine, peer) = self.eps_mut(which);
                mine.addr_type = Some(AddrType::Local);
                mine.connect_status = IsConnectStatus::Connected;
                peer.connect_status = IsConnectStatus::Accepted;
                self.remote.connect_status = IsConnectStatus::Exclude;
                Ok(())
            }
            DataAddr::Tcp(tcp) => {
                self.tcp_connect(tcp)?;
                let (mine, peer) = self.eps_mut(which);
                mine.addr_type = Some(AddrType::Tcp);
                mine.connect_status = IsConnectStatus::Connected;
                peer.connect_status = IsConnectStatus::Remote;
                Ok(())
            }
            DataAddr::AsConnected => Err(NdmpError::IllegalArgs),
        }
    }

    /// Commit a transfer direction once a start request arrives.
    ///
    /// With LOCAL linkage whichever side starts first commits both
    /// directions; the second start finds its mode already set and
    /// succeeds as long as it agrees.
    pub fn ep_start(&mut self, which: EndSel, mode: TransferMode) -> Result<(), &'static str> {
        let local = {
            let (mine, _) = self.eps_mut(which);
            if mine.connect_status != IsConnectStatus::Connected
                && mine.connect_status != IsConnectStatus::Accepted
            {
                return Err("endpoint not connected");
            }
            if mine.transfer_mode != TransferMode::Idle {
                if mine.addr_type == Some(AddrType::Local) && mine.transfer_mode == mode {
                    return Ok(());
                }
                return Err("transfer already started");
            }
            mine.addr_type == Some(AddrType::Local)
        };

        if local {
            self.chan.start_resident();
            let (mine, peer) = self.eps_mut(which);
            peer.transfer_mode = match mode {
                TransferMode::Write => TransferMode::Read,
                _ => TransferMode::Write,
            };
            mine.transfer_mode = mode;
        } else {
            match mode {
                TransferMode::Write => self.chan.pending_to_write(),
                TransferMode::Read => self.chan.pending_to_read(),
                TransferMode::Idle => return Err("bad transfer mode"),
            }
            let (mine, _) = self.eps_mut(which);
            mine.transfer_mode = mode;
        }
        Ok(())
    }

    /// Release one endpoint, propagating EOF to the peer. Illegal
    /// peer states are logged as messy but still freed.
    pub fn ep_close(&mut self, which: EndSel) -> i32 {
        let (mine_status, mine_addr_type, mine_mode) = {
            let (mine, _) = self.eps_mut(which);
            (mine.connect_status, mine.addr_type, mine.transfer_mode)
        };

        let mut messy = false;
        match mine_status {
            IsConnectStatus::Idle => return 0,

            IsConnectStatus::Botched
            | IsConnectStatus::Remote
            | IsConnectStatus::Exclude
            | IsConnectStatus::Closed => messy = true,

            IsConnectStatus::Listen => match mine_addr_type {
                Some(AddrType::Local) => {
                    self.reinit_remote();
                    let (_, peer) = self.eps_mut(which);
                    if peer.connect_status != IsConnectStatus::Idle {
                        messy = true;
                    }
                }
                Some(AddrType::Tcp) => {
                    self.tcp_close();
                    let (_, peer) = self.eps_mut(which);
                    if peer.connect_status == IsConnectStatus::Remote {
                        peer.connect_status = IsConnectStatus::Idle;
                    } else {
                        messy = true;
                    }
                }
                _ => messy = true,
            },

            IsConnectStatus::Accepted | IsConnectStatus::Connected => match mine_addr_type {
                Some(AddrType::Local) => {
                    let expect = if mine_status == IsConnectStatus::Accepted {
                        IsConnectStatus::Connected
                    } else {
                        IsConnectStatus::Accepted
                    };
                    let (_, peer) = self.eps_mut(which);
                    if peer.connect_status == expect {
                        peer.connect_status = IsConnectStatus::Disconnected;
                    } else {
                        messy = true;
                    }
                    self.chan.eof = true;
                    if mine_mode == TransferMode::Read {
                        self.chan.error = true; // EPIPE for the writer
                    }
                }
                Some(AddrType::Tcp) => {
                    self.tcp_close();
                    let (_, peer) = self.eps_mut(which);
                    if peer.connect_status == IsConnectStatus::Remote {
                        peer.connect_status = IsConnectStatus::Idle;
                    } else {
                        messy = true;
                    }
                }
                _ => messy = true,
            },

            IsConnectStatus::Disconnected => {
                // peer closed first
                self.reinit_remote();
            }
        }

        let (mine, peer) = self.eps_mut(which);
        if messy {
            log::info!(
                "close {} messy mcs={:?} pcs={:?}",
                mine.name,
                mine.connect_status,
                peer.connect_status
            );
        }
        mine.reset();
        if messy {
            -1
        } else {
            0
        }
    }

    /*
     * Quantum -- accept pending TCP connections
     */

    pub fn quantum(&mut self) -> bool {
        if self.remote.connect_status != IsConnectStatus::Listen {
            return false;
        }
        if !self.remote.listen_chan.ready {
            return false;
        }
        self.remote.listen_chan.ready = false;

        let which = if self.data_ep.connect_status == IsConnectStatus::Listen {
            EndSel::Data
        } else if self.tape_ep.connect_status == IsConnectStatus::Listen {
            EndSel::Tape
        } else {
            log::error!("image stream listen ready with no listening endpoint");
            return false;
        };

        let status = match self.tcp_accept() {
            Ok(()) => IsConnectStatus::Accepted,
            Err(()) => IsConnectStatus::Botched,
        };
        let (mine, _) = self.eps_mut(which);
        mine.connect_status = status;
        self.remote.connect_status = status;
        true
    }

    /*
     * TCP helpers
     */

    fn tcp_listen(&mut self, hint: &ListenHint) -> NdmpResult<TcpAddr> {
        // The IP we advertise steers multi-homed hosts: use the
        // address the control connection came in on, else resolve
        // the configured hostname.
        let advertise_ip = match hint.control_ip {
            Some(ip) => ip,
            None => resolve_hostname(&hint.hostname).ok_or(NdmpError::Connect)?,
        };

        let listener = TcpListener::bind(("0.0.0.0", 0)).map_err(|err| {
            log::info!("image stream listen failed: {}", err);
            NdmpError::Connect
        })?;
        let port = listener
            .local_addr()
            .map_err(|_| NdmpError::Connect)?
            .port();

        let fd: OwnedFd = listener.into();
        self.remote.listen_chan.start_listen(fd);
        self.remote.connect_status = IsConnectStatus::Listen;

        let addr = TcpAddr::new(u32::from(advertise_ip), port);
        self.remote.listen_addr = Some(addr.clone());
        Ok(addr)
    }

    fn tcp_accept(&mut self) -> Result<(), ()> {
        let listen_fd = match self.remote.listen_chan.fd() {
            Some(fd) => fd,
            None => return Err(()),
        };
        let sock = match nix::sys::socket::accept(listen_fd) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(err) => {
                log::info!("image stream accept failed: {}", err);
                self.remote.listen_chan.cleanup();
                return Err(());
            }
        };
        self.remote.listen_chan.cleanup();
        self.green_light(sock);
        Ok(())
    }

    fn tcp_connect(&mut self, tcp: &TcpAddr) -> NdmpResult<()> {
        let stream = TcpStream::connect(tcp.to_socket_addr()).map_err(|err| {
            log::info!("image stream connect failed: {}", err);
            NdmpError::Connect
        })?;
        self.remote.peer_addr = Some(tcp.clone());
        self.green_light(stream.into());
        self.remote.connect_status = IsConnectStatus::Connected;
        Ok(())
    }

    /// Adopt a connected image-stream socket; the channel starts in
    /// pending mode until a start request commits a direction.
    fn green_light(&mut self, sock: OwnedFd) {
        let raw = sock.as_raw_fd();
        if let Some(addr) = sockaddr_of(raw, true) {
            if let (std::net::IpAddr::V4(ip), port) = (addr.ip(), addr.port()) {
                self.remote.peer_addr = Some(TcpAddr::new(u32::from(ip), port));
            }
        }
        if let Some(addr) = sockaddr_of(raw, false) {
            if let (std::net::IpAddr::V4(ip), port) = (addr.ip(), addr.port()) {
                self.remote.local_addr = Some(TcpAddr::new(u32::from(ip), port));
            }
        }
        self.chan.set_buffer(self.buflen.max(4096));
        self.chan.start_pending(sock);
    }

    fn tcp_close(&mut self) {
        match self.remote.connect_status {
            IsConnectStatus::Listen => self.remote.listen_chan.cleanup(),
            IsConnectStatus::Connected | IsConnectStatus::Accepted => self.chan.cleanup(),
            _ => {}
        }
        self.reinit_remote();
    }
}

fn resolve_hostname(hostname: &str) -> Option<Ipv4Addr> {
    use std::net::ToSocketAddrs;
    if hostname.is_empty() {
        return None;
    }
    let addrs = (hostname, 0u16).to_socket_addrs().ok()?;
    for addr in addrs {
        if let std::net::IpAddr::V4(ip) = addr.ip() {
            return Some(ip);
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_local_listen_then_connect() {
        let mut is = ImageStream::new(4096);
        let hint = ListenHint::default();

        let addr = is
            .ep_listen(EndSel::Tape, AddrType::Local, &hint)
            .unwrap();
        assert_eq!(addr, DataAddr::Local);
        assert_eq!(is.remote.connect_status, IsConnectStatus::Exclude);

        is.ep_connect(EndSel::Data, &DataAddr::Local).unwrap();
        assert_eq!(is.data_ep.connect_status, IsConnectStatus::Connected);
        assert_eq!(is.tape_ep.connect_status, IsConnectStatus::Accepted);

        is.ep_start(EndSel::Data, TransferMode::Write).unwrap();
        assert_eq!(is.tape_ep.transfer_mode, TransferMode::Read);

        // the peer's start agrees with the committed direction
        is.ep_start(EndSel::Tape, TransferMode::Read).unwrap();
        // a conflicting direction is refused
        assert!(is.ep_start(EndSel::Data, TransferMode::Read).is_err());
    }

    #[test]
    fn test_local_close_propagates_eof() {
        let mut is = ImageStream::new(1024);
        let hint = ListenHint::default();
        is.ep_listen(EndSel::Tape, AddrType::Local, &hint).unwrap();
        is.ep_connect(EndSel::Data, &DataAddr::Local).unwrap();
        is.ep_start(EndSel::Data, TransferMode::Write).unwrap();
        is.ep_start(EndSel::Tape, TransferMode::Read).unwrap();

        is.ep_close(EndSel::Data);
        assert!(is.chan.eof);
        assert_eq!(is.tape_ep.connect_status, IsConnectStatus::Disconnected);
        assert_eq!(is.data_ep.connect_status, IsConnectStatus::Idle);
    }

    #[test]
    fn test_listen_audit_rejects_busy_endpoints() {
        let mut is = ImageStream::new(1024);
        let hint = ListenHint::default();
        is.ep_listen(EndSel::Data, AddrType::Local, &hint).unwrap();
        assert_eq!(
            is.ep_listen(EndSel::Data, AddrType::Local, &hint),
            Err(NdmpError::IllegalState)
        );
        assert_eq!(
            is.ep_listen(EndSel::Tape, AddrType::Local, &hint),
            Err(NdmpError::IllegalState)
        );
    }
}
