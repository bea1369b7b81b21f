//! Session kernel and cooperative scheduler.
//!
//! One process, one session, one event loop. The quantum lets every
//! agent make in-memory progress until quiescent, blocks in poll(2)
//! on the union of interesting descriptors, drives channel I/O,
//! gives the agents another pass, then dispatches at most one framed
//! request per ready control connection.

use std::collections::VecDeque;
use std::os::fd::RawFd;

use anyhow::{format_err, Error};
use nix::poll::{poll, PollFd, PollFlags};

use ndmp_api_types::*;
use ndmp_tape::TapeDeviceOpen;

use crate::chan::Chan;
use crate::conn::{CallStatus, Conn, ConnType};
use crate::control::ControlAgent;
use crate::data::{self, DataAgent};
use crate::image_stream::{ImageStream, IsConnectStatus, ListenHint};
use crate::msg::{reply_to_canonical, ConfigInfo, MessageType, RequestBody, XaBuf};
use crate::notify::{AgentRole, Notice, NoticeKind};
use crate::robot::{RobotAgent, RobotOps};
use crate::tape_agent::{self, TapeAgent};

/// Which connection slot a message context refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlumbSlot {
    Control,
    Data,
    Tape,
    Robot,
}

/// Borrow-free connection context handed to request handlers.
#[derive(Debug, Clone, Copy)]
pub struct ConnRef {
    pub slot: PlumbSlot,
    pub protocol_version: u16,
}

pub const PLUMB_SLOTS: [PlumbSlot; 4] = [
    PlumbSlot::Control,
    PlumbSlot::Data,
    PlumbSlot::Tape,
    PlumbSlot::Robot,
];

/// Connection slots. Distinct slots may share one connection (the
/// same remote host serving both DATA and TAPE), so the slots index
/// into a pool and dedup falls out naturally.
#[derive(Default)]
pub struct Plumb {
    conns: Vec<Option<Conn>>,
    control: Option<usize>,
    data: Option<usize>,
    tape: Option<usize>,
    robot: Option<usize>,
}

impl Plumb {
    fn slot_ix(&self, slot: PlumbSlot) -> Option<usize> {
        match slot {
            PlumbSlot::Control => self.control,
            PlumbSlot::Data => self.data,
            PlumbSlot::Tape => self.tape,
            PlumbSlot::Robot => self.robot,
        }
    }

    fn slot_ix_mut(&mut self, slot: PlumbSlot) -> &mut Option<usize> {
        match slot {
            PlumbSlot::Control => &mut self.control,
            PlumbSlot::Data => &mut self.data,
            PlumbSlot::Tape => &mut self.tape,
            PlumbSlot::Robot => &mut self.robot,
        }
    }

    pub fn get(&self, slot: PlumbSlot) -> Option<&Conn> {
        self.conns.get(self.slot_ix(slot)?)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: PlumbSlot) -> Option<&mut Conn> {
        let ix = self.slot_ix(slot)?;
        self.conns.get_mut(ix)?.as_mut()
    }

    pub fn set(&mut self, slot: PlumbSlot, conn: Option<Conn>) {
        // drop an existing unshared connection in this slot
        if let Some(old_ix) = self.slot_ix(slot) {
            let shared = PLUMB_SLOTS
                .iter()
                .any(|&other| other != slot && self.slot_ix(other) == Some(old_ix));
            if !shared {
                if let Some(old) = self.conns.get_mut(old_ix) {
                    if let Some(mut old) = old.take() {
                        old.destruct();
                    }
                }
            }
        }
        match conn {
            Some(conn) => {
                self.conns.push(Some(conn));
                *self.slot_ix_mut(slot) = Some(self.conns.len() - 1);
            }
            None => *self.slot_ix_mut(slot) = None,
        }
    }

    /// Point `to` at the connection already serving `from`.
    pub fn share(&mut self, from: PlumbSlot, to: PlumbSlot) -> bool {
        match self.slot_ix(from) {
            Some(ix) => {
                *self.slot_ix_mut(to) = Some(ix);
                true
            }
            None => false,
        }
    }

    pub fn is_shared(&self, a: PlumbSlot, b: PlumbSlot) -> bool {
        match (self.slot_ix(a), self.slot_ix(b)) {
            (Some(ia), Some(ib)) => ia == ib,
            _ => false,
        }
    }

    /// First slot naming each distinct live connection.
    pub fn distinct_slots(&self) -> Vec<PlumbSlot> {
        let mut seen: Vec<usize> = Vec::new();
        let mut slots = Vec::new();
        for &slot in PLUMB_SLOTS.iter() {
            if let Some(ix) = self.slot_ix(slot) {
                if self.conns.get(ix).map(|c| c.is_some()).unwrap_or(false)
                    && !seen.contains(&ix)
                {
                    seen.push(ix);
                    slots.push(slot);
                }
            }
        }
        slots
    }

    pub fn each_conn_mut(&mut self, visit: &mut dyn FnMut(&mut Conn)) {
        for conn in self.conns.iter_mut().flatten() {
            visit(conn);
        }
    }

    pub fn clear(&mut self) {
        for conn in self.conns.iter_mut().flatten() {
            conn.destruct();
        }
        self.conns.clear();
        self.control = None;
        self.data = None;
        self.tape = None;
        self.robot = None;
    }
}

/// Authentication backends; the core never computes credentials
/// itself.
pub trait AuthCallbacks: Send {
    fn validate_password(&self, name: &str, pass: &str) -> bool;
    fn validate_md5(&self, name: &str, digest: &[u8; 16], challenge: &[u8; 64]) -> bool;
}

/// Media lifecycle hooks the host can interpose on tape changes.
#[derive(Clone, Copy, Default)]
pub struct MediaCallbacks {
    pub load_first: Option<fn(&mut Session) -> Result<(), Error>>,
    pub load_next: Option<fn(&mut Session) -> Result<(), Error>>,
    pub unload_current: Option<fn(&mut Session) -> Result<(), Error>>,
}

/// Query hooks answering CONFIG_GET_INFO beyond what the session
/// knows itself.
pub trait QueryCallbacks: Send {
    fn butype_info(&self) -> Vec<crate::msg::ButypeInfo> {
        Vec::new()
    }
    fn fs_info(&self) -> Vec<crate::msg::FsInfo> {
        Vec::new()
    }
    fn tape_info(&self) -> Vec<crate::msg::DeviceInfo> {
        Vec::new()
    }
    fn scsi_info(&self) -> Vec<crate::msg::DeviceInfo> {
        Vec::new()
    }
}

/// Maps a bu_type plus job arguments onto the formatter command
/// line. `None` rejects the bu_type.
pub type FormatterResolver = Box<
    dyn Fn(&str, DataOperation, &[Pval], &[NlistEntry]) -> Option<String> + Send,
>;

/// OS/implementation override: may preempt any request before the
/// standard handler runs.
pub type OsDispatchHook = fn(&mut Session, &mut XaBuf, ConnRef) -> Option<i32>;

#[derive(Default)]
pub struct Callbacks {
    pub auth: Option<Box<dyn AuthCallbacks>>,
    pub tape_open: Option<TapeDeviceOpen>,
    pub robot_ops: Option<Box<dyn RobotOps>>,
    pub media: Option<MediaCallbacks>,
    pub jobcontrol_is_cancelled: Option<fn(&Session) -> bool>,
    pub query: Option<Box<dyn QueryCallbacks>>,
    pub formatter: Option<FormatterResolver>,
    pub os_dispatch: Option<OsDispatchHook>,
}

#[derive(Clone, Default)]
pub struct SessionParam {
    pub log_tag: String,
    pub log_level: i32,
    pub hostname: String,
}

/// Which roles a session embodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleSet {
    pub control: bool,
    pub data: bool,
    pub tape: bool,
    pub robot: bool,
}

impl RoleSet {
    pub fn all() -> Self {
        RoleSet {
            control: true,
            data: true,
            tape: true,
            robot: true,
        }
    }
}

pub struct Session {
    pub param: SessionParam,

    pub control: Option<Box<ControlAgent>>,
    pub data: Option<Box<DataAgent>>,
    pub tape: Option<Box<TapeAgent>>,
    pub robot: Option<Box<RobotAgent>>,

    pub plumb: Plumb,
    pub image_stream: Option<Box<ImageStream>>,

    pub config_info: Option<ConfigInfo>,
    pub md5_challenge: [u8; 64],
    pub md5_challenge_valid: bool,

    pub conn_open: bool,
    pub conn_authorized: bool,
    pub conn_snooping: bool,
    pub error_raised: bool,

    /// Permit the tape drive and the SCSI pass-through to be open at
    /// the same time. Robot-driven jobs hosted in a single session
    /// need this; embedders that hand both roles the same device
    /// handle clear it.
    pub allow_scsi_and_tape_both_open: bool,

    pub cbs: Callbacks,
    pub notices: VecDeque<Notice>,
}

impl Session {
    pub fn new(param: SessionParam) -> Self {
        Session {
            param,
            control: None,
            data: None,
            tape: None,
            robot: None,
            plumb: Plumb::default(),
            image_stream: None,
            config_info: None,
            md5_challenge: [0; 64],
            md5_challenge_valid: false,
            conn_open: false,
            conn_authorized: false,
            conn_snooping: false,
            error_raised: false,
            allow_scsi_and_tape_both_open: true,
            cbs: Callbacks::default(),
            notices: VecDeque::new(),
        }
    }

    /// Allocate per-role control blocks. Idempotent for roles that
    /// already exist.
    pub fn initialize(&mut self, roles: RoleSet) {
        if roles.control && self.control.is_none() {
            self.control = Some(Box::new(ControlAgent::new()));
        }
        if roles.data && self.data.is_none() {
            self.data = Some(Box::new(DataAgent::new()));
        }
        if roles.tape && self.tape.is_none() {
            self.tape = Some(Box::new(TapeAgent::new()));
        }
        if roles.robot && self.robot.is_none() {
            self.robot = Some(Box::new(RobotAgent::new()));
        }
        if self.image_stream.is_none() {
            let record_size = self
                .tape
                .as_ref()
                .map(|ta| ta.mover_state.record_size as usize)
                .unwrap_or(tape_agent::DEFAULT_RECORD_SIZE as usize);
            self.image_stream = Some(Box::new(ImageStream::new(record_size)));
        }
    }

    /// Reset agent state machines; required before accepting
    /// messages that demand an open session.
    pub fn commission(&mut self) {
        if let Some(ta) = self.tape.as_mut() {
            ta.init_mover_state();
        }
        if let Some(da) = self.data.as_mut() {
            da.data_state = Default::default();
        }
    }

    pub fn decommission(&mut self) {
        if let Some(is) = self.image_stream.as_mut() {
            is.ep_close(crate::image_stream::EndSel::Data);
            is.ep_close(crate::image_stream::EndSel::Tape);
        }
        self.deliver_notices();
    }

    /// Tear down all resources; safe on partial construction.
    pub fn destroy(&mut self) {
        self.decommission();
        self.plumb.clear();
        self.config_info = None;
        self.image_stream = None;
        self.control = None;
        self.data = None;
        self.tape = None;
        self.robot = None;
    }

    /*
     * Cooperative scheduler
     */

    /// Let the agents do as much in-memory progress as possible.
    /// Each step is bounded by one tape record or one pipe buffer.
    pub fn distribute_quantum(&mut self) -> bool {
        let mut total_did_something = false;
        loop {
            let mut did_something = false;

            if let Some(is) = self.image_stream.as_deref_mut() {
                did_something |= is.quantum();
            }

            if let (Some(ta), Some(is)) =
                (self.tape.as_deref_mut(), self.image_stream.as_deref_mut())
            {
                if ta.mover_state.state != MoverState::Idle {
                    did_something |= tape_agent::quantum(ta, is, &mut self.notices);
                }
            }

            if let (Some(da), Some(is)) =
                (self.data.as_deref_mut(), self.image_stream.as_deref_mut())
            {
                if da.data_state.state != DataState::Idle {
                    did_something |= data::quantum(da, is, &mut self.notices);
                }
            }

            total_did_something |= did_something;
            if !did_something {
                break;
            }
        }
        total_did_something
    }

    fn visit_chans(&mut self, visit: &mut dyn FnMut(&mut Chan)) {
        self.plumb.each_conn_mut(&mut |conn| {
            if conn.is_remote() {
                visit(&mut conn.chan);
            }
        });

        if let Some(da) = self.data.as_deref_mut() {
            if da.data_state.state != DataState::Idle {
                if let Some(formatter) = da.formatter.as_mut() {
                    visit(&mut formatter.image_chan);
                    visit(&mut formatter.error_chan);
                    visit(&mut formatter.wrap_chan);
                }
            }
        }

        if let Some(is) = self.image_stream.as_deref_mut() {
            if is.remote.connect_status == IsConnectStatus::Listen {
                visit(&mut is.remote.listen_chan);
            }
            visit(&mut is.chan);
        }
    }

    /// One pass of the event loop. Returns once something was done
    /// or `max_delay_ms` elapsed.
    pub fn quantum(&mut self, max_delay_ms: i32) {
        let mut delay = max_delay_ms;

        // fill channel buffers as much as possible prior to blocking
        if self.distribute_quantum() {
            delay = 0;
        }

        // requests already sitting in a receive buffer must not wait
        // out the poll delay
        let mut buffered = false;
        self.plumb.each_conn_mut(&mut |conn| {
            if conn.is_remote() && conn.has_buffered_frame() {
                buffered = true;
            }
        });
        if buffered {
            delay = 0;
        }

        let mut interests: Vec<(RawFd, PollFlags)> = Vec::new();
        self.visit_chans(&mut |chan| {
            if let Some(interest) = chan.poll_interest() {
                interests.push(interest);
            }
        });

        if !interests.is_empty() {
            let mut pfds: Vec<PollFd> = interests
                .iter()
                .map(|(fd, events)| PollFd::new(*fd, *events))
                .collect();
            let _ = poll(&mut pfds, delay);

            let revents: Vec<(RawFd, PollFlags)> = interests
                .iter()
                .zip(pfds.iter())
                .map(|((fd, _), pfd)| (*fd, pfd.revents().unwrap_or(PollFlags::empty())))
                .collect();

            self.visit_chans(&mut |chan| {
                if let Some(fd) = chan.fd() {
                    if let Some((_, flags)) = revents.iter().find(|(rfd, _)| *rfd == fd) {
                        if !flags.is_empty() {
                            chan.after_poll(*flags);
                        }
                    }
                }
            });
        } else if delay > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delay.min(100) as u64));
        }

        if self.param.log_level > 7 {
            self.visit_chans(&mut |chan| log::trace!("ch {}", chan.pp()));
        }

        // digest whatever just arrived
        self.distribute_quantum();

        // dispatch pending activity on the control connections
        for slot in self.plumb.distinct_slots() {
            let ready = match self.plumb.get_mut(slot) {
                Some(conn) if conn.is_remote() => {
                    let ready = conn.chan.ready || conn.has_buffered_frame();
                    conn.chan.ready = false;
                    ready
                }
                _ => false,
            };
            if ready {
                self.dispatch_conn(slot);
            }
        }

        self.deliver_notices();
    }

    /// Decode and dispatch one framed request from a connection.
    pub fn dispatch_conn(&mut self, slot: PlumbSlot) {
        let frame = {
            let conn = match self.plumb.get_mut(slot) {
                Some(conn) => conn,
                None => return,
            };
            match conn.try_next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) => {
                    log::info!("bad frame on {:?} connection: {}", slot, err);
                    if let Some(conn) = self.plumb.get_mut(slot) {
                        conn.chan.set_eof();
                    }
                    return;
                }
            }
        };

        if frame.header.message_type != MessageType::Request {
            log::info!(
                "Unexpected message, probably reply w/ wrong reply_sequence"
            );
            return;
        }

        crate::dispatch::dispatch_wire_request(self, slot, frame);
    }

    /*
     * Outgoing calls (CONTROL agent and notifications)
     */

    /// Marshal, transmit, await, classify. The canonical request in
    /// `xa` is bridged to the connection's wire version and back.
    pub fn call(&mut self, slot: PlumbSlot, xa: &mut XaBuf) -> CallStatus {
        let rc = self.call_no_tattle(slot, xa);
        if rc != CallStatus::Ok {
            self.tattle(slot, xa, rc);
        }
        rc
    }

    pub fn call_no_tattle(&mut self, slot: PlumbSlot, xa: &mut XaBuf) -> CallStatus {
        let conn_type = match self.plumb.get(slot) {
            Some(conn) => conn.conn_type,
            None => return CallStatus::Botch,
        };

        let status = match conn_type {
            ConnType::Resident => {
                let version = NDMP9VER;
                let conn_ref = ConnRef {
                    slot,
                    protocol_version: version,
                };
                crate::dispatch::dispatch_request(self, xa, conn_ref);
                if !xa.reply.header.error.is_ok() {
                    CallStatus::HdrError
                } else if !xa.reply.body.body_error().is_ok() {
                    CallStatus::ReplyError
                } else {
                    CallStatus::Ok
                }
            }
            ConnType::Remote => self.call_remote(slot, xa),
        };

        if let Some(conn) = self.plumb.get_mut(slot) {
            conn.last_call_status = status;
            conn.last_header_error = xa.reply.header.error;
            conn.last_reply_error = xa.reply.body.body_error();
        }
        status
    }

    fn call_remote(&mut self, slot: PlumbSlot, xa: &mut XaBuf) -> CallStatus {
        let frame = {
            let conn = match self.plumb.get_mut(slot) {
                Some(conn) => conn,
                None => return CallStatus::Botch,
            };
            match conn.call_remote(&xa.request.body) {
                Ok(frame) => frame,
                Err(err) => {
                    log::info!("call failed on {:?} connection: {}", slot, err);
                    return CallStatus::Botch;
                }
            }
        };

        xa.reply.header = frame.header;
        match reply_to_canonical(frame.body) {
            Ok(body) => xa.reply.body = body,
            Err(_) => {
                xa.reply.header.error = NdmpError::Undefined;
                return CallStatus::HdrError;
            }
        }

        // unsolicited requests arrived interleaved with the reply
        self.dispatch_unexpected(slot);

        let late = self
            .plumb
            .get(slot)
            .map(|conn| conn.reply_was_late())
            .unwrap_or(false);

        if !xa.reply.header.error.is_ok() {
            CallStatus::HdrError
        } else if !xa.reply.body.body_error().is_ok() {
            CallStatus::ReplyError
        } else if late {
            CallStatus::ReplyLate
        } else {
            CallStatus::Ok
        }
    }

    /// Dispatch requests that arrived while a call was waiting for
    /// its reply (typically NOTIFY and LOG traffic).
    pub fn dispatch_unexpected(&mut self, slot: PlumbSlot) {
        loop {
            let frame = match self.plumb.get_mut(slot) {
                Some(conn) => conn.unexpected.pop_front(),
                None => return,
            };
            let frame = match frame {
                Some(frame) => frame,
                None => return,
            };
            log::debug!("Async request {} on {:?}", frame.header.message, slot);
            crate::dispatch::dispatch_wire_request(self, slot, frame);
        }
    }

    fn tattle(&mut self, slot: PlumbSlot, xa: &XaBuf, rc: CallStatus) {
        let msgname = xa.request.header.message;
        match rc {
            CallStatus::Ok => log::info!(" ?OK {}", msgname),
            CallStatus::ReplyError => {
                log::info!(" ERR {}  {}", msgname, xa.reply.body.body_error())
            }
            CallStatus::ReplyLate => log::info!(" REPLY LATE {}", msgname),
            CallStatus::HdrError => {
                log::info!(" ERR-AGENT {}  {}", msgname, xa.reply.header.error)
            }
            CallStatus::Botch => log::info!(" ERR-CONN {} on {:?}", msgname, slot),
        }
    }

    /*
     * Notices: agent -> CONTROL
     */

    pub fn deliver_notices(&mut self) {
        while let Some(notice) = self.notices.pop_front() {
            let body = notice_to_request(&notice);
            self.send_to_control(notice.role, body);
        }
    }

    /// Deliver one unilateral request to CONTROL. When CONTROL is
    /// resident the request dispatches in-process through the
    /// originating agent's connection context, keeping version
    /// bridging correct.
    fn send_to_control(&mut self, role: AgentRole, body: RequestBody) {
        let control_is_resident = match self.plumb.get(PlumbSlot::Control) {
            Some(conn) => conn.conn_type == ConnType::Resident,
            None => {
                log::debug!("notice dropped, no control connection");
                return;
            }
        };

        if control_is_resident {
            let slot = match role {
                AgentRole::Data => PlumbSlot::Data,
                AgentRole::Tape => PlumbSlot::Tape,
                AgentRole::Robot => PlumbSlot::Robot,
            };
            let from_slot = if self.plumb.get(slot).is_some() {
                slot
            } else {
                PlumbSlot::Control
            };
            let mut xa = XaBuf::request(body);
            let conn_ref = ConnRef {
                slot: from_slot,
                protocol_version: NDMP9VER,
            };
            crate::dispatch::dispatch_request(self, &mut xa, conn_ref);
        } else if let Some(conn) = self.plumb.get_mut(PlumbSlot::Control) {
            if let Err(err) = conn.send_request_frame(&body) {
                log::info!("notice send failed: {}", err);
            }
        }
    }

    /*
     * Session-wide helpers
     */

    /// Seed the MD5 challenge from the system entropy pool.
    pub fn refresh_md5_challenge(&mut self) -> Result<(), Error> {
        use std::io::Read;
        let mut urandom = std::fs::File::open("/dev/urandom")?;
        urandom.read_exact(&mut self.md5_challenge)?;
        self.md5_challenge_valid = true;
        log::debug!("md5 challenge {}..", hex::encode(&self.md5_challenge[..8]));
        Ok(())
    }

    /// Fill (or refresh) the aggregated config info.
    pub fn sync_config_info(&mut self) {
        let mut info = ConfigInfo {
            hostname: self.param.hostname.clone(),
            os_type: std::env::consts::OS.to_string(),
            os_vers: String::new(),
            hostid: String::new(),
            ..Default::default()
        };
        if let Some(query) = self.cbs.query.as_ref() {
            info.butype_info = query.butype_info();
            info.fs_info = query.fs_info();
            info.tape_info = query.tape_info();
            info.scsi_info = query.scsi_info();
        }
        if info.conntypes.is_empty() {
            info.conntypes = if self.data.is_some() && self.tape.is_some() {
                vec![AddrType::Local, AddrType::Tcp]
            } else {
                vec![AddrType::Tcp]
            };
        }
        if info.authtypes.is_empty() {
            info.authtypes = vec![crate::msg::AuthType::Text, crate::msg::AuthType::Md5];
        }
        self.config_info = Some(info);
    }

    /// Hint for image-stream TCP listens (spec: the advertised IP is
    /// the one observed on a remote control connection).
    pub fn listen_hint(&self) -> ListenHint {
        let mut hint = ListenHint {
            control_ip: None,
            hostname: self.param.hostname.clone(),
        };
        for slot in [PlumbSlot::Control, PlumbSlot::Data, PlumbSlot::Tape] {
            if let Some(conn) = self.plumb.get(slot) {
                if conn.is_remote() {
                    if let Some(addr) = conn.local_sockaddr() {
                        if let std::net::IpAddr::V4(ip) = addr.ip() {
                            hint.control_ip = Some(ip);
                            break;
                        }
                    }
                }
            }
        }
        hint
    }

    pub fn is_job_cancelled(&self) -> bool {
        match self.cbs.jobcontrol_is_cancelled {
            Some(is_cancelled) => is_cancelled(self),
            None => false,
        }
    }
}

fn notice_to_request(notice: &Notice) -> RequestBody {
    use crate::msg::*;
    match &notice.kind {
        NoticeKind::DataHalted(reason) => {
            RequestBody::NotifyDataHalted(NotifyDataHaltedRequest { reason: *reason })
        }
        NoticeKind::DataRead { offset, length } => {
            RequestBody::NotifyDataRead(NotifyDataReadRequest {
                offset: *offset,
                length: *length,
            })
        }
        NoticeKind::MoverHalted(reason) => {
            RequestBody::NotifyMoverHalted(NotifyMoverHaltedRequest { reason: *reason })
        }
        NoticeKind::MoverPaused {
            reason,
            seek_position,
        } => RequestBody::NotifyMoverPaused(NotifyMoverPausedRequest {
            reason: *reason,
            seek_position: *seek_position,
        }),
        NoticeKind::Log { log_type, entry } => RequestBody::LogMessage(LogMessageRequest {
            log_type: *log_type,
            message_id: crate::conn::unix_time(),
            entry: entry.clone(),
        }),
        NoticeKind::LogFile { name, error } => RequestBody::LogFile(LogFileRequest {
            name: name.clone(),
            error: *error,
        }),
        NoticeKind::FhAddFile(files) => RequestBody::FhAddFile(FhAddFileRequest {
            files: files.clone(),
        }),
        NoticeKind::FhAddDir(dirs) => {
            RequestBody::FhAddDir(FhAddDirRequest { dirs: dirs.clone() })
        }
        NoticeKind::FhAddNode(nodes) => RequestBody::FhAddNode(FhAddNodeRequest {
            nodes: nodes.clone(),
        }),
    }
}

/*
 * Session drivers
 */

/// Run a whole CONTROL-driven job in this process; all four roles
/// enabled, resident control connection.
pub fn client_session(
    sess: &mut Session,
    mut job: crate::control::JobParams,
) -> Result<i32, Error> {
    crate::control::job_auto_adjust(&mut job);
    let n_err = crate::control::job_audit(&job, None, 0);
    if n_err != 0 {
        return Err(format_err!("job audit found {} defect(s)", n_err));
    }

    sess.conn_snooping = true;
    sess.initialize(RoleSet::all());

    if let Some(ca) = sess.control.as_mut() {
        ca.job = job;
    }

    sess.commission();

    crate::control::connect_control_agent(sess)?;
    sess.conn_open = true;
    sess.conn_authorized = true;

    let rc = crate::control::control_agent(sess);

    sess.decommission();
    sess.destroy();

    rc
}

/// Serve one accepted control connection until EOF.
pub fn server_session(sess: &mut Session, control_sock: std::os::fd::OwnedFd) -> Result<(), Error> {
    sess.conn_snooping = true;
    sess.initialize(RoleSet {
        control: false,
        data: true,
        tape: true,
        robot: true,
    });
    sess.commission();

    let mut conn = Conn::accept(control_sock, "#C")?;
    conn.snoop = sess.conn_snooping;
    if let Some(addr) = conn.peer_sockaddr() {
        log::info!("Connection accepted from {}", addr);
    }
    sess.plumb.set(PlumbSlot::Control, Some(conn));

    loop {
        let eof = match sess.plumb.get(PlumbSlot::Control) {
            Some(conn) => conn.chan.eof,
            None => true,
        };
        if eof {
            break;
        }
        sess.quantum(1000);
    }

    log::info!("Connection close");
    sess.decommission();
    sess.destroy();
    Ok(())
}

/// Accept control connections forever, one server session per
/// accept.
pub fn daemon_session(param: SessionParam, port: u16) -> Result<(), Error> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
    loop {
        let (stream, peer) = listener.accept()?;
        log::info!("accepted control connection from {}", peer);
        let param = param.clone();
        std::thread::spawn(move || {
            let mut sess = Session::new(param);
            if let Err(err) = server_session(&mut sess, stream.into()) {
                log::error!("server session failed: {}", err);
            }
        });
    }
}
