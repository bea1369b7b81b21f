//! Request dispatcher.
//!
//! Incoming requests arrive in their connection's wire version, are
//! bridged to the canonical form, checked against per-message
//! permission flags, and handed to the semantic handlers below. The
//! reply travels the same path in reverse. This is, admittedly, a
//! large module: all audits and their errors live here so the
//! semantic code stays clean.

use ndmp_api_types::*;

use crate::conn::unix_time;
use crate::image_stream::EndSel;
use crate::msg::*;
use crate::notify::Notice;
use crate::session::{ConnRef, PlumbSlot, Session};

pub const DRT_FLAG_OK_NOT_CONNECTED: u16 = 0x0001;
pub const DRT_FLAG_OK_NOT_AUTHORIZED: u16 = 0x0002;

/// Permission flags per message, the request-table attribute that
/// gates pre-open and pre-auth traffic.
pub fn drt_flags(code: MessageCode) -> u16 {
    match code {
        MessageCode::ConnectOpen
        | MessageCode::ConnectClose
        | MessageCode::NotifyConnected => DRT_FLAG_OK_NOT_CONNECTED | DRT_FLAG_OK_NOT_AUTHORIZED,
        MessageCode::ConnectClientAuth
        | MessageCode::ConnectServerAuth
        | MessageCode::ConfigGetInfo
        | MessageCode::ConfigGetAuthAttr => DRT_FLAG_OK_NOT_AUTHORIZED,
        _ => 0,
    }
}

struct Raise {
    error: NdmpError,
    why: &'static str,
}

fn raise(error: NdmpError, why: &'static str) -> Raise {
    Raise { error, why }
}

fn raise_illegal_args(why: &'static str) -> Raise {
    raise(NdmpError::IllegalArgs, why)
}

fn raise_illegal_state(why: &'static str) -> Raise {
    raise(NdmpError::IllegalState, why)
}

type HandlerResult = Result<ReplyBody, Raise>;

fn ta_mut(sess: &mut Session) -> Result<&mut crate::tape_agent::TapeAgent, Raise> {
    sess.tape
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))
}

fn da_mut(sess: &mut Session) -> Result<&mut crate::data::DataAgent, Raise> {
    sess.data
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::Connect, "No Data Agent"))
}

fn da_ref(sess: &Session) -> Result<&crate::data::DataAgent, Raise> {
    sess.data
        .as_deref()
        .ok_or_else(|| raise(NdmpError::Connect, "No Data Agent"))
}

fn is_mut(sess: &mut Session) -> Result<&mut crate::image_stream::ImageStream, Raise> {
    sess.image_stream
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::NoMem, "no image stream"))
}

/// Entry point for framed requests from a remote connection.
pub fn dispatch_wire_request(sess: &mut Session, slot: PlumbSlot, frame: WireFrame) {
    let conn_version = sess
        .plumb
        .get(slot)
        .map(|conn| conn.protocol_version)
        .unwrap_or(NDMP4VER);

    let code = frame.header.message;
    let mut reply_header = Header {
        sequence: 0,
        time_stamp: 0,
        message_type: MessageType::Reply,
        message: code,
        reply_sequence: frame.header.sequence,
        error: NdmpError::NoErr,
    };
    let no_send = code.is_unilateral();

    // sanity check; CONNECT_OPEN is exempt since it is what
    // negotiates the version in the first place
    if code != MessageCode::ConnectOpen && frame.body.protocol_version() != conn_version {
        reply_header.error = NdmpError::Undefined;
        send_reply(sess, slot, conn_version, reply_header, &ReplyBody::None, no_send);
        return;
    }

    let body = match request_to_canonical(frame.body) {
        Ok(body) => body,
        Err(_) => {
            reply_header.error = NdmpError::NotSupported;
            send_reply(sess, slot, conn_version, reply_header, &ReplyBody::None, no_send);
            return;
        }
    };

    let mut xa = XaBuf::request(body);
    xa.request.protocol_version = conn_version;
    xa.request.header = frame.header;
    xa.reply.protocol_version = conn_version;
    xa.reply.header = reply_header;
    xa.reply.no_send = no_send;

    let conn_ref = ConnRef {
        slot,
        protocol_version: conn_version,
    };
    dispatch_request(sess, &mut xa, conn_ref);

    if !xa.reply.no_send {
        // CONNECT_OPEN may have just switched the version
        let reply_version = sess
            .plumb
            .get(slot)
            .map(|conn| conn.protocol_version)
            .unwrap_or(conn_version);
        send_reply(
            sess,
            slot,
            reply_version,
            xa.reply.header,
            &xa.reply.body,
            false,
        );
    }
}

fn send_reply(
    sess: &mut Session,
    slot: PlumbSlot,
    version: u16,
    mut header: Header,
    body: &ReplyBody,
    no_send: bool,
) {
    if no_send {
        return;
    }
    let conn = match sess.plumb.get_mut(slot) {
        Some(conn) => conn,
        None => return,
    };
    let wire = match reply_from_canonical(version, body) {
        Ok(wire) => wire,
        Err(_) => {
            header.error = NdmpError::Undefined;
            match reply_from_canonical(version, &ReplyBody::None) {
                Ok(wire) => wire,
                Err(_) => return,
            }
        }
    };
    header.sequence = conn.next_sequence;
    conn.next_sequence += 1;
    header.time_stamp = unix_time();
    if let Err(err) = conn.send_frame(&WireFrame { header, body: wire }) {
        log::info!("reply send failed: {}", err);
    }
}

/// Dispatch one canonical request transaction.
pub fn dispatch_request(sess: &mut Session, xa: &mut XaBuf, ref_conn: ConnRef) {
    let code = xa.request.body.code();

    xa.reply.header.message_type = MessageType::Reply;
    xa.reply.header.message = code;
    xa.reply.header.reply_sequence = xa.request.header.sequence;
    xa.reply.header.error = NdmpError::NoErr;
    if code.is_unilateral() {
        xa.reply.no_send = true;
    }

    // A first message other than CONNECT_OPEN implicitly accepts the
    // protocol version offered by NOTIFY_CONNECTED.
    if !sess.conn_open && code != MessageCode::ConnectOpen {
        let version = if ref_conn.protocol_version == NDMP9VER {
            NDMP4VER
        } else {
            ref_conn.protocol_version
        };
        connect_open_common(sess, ref_conn.slot, version);
    }

    // the OS/implementation module may intercept any request
    if let Some(hook) = sess.cbs.os_dispatch {
        if hook(sess, xa, ref_conn).is_some() {
            return;
        }
    }

    let flags = drt_flags(code);
    if !sess.conn_open && flags & DRT_FLAG_OK_NOT_CONNECTED == 0 {
        xa.reply.header.error = NdmpError::Permission;
        return;
    }
    if !sess.conn_authorized && flags & DRT_FLAG_OK_NOT_AUTHORIZED == 0 {
        xa.reply.header.error = NdmpError::NotAuthorized;
        return;
    }

    match handle(sess, xa, ref_conn) {
        Ok(body) => xa.reply.body = body,
        Err(r) => {
            log::info!("op={} err={} why={}", code, r.error, r.why);
            sess.error_raised = true;
            xa.reply.body = ReplyBody::Error(r.error);
        }
    }
}

fn handle(sess: &mut Session, xa: &mut XaBuf, ref_conn: ConnRef) -> HandlerResult {
    // clone out the request body; handlers borrow the session hard
    let body = xa.request.body.clone();
    match body {
        RequestBody::ConnectOpen(request) => connect_open(sess, ref_conn, &request),
        RequestBody::ConnectClientAuth(request) => connect_client_auth(sess, &request),
        RequestBody::ConnectClose => connect_close(sess, xa, ref_conn),
        RequestBody::ConnectServerAuth => Err(raise(NdmpError::NotSupported, "server_auth")),

        RequestBody::ConfigGetInfo => config_get_info(sess),
        RequestBody::ConfigGetAuthAttr(request) => config_get_auth_attr(sess, &request),

        RequestBody::ScsiOpen(request) => scsi_open(sess, &request),
        RequestBody::ScsiClose => scsi_close(sess),
        RequestBody::ScsiGetState => scsi_get_state(sess),
        RequestBody::ScsiResetDevice => scsi_reset_device(sess),
        RequestBody::ScsiExecuteCdb(request) => scsi_execute_cdb(sess, &request),

        RequestBody::TapeOpen(request) => tape_open(sess, &request),
        RequestBody::TapeClose => tape_close(sess),
        RequestBody::TapeGetState => tape_get_state(sess),
        RequestBody::TapeMtio(request) => tape_mtio(sess, &request),
        RequestBody::TapeWrite(request) => tape_write(sess, &request),
        RequestBody::TapeRead(request) => tape_read(sess, ref_conn, &request),
        RequestBody::TapeExecuteCdb(_) => Err(raise(NdmpError::NotSupported, "tape_execute_cdb")),

        RequestBody::DataGetState => data_get_state(sess),
        RequestBody::DataStartBackup(request) => data_start_backup(sess, &request),
        RequestBody::DataStartRecover(request) => data_start_recover(sess, &request, false),
        RequestBody::DataStartRecoverFilehist(request) => {
            data_start_recover(sess, &request, true)
        }
        RequestBody::DataAbort => data_abort(sess),
        RequestBody::DataGetEnv => data_get_env(sess),
        RequestBody::DataStop => data_stop(sess),
        RequestBody::DataListen(request) => data_listen(sess, &request),
        RequestBody::DataConnect(request) => data_connect_handler(sess, &request),

        RequestBody::MoverGetState => mover_get_state(sess),
        RequestBody::MoverListen(request) => mover_listen(sess, &request),
        RequestBody::MoverConnect(request) => mover_connect(sess, &request),
        RequestBody::MoverContinue => mover_continue(sess),
        RequestBody::MoverAbort => mover_abort(sess),
        RequestBody::MoverStop => mover_stop(sess),
        RequestBody::MoverSetWindow(request) => mover_set_window(sess, ref_conn, &request),
        RequestBody::MoverRead(request) => mover_read(sess, &request),
        RequestBody::MoverClose => mover_close(sess),
        RequestBody::MoverSetRecordSize(request) => mover_set_record_size(sess, &request),

        RequestBody::NotifyConnected(_) => Ok(ReplyBody::None),
        RequestBody::NotifyDataHalted(request) => notify_data_halted(sess, &request),
        RequestBody::NotifyMoverHalted(request) => notify_mover_halted(sess, &request),
        RequestBody::NotifyMoverPaused(request) => notify_mover_paused(sess, &request),
        RequestBody::NotifyDataRead(request) => notify_data_read(sess, &request),

        RequestBody::LogMessage(request) => log_message(sess, &request),
        RequestBody::LogFile(request) => log_file(sess, &request),

        RequestBody::FhAddFile(request) => fh_add_file(sess, request),
        RequestBody::FhAddDir(request) => fh_add_dir(sess, request),
        RequestBody::FhAddNode(request) => fh_add_node(sess, request),
    }
}

/*
 * CONNECT interfaces
 */

fn connect_open(
    sess: &mut Session,
    ref_conn: ConnRef,
    request: &ConnectOpenRequest,
) -> HandlerResult {
    if sess.conn_open {
        let current = sess
            .plumb
            .get(ref_conn.slot)
            .map(|conn| conn.protocol_version)
            .unwrap_or(ref_conn.protocol_version);
        if request.protocol_version != current {
            return Err(raise_illegal_args("too late to change version"));
        }
        return Ok(ReplyBody::Error(NdmpError::NoErr));
    }
    match request.protocol_version {
        NDMP2VER | NDMP3VER | NDMP4VER => {
            connect_open_common(sess, ref_conn.slot, request.protocol_version);
            Ok(ReplyBody::Error(NdmpError::NoErr))
        }
        _ => Err(raise_illegal_args("unsupported protocol version")),
    }
}

fn connect_open_common(sess: &mut Session, slot: PlumbSlot, protocol_version: u16) {
    if let Some(da) = sess.data.as_mut() {
        da.protocol_version = protocol_version;
    }
    if let Some(ta) = sess.tape.as_mut() {
        ta.protocol_version = protocol_version;
    }
    if let Some(ra) = sess.robot.as_mut() {
        ra.protocol_version = protocol_version;
    }
    if let Some(conn) = sess.plumb.get_mut(slot) {
        if conn.is_remote() {
            conn.protocol_version = protocol_version;
        }
    }
    sess.conn_open = true;
}

fn connect_client_auth(sess: &mut Session, request: &ConnectClientAuthRequest) -> HandlerResult {
    let auth = sess
        .cbs
        .auth
        .as_ref()
        .ok_or_else(|| raise(NdmpError::NotAuthorized, "no auth callbacks"))?;

    match &request.auth_data {
        AuthData::None => return Err(raise_illegal_args("auth_type")),
        AuthData::Text {
            auth_id,
            auth_password,
        } => {
            if !auth.validate_password(auth_id, auth_password) {
                return Err(raise(NdmpError::NotAuthorized, "password not OK"));
            }
        }
        AuthData::Md5 {
            auth_id,
            auth_digest,
        } => {
            if !sess.md5_challenge_valid {
                return Err(raise(NdmpError::NotAuthorized, "no challenge"));
            }
            if !auth.validate_md5(auth_id, auth_digest, &sess.md5_challenge) {
                return Err(raise(NdmpError::NotAuthorized, "digest not OK"));
            }
        }
    }
    sess.conn_authorized = true;
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn connect_close(sess: &mut Session, xa: &mut XaBuf, ref_conn: ConnRef) -> HandlerResult {
    xa.reply.no_send = true;
    if let Some(conn) = sess.plumb.get_mut(ref_conn.slot) {
        conn.chan.set_eof();
    }
    Ok(ReplyBody::None)
}

/*
 * CONFIG interfaces
 */

fn config_get_info(sess: &mut Session) -> HandlerResult {
    sess.sync_config_info();
    let config_info = sess
        .config_info
        .clone()
        .ok_or_else(|| raise(NdmpError::NoMem, "config info"))?;
    Ok(ReplyBody::ConfigGetInfo(ConfigGetInfoReply {
        error: NdmpError::NoErr,
        config_info,
    }))
}

fn config_get_auth_attr(sess: &mut Session, request: &ConfigGetAuthAttrRequest) -> HandlerResult {
    let challenge = match request.auth_type {
        AuthType::Md5 => {
            sess.refresh_md5_challenge()
                .map_err(|_| raise(NdmpError::Undefined, "challenge"))?;
            sess.md5_challenge.to_vec()
        }
        AuthType::Text => Vec::new(),
        AuthType::None => return Err(raise_illegal_args("auth_type")),
    };
    Ok(ReplyBody::ConfigGetAuthAttr(ConfigGetAuthAttrReply {
        error: NdmpError::NoErr,
        challenge,
    }))
}

/*
 * SCSI interfaces
 */

fn robot_parts<'a>(
    sess: &'a mut Session,
) -> Result<(&'a mut crate::robot::RobotAgent, &'a mut dyn crate::robot::RobotOps), Raise> {
    let ra = sess
        .robot
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::NoDevice, "No Robot Agent"))?;
    let ops = sess
        .cbs
        .robot_ops
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::NoDevice, "no robot backend"))?;
    Ok((ra, ops))
}

fn scsi_open(sess: &mut Session, request: &ScsiOpenRequest) -> HandlerResult {
    // tape and SCSI cannot both be open on the same handle
    if !sess.allow_scsi_and_tape_both_open {
        if let Some(ta) = sess.tape.as_ref() {
            if ta.device.is_some() {
                return Err(raise(NdmpError::DeviceOpened, "tape is open"));
            }
        }
    }
    let (ra, ops) = robot_parts(sess)?;
    ra.scsi_open(ops, &request.device)
        .map_err(|error| raise(error, "scsi_open"))?;
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn scsi_close(sess: &mut Session) -> HandlerResult {
    let (ra, ops) = robot_parts(sess)?;
    ra.scsi_close(ops)
        .map_err(|error| raise(error, "scsi_close"))?;
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn scsi_get_state(sess: &mut Session) -> HandlerResult {
    let ra = sess
        .robot
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::NoDevice, "No Robot Agent"))?;
    ra.sync_state();
    Ok(ReplyBody::ScsiGetState(ra.scsi_state.clone()))
}

fn scsi_reset_device(sess: &mut Session) -> HandlerResult {
    let (ra, ops) = robot_parts(sess)?;
    ra.scsi_reset(ops)
        .map_err(|error| raise(error, "scsi_reset"))?;
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn scsi_execute_cdb(sess: &mut Session, request: &ExecuteCdbRequest) -> HandlerResult {
    let (ra, ops) = robot_parts(sess)?;
    let reply = ra
        .scsi_execute_cdb(ops, request)
        .map_err(|error| raise(error, "execute_cdb"))?;
    Ok(ReplyBody::ExecuteCdb(reply))
}

/*
 * TAPE interfaces
 */

fn tape_open_ok(sess: &mut Session) -> Result<(), Raise> {
    let ta = sess
        .tape
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::DeviceOpened, "No Tape Agent"))?;
    ta.tape_sync_state();
    if ta.tape_state.state != TapeState::Idle {
        return Err(raise(NdmpError::DeviceOpened, "!tape_open_ok"));
    }
    // SCSI and tape cannot both be open on the same handle
    if !sess.allow_scsi_and_tape_both_open {
        if let Some(ra) = sess.robot.as_ref() {
            if ra.is_open {
                return Err(raise(NdmpError::DeviceOpened, "scsi is open"));
            }
        }
    }
    Ok(())
}

/// Tape operation is only OK if the drive is open and the MOVER
/// hasn't got hold of it.
fn tape_op_ok(sess: &mut Session, will_write: bool) -> Result<(), Raise> {
    let ta = sess
        .tape
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
    ta.tape_sync_state();
    match ta.tape_state.state {
        TapeState::Idle => Err(raise(NdmpError::DevNotOpen, "!tape_op_ok")),
        TapeState::Open => {
            if will_write && !ta.tape_is_writable() {
                Err(raise(NdmpError::Permission, "!tape_op_ok"))
            } else {
                Ok(())
            }
        }
        TapeState::Mover => Err(raise_illegal_state("mover owns the tape")),
    }
}

fn tape_open(sess: &mut Session, request: &TapeOpenRequest) -> HandlerResult {
    let will_write = request.mode.is_writable();
    tape_open_ok(sess)?;
    let factory = sess
        .cbs
        .tape_open
        .as_ref()
        .ok_or_else(|| raise(NdmpError::NoDevice, "no tape backend"))?;
    let device =
        factory(&request.device, will_write).map_err(|error| raise(error, "tape_open"))?;
    let ta = ta_mut(sess)?;
    ta.tape_open(device, request.mode)
        .map_err(|error| raise(error, "tape_open"))?;
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn tape_close(sess: &mut Session) -> HandlerResult {
    tape_op_ok(sess, false)?;
    let ta = ta_mut(sess)?;
    ta.tape_close().map_err(|error| raise(error, "tape_close"))?;
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn tape_get_state(sess: &mut Session) -> HandlerResult {
    let ta = sess
        .tape
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
    ta.tape_sync_state();
    Ok(ReplyBody::TapeGetState(ta.tape_state.clone()))
}

fn tape_mtio(sess: &mut Session, request: &TapeMtioRequest) -> HandlerResult {
    let will_write = request.tape_op == MtioOp::Eof;
    tape_op_ok(sess, will_write)?;
    let ta = ta_mut(sess)?;
    let reply = match ta.tape_mtio(request.tape_op, request.count) {
        Ok(resid_count) => TapeMtioReply {
            error: NdmpError::NoErr,
            resid_count,
        },
        Err(error) => TapeMtioReply {
            error,
            resid_count: 0,
        },
    };
    Ok(ReplyBody::TapeMtio(reply))
}

fn tape_write(sess: &mut Session, request: &TapeWriteRequest) -> HandlerResult {
    if request.data_out.is_empty() {
        // count==0 tape I/O is a no-op (SCSI Sequential Access
        // heritage); NDMPv2/v3 MAY also answer ILLEGAL_ARGS, v4
        // requires success
        return Ok(ReplyBody::TapeWrite(TapeWriteReply {
            error: NdmpError::NoErr,
            count: 0,
        }));
    }
    if !ok_tape_rec_len(request.data_out.len() as u32) {
        return Err(raise_illegal_args("!ok_tape_rec_len"));
    }
    tape_op_ok(sess, true)?;
    let ta = ta_mut(sess)?;
    let reply = match ta.tape_write(&request.data_out) {
        Ok(count) => TapeWriteReply {
            error: NdmpError::NoErr,
            count,
        },
        Err(error) => TapeWriteReply { error, count: 0 },
    };
    Ok(ReplyBody::TapeWrite(reply))
}

fn tape_read(sess: &mut Session, ref_conn: ConnRef, request: &TapeReadRequest) -> HandlerResult {
    if request.count == 0 {
        return Ok(ReplyBody::TapeRead(TapeReadReply {
            error: NdmpError::NoErr,
            data_in: Vec::new(),
        }));
    }
    if !ok_tape_rec_len(request.count) {
        return Err(raise_illegal_args("!ok_tape_rec_len"));
    }
    tape_op_ok(sess, false)?;
    let ta = ta_mut(sess)?;
    let mut buf = vec![0u8; request.count as usize];
    let reply = match ta.tape_read(&mut buf) {
        Ok(count) => {
            buf.truncate(count as usize);
            TapeReadReply {
                error: NdmpError::NoErr,
                data_in: buf,
            }
        }
        Err(NdmpError::Eom)
            if ref_conn.protocol_version != NDMP9VER
                && ref_conn.protocol_version < NDMP4VER =>
        {
            // pre-v4 reports end-of-medium beyond the last filemark
            // as EOF
            TapeReadReply {
                error: NdmpError::Eof,
                data_in: Vec::new(),
            }
        }
        Err(error) => TapeReadReply {
            error,
            data_in: Vec::new(),
        },
    };
    Ok(ReplyBody::TapeRead(reply))
}

/*
 * DATA interfaces
 */

fn data_ok_bu_type(sess: &mut Session, bu_type: &str) -> Result<(), Raise> {
    sess.sync_config_info();
    let ci = sess
        .config_info
        .as_ref()
        .ok_or_else(|| raise(NdmpError::NoMem, "config info"))?;
    if ci
        .butype_info
        .iter()
        .any(|bu| bu.butype_name == bu_type)
    {
        Ok(())
    } else {
        Err(raise_illegal_args("bu_type"))
    }
}

fn data_can_connect(sess: &mut Session, addr: &DataAddr) -> Result<(), Raise> {
    let da = sess
        .data
        .as_ref()
        .ok_or_else(|| raise(NdmpError::Connect, "No Data Agent"))?;

    match addr.addr_type() {
        AddrType::Local => {
            if sess.tape.is_none() {
                return Err(raise_illegal_args("data LOCAL w/o local TAPE agent"));
            }
        }
        AddrType::Tcp => {}
        AddrType::AsConnected => return Err(raise_illegal_args("addr_type")),
    }

    if da.data_state.state != DataState::Idle {
        return Err(raise_illegal_state("data_state !IDLE"));
    }

    if let Some(ta) = sess.tape.as_ref() {
        if addr.addr_type() == AddrType::Local {
            let ms = &ta.mover_state;
            if ms.state != MoverState::Listen {
                return Err(raise_illegal_state("mover_state !LISTEN"));
            }
            if ms.data_connection_addr.addr_type() != AddrType::Local {
                return Err(raise_illegal_state("mover_addr !LOCAL"));
            }
        } else if ta.mover_state.state != MoverState::Idle {
            return Err(raise_illegal_state("mover_state !IDLE"));
        }
    }

    let is = sess
        .image_stream
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::NoMem, "no image stream"))?;
    is.audit_ep_connect(EndSel::Data, addr.addr_type())
        .map_err(|error| raise(error, "IS DATA_CONNECT audit"))?;

    Ok(())
}

fn data_can_start(sess: &mut Session, mover_mode: MoverMode) -> Result<(), Raise> {
    let da = sess
        .data
        .as_ref()
        .ok_or_else(|| raise(NdmpError::Connect, "No Data Agent"))?;

    if da.data_state.state != DataState::Connected {
        return Err(raise_illegal_state("data_state !CONNECTED"));
    }

    if let Some(ta) = sess.tape.as_ref() {
        if da.data_state.data_connection_addr.addr_type() == AddrType::Local {
            let ms = &ta.mover_state;
            if ms.state != MoverState::Active {
                return Err(raise_illegal_state("mover_state !ACTIVE"));
            }
            if ms.data_connection_addr.addr_type() != AddrType::Local {
                return Err(raise_illegal_state("mover_addr !LOCAL"));
            }
            if ms.mode != mover_mode {
                return Err(raise_illegal_state("mover_mode mismatch"));
            }
        }
    }

    Ok(())
}

fn data_can_connect_and_start(
    sess: &mut Session,
    addr: &DataAddr,
    mover_mode: MoverMode,
) -> Result<(), Raise> {
    data_can_connect(sess, addr)?;
    if addr.addr_type() == AddrType::Local {
        if let Some(ta) = sess.tape.as_ref() {
            if ta.mover_state.mode != mover_mode {
                return Err(raise_illegal_state("mover_mode mismatch"));
            }
        }
    }
    Ok(())
}

fn data_connect_sub(sess: &mut Session, addr: &DataAddr) -> Result<(), Raise> {
    data_can_connect(sess, addr)?;
    let is = is_mut(sess)?;
    is.ep_connect(EndSel::Data, addr)
        .map_err(|error| raise(error, "IS DATA_CONNECT"))?;
    let da = da_mut(sess)?;
    da.data_connect();
    da.data_state.data_connection_addr = addr.clone();
    Ok(())
}

fn resolve_formatter(
    sess: &Session,
    bu_type: &str,
    operation: DataOperation,
    env: &[Pval],
    nlist: &[NlistEntry],
) -> Result<String, Raise> {
    let resolver = sess
        .cbs
        .formatter
        .as_ref()
        .ok_or_else(|| raise_illegal_args("no formatter configured"))?;
    resolver(bu_type, operation, env, nlist).ok_or_else(|| raise_illegal_args("bu_type"))
}

fn data_start_backup(sess: &mut Session, request: &DataStartBackupRequest) -> HandlerResult {
    if sess.data.is_none() {
        return Err(raise(NdmpError::Connect, "No Data Agent"));
    }
    data_ok_bu_type(sess, &request.bu_type)?;

    if request.addr.addr_type() != AddrType::AsConnected {
        data_can_connect_and_start(sess, &request.addr, MoverMode::Read)?;
    } else {
        data_can_start(sess, MoverMode::Read)?;
    }

    {
        let da = da_mut(sess)?;
        da.set_bu_type(&request.bu_type)
            .map_err(|error| raise(error, "bu_type"))?;
        da.copy_environment(&request.env)
            .map_err(|error| raise(error, "copy-env"))?;
    }

    if request.addr.addr_type() != AddrType::AsConnected {
        data_connect_sub(sess, &request.addr)?;
    }

    let cmd = {
        let da = da_ref(sess)?;
        resolve_formatter(sess, &da.bu_type, DataOperation::Backup, &da.env_tab, &[])?
    };

    let (da, is) = data_parts(sess)?;
    crate::data::data_start_backup(da, is, &cmd)
        .map_err(|error| raise(error, "start_backup"))?;
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn data_parts<'a>(
    sess: &'a mut Session,
) -> Result<(&'a mut crate::data::DataAgent, &'a mut crate::image_stream::ImageStream), Raise> {
    let Session {
        data, image_stream, ..
    } = sess;
    let da = data
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::Connect, "No Data Agent"))?;
    let is = image_stream
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::NoMem, "no image stream"))?;
    Ok((da, is))
}

fn data_start_recover(
    sess: &mut Session,
    request: &DataStartRecoverRequest,
    filehist_only: bool,
) -> HandlerResult {
    if sess.data.is_none() {
        return Err(raise(NdmpError::Connect, "No Data Agent"));
    }
    data_ok_bu_type(sess, &request.bu_type)?;

    if request.addr.addr_type() != AddrType::AsConnected {
        data_can_connect_and_start(sess, &request.addr, MoverMode::Write)?;
    } else {
        data_can_start(sess, MoverMode::Write)?;
    }

    {
        let da = da_mut(sess)?;
        da.set_bu_type(&request.bu_type)
            .map_err(|error| raise(error, "bu_type"))?;
        da.copy_environment(&request.env)
            .map_err(|error| raise(error, "copy-env"))?;
        da.copy_nlist(&request.nlist)
            .map_err(|error| raise(error, "copy-nlist"))?;
    }

    if request.addr.addr_type() != AddrType::AsConnected {
        data_connect_sub(sess, &request.addr)?;
    }

    let operation = if filehist_only {
        DataOperation::RecoverFilehist
    } else {
        DataOperation::Recover
    };
    let cmd = {
        let da = da_ref(sess)?;
        resolve_formatter(sess, &da.bu_type, operation, &da.env_tab, &request.nlist)?
    };

    let (da, is) = data_parts(sess)?;
    crate::data::data_start_recover(da, is, &cmd, filehist_only)
        .map_err(|error| raise(error, "start_recover"))?;
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn data_get_state(sess: &mut Session) -> HandlerResult {
    let da = sess
        .data
        .as_ref()
        .ok_or_else(|| raise(NdmpError::Connect, "No Data Agent"))?;
    Ok(ReplyBody::DataGetState(da.data_state.clone()))
}

fn data_abort(sess: &mut Session) -> HandlerResult {
    if sess.data.is_none() {
        return Ok(ReplyBody::Error(NdmpError::NoErr));
    }
    {
        let da = da_ref(sess)?;
        if da.data_state.state != DataState::Active {
            return Err(raise_illegal_state("data_state !ACTIVE"));
        }
    }
    let Session {
        data,
        image_stream,
        notices,
        ..
    } = sess;
    let (da, is) = match (data.as_deref_mut(), image_stream.as_deref_mut()) {
        (Some(da), Some(is)) => (da, is),
        _ => return Err(raise(NdmpError::Undefined, "agent parts")),
    };
    crate::data::data_abort(da, is, notices);
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn data_get_env(sess: &mut Session) -> HandlerResult {
    let da = sess
        .data
        .as_ref()
        .ok_or_else(|| raise(NdmpError::Connect, "No Data Agent"))?;
    if da.data_state.state == DataState::Idle {
        return Err(raise_illegal_state("data_state IDLE"));
    }
    if da.data_state.operation != DataOperation::Backup {
        return Err(raise_illegal_state("data_op !BACKUP"));
    }
    Ok(ReplyBody::DataGetEnv(DataGetEnvReply {
        error: NdmpError::NoErr,
        env: da.env_tab.clone(),
    }))
}

fn data_stop(sess: &mut Session) -> HandlerResult {
    let da = sess
        .data
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::Connect, "No Data Agent"))?;
    if da.data_state.state != DataState::Halted {
        return Err(raise_illegal_state("data_state !HALTED"));
    }
    da.data_stop();
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn data_listen(sess: &mut Session, request: &DataListenRequest) -> HandlerResult {
    {
        let da = sess
            .data
            .as_ref()
            .ok_or_else(|| raise(NdmpError::Connect, "No Data Agent"))?;
        match request.addr_type {
            AddrType::Local => {
                if sess.tape.is_none() {
                    return Err(raise_illegal_args("data LOCAL w/o local TAPE agent"));
                }
            }
            AddrType::Tcp => {}
            AddrType::AsConnected => return Err(raise_illegal_args("data_addr_type")),
        }
        if da.data_state.state != DataState::Idle {
            return Err(raise_illegal_state("data_state !IDLE"));
        }
        if let Some(ta) = sess.tape.as_ref() {
            if ta.mover_state.state != MoverState::Idle {
                return Err(raise_illegal_state("mover_state !IDLE"));
            }
        }
    }

    let hint = sess.listen_hint();
    let is = sess
        .image_stream
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::NoMem, "no image stream"))?;
    is.audit_ep_listen(EndSel::Data, request.addr_type)
        .map_err(|error| raise(error, "IS DATA_LISTEN audit"))?;
    let addr = is
        .ep_listen(EndSel::Data, request.addr_type, &hint)
        .map_err(|error| raise(error, "IS DATA_LISTEN"))?;

    let da = da_mut(sess)?;
    da.data_listen();
    da.data_state.data_connection_addr = addr.clone();

    Ok(ReplyBody::Addr(AddrReply {
        error: NdmpError::NoErr,
        data_connection_addr: addr,
    }))
}

fn data_connect_handler(sess: &mut Session, request: &DataConnectRequest) -> HandlerResult {
    if sess.data.is_none() {
        return Err(raise(NdmpError::Connect, "No Data Agent"));
    }
    data_connect_sub(sess, &request.addr)?;
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

/*
 * MOVER interfaces
 */

fn mover_can_proceed(sess: &mut Session, will_write: bool) -> Result<(), Raise> {
    let ta = sess
        .tape
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
    ta.tape_sync_state();
    if ta.tape_state.state != TapeState::Open && ta.tape_state.state != TapeState::Mover {
        return Err(raise(NdmpError::DevNotOpen, "!mover_can_proceed"));
    }
    if will_write && !ta.tape_is_writable() {
        return Err(raise(NdmpError::Permission, "!mover_can_proceed"));
    }
    Ok(())
}

fn mover_get_state(sess: &mut Session) -> HandlerResult {
    let ta = sess
        .tape
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
    ta.tape_sync_state();
    Ok(ReplyBody::MoverGetState(ta.mover_state.clone()))
}

fn mover_listen(sess: &mut Session, request: &MoverListenRequest) -> HandlerResult {
    log::debug!(
        "mover_listen addr_type={:?} mode={:?}",
        request.addr_type,
        request.mode
    );

    let will_write = request.mode == MoverMode::Read;

    match request.addr_type {
        AddrType::Local => {
            if sess.data.is_none() {
                return Err(raise_illegal_args("mover LOCAL w/o local DATA agent"));
            }
        }
        AddrType::Tcp => {}
        AddrType::AsConnected => return Err(raise_illegal_args("mover_addr_type")),
    }

    {
        let ta = sess
            .tape
            .as_ref()
            .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
        if ta.mover_state.state != MoverState::Idle {
            return Err(raise_illegal_state("mover_state !IDLE"));
        }
    }
    if let Some(da) = sess.data.as_ref() {
        if da.data_state.state != DataState::Idle {
            return Err(raise_illegal_state("data_state !IDLE"));
        }
    }

    mover_can_proceed(sess, will_write)?;

    let hint = sess.listen_hint();
    let is = sess
        .image_stream
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::NoMem, "no image stream"))?;
    is.audit_ep_listen(EndSel::Tape, request.addr_type)
        .map_err(|error| raise(error, "IS TAPE_LISTEN audit"))?;
    let addr = is
        .ep_listen(EndSel::Tape, request.addr_type, &hint)
        .map_err(|error| raise(error, "IS TAPE_LISTEN"))?;

    let ta = ta_mut(sess)?;
    ta.mover_listen(request.mode)
        .map_err(|error| raise(error, "!mover_listen"))?;
    ta.mover_state.data_connection_addr = addr.clone();

    Ok(ReplyBody::Addr(AddrReply {
        error: NdmpError::NoErr,
        data_connection_addr: addr,
    }))
}

fn mover_connect(sess: &mut Session, request: &MoverConnectRequest) -> HandlerResult {
    let will_write = request.mode == MoverMode::Read;

    match request.addr.addr_type() {
        AddrType::Local => {
            if sess.data.is_none() {
                return Err(raise_illegal_args("mover LOCAL w/o local DATA agent"));
            }
        }
        AddrType::Tcp => {}
        AddrType::AsConnected => return Err(raise_illegal_args("mover_addr_type")),
    }

    {
        let ta = sess
            .tape
            .as_ref()
            .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
        if ta.mover_state.state != MoverState::Idle {
            return Err(raise_illegal_state("mover_state !IDLE"));
        }
    }
    if let Some(da) = sess.data.as_ref() {
        if request.addr.addr_type() == AddrType::Local {
            let ds = &da.data_state;
            if ds.state != DataState::Listen {
                return Err(raise_illegal_state("data_state !LISTEN"));
            }
            if ds.data_connection_addr.addr_type() != AddrType::Local {
                return Err(raise_illegal_state("data_addr !LOCAL"));
            }
        } else if da.data_state.state != DataState::Idle {
            return Err(raise_illegal_state("data_state !IDLE"));
        }
    }

    mover_can_proceed(sess, will_write)?;

    let is = sess
        .image_stream
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::NoMem, "no image stream"))?;
    is.audit_ep_connect(EndSel::Tape, request.addr.addr_type())
        .map_err(|error| raise(error, "IS TAPE_CONNECT audit"))?;
    is.ep_connect(EndSel::Tape, &request.addr)
        .map_err(|error| raise(error, "IS TAPE_CONNECT"))?;

    let Session {
        tape, image_stream, ..
    } = sess;
    let (ta, is) = match (tape.as_deref_mut(), image_stream.as_deref_mut()) {
        (Some(ta), Some(is)) => (ta, is),
        _ => return Err(raise(NdmpError::Undefined, "agent parts")),
    };
    ta.mover_state.data_connection_addr = request.addr.clone();
    crate::tape_agent::mover_connect(ta, is, request.mode)
        .map_err(|error| raise(error, "!mover_connect"))?;

    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn tape_parts<'a>(
    sess: &'a mut Session,
) -> Result<
    (
        &'a mut crate::tape_agent::TapeAgent,
        &'a mut crate::image_stream::ImageStream,
        &'a mut std::collections::VecDeque<Notice>,
    ),
    Raise,
> {
    let Session {
        tape,
        image_stream,
        notices,
        ..
    } = sess;
    let ta = tape
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
    let is = image_stream
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::NoMem, "no image stream"))?;
    Ok((ta, is, notices))
}

fn mover_continue(sess: &mut Session) -> HandlerResult {
    {
        let ta = sess
            .tape
            .as_ref()
            .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
        if ta.mover_state.state != MoverState::Paused {
            return Err(raise_illegal_state("mover_state !PAUSED"));
        }
    }
    let will_write = sess
        .tape
        .as_ref()
        .map(|ta| ta.mover_state.mode == MoverMode::Read)
        .unwrap_or(false);
    mover_can_proceed(sess, will_write)?;
    let ta = ta_mut(sess)?;
    ta.mover_continue();
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn mover_abort(sess: &mut Session) -> HandlerResult {
    let (ta, is, _) = tape_parts(sess)?;
    match ta.mover_state.state {
        MoverState::Listen | MoverState::Active | MoverState::Paused => {}
        _ => return Err(raise_illegal_state("mover_state")),
    }
    crate::tape_agent::mover_abort(ta, is);
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn mover_stop(sess: &mut Session) -> HandlerResult {
    let ta = sess
        .tape
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
    if ta.mover_state.state != MoverState::Halted {
        return Err(raise_illegal_state("mover_state !HALTED"));
    }
    crate::tape_agent::mover_stop(ta);
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn mover_set_window(
    sess: &mut Session,
    ref_conn: ConnRef,
    request: &MoverSetWindowRequest,
) -> HandlerResult {
    let ta = sess
        .tape
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
    ta.tape_sync_state();
    let ms = &ta.mover_state;

    if ref_conn.protocol_version != NDMP9VER && ref_conn.protocol_version < NDMP4VER {
        // NDMPv2/v3 set the window on a LISTENing mover
        if ms.state != MoverState::Listen && ms.state != MoverState::Paused {
            return Err(raise_illegal_state("mover_state !LISTEN/PAUSED"));
        }
    } else {
        // NDMPv4 sets the window before MOVER_LISTEN/CONNECT
        if ms.state != MoverState::Idle && ms.state != MoverState::Paused {
            return Err(raise_illegal_state("mover_state !IDLE/PAUSED"));
        }
    }

    let record_size = ms.record_size as u64;
    if request.offset % record_size != 0 {
        return Err(raise_illegal_args("off !record_size"));
    }

    // A maximum-length window after a pause is all-ones minus the
    // offset; plain all-ones is tolerated too.
    let end_win = if request.length != LENGTH_INFINITY
        && request.length.wrapping_add(request.offset) != LENGTH_INFINITY
    {
        if request.length % record_size != 0 {
            return Err(raise_illegal_args("len !record_size"));
        }
        let mut max_len = LENGTH_INFINITY - request.offset;
        max_len -= max_len % record_size;
        if request.length > max_len {
            return Err(raise_illegal_args("length too long"));
        }
        request.offset + request.length
    } else {
        LENGTH_INFINITY
    };

    ta.mover_set_window(request.offset, request.length, end_win);
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn mover_read(sess: &mut Session, request: &MoverReadRequest) -> HandlerResult {
    let ta = sess
        .tape
        .as_deref_mut()
        .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
    ta.tape_sync_state();
    let ms = &ta.mover_state;

    if ms.state != MoverState::Active {
        return Err(raise_illegal_state("mover_state !ACTIVE"));
    }
    if ms.bytes_left_to_read > 0 {
        return Err(raise_illegal_state("bytes_left_to_read"));
    }
    if ms.data_connection_addr.addr_type() == AddrType::AsConnected {
        return Err(raise_illegal_state("mover_addr"));
    }
    if ms.mode != MoverMode::Write {
        return Err(raise_illegal_state("mover_mode !WRITE"));
    }

    ta.mover_read(request.offset, request.length);
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn mover_close(sess: &mut Session) -> HandlerResult {
    let (ta, is, _) = tape_parts(sess)?;
    if ta.mover_state.state == MoverState::Idle {
        return Err(raise_illegal_state("mover_state IDLE"));
    }
    crate::tape_agent::mover_close(ta, is);
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

fn mover_set_record_size(
    sess: &mut Session,
    request: &MoverSetRecordSizeRequest,
) -> HandlerResult {
    {
        let ta = sess
            .tape
            .as_deref_mut()
            .ok_or_else(|| raise(NdmpError::DevNotOpen, "No Tape Agent"))?;
        ta.tape_sync_state();
        let ms = &ta.mover_state;
        if ms.state != MoverState::Idle && ms.state != MoverState::Paused {
            return Err(raise_illegal_state("mover_state !IDLE/PAUSED"));
        }
        if !ok_tape_rec_len(request.record_size) {
            return Err(raise_illegal_args("!ok_tape_rec_len"));
        }
        ta.mover_state.record_size = request.record_size;
    }
    if let Some(is) = sess.image_stream.as_deref_mut() {
        is.set_record_size(request.record_size as usize);
    }
    Ok(ReplyBody::Error(NdmpError::NoErr))
}

/*
 * NOTIFY interfaces (CONTROL side)
 */

fn notify_data_halted(sess: &mut Session, _request: &NotifyDataHaltedRequest) -> HandlerResult {
    if let Some(ca) = sess.control.as_deref_mut() {
        ca.pending_notify_data_halted += 1;
    }
    Ok(ReplyBody::None)
}

fn notify_mover_halted(sess: &mut Session, _request: &NotifyMoverHaltedRequest) -> HandlerResult {
    if let Some(ca) = sess.control.as_deref_mut() {
        ca.pending_notify_mover_halted += 1;
    }
    Ok(ReplyBody::None)
}

fn notify_mover_paused(sess: &mut Session, request: &NotifyMoverPausedRequest) -> HandlerResult {
    if let Some(ca) = sess.control.as_deref_mut() {
        ca.pending_notify_mover_paused += 1;
        ca.last_notify_mover_paused = *request;
    }
    Ok(ReplyBody::None)
}

fn notify_data_read(sess: &mut Session, request: &NotifyDataReadRequest) -> HandlerResult {
    if let Some(ca) = sess.control.as_deref_mut() {
        ca.pending_notify_data_read += 1;
        ca.last_notify_data_read = *request;
    }
    Ok(ReplyBody::None)
}

/*
 * LOG and FH interfaces (CONTROL side)
 */

fn log_message(sess: &mut Session, request: &LogMessageRequest) -> HandlerResult {
    match request.log_type {
        LogType::Error => log::error!("LOG {}", request.entry),
        LogType::Warning => log::warn!("LOG {}", request.entry),
        LogType::Debug => log::debug!("LOG {}", request.entry),
        LogType::Normal => log::info!("LOG {}", request.entry),
    }
    let _ = sess;
    Ok(ReplyBody::None)
}

fn log_file(sess: &mut Session, request: &LogFileRequest) -> HandlerResult {
    if let Some(ca) = sess.control.as_deref_mut() {
        ca.recover_log_file_count += 1;
        if request.error.is_ok() {
            ca.recover_log_file_ok += 1;
        } else {
            ca.recover_log_file_error += 1;
        }
    }
    log::info!("LOG_FILE {} {}", request.name, request.error);
    Ok(ReplyBody::None)
}

fn fh_add_file(sess: &mut Session, request: FhAddFileRequest) -> HandlerResult {
    if let Some(ca) = sess.control.as_deref_mut() {
        ca.n_file_entry += request.files.len() as u32;
        ca.index_files.extend(request.files);
    }
    Ok(ReplyBody::None)
}

fn fh_add_dir(sess: &mut Session, request: FhAddDirRequest) -> HandlerResult {
    if let Some(ca) = sess.control.as_deref_mut() {
        ca.n_dir_entry += request.dirs.len() as u32;
        ca.index_dirs.extend(request.dirs);
    }
    Ok(ReplyBody::None)
}

fn fh_add_node(sess: &mut Session, request: FhAddNodeRequest) -> HandlerResult {
    if let Some(ca) = sess.control.as_deref_mut() {
        ca.n_node_entry += request.nodes.len() as u32;
        ca.index_nodes.extend(request.nodes);
    }
    Ok(ReplyBody::None)
}
