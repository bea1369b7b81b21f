//! CONTROL-originated calls to the DATA, TAPE and ROBOT agents.
//!
//! Each wrapper marshals a canonical request, lets the session
//! bridge it onto the connection's wire version, and folds the reply
//! back into the control agent's state snapshots.

use anyhow::{bail, format_err, Error};

use ndmp_api_types::*;

use crate::conn::CallStatus;
use crate::msg::*;
use crate::session::{PlumbSlot, Session};

fn call(sess: &mut Session, slot: PlumbSlot, body: RequestBody) -> Result<ReplyBody, Error> {
    let code = body.code();
    let mut xa = XaBuf::request(body);
    match sess.call(slot, &mut xa) {
        CallStatus::Ok | CallStatus::ReplyLate => Ok(xa.reply.body),
        CallStatus::ReplyError => bail!(
            "{} failed: {}",
            code,
            xa.reply.body.body_error()
        ),
        CallStatus::HdrError => bail!("{} failed: {}", code, xa.reply.header.error),
        CallStatus::Botch => bail!("{} failed: connection botch", code),
    }
}

/// Close every agent connection politely.
pub fn connect_close(sess: &mut Session) {
    for slot in sess.plumb.distinct_slots() {
        if slot == PlumbSlot::Control {
            continue;
        }
        let mut xa = XaBuf::request(RequestBody::ConnectClose);
        let _ = sess.call_no_tattle(slot, &mut xa);
    }
}

/*
 * DATA agent calls
 */

pub fn data_get_state(sess: &mut Session) -> Result<(), Error> {
    let reply = call(sess, PlumbSlot::Data, RequestBody::DataGetState)?;
    match reply {
        ReplyBody::DataGetState(state) => {
            super::ca_mut(sess)?.data_state = state;
            Ok(())
        }
        other => bail!("unexpected DATA_GET_STATE reply {:?}", other),
    }
}

pub fn data_listen(sess: &mut Session, addr_type: AddrType) -> Result<(), Error> {
    let reply = call(
        sess,
        PlumbSlot::Data,
        RequestBody::DataListen(DataListenRequest { addr_type }),
    )?;
    match reply {
        ReplyBody::Addr(addr) => {
            super::ca_mut(sess)?.data_addr = addr.data_connection_addr;
            Ok(())
        }
        other => bail!("unexpected DATA_LISTEN reply {:?}", other),
    }
}

pub fn data_connect(sess: &mut Session) -> Result<(), Error> {
    let addr = super::ca_mut(sess)?.mover_addr.clone();
    call(
        sess,
        PlumbSlot::Data,
        RequestBody::DataConnect(DataConnectRequest { addr }),
    )?;
    Ok(())
}

fn start_addr(sess: &mut Session) -> Result<DataAddr, Error> {
    let ca = super::ca_mut(sess)?;
    // with swapped connect order the DATA agent listened and the
    // MOVER already connected to it
    if ca.swap_connect {
        Ok(DataAddr::AsConnected)
    } else {
        Ok(ca.mover_addr.clone())
    }
}

pub fn data_start_backup(sess: &mut Session) -> Result<(), Error> {
    let addr = start_addr(sess)?;
    let (bu_type, env) = {
        let ca = super::ca_mut(sess)?;
        (ca.job.bu_type.clone(), ca.job.env_tab.clone())
    };
    call(
        sess,
        PlumbSlot::Data,
        RequestBody::DataStartBackup(DataStartBackupRequest { addr, bu_type, env }),
    )?;
    Ok(())
}

pub fn data_start_recover(sess: &mut Session) -> Result<(), Error> {
    let addr = start_addr(sess)?;
    let (bu_type, env, nlist) = {
        let ca = super::ca_mut(sess)?;
        (
            ca.job.bu_type.clone(),
            ca.job.env_tab.clone(),
            ca.job.nlist_tab.clone(),
        )
    };
    call(
        sess,
        PlumbSlot::Data,
        RequestBody::DataStartRecover(DataStartRecoverRequest {
            addr,
            bu_type,
            env,
            nlist,
        }),
    )?;
    Ok(())
}

pub fn data_start_recover_filehist(sess: &mut Session) -> Result<(), Error> {
    let addr = start_addr(sess)?;
    let (bu_type, env, nlist) = {
        let ca = super::ca_mut(sess)?;
        (
            ca.job.bu_type.clone(),
            ca.job.env_tab.clone(),
            ca.job.nlist_tab.clone(),
        )
    };
    call(
        sess,
        PlumbSlot::Data,
        RequestBody::DataStartRecoverFilehist(DataStartRecoverRequest {
            addr,
            bu_type,
            env,
            nlist,
        }),
    )?;
    Ok(())
}

pub fn data_abort(sess: &mut Session) -> Result<(), Error> {
    call(sess, PlumbSlot::Data, RequestBody::DataAbort)?;
    Ok(())
}

/// Fetch the formatter's accumulated environment after a backup.
pub fn data_get_env(sess: &mut Session) -> Result<(), Error> {
    let reply = call(sess, PlumbSlot::Data, RequestBody::DataGetEnv)?;
    match reply {
        ReplyBody::DataGetEnv(env) => {
            super::ca_mut(sess)?.job.result_env_tab = env.env;
            Ok(())
        }
        other => bail!("unexpected DATA_GET_ENV reply {:?}", other),
    }
}

pub fn data_stop(sess: &mut Session) -> Result<(), Error> {
    call(sess, PlumbSlot::Data, RequestBody::DataStop)?;
    Ok(())
}

/*
 * TAPE agent calls
 */

pub fn tape_open(sess: &mut Session, device: &str, mode: TapeOpenMode) -> Result<(), Error> {
    call(
        sess,
        PlumbSlot::Tape,
        RequestBody::TapeOpen(TapeOpenRequest {
            device: device.to_string(),
            mode,
        }),
    )?;
    Ok(())
}

pub fn tape_close(sess: &mut Session) -> Result<(), Error> {
    call(sess, PlumbSlot::Tape, RequestBody::TapeClose)?;
    Ok(())
}

pub fn tape_get_state(sess: &mut Session) -> Result<(), Error> {
    let reply = call(sess, PlumbSlot::Tape, RequestBody::TapeGetState)?;
    match reply {
        ReplyBody::TapeGetState(state) => {
            super::ca_mut(sess)?.tape_state = state;
            Ok(())
        }
        other => bail!("unexpected TAPE_GET_STATE reply {:?}", other),
    }
}

pub fn tape_get_state_no_tattle(sess: &mut Session) {
    let mut xa = XaBuf::request(RequestBody::TapeGetState);
    let status = sess.call_no_tattle(PlumbSlot::Tape, &mut xa);
    if status == CallStatus::Ok || status == CallStatus::ReplyLate {
        if let ReplyBody::TapeGetState(state) = xa.reply.body {
            if let Ok(ca) = super::ca_mut(sess) {
                ca.tape_state = state;
            }
        }
    }
}

pub fn tape_mtio(sess: &mut Session, tape_op: MtioOp, count: u32) -> Result<u32, Error> {
    let reply = call(
        sess,
        PlumbSlot::Tape,
        RequestBody::TapeMtio(TapeMtioRequest { tape_op, count }),
    )?;
    match reply {
        ReplyBody::TapeMtio(reply) => {
            if !reply.error.is_ok() {
                bail!("TAPE_MTIO {:?} failed: {}", tape_op, reply.error);
            }
            Ok(reply.resid_count)
        }
        other => bail!("unexpected TAPE_MTIO reply {:?}", other),
    }
}

pub fn tape_write(sess: &mut Session, data: &[u8]) -> Result<(), Error> {
    let reply = call(
        sess,
        PlumbSlot::Tape,
        RequestBody::TapeWrite(TapeWriteRequest {
            data_out: data.to_vec(),
        }),
    )?;
    match reply {
        ReplyBody::TapeWrite(reply) => {
            if !reply.error.is_ok() {
                bail!("TAPE_WRITE failed: {}", reply.error);
            }
            if reply.count as usize != data.len() {
                bail!("TAPE_WRITE short ({} of {})", reply.count, data.len());
            }
            Ok(())
        }
        other => bail!("unexpected TAPE_WRITE reply {:?}", other),
    }
}

pub fn tape_read(sess: &mut Session, count: u32) -> Result<Vec<u8>, Error> {
    let reply = call(
        sess,
        PlumbSlot::Tape,
        RequestBody::TapeRead(TapeReadRequest { count }),
    )?;
    match reply {
        ReplyBody::TapeRead(reply) => {
            if !reply.error.is_ok() {
                bail!("TAPE_READ failed: {}", reply.error);
            }
            Ok(reply.data_in)
        }
        other => bail!("unexpected TAPE_READ reply {:?}", other),
    }
}

/*
 * MOVER calls
 */

pub fn mover_get_state(sess: &mut Session) -> Result<(), Error> {
    let reply = call(sess, PlumbSlot::Tape, RequestBody::MoverGetState)?;
    match reply {
        ReplyBody::MoverGetState(state) => {
            super::ca_mut(sess)?.mover_state = state;
            Ok(())
        }
        other => bail!("unexpected MOVER_GET_STATE reply {:?}", other),
    }
}

pub fn mover_listen(sess: &mut Session) -> Result<(), Error> {
    let (mode, addr_type) = {
        let ca = super::ca_mut(sess)?;
        (ca.mover_mode, ca.image_addr_type)
    };
    let reply = call(
        sess,
        PlumbSlot::Tape,
        RequestBody::MoverListen(MoverListenRequest { mode, addr_type }),
    )?;
    match reply {
        ReplyBody::Addr(addr) => {
            super::ca_mut(sess)?.mover_addr = addr.data_connection_addr;
            Ok(())
        }
        other => bail!("unexpected MOVER_LISTEN reply {:?}", other),
    }
}

pub fn mover_connect(sess: &mut Session) -> Result<(), Error> {
    let (mode, addr) = {
        let ca = super::ca_mut(sess)?;
        (ca.mover_mode, ca.data_addr.clone())
    };
    call(
        sess,
        PlumbSlot::Tape,
        RequestBody::MoverConnect(MoverConnectRequest { mode, addr }),
    )?;
    Ok(())
}

pub fn mover_continue(sess: &mut Session) -> Result<(), Error> {
    call(sess, PlumbSlot::Tape, RequestBody::MoverContinue)?;
    Ok(())
}

pub fn mover_abort(sess: &mut Session) -> Result<(), Error> {
    call(sess, PlumbSlot::Tape, RequestBody::MoverAbort)?;
    Ok(())
}

pub fn mover_stop(sess: &mut Session) -> Result<(), Error> {
    call(sess, PlumbSlot::Tape, RequestBody::MoverStop)?;
    Ok(())
}

pub fn mover_close(sess: &mut Session) -> Result<(), Error> {
    call(sess, PlumbSlot::Tape, RequestBody::MoverClose)?;
    Ok(())
}

pub fn mover_set_window(sess: &mut Session, offset: u64, length: u64) -> Result<(), Error> {
    call(
        sess,
        PlumbSlot::Tape,
        RequestBody::MoverSetWindow(MoverSetWindowRequest { offset, length }),
    )?;
    Ok(())
}

pub fn mover_read(sess: &mut Session, offset: u64, length: u64) -> Result<(), Error> {
    call(
        sess,
        PlumbSlot::Tape,
        RequestBody::MoverRead(MoverReadRequest { offset, length }),
    )?;
    Ok(())
}

pub fn mover_set_record_size(sess: &mut Session) -> Result<(), Error> {
    let record_size = super::ca_mut(sess)?.job.record_size;
    if record_size == 0 {
        return Err(format_err!("job record size not set"));
    }
    call(
        sess,
        PlumbSlot::Tape,
        RequestBody::MoverSetRecordSize(MoverSetRecordSizeRequest { record_size }),
    )?;
    Ok(())
}

/*
 * ROBOT calls
 */

pub fn scsi_open(sess: &mut Session, device: &str) -> Result<(), Error> {
    call(
        sess,
        PlumbSlot::Robot,
        RequestBody::ScsiOpen(ScsiOpenRequest {
            device: device.to_string(),
        }),
    )?;
    Ok(())
}

pub fn scsi_close(sess: &mut Session) -> Result<(), Error> {
    call(sess, PlumbSlot::Robot, RequestBody::ScsiClose)?;
    Ok(())
}

pub fn scsi_execute_cdb(
    sess: &mut Session,
    request: ExecuteCdbRequest,
) -> Result<ExecuteCdbReply, Error> {
    let reply = call(sess, PlumbSlot::Robot, RequestBody::ScsiExecuteCdb(request))?;
    match reply {
        ReplyBody::ExecuteCdb(reply) => Ok(reply),
        other => bail!("unexpected SCSI_EXECUTE_CDB reply {:?}", other),
    }
}
