//! QUERY_AGENTS: interrogate each configured agent and log what it
//! offers.

use anyhow::Error;

use crate::conn::CallStatus;
use crate::msg::{ReplyBody, RequestBody, XaBuf};
use crate::session::{PlumbSlot, Session};

use super::{conn, robot};

fn qr(line: String) {
    log::info!("{}", line);
}

pub fn op_query(sess: &mut Session) -> Result<(), Error> {
    if super::ca_mut(sess)?.job.data_agent.is_given() {
        qr("Data Agent".to_string());
        if conn::connect_data_agent(sess).is_ok() {
            query_conn(sess, PlumbSlot::Data);
        } else {
            qr("  (connection failed)".to_string());
        }
    }

    if super::ca_mut(sess)?.job.tape_agent.is_given() {
        qr("Tape Agent".to_string());
        if conn::connect_tape_agent(sess).is_ok() {
            query_conn(sess, PlumbSlot::Tape);
        } else {
            qr("  (connection failed)".to_string());
        }
    }

    if super::ca_mut(sess)?.job.have_robot {
        qr("Robot Agent".to_string());
        if robot::robot_startup(sess).is_ok() {
            let _ = robot::robot_query(sess);
        } else {
            qr("  (connection failed)".to_string());
        }
    }

    Ok(())
}

fn query_conn(sess: &mut Session, slot: PlumbSlot) {
    let mut xa = XaBuf::request(RequestBody::ConfigGetInfo);
    match sess.call(slot, &mut xa) {
        CallStatus::Ok | CallStatus::ReplyLate => {}
        _ => {
            qr("  CONFIG_GET_INFO failed".to_string());
            return;
        }
    }
    let info = match xa.reply.body {
        ReplyBody::ConfigGetInfo(reply) => reply.config_info,
        _ => return,
    };

    qr(format!("  Host '{}'", info.hostname));
    qr(format!("  OS {} {}", info.os_type, info.os_vers));
    qr(format!("  Connection types {:?}", info.conntypes));
    qr(format!("  Auth types {:?}", info.authtypes));

    for bu in &info.butype_info {
        qr(format!("  Backup type '{}' attrs {:#x}", bu.butype_name, bu.attrs));
        for pv in &bu.default_env {
            qr(format!("    default {}={}", pv.name, pv.value));
        }
    }
    for fs in &info.fs_info {
        qr(format!(
            "  FS {} {} ({})",
            fs.fs_type, fs.fs_logical_device, fs.fs_status
        ));
    }
    for dev in &info.tape_info {
        qr(format!("  Tape {} {}", dev.model, dev.device));
    }
    for dev in &info.scsi_info {
        qr(format!("  SCSI {} {}", dev.model, dev.device));
    }
}
