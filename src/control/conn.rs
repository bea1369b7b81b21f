//! CONTROL-side connection establishment.
//!
//! Resident agents get an in-process shortcut connection; remote
//! agents get a TCP control connection followed by CONNECT_OPEN and
//! CONNECT_CLIENT_AUTH. A slot whose agent spec matches an already
//! connected one shares that connection, which is what makes LOCAL
//! image-stream addressing possible when DATA and TAPE live on the
//! same host.

use anyhow::{bail, Error};

use ndmp_api_types::NDMP9VER;

use crate::conn::Conn;
use crate::msg::{
    AuthData, ConnectClientAuthRequest, ConnectOpenRequest, RequestBody, XaBuf,
};
use crate::session::{PlumbSlot, Session};

use super::job::AgentSpec;
use super::calls;

pub fn connect_control_agent(sess: &mut Session) -> Result<(), Error> {
    let mut conn = Conn::resident("#C");
    conn.protocol_version = NDMP9VER;
    sess.plumb.set(PlumbSlot::Control, Some(conn));
    Ok(())
}

pub fn connect_data_agent(sess: &mut Session) -> Result<(), Error> {
    let spec = super::ca_mut(sess)?.job.data_agent.clone();
    connect_agent(sess, PlumbSlot::Data, &spec, "#D")
}

pub fn connect_tape_agent(sess: &mut Session) -> Result<(), Error> {
    let (spec, data_spec) = {
        let ca = super::ca_mut(sess)?;
        (ca.job.tape_agent.clone(), ca.job.data_agent.clone())
    };
    // use the DATA connection when no TAPE agent was named, or when
    // both point at the same host
    let effective = if spec.is_given() { spec } else { data_spec.clone() };
    if effective == data_spec && sess.plumb.get(PlumbSlot::Data).is_some() {
        sess.plumb.share(PlumbSlot::Data, PlumbSlot::Tape);
        return Ok(());
    }
    connect_agent(sess, PlumbSlot::Tape, &effective, "#T")
}

pub fn connect_robot_agent(sess: &mut Session) -> Result<(), Error> {
    let (spec, tape_spec, data_spec) = {
        let ca = super::ca_mut(sess)?;
        (
            ca.job.robot_agent.clone(),
            ca.job.tape_agent.clone(),
            ca.job.data_agent.clone(),
        )
    };
    let effective = if spec.is_given() {
        spec
    } else if tape_spec.is_given() {
        tape_spec
    } else {
        data_spec
    };
    for (other_slot, other_spec) in [
        (PlumbSlot::Tape, super::ca_mut(sess)?.job.tape_agent.clone()),
        (PlumbSlot::Data, super::ca_mut(sess)?.job.data_agent.clone()),
    ] {
        if effective == other_spec && sess.plumb.get(other_slot).is_some() {
            sess.plumb.share(other_slot, PlumbSlot::Robot);
            return Ok(());
        }
    }
    connect_agent(sess, PlumbSlot::Robot, &effective, "#R")
}

fn connect_agent(
    sess: &mut Session,
    slot: PlumbSlot,
    spec: &AgentSpec,
    name: &'static str,
) -> Result<(), Error> {
    if sess.plumb.get(slot).is_some() {
        return Ok(()); // already connected
    }

    match spec {
        AgentSpec::None => bail!("no {} agent specified", name),

        AgentSpec::Resident => {
            let mut conn = Conn::resident(name);
            conn.protocol_version = NDMP9VER;
            sess.plumb.set(slot, Some(conn));
            Ok(())
        }

        AgentSpec::Remote {
            addr,
            account,
            password,
        } => {
            let mut conn = Conn::connect(*addr, name)?;
            conn.snoop = sess.conn_snooping;
            conn.time_limit = super::ca_mut(sess)?.job.time_limit;
            let protocol_version = conn.protocol_version;
            sess.plumb.set(slot, Some(conn));

            let mut xa = XaBuf::request(RequestBody::ConnectOpen(ConnectOpenRequest {
                protocol_version,
            }));
            if sess.call(slot, &mut xa) != crate::conn::CallStatus::Ok {
                bail!("CONNECT_OPEN failed on {}", name);
            }

            if !account.is_empty() {
                let mut xa = XaBuf::request(RequestBody::ConnectClientAuth(
                    ConnectClientAuthRequest {
                        auth_data: AuthData::Text {
                            auth_id: account.clone(),
                            auth_password: password.clone(),
                        },
                    },
                ));
                if sess.call(slot, &mut xa) != crate::conn::CallStatus::Ok {
                    bail!("CONNECT_CLIENT_AUTH failed on {}", name);
                }
            }
            Ok(())
        }
    }
}

/// Close agent connections at end of job.
pub fn connect_close(sess: &mut Session) {
    calls::connect_close(sess);
}
