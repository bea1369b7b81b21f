//! NDMPv2 wire forms and the bridge to the canonical form.
//!
//! Version 2 differs structurally from the canonical form: there is
//! no DATA_CONNECT/DATA_LISTEN/MOVER_CONNECT (the start requests
//! carry the mover address directly), addresses cannot express
//! AS_CONNECTED, the log family is split into LOG_LOG and LOG_DEBUG,
//! file history uses the unix_path message names, and the EOW pause
//! reason does not exist on the wire (it degrades to EOF).

use serde::{Deserialize, Serialize};

use ndmp_api_types::*;

use super::{
    AuthData, ConfigGetAuthAttrReply, ConfigGetAuthAttrRequest, ConfigGetInfoReply,
    DataGetEnvReply, FhAddDirRequest, FhAddFileRequest, FhAddNodeRequest, LogFileRequest,
    LogMessageRequest, LogType, MoverListenRequest, MoverReadRequest, MoverSetRecordSizeRequest,
    MoverSetWindowRequest, NotifyConnectedRequest, NotifyDataHaltedRequest,
    NotifyDataReadRequest, NotifyMoverHaltedRequest, NotifyMoverPausedRequest, ScsiOpenRequest,
    TapeMtioReply, TapeMtioRequest, TapeOpenRequest, TapeReadReply, TapeReadRequest,
    TapeWriteReply, TapeWriteRequest,
};

/// NDMPv2 image stream address. No AS_CONNECTED, no environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum V2Addr {
    Local,
    Tcp { ip_addr: u32, port: u16 },
}

impl V2Addr {
    fn to_v9(&self) -> DataAddr {
        match self {
            V2Addr::Local => DataAddr::Local,
            V2Addr::Tcp { ip_addr, port } => DataAddr::Tcp(TcpAddr::new(*ip_addr, *port)),
        }
    }

    fn from_v9(addr: &DataAddr) -> NdmpResult<Self> {
        match addr {
            DataAddr::Local => Ok(V2Addr::Local),
            DataAddr::Tcp(tcp) => Ok(V2Addr::Tcp {
                ip_addr: tcp.ip_addr,
                port: tcp.port,
            }),
            DataAddr::AsConnected => Err(NdmpError::NotSupported),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V2DataStartBackupRequest {
    pub mover: V2Addr,
    pub bu_type: String,
    pub env: Vec<Pval>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V2DataStartRecoverRequest {
    pub mover: V2Addr,
    pub bu_type: String,
    pub env: Vec<Pval>,
    pub nlist: Vec<NlistEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V2LogLogRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V2LogDebugRequest {
    pub level: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    ConnectOpen(super::ConnectOpenRequest),
    ConnectClientAuth(AuthData),
    ConnectClose,
    ConnectServerAuth,

    ConfigGetInfo,
    ConfigGetAuthAttr(ConfigGetAuthAttrRequest),

    ScsiOpen(ScsiOpenRequest),
    ScsiClose,
    ScsiGetState,
    ScsiResetDevice,
    ScsiExecuteCdb(ExecuteCdbRequest),

    TapeOpen(TapeOpenRequest),
    TapeClose,
    TapeGetState,
    TapeMtio(TapeMtioRequest),
    TapeWrite(TapeWriteRequest),
    TapeRead(TapeReadRequest),
    TapeExecuteCdb(ExecuteCdbRequest),

    DataGetState,
    DataStartBackup(V2DataStartBackupRequest),
    DataStartRecover(V2DataStartRecoverRequest),
    DataStartRecoverFilehist(V2DataStartRecoverRequest),
    DataAbort,
    DataGetEnv,
    DataStop,

    MoverGetState,
    MoverListen(MoverListenRequest),
    MoverContinue,
    MoverAbort,
    MoverStop,
    MoverSetWindow(MoverSetWindowRequest),
    MoverRead(MoverReadRequest),
    MoverClose,
    MoverSetRecordSize(MoverSetRecordSizeRequest),

    NotifyConnected(NotifyConnectedRequest),
    NotifyDataHalted(NotifyDataHaltedRequest),
    NotifyMoverHalted(NotifyMoverHaltedRequest),
    NotifyMoverPaused(NotifyMoverPausedRequest),
    NotifyDataRead(NotifyDataReadRequest),

    LogLog(V2LogLogRequest),
    LogDebug(V2LogDebugRequest),
    LogFile(LogFileRequest),

    FhAddUnixPath(FhAddFileRequest),
    FhAddUnixDir(FhAddDirRequest),
    FhAddUnixNode(FhAddNodeRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyBody {
    None,
    Error(NdmpError),
    ConfigGetInfo(ConfigGetInfoReply),
    ConfigGetAuthAttr(ConfigGetAuthAttrReply),
    ScsiGetState(ScsiGetStateReply),
    ExecuteCdb(ExecuteCdbReply),
    TapeGetState(TapeGetStateReply),
    TapeMtio(TapeMtioReply),
    TapeWrite(TapeWriteReply),
    TapeRead(TapeReadReply),
    DataGetState(DataGetStateReply),
    DataGetEnv(DataGetEnvReply),
    MoverGetState(MoverGetStateReply),
    Addr(super::AddrReply),
}

fn strip_addr(addr: &DataAddr) -> NdmpResult<DataAddr> {
    V2Addr::from_v9(addr).map(|a| a.to_v9())
}

/// An EOW pause cannot be expressed on a v2 wire.
fn degrade_pause_reason(reason: MoverPauseReason) -> MoverPauseReason {
    match reason {
        MoverPauseReason::Eow => MoverPauseReason::Eof,
        other => other,
    }
}

pub fn request_to_v9(body: RequestBody) -> NdmpResult<super::RequestBody> {
    use super::RequestBody as V9;
    Ok(match body {
        RequestBody::ConnectOpen(r) => V9::ConnectOpen(r),
        RequestBody::ConnectClientAuth(auth_data) => {
            V9::ConnectClientAuth(super::ConnectClientAuthRequest { auth_data })
        }
        RequestBody::ConnectClose => V9::ConnectClose,
        RequestBody::ConnectServerAuth => V9::ConnectServerAuth,
        RequestBody::ConfigGetInfo => V9::ConfigGetInfo,
        RequestBody::ConfigGetAuthAttr(r) => V9::ConfigGetAuthAttr(r),
        RequestBody::ScsiOpen(r) => V9::ScsiOpen(r),
        RequestBody::ScsiClose => V9::ScsiClose,
        RequestBody::ScsiGetState => V9::ScsiGetState,
        RequestBody::ScsiResetDevice => V9::ScsiResetDevice,
        RequestBody::ScsiExecuteCdb(r) => V9::ScsiExecuteCdb(r),
        RequestBody::TapeOpen(r) => V9::TapeOpen(r),
        RequestBody::TapeClose => V9::TapeClose,
        RequestBody::TapeGetState => V9::TapeGetState,
        RequestBody::TapeMtio(r) => V9::TapeMtio(r),
        RequestBody::TapeWrite(r) => V9::TapeWrite(r),
        RequestBody::TapeRead(r) => V9::TapeRead(r),
        RequestBody::TapeExecuteCdb(r) => V9::TapeExecuteCdb(r),
        RequestBody::DataGetState => V9::DataGetState,
        RequestBody::DataStartBackup(r) => V9::DataStartBackup(super::DataStartBackupRequest {
            addr: r.mover.to_v9(),
            bu_type: r.bu_type,
            env: r.env,
        }),
        RequestBody::DataStartRecover(r) => V9::DataStartRecover(to_v9_recover(r)),
        RequestBody::DataStartRecoverFilehist(r) => {
            V9::DataStartRecoverFilehist(to_v9_recover(r))
        }
        RequestBody::DataAbort => V9::DataAbort,
        RequestBody::DataGetEnv => V9::DataGetEnv,
        RequestBody::DataStop => V9::DataStop,
        RequestBody::MoverGetState => V9::MoverGetState,
        RequestBody::MoverListen(r) => V9::MoverListen(r),
        RequestBody::MoverContinue => V9::MoverContinue,
        RequestBody::MoverAbort => V9::MoverAbort,
        RequestBody::MoverStop => V9::MoverStop,
        RequestBody::MoverSetWindow(r) => V9::MoverSetWindow(r),
        RequestBody::MoverRead(r) => V9::MoverRead(r),
        RequestBody::MoverClose => V9::MoverClose,
        RequestBody::MoverSetRecordSize(r) => V9::MoverSetRecordSize(r),
        RequestBody::NotifyConnected(r) => V9::NotifyConnected(r),
        RequestBody::NotifyDataHalted(r) => V9::NotifyDataHalted(r),
        RequestBody::NotifyMoverHalted(r) => V9::NotifyMoverHalted(r),
        RequestBody::NotifyMoverPaused(r) => V9::NotifyMoverPaused(r),
        RequestBody::NotifyDataRead(r) => V9::NotifyDataRead(r),
        RequestBody::LogLog(r) => V9::LogMessage(LogMessageRequest {
            log_type: LogType::Normal,
            message_id: 0,
            entry: r.entry,
        }),
        RequestBody::LogDebug(r) => V9::LogMessage(LogMessageRequest {
            log_type: LogType::Debug,
            message_id: r.level,
            entry: r.message,
        }),
        RequestBody::LogFile(r) => V9::LogFile(r),
        RequestBody::FhAddUnixPath(r) => V9::FhAddFile(r),
        RequestBody::FhAddUnixDir(r) => V9::FhAddDir(r),
        RequestBody::FhAddUnixNode(r) => V9::FhAddNode(r),
    })
}

fn to_v9_recover(r: V2DataStartRecoverRequest) -> super::DataStartRecoverRequest {
    super::DataStartRecoverRequest {
        addr: r.mover.to_v9(),
        bu_type: r.bu_type,
        env: r.env,
        nlist: r.nlist,
    }
}

pub fn request_from_v9(body: &super::RequestBody) -> NdmpResult<RequestBody> {
    use super::RequestBody as V9;
    Ok(match body {
        V9::ConnectOpen(r) => RequestBody::ConnectOpen(r.clone()),
        V9::ConnectClientAuth(r) => RequestBody::ConnectClientAuth(r.auth_data.clone()),
        V9::ConnectClose => RequestBody::ConnectClose,
        V9::ConnectServerAuth => RequestBody::ConnectServerAuth,
        V9::ConfigGetInfo => RequestBody::ConfigGetInfo,
        V9::ConfigGetAuthAttr(r) => RequestBody::ConfigGetAuthAttr(*r),
        V9::ScsiOpen(r) => RequestBody::ScsiOpen(r.clone()),
        V9::ScsiClose => RequestBody::ScsiClose,
        V9::ScsiGetState => RequestBody::ScsiGetState,
        V9::ScsiResetDevice => RequestBody::ScsiResetDevice,
        V9::ScsiExecuteCdb(r) => RequestBody::ScsiExecuteCdb(r.clone()),
        V9::TapeOpen(r) => RequestBody::TapeOpen(r.clone()),
        V9::TapeClose => RequestBody::TapeClose,
        V9::TapeGetState => RequestBody::TapeGetState,
        V9::TapeMtio(r) => RequestBody::TapeMtio(*r),
        V9::TapeWrite(r) => RequestBody::TapeWrite(r.clone()),
        V9::TapeRead(r) => RequestBody::TapeRead(*r),
        V9::TapeExecuteCdb(r) => RequestBody::TapeExecuteCdb(r.clone()),
        V9::DataGetState => RequestBody::DataGetState,
        V9::DataStartBackup(r) => RequestBody::DataStartBackup(V2DataStartBackupRequest {
            mover: V2Addr::from_v9(&r.addr)?,
            bu_type: r.bu_type.clone(),
            env: r.env.clone(),
        }),
        V9::DataStartRecover(r) => RequestBody::DataStartRecover(from_v9_recover(r)?),
        V9::DataStartRecoverFilehist(r) => {
            RequestBody::DataStartRecoverFilehist(from_v9_recover(r)?)
        }
        V9::DataAbort => RequestBody::DataAbort,
        V9::DataGetEnv => RequestBody::DataGetEnv,
        V9::DataStop => RequestBody::DataStop,
        V9::DataListen(_) | V9::DataConnect(_) | V9::MoverConnect(_) => {
            return Err(NdmpError::NotSupported);
        }
        V9::MoverGetState => RequestBody::MoverGetState,
        V9::MoverListen(r) => RequestBody::MoverListen(*r),
        V9::MoverContinue => RequestBody::MoverContinue,
        V9::MoverAbort => RequestBody::MoverAbort,
        V9::MoverStop => RequestBody::MoverStop,
        V9::MoverSetWindow(r) => RequestBody::MoverSetWindow(*r),
        V9::MoverRead(r) => RequestBody::MoverRead(*r),
        V9::MoverClose => RequestBody::MoverClose,
        V9::MoverSetRecordSize(r) => RequestBody::MoverSetRecordSize(*r),
        V9::NotifyConnected(r) => RequestBody::NotifyConnected(r.clone()),
        V9::NotifyDataHalted(r) => RequestBody::NotifyDataHalted(*r),
        V9::NotifyMoverHalted(r) => RequestBody::NotifyMoverHalted(*r),
        V9::NotifyMoverPaused(r) => RequestBody::NotifyMoverPaused(NotifyMoverPausedRequest {
            reason: degrade_pause_reason(r.reason),
            seek_position: r.seek_position,
        }),
        V9::NotifyDataRead(r) => RequestBody::NotifyDataRead(*r),
        V9::LogMessage(r) => match r.log_type {
            LogType::Debug => RequestBody::LogDebug(V2LogDebugRequest {
                level: r.message_id,
                message: r.entry.clone(),
            }),
            _ => RequestBody::LogLog(V2LogLogRequest {
                entry: r.entry.clone(),
            }),
        },
        V9::LogFile(r) => RequestBody::LogFile(r.clone()),
        V9::FhAddFile(r) => RequestBody::FhAddUnixPath(r.clone()),
        V9::FhAddDir(r) => RequestBody::FhAddUnixDir(r.clone()),
        V9::FhAddNode(r) => RequestBody::FhAddUnixNode(r.clone()),
    })
}

fn from_v9_recover(
    r: &super::DataStartRecoverRequest,
) -> NdmpResult<V2DataStartRecoverRequest> {
    Ok(V2DataStartRecoverRequest {
        mover: V2Addr::from_v9(&r.addr)?,
        bu_type: r.bu_type.clone(),
        env: r.env.clone(),
        nlist: r.nlist.clone(),
    })
}

pub fn reply_to_v9(body: ReplyBody) -> NdmpResult<super::ReplyBody> {
    use super::ReplyBody as V9;
    Ok(match body {
        ReplyBody::None => V9::None,
        ReplyBody::Error(e) => V9::Error(e),
        ReplyBody::ConfigGetInfo(r) => V9::ConfigGetInfo(r),
        ReplyBody::ConfigGetAuthAttr(r) => V9::ConfigGetAuthAttr(r),
        ReplyBody::ScsiGetState(r) => V9::ScsiGetState(r),
        ReplyBody::ExecuteCdb(r) => V9::ExecuteCdb(r),
        ReplyBody::TapeGetState(r) => V9::TapeGetState(r),
        ReplyBody::TapeMtio(r) => V9::TapeMtio(r),
        ReplyBody::TapeWrite(r) => V9::TapeWrite(r),
        ReplyBody::TapeRead(r) => V9::TapeRead(r),
        ReplyBody::DataGetState(r) => V9::DataGetState(r),
        ReplyBody::DataGetEnv(r) => V9::DataGetEnv(r),
        ReplyBody::MoverGetState(r) => V9::MoverGetState(r),
        ReplyBody::Addr(r) => V9::Addr(r),
    })
}

pub fn reply_from_v9(body: &super::ReplyBody) -> NdmpResult<ReplyBody> {
    use super::ReplyBody as V9;
    Ok(match body {
        V9::None => ReplyBody::None,
        V9::Error(e) => ReplyBody::Error(*e),
        V9::ConfigGetInfo(r) => ReplyBody::ConfigGetInfo(r.clone()),
        V9::ConfigGetAuthAttr(r) => ReplyBody::ConfigGetAuthAttr(r.clone()),
        V9::ScsiGetState(r) => ReplyBody::ScsiGetState(r.clone()),
        V9::ExecuteCdb(r) => ReplyBody::ExecuteCdb(r.clone()),
        V9::TapeGetState(r) => ReplyBody::TapeGetState(r.clone()),
        V9::TapeMtio(r) => ReplyBody::TapeMtio(*r),
        V9::TapeWrite(r) => ReplyBody::TapeWrite(*r),
        V9::TapeRead(r) => ReplyBody::TapeRead(r.clone()),
        V9::DataGetState(r) => {
            let mut r = r.clone();
            r.data_connection_addr = strip_addr(&r.data_connection_addr)
                .unwrap_or(DataAddr::Local);
            ReplyBody::DataGetState(r)
        }
        V9::DataGetEnv(r) => ReplyBody::DataGetEnv(r.clone()),
        V9::MoverGetState(r) => {
            let mut r = r.clone();
            r.pause_reason = degrade_pause_reason(r.pause_reason);
            r.data_connection_addr = strip_addr(&r.data_connection_addr)
                .unwrap_or(DataAddr::Local);
            ReplyBody::MoverGetState(r)
        }
        V9::Addr(r) => {
            let mut r = r.clone();
            r.data_connection_addr = strip_addr(&r.data_connection_addr)
                .unwrap_or(DataAddr::Local);
            ReplyBody::Addr(r)
        }
    })
}
