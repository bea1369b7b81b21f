//! NDMP message model.
//!
//! The canonical ("version 9") request and reply bodies live here;
//! they are what handlers and the CONTROL agent operate on. The
//! version modules translate between these and the NDMPv2/v3/v4 wire
//! forms. Canonical bodies never appear on the wire.

use serde::{Deserialize, Serialize};

use ndmp_api_types::*;

pub mod v2;
pub mod v3;
pub mod v4;

mod wire;
pub use wire::*;

/// Message identifiers, canonical numbering. The class nibble
/// (0x500 notify, 0x600 log, 0x700 file history) marks unilateral
/// messages which never get a transmitted reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum MessageCode {
    ConfigGetInfo = 0x100,
    ConfigGetAuthAttr = 0x103,

    ScsiOpen = 0x200,
    ScsiClose = 0x201,
    ScsiGetState = 0x202,
    ScsiResetDevice = 0x204,
    ScsiExecuteCdb = 0x206,

    TapeOpen = 0x300,
    TapeClose = 0x301,
    TapeGetState = 0x302,
    TapeMtio = 0x303,
    TapeWrite = 0x304,
    TapeRead = 0x305,
    TapeExecuteCdb = 0x307,

    DataGetState = 0x400,
    DataStartBackup = 0x401,
    DataStartRecover = 0x402,
    DataAbort = 0x403,
    DataGetEnv = 0x404,
    DataStop = 0x407,
    DataListen = 0x409,
    DataConnect = 0x40A,
    DataStartRecoverFilehist = 0x40B,

    NotifyDataHalted = 0x501,
    NotifyConnected = 0x502,
    NotifyMoverHalted = 0x503,
    NotifyMoverPaused = 0x504,
    NotifyDataRead = 0x505,

    LogFile = 0x602,
    LogMessage = 0x603,

    FhAddFile = 0x703,
    FhAddDir = 0x704,
    FhAddNode = 0x705,

    ConnectOpen = 0x900,
    ConnectClientAuth = 0x901,
    ConnectClose = 0x902,
    ConnectServerAuth = 0x903,

    MoverGetState = 0xA00,
    MoverListen = 0xA01,
    MoverContinue = 0xA02,
    MoverAbort = 0xA03,
    MoverStop = 0xA04,
    MoverSetWindow = 0xA05,
    MoverRead = 0xA06,
    MoverClose = 0xA07,
    MoverSetRecordSize = 0xA08,
    MoverConnect = 0xA09,
}

impl MessageCode {
    pub fn class(self) -> u16 {
        self as u16 & 0xFF00
    }

    /// Notify, log and file-history messages carry no reply.
    pub fn is_unilateral(self) -> bool {
        matches!(self.class(), 0x500 | 0x600 | 0x700)
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Reply,
}

/// The 24-byte wire header, in decoded form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Header {
    pub sequence: u32,
    pub time_stamp: u32,
    pub message_type: MessageType,
    pub message: MessageCode,
    pub reply_sequence: u32,
    pub error: NdmpError,
}

impl Header {
    pub fn request(message: MessageCode) -> Self {
        Header {
            sequence: 0,
            time_stamp: 0,
            message_type: MessageType::Request,
            message,
            reply_sequence: 0,
            error: NdmpError::NoErr,
        }
    }
}

/*
 * Request payloads
 */

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOpenRequest {
    pub protocol_version: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthData {
    None,
    Text {
        auth_id: String,
        auth_password: String,
    },
    Md5 {
        auth_id: String,
        auth_digest: [u8; 16],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    None,
    Text,
    Md5,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectClientAuthRequest {
    pub auth_data: AuthData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigGetAuthAttrRequest {
    pub auth_type: AuthType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButypeInfo {
    pub butype_name: String,
    pub default_env: Vec<Pval>,
    pub attrs: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub fs_type: String,
    pub fs_logical_device: String,
    pub fs_physical_device: String,
    pub total_size: ValidU64,
    pub used_size: ValidU64,
    pub avail_size: ValidU64,
    pub fs_status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: String,
    pub device: String,
}

/// Aggregated configuration info, the canonical consolidation of the
/// per-version CONFIG_GET_* message family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub hostname: String,
    pub os_type: String,
    pub os_vers: String,
    pub hostid: String,
    pub butype_info: Vec<ButypeInfo>,
    pub fs_info: Vec<FsInfo>,
    pub tape_info: Vec<DeviceInfo>,
    pub scsi_info: Vec<DeviceInfo>,
    pub conntypes: Vec<AddrType>,
    pub authtypes: Vec<AuthType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiOpenRequest {
    pub device: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeOpenRequest {
    pub device: String,
    pub mode: TapeOpenMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeMtioRequest {
    pub tape_op: MtioOp,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeWriteRequest {
    pub data_out: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeReadRequest {
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStartBackupRequest {
    pub addr: DataAddr,
    pub bu_type: String,
    pub env: Vec<Pval>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStartRecoverRequest {
    pub addr: DataAddr,
    pub bu_type: String,
    pub env: Vec<Pval>,
    pub nlist: Vec<NlistEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataListenRequest {
    pub addr_type: AddrType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConnectRequest {
    pub addr: DataAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoverListenRequest {
    pub mode: MoverMode,
    pub addr_type: AddrType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoverConnectRequest {
    pub mode: MoverMode,
    pub addr: DataAddr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoverSetWindowRequest {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoverReadRequest {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoverSetRecordSizeRequest {
    pub record_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyDataHaltedRequest {
    pub reason: DataHaltReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectedReason {
    Connected,
    Shutdown,
    Refused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConnectedRequest {
    pub reason: ConnectedReason,
    pub protocol_version: u16,
    pub text_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyMoverHaltedRequest {
    pub reason: MoverHaltReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyMoverPausedRequest {
    pub reason: MoverPauseReason,
    pub seek_position: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyDataReadRequest {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Normal,
    Debug,
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessageRequest {
    pub log_type: LogType,
    pub message_id: u32,
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileRequest {
    pub name: String,
    pub error: NdmpError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhAddFileRequest {
    pub files: Vec<FhFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhAddDirRequest {
    pub dirs: Vec<FhDir>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhAddNodeRequest {
    pub nodes: Vec<FhNode>,
}

/// Canonical request bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    ConnectOpen(ConnectOpenRequest),
    ConnectClientAuth(ConnectClientAuthRequest),
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
    DataStartBackup(DataStartBackupRequest),
    DataStartRecover(DataStartRecoverRequest),
    DataStartRecoverFilehist(DataStartRecoverRequest),
    DataAbort,
    DataGetEnv,
    DataStop,
    DataListen(DataListenRequest),
    DataConnect(DataConnectRequest),

    MoverGetState,
    MoverListen(MoverListenRequest),
    MoverConnect(MoverConnectRequest),
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

    LogMessage(LogMessageRequest),
    LogFile(LogFileRequest),

    FhAddFile(FhAddFileRequest),
    FhAddDir(FhAddDirRequest),
    FhAddNode(FhAddNodeRequest),
}

impl RequestBody {
    pub fn code(&self) -> MessageCode {
        use RequestBody::*;
        match self {
            ConnectOpen(_) => MessageCode::ConnectOpen,
            ConnectClientAuth(_) => MessageCode::ConnectClientAuth,
            ConnectClose => MessageCode::ConnectClose,
            ConnectServerAuth => MessageCode::ConnectServerAuth,
            ConfigGetInfo => MessageCode::ConfigGetInfo,
            ConfigGetAuthAttr(_) => MessageCode::ConfigGetAuthAttr,
            ScsiOpen(_) => MessageCode::ScsiOpen,
            ScsiClose => MessageCode::ScsiClose,
            ScsiGetState => MessageCode::ScsiGetState,
            ScsiResetDevice => MessageCode::ScsiResetDevice,
            ScsiExecuteCdb(_) => MessageCode::ScsiExecuteCdb,
            TapeOpen(_) => MessageCode::TapeOpen,
            TapeClose => MessageCode::TapeClose,
            TapeGetState => MessageCode::TapeGetState,
            TapeMtio(_) => MessageCode::TapeMtio,
            TapeWrite(_) => MessageCode::TapeWrite,
            TapeRead(_) => MessageCode::TapeRead,
            TapeExecuteCdb(_) => MessageCode::TapeExecuteCdb,
            DataGetState => MessageCode::DataGetState,
            DataStartBackup(_) => MessageCode::DataStartBackup,
            DataStartRecover(_) => MessageCode::DataStartRecover,
            DataStartRecoverFilehist(_) => MessageCode::DataStartRecoverFilehist,
            DataAbort => MessageCode::DataAbort,
            DataGetEnv => MessageCode::DataGetEnv,
            DataStop => MessageCode::DataStop,
            DataListen(_) => MessageCode::DataListen,
            DataConnect(_) => MessageCode::DataConnect,
            MoverGetState => MessageCode::MoverGetState,
            MoverListen(_) => MessageCode::MoverListen,
            MoverConnect(_) => MessageCode::MoverConnect,
            MoverContinue => MessageCode::MoverContinue,
            MoverAbort => MessageCode::MoverAbort,
            MoverStop => MessageCode::MoverStop,
            MoverSetWindow(_) => MessageCode::MoverSetWindow,
            MoverRead(_) => MessageCode::MoverRead,
            MoverClose => MessageCode::MoverClose,
            MoverSetRecordSize(_) => MessageCode::MoverSetRecordSize,
            NotifyConnected(_) => MessageCode::NotifyConnected,
            NotifyDataHalted(_) => MessageCode::NotifyDataHalted,
            NotifyMoverHalted(_) => MessageCode::NotifyMoverHalted,
            NotifyMoverPaused(_) => MessageCode::NotifyMoverPaused,
            NotifyDataRead(_) => MessageCode::NotifyDataRead,
            LogMessage(_) => MessageCode::LogMessage,
            LogFile(_) => MessageCode::LogFile,
            FhAddFile(_) => MessageCode::FhAddFile,
            FhAddDir(_) => MessageCode::FhAddDir,
            FhAddNode(_) => MessageCode::FhAddNode,
        }
    }
}

/*
 * Reply payloads
 */

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigGetInfoReply {
    pub error: NdmpError,
    pub config_info: ConfigInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigGetAuthAttrReply {
    pub error: NdmpError,
    pub challenge: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeMtioReply {
    pub error: NdmpError,
    pub resid_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeWriteReply {
    pub error: NdmpError,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeReadReply {
    pub error: NdmpError,
    pub data_in: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataGetEnvReply {
    pub error: NdmpError,
    pub env: Vec<Pval>,
}

/// Reply carrying the image-stream address of a freshly created
/// listen endpoint (DATA_LISTEN / MOVER_LISTEN).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrReply {
    pub error: NdmpError,
    pub data_connection_addr: DataAddr,
}

/// Canonical reply bodies. `Error` serves every reply that carries
/// nothing but its error code; `None` marks unilateral messages.
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
    Addr(AddrReply),
}

impl Default for ReplyBody {
    fn default() -> Self {
        ReplyBody::None
    }
}

impl ReplyBody {
    /// Body-level NDMP error, per protocol convention.
    pub fn body_error(&self) -> NdmpError {
        match self {
            ReplyBody::None => NdmpError::NoErr,
            ReplyBody::Error(error) => *error,
            ReplyBody::ConfigGetInfo(r) => r.error,
            ReplyBody::ConfigGetAuthAttr(r) => r.error,
            ReplyBody::ScsiGetState(r) => r.error,
            ReplyBody::ExecuteCdb(r) => r.error,
            ReplyBody::TapeGetState(r) => r.error,
            ReplyBody::TapeMtio(r) => r.error,
            ReplyBody::TapeWrite(r) => r.error,
            ReplyBody::TapeRead(r) => r.error,
            ReplyBody::DataGetState(r) => r.error,
            ReplyBody::DataGetEnv(r) => r.error,
            ReplyBody::MoverGetState(r) => r.error,
            ReplyBody::Addr(r) => r.error,
        }
    }

    pub fn set_body_error(&mut self, error: NdmpError) {
        match self {
            ReplyBody::None => {}
            ReplyBody::Error(e) => *e = error,
            ReplyBody::ConfigGetInfo(r) => r.error = error,
            ReplyBody::ConfigGetAuthAttr(r) => r.error = error,
            ReplyBody::ScsiGetState(r) => r.error = error,
            ReplyBody::ExecuteCdb(r) => r.error = error,
            ReplyBody::TapeGetState(r) => r.error = error,
            ReplyBody::TapeMtio(r) => r.error = error,
            ReplyBody::TapeWrite(r) => r.error = error,
            ReplyBody::TapeRead(r) => r.error = error,
            ReplyBody::DataGetState(r) => r.error = error,
            ReplyBody::DataGetEnv(r) => r.error = error,
            ReplyBody::MoverGetState(r) => r.error = error,
            ReplyBody::Addr(r) => r.error = error,
        }
    }
}

/*
 * Request/reply transaction buffer
 */

#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub protocol_version: u16,
    pub header: Header,
    pub body: RequestBody,
}

#[derive(Debug, Clone)]
pub struct ReplyEnvelope {
    pub protocol_version: u16,
    pub header: Header,
    /// Reply exists only to satisfy the dispatcher contract, do not
    /// transmit.
    pub no_send: bool,
    pub body: ReplyBody,
}

/// One request/reply transaction in canonical form.
#[derive(Debug, Clone)]
pub struct XaBuf {
    pub request: RequestEnvelope,
    pub reply: ReplyEnvelope,
}

impl XaBuf {
    /// Build a canonical request transaction.
    pub fn request(body: RequestBody) -> Self {
        let code = body.code();
        XaBuf {
            request: RequestEnvelope {
                protocol_version: NDMP9VER,
                header: Header::request(code),
                body,
            },
            reply: ReplyEnvelope {
                protocol_version: NDMP9VER,
                header: Header {
                    sequence: 0,
                    time_stamp: 0,
                    message_type: MessageType::Reply,
                    message: code,
                    reply_sequence: 0,
                    error: NdmpError::NoErr,
                },
                no_send: false,
                body: ReplyBody::None,
            },
        }
    }
}
