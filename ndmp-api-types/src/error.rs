use serde::{Deserialize, Serialize};

/// NDMP reply error codes (canonical numbering).
///
/// Carried both in message headers and in reply bodies. The numeric
/// values follow the published protocol so version bridging is a
/// no-op for this type.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum NdmpError {
    #[error("NDMP_NO_ERR")]
    NoErr = 0,
    #[error("NDMP_NOT_SUPPORTED_ERR")]
    NotSupported = 1,
    #[error("NDMP_DEVICE_BUSY_ERR")]
    DeviceBusy = 2,
    #[error("NDMP_DEVICE_OPENED_ERR")]
    DeviceOpened = 3,
    #[error("NDMP_NOT_AUTHORIZED_ERR")]
    NotAuthorized = 4,
    #[error("NDMP_PERMISSION_ERR")]
    Permission = 5,
    #[error("NDMP_DEV_NOT_OPEN_ERR")]
    DevNotOpen = 6,
    #[error("NDMP_IO_ERR")]
    Io = 7,
    #[error("NDMP_TIMEOUT_ERR")]
    Timeout = 8,
    #[error("NDMP_ILLEGAL_ARGS_ERR")]
    IllegalArgs = 9,
    #[error("NDMP_NO_TAPE_LOADED_ERR")]
    NoTapeLoaded = 10,
    #[error("NDMP_WRITE_PROTECT_ERR")]
    WriteProtect = 11,
    #[error("NDMP_EOF_ERR")]
    Eof = 12,
    #[error("NDMP_EOM_ERR")]
    Eom = 13,
    #[error("NDMP_FILE_NOT_FOUND_ERR")]
    FileNotFound = 14,
    #[error("NDMP_BAD_FILE_ERR")]
    BadFile = 15,
    #[error("NDMP_NO_DEVICE_ERR")]
    NoDevice = 16,
    #[error("NDMP_NO_BUS_ERR")]
    NoBus = 17,
    #[error("NDMP_XDR_DECODE_ERR")]
    XdrDecode = 18,
    #[error("NDMP_ILLEGAL_STATE_ERR")]
    IllegalState = 19,
    #[error("NDMP_UNDEFINED_ERR")]
    Undefined = 20,
    #[error("NDMP_XDR_ENCODE_ERR")]
    XdrEncode = 21,
    #[error("NDMP_NO_MEM_ERR")]
    NoMem = 22,
    #[error("NDMP_CONNECT_ERR")]
    Connect = 23,
    #[error("NDMP_SEQUENCE_NUM_ERR")]
    SequenceNum = 24,
    #[error("NDMP_READ_IN_PROGRESS_ERR")]
    ReadInProgress = 25,
    #[error("NDMP_PRECONDITION_ERR")]
    Precondition = 26,
    #[error("NDMP_CLASS_NOT_SUPPORTED_ERR")]
    ClassNotSupported = 27,
    #[error("NDMP_VERSION_NOT_SUPPORTED_ERR")]
    VersionNotSupported = 28,
}

impl Default for NdmpError {
    fn default() -> Self {
        NdmpError::NoErr
    }
}

impl NdmpError {
    pub fn is_ok(self) -> bool {
        self == NdmpError::NoErr
    }
}

/// Shorthand for fallible protocol operations that report an NDMP
/// error code instead of a host error.
pub type NdmpResult<T> = Result<T, NdmpError>;
