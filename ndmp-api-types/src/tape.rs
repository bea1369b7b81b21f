use serde::{Deserialize, Serialize};

use crate::{NdmpError, ValidU32, ValidU64};

/// How the tape drive was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapeOpenMode {
    Read,
    Rdwr,
    Raw,
}

impl Default for TapeOpenMode {
    fn default() -> Self {
        TapeOpenMode::Read
    }
}

impl TapeOpenMode {
    pub fn is_writable(self) -> bool {
        matches!(self, TapeOpenMode::Rdwr | TapeOpenMode::Raw)
    }
}

/// Tape drive state as seen by the protocol.
///
/// `Mover` means the MOVER currently owns the drive; ordinary tape
/// operations are rejected with ILLEGAL_STATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapeState {
    Idle,
    Open,
    Mover,
}

impl Default for TapeState {
    fn default() -> Self {
        TapeState::Idle
    }
}

/// Magnetic tape positioning operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MtioOp {
    /// Forward space file
    Fsf,
    /// Backward space file
    Bsf,
    /// Forward space record
    Fsr,
    /// Backward space record
    Bsr,
    /// Rewind
    Rew,
    /// Rewind and eject (go offline)
    Off,
    /// Write filemark
    Eof,
}

/// `TAPE_GET_STATE` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeGetStateReply {
    pub error: NdmpError,
    pub state: TapeState,
    pub open_mode: TapeOpenMode,
    pub flags: u32,
    pub file_num: ValidU32,
    pub soft_errors: ValidU32,
    pub block_size: ValidU32,
    pub blockno: ValidU32,
    pub total_space: ValidU64,
    pub space_remain: ValidU64,
}
