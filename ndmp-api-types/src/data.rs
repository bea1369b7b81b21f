use serde::{Deserialize, Serialize};

use crate::{DataAddr, NdmpError, ValidU64};

/// DATA agent operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOperation {
    NoAction,
    Backup,
    Recover,
    RecoverFilehist,
}

impl Default for DataOperation {
    fn default() -> Self {
        DataOperation::NoAction
    }
}

/// DATA agent state.
///
/// Legal transitions: IDLE → (LISTEN → CONNECTED) | CONNECTED →
/// ACTIVE → HALTED → IDLE (via DATA_STOP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataState {
    Idle,
    Active,
    Halted,
    Listen,
    Connected,
}

impl Default for DataState {
    fn default() -> Self {
        DataState::Idle
    }
}

/// Why a DATA agent halted. `Na` iff the state is not HALTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataHaltReason {
    Na,
    Successful,
    Aborted,
    InternalError,
    ConnectError,
}

impl Default for DataHaltReason {
    fn default() -> Self {
        DataHaltReason::Na
    }
}

/// `DATA_GET_STATE` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataGetStateReply {
    pub error: NdmpError,
    pub operation: DataOperation,
    pub state: DataState,
    pub halt_reason: DataHaltReason,
    pub bytes_processed: u64,
    pub est_bytes_remain: ValidU64,
    pub est_time_remain: ValidU64,
    pub data_connection_addr: DataAddr,
    pub read_offset: u64,
    pub read_length: u64,
}
