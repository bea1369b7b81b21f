use serde::{Deserialize, Serialize};

use crate::{DataAddr, NdmpError};

/// MOVER transfer direction.
///
/// READ moves tape-bound data (the mover reads the image stream),
/// WRITE moves stream-bound data (the mover writes the image stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoverMode {
    Read,
    Write,
}

impl Default for MoverMode {
    fn default() -> Self {
        MoverMode::Read
    }
}

/// MOVER state.
///
/// Legal transitions: IDLE → (LISTEN → ACTIVE) | ACTIVE →
/// (PAUSED ↔ ACTIVE) → HALTED → IDLE (via MOVER_STOP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoverState {
    Idle,
    Listen,
    Active,
    Paused,
    Halted,
}

impl Default for MoverState {
    fn default() -> Self {
        MoverState::Idle
    }
}

/// Why a MOVER paused. `Na` iff the state is not PAUSED.
///
/// `Eow` is an NDMPv3+ refinement; on an NDMPv2 wire it degrades to
/// `Eof`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoverPauseReason {
    Na,
    Eom,
    Eof,
    Seek,
    MediaError,
    Eow,
}

impl Default for MoverPauseReason {
    fn default() -> Self {
        MoverPauseReason::Na
    }
}

/// Why a MOVER halted. `Na` iff the state is not HALTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoverHaltReason {
    Na,
    ConnectClosed,
    Aborted,
    InternalError,
    ConnectError,
    MediaError,
}

impl Default for MoverHaltReason {
    fn default() -> Self {
        MoverHaltReason::Na
    }
}

/// `MOVER_GET_STATE` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoverGetStateReply {
    pub error: NdmpError,
    pub state: MoverState,
    pub mode: MoverMode,
    pub pause_reason: MoverPauseReason,
    pub halt_reason: MoverHaltReason,
    pub record_size: u32,
    pub record_num: u64,
    pub bytes_moved: u64,
    pub seek_position: u64,
    pub bytes_left_to_read: u64,
    pub window_offset: u64,
    pub window_length: u64,
    pub data_connection_addr: DataAddr,
}
