//! Agent-to-CONTROL notifications.
//!
//! Agents never talk to the control connection directly; they queue
//! notices which the session drains once per quantum, translating
//! each onto the originating agent's connection so version bridging
//! stays correct when CONTROL is remote.

use ndmp_api_types::{
    DataHaltReason, FhDir, FhFile, FhNode, MoverHaltReason, MoverPauseReason, NdmpError,
};

use crate::msg::LogType;

/// Which agent raised a notice; selects the control connection
/// context used for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Data,
    Tape,
    Robot,
}

#[derive(Debug, Clone)]
pub enum NoticeKind {
    DataHalted(DataHaltReason),
    DataRead { offset: u64, length: u64 },
    MoverHalted(MoverHaltReason),
    MoverPaused { reason: MoverPauseReason, seek_position: u64 },
    Log { log_type: LogType, entry: String },
    LogFile { name: String, error: NdmpError },
    FhAddFile(Vec<FhFile>),
    FhAddDir(Vec<FhDir>),
    FhAddNode(Vec<FhNode>),
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub role: AgentRole,
    pub kind: NoticeKind,
}

impl Notice {
    pub fn new(role: AgentRole, kind: NoticeKind) -> Self {
        Notice { role, kind }
    }
}
