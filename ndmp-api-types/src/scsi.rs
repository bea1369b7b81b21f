use serde::{Deserialize, Serialize};

use crate::{NdmpError, ValidU32};

/// `SCSI_GET_STATE` reply.
///
/// Target coordinates are invalid while the pass-through device is
/// closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiGetStateReply {
    pub error: NdmpError,
    pub target_controller: ValidU32,
    pub target_id: ValidU32,
    pub target_lun: ValidU32,
}

/// Direction of the data phase of a pass-through CDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CdbDataDir {
    None,
    In,
    Out,
}

impl Default for CdbDataDir {
    fn default() -> Self {
        CdbDataDir::None
    }
}

/// `SCSI_EXECUTE_CDB` / `TAPE_EXECUTE_CDB` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteCdbRequest {
    pub data_dir: CdbDataDir,
    pub timeout: u32,
    pub datain_len: u32,
    pub cdb: Vec<u8>,
    pub dataout: Vec<u8>,
}

/// `SCSI_EXECUTE_CDB` / `TAPE_EXECUTE_CDB` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteCdbReply {
    pub error: NdmpError,
    pub status: u8,
    pub dataout_len: u32,
    pub datain: Vec<u8>,
    pub ext_sense: Vec<u8>,
}
