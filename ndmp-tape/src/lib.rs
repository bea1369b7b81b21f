//! Tape and media-changer support for the NDMP agents.
//!
//! The TAPE agent drives a [`TapeDevice`]; production embedders
//! provide one backed by a real drive, while the file-backed
//! [`TapeSimulator`] serves tests and development. The SCSI Media
//! Changer (SMC) module builds and decodes the handful of CDBs the
//! CONTROL agent needs to run a robot through `SCSI_EXECUTE_CDB`.

use ndmp_api_types::{MtioOp, NdmpResult};

mod simulator;
pub use simulator::*;

pub mod smc;

mod changer_sim;
pub use changer_sim::*;

/// Position and health of an open tape drive.
///
/// `blockno` counts records from the last filemark, `file_num` counts
/// filemarks from the beginning of tape. `block_size == 0` means the
/// drive is in variable block mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct TapePosition {
    pub file_num: u32,
    pub blockno: u32,
    pub block_size: u32,
    pub soft_errors: u32,
    pub total_space: Option<u64>,
    pub space_remain: Option<u64>,
}

/// Operating-system facade for one open tape drive.
///
/// All methods map failures onto NDMP error codes so the TAPE agent
/// can report them without translation. A zero-length read or write
/// is a successful no-op; callers need not special-case it.
pub trait TapeDevice {
    /// Tape positioning. Returns the residual count for operations
    /// that could not be completed (`Eof` with a residual for FSR/FSF
    /// hitting a filemark or end of data).
    fn mtio(&mut self, op: MtioOp, count: u32) -> NdmpResult<u32>;

    /// Read one record. `Eof` at a filemark, `Eom` past the last
    /// record of the medium.
    fn read(&mut self, buf: &mut [u8]) -> NdmpResult<u32>;

    /// Write one record. `Eom` when the medium is full.
    fn write(&mut self, buf: &[u8]) -> NdmpResult<u32>;

    /// Write a filemark and flush.
    fn write_filemark(&mut self) -> NdmpResult<()>;

    /// Current position snapshot.
    fn position(&mut self) -> TapePosition;

    /// Flush pending state and release the drive.
    fn close(&mut self) -> NdmpResult<()>;
}

/// Factory signature the session uses to open tape drives.
///
/// `will_write` mirrors the NDMP open mode; factories may refuse
/// write opens of protected media with `WriteProtect`.
pub type TapeDeviceOpen =
    Box<dyn Fn(&str, bool) -> NdmpResult<Box<dyn TapeDevice>> + Send>;
