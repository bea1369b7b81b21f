//! Protocol-level value types shared by every NDMP agent crate.
//!
//! These are the canonical ("version 9") forms. The canonical version
//! is never transmitted; each connection speaks NDMP version 2, 3 or 4
//! and the dispatcher bridges to these types.

mod error;
pub use error::*;

mod addr;
pub use addr::*;

mod pval;
pub use pval::*;

mod data;
pub use data::*;

mod mover;
pub use mover::*;

mod tape;
pub use tape::*;

mod scsi;
pub use scsi::*;

/// NDMP protocol version numbers.
pub const NDMP2VER: u16 = 2;
pub const NDMP3VER: u16 = 3;
pub const NDMP4VER: u16 = 4;

/// The canonical internal form. Exists only as a translation hub,
/// never on the wire.
pub const NDMP9VER: u16 = 9;

/// Sentinel for "until further notice" window lengths and unknown
/// byte counts.
pub const LENGTH_INFINITY: u64 = u64::MAX;

/// Upper bound for a single tape record.
pub const TAPE_REC_MAX: u32 = 1024 * 1024;

/// Lower bound for a single tape record.
pub const TAPE_REC_MIN: u32 = 1;

pub fn ok_tape_rec_len(len: u32) -> bool {
    (TAPE_REC_MIN..=TAPE_REC_MAX).contains(&len)
}

/// Validity-tagged counter as carried in get-state replies.
///
/// NDMP transmits these as a (valid, value) pair; `None` maps to
/// invalid on the wire.
pub type ValidU32 = Option<u32>;
pub type ValidU64 = Option<u64>;
