//! TAPE agent: the tape drive facade plus the MOVER.
//!
//! The MOVER transfers between the tape device and the image stream
//! under a windowed protocol. All state changes flow through the
//! small set of transition functions (`mover_halt`, `mover_pause`,
//! `mover_active`, the pending variants); pauses and halts discovered
//! mid-transfer while buffered bytes remain are deferred until the
//! image stream drains.

use std::collections::VecDeque;

use ndmp_api_types::*;
use ndmp_tape::TapeDevice;

use crate::image_stream::{EndSel, ImageStream, IsConnectStatus};
use crate::notify::{AgentRole, Notice, NoticeKind};

/// Default record size, the traditional tar default.
pub const DEFAULT_RECORD_SIZE: u32 = 20 * 512;

pub struct TapeAgent {
    pub protocol_version: u16,

    pub tape_state: TapeGetStateReply,
    pub device: Option<Box<dyn TapeDevice>>,

    pub mover_state: MoverGetStateReply,
    pub mover_window_first_blockno: u32,
    pub mover_window_end: u64,
    pub mover_want_pos: u64,
    pub mover_notify_pending: bool,

    pending_change: Option<(MoverState, MoverHaltReason, MoverPauseReason)>,

    tape_buffer: Vec<u8>,
    /// Block number currently held in `tape_buffer`, with the byte
    /// count actually read. Mistrusted after every activation.
    tb_blockno: Option<(u32, usize)>,
}

impl TapeAgent {
    pub fn new() -> Self {
        let mut ta = TapeAgent {
            protocol_version: NDMP4VER,
            tape_state: TapeGetStateReply {
                error: NdmpError::DevNotOpen,
                ..Default::default()
            },
            device: None,
            mover_state: MoverGetStateReply::default(),
            mover_window_first_blockno: 0,
            mover_window_end: LENGTH_INFINITY,
            mover_want_pos: 0,
            mover_notify_pending: false,
            pending_change: None,
            tape_buffer: Vec::new(),
            tb_blockno: None,
        };
        ta.init_mover_state();
        ta
    }

    pub fn init_mover_state(&mut self) {
        self.mover_state = MoverGetStateReply {
            state: MoverState::Idle,
            record_size: DEFAULT_RECORD_SIZE,
            window_length: LENGTH_INFINITY,
            ..Default::default()
        };
        self.mover_window_end = LENGTH_INFINITY;
        self.mover_window_first_blockno = 0;
        self.mover_want_pos = 0;
        self.pending_change = None;
        self.tb_blockno = None;
    }

    pub fn tape_is_writable(&self) -> bool {
        self.tape_state.open_mode.is_writable()
    }

    /*
     * Tape device operations
     */

    pub fn tape_open(
        &mut self,
        device: Box<dyn TapeDevice>,
        mode: TapeOpenMode,
    ) -> NdmpResult<()> {
        if self.device.is_some() {
            return Err(NdmpError::DeviceOpened);
        }
        self.device = Some(device);
        self.tape_state.open_mode = mode;
        self.tape_sync_state();
        Ok(())
    }

    pub fn tape_close(&mut self) -> NdmpResult<()> {
        let mut device = self.device.take().ok_or(NdmpError::DevNotOpen)?;
        let rc = device.close();
        self.tape_state = TapeGetStateReply {
            error: NdmpError::DevNotOpen,
            ..Default::default()
        };
        rc
    }

    pub fn tape_sync_state(&mut self) {
        match self.device.as_mut() {
            None => {
                self.tape_state.error = NdmpError::DevNotOpen;
                self.tape_state.state = TapeState::Idle;
                self.tape_state.file_num = None;
                self.tape_state.soft_errors = None;
                self.tape_state.block_size = None;
                self.tape_state.blockno = None;
                self.tape_state.total_space = None;
                self.tape_state.space_remain = None;
            }
            Some(device) => {
                let pos = device.position();
                self.tape_state.error = NdmpError::NoErr;
                self.tape_state.state = if self.mover_state.state == MoverState::Active {
                    TapeState::Mover
                } else {
                    TapeState::Open
                };
                self.tape_state.file_num = Some(pos.file_num);
                self.tape_state.soft_errors = Some(pos.soft_errors);
                self.tape_state.block_size = Some(pos.block_size);
                self.tape_state.blockno = Some(pos.blockno);
                self.tape_state.total_space = pos.total_space;
                self.tape_state.space_remain = pos.space_remain;
            }
        }
    }

    pub fn tape_mtio(&mut self, op: MtioOp, count: u32) -> NdmpResult<u32> {
        let device = self.device.as_mut().ok_or(NdmpError::DevNotOpen)?;
        device.mtio(op, count)
    }

    pub fn tape_write(&mut self, buf: &[u8]) -> NdmpResult<u32> {
        if buf.is_empty() {
            return Ok(0);
        }
        let device = self.device.as_mut().ok_or(NdmpError::DevNotOpen)?;
        device.write(buf)
    }

    pub fn tape_read(&mut self, buf: &mut [u8]) -> NdmpResult<u32> {
        if buf.is_empty() {
            return Ok(0);
        }
        let device = self.device.as_mut().ok_or(NdmpError::DevNotOpen)?;
        device.read(buf)
    }

    /*
     * Mover transition functions
     */

    pub fn mover_listen(&mut self, mode: MoverMode) -> NdmpResult<()> {
        self.mover_state.mode = mode;
        self.mover_state.state = MoverState::Listen;
        self.mover_state.halt_reason = MoverHaltReason::Na;
        self.mover_state.pause_reason = MoverPauseReason::Na;
        Ok(())
    }

    pub fn mover_pause(&mut self, reason: MoverPauseReason) {
        self.mover_state.state = MoverState::Paused;
        self.mover_state.halt_reason = MoverHaltReason::Na;
        self.mover_state.pause_reason = reason;
        self.pending_change = None;
        self.mover_notify_pending = true;
    }

    fn mover_pending(
        &mut self,
        state: MoverState,
        halt_reason: MoverHaltReason,
        pause_reason: MoverPauseReason,
    ) {
        if self.pending_change.is_some() {
            log::error!("mover pending change already set");
        }
        self.pending_change = Some((state, halt_reason, pause_reason));
    }

    fn mover_apply_pending(&mut self) {
        if let Some((state, halt_reason, pause_reason)) = self.pending_change.take() {
            self.mover_state.state = state;
            self.mover_state.halt_reason = halt_reason;
            self.mover_state.pause_reason = pause_reason;
            self.mover_notify_pending = true;
        }
    }

    fn mover_halt_pending(&mut self, halt_reason: MoverHaltReason) {
        self.mover_pending(MoverState::Halted, halt_reason, MoverPauseReason::Na);
    }

    fn mover_pause_pending(&mut self, pause_reason: MoverPauseReason) {
        self.mover_pending(MoverState::Paused, MoverHaltReason::Na, pause_reason);
    }

    pub fn mover_active(&mut self) {
        self.mover_state.state = MoverState::Active;
        self.mover_state.halt_reason = MoverHaltReason::Na;
        self.mover_state.pause_reason = MoverPauseReason::Na;
        self.tb_blockno = None; // always mistrust after activating
    }

    pub fn mover_continue(&mut self) {
        self.mover_active();
    }

    pub fn mover_read(&mut self, offset: u64, length: u64) {
        self.mover_state.seek_position = offset;
        self.mover_state.bytes_left_to_read = length;
        self.mover_want_pos = offset;
    }

    pub fn mover_set_window(&mut self, offset: u64, length: u64, window_end: u64) {
        self.mover_state.window_offset = offset;
        // the spec says to divide, so we divide
        self.mover_state.record_num = offset / self.mover_state.record_size as u64;
        self.mover_state.window_length = length;
        self.mover_window_end = window_end;
        self.mover_window_first_blockno = self.tape_state.blockno.unwrap_or(0);
    }
}

impl Default for TapeAgent {
    fn default() -> Self {
        TapeAgent::new()
    }
}

/*
 * Transitions that touch the image stream
 */

pub fn mover_halt(ta: &mut TapeAgent, is: &mut ImageStream, reason: MoverHaltReason) {
    ta.mover_state.state = MoverState::Halted;
    ta.mover_state.halt_reason = reason;
    ta.mover_state.pause_reason = MoverPauseReason::Na;
    ta.pending_change = None;
    ta.mover_notify_pending = true;
    is.ep_close(EndSel::Tape);
}

pub fn mover_start_active(ta: &mut TapeAgent, is: &mut ImageStream) {
    log::debug!("mover going active");
    let mode = match ta.mover_state.mode {
        MoverMode::Read => crate::image_stream::TransferMode::Read,
        MoverMode::Write => crate::image_stream::TransferMode::Write,
    };
    if let Err(why) = is.ep_start(EndSel::Tape, mode) {
        log::error!("mover start botch: {}", why);
    }
    ta.mover_active();
}

pub fn mover_connect(
    ta: &mut TapeAgent,
    is: &mut ImageStream,
    mode: MoverMode,
) -> NdmpResult<()> {
    ta.mover_state.mode = mode;
    mover_start_active(ta, is);
    Ok(())
}

pub fn mover_abort(ta: &mut TapeAgent, is: &mut ImageStream) {
    mover_halt(ta, is, MoverHaltReason::Aborted);
}

pub fn mover_close(ta: &mut TapeAgent, is: &mut ImageStream) {
    if ta.mover_state.state != MoverState::Halted {
        mover_halt(ta, is, MoverHaltReason::ConnectClosed);
    }
}

pub fn mover_stop(ta: &mut TapeAgent) {
    ta.init_mover_state();
}

/*
 * Quantum -- get a bit of work done
 */

pub fn quantum(
    ta: &mut TapeAgent,
    is: &mut ImageStream,
    notices: &mut VecDeque<Notice>,
) -> bool {
    let mut did_something = false;

    match ta.mover_state.state {
        MoverState::Idle | MoverState::Paused | MoverState::Halted => {}

        MoverState::Listen => match is.tape_ep.connect_status {
            IsConnectStatus::Listen => {}
            IsConnectStatus::Accepted => {
                mover_start_active(ta, is);
                did_something = true;
            }
            _ => {
                mover_halt(ta, is, MoverHaltReason::ConnectError);
                did_something = true;
            }
        },

        MoverState::Active => {
            did_something = match ta.mover_state.mode {
                MoverMode::Read => read_quantum(ta, is),
                MoverMode::Write => write_quantum(ta, is),
            };
        }
    }

    send_notice(ta, notices);

    did_something
}

/// MOVER_MODE_READ: drain the image stream onto tape, one record per
/// pass, as many passes as the buffered data allows.
fn read_quantum(ta: &mut TapeAgent, is: &mut ImageStream) -> bool {
    let count = ta.mover_state.record_size as usize;
    let mut did_something = false;

    loop {
        let mut n_ready = is.chan.n_ready();
        if is.chan.eof {
            if n_ready == 0 {
                let reason = if is.chan.error {
                    MoverHaltReason::ConnectError
                } else {
                    MoverHaltReason::ConnectClosed
                };
                mover_halt(ta, is, reason);
                return true;
            }
            if n_ready < count {
                // pad the final partial record with zeros
                let pad = vec![0u8; count - n_ready];
                is.chan.put(&pad);
                n_ready = is.chan.n_ready();
            }
        }

        if n_ready < count {
            return did_something; // blocked
        }

        if ta.mover_want_pos >= ta.mover_window_end {
            ta.mover_pause(MoverPauseReason::Eow);
            return true;
        }

        let record = &is.chan.peek()[..count];
        match ta
            .device
            .as_mut()
            .map(|device| device.write(record))
            .unwrap_or(Err(NdmpError::DevNotOpen))
        {
            Ok(done_count) => {
                if done_count as usize != count {
                    log::error!("short tape write ({} of {})", done_count, count);
                }
                ta.mover_state.bytes_moved += count as u64;
                ta.mover_want_pos += count as u64;
                ta.mover_state.record_num =
                    ta.mover_want_pos / ta.mover_state.record_size as u64;
                is.chan.consume(count);
                did_something = true;
                // write as much to tape as possible
            }
            Err(NdmpError::Eom) => {
                ta.mover_pause(MoverPauseReason::Eom);
                return true;
            }
            Err(_) => {
                mover_halt(ta, is, MoverHaltReason::MediaError);
                return true;
            }
        }
    }
}

/// MOVER_MODE_WRITE: feed the image stream from tape, aligning the
/// drive to the wanted block and honoring the MOVER_READ budget.
fn write_quantum(ta: &mut TapeAgent, is: &mut ImageStream) -> bool {
    let record_size = ta.mover_state.record_size as u64;
    let mut did_something = false;

    loop {
        let n_avail = is.chan.n_avail_record(record_size as usize) as u64;
        if n_avail < record_size {
            return did_something; // allow to drain
        }

        if ta.pending_change.is_some() {
            if is.chan.n_ready() > 0 {
                return did_something; // allow to drain
            }
            ta.mover_apply_pending();
            return true;
        }

        if ta.mover_state.bytes_left_to_read == 0 {
            // active, but awaiting a MOVER_READ request
            return did_something;
        }
        let mut n_read = n_avail.min(ta.mover_state.bytes_left_to_read);

        if ta.mover_want_pos < ta.mover_state.window_offset
            || ta.mover_want_pos >= ta.mover_window_end
        {
            ta.mover_pause_pending(MoverPauseReason::Seek);
            continue;
        }

        let max_read = ta.mover_window_end - ta.mover_want_pos;
        n_read = n_read.min(max_read);

        let want_window_off = ta.mover_want_pos - ta.mover_state.window_offset;

        // When the drive is in variable block mode the mover record
        // size defines the tape positioning unit.
        let block_size = ta.tape_state.block_size.unwrap_or(0) as u64;
        let unit = if block_size == 0 { record_size } else { block_size };

        let want_blockno = ta.mover_window_first_blockno + (want_window_off / unit) as u32;

        if ta.tb_blockno.map(|(blockno, _)| blockno) != Some(want_blockno) {
            ta.tape_sync_state();
            let cur_blockno = ta.tape_state.blockno.unwrap_or(0);
            if cur_blockno < want_blockno {
                let xsr_count = want_blockno - cur_blockno;
                log::debug!("MTIO_FSR {}", xsr_count);
                match ta.tape_mtio(MtioOp::Fsr, xsr_count) {
                    Ok(0) => {}
                    Ok(_) => {
                        ta.mover_pause_pending(MoverPauseReason::Eof);
                        continue;
                    }
                    Err(NdmpError::Eof) => {
                        ta.mover_pause_pending(MoverPauseReason::Eof);
                        continue;
                    }
                    Err(_) => {
                        ta.mover_halt_pending(MoverHaltReason::MediaError);
                        continue;
                    }
                }
            } else if cur_blockno > want_blockno {
                let xsr_count = cur_blockno - want_blockno;
                log::debug!("MTIO_BSR {}", xsr_count);
                match ta.tape_mtio(MtioOp::Bsr, xsr_count) {
                    Ok(0) => {}
                    _ => {
                        ta.mover_halt_pending(MoverHaltReason::MediaError);
                        continue;
                    }
                }
            }

            if ta.tape_buffer.len() < record_size as usize {
                ta.tape_buffer.resize(record_size as usize, 0);
            }
            let done_count = {
                let device = match ta.device.as_mut() {
                    Some(device) => device,
                    None => {
                        ta.mover_halt_pending(MoverHaltReason::MediaError);
                        continue;
                    }
                };
                match device.read(&mut ta.tape_buffer[..record_size as usize]) {
                    Ok(n) => n as usize,
                    Err(NdmpError::Eof) | Err(NdmpError::Eom) => {
                        ta.mover_pause_pending(MoverPauseReason::Eof);
                        continue;
                    }
                    Err(_) => {
                        ta.mover_halt_pending(MoverHaltReason::MediaError);
                        continue;
                    }
                }
            };
            did_something = true;
            if done_count == 0 {
                return did_something;
            }
            ta.tb_blockno = Some((want_blockno, done_count));
            // record_size may exceed block_size, so the record number
            // does not necessarily change per block read
            ta.mover_state.record_num = ta.mover_want_pos / record_size;
        }

        let (_, tb_len) = ta.tb_blockno.unwrap_or((want_blockno, 0));
        let record_off = (ta.mover_want_pos % record_size) as usize;
        if record_off >= tb_len {
            // wanted bytes past the end of a short block
            ta.mover_pause_pending(MoverPauseReason::Eof);
            continue;
        }

        let mut n = n_read.min(record_size - record_off as u64) as usize;
        n = n.min(tb_len - record_off);

        is.chan.put(&ta.tape_buffer[record_off..record_off + n]);
        ta.mover_state.bytes_moved += n as u64;
        ta.mover_want_pos += n as u64;
        ta.mover_state.bytes_left_to_read -= n as u64;
        did_something = true;
    }
}

fn send_notice(ta: &mut TapeAgent, notices: &mut VecDeque<Notice>) {
    if !ta.mover_notify_pending {
        return;
    }
    ta.mover_notify_pending = false;

    match ta.mover_state.state {
        MoverState::Halted => {
            debug_assert!(ta.mover_state.halt_reason != MoverHaltReason::Na);
            notices.push_back(Notice::new(
                AgentRole::Tape,
                NoticeKind::MoverHalted(ta.mover_state.halt_reason),
            ));
        }
        MoverState::Paused => {
            debug_assert!(ta.mover_state.pause_reason != MoverPauseReason::Na);
            notices.push_back(Notice::new(
                AgentRole::Tape,
                NoticeKind::MoverPaused {
                    reason: ta.mover_state.pause_reason,
                    seek_position: ta.mover_want_pos,
                },
            ));
        }
        _ => {} // race, already moved on
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mover_read_sets_cursors() {
        let mut ta = TapeAgent::new();
        ta.mover_read(1048576, 65536);
        assert_eq!(ta.mover_state.seek_position, 1048576);
        assert_eq!(ta.mover_state.bytes_left_to_read, 65536);
        assert_eq!(ta.mover_want_pos, 1048576);
    }

    #[test]
    fn test_pause_and_halt_reason_pairing() {
        let mut ta = TapeAgent::new();
        ta.mover_listen(MoverMode::Read).unwrap();
        ta.mover_active();
        assert_eq!(ta.mover_state.halt_reason, MoverHaltReason::Na);
        assert_eq!(ta.mover_state.pause_reason, MoverPauseReason::Na);

        ta.mover_pause(MoverPauseReason::Eom);
        assert_eq!(ta.mover_state.state, MoverState::Paused);
        assert_eq!(ta.mover_state.halt_reason, MoverHaltReason::Na);

        ta.mover_continue();
        assert_eq!(ta.mover_state.state, MoverState::Active);
        assert_eq!(ta.mover_state.pause_reason, MoverPauseReason::Na);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut ta = TapeAgent::new();
        mover_stop(&mut ta);
        assert_eq!(ta.mover_state.state, MoverState::Idle);
        mover_stop(&mut ta);
        assert_eq!(ta.mover_state.state, MoverState::Idle);
        assert_eq!(ta.mover_state.record_size, DEFAULT_RECORD_SIZE);
    }
}
