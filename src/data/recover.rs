//! Recovery access-method machine.
//!
//! Drives the name list through
//! `START -> PASS_THRU | CHOOSE_NLENT -> ACQUIRE -> DISPOSE ->
//! FINISH_NLENT -> (next) | ALL_DONE`. Sequential access simply
//! passes the whole stream to the formatter; direct access issues
//! NOTIFY_DATA_READ per entry. When an entry's offset is not aligned
//! to the fetch grain the machine degrades to semi-direct: it
//! requests the containing run and discards the prefix.

use ndmp_api_types::{NdmpError, LENGTH_INFINITY};

/// Per-entry fetch run for direct access recovery.
pub const RECO_FETCH_LEN: u64 = 64 * 1024;

/// Byte grain direct reads are aligned to.
pub const RECO_ALIGN: u64 = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverAccess {
    Sequential,
    Direct,
    SemiDirect,
    SemiDirectPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverDisposition {
    Pass,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverPhase {
    Start,
    PassThru,
    ChooseNlent,
    Acquire,
    Dispose,
    FinishNlent,
    AllDone,
}

/// What the machine wants from its driver next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverStep {
    /// Issue NOTIFY_DATA_READ(offset, length)
    SendDataRead { offset: u64, length: u64 },
    /// Discard up to this many stream bytes
    Discard(u64),
    /// Pass up to this many stream bytes to the formatter
    Pass(u64),
    /// Everything recovered, wind down
    Done,
    /// Nothing to do until more bytes arrive
    Blocked,
}

pub struct RecoverState {
    pub phase: RecoverPhase,
    pub access: RecoverAccess,
    cur_entry: usize,
    n_entries: usize,
    discard_resid: u64,
    pass_resid: u64,
    read_sent: bool,
}

impl RecoverState {
    /// `fh_hints` carries each name list entry's fh_info, if valid.
    pub fn new(fh_hints: &[Option<u64>]) -> Self {
        let access = if !fh_hints.is_empty() && fh_hints.iter().all(|hint| hint.is_some()) {
            RecoverAccess::Direct
        } else {
            RecoverAccess::Sequential
        };
        RecoverState {
            phase: RecoverPhase::Start,
            access,
            cur_entry: 0,
            n_entries: fh_hints.len(),
            discard_resid: 0,
            pass_resid: 0,
            read_sent: false,
        }
    }

    pub fn current_entry(&self) -> usize {
        self.cur_entry
    }

    pub fn is_done(&self) -> bool {
        self.phase == RecoverPhase::AllDone
    }

    /// Advance the machine. `fh_hint` is the current entry's fh_info;
    /// `discarded` and `passed` report how many stream bytes the
    /// driver moved since the last step.
    pub fn step(
        &mut self,
        fh_hint: Option<u64>,
        discarded: u64,
        passed: u64,
    ) -> Result<RecoverStep, NdmpError> {
        self.discard_resid = self.discard_resid.saturating_sub(discarded);
        if self.phase != RecoverPhase::PassThru {
            self.pass_resid = self.pass_resid.saturating_sub(passed);
        }
        loop {
            match self.phase {
                RecoverPhase::Start => {
                    if self.access == RecoverAccess::Sequential {
                        self.phase = RecoverPhase::PassThru;
                        if !self.read_sent {
                            self.read_sent = true;
                            return Ok(RecoverStep::SendDataRead {
                                offset: 0,
                                length: LENGTH_INFINITY,
                            });
                        }
                    } else {
                        self.phase = RecoverPhase::ChooseNlent;
                    }
                }

                RecoverPhase::PassThru => {
                    return Ok(RecoverStep::Pass(LENGTH_INFINITY));
                }

                RecoverPhase::ChooseNlent => {
                    if self.cur_entry >= self.n_entries {
                        self.phase = RecoverPhase::AllDone;
                        continue;
                    }
                    let offset = fh_hint.ok_or(NdmpError::IllegalArgs)?;
                    let aligned = offset - offset % RECO_ALIGN;
                    self.discard_resid = offset - aligned;
                    self.pass_resid = RECO_FETCH_LEN;
                    if self.discard_resid > 0 {
                        // the run is wider than the wanted bytes
                        self.access = RecoverAccess::SemiDirectPending;
                    }
                    self.read_sent = false;
                    self.phase = RecoverPhase::Acquire;
                    return Ok(RecoverStep::SendDataRead {
                        offset: aligned,
                        length: self.discard_resid + self.pass_resid,
                    });
                }

                RecoverPhase::Acquire => {
                    self.phase = RecoverPhase::Dispose;
                }

                RecoverPhase::Dispose => {
                    if self.access == RecoverAccess::SemiDirectPending {
                        self.access = RecoverAccess::SemiDirect;
                    }
                    if self.discard_resid > 0 {
                        return Ok(RecoverStep::Discard(self.discard_resid));
                    }
                    if self.pass_resid > 0 {
                        return Ok(RecoverStep::Pass(self.pass_resid));
                    }
                    self.phase = RecoverPhase::FinishNlent;
                }

                RecoverPhase::FinishNlent => {
                    self.cur_entry += 1;
                    self.phase = RecoverPhase::ChooseNlent;
                    return Ok(RecoverStep::Blocked); // let the driver fetch the next hint
                }

                RecoverPhase::AllDone => {
                    return Ok(RecoverStep::Done);
                }
            }
        }
    }

    pub fn disposition(&self) -> RecoverDisposition {
        if self.discard_resid > 0 {
            RecoverDisposition::Discard
        } else {
            RecoverDisposition::Pass
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sequential_pass_thru() {
        let mut reco = RecoverState::new(&[None, Some(10)]);
        assert_eq!(reco.access, RecoverAccess::Sequential);

        match reco.step(None, 0, 0).unwrap() {
            RecoverStep::SendDataRead { offset, length } => {
                assert_eq!(offset, 0);
                assert_eq!(length, LENGTH_INFINITY);
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(
            reco.step(None, 0, 0).unwrap(),
            RecoverStep::Pass(LENGTH_INFINITY)
        );
        // pass-thru never exhausts its budget
        assert_eq!(
            reco.step(None, 0, 123456).unwrap(),
            RecoverStep::Pass(LENGTH_INFINITY)
        );
    }

    #[test]
    fn test_direct_access_aligned() {
        let mut reco = RecoverState::new(&[Some(1048576)]);
        assert_eq!(reco.access, RecoverAccess::Direct);

        match reco.step(Some(1048576), 0, 0).unwrap() {
            RecoverStep::SendDataRead { offset, length } => {
                assert_eq!(offset, 1048576);
                assert_eq!(length, RECO_FETCH_LEN);
            }
            other => panic!("unexpected step {:?}", other),
        }

        // pass the whole run, then the entry finishes
        assert_eq!(
            reco.step(Some(1048576), 0, 0).unwrap(),
            RecoverStep::Pass(RECO_FETCH_LEN)
        );
        assert_eq!(
            reco.step(Some(1048576), 0, RECO_FETCH_LEN).unwrap(),
            RecoverStep::Blocked
        );
        assert_eq!(reco.step(None, 0, 0).unwrap(), RecoverStep::Done);
        assert!(reco.is_done());
    }

    #[test]
    fn test_semi_direct_discards_prefix() {
        let offset = 4096 * 3 + 100;
        let mut reco = RecoverState::new(&[Some(offset)]);

        match reco.step(Some(offset), 0, 0).unwrap() {
            RecoverStep::SendDataRead { offset: o, length } => {
                assert_eq!(o, 4096 * 3);
                assert_eq!(length, 100 + RECO_FETCH_LEN);
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(reco.access, RecoverAccess::SemiDirectPending);

        // first 100 bytes are discarded
        assert_eq!(
            reco.step(Some(offset), 0, 0).unwrap(),
            RecoverStep::Discard(100)
        );
        assert_eq!(reco.access, RecoverAccess::SemiDirect);
        assert_eq!(reco.disposition(), RecoverDisposition::Discard);
        assert_eq!(
            reco.step(Some(offset), 100, 0).unwrap(),
            RecoverStep::Pass(RECO_FETCH_LEN)
        );
        assert_eq!(reco.disposition(), RecoverDisposition::Pass);
    }
}
