//! Compact agent self-test series.
//!
//! Each series drives the target agent through its state machine and
//! boundary behaviors with pass/fail accounting. These are reduced
//! check sequences, not exhaustive conformance matrices.

use anyhow::{bail, Error};

use ndmp_api_types::*;

use crate::session::Session;

use super::{calls, conn, media, robot};

struct TestTally {
    phase: &'static str,
    n_pass: i32,
    n_fail: i32,
}

impl TestTally {
    fn new(phase: &'static str) -> Self {
        log::info!("Test phase: {}", phase);
        TestTally {
            phase,
            n_pass: 0,
            n_fail: 0,
        }
    }

    fn check(&mut self, what: &str, ok: bool) {
        if ok {
            self.n_pass += 1;
            log::debug!("  pass: {}", what);
        } else {
            self.n_fail += 1;
            log::error!("  FAIL: {}", what);
        }
    }

    fn finish(self) -> Result<(), Error> {
        log::info!(
            "Test phase {} done: {} pass, {} fail",
            self.phase,
            self.n_pass,
            self.n_fail
        );
        if self.n_fail > 0 {
            bail!("{}: {} step(s) failed", self.phase, self.n_fail);
        }
        Ok(())
    }
}

/// TEST_TAPE: open modes, positioning, record boundaries.
pub fn op_test_tape(sess: &mut Session) -> Result<(), Error> {
    {
        let ca = super::ca_mut(sess)?;
        ca.tape_mode = TapeOpenMode::Rdwr;
        ca.is_label_op = true;
    }
    robot::op_robot_startup(sess, false)?;
    conn::connect_tape_agent(sess)?;
    super::ca_mut(sess)?.cur_media_ix = 1;
    media::media_load_current(sess)?;

    let mut tally = TestTally::new("TAPE");

    // zero length I/O is a no-op
    tally.check("tape_write len=0", calls::tape_write(sess, &[]).is_ok());
    tally.check("tape_read len=0", calls::tape_read(sess, 0).is_ok());

    // write two files of distinct records
    tally.check("rewind", calls::tape_mtio(sess, MtioOp::Rew, 1).is_ok());
    let rec_a = vec![0xA5u8; 1024];
    let rec_b = vec![0x5Au8; 2048];
    tally.check("write rec A", calls::tape_write(sess, &rec_a).is_ok());
    tally.check("write filemark", calls::tape_mtio(sess, MtioOp::Eof, 1).is_ok());
    tally.check("write rec B", calls::tape_write(sess, &rec_b).is_ok());

    // read them back with positioning
    tally.check("rewind", calls::tape_mtio(sess, MtioOp::Rew, 1).is_ok());
    match calls::tape_read(sess, 4096) {
        Ok(data) => tally.check("read rec A content", data == rec_a),
        Err(_) => tally.check("read rec A content", false),
    }
    tally.check("fsf to file 1", calls::tape_mtio(sess, MtioOp::Fsf, 1).is_ok());
    match calls::tape_read(sess, 4096) {
        // the filemark comes back as EOF first, the record after
        Ok(data) => tally.check("read rec B content", data == rec_b),
        Err(_) => {
            let again = calls::tape_read(sess, 4096);
            tally.check("read rec B content", again.map(|d| d == rec_b).unwrap_or(false));
        }
    }

    tally.check("rewind", calls::tape_mtio(sess, MtioOp::Rew, 1).is_ok());
    media::media_unload_current(sess)?;
    tally.finish()
}

/// TEST_MOVER: window plumbing over a scratch tape.
pub fn op_test_mover(sess: &mut Session) -> Result<(), Error> {
    {
        let ca = super::ca_mut(sess)?;
        ca.tape_mode = TapeOpenMode::Rdwr;
        ca.mover_mode = MoverMode::Read;
        ca.is_label_op = true;
    }
    robot::op_robot_startup(sess, false)?;
    conn::connect_tape_agent(sess)?;

    {
        let local = sess
            .plumb
            .is_shared(crate::session::PlumbSlot::Data, crate::session::PlumbSlot::Tape);
        super::ca_mut(sess)?.image_addr_type =
            if local { AddrType::Local } else { AddrType::Tcp };
    }

    super::ca_mut(sess)?.cur_media_ix = 1;
    media::media_load_current(sess)?;

    let mut tally = TestTally::new("MOVER");

    tally.check("set record size", calls::mover_set_record_size(sess).is_ok());

    // unaligned window offsets are refused
    let record_size = super::ca_mut(sess)?.job.record_size as u64;
    tally.check(
        "unaligned window refused",
        calls::mover_set_window(sess, record_size / 2, LENGTH_INFINITY).is_err(),
    );
    tally.check(
        "aligned window",
        calls::mover_set_window(sess, 0, LENGTH_INFINITY).is_ok(),
    );

    tally.check("mover state idle", {
        calls::mover_get_state(sess).is_ok()
            && super::ca_mut(sess)?.mover_state.state == MoverState::Idle
    });

    // stop in IDLE is refused (only HALTED may stop)
    tally.check("stop in idle refused", calls::mover_stop(sess).is_err());

    media::media_unload_current(sess)?;
    tally.finish()
}

/// TEST_DATA: config checks against the DATA agent.
pub fn op_test_data(sess: &mut Session) -> Result<(), Error> {
    conn::connect_data_agent(sess)?;

    let mut tally = TestTally::new("DATA");

    tally.check("data state idle", {
        calls::data_get_state(sess).is_ok()
            && super::ca_mut(sess)?.data_state.state == DataState::Idle
    });

    // stop and abort are refused while idle
    tally.check("stop in idle refused", calls::data_stop(sess).is_err());
    tally.check("abort in idle refused", calls::data_abort(sess).is_err());

    // the advertised butype table must carry the job's bu_type
    let bu_type = super::ca_mut(sess)?.job.bu_type.clone();
    let mut xa = crate::msg::XaBuf::request(crate::msg::RequestBody::ConfigGetInfo);
    let found = match sess.call(crate::session::PlumbSlot::Data, &mut xa) {
        crate::conn::CallStatus::Ok => match xa.reply.body {
            crate::msg::ReplyBody::ConfigGetInfo(reply) => reply
                .config_info
                .butype_info
                .iter()
                .any(|bu| bu.butype_name == bu_type),
            _ => false,
        },
        _ => false,
    };
    tally.check("bu_type advertised", found);

    tally.finish()
}
