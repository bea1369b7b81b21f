//! Backup and recovery operations with their monitoring loops.
//!
//! CONTROL polls DATA and MOVER state (densely right after start,
//! ten second intervals thereafter), services MOVER pauses with tape
//! changes or seeks, answers NOTIFY_DATA_READ with MOVER_READ, and
//! classifies the finish as success, ended-questionably or failure.

use anyhow::{bail, Error};

use ndmp_api_types::*;

use crate::session::Session;

use super::{calls, conn, media, robot};

/// Three-way job outcome: 0 success, 1 ended questionably, -1
/// failure.
pub type Finish = i32;

pub fn op_create_backup(sess: &mut Session) -> Result<Finish, Error> {
    {
        let ca = super::ca_mut(sess)?;
        ca.tape_mode = TapeOpenMode::Rdwr;
        ca.mover_mode = MoverMode::Read;
        ca.is_label_op = false;
    }

    backreco_startup(sess)?;

    let rc = match calls::data_start_backup(sess) {
        Ok(()) => match monitor_startup(sess) {
            Ok(()) => monitor_backup(sess),
            Err(err) => Err(err),
        },
        Err(err) => Err(err),
    };

    let finish = match rc {
        Ok(()) => monitor_shutdown(sess),
        Err(err) => {
            let _ = monitor_shutdown(sess);
            Err(err)
        }
    };

    media::media_tattle(sess);
    finish
}

pub fn op_recover_files(sess: &mut Session) -> Result<Finish, Error> {
    {
        let ca = super::ca_mut(sess)?;
        ca.tape_mode = TapeOpenMode::Read;
        ca.mover_mode = MoverMode::Write;
        ca.is_label_op = false;
    }

    backreco_startup(sess)?;

    let rc = match calls::data_start_recover(sess) {
        Ok(()) => match monitor_startup(sess) {
            Ok(()) => monitor_recover(sess),
            Err(err) => Err(err),
        },
        Err(err) => Err(err),
    };

    let mut finish = match rc {
        Ok(()) => monitor_shutdown(sess),
        Err(err) => {
            let _ = monitor_shutdown(sess);
            Err(err)
        }
    };

    if let Ok(0) = finish {
        let ca = super::ca_mut(sess)?;
        let n_nlist = ca.job.nlist_tab.len() as i32;
        if ca.recover_log_file_count > 0 {
            log::info!(
                "LOG_FILE messages: {} OK, {} ERROR, total {} of {}",
                ca.recover_log_file_ok,
                ca.recover_log_file_error,
                ca.recover_log_file_count,
                n_nlist
            );
            if ca.recover_log_file_ok < n_nlist {
                log::warn!(
                    "LOG_FILE messages: WARNING OK({}) < ({})Expected in namelist",
                    ca.recover_log_file_ok,
                    n_nlist
                );
            }
            if ca.recover_log_file_ok < ca.recover_log_file_count {
                finish = Ok(1);
            }
        } else {
            log::info!("DATA did not report any LOG_FILE messages");
        }
    }

    media::media_tattle(sess);
    finish
}

pub fn op_recover_fh(sess: &mut Session) -> Result<Finish, Error> {
    {
        let ca = super::ca_mut(sess)?;
        ca.tape_mode = TapeOpenMode::Read;
        ca.mover_mode = MoverMode::Write;
        ca.is_label_op = false;
    }

    backreco_startup(sess)?;

    let rc = match calls::data_start_recover_filehist(sess) {
        Ok(()) => match monitor_startup(sess) {
            Ok(()) => monitor_recover(sess),
            Err(err) => Err(err),
        },
        Err(err) => Err(err),
    };

    let finish = match rc {
        Ok(()) => monitor_shutdown(sess),
        Err(err) => {
            let _ = monitor_shutdown(sess);
            Err(err)
        }
    };

    media::media_tattle(sess);
    finish
}

/// Connect agents, size the mover, load the first tape and leave the
/// MOVER listening with a window over the first media entry.
pub fn backreco_startup(sess: &mut Session) -> Result<(), Error> {
    robot::op_robot_startup(sess, true)?;

    conn::connect_data_agent(sess)?;
    conn::connect_tape_agent(sess)?;

    // decide LOCAL vs TCP linkage for the image stream
    {
        let local = sess
            .plumb
            .is_shared(crate::session::PlumbSlot::Data, crate::session::PlumbSlot::Tape);
        let ca = super::ca_mut(sess)?;
        ca.image_addr_type = if local { AddrType::Local } else { AddrType::Tcp };
    }

    calls::mover_set_record_size(sess)?;

    media::media_load_first(sess)?;
    media::media_calculate_offsets(sess)?;

    let (swap_connect, tape_version) = {
        let swap = super::ca_mut(sess)?.swap_connect;
        let version = sess
            .plumb
            .get(crate::session::PlumbSlot::Tape)
            .map(|conn| conn.protocol_version)
            .unwrap_or(NDMP9VER);
        (swap, version)
    };
    let v4_order = tape_version == NDMP9VER || tape_version >= NDMP4VER;

    if swap_connect && tape_version >= NDMP3VER {
        let addr_type = super::ca_mut(sess)?.image_addr_type;
        if v4_order {
            media::media_set_window_current(sess)?;
            calls::data_listen(sess, addr_type)?;
        } else {
            calls::data_listen(sess, addr_type)?;
            media::media_set_window_current(sess)?;
        }
        calls::mover_connect(sess)?;
    } else if v4_order {
        media::media_set_window_current(sess)?;
        calls::mover_listen(sess)?;
    } else {
        calls::mover_listen(sess)?;
        media::media_set_window_current(sess)?;
    }

    // let resident agents observe the fresh image-stream state
    sess.quantum(0);

    Ok(())
}

fn data_est(ca: &super::ControlAgent) -> String {
    match ca.data_state.est_bytes_remain {
        Some(est) if est >= 1024 => format!(" left {}KB", est / 1024),
        _ => String::new(),
    }
}

pub fn monitor_get_states(sess: &mut Session) -> Result<(), Error> {
    calls::data_get_state(sess)?;
    calls::mover_get_state(sess)?;
    calls::tape_get_state_no_tattle(sess);
    Ok(())
}

pub fn monitor_backup(sess: &mut Session) -> Result<(), Error> {
    log::debug!("Monitoring backup");

    let mut count = 0;
    while count < 10 {
        count += 1;

        if sess.is_job_cancelled() {
            log::error!("Job was cancelled, cancelling NDMP operation");
            let _ = calls::data_abort(sess);
            let _ = calls::mover_abort(sess);
            bail!("job cancelled");
        }

        mon_wait_for_something(sess, if count <= 2 { 30 } else { 10 });
        monitor_get_states(sess)?;

        let (ds, ms, line, bytes_written) = {
            let ca = super::ca_mut(sess)?;
            let estb = data_est(ca);
            (
                ca.data_state.state,
                ca.mover_state.state,
                format!(
                    "DATA: bytes {}KB{}  MOVER: written {}KB record {}",
                    ca.data_state.bytes_processed / 1024,
                    estb,
                    ca.mover_state.bytes_moved / 1024,
                    ca.mover_state.record_num
                ),
                ca.data_state.bytes_processed,
            )
        };
        log::info!("{}", line);
        super::ca_mut(sess)?.job.bytes_written = bytes_written;

        if ds == DataState::Active && ms == MoverState::Active {
            count = 0;
            continue;
        }

        // Check MOVER for a needed tape change first: even if DATA
        // halted, the MOVER may hold unwritten data.
        if ms == MoverState::Paused {
            let tape_version = sess
                .plumb
                .get(crate::session::PlumbSlot::Tape)
                .map(|conn| conn.protocol_version)
                .unwrap_or(NDMP9VER);
            let (pr, seen_notice) = {
                let ca = super::ca_mut(sess)?;
                (ca.mover_state.pause_reason, ca.pending_notify_mover_paused > 0)
            };
            if !seen_notice {
                continue; // wait for the notice
            }
            super::ca_mut(sess)?.pending_notify_mover_paused = 0;

            log::debug!("Mover paused, reason={:?}", pr);

            // At end of window the pause is EOW (EOF on an NDMPv2
            // wire); EOM happens at end of tape.
            let changeable = matches!(pr, MoverPauseReason::Eom | MoverPauseReason::Eow)
                || (tape_version <= NDMP2VER && pr == MoverPauseReason::Eof);
            if changeable && monitor_load_next(sess).is_ok() {
                continue; // happy
            }

            log::error!("Operation paused w/o remedy, cancelling");
            let _ = calls::mover_abort(sess);
            bail!("mover paused w/o remedy");
        }

        // If DATA has halted, the show is over.
        if ds == DataState::Halted {
            if ms != MoverState::Halted {
                log::debug!("DATA halted, MOVER active");
                // The MOVER might be a heartbeat away from asking
                // for another tape. Give it a chance.
                continue;
            }
            log::info!("Operation done, cleaning up");
            monitor_get_post_backup_env(sess)?;
            return Ok(());
        }

        if ms == MoverState::Halted && ds == DataState::Active {
            log::debug!("MOVER halted, DATA active");
            continue;
        }
    }

    log::error!("Operation monitoring mishandled, cancelling");
    bail!("monitoring mishandled");
}

pub fn monitor_get_post_backup_env(sess: &mut Session) -> Result<(), Error> {
    if let Err(err) = calls::data_get_env(sess) {
        log::error!("fetch post backup env failed: {}", err);
        return Ok(()); // not fatal per se
    }
    let ca = super::ca_mut(sess)?;
    for pv in &ca.job.result_env_tab {
        log::info!("DE {}={}", pv.name, pv.value);
    }
    Ok(())
}

pub fn monitor_recover(sess: &mut Session) -> Result<(), Error> {
    log::debug!("Monitoring recover");

    let mut count = 0;
    while count < 10 {
        count += 1;

        if sess.is_job_cancelled() {
            log::error!("Job was cancelled, cancelling NDMP operation");
            let _ = calls::data_abort(sess);
            let _ = calls::mover_abort(sess);
            bail!("job cancelled");
        }

        let pending_read = {
            let ca = super::ca_mut(sess)?;
            if ca.pending_notify_data_read > 0 {
                ca.pending_notify_data_read = 0;
                Some((ca.last_notify_data_read.offset, ca.last_notify_data_read.length))
            } else {
                None
            }
        };
        if let Some((offset, length)) = pending_read {
            if let Err(err) = calls::mover_read(sess, offset, length) {
                log::error!("data-read failed: {}", err);
                bail!("data-read failed");
            }
            if count < 5 {
                continue;
            }
        }

        mon_wait_for_something(sess, if count <= 2 { 30 } else { 10 });
        monitor_get_states(sess)?;

        let (ds, ms, line, bytes_read) = {
            let ca = super::ca_mut(sess)?;
            let estb = data_est(ca);
            (
                ca.data_state.state,
                ca.mover_state.state,
                format!(
                    "DATA: bytes {}KB{}  MOVER: read {}KB record {}",
                    ca.data_state.bytes_processed / 1024,
                    estb,
                    ca.mover_state.bytes_moved / 1024,
                    ca.mover_state.record_num
                ),
                ca.data_state.bytes_processed,
            )
        };
        log::info!("{}", line);
        super::ca_mut(sess)?.job.bytes_read = bytes_read;

        if ds == DataState::Active && ms == MoverState::Active {
            count = 0;
            continue;
        }

        if ms == MoverState::Paused {
            let (pr, seen_notice, on_last_tape, seek_position) = {
                let ca = super::ca_mut(sess)?;
                (
                    ca.mover_state.pause_reason,
                    ca.pending_notify_mover_paused > 0,
                    ca.cur_media_ix as usize == ca.job.media_tab.n_media(),
                    ca.last_notify_mover_paused.seek_position,
                )
            };
            if !seen_notice {
                continue; // wait for the notice
            }
            super::ca_mut(sess)?.pending_notify_mover_paused = 0;

            log::debug!("Mover paused, reason={:?}", pr);

            if matches!(pr, MoverPauseReason::Eof | MoverPauseReason::Seek) && on_last_tape {
                // Last tape consumed. DATA may be just shy of done
                // but there is no way to tell; close the image
                // stream from the TAPE side to indicate EOF.
                log::info!("End of tapes");
                let _ = calls::mover_close(sess);
                continue;
            }

            let handled = match pr {
                MoverPauseReason::Eom | MoverPauseReason::Eof => {
                    monitor_load_next(sess).is_ok()
                }
                MoverPauseReason::Seek => monitor_seek_tape(sess, seek_position).is_ok(),
                _ => false,
            };
            if handled {
                continue; // happy
            }

            log::error!("Operation paused w/o remedy, cancelling");
            let _ = calls::mover_abort(sess);
            bail!("mover paused w/o remedy");
        }

        if ds == DataState::Halted {
            if ms != MoverState::Halted {
                log::debug!("DATA halted, MOVER active");
                // Possibly awaiting a MOVER_READ that will never
                // come; the design has no state for that, so guess.
                if count > 1 {
                    let _ = calls::mover_close(sess);
                }
                continue;
            }
            log::info!("Operation done, cleaning up");
            return Ok(());
        }
    }

    log::error!("Operation monitoring mishandled, cancelling");
    bail!("monitoring mishandled");
}

pub fn monitor_startup(sess: &mut Session) -> Result<(), Error> {
    log::debug!("Waiting for operation to start");

    for _ in 0..10 {
        monitor_get_states(sess)?;

        let (ds, ms) = {
            let ca = super::ca_mut(sess)?;
            (ca.data_state.state, ca.mover_state.state)
        };

        if ds == DataState::Active && ms == MoverState::Active {
            log::info!("Operation started");
            return Ok(());
        }
        if ds == DataState::Halted && ms == MoverState::Halted {
            // operation finished immediately
            return Ok(());
        }
        if ds != DataState::Idle && ms != MoverState::Idle && ms != MoverState::Listen {
            log::info!("Operation started in unusual fashion");
            return Ok(());
        }

        mon_wait_for_something(sess, 2);
    }

    log::error!("Operation failed to start");
    bail!("operation failed to start")
}

/// Just make sure things get finished.
pub fn monitor_shutdown(sess: &mut Session) -> Result<Finish, Error> {
    log::debug!("Waiting for operation to halt");

    let mut count = 0;
    while count < 10 {
        count += 1;
        mon_wait_for_something(sess, 2);
        monitor_get_states(sess)?;

        let (ds, ms) = {
            let ca = super::ca_mut(sess)?;
            (ca.data_state.state, ca.mover_state.state)
        };
        if ds == DataState::Halted && ms == MoverState::Halted {
            break;
        }
        if count > 2 {
            if ds != DataState::Halted {
                let _ = calls::data_abort(sess);
            }
            if ms != MoverState::Halted {
                let _ = calls::mover_abort(sess);
            }
        }
    }

    if super::ca_mut(sess)?.tape_state.error.is_ok() {
        monitor_unload_last_tape(sess)?;
    }

    if count >= 10 {
        log::error!("Operation did not halt, something wrong");
    }

    log::info!("Operation halted, stopping");

    let (ds, ms, dhr, mhr) = {
        let ca = super::ca_mut(sess)?;
        (
            ca.data_state.state,
            ca.mover_state.state,
            ca.data_state.halt_reason,
            ca.mover_state.halt_reason,
        )
    };

    let finish: Finish = if ds == DataState::Halted && ms == MoverState::Halted {
        if dhr == DataHaltReason::Successful && mhr == MoverHaltReason::ConnectClosed {
            log::info!("Operation ended OKAY");
            0
        } else {
            log::warn!("Operation ended questionably");
            1
        }
    } else {
        log::error!("Operation ended in failure");
        -1
    };

    let _ = calls::data_stop(sess);
    let _ = calls::mover_stop(sess);

    for _ in 0..10 {
        monitor_get_states(sess)?;
        let (ds, ms) = {
            let ca = super::ca_mut(sess)?;
            (ca.data_state.state, ca.mover_state.state)
        };
        if ds == DataState::Idle && ms == MoverState::Idle {
            conn::connect_close(sess);
            return Ok(finish);
        }
        mon_wait_for_something(sess, 1);
    }

    log::error!("Operation did not stop, something wrong");
    bail!("operation did not stop")
}

/// Service an EOM/EOW pause: capture the window, write filemarks,
/// change tapes, re-window, continue.
pub fn monitor_load_next(sess: &mut Session) -> Result<(), Error> {
    log::info!("Operation requires next tape");

    media::media_capture_mover_window(sess)?;
    media::media_calculate_offsets(sess)?;

    {
        let ca = super::ca_mut(sess)?;
        if ca.tape_mode == TapeOpenMode::Rdwr {
            if ca.mover_state.pause_reason != MoverPauseReason::Eom {
                media::media_write_filemarks(sess)?;
            } else {
                log::info!("At EOM, not writing filemarks");
            }
        }
    }

    media::media_unload_current(sess)?;
    media::media_load_next(sess)?;
    media::media_set_window_current(sess)?;
    calls::mover_continue(sess)?;

    log::info!("Operation resuming");
    Ok(())
}

/// Service a SEEK pause during recovery: load the tape whose window
/// contains the position.
pub fn monitor_seek_tape(sess: &mut Session, pos: u64) -> Result<(), Error> {
    log::info!("Operation requires a different tape");

    media::media_calculate_offsets(sess)?;
    media::media_unload_current(sess)?;
    media::media_load_seek(sess, pos)?;
    media::media_set_window_current(sess)?;
    calls::mover_continue(sess)?;

    log::info!("Operation resuming");
    Ok(())
}

pub fn monitor_unload_last_tape(sess: &mut Session) -> Result<(), Error> {
    if !super::ca_mut(sess)?.media_is_loaded {
        return Ok(());
    }

    media::media_capture_mover_window(sess)?;
    media::media_calculate_offsets(sess)?;

    if super::ca_mut(sess)?.tape_mode == TapeOpenMode::Rdwr {
        media::media_write_filemarks(sess)?;
    }

    media::media_unload_current(sess)
}

/// Run session quanta until a notification lands or the delay
/// expires.
pub fn mon_wait_for_something(sess: &mut Session, max_delay_secs: u64) {
    log::trace!("mon_wait_for_something() entered");
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(max_delay_secs);

    loop {
        let now = std::time::Instant::now();
        if now >= deadline {
            break;
        }
        let delta = (deadline - now).as_millis() as i32;

        let notices = {
            let ca = match sess.control.as_deref_mut() {
                Some(ca) => ca,
                None => break,
            };
            let mut notices = 0;
            if ca.pending_notify_data_read > 0 {
                notices += 1; // leave visible
            }
            if ca.pending_notify_data_halted > 0 {
                ca.pending_notify_data_halted = 0; // just a wake-up
                notices += 1;
            }
            if ca.pending_notify_mover_paused > 0 {
                notices += 1; // leave visible
            }
            if ca.pending_notify_mover_halted > 0 {
                ca.pending_notify_mover_halted = 0; // just a wake-up
                notices += 1;
            }
            notices
        };

        sess.quantum(if notices > 0 { 0 } else { delta.min(1000) });

        if notices > 0 {
            break;
        }
    }
    log::trace!("mon_wait_for_something() happened");
}
