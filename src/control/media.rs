//! Media table and tape lifecycle orchestration.
//!
//! The CONTROL agent works through the job's media table one entry
//! at a time: robot load, open, rewind, label check, filemark
//! spacing, then hands the drive to the MOVER. Result flags record
//! per-entry outcomes so operators can see which tape had what
//! problem.

use anyhow::{bail, format_err, Error};
use bitflags::bitflags;

use ndmp_api_types::*;

use crate::session::Session;

use super::calls;

pub const NDM_MAX_MEDIA: usize = 40;
pub const MEDIA_LABEL_MAX: usize = 63;

/// On-tape label records are exactly this long, `#` filled, with a
/// newline every 64 bytes.
pub const LABEL_RECORD_LEN: usize = 512;

bitflags! {
    #[derive(Default)]
    pub struct MediaFlags: u16 {
        const MEDIA_USED        = 1 << 0;
        const MEDIA_WRITTEN     = 1 << 1;
        const MEDIA_OPEN_ERROR  = 1 << 2;
        const MEDIA_IO_ERROR    = 1 << 3;
        const MEDIA_EOM         = 1 << 4;
        const MEDIA_EOF         = 1 << 5;
        const LABEL_READ        = 1 << 6;
        const LABEL_MISMATCH    = 1 << 7;
        const LABEL_IO_ERROR    = 1 << 8;
        const FMARK_ERROR       = 1 << 9;
        const SLOT_EMPTY        = 1 << 10;
        const SLOT_MISSING      = 1 << 11;
        const SLOT_BAD          = 1 << 12;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Media {
    /// 1-based position in the table.
    pub index: u32,
    pub slot_addr: Option<u16>,
    pub label: Option<String>,
    /// Filemarks to space past after rewind; synthesized when absent.
    pub file_mark_offset: Option<u32>,
    pub n_bytes: Option<u64>,
    /// `n_bytes` was measured by this job rather than given.
    pub nb_determined: bool,
    pub begin_offset: u64,
    pub end_offset: u64,
    pub flags: MediaFlags,
}

impl Media {
    /// One-line rendering for the media tattle.
    pub fn pp(&self) -> String {
        let mut line = String::new();
        match &self.label {
            Some(label) => line.push_str(&format!("label '{}'", label)),
            None => line.push_str("no-label"),
        }
        if let Some(slot) = self.slot_addr {
            line.push_str(&format!(" slot @{}", slot));
        }
        if let Some(fmo) = self.file_mark_offset {
            if fmo > 0 {
                line.push_str(&format!(" fmark {}", fmo));
            }
        }
        match self.n_bytes {
            Some(n) if n != LENGTH_INFINITY => line.push_str(&format!(" bytes {}", n)),
            _ => {}
        }
        for (flag, tag) in [
            (MediaFlags::MEDIA_USED, "used"),
            (MediaFlags::MEDIA_WRITTEN, "written"),
            (MediaFlags::MEDIA_OPEN_ERROR, "open-error"),
            (MediaFlags::MEDIA_IO_ERROR, "io-error"),
            (MediaFlags::MEDIA_EOM, "eom"),
            (MediaFlags::MEDIA_EOF, "eof"),
            (MediaFlags::LABEL_READ, "label-read"),
            (MediaFlags::LABEL_MISMATCH, "label-mismatch"),
            (MediaFlags::LABEL_IO_ERROR, "label-io-error"),
            (MediaFlags::FMARK_ERROR, "fmark-error"),
            (MediaFlags::SLOT_EMPTY, "slot-empty"),
            (MediaFlags::SLOT_MISSING, "slot-missing"),
            (MediaFlags::SLOT_BAD, "slot-bad"),
        ] {
            if self.flags.contains(flag) {
                line.push(' ');
                line.push_str(tag);
            }
        }
        line
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaTable {
    entries: Vec<Media>,
}

impl MediaTable {
    pub fn new() -> Self {
        MediaTable {
            entries: Vec::new(),
        }
    }

    pub fn n_media(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[Media] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [Media] {
        &mut self.entries
    }

    /// Append an entry; `None` when the table is full.
    pub fn store_media(&mut self, slot_addr: Option<u16>) -> Option<usize> {
        if self.entries.len() >= NDM_MAX_MEDIA {
            return None;
        }
        let index = self.entries.len() as u32 + 1;
        self.entries.push(Media {
            index,
            slot_addr,
            ..Default::default()
        });
        Some(self.entries.len() - 1)
    }

    pub fn entry_mut(&mut self, ix: usize) -> Option<&mut Media> {
        self.entries.get_mut(ix)
    }

    pub fn by_index(&self, index: u32) -> Option<&Media> {
        self.entries.iter().find(|me| me.index == index)
    }

    pub fn by_index_mut(&mut self, index: u32) -> Option<&mut Media> {
        self.entries.iter_mut().find(|me| me.index == index)
    }
}

/*
 * Lifecycle: load, verify, unload
 */

fn cur_media_mut(sess: &mut Session) -> Result<&mut Media, Error> {
    let ca = super::ca_mut(sess)?;
    let ix = ca.cur_media_ix;
    ca.job
        .media_tab
        .by_index_mut(ix)
        .ok_or_else(|| format_err!("no media entry #{}", ix))
}

pub fn media_load_first(sess: &mut Session) -> Result<(), Error> {
    if let Some(cbs) = sess.cbs.media {
        if let Some(load_first) = cbs.load_first {
            load_first(sess)?;
        }
    }
    super::ca_mut(sess)?.cur_media_ix = 1;
    media_load_current(sess)
}

pub fn media_load_next(sess: &mut Session) -> Result<(), Error> {
    if let Some(cbs) = sess.cbs.media {
        if let Some(load_next) = cbs.load_next {
            load_next(sess)?;
        }
    }
    let ca = super::ca_mut(sess)?;
    let n_media = ca.job.media_tab.n_media() as u32;
    if ca.cur_media_ix >= n_media {
        bail!("Out of tapes");
    }
    ca.cur_media_ix += 1;
    media_load_current(sess)
}

pub fn media_unload_last(sess: &mut Session) -> Result<(), Error> {
    media_unload_current(sess)
}

pub fn media_change(sess: &mut Session) -> Result<(), Error> {
    media_unload_current(sess)?;
    media_load_next(sess)
}

/// Locate the media entry whose window contains `pos` and load it.
pub fn media_load_seek(sess: &mut Session, pos: u64) -> Result<(), Error> {
    let ca = super::ca_mut(sess)?;
    let index = ca
        .job
        .media_tab
        .entries()
        .iter()
        .find(|me| me.begin_offset <= pos && pos < me.end_offset)
        .map(|me| me.index)
        .ok_or_else(|| format_err!("Seek to unspecified media"))?;
    ca.cur_media_ix = index;
    media_load_current(sess)
}

pub fn media_load_current(sess: &mut Session) -> Result<(), Error> {
    let (have_robot, slot_addr, is_label_op, tape_mode, valid_label) = {
        let ca = super::ca_mut(sess)?;
        let ix = ca.cur_media_ix;
        let me = ca
            .job
            .media_tab
            .by_index(ix)
            .ok_or_else(|| format_err!("no media entry #{}", ix))?;
        (
            ca.job.have_robot,
            me.slot_addr,
            ca.is_label_op,
            ca.tape_mode,
            me.label.clone(),
        )
    };

    if have_robot {
        let slot = slot_addr.ok_or_else(|| format_err!("media missing slot address"))?;
        super::robot::robot_load(sess, slot)?;
    }

    cur_media_mut(sess)?.flags |= MediaFlags::MEDIA_USED;

    if let Err(err) = media_open_tape(sess) {
        cur_media_mut(sess)?.flags |= MediaFlags::MEDIA_OPEN_ERROR;
        if have_robot {
            // best-effort unload back to the slot
            if let Some(slot) = slot_addr {
                let _ = super::robot::robot_unload(sess, slot);
            }
        }
        return Err(err);
    }

    super::ca_mut(sess)?.media_is_loaded = true;

    if let Err(err) = media_mtio_tape(sess, MtioOp::Rew, 1) {
        cur_media_mut(sess)?.flags |= MediaFlags::MEDIA_IO_ERROR;
        media_unload_best_effort(sess)?;
        return Err(err);
    }

    if is_label_op {
        if tape_mode == TapeOpenMode::Rdwr {
            cur_media_mut(sess)?.flags |= MediaFlags::MEDIA_WRITTEN; // most likely
        }
        return Ok(()); // ready to go
    }

    if let Some(label) = valid_label.as_deref() {
        match media_check_label(sess, 'm', label) {
            Ok(()) => {
                cur_media_mut(sess)?.flags |= MediaFlags::LABEL_READ;
            }
            Err(check) => {
                let me = cur_media_mut(sess)?;
                match check {
                    LabelCheck::IoError => me.flags |= MediaFlags::LABEL_IO_ERROR,
                    LabelCheck::Mismatch => {
                        me.flags |= MediaFlags::LABEL_READ | MediaFlags::LABEL_MISMATCH
                    }
                }
                me.flags |= MediaFlags::MEDIA_IO_ERROR;
                media_unload_best_effort(sess)?;
                bail!("label check failed");
            }
        }

        if let Err(err) = media_mtio_tape(sess, MtioOp::Rew, 1) {
            cur_media_mut(sess)?.flags |= MediaFlags::MEDIA_IO_ERROR;
            return Err(err);
        }
    }

    // synthesize the filemark offset when not given
    let count = {
        let has_label = valid_label.is_some();
        let me = cur_media_mut(sess)?;
        if me.file_mark_offset.is_none() {
            me.file_mark_offset = Some(if has_label { 1 } else { 0 });
        }
        me.file_mark_offset.unwrap_or(0)
    };

    if count > 0 {
        if let Err(err) = media_mtio_tape(sess, MtioOp::Fsf, count) {
            cur_media_mut(sess)?.flags |=
                MediaFlags::FMARK_ERROR | MediaFlags::MEDIA_IO_ERROR;
            let _ = media_mtio_tape(sess, MtioOp::Rew, 1);
            media_unload_best_effort(sess)?;
            return Err(err);
        }
    }

    if tape_mode == TapeOpenMode::Rdwr {
        cur_media_mut(sess)?.flags |= MediaFlags::MEDIA_WRITTEN; // most likely
    }

    Ok(())
}

pub fn media_unload_current(sess: &mut Session) -> Result<(), Error> {
    if !super::ca_mut(sess)?.media_is_loaded {
        return Ok(());
    }

    media_mtio_tape(sess, MtioOp::Rew, 1)?;

    if super::ca_mut(sess)?.job.use_eject {
        media_mtio_tape(sess, MtioOp::Off, 1)?;
    }

    media_close_tape(sess)?;

    let (have_robot, slot_addr) = {
        let ca = super::ca_mut(sess)?;
        let slot = ca
            .job
            .media_tab
            .by_index(ca.cur_media_ix)
            .and_then(|me| me.slot_addr);
        (ca.job.have_robot, slot)
    };
    if have_robot {
        if let Some(slot) = slot_addr {
            super::robot::robot_unload(sess, slot)?;
        }
    }

    super::ca_mut(sess)?.media_is_loaded = false;

    if let Some(cbs) = sess.cbs.media {
        if let Some(unload_current) = cbs.unload_current {
            unload_current(sess)?;
        }
    }

    Ok(())
}

pub fn media_unload_best_effort(sess: &mut Session) -> Result<(), Error> {
    if !super::ca_mut(sess)?.media_is_loaded {
        return Ok(());
    }

    let mut errors = 0;
    if media_mtio_tape(sess, MtioOp::Rew, 1).is_err() {
        errors += 1;
    }
    if super::ca_mut(sess)?.job.use_eject && media_mtio_tape(sess, MtioOp::Off, 1).is_err() {
        errors += 1;
    }
    if media_close_tape(sess).is_err() {
        errors += 1;
    }

    let (have_robot, slot_addr) = {
        let ca = super::ca_mut(sess)?;
        let slot = ca
            .job
            .media_tab
            .by_index(ca.cur_media_ix)
            .and_then(|me| me.slot_addr);
        (ca.job.have_robot, slot)
    };
    if have_robot {
        match slot_addr {
            Some(slot) => {
                if super::robot::robot_unload(sess, slot).is_err() {
                    errors += 1;
                }
            }
            None => errors += 1,
        }
    }

    super::ca_mut(sess)?.media_is_loaded = false;

    if errors > 0 {
        bail!("{} error(s) unloading media", errors);
    }
    Ok(())
}

/*
 * Tape device helpers over the control connection
 */

pub fn media_open_tape(sess: &mut Session) -> Result<(), Error> {
    let (device, mode, tape_timeout) = {
        let ca = super::ca_mut(sess)?;
        (
            ca.job.tape_device.clone(),
            ca.tape_mode,
            ca.job.tape_timeout,
        )
    };
    log::info!(
        "Opening tape drive {} {}",
        device,
        if mode == TapeOpenMode::Rdwr {
            "read/write"
        } else {
            "read-only"
        }
    );

    let mut t = 0;
    loop {
        match calls::tape_open(sess, &device, mode) {
            Ok(()) => return Ok(()),
            Err(err) => {
                t += 10;
                if t > tape_timeout {
                    log::error!("failed open tape drive {}", device);
                    return Err(err);
                }
                log::info!("Pausing ten seconds before retry ({}/{})", t, tape_timeout);
                std::thread::sleep(std::time::Duration::from_secs(10));
            }
        }
    }
}

pub fn media_close_tape(sess: &mut Session) -> Result<(), Error> {
    let device = super::ca_mut(sess)?.job.tape_device.clone();
    log::info!("Closing tape drive {}", device);
    let _ = calls::tape_close(sess);
    Ok(())
}

pub fn media_mtio_tape(sess: &mut Session, op: MtioOp, count: u32) -> Result<u32, Error> {
    match op {
        MtioOp::Rew => log::info!("Commanding tape drive to rewind"),
        MtioOp::Off => log::info!("Commanding tape drive to eject (go offline)"),
        _ => log::info!("Commanding tape drive to {:?} {} times", op, count),
    }
    calls::tape_mtio(sess, op, count)
}

pub fn media_write_filemarks(sess: &mut Session) -> Result<(), Error> {
    media_mtio_tape(sess, MtioOp::Eof, 2)?;
    Ok(())
}

/*
 * Labels
 */

/// Label record kind: 'm' tape (media) label, 'V' volume label,
/// '?' unrecognized content.
pub fn media_read_label(sess: &mut Session) -> Result<(char, String), Error> {
    log::info!("Reading label");
    let data = calls::tape_read(sess, LABEL_RECORD_LEN as u32)?;
    let text = String::from_utf8_lossy(&data);

    let kind;
    let rest;
    if let Some(tail) = text.strip_prefix("##ndmjob -m ") {
        kind = 'm';
        rest = tail;
    } else if let Some(tail) = text.strip_prefix("##ndmjob -V ") {
        kind = 'V';
        rest = tail;
    } else {
        return Ok(('?', String::new()));
    }

    let label: String = rest
        .chars()
        .take_while(|&c| c != '\n')
        .take(MEDIA_LABEL_MAX)
        .collect();
    Ok((kind, label))
}

pub fn media_write_label(sess: &mut Session, kind: char, label: &str) -> Result<(), Error> {
    log::info!("Writing tape label '{}' type={}", label, kind);

    let mut buf = vec![b'#'; LABEL_RECORD_LEN];
    for p in (63..LABEL_RECORD_LEN).step_by(64) {
        buf[p] = b'\n';
    }
    let head = format!("##ndmjob -{} {}\n", kind, label);
    let head = head.as_bytes();
    buf[..head.len()].copy_from_slice(head);

    calls::tape_write(sess, &buf)
}

pub enum LabelCheck {
    IoError,
    Mismatch,
}

pub fn media_check_label(
    sess: &mut Session,
    kind: char,
    expect: &str,
) -> Result<(), LabelCheck> {
    log::info!("Checking tape label, expect '{}'", expect);
    match media_read_label(sess) {
        Err(_) => {
            log::error!("Label read error");
            Err(LabelCheck::IoError)
        }
        Ok((got_kind, got_label)) => {
            if got_kind != kind || got_label != expect {
                log::error!(
                    "Label mismatch, expected -{}'{}', got -{}'{}'",
                    kind,
                    expect,
                    got_kind,
                    got_label
                );
                Err(LabelCheck::Mismatch)
            } else {
                Ok(())
            }
        }
    }
}

/*
 * Window and offset bookkeeping
 */

/// Capture the MOVER's progress into the current media entry's byte
/// count.
pub fn media_capture_mover_window(sess: &mut Session) -> Result<(), Error> {
    let ca = super::ca_mut(sess)?;
    let ms = ca.mover_state.state;
    let pr = ca.mover_state.pause_reason;
    let record_num = ca.mover_state.record_num;
    let record_size = ca.job.record_size as u64;
    let last_w_offset = ca.job.last_w_offset;
    let ix = ca.cur_media_ix;

    let me = ca
        .job
        .media_tab
        .by_index_mut(ix)
        .ok_or_else(|| format_err!("no media entry #{}", ix))?;

    match ms {
        MoverState::Paused => match pr {
            MoverPauseReason::Seek | MoverPauseReason::Eow => {} // end of window
            MoverPauseReason::Eom => me.flags |= MediaFlags::MEDIA_EOM, // tape full
            MoverPauseReason::Eof => me.flags |= MediaFlags::MEDIA_EOF,
            MoverPauseReason::MediaError => me.flags |= MediaFlags::MEDIA_IO_ERROR,
            MoverPauseReason::Na => {}
        },
        MoverState::Halted => {} // may not actually be the window
        _ => log::info!("Warning: capturing offset w/o quiescent mover"),
    }

    // size of this image on this tape
    let wlen = record_num * record_size - last_w_offset;
    me.n_bytes = Some(wlen);
    me.nb_determined = true;

    log::info!("CM {:02} {}", ix, me.pp());

    Ok(())
}

/// Walk the media list accumulating begin/end offsets; an unknown
/// size ends the accumulation at INFINITY.
pub fn media_calculate_offsets(sess: &mut Session) -> Result<(), Error> {
    let ca = super::ca_mut(sess)?;
    let mut offset: u64 = 0;
    for me in ca.job.media_tab.entries_mut() {
        me.begin_offset = offset;
        match me.n_bytes {
            Some(n_bytes) if n_bytes != LENGTH_INFINITY => {
                offset += n_bytes;
                me.end_offset = offset;
            }
            _ => {
                me.n_bytes = Some(LENGTH_INFINITY);
                me.end_offset = LENGTH_INFINITY;
                // offset unchanged
            }
        }
    }
    Ok(())
}

/// MOVER_SET_WINDOW for the current media entry.
pub fn media_set_window_current(sess: &mut Session) -> Result<(), Error> {
    let (offset, length) = {
        let ca = super::ca_mut(sess)?;
        let ix = ca.cur_media_ix;
        let me = ca
            .job
            .media_tab
            .by_index(ix)
            .ok_or_else(|| format_err!("no media entry #{}", ix))?;
        (me.begin_offset, me.n_bytes.unwrap_or(LENGTH_INFINITY))
    };
    calls::mover_set_window(sess, offset, length)?;
    super::ca_mut(sess)?.job.last_w_offset = offset;
    Ok(())
}

/// Log the media table with result flags, one line per entry.
pub fn media_tattle(sess: &mut Session) {
    let ca = match sess.control.as_ref() {
        Some(ca) => ca,
        None => return,
    };
    for me in ca.job.media_tab.entries() {
        log::info!("media #{} {}", me.index, me.pp());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_offsets_accumulate() {
        let mut table = MediaTable::new();
        for _ in 0..3 {
            table.store_media(None);
        }
        table.entry_mut(0).unwrap().n_bytes = Some(256 << 20);
        table.entry_mut(1).unwrap().n_bytes = Some(256 << 20);
        table.entry_mut(2).unwrap().n_bytes = Some(88 << 20);

        let mut offset = 0u64;
        for me in table.entries_mut() {
            me.begin_offset = offset;
            offset += me.n_bytes.unwrap();
            me.end_offset = offset;
        }

        assert_eq!(table.entries()[1].begin_offset, 256 << 20);
        assert_eq!(table.entries()[2].begin_offset, 512 << 20);
        assert_eq!(table.entries()[2].end_offset, 600 << 20);
    }

    #[test]
    fn test_label_record_format() {
        // the label record layout is fixed: 512 bytes, '#" fill,
        // newline every 64 bytes, command-like first line
        let mut buf = vec![b'#'; LABEL_RECORD_LEN];
        for p in (63..LABEL_RECORD_LEN).step_by(64) {
            buf[p] = b'\n';
        }
        let head = b"##ndmjob -m TAPE01\n";
        buf[..head.len()].copy_from_slice(head);

        assert_eq!(buf.len(), 512);
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("##ndmjob -m TAPE01\n"));
        assert_eq!(buf[127], b'\n');
        assert_eq!(buf[128], b'#');
    }

    #[test]
    fn test_table_cap() {
        let mut table = MediaTable::new();
        for _ in 0..NDM_MAX_MEDIA {
            assert!(table.store_media(None).is_some());
        }
        assert!(table.store_media(None).is_none());
    }
}
