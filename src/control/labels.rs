//! Label operations: INIT_LABELS writes fresh media labels,
//! LIST_LABELS reads them back.

use anyhow::{bail, Error};

use ndmp_api_types::TapeOpenMode;

use crate::session::Session;

use super::{conn, media, robot};

pub fn op_init_labels(sess: &mut Session) -> Result<(), Error> {
    {
        let ca = super::ca_mut(sess)?;
        ca.tape_mode = TapeOpenMode::Rdwr;
        ca.is_label_op = true;

        if ca.job.media_tab.n_media() == 0 {
            bail!("No media entries in table");
        }
        let mut errors = 0;
        for me in ca.job.media_tab.entries() {
            if me.label.is_none() {
                log::error!("media #{} missing a label", me.index);
                errors += 1;
            }
        }
        if errors > 0 {
            bail!("{} media entries missing labels", errors);
        }
    }

    robot::op_robot_startup(sess, true)?;
    conn::connect_tape_agent(sess)?;

    let n_media = super::ca_mut(sess)?.job.media_tab.n_media() as u32;
    let mut failures = 0;
    for index in 1..=n_media {
        super::ca_mut(sess)?.cur_media_ix = index;

        if media::media_load_current(sess).is_err() {
            failures += 1;
            continue; // already tattled
        }

        let label = super::ca_mut(sess)?
            .job
            .media_tab
            .by_index(index)
            .and_then(|me| me.label.clone());
        if let Some(label) = label {
            if let Err(err) = media::media_write_label(sess, 'm', &label) {
                log::error!("failed label write: {}", err);
                failures += 1;
            }
        }

        let _ = media::media_write_filemarks(sess);
        let _ = media::media_unload_current(sess);
    }

    if failures > 0 {
        bail!("{} label write failure(s)", failures);
    }
    Ok(())
}

pub fn op_list_labels(sess: &mut Session) -> Result<(), Error> {
    {
        let ca = super::ca_mut(sess)?;
        ca.tape_mode = TapeOpenMode::Read;
        ca.is_label_op = true;
    }

    robot::op_robot_startup(sess, false)?;

    if super::ca_mut(sess)?.job.media_tab.n_media() == 0
        && super::ca_mut(sess)?.job.have_robot
    {
        robot::robot_synthesize_media(sess)?;
    }

    conn::connect_tape_agent(sess)?;

    let n_media = super::ca_mut(sess)?.job.media_tab.n_media() as u32;
    for index in 1..=n_media {
        super::ca_mut(sess)?.cur_media_ix = index;

        if media::media_load_current(sess).is_err() {
            continue; // already tattled
        }

        match media::media_read_label(sess) {
            Ok((kind, label)) if kind == 'm' || kind == 'V' => {
                let ca = super::ca_mut(sess)?;
                if let Some(me) = ca.job.media_tab.by_index_mut(index) {
                    me.label = Some(label);
                    log::info!("ME media #{} {}", me.index, me.pp());
                }
            }
            _ => log::error!("failed label read"),
        }

        let _ = media::media_unload_current(sess);
    }

    media::media_tattle(sess);
    Ok(())
}
