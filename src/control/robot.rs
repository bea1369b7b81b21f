//! CONTROL-side robot driving over SCSI pass-through.
//!
//! Everything goes through SCSI_EXECUTE_CDB: inquiry, element
//! address assignments, element status, moves. A drive found Full
//! when it should be empty is remedied by moving the medium back to
//! its validated source slot.

use anyhow::{bail, format_err, Error};

use ndmp_api_types::{CdbDataDir, ExecuteCdbRequest};
use ndmp_tape::smc::{
    self, ElementAddressAssignment, ElementDescriptor, ElementType,
};

use crate::session::Session;

use super::calls;
use super::media::MediaFlags;

/// Robot info gathered over the wire.
#[derive(Debug, Clone, Default)]
pub struct SmcInfo {
    pub ident: String,
    pub elem_aa: ElementAddressAssignment,
    pub elem_desc: Vec<ElementDescriptor>,
}

fn send_cdb(
    sess: &mut Session,
    cdb: Vec<u8>,
    datain_len: u32,
) -> Result<Vec<u8>, Error> {
    let request = ExecuteCdbRequest {
        data_dir: if datain_len > 0 {
            CdbDataDir::In
        } else {
            CdbDataDir::None
        },
        timeout: 300,
        datain_len,
        cdb,
        dataout: Vec::new(),
    };
    let reply = calls::scsi_execute_cdb(sess, request)?;
    if reply.status != 0 {
        bail!("SCSI check condition, status {}", reply.status);
    }
    Ok(reply.datain)
}

/// Connect the robot agent and open the pass-through device.
pub fn robot_startup(sess: &mut Session) -> Result<(), Error> {
    if !super::ca_mut(sess)?.job.have_robot {
        bail!("robot startup without robot");
    }
    super::conn::connect_robot_agent(sess)?;
    let device = super::ca_mut(sess)?.job.robot_device.clone();
    calls::scsi_open(sess, &device)?;
    Ok(())
}

pub fn robot_obtain_info(sess: &mut Session) -> Result<(), Error> {
    let inquiry = send_cdb(sess, smc::inquiry_cdb(96), 96)?;
    let info = smc::decode_inquiry(&inquiry)?;
    let ident = format!("{} {}", info.vendor, info.product);

    let page = send_cdb(sess, smc::mode_sense_element_address_cdb(), 256)?;
    let elem_aa = smc::decode_element_address_assignment(&page)?;

    let status = send_cdb(sess, smc::read_element_status_cdb(0, 1000, 64 * 1024), 64 * 1024)?;
    let elem_desc = smc::decode_element_status(&status)?;

    super::ca_mut(sess)?.smc = Some(SmcInfo {
        ident,
        elem_aa,
        elem_desc,
    });
    Ok(())
}

/// Commanding robot to take inventory.
pub fn robot_init_elem_status(sess: &mut Session) -> Result<(), Error> {
    log::info!("Commanding robot to initialize element status (take inventory)");
    send_cdb(sess, smc::initialize_element_status_cdb(), 0)?;
    Ok(())
}

/// Move with bounded retry and ten second inter-attempt sleeps.
pub fn robot_move(sess: &mut Session, src_addr: u16, dst_addr: u16) -> Result<(), Error> {
    let (mte_addr, robot_timeout) = {
        let ca = super::ca_mut(sess)?;
        let mte_addr = ca
            .smc
            .as_ref()
            .map(|smc| smc.elem_aa.mte_addr)
            .unwrap_or(0);
        (mte_addr, ca.job.robot_timeout)
    };

    log::info!("robot moving @{} to @{}", src_addr, dst_addr);

    let cdb = smc::move_medium_cdb(mte_addr, src_addr, dst_addr);
    let mut t = 0;
    loop {
        match send_cdb(sess, cdb.clone(), 0) {
            Ok(_) => {
                log::info!("robot move OK @{} to @{}", src_addr, dst_addr);
                return Ok(());
            }
            Err(err) => {
                t += 10;
                if t > robot_timeout {
                    log::info!("robot move BAD @{} to @{}", src_addr, dst_addr);
                    return Err(err);
                }
                log::info!("Pausing ten seconds before retry ({}/{})", t, robot_timeout);
                std::thread::sleep(std::time::Duration::from_secs(10));
            }
        }
    }
}

fn dte_addr(sess: &mut Session) -> Result<u16, Error> {
    let ca = super::ca_mut(sess)?;
    if let Some(drive) = ca.job.drive_addr {
        return Ok(drive);
    }
    ca.smc
        .as_ref()
        .map(|smc| smc.elem_aa.dte_addr)
        .ok_or_else(|| format_err!("robot info not obtained"))
}

pub fn robot_load(sess: &mut Session, slot_addr: u16) -> Result<(), Error> {
    if super::ca_mut(sess)?.smc.is_none() {
        robot_obtain_info(sess)?;
    }
    let dte = dte_addr(sess)?;
    log::info!("Commanding robot to load slot @{} into drive @{}", slot_addr, dte);
    robot_move(sess, slot_addr, dte)
}

pub fn robot_unload(sess: &mut Session, slot_addr: u16) -> Result<(), Error> {
    let dte = dte_addr(sess)?;
    // some robots need the drive to eject first; the tape unload
    // path already rewound and closed it
    log::info!("Commanding robot to unload drive @{} to slot @{}", dte, slot_addr);
    robot_move(sess, dte, slot_addr)
}

fn find_element(smc_info: &SmcInfo, element_address: u16) -> Option<&ElementDescriptor> {
    smc_info
        .elem_desc
        .iter()
        .find(|edp| edp.element_address == element_address)
}

fn remedy_drive_range(sess: &mut Session) -> Result<(u16, u16), Error> {
    let ca = super::ca_mut(sess)?;
    let smc_info = ca
        .smc
        .as_ref()
        .ok_or_else(|| format_err!("robot info not obtained"))?;
    if ca.job.remedy_all {
        Ok((smc_info.elem_aa.dte_addr, smc_info.elem_aa.dte_count))
    } else if let Some(drive) = ca.job.drive_addr {
        Ok((drive, 1))
    } else {
        Ok((smc_info.elem_aa.dte_addr, 1))
    }
}

/// Count drives that are unexpectedly Full.
pub fn robot_check_ready(sess: &mut Session) -> Result<i32, Error> {
    robot_obtain_info(sess)?;
    let (first_dte, n_dte) = remedy_drive_range(sess)?;

    let ca = super::ca_mut(sess)?;
    let smc_info = ca.smc.as_ref().ok_or_else(|| format_err!("no robot info"))?;
    let mut errcnt = 0;
    for i in 0..n_dte {
        if let Some(edp) = find_element(smc_info, first_dte + i) {
            if edp.full {
                log::info!("tape drive @{} not empty", edp.element_address);
                errcnt += 1;
            }
        }
    }
    Ok(errcnt)
}

/// Put stuck media back where it came from, validating that the
/// source is an empty storage slot.
pub fn robot_remedy_ready(sess: &mut Session) -> Result<i32, Error> {
    robot_obtain_info(sess)?;
    let (first_dte, n_dte) = remedy_drive_range(sess)?;

    let mut moves: Vec<(u16, u16)> = Vec::new();
    let mut errcnt = 0;
    {
        let ca = super::ca_mut(sess)?;
        let smc_info = ca.smc.as_ref().ok_or_else(|| format_err!("no robot info"))?;
        for i in 0..n_dte {
            let edp = match find_element(smc_info, first_dte + i) {
                Some(edp) => edp,
                None => continue,
            };
            if !edp.full {
                continue;
            }
            let prefix = format!("drive @{} not empty", edp.element_address);
            if !edp.svalid {
                log::info!("{}, invalid source", prefix);
                errcnt += 1;
                continue;
            }
            let src = match find_element(smc_info, edp.src_se_addr) {
                Some(src) => src,
                None => {
                    log::info!("{}, src @{} unknown", prefix, edp.src_se_addr);
                    errcnt += 1;
                    continue;
                }
            };
            if src.element_type != ElementType::Storage {
                log::info!("{}, src @{}, not slot", prefix, edp.src_se_addr);
                errcnt += 1;
                continue;
            }
            if src.full {
                log::info!("{}, src @{}, but slot Full", prefix, edp.src_se_addr);
                errcnt += 1;
                continue;
            }
            moves.push((edp.element_address, edp.src_se_addr));
        }
    }

    for (drive, slot) in moves {
        if robot_move(sess, drive, slot).is_err() {
            log::info!("drive @{} not empty, move failed", drive);
            errcnt += 1;
        }
    }
    Ok(errcnt)
}

/// Check media slots against the element status, setting per-entry
/// result flags.
pub fn robot_verify_media(sess: &mut Session) -> Result<i32, Error> {
    robot_obtain_info(sess)?;
    let ca = super::ca_mut(sess)?;
    let smc_info = ca
        .smc
        .take()
        .ok_or_else(|| format_err!("no robot info"))?;

    let mut errcnt = 0;
    for me in ca.job.media_tab.entries_mut() {
        let slot = match me.slot_addr {
            Some(slot) => slot,
            None => {
                me.flags |= MediaFlags::SLOT_MISSING;
                errcnt += 1;
                continue;
            }
        };
        match smc_info
            .elem_desc
            .iter()
            .find(|edp| edp.element_type == ElementType::Storage && edp.element_address == slot)
        {
            Some(edp) => {
                if !edp.full {
                    me.flags |= MediaFlags::SLOT_EMPTY;
                    errcnt += 1;
                }
            }
            None => {
                me.flags |= MediaFlags::SLOT_BAD;
                errcnt += 1;
            }
        }
    }
    ca.smc = Some(smc_info);
    Ok(errcnt)
}

/// Fill an empty media table from Full storage slots (LIST_LABELS).
pub fn robot_synthesize_media(sess: &mut Session) -> Result<(), Error> {
    robot_obtain_info(sess)?;
    let ca = super::ca_mut(sess)?;
    let smc_info = ca.smc.as_ref().ok_or_else(|| format_err!("no robot info"))?;
    for edp in &smc_info.elem_desc {
        if edp.element_type != ElementType::Storage || !edp.full {
            continue;
        }
        if ca.job.media_tab.store_media(Some(edp.element_address)).is_none() {
            break; // table full
        }
    }
    Ok(())
}

/// Robot/media preflight shared by most tape-using operations.
pub fn op_robot_startup(sess: &mut Session, verify_media: bool) -> Result<(), Error> {
    let (have_robot, auto_remedy) = {
        let ca = super::ca_mut(sess)?;
        (ca.job.have_robot, ca.job.auto_remedy)
    };
    if !have_robot {
        return Ok(());
    }

    robot_startup(sess)?;
    robot_obtain_info(sess)?;

    if auto_remedy {
        let n = robot_remedy_ready(sess)?;
        if n > 0 {
            bail!("robot remedy left {} drive(s) busy", n);
        }
    } else {
        let n = robot_check_ready(sess)?;
        if n > 0 {
            bail!("{} drive(s) not ready", n);
        }
    }

    if verify_media {
        let n = robot_verify_media(sess)?;
        if n > 0 {
            super::media::media_tattle(sess);
            bail!("{} media verification defect(s)", n);
        }
    }
    Ok(())
}

/// Print what we know about the robot through the query log.
pub fn robot_query(sess: &mut Session) -> Result<(), Error> {
    robot_obtain_info(sess)?;
    let ca = super::ca_mut(sess)?;
    let smc_info = ca.smc.as_ref().ok_or_else(|| format_err!("no robot info"))?;

    log::info!("  Type");
    log::info!("    '{}'", smc_info.ident);
    log::info!("  Elements");
    let aa = &smc_info.elem_aa;
    log::info!(
        "    MTE @{}x{}  SE @{}x{}  IEE @{}x{}  DTE @{}x{}",
        aa.mte_addr,
        aa.mte_count,
        aa.se_addr,
        aa.se_count,
        aa.iee_addr,
        aa.iee_count,
        aa.dte_addr,
        aa.dte_count
    );
    log::info!("  Status");
    log::info!("    E#  Addr Type Status");
    for (i, edp) in smc_info.elem_desc.iter().enumerate() {
        log::info!(
            "    {:2}  @{:<4} {:?} {}{}",
            i + 1,
            edp.element_address,
            edp.element_type,
            if edp.full { "Full" } else { "Empty" },
            if edp.svalid {
                format!(" src @{}", edp.src_se_addr)
            } else {
                String::new()
            }
        );
    }
    Ok(())
}
