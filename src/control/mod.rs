//! CONTROL agent: job driving, media orchestration, monitoring.

use anyhow::{bail, format_err, Error};

use ndmp_api_types::*;

use crate::msg::{NotifyDataReadRequest, NotifyMoverPausedRequest};
use crate::session::Session;

pub mod job;
pub use job::*;

pub mod media;
pub use media::{Media, MediaFlags, MediaTable};

pub mod calls;
pub mod conn;

pub mod backreco;
pub use backreco::Finish;

pub mod labels;
pub mod query;
pub mod robot;
pub mod test_ops;

/// The CONTROL agent control block.
pub struct ControlAgent {
    pub job: JobParams,
    /// Swap the image-stream connect order: DATA listens, MOVER
    /// connects.
    pub swap_connect: bool,

    /// LOCAL or TCP linkage for this job's image stream.
    pub image_addr_type: AddrType,

    /* DATA agent */
    pub data_state: DataGetStateReply,
    pub pending_notify_data_read: u32,
    pub pending_notify_data_halted: u32,
    pub last_notify_data_read: NotifyDataReadRequest,
    pub data_addr: DataAddr,
    pub recover_log_file_count: i32,
    pub recover_log_file_ok: i32,
    pub recover_log_file_error: i32,

    /* Image stream */
    pub mover_addr: DataAddr,
    pub mover_mode: MoverMode,

    /* TAPE agent */
    pub mover_state: MoverGetStateReply,
    pub pending_notify_mover_paused: u32,
    pub pending_notify_mover_halted: u32,
    pub last_notify_mover_paused: NotifyMoverPausedRequest,
    pub tape_mode: TapeOpenMode,
    pub tape_state: TapeGetStateReply,

    /* Media management */
    pub cur_media_ix: u32,
    pub media_is_loaded: bool,
    pub is_label_op: bool,

    /* ROBOT agent */
    pub smc: Option<robot::SmcInfo>,

    /* File/media index */
    pub index_files: Vec<FhFile>,
    pub index_dirs: Vec<FhDir>,
    pub index_nodes: Vec<FhNode>,
    pub n_file_entry: u32,
    pub n_dir_entry: u32,
    pub n_node_entry: u32,
}

impl ControlAgent {
    pub fn new() -> Self {
        ControlAgent {
            job: JobParams::new(JobOperation::QueryAgents),
            swap_connect: false,
            image_addr_type: AddrType::Local,
            data_state: DataGetStateReply::default(),
            pending_notify_data_read: 0,
            pending_notify_data_halted: 0,
            last_notify_data_read: NotifyDataReadRequest::default(),
            data_addr: DataAddr::Local,
            recover_log_file_count: 0,
            recover_log_file_ok: 0,
            recover_log_file_error: 0,
            mover_addr: DataAddr::Local,
            mover_mode: MoverMode::Read,
            mover_state: MoverGetStateReply::default(),
            pending_notify_mover_paused: 0,
            pending_notify_mover_halted: 0,
            last_notify_mover_paused: NotifyMoverPausedRequest {
                reason: MoverPauseReason::Na,
                seek_position: 0,
            },
            tape_mode: TapeOpenMode::Read,
            tape_state: TapeGetStateReply::default(),
            cur_media_ix: 0,
            media_is_loaded: false,
            is_label_op: false,
            smc: None,
            index_files: Vec::new(),
            index_dirs: Vec::new(),
            index_nodes: Vec::new(),
            n_file_entry: 0,
            n_dir_entry: 0,
            n_node_entry: 0,
        }
    }
}

impl Default for ControlAgent {
    fn default() -> Self {
        ControlAgent::new()
    }
}

pub(crate) fn ca_mut(sess: &mut Session) -> Result<&mut ControlAgent, Error> {
    sess.control
        .as_deref_mut()
        .ok_or_else(|| format_err!("control agent not enabled"))
}

pub fn connect_control_agent(sess: &mut Session) -> Result<(), Error> {
    conn::connect_control_agent(sess)
}

/// Run the job named by the control agent's parameters to
/// completion. Returns the three-way finish code.
pub fn control_agent(sess: &mut Session) -> Result<Finish, Error> {
    let operation = ca_mut(sess)?.job.operation;
    use JobOperation::*;
    match operation {
        Backup => backreco::op_create_backup(sess),
        Extract => backreco::op_recover_files(sess),
        Toc => backreco::op_recover_fh(sess),
        QueryAgents => query::op_query(sess).map(|_| 0),
        InitLabels => labels::op_init_labels(sess).map(|_| 0),
        ListLabels => labels::op_list_labels(sess).map(|_| 0),
        RemedyRobot => op_robot_remedy(sess).map(|_| 0),
        TestTape => test_ops::op_test_tape(sess).map(|_| 0),
        TestMover => test_ops::op_test_mover(sess).map(|_| 0),
        TestData => test_ops::op_test_data(sess).map(|_| 0),
        RewindTape => op_rewind_tape(sess).map(|_| 0),
        EjectTape => op_eject_tape(sess).map(|_| 0),
        MoveTape => op_move_tape(sess).map(|_| 0),
        LoadTape => op_load_tape(sess).map(|_| 0),
        UnloadTape => op_unload_tape(sess).map(|_| 0),
        ImportTape => op_import_tape(sess).map(|_| 0),
        ExportTape => op_export_tape(sess).map(|_| 0),
        InitElemStatus => op_init_elem_status(sess).map(|_| 0),
    }
}

/*
 * Tape and robot handling operations
 */

fn op_mtio(sess: &mut Session, op: MtioOp) -> Result<(), Error> {
    {
        let ca = ca_mut(sess)?;
        ca.tape_mode = TapeOpenMode::Read;
        ca.is_label_op = true;
    }
    conn::connect_tape_agent(sess)?;
    media::media_open_tape(sess)?;
    let rc = media::media_mtio_tape(sess, op, 1);
    let _ = media::media_close_tape(sess);
    rc.map(|_| ())
}

pub fn op_rewind_tape(sess: &mut Session) -> Result<(), Error> {
    op_mtio(sess, MtioOp::Rew)
}

pub fn op_eject_tape(sess: &mut Session) -> Result<(), Error> {
    op_mtio(sess, MtioOp::Off)
}

pub fn op_robot_remedy(sess: &mut Session) -> Result<(), Error> {
    if !ca_mut(sess)?.job.have_robot {
        return Ok(()); // nothing to remedy
    }
    robot::robot_startup(sess)?;
    let n = robot::robot_remedy_ready(sess)?;
    if n > 0 {
        bail!("{} drive(s) could not be remedied", n);
    }
    Ok(())
}

pub fn op_move_tape(sess: &mut Session) -> Result<(), Error> {
    let (from_addr, to_addr) = {
        let ca = ca_mut(sess)?;
        (
            ca.job.from_addr.ok_or_else(|| format_err!("missing 'from' address"))?,
            ca.job.to_addr.ok_or_else(|| format_err!("missing 'to' address"))?,
        )
    };
    robot::robot_startup(sess)?;
    robot::robot_obtain_info(sess)?;
    robot::robot_move(sess, from_addr, to_addr)
}

pub fn op_load_tape(sess: &mut Session) -> Result<(), Error> {
    let from_addr = ca_mut(sess)?
        .job
        .from_addr
        .ok_or_else(|| format_err!("missing 'from' address"))?;
    robot::robot_startup(sess)?;
    robot::robot_load(sess, from_addr)
}

pub fn op_unload_tape(sess: &mut Session) -> Result<(), Error> {
    robot::robot_startup(sess)?;
    robot::robot_obtain_info(sess)?;

    // find where the drive's medium came from, else first empty slot
    let slot = {
        let ca = ca_mut(sess)?;
        let smc_info = ca.smc.as_ref().ok_or_else(|| format_err!("no robot info"))?;
        let dte_addr = ca.job.drive_addr.unwrap_or(smc_info.elem_aa.dte_addr);
        let drive = smc_info
            .elem_desc
            .iter()
            .find(|edp| edp.element_address == dte_addr)
            .ok_or_else(|| format_err!("drive @{} not found", dte_addr))?;
        if !drive.full {
            return Ok(()); // already empty
        }
        if drive.svalid {
            drive.src_se_addr
        } else {
            smc_info
                .elem_desc
                .iter()
                .find(|edp| {
                    edp.element_type == ndmp_tape::smc::ElementType::Storage && !edp.full
                })
                .map(|edp| edp.element_address)
                .ok_or_else(|| format_err!("no empty slot for unload"))?
        }
    };
    robot::robot_unload(sess, slot)
}

pub fn op_import_tape(sess: &mut Session) -> Result<(), Error> {
    let to_addr = ca_mut(sess)?
        .job
        .to_addr
        .ok_or_else(|| format_err!("missing 'to' address"))?;
    robot::robot_startup(sess)?;
    robot::robot_obtain_info(sess)?;

    let iee_addr = {
        let ca = ca_mut(sess)?;
        ca.smc
            .as_ref()
            .map(|smc| smc.elem_aa.iee_addr)
            .ok_or_else(|| format_err!("no robot info"))?
    };
    robot::robot_move(sess, iee_addr, to_addr)
}

pub fn op_export_tape(sess: &mut Session) -> Result<(), Error> {
    let from_addr = ca_mut(sess)?
        .job
        .from_addr
        .ok_or_else(|| format_err!("missing 'from' address"))?;
    robot::robot_startup(sess)?;
    robot::robot_obtain_info(sess)?;

    let iee_addr = {
        let ca = ca_mut(sess)?;
        ca.smc
            .as_ref()
            .map(|smc| smc.elem_aa.iee_addr)
            .ok_or_else(|| format_err!("no robot info"))?
    };
    robot::robot_move(sess, from_addr, iee_addr)
}

pub fn op_init_elem_status(sess: &mut Session) -> Result<(), Error> {
    robot::robot_startup(sess)?;
    robot::robot_init_elem_status(sess)?;
    robot::robot_obtain_info(sess)
}
