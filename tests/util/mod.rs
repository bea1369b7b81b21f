//! Shared fixtures for the end-to-end session tests: a session wired
//! to the tape/changer simulators and a shell-command formatter
//! resolver driven by the job environment.
#![allow(dead_code)]

use std::path::PathBuf;

use ndmp_api_types::{DataOperation, NlistEntry, Pval};
use ndmp_tape::{ChangerSimulator, TapeSimulator};

use ndmp_agent::control::{JobOperation, JobParams};
use ndmp_agent::session::{Callbacks, QueryCallbacks, Session, SessionParam};

pub fn create_testdir(name: &str) -> PathBuf {
    let mut testdir: PathBuf = String::from("./target/testout").into();
    testdir.push("e2e");
    testdir.push(name);
    let _ = std::fs::remove_dir_all(&testdir);
    let _ = std::fs::create_dir_all(&testdir);
    testdir
}

struct TestQuery;

impl QueryCallbacks for TestQuery {
    fn butype_info(&self) -> Vec<ndmp_agent::msg::ButypeInfo> {
        vec![ndmp_agent::msg::ButypeInfo {
            butype_name: "dump".into(),
            default_env: vec![Pval::new("HIST", "y")],
            attrs: 0,
        }]
    }
}

/// Formatter resolution: the job environment names the command lines
/// (`BACKUP_CMD` / `RECOVER_CMD`). The wrap channel is fd 3.
fn formatter_resolver(
    _bu_type: &str,
    operation: DataOperation,
    env: &[Pval],
    _nlist: &[NlistEntry],
) -> Option<String> {
    let key = match operation {
        DataOperation::Backup => "BACKUP_CMD",
        DataOperation::Recover | DataOperation::RecoverFilehist => "RECOVER_CMD",
        DataOperation::NoAction => return None,
    };
    env.iter()
        .find(|pv| pv.name == key)
        .map(|pv| pv.value.clone())
}

/// A session with all simulators plugged in. `tape_max_size` bounds
/// each simulated tape (EOM behavior).
pub fn sim_session(tape_max_size: u64) -> Session {
    let mut sess = Session::new(SessionParam {
        log_tag: "TEST".into(),
        log_level: 3,
        hostname: "localhost".into(),
    });
    sess.cbs = Callbacks {
        query: Some(Box::new(TestQuery)),
        formatter: Some(Box::new(formatter_resolver)),
        tape_open: Some(Box::new(move |device, will_write| {
            let drive = TapeSimulator::open(std::path::Path::new(device), will_write, tape_max_size)?;
            Ok(Box::new(drive) as Box<dyn ndmp_tape::TapeDevice>)
        })),
        ..Default::default()
    };
    sess
}

/// A robot backend driving the changer simulator.
pub struct SimRobot {
    changer: Option<ChangerSimulator>,
    n_slots: usize,
    n_drives: usize,
}

impl SimRobot {
    pub fn new(n_slots: usize, n_drives: usize) -> Self {
        SimRobot {
            changer: None,
            n_slots,
            n_drives,
        }
    }
}

impl ndmp_agent::robot::RobotOps for SimRobot {
    fn open(&mut self, name: &str) -> ndmp_api_types::NdmpResult<()> {
        let changer =
            ChangerSimulator::open(std::path::Path::new(name), self.n_slots, self.n_drives)
                .map_err(|_| ndmp_api_types::NdmpError::NoDevice)?;
        self.changer = Some(changer);
        Ok(())
    }

    fn close(&mut self) -> ndmp_api_types::NdmpResult<()> {
        self.changer = None;
        Ok(())
    }

    fn reset(&mut self) -> ndmp_api_types::NdmpResult<()> {
        Ok(())
    }

    fn execute_cdb(
        &mut self,
        request: &ndmp_api_types::ExecuteCdbRequest,
    ) -> ndmp_api_types::NdmpResult<ndmp_api_types::ExecuteCdbReply> {
        match self.changer.as_mut() {
            Some(changer) => Ok(changer.execute_cdb(request)),
            None => Err(ndmp_api_types::NdmpError::DevNotOpen),
        }
    }
}

/// A resident backup job over the given drive directory.
pub fn backup_job(drive_dir: &std::path::Path, record_size: u32) -> JobParams {
    use ndmp_agent::control::job::AgentSpec;
    let mut job = JobParams::new(JobOperation::Backup);
    job.data_agent = AgentSpec::Resident;
    job.tape_agent = AgentSpec::Resident;
    job.bu_type = "dump".into();
    job.record_size = record_size;
    job.tape_device = drive_dir.to_string_lossy().into_owned();
    job
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
