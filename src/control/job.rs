//! Job parameters and the job audit.
//!
//! An operation declares its required components; the audit counts
//! defects and can enumerate them one at a time by increasing the
//! skip count:
//!
//! ```text
//! let mut i = 0;
//! loop {
//!     let mut errbuf = String::new();
//!     let n_err = job_audit(&job, Some(&mut errbuf), i);
//!     if n_err == 0 { break }
//!     display(&errbuf);
//!     i += 1;
//!     if i >= n_err { break }
//! }
//! ```

use std::net::SocketAddr;

use ndmp_api_types::{NlistEntry, Pval};

use super::media::{MediaTable, NDM_MAX_MEDIA};

/// How to reach (or embody) an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AgentSpec {
    #[default]
    None,
    /// The agent lives in this session
    Resident,
    /// The agent is a remote NDMP server
    Remote {
        addr: SocketAddr,
        account: String,
        password: String,
    },
}

impl AgentSpec {
    pub fn is_given(&self) -> bool {
        *self != AgentSpec::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOperation {
    Backup,
    Extract,
    Toc,
    QueryAgents,
    InitLabels,
    ListLabels,
    RemedyRobot,
    TestTape,
    TestMover,
    TestData,
    RewindTape,
    EjectTape,
    MoveTape,
    LoadTape,
    UnloadTape,
    ImportTape,
    ExportTape,
    InitElemStatus,
}

#[derive(Debug, Clone)]
pub struct JobParams {
    pub operation: JobOperation,
    /// Per-call advisory time limit in seconds, 0 is off.
    pub time_limit: u32,

    pub data_agent: AgentSpec,
    pub bu_type: String,
    pub bu_level: i32,
    pub env_tab: Vec<Pval>,
    pub nlist_tab: Vec<NlistEntry>,
    pub result_env_tab: Vec<Pval>,

    pub tape_agent: AgentSpec,
    pub tape_device: String,
    /// Seconds total to retry the tape open.
    pub tape_timeout: u32,
    pub record_size: u32,
    pub last_w_offset: u64,
    pub use_eject: bool,

    pub robot_agent: AgentSpec,
    pub robot_device: String,
    /// Seconds total to retry a robot move.
    pub robot_timeout: u32,
    pub have_robot: bool,
    pub auto_remedy: bool,
    pub remedy_all: bool,
    pub drive_addr: Option<u16>,
    pub from_addr: Option<u16>,
    pub to_addr: Option<u16>,

    pub media_tab: MediaTable,
    pub result_media_tab: MediaTable,

    pub bytes_written: u64,
    pub bytes_read: u64,
}

impl JobParams {
    pub fn new(operation: JobOperation) -> Self {
        JobParams {
            operation,
            time_limit: 0,
            data_agent: AgentSpec::None,
            bu_type: String::new(),
            bu_level: 0,
            env_tab: Vec::new(),
            nlist_tab: Vec::new(),
            result_env_tab: Vec::new(),
            tape_agent: AgentSpec::None,
            tape_device: String::new(),
            tape_timeout: 0,
            record_size: 0,
            last_w_offset: 0,
            use_eject: false,
            robot_agent: AgentSpec::None,
            robot_device: String::new(),
            robot_timeout: 0,
            have_robot: false,
            auto_remedy: false,
            remedy_all: false,
            drive_addr: None,
            from_addr: None,
            to_addr: None,
            media_tab: MediaTable::new(),
            result_media_tab: MediaTable::new(),
            bytes_written: 0,
            bytes_read: 0,
        }
    }
}

macro_rules! job_error {
    ($errcnt:ident, $errbuf:ident, $errskip:ident, $($msg:tt)*) => {{
        if $errcnt >= $errskip {
            if let Some(buf) = $errbuf.as_mut() {
                buf.clear();
                buf.push_str(&format!($($msg)*));
            }
            $errcnt += 1;
            return $errcnt;
        }
        $errcnt += 1;
    }};
}

/// Audit a job against its operation's required components. Returns
/// the number of defects found up to and including the one written
/// into `errbuf` (the `errskip`-th).
pub fn job_audit(job: &JobParams, mut errbuf: Option<&mut String>, errskip: i32) -> i32 {
    let mut errcnt: i32 = 0;

    use JobOperation::*;
    let audit_what = match job.operation {
        Backup | Extract | Toc => "DfbBmM",
        QueryAgents | RemedyRobot => "",
        InitLabels => "TfmM",
        ListLabels | TestTape => "TfM",
        TestMover => "TfbM",
        TestData => "DB",
        RewindTape | EjectTape => "Tf",
        MoveTape | ImportTape | ExportTape | LoadTape => "Rr@",
        UnloadTape | InitElemStatus => "Rr",
    };

    for what in audit_what.chars() {
        match what {
            'D' => {
                if !job.data_agent.is_given() {
                    job_error!(errcnt, errbuf, errskip, "missing DATA agent");
                }
            }
            'T' => {
                // TAPE agent provided (use DATA if given)
                if !job.data_agent.is_given() && !job.tape_agent.is_given() {
                    job_error!(errcnt, errbuf, errskip, "missing TAPE or DATA agent");
                }
            }
            'R' => {
                if !job.data_agent.is_given()
                    && !job.tape_agent.is_given()
                    && !job.robot_agent.is_given()
                {
                    job_error!(errcnt, errbuf, errskip, "missing ROBOT, TAPE or DATA agent");
                }
            }
            'B' => {
                if job.bu_type.is_empty() {
                    job_error!(errcnt, errbuf, errskip, "missing bu_type");
                }
            }
            'b' => {
                if job.record_size == 0 {
                    job_error!(errcnt, errbuf, errskip, "missing record size");
                }
            }
            'f' => {
                if job.tape_device.is_empty() {
                    job_error!(errcnt, errbuf, errskip, "missing tape device");
                }
            }
            'm' => {
                if job.media_tab.n_media() < 1 {
                    job_error!(errcnt, errbuf, errskip, "missing media entry");
                }
            }
            'M' => {
                let media_errors =
                    job_media_audit(job, errbuf.as_mut().map(|buf| &mut **buf), errskip - errcnt);
                if media_errors > 0 {
                    errcnt += media_errors;
                    if errcnt > errskip {
                        return errcnt;
                    }
                }
            }
            'r' => {
                if !job.have_robot {
                    job_error!(errcnt, errbuf, errskip, "missing robot SCSI address");
                }
            }
            '@' => {
                let need_from = matches!(job.operation, MoveTape | ExportTape | LoadTape);
                if need_from && job.from_addr.is_none() {
                    job_error!(errcnt, errbuf, errskip, "missing 'from' slot address");
                }
                let need_to = matches!(job.operation, MoveTape | ImportTape);
                if need_to && job.to_addr.is_none() {
                    job_error!(errcnt, errbuf, errskip, "missing 'to' slot address");
                }
            }
            _ => {
                job_error!(errcnt, errbuf, errskip, "INTERNAL BOTCH");
            }
        }
    }

    if job.robot_agent.is_given() && !job.have_robot && job.operation != QueryAgents {
        job_error!(errcnt, errbuf, errskip, "robot agent, but no robot");
    }

    errcnt
}

pub fn job_media_audit(job: &JobParams, mut errbuf: Option<&mut String>, errskip: i32) -> i32 {
    let mut errcnt: i32 = 0;
    let entries = job.media_tab.entries();

    if job.have_robot {
        for me in entries {
            let slot = match me.slot_addr {
                Some(slot) => slot,
                None => {
                    job_error!(
                        errcnt,
                        errbuf,
                        errskip,
                        "media #{} missing slot address",
                        me.index
                    );
                    continue;
                }
            };
            for me2 in entries.iter().filter(|me2| me2.index > me.index) {
                if me2.slot_addr == Some(slot) {
                    job_error!(
                        errcnt,
                        errbuf,
                        errskip,
                        "media #{} dup slot addr w/ #{}",
                        me.index,
                        me2.index
                    );
                }
            }
        }
    } else {
        if entries.len() > 1 {
            job_error!(errcnt, errbuf, errskip, "no robot, too many media");
        }
        for me in entries {
            if me.slot_addr.is_some() {
                job_error!(
                    errcnt,
                    errbuf,
                    errskip,
                    "media #{} slot address, but no robot",
                    me.index
                );
            }
        }
    }

    if job.operation == JobOperation::InitLabels {
        for me in entries {
            if me.label.is_none() {
                job_error!(errcnt, errbuf, errskip, "media #{} missing label", me.index);
            }
        }
    }

    errcnt
}

/// Synthesize a single media entry when a robot-less job supplied
/// none.
pub fn job_auto_adjust(job: &mut JobParams) {
    if job.media_tab.n_media() == 0
        && !job.have_robot
        && job.operation != JobOperation::InitLabels
        && job.media_tab.n_media() < NDM_MAX_MEDIA
    {
        job.media_tab.store_media(None);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backup_requires_components() {
        let job = JobParams::new(JobOperation::Backup);
        // missing DATA agent, tape device, record size, bu_type, media
        let n_err = job_audit(&job, None, i32::MAX);
        assert!(n_err >= 5);

        let mut errbuf = String::new();
        job_audit(&job, Some(&mut errbuf), 0);
        assert_eq!(errbuf, "missing DATA agent");
    }

    #[test]
    fn test_complete_backup_job_passes() {
        let mut job = JobParams::new(JobOperation::Backup);
        job.data_agent = AgentSpec::Resident;
        job.tape_agent = AgentSpec::Resident;
        job.bu_type = "dump".into();
        job.record_size = 10240;
        job.tape_device = "sim:drive-0".into();
        job.media_tab.store_media(None);
        assert_eq!(job_audit(&job, None, 0), 0);
    }

    #[test]
    fn test_duplicate_slots_detected() {
        let mut job = JobParams::new(JobOperation::InitLabels);
        job.tape_agent = AgentSpec::Resident;
        job.robot_agent = AgentSpec::Resident;
        job.have_robot = true;
        job.tape_device = "sim:drive-0".into();
        let ix = job.media_tab.store_media(Some(1024)).unwrap();
        job.media_tab.entry_mut(ix).unwrap().label = Some("A".into());
        let ix = job.media_tab.store_media(Some(1024)).unwrap();
        job.media_tab.entry_mut(ix).unwrap().label = Some("B".into());

        assert!(job_audit(&job, None, i32::MAX) > 0);
    }

    #[test]
    fn test_auto_adjust_synthesizes_media() {
        let mut job = JobParams::new(JobOperation::Backup);
        job_auto_adjust(&mut job);
        assert_eq!(job.media_tab.n_media(), 1);
        assert!(job.media_tab.entries()[0].slot_addr.is_none());
    }
}
