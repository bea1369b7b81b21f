//! DATA agent: formatter child, state machine, file history.
//!
//! The agent owns the backup/restore formatter process and its three
//! pipes. Backup drains the formatter's image pipe into the image
//! stream; recovery feeds the formatter from the image stream under
//! the access-method machine. stderr lines are mirrored to CONTROL
//! as log messages; wrap-channel lines become file history and
//! environment updates.

use std::collections::VecDeque;

use ndmp_api_types::*;

use crate::chan::Chan;
use crate::image_stream::{EndSel, ImageStream, IsConnectStatus, TransferMode};
use crate::msg::LogType;
use crate::notify::{AgentRole, Notice, NoticeKind};

mod fh;
pub use fh::*;

mod formatter;
pub use formatter::*;

mod recover;
pub use recover::*;

pub const NDM_MAX_ENV: usize = 1024;
pub const NDM_MAX_NLIST: usize = 10240;
pub const BU_TYPE_MAX: usize = 31;

/// One name list entry plus its recovery result.
#[derive(Debug, Clone)]
pub struct NlistState {
    pub entry: NlistEntry,
    pub result_err: NdmpError,
    pub result_count: u32,
}

pub struct DataAgent {
    pub protocol_version: u16,

    pub bu_type: String,
    pub env_tab: Vec<Pval>,
    pub nlist_tab: Vec<NlistState>,
    pub enable_hist: bool,

    pub data_state: DataGetStateReply,

    pub formatter: Option<FormatterChild>,
    pub fhh: FhHeap,
    pub recover: Option<RecoverState>,
}

impl DataAgent {
    pub fn new() -> Self {
        DataAgent {
            protocol_version: NDMP4VER,
            bu_type: String::new(),
            env_tab: Vec::new(),
            nlist_tab: Vec::new(),
            enable_hist: false,
            data_state: DataGetStateReply::default(),
            formatter: None,
            fhh: FhHeap::new(),
            recover: None,
        }
    }

    pub fn set_bu_type(&mut self, bu_type: &str) -> NdmpResult<()> {
        if bu_type.len() > BU_TYPE_MAX {
            return Err(NdmpError::IllegalArgs);
        }
        self.bu_type = bu_type.to_string();
        Ok(())
    }

    /// Install the request environment, replacing same-named pairs.
    pub fn copy_environment(&mut self, env: &[Pval]) -> NdmpResult<()> {
        if self.env_tab.len() + env.len() > NDM_MAX_ENV {
            return Err(NdmpError::IllegalArgs);
        }
        for pv in env {
            self.update_env(pv.clone());
        }
        self.enable_hist = self
            .find_env("HIST")
            .map(|v| interpret_boolean_value(v, false))
            .unwrap_or(false);
        Ok(())
    }

    pub fn update_env(&mut self, pv: Pval) {
        match self.env_tab.iter_mut().find(|e| e.name == pv.name) {
            Some(existing) => existing.value = pv.value,
            None => self.env_tab.push(pv),
        }
    }

    pub fn find_env(&self, name: &str) -> Option<&str> {
        self.env_tab
            .iter()
            .find(|pv| pv.name == name)
            .map(|pv| pv.value.as_str())
    }

    pub fn copy_nlist(&mut self, nlist: &[NlistEntry]) -> NdmpResult<()> {
        if nlist.len() >= NDM_MAX_NLIST {
            return Err(NdmpError::IllegalArgs);
        }
        self.nlist_tab = nlist
            .iter()
            .map(|entry| NlistState {
                entry: entry.clone(),
                result_err: NdmpError::Undefined,
                result_count: 0,
            })
            .collect();
        Ok(())
    }

    pub fn data_listen(&mut self) {
        self.data_state.state = DataState::Listen;
    }

    pub fn data_connect(&mut self) {
        self.data_state.state = DataState::Connected;
    }

    /// Return to IDLE and free resources; only legal in HALTED.
    pub fn data_stop(&mut self) {
        if let Some(mut formatter) = self.formatter.take() {
            formatter.kill();
        }
        self.recover = None;
        self.env_tab.clear();
        self.nlist_tab.clear();
        self.bu_type.clear();
        self.data_state = DataGetStateReply::default();
    }
}

impl Default for DataAgent {
    fn default() -> Self {
        DataAgent::new()
    }
}

pub fn interpret_boolean_value(value: &str, default_value: bool) -> bool {
    match value.chars().next() {
        Some('y') | Some('Y') | Some('t') | Some('T') | Some('1') => true,
        Some('n') | Some('N') | Some('f') | Some('F') | Some('0') => false,
        _ => default_value,
    }
}

/*
 * Transitions that touch the image stream
 */

pub fn data_halt(
    da: &mut DataAgent,
    is: &mut ImageStream,
    notices: &mut VecDeque<Notice>,
    reason: DataHaltReason,
) {
    da.fhh.flush(notices);
    da.data_state.state = DataState::Halted;
    da.data_state.halt_reason = reason;
    if reason != DataHaltReason::Successful {
        if let Some(formatter) = da.formatter.as_mut() {
            formatter.kill();
        }
    }
    is.ep_close(EndSel::Data);
    notices.push_back(Notice::new(AgentRole::Data, NoticeKind::DataHalted(reason)));
}

pub fn data_abort(da: &mut DataAgent, is: &mut ImageStream, notices: &mut VecDeque<Notice>) {
    data_halt(da, is, notices, DataHaltReason::Aborted);
}

pub fn data_start_backup(
    da: &mut DataAgent,
    is: &mut ImageStream,
    cmd: &str,
) -> NdmpResult<()> {
    let formatter = FormatterChild::spawn(cmd, true).map_err(|err| {
        log::error!("formatter start failed: {}", err);
        NdmpError::Undefined
    })?;
    if let Err(why) = is.ep_start(EndSel::Data, TransferMode::Write) {
        log::error!("data start botch: {}", why);
        return Err(NdmpError::IllegalState);
    }
    da.formatter = Some(formatter);
    da.data_state.operation = DataOperation::Backup;
    da.data_state.state = DataState::Active;
    da.data_state.halt_reason = DataHaltReason::Na;
    da.data_state.bytes_processed = 0;
    Ok(())
}

pub fn data_start_recover(
    da: &mut DataAgent,
    is: &mut ImageStream,
    cmd: &str,
    filehist_only: bool,
) -> NdmpResult<()> {
    let formatter = FormatterChild::spawn(cmd, false).map_err(|err| {
        log::error!("formatter start failed: {}", err);
        NdmpError::Undefined
    })?;
    if let Err(why) = is.ep_start(EndSel::Data, TransferMode::Read) {
        log::error!("data start botch: {}", why);
        return Err(NdmpError::IllegalState);
    }
    let hints: Vec<Option<u64>> = da
        .nlist_tab
        .iter()
        .map(|nl| nl.entry.fh_info)
        .collect();
    da.recover = Some(RecoverState::new(&hints));
    da.formatter = Some(formatter);
    da.data_state.operation = if filehist_only {
        DataOperation::RecoverFilehist
    } else {
        DataOperation::Recover
    };
    da.data_state.state = DataState::Active;
    da.data_state.halt_reason = DataHaltReason::Na;
    da.data_state.bytes_processed = 0;
    Ok(())
}

/*
 * Quantum -- get a bit of work done
 */

pub fn quantum(
    da: &mut DataAgent,
    is: &mut ImageStream,
    notices: &mut VecDeque<Notice>,
) -> bool {
    let mut did_something = false;

    match da.data_state.state {
        DataState::Idle | DataState::Halted | DataState::Connected => {}

        DataState::Listen => match is.data_ep.connect_status {
            IsConnectStatus::Listen => {}
            IsConnectStatus::Accepted => {
                da.data_connect();
                did_something = true;
            }
            _ => {
                data_halt(da, is, notices, DataHaltReason::ConnectError);
                did_something = true;
            }
        },

        DataState::Active => {
            did_something |= quantum_stderr(da, notices);
            did_something |= quantum_wrap(da, notices);
            did_something |= match da.data_state.operation {
                DataOperation::Backup => quantum_image_backup(da, is, notices),
                DataOperation::Recover | DataOperation::RecoverFilehist => {
                    quantum_image_recover(da, is, notices)
                }
                DataOperation::NoAction => false,
            };
        }
    }

    did_something
}

/// Mirror formatter stderr as NDMP log messages.
fn quantum_stderr(da: &mut DataAgent, notices: &mut VecDeque<Notice>) -> bool {
    let formatter = match da.formatter.as_mut() {
        Some(formatter) => formatter,
        None => return false,
    };
    let lines = formatter.take_error_lines();
    let did_something = !lines.is_empty();
    for line in lines {
        notices.push_back(Notice::new(
            AgentRole::Data,
            NoticeKind::Log {
                log_type: LogType::Normal,
                entry: line,
            },
        ));
    }
    did_something
}

/// Digest wrap-channel records.
fn quantum_wrap(da: &mut DataAgent, notices: &mut VecDeque<Notice>) -> bool {
    let formatter = match da.formatter.as_mut() {
        Some(formatter) => formatter,
        None => return false,
    };
    let lines = formatter.take_wrap_lines();
    let did_something = !lines.is_empty();
    for line in lines {
        wrap_in(da, &line, notices);
    }
    did_something
}

/// One wrap-protocol line: a keyword plus backslash-escaped `k=v`
/// fields.
fn wrap_in(da: &mut DataAgent, line: &str, notices: &mut VecDeque<Notice>) {
    let fields = split_fields(line);
    let mut fields = fields.iter();
    let keyword = match fields.next() {
        Some(kw) => kw.as_str(),
        None => return,
    };

    let mut path = None;
    let mut name = None;
    let mut value = None;
    let mut fstat = FileStat::default();
    let mut parent = None;
    for field in fields {
        let (key, val) = match field.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        match key {
            "path" => path = Some(val.to_string()),
            "name" => name = Some(val.to_string()),
            "value" => value = Some(val.to_string()),
            "node" => fstat.node = val.parse().ok(),
            "parent" => parent = val.parse().ok(),
            "size" => fstat.size = val.parse().ok(),
            "mode" => fstat.mode = u32::from_str_radix(val, 8).ok(),
            "uid" => fstat.uid = val.parse().ok(),
            "gid" => fstat.gid = val.parse().ok(),
            "mtime" => fstat.mtime = val.parse().ok(),
            "atime" => fstat.atime = val.parse().ok(),
            "ctime" => fstat.ctime = val.parse().ok(),
            "links" => fstat.links = val.parse().ok(),
            "fh_info" => fstat.fh_info = val.parse().ok(),
            "ftype" => {
                fstat.ftype = match val {
                    "dir" => FileType::Dir,
                    "reg" => FileType::Reg,
                    "slink" => FileType::Slink,
                    "fifo" => FileType::Fifo,
                    "sock" => FileType::Sock,
                    _ => FileType::Other,
                }
            }
            _ => {}
        }
    }

    match keyword {
        "FH_ADD_FILE" => {
            if !da.enable_hist {
                return;
            }
            if let Some(unix_path) = path {
                da.fhh.add_file(FhFile { unix_path, fstat }, notices);
            }
        }
        "FH_ADD_DIR" => {
            if !da.enable_hist {
                return;
            }
            if let (Some(unix_name), Some(node)) = (name, fstat.node) {
                da.fhh.add_dir(
                    FhDir {
                        unix_name,
                        parent: parent.unwrap_or(0),
                        node,
                    },
                    notices,
                );
            }
        }
        "FH_ADD_NODE" => {
            if !da.enable_hist {
                return;
            }
            da.fhh.add_node(FhNode { fstat }, notices);
        }
        "NDMP_ADD_ENV" => {
            if let (Some(name), Some(value)) = (name, value) {
                da.update_env(Pval::new(name, value));
            }
        }
        "NDMP_EST_BYTES_REMAIN" => {
            da.data_state.est_bytes_remain = fstat.size;
        }
        "NDMP_LOG" => {
            if let Some(entry) = value.or(name) {
                notices.push_back(Notice::new(
                    AgentRole::Data,
                    NoticeKind::Log {
                        log_type: LogType::Normal,
                        entry,
                    },
                ));
            }
        }
        other => log::debug!("unknown wrap record '{}'", other),
    }
}

fn quantum_image_backup(
    da: &mut DataAgent,
    is: &mut ImageStream,
    notices: &mut VecDeque<Notice>,
) -> bool {
    let mut did_something = false;

    let (fmt_eof, moved) = {
        let formatter = match da.formatter.as_mut() {
            Some(formatter) => formatter,
            None => return false,
        };
        let moved = move_bytes(&mut formatter.image_chan, &mut is.chan, usize::MAX);
        // the wrap and stderr pipes must drain to EOF too, or late
        // file-history records would be dropped at the halt
        let fmt_eof = formatter.image_chan.eof
            && formatter.image_chan.n_ready() == 0
            && formatter.wrap_chan.eof
            && formatter.error_chan.eof;
        (fmt_eof, moved)
    };
    if moved > 0 {
        da.data_state.bytes_processed += moved as u64;
        did_something = true;
    }

    if fmt_eof {
        if is.chan.n_ready() > 0 {
            // let the image stream drain before halting
            return did_something;
        }
        // formatter finished; judge it by its exit status
        let status = da
            .formatter
            .as_mut()
            .and_then(|formatter| formatter.poll_exit());
        match status {
            None => {} // pipes closed, process still winding down
            Some(0) => {
                data_halt(da, is, notices, DataHaltReason::Successful);
                did_something = true;
            }
            Some(code) => {
                log::error!("formatter exited with status {}", code);
                data_halt(da, is, notices, DataHaltReason::InternalError);
                did_something = true;
            }
        }
    }

    did_something
}

fn quantum_image_recover(
    da: &mut DataAgent,
    is: &mut ImageStream,
    notices: &mut VecDeque<Notice>,
) -> bool {
    let mut did_something = false;
    let mut discarded = 0u64;
    let mut passed = 0u64;

    loop {
        let mut reco = match da.recover.take() {
            Some(reco) => reco,
            None => return did_something,
        };
        let hint = da
            .nlist_tab
            .get(reco.current_entry())
            .and_then(|nl| nl.entry.fh_info);
        let step = reco.step(hint, discarded, passed);
        discarded = 0;
        passed = 0;

        let step = match step {
            Ok(step) => step,
            Err(_) => {
                da.recover = Some(reco);
                data_halt(da, is, notices, DataHaltReason::InternalError);
                return true;
            }
        };
        da.recover = Some(reco);

        match step {
            RecoverStep::SendDataRead { offset, length } => {
                da.data_state.read_offset = offset;
                da.data_state.read_length = length;
                notices.push_back(Notice::new(
                    AgentRole::Data,
                    NoticeKind::DataRead { offset, length },
                ));
                did_something = true;
            }

            RecoverStep::Discard(limit) => {
                let n = (is.chan.n_ready() as u64).min(limit) as usize;
                if n == 0 {
                    if stream_exhausted(is) {
                        finish_recover(da, is, notices);
                        return true;
                    }
                    return did_something;
                }
                is.chan.consume(n);
                discarded = n as u64;
                did_something = true;
            }

            RecoverStep::Pass(limit) => {
                let formatter = match da.formatter.as_mut() {
                    Some(formatter) => formatter,
                    None => return did_something,
                };
                let limit = limit.min(usize::MAX as u64) as usize;
                let n = move_bytes(&mut is.chan, &mut formatter.image_chan, limit);
                if n == 0 {
                    if stream_exhausted(is) {
                        finish_recover(da, is, notices);
                        return true;
                    }
                    return did_something;
                }
                da.data_state.bytes_processed += n as u64;
                passed = n as u64;
                did_something = true;
            }

            RecoverStep::Blocked => {
                // an entry just finished
                let done = da
                    .recover
                    .as_ref()
                    .map(|reco| reco.current_entry())
                    .unwrap_or(0);
                if done > 0 {
                    if let Some(nl) = da.nlist_tab.get_mut(done - 1) {
                        nl.result_err = NdmpError::NoErr;
                        nl.result_count = 1;
                    }
                }
            }

            RecoverStep::Done => {
                finish_recover(da, is, notices);
                return true;
            }
        }
    }
}

fn stream_exhausted(is: &ImageStream) -> bool {
    is.chan.eof && is.chan.n_ready() == 0
}

/// Close the formatter's stdin and halt once it exits.
fn finish_recover(da: &mut DataAgent, is: &mut ImageStream, notices: &mut VecDeque<Notice>) {
    if let Some(formatter) = da.formatter.as_mut() {
        // flush buffered bytes to the formatter before closing stdin
        while formatter.image_chan.n_ready() > 0 && !formatter.image_chan.error {
            let (fd, events) = match formatter.image_chan.poll_interest() {
                Some(interest) => interest,
                None => break,
            };
            let mut pfd = [nix::poll::PollFd::new(fd, events)];
            if nix::poll::poll(&mut pfd, 10_000).is_err() {
                break;
            }
            let revents = pfd[0].revents().unwrap_or(nix::poll::PollFlags::empty());
            formatter.image_chan.after_poll(revents);
        }
        formatter.image_chan.cleanup(); // EOF to the formatter
        match formatter.child.wait() {
            Ok(status) if status.success() => {
                data_halt(da, is, notices, DataHaltReason::Successful);
            }
            _ => {
                data_halt(da, is, notices, DataHaltReason::InternalError);
            }
        }
    } else {
        data_halt(da, is, notices, DataHaltReason::Successful);
    }
}

/// Copy buffered bytes between channels, bounded by space, readiness
/// and `limit`.
fn move_bytes(src: &mut Chan, dst: &mut Chan, limit: usize) -> usize {
    let n = src.n_ready().min(dst.n_avail()).min(limit);
    if n == 0 {
        return 0;
    }
    let bytes = src.peek()[..n].to_vec();
    dst.put(&bytes);
    src.consume(n);
    n
}

/// Split a wrap line into fields, honoring backslash escapes.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    cur.push(escaped);
                }
            }
            ' ' | '\t' => {
                if !cur.is_empty() {
                    fields.push(std::mem::take(&mut cur));
                }
            }
            _ => cur.push(c),
        }
    }
    if !cur.is_empty() {
        fields.push(cur);
    }
    fields
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_env_update_replaces() {
        let mut da = DataAgent::new();
        da.copy_environment(&[
            Pval::new("FILESYSTEM", "/src"),
            Pval::new("HIST", "y"),
        ])
        .unwrap();
        assert!(da.enable_hist);

        da.update_env(Pval::new("FILESYSTEM", "/other"));
        assert_eq!(da.find_env("FILESYSTEM"), Some("/other"));
        assert_eq!(da.env_tab.len(), 2);
    }

    #[test]
    fn test_wrap_fh_add_file() {
        let mut da = DataAgent::new();
        da.enable_hist = true;
        let mut notices = VecDeque::new();

        wrap_in(
            &mut da,
            "FH_ADD_FILE path=/etc/pass\\ wd node=42 size=1234 mode=644 fh_info=1048576",
            &mut notices,
        );
        da.fhh.flush(&mut notices);

        assert_eq!(notices.len(), 1);
        match &notices[0].kind {
            NoticeKind::FhAddFile(files) => {
                assert_eq!(files[0].unix_path, "/etc/pass wd");
                assert_eq!(files[0].fstat.node, Some(42));
                assert_eq!(files[0].fstat.size, Some(1234));
                assert_eq!(files[0].fstat.mode, Some(0o644));
                assert_eq!(files[0].fstat.fh_info, Some(1048576));
            }
            other => panic!("unexpected notice {:?}", other),
        }
    }

    #[test]
    fn test_wrap_env_update() {
        let mut da = DataAgent::new();
        let mut notices = VecDeque::new();
        wrap_in(&mut da, "NDMP_ADD_ENV name=LEVEL value=0", &mut notices);
        assert_eq!(da.find_env("LEVEL"), Some("0"));
        assert!(notices.is_empty());
    }

    #[test]
    fn test_bu_type_length_cap() {
        let mut da = DataAgent::new();
        assert!(da.set_bu_type("dump").is_ok());
        assert_eq!(
            da.set_bu_type(&"x".repeat(32)),
            Err(NdmpError::IllegalArgs)
        );
    }

    #[test]
    fn test_stop_purges() {
        let mut da = DataAgent::new();
        da.set_bu_type("tar").unwrap();
        da.copy_environment(&[Pval::new("HIST", "n")]).unwrap();
        da.data_state.state = DataState::Halted;
        da.data_stop();
        assert_eq!(da.data_state.state, DataState::Idle);
        assert!(da.env_tab.is_empty());
        assert!(da.bu_type.is_empty());
    }
}
