//! File history heap.
//!
//! Entries accumulate into a typed batch (one message kind at a
//! time). When the next entry would overflow the emission buffer the
//! batch is flushed to CONTROL as a single FH_ADD_* notification.
//! Flushing also happens at end of backup and at teardown, so every
//! record is forwarded exactly once.

use std::collections::VecDeque;

use ndmp_api_types::{FhDir, FhFile, FhNode};

use crate::notify::{AgentRole, Notice, NoticeKind};

/// Emission buffer budget per batch.
const FHH_BUF_LEN: usize = 8 * 1024;

/// Fixed per-entry overhead, the encoded fstat portion.
const ENTRY_FIXED_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FhBatchKind {
    File,
    Dir,
    Node,
}

pub struct FhHeap {
    kind: Option<FhBatchKind>,
    files: Vec<FhFile>,
    dirs: Vec<FhDir>,
    nodes: Vec<FhNode>,
    used: usize,
}

impl FhHeap {
    pub fn new() -> Self {
        FhHeap {
            kind: None,
            files: Vec::new(),
            dirs: Vec::new(),
            nodes: Vec::new(),
            used: 0,
        }
    }

    fn prepare(&mut self, kind: FhBatchKind, item_size: usize, notices: &mut VecDeque<Notice>) {
        if self.kind != Some(kind) || self.used + item_size > FHH_BUF_LEN {
            self.flush(notices);
            self.kind = Some(kind);
        }
        self.used += item_size;
    }

    pub fn add_file(&mut self, file: FhFile, notices: &mut VecDeque<Notice>) {
        let item_size = ENTRY_FIXED_SIZE + file.unix_path.len() + 1;
        self.prepare(FhBatchKind::File, item_size, notices);
        self.files.push(file);
    }

    pub fn add_dir(&mut self, dir: FhDir, notices: &mut VecDeque<Notice>) {
        let item_size = ENTRY_FIXED_SIZE + dir.unix_name.len() + 1;
        self.prepare(FhBatchKind::Dir, item_size, notices);
        self.dirs.push(dir);
    }

    pub fn add_node(&mut self, node: FhNode, notices: &mut VecDeque<Notice>) {
        self.prepare(FhBatchKind::Node, ENTRY_FIXED_SIZE, notices);
        self.nodes.push(node);
    }

    /// Emit the current batch, if any.
    pub fn flush(&mut self, notices: &mut VecDeque<Notice>) {
        match self.kind.take() {
            None => {}
            Some(FhBatchKind::File) => {
                if !self.files.is_empty() {
                    let batch = std::mem::take(&mut self.files);
                    notices.push_back(Notice::new(AgentRole::Data, NoticeKind::FhAddFile(batch)));
                }
            }
            Some(FhBatchKind::Dir) => {
                if !self.dirs.is_empty() {
                    let batch = std::mem::take(&mut self.dirs);
                    notices.push_back(Notice::new(AgentRole::Data, NoticeKind::FhAddDir(batch)));
                }
            }
            Some(FhBatchKind::Node) => {
                if !self.nodes.is_empty() {
                    let batch = std::mem::take(&mut self.nodes);
                    notices.push_back(Notice::new(AgentRole::Data, NoticeKind::FhAddNode(batch)));
                }
            }
        }
        self.used = 0;
    }
}

impl Default for FhHeap {
    fn default() -> Self {
        FhHeap::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndmp_api_types::FileStat;

    fn file(path: &str) -> FhFile {
        FhFile {
            unix_path: path.to_string(),
            fstat: FileStat::default(),
        }
    }

    #[test]
    fn test_kind_change_flushes() {
        let mut fhh = FhHeap::new();
        let mut notices = VecDeque::new();

        fhh.add_file(file("/etc/passwd"), &mut notices);
        fhh.add_file(file("/etc/group"), &mut notices);
        assert!(notices.is_empty());

        fhh.add_dir(
            FhDir {
                unix_name: "etc".into(),
                parent: 2,
                node: 100,
            },
            &mut notices,
        );
        assert_eq!(notices.len(), 1);
        match &notices[0].kind {
            NoticeKind::FhAddFile(files) => assert_eq!(files.len(), 2),
            other => panic!("unexpected notice {:?}", other),
        }

        fhh.flush(&mut notices);
        assert_eq!(notices.len(), 2);
    }

    #[test]
    fn test_overflow_flushes() {
        let mut fhh = FhHeap::new();
        let mut notices = VecDeque::new();

        // each entry is 64 + path + 1 bytes; fill past 8 KiB
        let path = "x".repeat(191); // 256 bytes per entry
        for _ in 0..40 {
            fhh.add_file(file(&path), &mut notices);
        }
        assert_eq!(notices.len(), 1);
        match &notices[0].kind {
            NoticeKind::FhAddFile(files) => assert_eq!(files.len(), 32),
            other => panic!("unexpected notice {:?}", other),
        }

        fhh.flush(&mut notices);
        assert_eq!(notices.len(), 2);
        match &notices[1].kind {
            NoticeKind::FhAddFile(files) => assert_eq!(files.len(), 8),
            other => panic!("unexpected notice {:?}", other),
        }
    }

    #[test]
    fn test_empty_flush_is_silent() {
        let mut fhh = FhHeap::new();
        let mut notices = VecDeque::new();
        fhh.flush(&mut notices);
        assert!(notices.is_empty());
    }
}
