use serde::{Deserialize, Serialize};

/// Name/value pair used for backup environments and address
/// environments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pval {
    pub name: String,
    pub value: String,
}

impl Pval {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Pval {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One entry of a recovery name list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NlistEntry {
    pub original_path: String,
    pub destination_path: String,
    pub name: String,
    pub other_name: String,
    pub node: Option<u64>,
    pub fh_info: Option<u64>,
}

/// Unix file attributes as carried in file history records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub ftype: FileType,
    pub mtime: Option<u32>,
    pub atime: Option<u32>,
    pub ctime: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub links: Option<u32>,
    pub node: Option<u64>,
    pub fh_info: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Dir,
    Fifo,
    Cspec,
    Bspec,
    Reg,
    Slink,
    Sock,
    Registry,
    Other,
}

impl Default for FileType {
    fn default() -> Self {
        FileType::Other
    }
}

/// `FH_ADD_FILE` record payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhFile {
    pub unix_path: String,
    pub fstat: FileStat,
}

/// `FH_ADD_DIR` record payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhDir {
    pub unix_name: String,
    pub parent: u64,
    pub node: u64,
}

/// `FH_ADD_NODE` record payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhNode {
    pub fstat: FileStat,
}
