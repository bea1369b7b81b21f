//! Direct-access recovery: back up a known pattern, then recover a
//! windowed run selected by an nlist fh_info hint. The DATA agent
//! issues NOTIFY_DATA_READ, CONTROL answers with MOVER_READ, and the
//! mover seeks the tape to the wanted records.

mod util;

use ndmp_api_types::{NlistEntry, Pval};
use ndmp_tape::set_loaded_tape;

use ndmp_agent::client_session;
use ndmp_agent::control::JobOperation;

const RECORD_SIZE: u32 = 4096;
const PATTERN_LEN: usize = 96 * 1024;
const SEEK_OFFSET: u64 = 8192;
const FETCH_LEN: usize = 64 * 1024;

#[test]
fn test_backup_then_direct_recover() {
    util::init_logging();
    let dir = util::create_testdir("restore_seek");
    let drive_dir = dir.join("drive-0");
    set_loaded_tape(&drive_dir, Some("SCRATCH")).unwrap();

    let pattern: Vec<u8> = (0..PATTERN_LEN as u32)
        .map(|i| (i.wrapping_mul(31) % 253) as u8)
        .collect();
    let pattern_path = dir.join("pattern.bin");
    std::fs::write(&pattern_path, &pattern).unwrap();

    // phase one: put the pattern on tape
    let mut job = util::backup_job(&drive_dir, RECORD_SIZE);
    job.media_tab.store_media(None);
    job.env_tab = vec![
        Pval::new("HIST", "n"),
        Pval::new("BACKUP_CMD", format!("cat {}", pattern_path.display())),
    ];
    let mut sess = util::sim_session(16 * 1024 * 1024);
    let finish = client_session(&mut sess, job).unwrap();
    assert_eq!(finish, 0);

    // phase two: recover one run by direct access
    let restored_path = dir.join("restored.bin");
    let mut job = util::backup_job(&drive_dir, RECORD_SIZE);
    job.operation = JobOperation::Extract;
    job.media_tab.store_media(None);
    job.nlist_tab = vec![NlistEntry {
        original_path: "/src/pattern.bin".into(),
        destination_path: "/restore/pattern.bin".into(),
        node: Some(42),
        fh_info: Some(SEEK_OFFSET),
        ..Default::default()
    }];
    job.env_tab = vec![
        Pval::new("HIST", "n"),
        Pval::new("RECOVER_CMD", format!("cat > {}", restored_path.display())),
    ];

    let mut sess = util::sim_session(16 * 1024 * 1024);
    let finish = client_session(&mut sess, job).unwrap();
    assert!(finish == 0 || finish == 1, "finish was {}", finish);

    // the formatter received exactly the wanted run
    let restored = std::fs::read(&restored_path).unwrap();
    assert_eq!(restored.len(), FETCH_LEN);
    let want = &pattern[SEEK_OFFSET as usize..SEEK_OFFSET as usize + FETCH_LEN];
    assert_eq!(&restored[..], want);
}
