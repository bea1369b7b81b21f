//! Two-party LOCAL backup: one session hosts CONTROL, DATA and
//! TAPE; the image stream runs through the in-process channel.

mod util;

use ndmp_api_types::{Pval, LENGTH_INFINITY};
use ndmp_tape::set_loaded_tape;

use ndmp_agent::client_session;

#[test]
fn test_local_backup_end_to_end() {
    util::init_logging();
    let dir = util::create_testdir("local_backup");
    let drive_dir = dir.join("drive-0");
    set_loaded_tape(&drive_dir, Some("SCRATCH")).unwrap();

    // 40 KiB of known content, a record multiple
    let pattern: Vec<u8> = (0..40 * 1024u32).map(|i| (i % 251) as u8).collect();
    let pattern_path = dir.join("pattern.bin");
    std::fs::write(&pattern_path, &pattern).unwrap();

    let mut job = util::backup_job(&drive_dir, 4096);
    job.media_tab.store_media(None);
    job.env_tab = vec![
        Pval::new("FILESYSTEM", "/src"),
        Pval::new("HIST", "y"),
        Pval::new(
            "BACKUP_CMD",
            format!(
                "cat {}; printf 'FH_ADD_FILE path=/src/pattern.bin node=42 size={} fh_info=0\\n' >&3; \
                 printf 'NDMP_ADD_ENV name=DUMP_DATE value=20260801\\n' >&3",
                pattern_path.display(),
                pattern.len()
            ),
        ),
    ];

    let mut sess = util::sim_session(16 * 1024 * 1024);
    let finish = client_session(&mut sess, job).unwrap();
    assert_eq!(finish, 0, "operation should end OKAY");
}

#[test]
fn test_local_backup_results() {
    util::init_logging();
    let dir = util::create_testdir("local_backup_results");
    let drive_dir = dir.join("drive-0");
    set_loaded_tape(&drive_dir, Some("SCRATCH")).unwrap();

    let pattern: Vec<u8> = (0..16 * 1024u32).map(|i| (i % 17) as u8).collect();
    let pattern_path = dir.join("pattern.bin");
    std::fs::write(&pattern_path, &pattern).unwrap();

    let mut job = util::backup_job(&drive_dir, 4096);
    job.media_tab.store_media(None);
    job.env_tab = vec![
        Pval::new("HIST", "y"),
        Pval::new(
            "BACKUP_CMD",
            format!(
                "cat {}; printf 'FH_ADD_FILE path=/a node=1 size=100\\n' >&3; \
                 printf 'FH_ADD_DIR name=a parent=2 node=1\\n' >&3; \
                 printf 'NDMP_ADD_ENV name=RESULT value=ok\\n' >&3",
                pattern_path.display()
            ),
        ),
    ];

    // run the pieces by hand so the session survives for inspection
    let mut sess = util::sim_session(16 * 1024 * 1024);
    sess.initialize(ndmp_agent::RoleSet::all());
    if let Some(ca) = sess.control.as_mut() {
        ca.job = job;
    }
    sess.commission();
    ndmp_agent::control::connect_control_agent(&mut sess).unwrap();
    sess.conn_open = true;
    sess.conn_authorized = true;

    let finish = ndmp_agent::control::control_agent(&mut sess).unwrap();
    assert_eq!(finish, 0);

    let ca = sess.control.as_ref().unwrap();

    // byte accounting: the one media entry carries everything DATA
    // processed, rounded up to whole records
    assert_eq!(ca.job.bytes_written, pattern.len() as u64);
    let n_bytes: u64 = ca
        .job
        .media_tab
        .entries()
        .iter()
        .map(|me| match me.n_bytes {
            Some(n) if n != LENGTH_INFINITY => n,
            _ => 0,
        })
        .sum();
    assert_eq!(n_bytes, pattern.len() as u64);

    // every wrap record was forwarded exactly once
    assert_eq!(ca.n_file_entry, 1);
    assert_eq!(ca.n_dir_entry, 1);
    assert_eq!(ca.index_files[0].unix_path, "/a");
    assert_eq!(ca.index_dirs[0].unix_name, "a");

    // the formatter's environment updates came back via DATA_GET_ENV
    assert!(ca
        .job
        .result_env_tab
        .iter()
        .any(|pv| pv.name == "RESULT" && pv.value == "ok"));

    sess.destroy();
}
