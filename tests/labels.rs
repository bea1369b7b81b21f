//! Label lifecycle: INIT_LABELS writes a fresh label record,
//! LIST_LABELS rewinds, reads the first 512 bytes back and records
//! the label.

mod util;

use ndmp_tape::set_loaded_tape;

use ndmp_agent::client_session;
use ndmp_agent::control::JobOperation;

#[test]
fn test_init_then_list_labels() {
    util::init_logging();
    let dir = util::create_testdir("labels");
    let drive_dir = dir.join("drive-0");
    set_loaded_tape(&drive_dir, Some("BLANK")).unwrap();

    // write "TAPE01" onto the freshly mounted blank
    let mut job = util::backup_job(&drive_dir, 4096);
    job.operation = JobOperation::InitLabels;
    let ix = job.media_tab.store_media(None).unwrap();
    job.media_tab.entry_mut(ix).unwrap().label = Some("TAPE01".into());

    let mut sess = util::sim_session(16 * 1024 * 1024);
    let finish = client_session(&mut sess, job).unwrap();
    assert_eq!(finish, 0);

    // the raw record on tape has the documented shape
    {
        let mut drive = ndmp_tape::TapeSimulator::open(&drive_dir, false, 16 * 1024 * 1024)
            .unwrap();
        let mut buf = [0u8; 1024];
        use ndmp_tape::TapeDevice;
        let n = drive.read(&mut buf).unwrap();
        assert_eq!(n, 512);
        let text = String::from_utf8_lossy(&buf[..512]);
        assert!(text.starts_with("##ndmjob -m TAPE01\n"));
        assert_eq!(buf[63], b'\n');
        assert_eq!(buf[64], b'#');
    }

    // read it back through LIST_LABELS
    let mut job = util::backup_job(&drive_dir, 4096);
    job.operation = JobOperation::ListLabels;
    job.media_tab.store_media(None);

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
    assert_eq!(
        ca.job.media_tab.entries()[0].label.as_deref(),
        Some("TAPE01")
    );
    sess.destroy();
}
