//! Multi-volume backup through the changer simulator: fixed-size
//! windows force EOW pauses and tape changes; the final media table
//! carries the split byte counts and cumulative offsets.

mod util;

use ndmp_api_types::Pval;
use ndmp_tape::SIM_SLOT_BASE;

const RECORD_SIZE: u32 = 4096;
const WINDOW: u64 = 4 * RECORD_SIZE as u64; // 16 KiB per tape
const TOTAL: usize = 40 * 1024; // 2 full windows + 8 KiB tail

#[test]
fn test_multi_volume_backup() {
    util::init_logging();
    let dir = util::create_testdir("multi_volume");
    let changer_dir = dir.join("library");

    // three scratch tapes in the first three slots
    {
        let mut changer = ndmp_tape::ChangerSimulator::open(&changer_dir, 4, 1).unwrap();
        changer.load_slot(0, "VOL1").unwrap();
        changer.load_slot(1, "VOL2").unwrap();
        changer.load_slot(2, "VOL3").unwrap();
    }

    let pattern: Vec<u8> = (0..TOTAL as u32).map(|i| (i % 239) as u8).collect();
    let pattern_path = dir.join("pattern.bin");
    std::fs::write(&pattern_path, &pattern).unwrap();

    let drive_dir = changer_dir.join("drive-0");
    let mut job = util::backup_job(&drive_dir, RECORD_SIZE);
    job.robot_agent = ndmp_agent::control::job::AgentSpec::Resident;
    job.have_robot = true;
    job.robot_device = changer_dir.to_string_lossy().into_owned();
    job.env_tab = vec![
        Pval::new("HIST", "n"),
        Pval::new("BACKUP_CMD", format!("cat {}", pattern_path.display())),
    ];

    // each media entry offers one window worth of bytes
    for slot in 0..3u16 {
        let ix = job.media_tab.store_media(Some(SIM_SLOT_BASE + slot)).unwrap();
        let me = job.media_tab.entry_mut(ix).unwrap();
        me.n_bytes = Some(WINDOW);
        me.file_mark_offset = Some(0);
    }

    // run by hand so the session stays inspectable afterwards
    let mut sess = util::sim_session(16 * 1024 * 1024);
    sess.cbs.robot_ops = Some(Box::new(util::SimRobot::new(4, 1)));
    sess.initialize(ndmp_agent::RoleSet::all());
    if let Some(ca) = sess.control.as_mut() {
        ca.job = job;
    }
    sess.commission();
    ndmp_agent::control::connect_control_agent(&mut sess).unwrap();
    sess.conn_open = true;
    sess.conn_authorized = true;
    let finish = ndmp_agent::control::control_agent(&mut sess).unwrap();
    assert_eq!(finish, 0, "operation should end OKAY");

    let ca = sess.control.as_ref().unwrap();
    let entries = ca.job.media_tab.entries();
    assert_eq!(entries.len(), 3);

    // n_bytes {16K, 16K, 8K}, begin_offset {0, 16K, 32K}
    assert_eq!(entries[0].n_bytes, Some(WINDOW));
    assert_eq!(entries[1].n_bytes, Some(WINDOW));
    assert_eq!(entries[2].n_bytes, Some(TOTAL as u64 - 2 * WINDOW));
    assert_eq!(entries[0].begin_offset, 0);
    assert_eq!(entries[1].begin_offset, WINDOW);
    assert_eq!(entries[2].begin_offset, 2 * WINDOW);
    assert_eq!(entries[2].end_offset, TOTAL as u64);

    // the byte accounting law: sum of media bytes equals what DATA
    // reported at backup end
    let total: u64 = entries.iter().filter_map(|me| me.n_bytes).sum();
    assert_eq!(total, ca.job.bytes_written);

    // every tape went through the drive and back to its slot
    for me in entries {
        assert!(me.flags.contains(ndmp_agent::control::MediaFlags::MEDIA_USED));
        assert!(me.flags.contains(ndmp_agent::control::MediaFlags::MEDIA_WRITTEN));
    }

    sess.destroy();

    // all three tapes are back in their slots
    let mut changer = ndmp_tape::ChangerSimulator::open(&changer_dir, 4, 1).unwrap();
    let request = ndmp_api_types::ExecuteCdbRequest {
        data_dir: ndmp_api_types::CdbDataDir::In,
        datain_len: 64 * 1024,
        cdb: ndmp_tape::smc::read_element_status_cdb(0, 100, 64 * 1024),
        ..Default::default()
    };
    let reply = changer.execute_cdb(&request);
    let list = ndmp_tape::smc::decode_element_status(&reply.datain).unwrap();
    let full_slots = list
        .iter()
        .filter(|d| d.element_type == ndmp_tape::smc::ElementType::Storage && d.full)
        .count();
    assert_eq!(full_slots, 3);
}
