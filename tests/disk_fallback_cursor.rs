use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use nvwal::control::{CfConfigSnapshot, ControlFile};
use nvwal::fsyncer::Fsyncer;
use nvwal::mds::MdsEntry;
use nvwal::segment::SegmentPool;
use nvwal::state::AgentStateHandle;
use nvwal::LogCursor;
use tempfile::tempdir;

/// Once a segment is recycled out of NV residence, the cursor must fall back
/// to the disk copy and read the same bytes it would have from NV — the
/// fsyncer's on-disk file carries the same header-plus-data layout as the NV
/// mapping.
#[test]
fn reads_recycled_segment_from_disk_copy() {
    let nv_dir = tempdir().expect("nv tempdir");
    let disk_dir = tempdir().expect("disk tempdir");

    let pool = Arc::new(SegmentPool::create(nv_dir.path(), 64, 2).unwrap());
    let first = pool.activate_first_segment().unwrap(); // dsid 1 -> slot 0
    unsafe {
        first.data_mut().unwrap()[..16].copy_from_slice(&[0x7A; 16]);
    }
    first.written_bytes.store(16, Ordering::Release);

    let control_path = nv_dir.path().join("nvwal.cf");
    let cf = ControlFile::create(
        &control_path,
        &CfConfigSnapshot { segment_size: 64, nv_quota: 64 * 2, mds_page_size: 64, writer_count: 1, mds_num_files: 1 },
    )
    .unwrap();
    let fsyncer = Fsyncer::new(Arc::clone(&pool), disk_dir.path().to_path_buf(), Arc::new(Mutex::new(cf)), Arc::new(AgentStateHandle::new()));

    pool.advance_nv_segment().unwrap(); // dsid 2 -> slot 1, seals dsid 1
    fsyncer.run_once().unwrap(); // archives dsid 1 to disk_dir

    pool.advance_nv_segment().unwrap(); // dsid 3 -> slot 0, recycles dsid 1
    assert!(pool.pin_for_read(1).is_none(), "dsid 1 should no longer be NV-resident");

    let entries = vec![MdsEntry { epoch: 1, first_dsid: 1, first_offset: 0, last_dsid: 1, last_offset: 16, user_meta_0: 0, user_meta_1: 0 }];
    let mut cursor = LogCursor::open(&pool, disk_dir.path().to_path_buf(), 1, 2, 1, |_, _| Ok(entries.clone()), 2).unwrap();
    let (ptr, len) = cursor.current().unwrap();
    assert_eq!(len, 16);
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
    assert_eq!(bytes, &[0x7A; 16]);
    assert!(!cursor.next().unwrap());
}
