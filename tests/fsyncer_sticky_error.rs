use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use nvwal::config::InitMode;
use nvwal::control::{CfConfigSnapshot, ControlFile};
use nvwal::epoch::SharedEpochs;
use nvwal::flusher::Flusher;
use nvwal::fsyncer::Fsyncer;
use nvwal::mds::MdsCore;
use nvwal::segment::{segment_filename, SegmentPool};
use nvwal::state::AgentStateHandle;
use nvwal::writer::WriterContext;
use tempfile::tempdir;

/// A disk write failure on one segment sets a sticky `fsync_error` on it and
/// does not block the fsyncer from archiving later segments. It also must
/// not halt durability for epochs whose bytes never touch that segment, but
/// it does stop the flusher from durably advancing past an epoch whose bytes
/// do live there.
#[test]
fn disk_failure_on_one_segment_does_not_halt_unaffected_epochs() {
    let nv_dir = tempdir().expect("nv tempdir");
    let disk_dir = tempdir().expect("disk tempdir");

    let pool = Arc::new(SegmentPool::create(nv_dir.path(), 512, 4).unwrap());
    let writers = vec![Arc::new(WriterContext::new(0, 4096))];
    writers[0].reserve(64).unwrap().fill(0x11);
    writers[0].on_wal_write(64, 1, 0, 0).unwrap();

    let (mds, _) = MdsCore::init(nv_dir.path(), InitMode::CreateIfNotExists, 512, 1, 16).unwrap();
    let mds = Arc::new(Mutex::new(mds));
    let cf = ControlFile::create(
        &nv_dir.path().join("nvwal.cf"),
        &CfConfigSnapshot { segment_size: 512, nv_quota: 512 * 4, mds_page_size: 512, writer_count: 1, mds_num_files: 1 },
    )
    .unwrap();
    let cf = Arc::new(Mutex::new(cf));
    let epochs = Arc::new(SharedEpochs::new(0, 1, 2));
    let flusher_state = Arc::new(AgentStateHandle::new());

    let flusher = Flusher::new(writers.clone(), Arc::clone(&pool), Arc::clone(&mds), Arc::clone(&cf), Arc::clone(&epochs), flusher_state);
    pool.activate_first_segment().unwrap();
    flusher.tick().unwrap(); // drains epoch 1 into dsid 1, durably advances DE to 1
    assert_eq!(epochs.durable_epoch(), 1);
    pool.advance_nv_segment().unwrap(); // seals dsid 1 (fsync_requested), activates dsid 2

    // Pre-create a directory where the fsyncer's segment file should land,
    // so File::create fails.
    std::fs::create_dir(disk_dir.path().join(segment_filename(1))).unwrap();

    let fsyncer_state = Arc::new(AgentStateHandle::new());
    let fsyncer = Fsyncer::new(Arc::clone(&pool), disk_dir.path().to_path_buf(), Arc::clone(&cf), fsyncer_state);
    fsyncer.run_once().unwrap();
    assert!(pool.has_fsync_error());

    // Another epoch's worth of bytes lands entirely on the now-active
    // segment 2, which never touches the errored segment 1.
    writers[0].reserve(32).unwrap().fill(0x22);
    writers[0].on_wal_write(32, 2, 0, 0).unwrap();
    epochs.set_next_epoch(3);
    epochs.set_stable_epoch(2);
    flusher.tick().unwrap();

    // DE must advance to 2: epoch 2's bytes never touch segment 1.
    assert_eq!(epochs.durable_epoch(), 2);
}

/// When an epoch's own byte span straddles the errored segment, durability
/// must still halt for it, even though other segments are healthy.
#[test]
fn disk_failure_blocks_epoch_whose_span_includes_it() {
    let nv_dir = tempdir().expect("nv tempdir");

    let pool = Arc::new(SegmentPool::create(nv_dir.path(), 512, 4).unwrap());
    let writers = vec![Arc::new(WriterContext::new(0, 4096))];

    let (mds, _) = MdsCore::init(nv_dir.path(), InitMode::CreateIfNotExists, 512, 1, 16).unwrap();
    let mds = Arc::new(Mutex::new(mds));
    let cf = ControlFile::create(
        &nv_dir.path().join("nvwal.cf"),
        &CfConfigSnapshot { segment_size: 512, nv_quota: 512 * 4, mds_page_size: 512, writer_count: 1, mds_num_files: 1 },
    )
    .unwrap();
    let cf = Arc::new(Mutex::new(cf));
    let epochs = Arc::new(SharedEpochs::new(0, 1, 2));
    let flusher_state = Arc::new(AgentStateHandle::new());
    let flusher = Flusher::new(writers.clone(), Arc::clone(&pool), Arc::clone(&mds), Arc::clone(&cf), Arc::clone(&epochs), flusher_state);

    let first = pool.activate_first_segment().unwrap();
    // A fsync failure already known for dsid 1, discovered before this
    // epoch's bytes (which straddle dsid 1 and dsid 2) become durable.
    first.fsync_error.store(1, Ordering::Release);

    // 600 bytes under one epoch overflows the 512-byte segment, so the
    // flusher rolls from dsid 1 into dsid 2 mid-epoch.
    writers[0].reserve(600).unwrap().fill(0x33);
    writers[0].on_wal_write(600, 1, 0, 0).unwrap();

    flusher.tick().unwrap();

    assert_eq!(epochs.durable_epoch(), 0, "epoch spans the errored segment, so DE must not advance");
}
