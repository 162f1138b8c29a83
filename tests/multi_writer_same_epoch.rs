use std::time::Duration;

use nvwal::{InitMode, NvWalConfig};
use tempfile::tempdir;

fn tiny_config(nv: &std::path::Path, disk: &std::path::Path) -> NvWalConfig {
    let mut cfg = NvWalConfig::new(nv, disk);
    cfg.segment_size = 4096;
    cfg.nv_quota = 4096 * 4;
    cfg.mds_page_size = 4096;
    cfg.writer_buffer_size = 4096;
    cfg.writer_count = 2;
    cfg
}

#[test]
fn two_writers_same_epoch_concatenate_contiguously() {
    let nv = tempdir().expect("nv tempdir");
    let disk = tempdir().expect("disk tempdir");
    let wal = nvwal::NvWal::init(tiny_config(nv.path(), disk.path()), InitMode::CreateIfNotExists).expect("init");

    let w0 = wal.register_writer(0).expect("writer 0");
    let w1 = wal.register_writer(1).expect("writer 1");
    w0.reserve(32).unwrap().fill(0xAA);
    w0.on_wal_write(32, 5, 0, 0).unwrap();
    w1.reserve(32).unwrap().fill(0xBB);
    w1.on_wal_write(32, 5, 0, 0).unwrap();

    wal.advance_next_epoch(6).unwrap();
    wal.advance_stable_epoch(5).unwrap();
    wal.wait_until_durable(5, Duration::from_secs(5)).unwrap();

    let mut cursor = wal.open_log_cursor(5, 6).expect("open cursor");
    let mut seen = Vec::new();
    loop {
        let (ptr, len) = cursor.current().unwrap();
        seen.extend_from_slice(unsafe { std::slice::from_raw_parts(ptr, len) });
        if !cursor.next().unwrap() {
            break;
        }
    }
    wal.close_log_cursor(cursor);

    assert_eq!(seen.len(), 64);
    let count_aa = seen.iter().filter(|&&b| b == 0xAA).count();
    let count_bb = seen.iter().filter(|&&b| b == 0xBB).count();
    assert_eq!(count_aa, 32);
    assert_eq!(count_bb, 32);
    // The two halves are contiguous, not interleaved byte-by-byte.
    assert!(seen.windows(2).filter(|w| w[0] != w[1]).count() <= 1);

    wal.uninit().unwrap();
}
