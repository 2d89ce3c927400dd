#[cfg(test)]
mod tests {
    use crate::wal::{Record, Wal, WalOptions};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_options(buffer_size: usize, file_size_limit: u64) -> WalOptions {
        WalOptions {
            buffer_size,
            file_size_limit,
            clean_interval: Duration::from_secs(3600),
            clean_threshold: 4,
        }
    }

    fn put_records(tranc_id: u64, count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Record::put(
                    tranc_id,
                    Bytes::from(format!("{tranc_id}-key-{i}")),
                    Bytes::from(format!("{tranc_id}-value-{i}")),
                )
            })
            .collect()
    }

    #[test]
    fn test_buffer_threshold() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(
            tmp.path(),
            test_options(10, u64::MAX),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();

        // 8 records stay buffered below the limit of 10.
        wal.log(&put_records(1, 8), false).unwrap();
        assert_eq!(wal.buffered_records(), 8);

        // 12 more push past the limit and drain everything.
        wal.log(&put_records(2, 12), false).unwrap();
        assert_eq!(wal.buffered_records(), 0);

        wal.flush().unwrap();
        assert_eq!(wal.buffered_records(), 0);
        wal.close().unwrap();
    }

    #[test]
    fn test_force_flush_drains_immediately() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(
            tmp.path(),
            test_options(100, u64::MAX),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();

        wal.log(&put_records(1, 3), true).unwrap();
        assert_eq!(wal.buffered_records(), 0);

        let recovery = Wal::recover(tmp.path(), 0).unwrap();
        assert_eq!(recovery.max_tranc_id_seen, 1);
        wal.close().unwrap();
    }

    #[test]
    fn test_unflushed_buffer_is_not_durable() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(
            tmp.path(),
            test_options(100, u64::MAX),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();

        wal.log(&put_records(5, 2), false).unwrap();
        assert_eq!(wal.buffered_records(), 2);

        // Nothing has been drained yet; the directory scan sees no
        // records.
        let recovery = Wal::recover(tmp.path(), 0).unwrap();
        assert_eq!(recovery.max_tranc_id_seen, 0);
        wal.close().unwrap();
    }

    #[test]
    fn test_segment_rotation() {
        let tmp = TempDir::new().unwrap();
        // A tiny size limit forces rotation on every drain.
        let wal = Wal::open(
            tmp.path(),
            test_options(1, 64),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();
        assert_eq!(wal.active_seq(), 0);

        wal.log(&put_records(1, 4), true).unwrap();
        assert!(wal.active_seq() >= 1);

        wal.log(&put_records(2, 4), true).unwrap();
        let seq_after = wal.active_seq();
        assert!(seq_after >= 2);

        // All records remain recoverable across segments.
        let recovery = Wal::recover(tmp.path(), 0).unwrap();
        assert_eq!(recovery.max_tranc_id_seen, 2);
        wal.close().unwrap();
    }

    #[test]
    fn test_reopen_resumes_highest_segment() {
        let tmp = TempDir::new().unwrap();
        {
            let wal = Wal::open(
                tmp.path(),
                test_options(1, 64),
                Arc::new(AtomicU64::new(0)),
            )
            .unwrap();
            wal.log(&put_records(1, 4), true).unwrap();
            wal.close().unwrap();
        }

        let wal = Wal::open(
            tmp.path(),
            test_options(1, u64::MAX),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();
        assert!(wal.active_seq() >= 1);
        wal.close().unwrap();
    }

    #[test]
    fn test_reset_discards_segments() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(
            tmp.path(),
            test_options(1, 64),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();
        wal.log(&put_records(1, 8), true).unwrap();

        wal.reset().unwrap();
        assert_eq!(wal.active_seq(), 0);
        assert_eq!(wal.buffered_records(), 0);

        let recovery = Wal::recover(tmp.path(), 0).unwrap();
        assert!(recovery.committed.is_empty());
        assert_eq!(recovery.max_tranc_id_seen, 0);
        wal.close().unwrap();
    }
}
