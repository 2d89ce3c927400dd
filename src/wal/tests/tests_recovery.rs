#[cfg(test)]
mod tests {
    use crate::wal::{OpType, Record, Wal, WalOptions, clean_segments};
    use bytes::Bytes;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_options() -> WalOptions {
        WalOptions {
            buffer_size: 4,
            file_size_limit: u64::MAX,
            clean_interval: Duration::from_secs(3600),
            clean_threshold: 1,
        }
    }

    fn committed_group(tranc_id: u64, keys: &[&str]) -> Vec<Record> {
        let mut records = vec![Record::create(tranc_id)];
        for key in keys {
            records.push(Record::put(
                tranc_id,
                Bytes::from(key.to_string()),
                Bytes::from(format!("value-{key}")),
            ));
        }
        records.push(Record::commit(tranc_id));
        records
    }

    #[test]
    fn test_recover_groups_by_transaction() {
        let tmp = TempDir::new().unwrap();
        {
            let wal = Wal::open(tmp.path(), test_options(), Arc::new(AtomicU64::new(0))).unwrap();
            wal.log(&committed_group(1, &["a", "b"]), false).unwrap();
            wal.log(&committed_group(2, &["c"]), false).unwrap();
            wal.flush().unwrap();
            wal.close().unwrap();
        }

        let recovery = Wal::recover(tmp.path(), 0).unwrap();
        assert_eq!(recovery.committed.len(), 2);
        assert_eq!(recovery.max_tranc_id_seen, 2);

        let group1 = &recovery.committed[&1];
        assert_eq!(group1.len(), 4);
        assert_eq!(group1.first().unwrap().op, OpType::Create);
        assert_eq!(group1.last().unwrap().op, OpType::Commit);
    }

    #[test]
    fn test_rolled_back_group_is_discarded() {
        let tmp = TempDir::new().unwrap();
        {
            let wal = Wal::open(tmp.path(), test_options(), Arc::new(AtomicU64::new(0))).unwrap();
            wal.log(&committed_group(1, &["a"]), false).unwrap();
            wal.log(
                &[
                    Record::create(2),
                    Record::put(2, Bytes::from_static(b"x"), Bytes::from_static(b"y")),
                    Record::rollback(2),
                ],
                false,
            )
            .unwrap();
            wal.flush().unwrap();
            wal.close().unwrap();
        }

        let recovery = Wal::recover(tmp.path(), 0).unwrap();
        assert_eq!(recovery.committed.len(), 1);
        assert!(recovery.committed.contains_key(&1));
        // The rolled-back id is still observed for allocator resumption.
        assert_eq!(recovery.max_tranc_id_seen, 2);
    }

    #[test]
    fn test_unterminated_group_is_discarded() {
        let tmp = TempDir::new().unwrap();
        {
            let wal = Wal::open(tmp.path(), test_options(), Arc::new(AtomicU64::new(0))).unwrap();
            wal.log(&committed_group(3, &["kept"]), false).unwrap();
            // An abandoned context: records but no COMMIT.
            wal.log(
                &[
                    Record::create(4),
                    Record::put(4, Bytes::from_static(b"lost"), Bytes::from_static(b"v")),
                ],
                false,
            )
            .unwrap();
            wal.flush().unwrap();
            wal.close().unwrap();
        }

        let recovery = Wal::recover(tmp.path(), 0).unwrap();
        assert_eq!(recovery.committed.len(), 1);
        assert!(recovery.committed.contains_key(&3));
        assert_eq!(recovery.max_tranc_id_seen, 4);
    }

    #[test]
    fn test_durable_watermark_skips_flushed_groups() {
        let tmp = TempDir::new().unwrap();
        {
            let wal = Wal::open(tmp.path(), test_options(), Arc::new(AtomicU64::new(0))).unwrap();
            wal.log(&committed_group(1, &["a"]), false).unwrap();
            wal.log(&committed_group(2, &["b"]), false).unwrap();
            wal.log(&committed_group(3, &["c"]), false).unwrap();
            wal.flush().unwrap();
            wal.close().unwrap();
        }

        let recovery = Wal::recover(tmp.path(), 2).unwrap();
        assert_eq!(recovery.committed.len(), 1);
        assert!(recovery.committed.contains_key(&3));
        assert_eq!(recovery.max_tranc_id_seen, 3);
    }

    #[test]
    fn test_corrupt_tail_keeps_parsed_records() {
        let tmp = TempDir::new().unwrap();
        {
            let wal = Wal::open(tmp.path(), test_options(), Arc::new(AtomicU64::new(0))).unwrap();
            wal.log(&committed_group(1, &["a"]), false).unwrap();
            wal.log(&committed_group(2, &["b"]), false).unwrap();
            wal.flush().unwrap();
            wal.close().unwrap();
        }

        // Append garbage to the active segment, simulating a torn
        // write at crash time.
        let segment = tmp.path().join("wal.0.log");
        let mut bytes = fs::read(&segment).unwrap();
        bytes.extend_from_slice(&[0xDE, 0xAD, 0xBE]);
        fs::write(&segment, bytes).unwrap();

        let recovery = Wal::recover(tmp.path(), 0).unwrap();
        assert_eq!(recovery.committed.len(), 2);
    }

    #[test]
    fn test_cleaner_deletes_only_durable_sealed_segments() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(
            tmp.path(),
            WalOptions {
                buffer_size: 1,
                file_size_limit: 1, // rotate after every drain
                clean_interval: Duration::from_secs(3600),
                clean_threshold: 1,
            },
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();

        wal.log(&committed_group(1, &["a"]), true).unwrap();
        wal.log(&committed_group(2, &["b"]), true).unwrap();
        wal.log(&committed_group(3, &["c"]), true).unwrap();
        let active = wal.active_seq();
        assert!(active >= 3);

        // Watermark 1: only the first sealed segment qualifies.
        let removed = clean_segments(tmp.path(), active, 1, 1).unwrap();
        assert_eq!(removed, 1);

        // Groups 2 and 3 must survive the clean.
        let recovery = Wal::recover(tmp.path(), 0).unwrap();
        assert_eq!(recovery.committed.len(), 2);
        assert!(recovery.committed.contains_key(&2));
        assert!(recovery.committed.contains_key(&3));
        wal.close().unwrap();
    }

    #[test]
    fn test_cleaner_respects_threshold() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(
            tmp.path(),
            WalOptions {
                buffer_size: 1,
                file_size_limit: 1,
                clean_interval: Duration::from_secs(3600),
                clean_threshold: 4,
            },
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();

        wal.log(&committed_group(1, &["a"]), true).unwrap();
        wal.log(&committed_group(2, &["b"]), true).unwrap();
        let active = wal.active_seq();

        // Two reclaimable segments are below the threshold of four.
        let removed = clean_segments(tmp.path(), active, u64::MAX, 4).unwrap();
        assert_eq!(removed, 0);
        wal.close().unwrap();
    }
}
