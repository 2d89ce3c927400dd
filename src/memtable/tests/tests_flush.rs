#[cfg(test)]
mod tests {
    use crate::memtable::MemTable;
    use crate::sstable::{SstBuilder, new_block_cache};
    use tempfile::TempDir;

    #[test]
    fn test_flush_last_pops_oldest_table() {
        let tmp = TempDir::new().unwrap();
        let cache = new_block_cache(64);
        let memtable = MemTable::new(1 << 20);

        memtable.put(b"old", b"1", 1).unwrap();
        memtable.frozen_cur_table().unwrap();
        memtable.put(b"new", b"2", 2).unwrap();
        memtable.frozen_cur_table().unwrap();
        assert_eq!(memtable.frozen_count(), 2);

        let mut flushed_tids = Vec::new();
        let sst = memtable
            .flush_last(
                SstBuilder::new(4096),
                &tmp.path().join("sst.1"),
                1,
                &mut flushed_tids,
                cache,
            )
            .unwrap()
            .unwrap();

        // The oldest table went out; the newer frozen table remains.
        assert_eq!(memtable.frozen_count(), 1);
        assert_eq!(flushed_tids, vec![1]);
        assert_eq!(sst.get(b"old", 0).unwrap().unwrap().value.as_ref(), b"1");
        assert!(sst.get(b"new", 0).unwrap().is_none());
        assert!(memtable.get(b"new", 0).unwrap().is_some());
    }

    #[test]
    fn test_flush_last_moves_current_when_deque_empty() {
        let tmp = TempDir::new().unwrap();
        let cache = new_block_cache(64);
        let memtable = MemTable::new(1 << 20);

        memtable.put(b"a", b"1", 1).unwrap();
        memtable.put(b"b", b"2", 2).unwrap();
        assert_eq!(memtable.frozen_count(), 0);

        let mut flushed_tids = Vec::new();
        let sst = memtable
            .flush_last(
                SstBuilder::new(4096),
                &tmp.path().join("sst.2"),
                2,
                &mut flushed_tids,
                cache,
            )
            .unwrap()
            .unwrap();

        assert_eq!(memtable.frozen_count(), 0);
        assert_eq!(memtable.get_cur_size(), 0);
        assert_eq!(flushed_tids, vec![1, 2]);
        assert_eq!(sst.get(b"a", 0).unwrap().unwrap().value.as_ref(), b"1");
        assert_eq!(sst.get(b"b", 0).unwrap().unwrap().value.as_ref(), b"2");
    }

    #[test]
    fn test_flush_last_empty_returns_none() {
        let tmp = TempDir::new().unwrap();
        let cache = new_block_cache(64);
        let memtable = MemTable::new(1 << 20);

        let mut flushed_tids = Vec::new();
        let result = memtable
            .flush_last(
                SstBuilder::new(4096),
                &tmp.path().join("sst.3"),
                3,
                &mut flushed_tids,
                cache,
            )
            .unwrap();
        assert!(result.is_none());
        assert!(flushed_tids.is_empty());
    }

    #[test]
    fn test_flush_preserves_versions_and_tombstones() {
        let tmp = TempDir::new().unwrap();
        let cache = new_block_cache(64);
        let memtable = MemTable::new(1 << 20);

        memtable.put(b"k", b"v1", 1).unwrap();
        memtable.put(b"k", b"v2", 2).unwrap();
        memtable.remove(b"k", 3).unwrap();

        let mut flushed_tids = Vec::new();
        let sst = memtable
            .flush_last(
                SstBuilder::new(4096),
                &tmp.path().join("sst.4"),
                4,
                &mut flushed_tids,
                cache,
            )
            .unwrap()
            .unwrap();

        assert_eq!(flushed_tids, vec![1, 2, 3]);
        assert!(sst.get(b"k", 0).unwrap().unwrap().is_tombstone());
        assert_eq!(sst.get(b"k", 2).unwrap().unwrap().value.as_ref(), b"v2");
        assert_eq!(sst.get(b"k", 1).unwrap().unwrap().value.as_ref(), b"v1");
        assert_eq!(sst.min_tranc_id(), 1);
        assert_eq!(sst.max_tranc_id(), 3);
    }
}
