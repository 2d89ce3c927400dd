#[cfg(test)]
mod tests {
    use crate::engine::{Engine, EngineConfig};
    use crate::transaction::IsolationLevel;
    use tempfile::TempDir;

    fn small_config() -> EngineConfig {
        EngineConfig {
            per_mem_size_limit: 1 << 10,
            tol_mem_size_limit: 4 << 10,
            block_size: 256,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_put_get_across_flush() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_config()).unwrap();

        let mut tran = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        for i in 0..50u32 {
            tran.put(
                format!("key-{i:03}").as_bytes(),
                format!("value-{i:03}").as_bytes(),
            )
            .unwrap();
        }
        tran.commit(true).unwrap();

        engine.flush_all().unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.frozen_count, 0);
        assert_eq!(stats.memtable_cur_bytes, 0);
        assert!(stats.level_counts.iter().sum::<usize>() >= 1);

        // Every key now resolves from SSTs.
        let reader = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        for i in 0..50u32 {
            let value = reader.get(format!("key-{i:03}").as_bytes()).unwrap();
            assert_eq!(value.unwrap().as_ref(), format!("value-{i:03}").as_bytes());
        }
        engine.close().unwrap();
    }

    #[test]
    fn test_tombstone_across_flush() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_config()).unwrap();

        let mut tran = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        tran.put(b"a", b"1").unwrap();
        tran.commit(true).unwrap();
        engine.flush_all().unwrap();

        let mut tran = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        tran.remove(b"a").unwrap();
        tran.commit(true).unwrap();
        engine.flush_all().unwrap();

        // The tombstone SST shadows the value SST.
        let reader = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        assert!(reader.get(b"a").unwrap().is_none());
        engine.close().unwrap();
    }

    #[test]
    fn test_newest_visible_version_wins_across_layers() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_config()).unwrap();

        // A slow transaction begins first (smaller tranc_id)…
        let mut slow = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();

        // …while a later transaction writes the key and is flushed to
        // an SST.
        let mut fast = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        fast.put(b"k", b"fast").unwrap();
        fast.commit(true).unwrap();
        engine.flush_all().unwrap();

        // Now the slow transaction commits the same key into the
        // memtable with its smaller identifier.
        slow.put(b"k", b"slow").unwrap();
        slow.commit(true).unwrap();

        // The SST version carries the larger identifier and must win.
        let reader = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(reader.get(b"k").unwrap().unwrap().as_ref(), b"fast");
        engine.close().unwrap();
    }

    #[test]
    fn test_background_flush_triggers_on_total_size() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_config()).unwrap();

        for batch in 0..20u32 {
            let mut tran = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
            for i in 0..20u32 {
                tran.put(
                    format!("key-{batch:02}-{i:02}").as_bytes(),
                    format!("value-{batch:02}-{i:02}").as_bytes(),
                )
                .unwrap();
            }
            tran.commit(false).unwrap();
        }

        // Give the flusher a moment; either it ran or close() drains.
        engine.close().unwrap();

        let engine = Engine::open(tmp.path(), small_config()).unwrap();
        let reader = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        for batch in 0..20u32 {
            for i in 0..20u32 {
                let key = format!("key-{batch:02}-{i:02}");
                let value = reader.get(key.as_bytes()).unwrap();
                assert_eq!(
                    value.unwrap().as_ref(),
                    format!("value-{batch:02}-{i:02}").as_bytes()
                );
            }
        }
        engine.close().unwrap();
    }

    #[test]
    fn test_clear_empties_everything() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_config()).unwrap();

        let mut tran = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        for i in 0..50u32 {
            tran.put(format!("k{i}").as_bytes(), b"v").unwrap();
        }
        tran.commit(true).unwrap();
        engine.flush_all().unwrap();

        engine.clear().unwrap();

        let stats = engine.stats().unwrap();
        assert_eq!(stats.frozen_count, 0);
        assert_eq!(stats.level_counts.iter().sum::<usize>(), 0);

        let reader = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        assert!(reader.get(b"k0").unwrap().is_none());
        engine.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_config()).unwrap();
        engine.close().unwrap();
        engine.close().unwrap();
    }
}
