#[cfg(test)]
mod tests {
    use crate::engine::{Engine, EngineConfig, EngineError};
    use crate::transaction::IsolationLevel;
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_engine(tmp: &TempDir) -> Engine {
        Engine::open(tmp.path(), EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_own_writes_visible_before_commit() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut tran = engine.begin_tran(IsolationLevel::RepeatableRead).unwrap();
        tran.put(b"k", b"mine").unwrap();
        assert_eq!(tran.get(b"k").unwrap().unwrap().as_ref(), b"mine");

        tran.remove(b"k").unwrap();
        assert!(tran.get(b"k").unwrap().is_none());

        tran.rollback().unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn test_uncommitted_writes_invisible_to_others() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut writer = engine.begin_tran(IsolationLevel::RepeatableRead).unwrap();
        writer.put(b"k", b"pending").unwrap();

        let reader = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        assert!(reader.get(b"k").unwrap().is_none());

        writer.commit(false).unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn test_read_committed_sees_new_commits() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let reader = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        assert!(reader.get(b"k").unwrap().is_none());

        let mut writer = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        writer.put(b"k", b"v1").unwrap();
        writer.commit(false).unwrap();

        // The same context re-resolves its snapshot per call.
        assert_eq!(reader.get(b"k").unwrap().unwrap().as_ref(), b"v1");
        engine.close().unwrap();
    }

    #[test]
    fn test_repeatable_read_pins_snapshot() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut setup = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        setup.put(b"k", b"original").unwrap();
        setup.commit(false).unwrap();

        let reader = engine.begin_tran(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(reader.get(b"k").unwrap().unwrap().as_ref(), b"original");

        let mut writer = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        writer.put(b"k", b"changed").unwrap();
        writer.commit(false).unwrap();

        // Still the pinned view.
        assert_eq!(reader.get(b"k").unwrap().unwrap().as_ref(), b"original");

        // A fresh context sees the change.
        let fresh = engine.begin_tran(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(fresh.get(b"k").unwrap().unwrap().as_ref(), b"changed");
        engine.close().unwrap();
    }

    #[test]
    fn test_rollback_discards_writes() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut tran = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        tran.put(b"k", b"doomed").unwrap();
        tran.rollback().unwrap();

        let reader = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        assert!(reader.get(b"k").unwrap().is_none());
        engine.close().unwrap();
    }

    #[test]
    fn test_terminal_state_rejects_operations() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut tran = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        tran.put(b"k", b"v").unwrap();
        tran.commit(false).unwrap();

        assert!(matches!(
            tran.put(b"k2", b"v2"),
            Err(EngineError::TransactionState(_))
        ));
        assert!(matches!(tran.get(b"k"), Err(EngineError::TransactionState(_))));
        assert!(matches!(
            tran.commit(false),
            Err(EngineError::TransactionState(_))
        ));
        assert!(matches!(
            tran.rollback(),
            Err(EngineError::TransactionState(_))
        ));
        engine.close().unwrap();
    }

    #[test]
    fn test_invalid_arguments() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut tran = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        assert!(matches!(
            tran.put(b"", b"v"),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            tran.put(b"k", b""),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            tran.remove(b""),
            Err(EngineError::InvalidArgument(_))
        ));

        let huge = vec![0u8; 70_000];
        assert!(matches!(
            tran.put(b"k", &huge),
            Err(EngineError::InvalidArgument(_))
        ));
        tran.rollback().unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn test_serializable_conflict_detected() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut first = engine.begin_tran(IsolationLevel::Serializable).unwrap();
        let mut second = engine.begin_tran(IsolationLevel::Serializable).unwrap();

        first.put(b"contended", b"first").unwrap();
        second.put(b"contended", b"second").unwrap();

        first.commit(false).unwrap();

        // The second writer's snapshot predates the first commit.
        assert!(matches!(
            second.commit(false),
            Err(EngineError::Conflict { .. })
        ));

        let reader = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(reader.get(b"contended").unwrap().unwrap().as_ref(), b"first");
        engine.close().unwrap();
    }

    #[test]
    fn test_serializable_disjoint_keys_both_commit() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut first = engine.begin_tran(IsolationLevel::Serializable).unwrap();
        let mut second = engine.begin_tran(IsolationLevel::Serializable).unwrap();

        first.put(b"left", b"1").unwrap();
        second.put(b"right", b"2").unwrap();

        first.commit(false).unwrap();
        second.commit(false).unwrap();

        let reader = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(reader.get(b"left").unwrap().unwrap().as_ref(), b"1");
        assert_eq!(reader.get(b"right").unwrap().unwrap().as_ref(), b"2");
        engine.close().unwrap();
    }

    #[test]
    fn test_iter_prefix_with_overlay() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut setup = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        setup.put(b"user:1", b"alice").unwrap();
        setup.put(b"user:2", b"bob").unwrap();
        setup.put(b"user:3", b"carol").unwrap();
        setup.put(b"cfg:x", b"ignored").unwrap();
        setup.commit(false).unwrap();

        let mut tran = engine.begin_tran(IsolationLevel::RepeatableRead).unwrap();
        tran.put(b"user:2", b"robert").unwrap(); // overlay replaces
        tran.remove(b"user:3").unwrap(); // overlay suppresses
        tran.put(b"user:4", b"dave").unwrap(); // overlay adds

        let pairs = tran.iter_prefix(b"user:").unwrap();
        let rendered: Vec<_> = pairs
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        assert_eq!(
            rendered,
            vec![
                (b"user:1".to_vec(), b"alice".to_vec()),
                (b"user:2".to_vec(), b"robert".to_vec()),
                (b"user:4".to_vec(), b"dave".to_vec()),
            ]
        );
        tran.rollback().unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn test_iter_all_spans_memtable_and_ssts() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut setup = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        setup.put(b"flushed", b"1").unwrap();
        setup.commit(true).unwrap();
        engine.flush_all().unwrap();

        let mut setup = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        setup.put(b"memory", b"2").unwrap();
        setup.commit(false).unwrap();

        let mut tran = engine.begin_tran(IsolationLevel::RepeatableRead).unwrap();
        tran.put(b"pending", b"3").unwrap();

        let pairs = tran.iter_all().unwrap();
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(
            keys,
            vec![b"flushed".to_vec(), b"memory".to_vec(), b"pending".to_vec()]
        );
        tran.rollback().unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn test_iter_monotone_range() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut setup = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        for i in 0..20u32 {
            setup
                .put(format!("key-{i:02}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        setup.commit(false).unwrap();

        let tran = engine.begin_tran(IsolationLevel::RepeatableRead).unwrap();
        let pairs = tran
            .iter_monotone(Arc::new(|key: &[u8]| {
                if key < b"key-05".as_slice() {
                    -1
                } else if key < b"key-10".as_slice() {
                    0
                } else {
                    1
                }
            }))
            .unwrap();

        assert_eq!(pairs.len(), 5);
        assert_eq!(pairs[0].0.as_ref(), b"key-05");
        assert_eq!(pairs[4].0.as_ref(), b"key-09");
        engine.close().unwrap();
    }

    #[test]
    fn test_get_batch_mixes_overlay_and_engine() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let mut setup = engine.begin_tran(IsolationLevel::ReadCommitted).unwrap();
        setup.put(b"a", b"1").unwrap();
        setup.put(b"b", b"2").unwrap();
        setup.commit(false).unwrap();

        let mut tran = engine.begin_tran(IsolationLevel::RepeatableRead).unwrap();
        tran.put(b"c", b"3").unwrap();
        tran.remove(b"a").unwrap();

        let keys = vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
            Bytes::from_static(b"d"),
        ];
        let results = tran.get_batch(&keys).unwrap();
        assert!(results[0].1.is_none());
        assert_eq!(results[1].1.as_ref().unwrap().as_ref(), b"2");
        assert_eq!(results[2].1.as_ref().unwrap().as_ref(), b"3");
        assert!(results[3].1.is_none());
        tran.rollback().unwrap();
        engine.close().unwrap();
    }
}
