#[cfg(test)]
mod tests {
    use crate::skiplist::SkipList;

    fn sample_list() -> SkipList {
        let list = SkipList::new();
        list.put(b"app:1", b"a1", 1);
        list.put(b"app:2", b"a2", 2);
        list.put(b"app:2", b"a2b", 4);
        list.put(b"cfg:1", b"c1", 3);
        list.put(b"usr:1", b"u1", 5);
        list
    }

    #[test]
    fn test_scan_prefix() {
        let list = sample_list();

        let run = list.scan_prefix(b"app:");
        let keys: Vec<_> = run.iter().map(|e| (e.key.to_vec(), e.tranc_id)).collect();
        assert_eq!(
            keys,
            vec![
                (b"app:1".to_vec(), 1),
                (b"app:2".to_vec(), 4),
                (b"app:2".to_vec(), 2),
            ]
        );
    }

    #[test]
    fn test_scan_prefix_no_match() {
        let list = sample_list();
        assert!(list.scan_prefix(b"zzz").is_empty());
    }

    #[test]
    fn test_scan_monotone_selects_middle_range() {
        let list = sample_list();

        // Keys in ["cfg:", "usr:") — everything below is -1, everything
        // at or above "usr:" is +1.
        let run = list
            .scan_monotone(|key| {
                if key < b"cfg:".as_slice() {
                    -1
                } else if key < b"usr:".as_slice() {
                    0
                } else {
                    1
                }
            })
            .unwrap();

        assert_eq!(run.len(), 1);
        assert_eq!(run[0].key.as_ref(), b"cfg:1");
    }

    #[test]
    fn test_scan_monotone_empty_range_is_none() {
        let list = sample_list();
        assert!(list.scan_monotone(|_| -1).is_none());
        assert!(list.scan_monotone(|_| 1).is_none());
    }

    #[test]
    fn test_scan_all_order() {
        let list = sample_list();
        let all = list.scan_all();
        let keys: Vec<_> = all.iter().map(|e| e.key.to_vec()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(all.len(), 5);
    }
}
