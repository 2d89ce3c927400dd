#[cfg(test)]
mod tests {
    use crate::skiplist::{NO_SNAPSHOT, SkipList};

    #[test]
    fn test_versions_ordered_newest_first() {
        let list = SkipList::new();
        list.put(b"key", b"v1", 1);
        list.put(b"key", b"v3", 3);
        list.put(b"key", b"v2", 2);

        let all = list.scan_all();
        let tids: Vec<_> = all.iter().map(|e| e.tranc_id).collect();
        assert_eq!(tids, vec![3, 2, 1]);
    }

    #[test]
    fn test_snapshot_selects_newest_visible() {
        let list = SkipList::new();
        list.put(b"key", b"v2", 2);
        list.put(b"key", b"v5", 5);
        list.put(b"key", b"v9", 9);

        assert_eq!(list.get(b"key", 1), None);
        assert_eq!(list.get(b"key", 2).unwrap().value.as_ref(), b"v2");
        assert_eq!(list.get(b"key", 4).unwrap().value.as_ref(), b"v2");
        assert_eq!(list.get(b"key", 5).unwrap().value.as_ref(), b"v5");
        assert_eq!(list.get(b"key", 8).unwrap().value.as_ref(), b"v5");
        assert_eq!(list.get(b"key", 9).unwrap().value.as_ref(), b"v9");
        assert_eq!(list.get(b"key", u64::MAX).unwrap().value.as_ref(), b"v9");
    }

    #[test]
    fn test_no_snapshot_disables_filtering() {
        let list = SkipList::new();
        list.put(b"key", b"old", 3);
        list.put(b"key", b"new", 40);

        let entry = list.get(b"key", NO_SNAPSHOT).unwrap();
        assert_eq!(entry.value.as_ref(), b"new");
        assert_eq!(entry.tranc_id, 40);
    }

    #[test]
    fn test_snapshot_does_not_bleed_into_neighbour_key() {
        let list = SkipList::new();
        list.put(b"a", b"va", 9);
        list.put(b"b", b"vb", 1);

        // Snapshot 5 sees no version of "a", and must not fall through
        // to "b"'s entry.
        assert!(list.get(b"a", 5).is_none());
        assert_eq!(list.get(b"b", 5).unwrap().value.as_ref(), b"vb");
    }
}
