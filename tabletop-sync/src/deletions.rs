//! Removal detection for outgoing updates.
//!
//! Writing a tombstone at `pieces|3` leaves `pieces|3|x`, `pieces|3|y`, ...
//! behind in the store. Those descendants have to be removed explicitly in
//! the same delta. The tombstone itself stays, so readers can tell a deleted
//! entry from one that never existed. Tombstones are only reclaimed by a
//! whole-world replace.

use std::collections::BTreeSet;

use crate::codec::{FlatMap, SEPARATOR, TOMBSTONE};
use crate::mirror::LocalMirror;

/// Keys the store must drop for the tombstones in `update`.
///
/// For every key written as a tombstone, returns each mirror key that
/// strictly extends it. The tombstoned key itself is never included. The
/// result is ordered and free of duplicates.
pub fn find_deletions(update: &FlatMap, mirror: &LocalMirror) -> Vec<String> {
    let mut removals = BTreeSet::new();
    for (key, value) in update {
        if value == TOMBSTONE {
            removals.extend(mirror.descendants(key).cloned());
        }
    }
    removals.into_iter().collect()
}

/// Ancestor tombstones that a live write would shadow.
///
/// Re-adding `pieces|3|x` under an old `pieces|3` tombstone would leave the
/// store holding both a leaf and its children. Those stale tombstones are
/// removed alongside the write.
pub fn find_stale_tombstones(update: &FlatMap, mirror: &LocalMirror) -> Vec<String> {
    let mut stale = BTreeSet::new();
    for (key, value) in update {
        if value == TOMBSTONE {
            continue;
        }
        for (pos, _) in key.match_indices(SEPARATOR) {
            let ancestor = &key[..pos];
            if mirror.is_tombstone(ancestor) && !update.contains_key(ancestor) {
                stale.insert(ancestor.to_string());
            }
        }
    }
    stale.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{child_prefix, flatten, join_path};
    use proptest::prelude::*;
    use serde_json::json;

    fn mirror_of(keys: &[(&str, &str)]) -> LocalMirror {
        LocalMirror::from_snapshot(
            keys.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_delete_piece_scenario() {
        let mirror = mirror_of(&[("pieces|3|x", "10"), ("pieces|3|y", "20")]);
        let update = flatten(&json!({"pieces": {"3": null}}));
        assert_eq!(update["pieces|3"], TOMBSTONE);

        let deletions = find_deletions(&update, &mirror);
        assert_eq!(deletions, vec!["pieces|3|x", "pieces|3|y"]);
    }

    #[test]
    fn test_tombstoned_key_itself_is_never_removed() {
        let mirror = mirror_of(&[
            ("pieces|3", TOMBSTONE),
            ("pieces|3|x", "10"),
            ("pieces|30|x", "1"),
            ("pieces|4|x", "2"),
        ]);
        let update = flatten(&json!({"pieces": {"3": null}}));

        let deletions = find_deletions(&update, &mirror);
        assert_eq!(deletions, vec!["pieces|3|x"]);
        assert!(!deletions.contains(&"pieces|3".to_string()));
    }

    #[test]
    fn test_live_values_produce_no_deletions() {
        let mirror = mirror_of(&[("pieces|3|x", "10")]);
        let update = flatten(&json!({"pieces": {"3": {"x": 11}}}));
        assert!(find_deletions(&update, &mirror).is_empty());
    }

    #[test]
    fn test_overlapping_tombstones_are_deduplicated() {
        let mirror = mirror_of(&[("a|b|c", "1"), ("a|b|d", "2")]);
        let mut update = FlatMap::new();
        update.insert("a".into(), TOMBSTONE.into());
        update.insert("a|b".into(), TOMBSTONE.into());

        assert_eq!(find_deletions(&update, &mirror), vec!["a|b|c", "a|b|d"]);
    }

    #[test]
    fn test_stale_tombstone_under_readd() {
        let mirror = mirror_of(&[("pieces|3", TOMBSTONE), ("pieces|4|x", "1")]);
        let update = flatten(&json!({"pieces": {"3": {"x": 1, "y": 2}}}));

        assert_eq!(find_stale_tombstones(&update, &mirror), vec!["pieces|3"]);
        assert!(find_deletions(&update, &mirror).is_empty());
    }

    #[test]
    fn test_no_stale_tombstones_for_fresh_keys() {
        let mirror = mirror_of(&[("pieces|4|x", "1")]);
        let update = flatten(&json!({"pieces": {"3": {"x": 1}}}));
        assert!(find_stale_tombstones(&update, &mirror).is_empty());
    }

    fn flat_key() -> impl Strategy<Value = String> {
        prop::collection::vec("[ab1]{1,2}", 1..4).prop_map(|segments| join_path(&segments))
    }

    proptest! {
        #[test]
        fn prop_deletions_are_exactly_the_descendants(
            keys in prop::collection::btree_set(flat_key(), 0..24),
            target in flat_key(),
        ) {
            let mirror = LocalMirror::from_snapshot(
                keys.iter().map(|k| (k.clone(), "v".to_string())).collect(),
            );
            let mut update = FlatMap::new();
            update.insert(target.clone(), TOMBSTONE.to_string());

            let found = find_deletions(&update, &mirror);
            let prefix = child_prefix(&target);
            let expected: Vec<String> =
                keys.iter().filter(|k| k.starts_with(&prefix)).cloned().collect();
            prop_assert!(!found.contains(&target));
            prop_assert_eq!(found, expected);
        }

        #[test]
        fn prop_stale_tombstones_are_tombstoned_ancestors(
            tombstones in prop::collection::btree_set(flat_key(), 0..12),
            written in flat_key(),
        ) {
            let mirror = LocalMirror::from_snapshot(
                tombstones.iter().map(|k| (k.clone(), TOMBSTONE.to_string())).collect(),
            );
            let mut update = FlatMap::new();
            update.insert(written.clone(), "1".to_string());

            let expected: Vec<String> = tombstones
                .iter()
                .filter(|k| written.starts_with(&child_prefix(k)))
                .cloned()
                .collect();
            prop_assert_eq!(find_stale_tombstones(&update, &mirror), expected);
        }
    }
}
