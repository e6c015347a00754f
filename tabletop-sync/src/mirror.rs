//! Client-side cache of the last-known flat state of the world.
//!
//! The mirror only changes when the remote store reports a change (or on the
//! initial snapshot). Local writes are never applied optimistically: a
//! submission that never comes back as a notification never happened.
//!
//! Writes that are still on their way sit in [`PendingWrites`]. They take no
//! part in what the client shows, but removal detection has to see them: a
//! piece deleted before its own add comes back still has children to remove.

use crate::codec::{child_prefix, FlatMap, TOMBSTONE};

/// Key of the whole-world generation marker.
pub const GENERATION_KEY: &str = "__new";

/// Last-known flat key-value state.
#[derive(Debug, Clone, Default)]
pub struct LocalMirror {
    entries: FlatMap,
}

impl LocalMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the mirror from a full-state snapshot.
    pub fn from_snapshot(snapshot: FlatMap) -> Self {
        Self { entries: snapshot }
    }

    /// Apply a change notification: store every added pair, then drop every
    /// removed key. Unknown removed keys are ignored.
    pub fn apply<'a, A, R>(&mut self, added: A, removed: R)
    where
        A: IntoIterator<Item = (&'a String, &'a String)>,
        R: IntoIterator<Item = &'a String>,
    {
        for (key, value) in added {
            self.entries.insert(key.clone(), value.clone());
        }
        for key in removed {
            self.entries.remove(key);
        }
    }

    /// Replace the whole content with a fresh snapshot.
    pub fn reset(&mut self, snapshot: FlatMap) {
        self.entries = snapshot;
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether `key` is stored as an explicit tombstone.
    pub fn is_tombstone(&self, key: &str) -> bool {
        self.get(key) == Some(TOMBSTONE)
    }

    /// Every stored key that strictly extends `key` (`key|...`), in order.
    pub fn descendants<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a String> + 'a {
        let prefix = child_prefix(key);
        self.entries
            .range(prefix.clone()..)
            .map(|(k, _)| k)
            .take_while(move |k| k.starts_with(&prefix))
    }

    /// Current generation counter, if a world replace ever happened.
    pub fn generation(&self) -> Option<u64> {
        self.get(GENERATION_KEY).and_then(|g| g.trim().parse().ok())
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn entries(&self) -> &FlatMap {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of tombstone entries currently stored.
    pub fn tombstone_count(&self) -> usize {
        self.entries.values().filter(|v| *v == TOMBSTONE).count()
    }
}

/// Keys this client has submitted but not yet seen come back.
#[derive(Debug, Clone, Default)]
pub struct PendingWrites {
    writes: LocalMirror,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an outgoing delta's updates until the store reports them.
    pub fn record(&mut self, updates: &FlatMap) {
        for (key, value) in updates {
            self.writes.entries.insert(key.clone(), value.clone());
        }
    }

    /// Drop every pending write a notification reported with the same value.
    /// A key rewritten since stays pending until its latest value comes back.
    pub fn acknowledge<'a, A>(&mut self, added: A)
    where
        A: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in added {
            if self.writes.get(key) == Some(value.as_str()) {
                self.writes.entries.remove(key);
            }
        }
    }

    /// Drop the writes a full snapshot already holds.
    pub fn acknowledge_snapshot(&mut self, snapshot: &FlatMap) {
        self.writes
            .entries
            .retain(|key, value| snapshot.get(key) != Some(value));
    }

    /// Pending writes as a mirror, for removal detection.
    pub fn as_mirror(&self) -> &LocalMirror {
        &self.writes
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror_of(pairs: &[(&str, &str)]) -> LocalMirror {
        LocalMirror::from_snapshot(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_apply_adds_then_removes() {
        let mut mirror = mirror_of(&[("pieces|1|x", "1"), ("pieces|1|y", "2")]);
        let added: FlatMap = [("pieces|1|x".to_string(), "5".to_string())].into();
        let removed = vec!["pieces|1|y".to_string(), "missing".to_string()];

        mirror.apply(&added, &removed);

        assert_eq!(mirror.get("pieces|1|x"), Some("5"));
        assert!(!mirror.contains("pieces|1|y"));
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn test_descendants_excludes_key_and_siblings() {
        let mirror = mirror_of(&[
            ("pieces|1", TOMBSTONE),
            ("pieces|1|x", "1"),
            ("pieces|1|faces|0", "a.png"),
            ("pieces|10|x", "3"),
            ("pieces|1x", "4"),
        ]);
        let found: Vec<&String> = mirror.descendants("pieces|1").collect();
        assert_eq!(found, vec!["pieces|1|faces|0", "pieces|1|x"]);
    }

    #[test]
    fn test_generation_marker() {
        assert_eq!(LocalMirror::new().generation(), None);
        assert_eq!(mirror_of(&[(GENERATION_KEY, "3")]).generation(), Some(3));
        assert_eq!(mirror_of(&[(GENERATION_KEY, "junk")]).generation(), None);
    }

    #[test]
    fn test_tombstones() {
        let mirror = mirror_of(&[("pieces|1", TOMBSTONE), ("pieces|2|x", "1")]);
        assert!(mirror.is_tombstone("pieces|1"));
        assert!(!mirror.is_tombstone("pieces|2|x"));
        assert_eq!(mirror.tombstone_count(), 1);
    }

    #[test]
    fn test_pending_writes_clear_on_matching_echo() {
        let mut pending = PendingWrites::new();
        pending.record(&mirror_of(&[("pieces|0|x", "1"), ("pieces|0|y", "2")]).entries);
        pending.record(&mirror_of(&[("pieces|0|x", "5")]).entries);

        // The echo of the first write carries a value that has since changed.
        pending.acknowledge(&mirror_of(&[("pieces|0|x", "1"), ("pieces|0|y", "2")]).entries);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.as_mirror().get("pieces|0|x"), Some("5"));

        pending.acknowledge_snapshot(&mirror_of(&[("pieces|0|x", "5")]).entries);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pending_writes_expose_descendants() {
        let mut pending = PendingWrites::new();
        pending.record(&mirror_of(&[("pieces|2|x", "1"), ("pieces|2|faces|0", "a.png")]).entries);
        let found: Vec<&String> = pending.as_mirror().descendants("pieces|2").collect();
        assert_eq!(found, vec!["pieces|2|faces|0", "pieces|2|x"]);
    }

    #[test]
    fn test_reset() {
        let mut mirror = mirror_of(&[("a", "1")]);
        mirror.reset(FlatMap::new());
        assert!(mirror.is_empty());
    }
}
