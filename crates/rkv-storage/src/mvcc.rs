use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use rkv_types::{KeyRange, Mutation, RkvError};
use tracing::trace;

use crate::types::{decode, encode};

type Chain = BTreeMap<u64, Option<Vec<u8>>>;

fn bounds(range: &KeyRange) -> Option<(Bound<&[u8]>, Bound<&[u8]>)> {
    if range.is_empty() {
        return None;
    }
    let end = match range.end.as_deref() {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    };
    Some((Bound::Included(range.start.as_slice()), end))
}

fn value_at(chain: &Chain, at: u64) -> Option<&Vec<u8>> {
    chain.range(..=at).next_back().and_then(|(_, v)| v.as_ref())
}

// ---------------------------------------------------------------------------
// MvccStore
// ---------------------------------------------------------------------------

/// Multi-version key-value state machine.
///
/// Each key maps to a chain of versions keyed by the log index (or standalone
/// commit number) that wrote them; `None` is a tombstone. Reads at index `n`
/// see the newest version `<= n`. Versions older than `horizon` are collapsed
/// by [`compact`](Self::compact), so reads and conflict checks are only exact
/// at indices `>= horizon`.
#[derive(Debug, Default)]
pub struct MvccStore {
    versions: BTreeMap<Vec<u8>, Chain>,
    applied_index: u64,
    applied_term: u64,
    horizon: u64,
}

impl MvccStore {
    pub fn new() -> Self {
        MvccStore::default()
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn applied_term(&self) -> u64 {
        self.applied_term
    }

    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    fn chains<'a>(
        &'a self,
        range: &'a KeyRange,
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Chain)> + 'a {
        bounds(range).into_iter().flat_map(|b| self.versions.range::<[u8], _>(b))
    }

    fn is_live(&self, key: &[u8]) -> bool {
        self.versions
            .get(key)
            .and_then(|chain| chain.values().next_back())
            .is_some_and(|v| v.is_some())
    }

    /// Apply one write set at `index`. Indices must strictly increase.
    pub fn apply(&mut self, index: u64, term: u64, mutations: &[Mutation]) -> Result<(), RkvError> {
        if index <= self.applied_index {
            return Err(RkvError::Storage(format!(
                "apply out of order: index {index} after {}",
                self.applied_index
            )));
        }
        for m in mutations {
            match m {
                Mutation::Put { key, value } => {
                    self.versions.entry(key.clone()).or_default().insert(index, Some(value.clone()));
                }
                Mutation::Delete { key } => {
                    if self.is_live(key) {
                        self.versions.entry(key.clone()).or_default().insert(index, None);
                    }
                }
                Mutation::DeleteRange { range } => {
                    let doomed: Vec<Vec<u8>> = self
                        .chains(range)
                        .filter(|(_, chain)| chain.values().next_back().is_some_and(|v| v.is_some()))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        self.versions.entry(key).or_default().insert(index, None);
                    }
                }
            }
        }
        self.applied_index = index;
        self.applied_term = term;
        Ok(())
    }

    /// Advance past an entry that carries no writes.
    pub fn mark_applied(&mut self, index: u64, term: u64) {
        if index > self.applied_index {
            self.applied_index = index;
            self.applied_term = term;
        }
    }

    pub fn get(&self, key: &[u8], at: u64) -> Option<Vec<u8>> {
        self.versions.get(key).and_then(|chain| value_at(chain, at)).cloned()
    }

    /// Live pairs in `range` as of `at`, in key order, at most `limit`.
    pub fn scan(&self, range: &KeyRange, at: u64, limit: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.chains(range)
            .filter_map(|(k, chain)| value_at(chain, at).map(|v| (k.clone(), v.clone())))
            .take(limit)
            .collect()
    }

    /// Whether any key in `range` has a version newer than `since`.
    pub fn changed_since(&self, range: &KeyRange, since: u64) -> bool {
        self.chains(range).any(|(_, chain)| {
            chain.range((Bound::Excluded(since), Bound::Unbounded)).next().is_some()
        })
    }

    /// Collapse every chain to its newest version at or below `horizon`.
    pub fn compact(&mut self, horizon: u64) {
        let horizon = horizon.min(self.applied_index);
        if horizon <= self.horizon {
            return;
        }
        for chain in self.versions.values_mut() {
            if let Some(keep) = chain.range(..=horizon).next_back().map(|(i, _)| *i) {
                chain.retain(|i, _| *i >= keep);
                if matches!(chain.get(&keep), Some(None)) {
                    chain.remove(&keep);
                }
            }
        }
        let before = self.versions.len();
        self.versions.retain(|_, chain| !chain.is_empty());
        trace!(horizon, dropped_keys = before - self.versions.len(), "compacted version history");
        self.horizon = horizon;
    }

    /// Live pairs at `applied_index`, bincode-encoded.
    pub fn snapshot_image(&self) -> Result<Vec<u8>, RkvError> {
        let pairs = self.scan(&KeyRange::all(), self.applied_index, usize::MAX);
        encode(&pairs)
    }

    /// Rebuild from an image produced by [`snapshot_image`](Self::snapshot_image).
    pub fn restore(image: &[u8], index: u64, term: u64) -> Result<Self, RkvError> {
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = if image.is_empty() { Vec::new() } else { decode(image)? };
        Ok(Self::from_pairs(pairs, index, term))
    }

    /// A store whose every pair was written at `index`.
    pub fn from_pairs(pairs: Vec<(Vec<u8>, Vec<u8>)>, index: u64, term: u64) -> Self {
        let versions = pairs
            .into_iter()
            .map(|(k, v)| (k, BTreeMap::from([(index, Some(v))])))
            .collect();
        MvccStore { versions, applied_index: index, applied_term: term, horizon: index }
    }

    /// Number of retained versions, tombstones included.
    pub fn version_count(&self) -> usize {
        self.versions.values().map(BTreeMap::len).sum()
    }
}

// ---------------------------------------------------------------------------
// Snapshot pins
// ---------------------------------------------------------------------------

/// Reference counts of the base indices open transactions read at.
///
/// Compaction never moves the horizon past [`oldest`](Self::oldest).
#[derive(Debug, Clone, Default)]
pub struct SnapshotPins {
    inner: Arc<Mutex<BTreeMap<u64, usize>>>,
}

impl SnapshotPins {
    pub fn new() -> Self {
        SnapshotPins::default()
    }

    pub fn pin(&self, index: u64) -> SnapshotPin {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *g.entry(index).or_insert(0) += 1;
        SnapshotPin { pins: self.clone(), index }
    }

    pub fn oldest(&self) -> Option<u64> {
        let g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.keys().next().copied()
    }

    fn release(&self, index: u64) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = g.get_mut(&index) {
            *count -= 1;
            if *count == 0 {
                g.remove(&index);
            }
        }
    }
}

/// Keeps `index` readable until dropped.
#[derive(Debug)]
pub struct SnapshotPin {
    pins: SnapshotPins,
    index: u64,
}

impl SnapshotPin {
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        self.pins.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(k: &str, v: &str) -> Mutation {
        Mutation::Put { key: k.as_bytes().to_vec(), value: v.as_bytes().to_vec() }
    }

    fn del(k: &str) -> Mutation {
        Mutation::Delete { key: k.as_bytes().to_vec() }
    }

    #[test]
    fn reads_see_version_at_index() {
        let mut sm = MvccStore::new();
        sm.apply(1, 1, &[put("k", "v1")]).unwrap();
        sm.apply(2, 1, &[put("k", "v2")]).unwrap();
        sm.apply(3, 2, &[del("k")]).unwrap();

        assert_eq!(sm.get(b"k", 0), None);
        assert_eq!(sm.get(b"k", 1), Some(b"v1".to_vec()));
        assert_eq!(sm.get(b"k", 2), Some(b"v2".to_vec()));
        assert_eq!(sm.get(b"k", 3), None);
        assert_eq!((sm.applied_index(), sm.applied_term()), (3, 2));
        assert!(sm.apply(3, 2, &[]).is_err());
    }

    #[test]
    fn delete_range_tombstones_live_keys_only() {
        let mut sm = MvccStore::new();
        sm.apply(1, 1, &[put("a", "1"), put("b", "2"), put("c", "3")]).unwrap();
        sm.apply(2, 1, &[Mutation::DeleteRange {
            range: KeyRange::new(b"b".to_vec(), Some(b"z".to_vec())),
        }])
        .unwrap();

        assert_eq!(sm.scan(&KeyRange::all(), 2, 10), vec![(b"a".to_vec(), b"1".to_vec())]);
        assert_eq!(sm.scan(&KeyRange::all(), 1, 2).len(), 2);
        // Deleting an absent key is not a change.
        sm.apply(3, 1, &[del("zz")]).unwrap();
        assert!(!sm.changed_since(&KeyRange::single(b"zz"), 2));
    }

    #[test]
    fn changed_since_detects_newer_writes() {
        let mut sm = MvccStore::new();
        sm.apply(50, 3, &[put("x", "old"), put("y", "old")]).unwrap();
        sm.apply(51, 3, &[put("x", "new")]).unwrap();

        assert!(sm.changed_since(&KeyRange::single(b"x"), 50));
        assert!(!sm.changed_since(&KeyRange::single(b"y"), 50));
        assert!(!sm.changed_since(&KeyRange::single(b"x"), 51));
        assert!(sm.changed_since(&KeyRange::all(), 50));
    }

    #[test]
    fn compaction_keeps_reads_above_horizon() {
        let mut sm = MvccStore::new();
        for i in 1..=5u64 {
            sm.apply(i, 1, &[put("k", &format!("v{i}"))]).unwrap();
        }
        sm.apply(6, 1, &[put("gone", "x")]).unwrap();
        sm.apply(7, 1, &[del("gone")]).unwrap();

        sm.compact(7);
        assert_eq!(sm.horizon(), 7);
        assert_eq!(sm.get(b"k", 7), Some(b"v5".to_vec()));
        assert_eq!(sm.get(b"gone", 7), None);
        assert_eq!(sm.version_count(), 1);

        // The horizon never passes the applied index.
        sm.compact(100);
        assert_eq!(sm.horizon(), 7);
    }

    #[test]
    fn snapshot_image_round_trip() {
        let mut sm = MvccStore::new();
        sm.apply(1, 1, &[put("a", "1"), put("b", "2")]).unwrap();
        sm.apply(2, 1, &[del("a")]).unwrap();

        let image = sm.snapshot_image().unwrap();
        let restored = MvccStore::restore(&image, 2, 1).unwrap();
        assert_eq!(restored.applied_index(), 2);
        assert_eq!(restored.get(b"b", 2), Some(b"2".to_vec()));
        assert_eq!(restored.get(b"a", 2), None);
        assert_eq!(restored.horizon(), 2);
    }

    #[test]
    fn pins_track_oldest_base() {
        let pins = SnapshotPins::new();
        assert_eq!(pins.oldest(), None);
        let a = pins.pin(10);
        let b = pins.pin(4);
        let c = pins.pin(4);
        assert_eq!(pins.oldest(), Some(4));
        drop(b);
        assert_eq!(pins.oldest(), Some(4));
        drop(c);
        assert_eq!(pins.oldest(), Some(10));
        assert_eq!(a.index(), 10);
        drop(a);
        assert_eq!(pins.oldest(), None);
    }
}
