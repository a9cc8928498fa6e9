use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::{Duration, Instant};

use rkv_storage::{MvccStore, SnapshotPin};
use rkv_types::{next_key, Consistency, KeyRange, KeyRanges, Mutation, RkvError, TxState};

// ---------------------------------------------------------------------------
// WriteBuffer
// ---------------------------------------------------------------------------

/// Mutations not yet in the state machine, with an index for reading them
/// back. Later mutations shadow earlier ones.
#[derive(Debug, Default, Clone)]
pub struct WriteBuffer {
    mutations: Vec<Mutation>,
    /// Latest point write per key; `None` is a delete.
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Ranges deleted after which no point write re-created the key.
    deleted: KeyRanges,
}

impl WriteBuffer {
    pub fn new() -> Self {
        WriteBuffer::default()
    }

    pub fn push(&mut self, mutation: Mutation) {
        match &mutation {
            Mutation::Put { key, value } => {
                self.overlay.insert(key.clone(), Some(value.clone()));
            }
            Mutation::Delete { key } => {
                self.overlay.insert(key.clone(), None);
            }
            Mutation::DeleteRange { range } => {
                self.overlay.retain(|k, _| !range.contains(k));
                self.deleted.add(range.clone());
            }
        }
        self.mutations.push(mutation);
    }

    /// `Some(value)` if the buffer decides `key`, `None` to read below it.
    pub fn lookup(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        if let Some(value) = self.overlay.get(key) {
            return Some(value.as_deref());
        }
        self.deleted.contains(key).then_some(None)
    }

    fn overlay_in<'a>(&'a self, range: &'a KeyRange) -> impl Iterator<Item = &'a Vec<u8>> + 'a {
        let end = match &range.end {
            Some(end) => Bound::Excluded(end.as_slice()),
            None => Bound::Unbounded,
        };
        let keys = (!range.is_empty())
            .then(|| self.overlay.range::<[u8], _>((Bound::Included(range.start.as_slice()), end)));
        keys.into_iter().flatten().map(|(k, _)| k)
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn take_mutations(&mut self) -> Vec<Mutation> {
        self.overlay.clear();
        self.deleted = KeyRanges::new();
        std::mem::take(&mut self.mutations)
    }
}

impl FromIterator<Mutation> for WriteBuffer {
    fn from_iter<I: IntoIterator<Item = Mutation>>(iter: I) -> Self {
        let mut buffer = WriteBuffer::new();
        for m in iter {
            buffer.push(m);
        }
        buffer
    }
}

// ---------------------------------------------------------------------------
// Layered reads
// ---------------------------------------------------------------------------

/// Resolve `key` through `layers` (topmost first), then the store at `at`.
pub fn layered_get(store: &MvccStore, at: u64, layers: &[&WriteBuffer], key: &[u8]) -> Option<Vec<u8>> {
    match resolve(layers, key) {
        Some(decided) => decided,
        None => store.get(key, at),
    }
}

fn resolve(layers: &[&WriteBuffer], key: &[u8]) -> Option<Option<Vec<u8>>> {
    layers.iter().find_map(|layer| layer.lookup(key)).map(|v| v.map(<[u8]>::to_vec))
}

/// Scan `range` through `layers` over the store at `at`.
pub fn layered_scan(
    store: &MvccStore,
    at: u64,
    layers: &[&WriteBuffer],
    range: &KeyRange,
    limit: usize,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    if limit == 0 || range.is_empty() {
        return Vec::new();
    }
    let mut visible: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    for layer in layers {
        for key in layer.overlay_in(range) {
            if let Some(Some(value)) = resolve(layers, key) {
                visible.insert(key.clone(), value);
            }
        }
    }

    let page_size = limit.clamp(16, 1024);
    let mut page_range = range.clone();
    loop {
        let page = store.scan(&page_range, at, page_size);
        let full = page.len() == page_size;
        let last = page.last().map(|(k, _)| k.clone());
        for (key, value) in page {
            match resolve(layers, &key) {
                Some(_) => {}
                None => {
                    visible.insert(key, value);
                }
            }
        }
        let Some(last) = last.filter(|_| full) else { break };
        // Base keys past `last` can only displace results beyond the limit.
        if visible.range::<[u8], _>((Bound::Unbounded, Bound::Included(last.as_slice()))).count() >= limit {
            break;
        }
        page_range = KeyRange::new(next_key(&last), range.end.clone());
    }
    visible.into_iter().take(limit).collect()
}

/// The part of `range` a scan returning `rows` actually observed.
pub fn observed_range(range: &KeyRange, rows: &[(Vec<u8>, Vec<u8>)], limit: usize) -> KeyRange {
    match rows.last() {
        Some((last, _)) if rows.len() >= limit => KeyRange::new(range.start.clone(), Some(next_key(last))),
        _ => range.clone(),
    }
}

// ---------------------------------------------------------------------------
// TxCore
// ---------------------------------------------------------------------------

/// State shared by every transaction implementation.
#[derive(Debug)]
pub(crate) struct TxCore {
    pub consistency: Consistency,
    pub state: TxState,
    pub base_index: u64,
    pub reads: KeyRanges,
    pub writes: WriteBuffer,
    deadline: Instant,
    pin: Option<SnapshotPin>,
}

impl TxCore {
    pub fn new(consistency: Consistency, base_index: u64, timeout: Duration, pin: Option<SnapshotPin>) -> Self {
        TxCore {
            consistency,
            state: TxState::Executing,
            base_index,
            reads: KeyRanges::new(),
            writes: WriteBuffer::new(),
            deadline: Instant::now() + timeout,
            pin,
        }
    }

    pub fn check_open(&mut self) -> Result<(), RkvError> {
        if self.state != TxState::Executing {
            return Err(RkvError::InvalidState(format!("transaction is {:?}", self.state)));
        }
        if Instant::now() >= self.deadline {
            self.close();
            return Err(RkvError::Timeout);
        }
        Ok(())
    }

    pub fn write(&mut self, mutation: Mutation) -> Result<(), RkvError> {
        self.check_open()?;
        if let Mutation::Put { key, .. } | Mutation::Delete { key } = &mutation {
            if key.is_empty() {
                return Err(RkvError::InvalidArgument("empty key".into()));
            }
        }
        self.writes.push(mutation);
        Ok(())
    }

    /// Enter `Committing` and return the time left for the commit.
    pub fn begin_commit(&mut self) -> Result<Duration, RkvError> {
        self.check_open()?;
        self.state = TxState::Committing;
        Ok(self.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn finish<T>(&mut self, result: &Result<T, RkvError>) {
        self.state = if result.is_ok() { TxState::Committed } else { TxState::Closed };
        self.pin = None;
    }

    pub fn close(&mut self) {
        self.state = TxState::Closed;
        self.pin = None;
        self.writes = WriteBuffer::new();
        self.reads = KeyRanges::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(k: &str, v: &str) -> Mutation {
        Mutation::Put { key: k.as_bytes().to_vec(), value: v.as_bytes().to_vec() }
    }

    fn pair(k: &str, v: &str) -> (Vec<u8>, Vec<u8>) {
        (k.as_bytes().to_vec(), v.as_bytes().to_vec())
    }

    fn store() -> MvccStore {
        let mut sm = MvccStore::new();
        sm.apply(1, 1, &[put("a", "1"), put("b", "1"), put("c", "1"), put("d", "1")]).unwrap();
        sm
    }

    #[test]
    fn later_writes_shadow_earlier_ones() {
        let buffer: WriteBuffer = [
            put("b", "2"),
            Mutation::DeleteRange { range: KeyRange::new(b"a".to_vec(), Some(b"c".to_vec())) },
            put("a", "3"),
        ]
        .into_iter()
        .collect();
        assert_eq!(buffer.lookup(b"a"), Some(Some(&b"3"[..])));
        assert_eq!(buffer.lookup(b"b"), Some(None));
        assert_eq!(buffer.lookup(b"c"), None);
        assert_eq!(buffer.mutations().len(), 3);
    }

    #[test]
    fn scan_merges_layers_over_the_store() {
        let sm = store();
        let pending: WriteBuffer = [put("e", "p"), Mutation::Delete { key: b"b".to_vec() }].into_iter().collect();
        let own: WriteBuffer = [put("b", "own"), Mutation::Delete { key: b"c".to_vec() }].into_iter().collect();

        let rows = layered_scan(&sm, 1, &[&own, &pending], &KeyRange::all(), usize::MAX);
        assert_eq!(rows, vec![pair("a", "1"), pair("b", "own"), pair("d", "1"), pair("e", "p")]);

        let rows = layered_scan(&sm, 1, &[&pending], &KeyRange::all(), 2);
        assert_eq!(rows, vec![pair("a", "1"), pair("c", "1")]);
        assert_eq!(layered_get(&sm, 1, &[&own, &pending], b"c"), None);
        assert_eq!(layered_get(&sm, 1, &[&pending], b"c"), Some(b"1".to_vec()));
    }

    #[test]
    fn scan_pages_past_deleted_keys() {
        let mut sm = MvccStore::new();
        let many: Vec<Mutation> = (0..100).map(|i| put(&format!("k{i:03}"), "v")).collect();
        sm.apply(1, 1, &many).unwrap();
        let own: WriteBuffer = [Mutation::DeleteRange {
            range: KeyRange::new(b"k000".to_vec(), Some(b"k090".to_vec())),
        }]
        .into_iter()
        .collect();

        let rows = layered_scan(&sm, 1, &[&own], &KeyRange::all(), 5);
        assert_eq!(rows.first().map(|(k, _)| k.clone()), Some(b"k090".to_vec()));
        assert_eq!(rows.len(), 5);
    }

    #[test]
    fn limited_scans_observe_only_what_they_returned() {
        let range = KeyRange::all();
        let rows = vec![pair("a", "1"), pair("b", "1")];
        assert_eq!(observed_range(&range, &rows, 2), KeyRange::new(Vec::new(), Some(b"b\x00".to_vec())));
        assert_eq!(observed_range(&range, &rows, 10), range);
    }

    #[test]
    fn core_rejects_use_after_close() {
        let mut core = TxCore::new(Consistency::Eventual, 0, Duration::from_secs(5), None);
        core.write(put("a", "1")).unwrap();
        assert!(matches!(core.write(put("", "1")), Err(RkvError::InvalidArgument(_))));
        core.close();
        assert!(matches!(core.write(put("a", "1")), Err(RkvError::InvalidState(_))));
    }

    #[test]
    fn core_times_out() {
        let mut core = TxCore::new(Consistency::Eventual, 0, Duration::ZERO, None);
        assert_eq!(core.check_open(), Err(RkvError::Timeout));
        assert_eq!(core.state, TxState::Closed);
    }
}
