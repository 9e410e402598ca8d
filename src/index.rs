//! Secondary scalar index.
//!
//! Answers "the first neuron reachable from `source` through one of its
//! out-links whose target carries value `v`" without scanning the out-list
//! on every lookup. Per source the index maps value kind -> literal value ->
//! (target, link). The first link seen for a key wins; later duplicates are
//! ignored.
//!
//! Per source the state is `Unindexed -> Indexed` on first lookup or
//! explicit indexing, and back to `Unindexed` when the source changes, is
//! removed, or the graph is cleared. Changing a target's value also drops
//! every source that indexed it. Link changes patch only the affected
//! buckets. The index is an accelerator: a miss is never proof of absence.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;

use crate::config::IndexConfig;
use crate::event::{EventSink, GraphEvent};
use crate::id::NeuronId;
use crate::neuron::{ScalarKind, ScalarValue};

/// Hashable form of a scalar. Doubles compare by bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ScalarKey {
    Int(i64),
    Double(u64),
    Text(String),
}

impl ScalarKey {
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarKey::Int(_) => ScalarKind::Int,
            ScalarKey::Double(_) => ScalarKind::Double,
            ScalarKey::Text(_) => ScalarKind::Text,
        }
    }
}

impl From<&ScalarValue> for ScalarKey {
    fn from(value: &ScalarValue) -> Self {
        match value {
            ScalarValue::Int(v) => ScalarKey::Int(*v),
            // -0.0 and 0.0 are the same value.
            ScalarValue::Double(v) if *v == 0.0 => ScalarKey::Double(0.0f64.to_bits()),
            ScalarValue::Double(v) => ScalarKey::Double(v.to_bits()),
            ScalarValue::Text(v) => ScalarKey::Text(v.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub target: NeuronId,
    pub link: NeuronId,
}

#[derive(Debug, Default)]
struct SourceIndex {
    buckets: HashMap<ScalarKind, HashMap<ScalarKey, IndexEntry>>,
}

impl SourceIndex {
    /// First write wins. Returns whether the entry was stored.
    fn insert(&mut self, key: ScalarKey, entry: IndexEntry) -> bool {
        let bucket = self.buckets.entry(key.kind()).or_default();
        if bucket.contains_key(&key) {
            return false;
        }
        bucket.insert(key, entry);
        true
    }

    fn get(&self, key: &ScalarKey) -> Option<IndexEntry> {
        self.buckets.get(&key.kind())?.get(key).copied()
    }

    fn remove_link(&mut self, link: NeuronId) -> Vec<NeuronId> {
        let mut targets = Vec::new();
        for bucket in self.buckets.values_mut() {
            bucket.retain(|_, e| {
                if e.link == link {
                    targets.push(e.target);
                    false
                } else {
                    true
                }
            });
        }
        targets
    }

    fn targets(&self) -> impl Iterator<Item = NeuronId> + '_ {
        self.buckets.values().flat_map(|b| b.values().map(|e| e.target))
    }

    fn len(&self) -> usize {
        self.buckets.values().map(HashMap::len).sum()
    }
}

/// Outcome of an index lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The source has no index yet; build it and look again.
    Unindexed,
    Hit(NeuronId),
    Miss,
}

/// Process-wide scalar index for one graph.
pub struct ScalarIndex {
    config: IndexConfig,
    sources: DashMap<NeuronId, SourceIndex>,
    /// Target -> sources holding an entry that points at it.
    targets: DashMap<NeuronId, HashSet<NeuronId>>,
}

impl ScalarIndex {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            sources: DashMap::new(),
            targets: DashMap::new(),
        }
    }

    pub fn supports(&self, kind: ScalarKind) -> bool {
        self.config.supports(kind)
    }

    pub fn is_indexed(&self, source: NeuronId) -> bool {
        self.sources.contains_key(&source)
    }

    pub fn lookup(&self, source: NeuronId, value: &ScalarValue) -> Lookup {
        let key = ScalarKey::from(value);
        match self.sources.get(&source) {
            None => Lookup::Unindexed,
            Some(index) => match index.get(&key) {
                Some(entry) => Lookup::Hit(entry.target),
                None => Lookup::Miss,
            },
        }
    }

    /// Install a freshly built index for `source`, replacing any previous one.
    ///
    /// `entries` must be in out-list order so the first link wins. Callers
    /// hold the source, its out-links and their targets locked.
    pub(crate) fn install(
        &self,
        source: NeuronId,
        entries: impl IntoIterator<Item = (ScalarKey, IndexEntry)>,
    ) -> usize {
        self.drop_source(source);
        let mut index = SourceIndex::default();
        let mut targets = HashSet::new();
        for (key, entry) in entries {
            if !self.supports(key.kind()) {
                continue;
            }
            if index.insert(key, entry) {
                targets.insert(entry.target);
            }
        }
        let len = index.len();
        self.sources.insert(source, index);
        for target in targets {
            self.targets.entry(target).or_default().insert(source);
        }
        tracing::debug!(%source, entries = len, "indexed source");
        len
    }

    /// Return `source` to `Unindexed`.
    pub fn drop_source(&self, source: NeuronId) {
        let Some((_, index)) = self.sources.remove(&source) else {
            return;
        };
        let targets: HashSet<NeuronId> = index.targets().collect();
        for target in targets {
            self.unlink_target(target, source);
        }
    }

    /// Drop every source that holds an entry pointing at `target`.
    fn drop_target(&self, target: NeuronId) {
        let Some((_, sources)) = self.targets.remove(&target) else {
            return;
        };
        for source in sources {
            self.drop_source(source);
        }
    }

    fn unlink_target(&self, target: NeuronId, source: NeuronId) {
        if let Some(mut sources) = self.targets.get_mut(&target) {
            sources.remove(&source);
        }
        self.targets.remove_if(&target, |_, sources| sources.is_empty());
    }

    fn patch_link(
        &self,
        link: NeuronId,
        before: Option<NeuronId>,
        after: Option<(NeuronId, NeuronId, &ScalarValue)>,
    ) {
        if let Some(from) = before {
            let removed = match self.sources.get_mut(&from) {
                Some(mut index) => index.remove_link(link),
                None => Vec::new(),
            };
            for target in removed {
                self.unlink_target(target, from);
            }
        }
        if let Some((from, to, value)) = after {
            if !self.supports(value.kind()) {
                return;
            }
            let inserted = match self.sources.get_mut(&from) {
                Some(mut index) => index.insert(ScalarKey::from(value), IndexEntry { target: to, link }),
                None => false,
            };
            if inserted {
                self.targets.entry(to).or_default().insert(from);
            }
        }
    }

    pub fn reset(&self) {
        self.sources.clear();
        self.targets.clear();
    }

    /// Number of indexed sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl EventSink for ScalarIndex {
    fn on_event(&self, event: &GraphEvent) {
        match event {
            GraphEvent::NeuronChanged { id } | GraphEvent::Removed { id, .. } => {
                self.drop_source(*id);
                self.drop_target(*id);
            }
            GraphEvent::LinkChanged {
                link,
                before,
                after,
                target_value,
            } => {
                let after = match (after, target_value) {
                    (Some(ends), Some(value)) => Some((ends.from, ends.to, value)),
                    _ => None,
                };
                self.patch_link(*link, before.map(|e| e.from), after);
            }
            GraphEvent::Cleared => self.reset(),
            GraphEvent::Created { .. } | GraphEvent::Evicted { .. } | GraphEvent::AfterLoaded { .. } => {}
        }
    }
}

impl std::fmt::Debug for ScalarIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalarIndex")
            .field("sources", &self.sources.len())
            .field("kinds", &self.config.kinds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neuron::LinkEnds;

    fn nid(raw: u64) -> NeuronId {
        NeuronId::new(raw).unwrap()
    }

    fn entry(target: u64, link: u64) -> IndexEntry {
        IndexEntry {
            target: nid(target),
            link: nid(link),
        }
    }

    fn text(s: &str) -> ScalarValue {
        ScalarValue::Text(s.into())
    }

    fn indexed() -> ScalarIndex {
        let index = ScalarIndex::new(IndexConfig::default());
        index.install(
            nid(1),
            [
                (ScalarKey::from(&text("red")), entry(10, 20)),
                (ScalarKey::from(&text("red")), entry(11, 21)),
                (ScalarKey::from(&ScalarValue::Int(3)), entry(12, 22)),
            ],
        );
        index
    }

    #[test]
    fn unindexed_until_installed() {
        let index = ScalarIndex::new(IndexConfig::default());
        assert_eq!(index.lookup(nid(1), &text("red")), Lookup::Unindexed);
    }

    #[test]
    fn first_write_wins() {
        let index = indexed();
        assert_eq!(index.lookup(nid(1), &text("red")), Lookup::Hit(nid(10)));
        assert_eq!(index.lookup(nid(1), &ScalarValue::Int(3)), Lookup::Hit(nid(12)));
        assert_eq!(index.lookup(nid(1), &text("blue")), Lookup::Miss);
    }

    #[test]
    fn kinds_do_not_collide() {
        let index = ScalarIndex::new(IndexConfig::default());
        index.install(
            nid(1),
            [(ScalarKey::from(&ScalarValue::Int(1)), entry(10, 20))],
        );
        assert_eq!(index.lookup(nid(1), &ScalarValue::Double(1.0)), Lookup::Miss);
    }

    #[test]
    fn source_change_drops_whole_index() {
        let index = indexed();
        index.on_event(&GraphEvent::NeuronChanged { id: nid(1) });
        assert!(!index.is_indexed(nid(1)));
    }

    #[test]
    fn target_change_drops_referencing_sources() {
        let index = indexed();
        index.on_event(&GraphEvent::NeuronChanged { id: nid(12) });
        assert_eq!(index.lookup(nid(1), &text("red")), Lookup::Unindexed);
    }

    #[test]
    fn link_removal_then_new_link_patches_bucket() {
        let index = indexed();
        let old = LinkEnds {
            from: nid(1),
            to: nid(10),
            meaning: nid(99),
        };
        index.on_event(&GraphEvent::LinkChanged {
            link: nid(20),
            before: Some(old),
            after: None,
            target_value: None,
        });
        assert_eq!(index.lookup(nid(1), &text("red")), Lookup::Miss);

        let new = LinkEnds {
            from: nid(1),
            to: nid(13),
            meaning: nid(99),
        };
        index.on_event(&GraphEvent::LinkChanged {
            link: nid(23),
            before: None,
            after: Some(new),
            target_value: Some(text("red")),
        });
        assert_eq!(index.lookup(nid(1), &text("red")), Lookup::Hit(nid(13)));
        assert_eq!(index.lookup(nid(1), &ScalarValue::Int(3)), Lookup::Hit(nid(12)));
    }

    #[test]
    fn unregistered_kinds_are_not_indexed() {
        let index = ScalarIndex::new(IndexConfig {
            enabled: true,
            kinds: vec![ScalarKind::Int],
        });
        index.install(nid(1), [(ScalarKey::from(&text("red")), entry(10, 20))]);
        assert_eq!(index.lookup(nid(1), &text("red")), Lookup::Miss);
    }

    #[test]
    fn negative_zero_matches_zero() {
        assert_eq!(
            ScalarKey::from(&ScalarValue::Double(-0.0)),
            ScalarKey::from(&ScalarValue::Double(0.0))
        );
    }
}
