//! Link resolution cache.
//!
//! Only the outgoing direction is stored, so "which links point at X" has to
//! be derived. The graph derives it from the store (resident link endpoints
//! plus the reverse map built from frame headers), verifies the result under
//! the entities' locks, and memoizes it here per target.
//!
//! A memoized list is invalidated, never patched, whenever a link with that
//! target appears, disappears or is retargeted, when the target itself is
//! removed, and when one of the list's From-entities is evicted.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::event::{EventSink, GraphEvent};
use crate::id::NeuronId;

struct Memo {
    links: Arc<[NeuronId]>,
    froms: Vec<NeuronId>,
}

struct Inner {
    memo: LruCache<NeuronId, Memo>,
    /// From-entity -> targets whose memoized list includes one of its links.
    contributors: HashMap<NeuronId, HashSet<NeuronId>>,
    hits: u64,
    misses: u64,
}

impl Inner {
    /// Drop the memo for `to` and its contributor entries.
    fn pop(&mut self, to: NeuronId) {
        if let Some(memo) = self.memo.pop(&to) {
            self.forget_contributors(to, &memo.froms);
        }
    }

    fn forget_contributors(&mut self, to: NeuronId, froms: &[NeuronId]) {
        for from in froms {
            if let Some(targets) = self.contributors.get_mut(from) {
                targets.remove(&to);
                if targets.is_empty() {
                    self.contributors.remove(from);
                }
            }
        }
    }
}

/// Bounded memo of verified in-link lists.
pub struct LinkCache {
    inner: Mutex<Inner>,
}

impl LinkCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                memo: LruCache::new(capacity),
                contributors: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Memoized in-links of `to`, if any.
    pub fn get(&self, to: NeuronId) -> Option<Arc<[NeuronId]>> {
        let mut inner = self.inner.lock();
        match inner.memo.get(&to).map(|m| Arc::clone(&m.links)) {
            Some(links) => {
                inner.hits += 1;
                Some(links)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Whether `links` is still the memoized list for `to`.
    pub fn is_current(&self, to: NeuronId, links: &Arc<[NeuronId]>) -> bool {
        self.inner
            .lock()
            .memo
            .peek(&to)
            .is_some_and(|current| Arc::ptr_eq(&current.links, links))
    }

    /// Memoize a verified list. Must be called while the list is locked.
    pub fn insert(
        &self,
        to: NeuronId,
        links: Vec<NeuronId>,
        froms: impl IntoIterator<Item = NeuronId>,
    ) -> Arc<[NeuronId]> {
        let links: Arc<[NeuronId]> = links.into();
        let mut froms: Vec<NeuronId> = froms.into_iter().collect();
        froms.sort_unstable();
        froms.dedup();
        let mut inner = self.inner.lock();
        inner.pop(to);
        for from in &froms {
            inner.contributors.entry(*from).or_default().insert(to);
        }
        let memo = Memo {
            links: Arc::clone(&links),
            froms,
        };
        if let Some((evicted, old)) = inner.memo.push(to, memo) {
            inner.forget_contributors(evicted, &old.froms);
        }
        links
    }

    pub fn invalidate(&self, to: NeuronId) {
        self.inner.lock().pop(to);
    }

    fn invalidate_contributor(&self, from: NeuronId) {
        let mut inner = self.inner.lock();
        inner.pop(from);
        if let Some(targets) = inner.contributors.remove(&from) {
            for to in targets {
                inner.pop(to);
            }
        }
    }

    /// Number of From-entities some memoized list depends on.
    #[cfg(test)]
    fn contributor_count(&self) -> usize {
        self.inner.lock().contributors.len()
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.memo.clear();
        inner.contributors.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation.
    pub fn hit_stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.hits, inner.misses)
    }
}

impl EventSink for LinkCache {
    fn on_event(&self, event: &GraphEvent) {
        match event {
            GraphEvent::LinkChanged { before, after, .. } => {
                for ends in before.iter().chain(after.iter()) {
                    self.invalidate(ends.to);
                }
            }
            GraphEvent::Removed { id, .. } | GraphEvent::Evicted { id } => {
                self.invalidate_contributor(*id);
            }
            GraphEvent::Cleared => self.reset(),
            GraphEvent::Created { .. }
            | GraphEvent::NeuronChanged { .. }
            | GraphEvent::AfterLoaded { .. } => {}
        }
    }
}

impl std::fmt::Debug for LinkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LinkCache")
            .field("memoized", &inner.memo.len())
            .field("capacity", &inner.memo.cap())
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

    fn ends(from: u64, to: u64) -> LinkEnds {
        LinkEnds {
            from: nid(from),
            to: nid(to),
            meaning: nid(99),
        }
    }

    #[test]
    fn insert_then_get() {
        let cache = LinkCache::new(4);
        let stored = cache.insert(nid(2), vec![nid(10)], [nid(1)]);
        let got = cache.get(nid(2)).unwrap();
        assert!(Arc::ptr_eq(&stored, &got));
        assert!(cache.is_current(nid(2), &got));
        assert_eq!(cache.hit_stats(), (1, 0));
    }

    #[test]
    fn retarget_invalidates_old_and_new_target() {
        let cache = LinkCache::new(4);
        cache.insert(nid(2), vec![nid(10)], [nid(1)]);
        cache.insert(nid(3), vec![], []);
        cache.on_event(&GraphEvent::LinkChanged {
            link: nid(10),
            before: Some(ends(1, 2)),
            after: Some(ends(1, 3)),
            target_value: None,
        });
        assert!(cache.get(nid(2)).is_none());
        assert!(cache.get(nid(3)).is_none());
    }

    #[test]
    fn evicting_a_contributor_invalidates_its_targets() {
        let cache = LinkCache::new(4);
        let old = cache.insert(nid(2), vec![nid(10)], [nid(1)]);
        cache.insert(nid(5), vec![nid(11)], [nid(4)]);
        cache.on_event(&GraphEvent::Evicted { id: nid(1) });
        assert!(!cache.is_current(nid(2), &old));
        assert!(cache.get(nid(5)).is_some());
    }

    #[test]
    fn capacity_bounds_memo() {
        let cache = LinkCache::new(2);
        for i in 1..=3 {
            cache.insert(nid(i), vec![], []);
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(nid(1)).is_none());
    }

    #[test]
    fn contributors_shrink_with_the_memo() {
        let cache = LinkCache::new(2);
        cache.insert(nid(2), vec![nid(10)], [nid(1)]);
        cache.insert(nid(3), vec![nid(11)], [nid(1)]);
        cache.insert(nid(4), vec![nid(12)], [nid(5)]);
        // Capacity pushed out the memo for 2; 1 still feeds the one for 3.
        assert_eq!(cache.contributor_count(), 2);

        cache.invalidate(nid(3));
        assert_eq!(cache.contributor_count(), 1);
        cache.on_event(&GraphEvent::LinkChanged {
            link: nid(12),
            before: Some(ends(5, 4)),
            after: None,
            target_value: None,
        });
        assert_eq!(cache.contributor_count(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn cleared_resets() {
        let cache = LinkCache::new(2);
        cache.insert(nid(1), vec![], []);
        cache.on_event(&GraphEvent::Cleared);
        assert!(cache.is_empty());
    }
}
