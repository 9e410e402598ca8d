//! Multi-entity lock manager.
//!
//! A logical operation names every entity it touches up front; the set is
//! sorted by id and locked in that order, all or nothing, blocking without
//! timeout. The result is a [`LockedSet`], the only way to read or mutate
//! entity bodies. Guarded mutators live on it, so mutating without holding
//! the relevant locks does not type-check.
//!
//! Lock sets are not re-entrant: while a thread holds a set on a graph it may
//! not request another one on the same graph. Every thread therefore holds
//! at most one sorted set at a time, which rules out hold-and-wait between
//! separate requests and with it cross-call deadlock.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use parking_lot::RawMutex;
use parking_lot::lock_api::ArcMutexGuard;

use crate::error::{EntityError, LockError, NeuroResult};
use crate::event::GraphEvent;
use crate::graph::Graph;
use crate::id::NeuronId;
use crate::neuron::{LinkEnds, Neuron, NeuronBody, Payload, ScalarValue};

thread_local! {
    /// Lock sets held by this thread, per graph instance.
    static HELD: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

/// Number of lock sets the current thread holds on graph `key`.
pub(crate) fn held_sets(key: u64) -> usize {
    HELD.with(|held| held.borrow().get(&key).copied().unwrap_or(0))
}

fn enter(key: u64) {
    HELD.with(|held| *held.borrow_mut().entry(key).or_insert(0) += 1);
}

fn leave(key: u64) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(count) = held.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                held.remove(&key);
            }
        }
    });
}

/// Fail with `LockError::Nested` if this thread already holds a set on `key`.
pub(crate) fn ensure_unlocked(key: u64) -> Result<(), LockError> {
    match held_sets(key) {
        0 => Ok(()),
        held => Err(LockError::Nested { held }),
    }
}

struct Held {
    guard: ArcMutexGuard<RawMutex, NeuronBody>,
    neuron: Neuron,
}

/// Evidence that a set of entities is exclusively locked.
///
/// Locks are released in reverse acquisition order when the set is dropped
/// or [`release`](Self::release)d, on every exit path.
pub struct LockedSet<'g> {
    graph: &'g Graph,
    /// Ascending by id.
    held: Vec<Held>,
}

impl<'g> LockedSet<'g> {
    /// Resolve, sort and lock `ids`.
    ///
    /// Non-resident entities are paged in first. Fails without locking
    /// anything on a placeholder id, an unknown id, or a nested request, and
    /// releases everything again if any entity turns out to be deleted.
    pub(crate) fn acquire(
        graph: &'g Graph,
        ids: impl IntoIterator<Item = NeuronId>,
    ) -> NeuroResult<Self> {
        let ordered: BTreeSet<NeuronId> = ids.into_iter().collect();
        if ordered.contains(&NeuronId::TEMP) {
            return Err(EntityError::InvalidEntity {
                id: NeuronId::TEMP.to_string(),
                reason: "uncommitted entities cannot be locked; add them first".into(),
            }
            .into());
        }
        ensure_unlocked(graph.key())?;

        let mut neurons = Vec::with_capacity(ordered.len());
        for id in &ordered {
            neurons.push(graph.get(*id)?);
        }

        enter(graph.key());
        let mut set = LockedSet {
            graph,
            held: Vec::with_capacity(neurons.len()),
        };
        for neuron in neurons {
            let guard = neuron.body().lock_arc();
            set.held.push(Held { guard, neuron });
        }
        if let Some(dead) = set.held.iter().find(|h| h.neuron.is_deleted()) {
            let id = dead.neuron.id().get();
            drop(set);
            return Err(EntityError::Deleted { id }.into());
        }
        Ok(set)
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Held ids, ascending.
    pub fn ids(&self) -> impl Iterator<Item = NeuronId> + '_ {
        self.held.iter().map(|h| h.neuron.id())
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn contains(&self, id: NeuronId) -> bool {
        self.slot(id).is_ok()
    }

    fn slot(&self, id: NeuronId) -> Result<usize, LockError> {
        self.held
            .binary_search_by_key(&id, |h| h.neuron.id())
            .map_err(|_| LockError::NotHeld { id: id.get() })
    }

    pub fn neuron(&self, id: NeuronId) -> Result<&Neuron, LockError> {
        Ok(&self.held[self.slot(id)?].neuron)
    }

    pub fn body(&self, id: NeuronId) -> Result<&NeuronBody, LockError> {
        Ok(&self.held[self.slot(id)?].guard)
    }

    /// Scalar carried by `id`, if it is a value neuron.
    pub fn value(&self, id: NeuronId) -> Result<Option<&ScalarValue>, LockError> {
        Ok(self.body(id)?.scalar())
    }

    fn held_mut(&mut self, id: NeuronId) -> Result<&mut Held, LockError> {
        let slot = self.slot(id)?;
        Ok(&mut self.held[slot])
    }

    fn link_ends(&self, link: NeuronId) -> NeuroResult<LinkEnds> {
        let held = &self.held[self.slot(link)?];
        held.guard
            .link()
            .map(|l| l.ends())
            .ok_or_else(|| kind_mismatch(link, "link", &held.neuron).into())
    }

    fn publish(&self, event: GraphEvent) {
        self.graph.publish(&event);
    }

    // ── Scalars ─────────────────────────────────────────────────────────

    /// Replace the value of a scalar neuron. The kind cannot change.
    pub fn set_value(&mut self, id: NeuronId, value: impl Into<ScalarValue>) -> NeuroResult<()> {
        let value = value.into();
        let held = self.held_mut(id)?;
        match &mut held.guard.payload {
            Payload::Scalar(current) if current.kind() == value.kind() => *current = value,
            Payload::Scalar(current) => {
                return Err(EntityError::KindMismatch {
                    id: id.get(),
                    expected: current.kind().to_string(),
                    actual: value.kind().to_string(),
                }
                .into());
            }
            _ => return Err(kind_mismatch(id, "scalar", &held.neuron).into()),
        }
        held.neuron.mark_changed();
        self.publish(GraphEvent::NeuronChanged { id });
        Ok(())
    }

    // ── Clusters ────────────────────────────────────────────────────────

    /// Append `child` to `cluster`. Both must be held.
    pub fn add_child(&mut self, cluster: NeuronId, child: NeuronId) -> NeuroResult<()> {
        self.slot(child)?;
        let held = self.held_mut(cluster)?;
        let Some(body) = held.guard.cluster_mut() else {
            return Err(kind_mismatch(cluster, "cluster", &held.neuron).into());
        };
        body.children.push(child);
        held.neuron.mark_changed();

        let member = self.held_mut(child)?;
        member.guard.add_owner(cluster);
        member.neuron.mark_changed();

        self.publish(GraphEvent::NeuronChanged { id: cluster });
        Ok(())
    }

    pub fn add_children(&mut self, cluster: NeuronId, children: &[NeuronId]) -> NeuroResult<()> {
        for child in children {
            self.slot(*child)?;
        }
        for child in children {
            self.add_child(cluster, *child)?;
        }
        Ok(())
    }

    /// Remove the first occurrence of `child`. Returns whether it was present.
    pub fn remove_child(&mut self, cluster: NeuronId, child: NeuronId) -> NeuroResult<bool> {
        self.slot(child)?;
        let held = self.held_mut(cluster)?;
        let Some(body) = held.guard.cluster_mut() else {
            return Err(kind_mismatch(cluster, "cluster", &held.neuron).into());
        };
        let Some(pos) = body.children.iter().position(|c| *c == child) else {
            return Ok(false);
        };
        body.children.remove(pos);
        let still_member = body.children.contains(&child);
        held.neuron.mark_changed();

        if !still_member {
            let member = self.held_mut(child)?;
            member.guard.remove_owner(cluster);
            member.neuron.mark_changed();
        }
        self.publish(GraphEvent::NeuronChanged { id: cluster });
        Ok(true)
    }

    /// Remove every member. All current members must be held.
    pub fn clear_children(&mut self, cluster: NeuronId) -> NeuroResult<()> {
        let children: BTreeSet<NeuronId> = {
            let held = &self.held[self.slot(cluster)?];
            match held.guard.cluster() {
                Some(body) => body.children.iter().copied().collect(),
                None => return Err(kind_mismatch(cluster, "cluster", &held.neuron).into()),
            }
        };
        for child in &children {
            self.slot(*child)?;
        }

        let held = self.held_mut(cluster)?;
        if let Some(body) = held.guard.cluster_mut() {
            body.children.clear();
        }
        held.neuron.mark_changed();
        for child in children {
            let member = self.held_mut(child)?;
            member.guard.remove_owner(cluster);
            member.neuron.mark_changed();
        }
        self.publish(GraphEvent::NeuronChanged { id: cluster });
        Ok(())
    }

    /// Reclassify `cluster`. A new meaning must be held too.
    pub fn set_cluster_meaning(
        &mut self,
        cluster: NeuronId,
        meaning: Option<NeuronId>,
    ) -> NeuroResult<()> {
        if let Some(meaning) = meaning {
            self.slot(meaning)?;
        }
        let held = self.held_mut(cluster)?;
        let Some(body) = held.guard.cluster_mut() else {
            return Err(kind_mismatch(cluster, "cluster", &held.neuron).into());
        };
        body.meaning = meaning;
        held.neuron.mark_changed();
        self.track_annotations(cluster)?;
        self.publish(GraphEvent::NeuronChanged { id: cluster });
        Ok(())
    }

    // ── Links ───────────────────────────────────────────────────────────

    /// Point `link` at `new_to`. The link, its old and its new target must be held.
    pub fn retarget(&mut self, link: NeuronId, new_to: NeuronId) -> NeuroResult<()> {
        let before = self.link_ends(link)?;
        self.slot(before.to)?;
        self.slot(new_to)?;
        if before.to == new_to {
            return Ok(());
        }
        let after = LinkEnds {
            to: new_to,
            ..before
        };
        self.rewrite_link(link, after)?;
        let target_value = self.value(new_to)?.cloned();
        self.publish(GraphEvent::LinkChanged {
            link,
            before: Some(before),
            after: Some(after),
            target_value,
        });
        Ok(())
    }

    /// Move `link` to a new From-entity. The link, its target, and its old
    /// and new source must be held.
    pub fn set_link_from(&mut self, link: NeuronId, new_from: NeuronId) -> NeuroResult<()> {
        let before = self.link_ends(link)?;
        self.slot(before.from)?;
        self.slot(before.to)?;
        self.slot(new_from)?;
        if before.from == new_from {
            return Ok(());
        }
        let after = LinkEnds {
            from: new_from,
            ..before
        };

        let old = self.held_mut(before.from)?;
        old.guard.remove_out(link);
        old.neuron.mark_changed();
        let new = self.held_mut(new_from)?;
        new.guard.links_out.push(link);
        new.neuron.mark_changed();
        self.rewrite_link(link, after)?;

        let target_value = self.value(after.to)?.cloned();
        self.publish(GraphEvent::LinkChanged {
            link,
            before: Some(before),
            after: Some(after),
            target_value,
        });
        Ok(())
    }

    /// Reclassify `link`. The link, its target and the new meaning must be held.
    pub fn set_link_meaning(&mut self, link: NeuronId, meaning: NeuronId) -> NeuroResult<()> {
        let before = self.link_ends(link)?;
        self.slot(before.to)?;
        self.slot(meaning)?;
        if before.meaning == meaning {
            return Ok(());
        }
        let after = LinkEnds { meaning, ..before };
        self.rewrite_link(link, after)?;
        let target_value = self.value(after.to)?.cloned();
        self.publish(GraphEvent::LinkChanged {
            link,
            before: Some(before),
            after: Some(after),
            target_value,
        });
        Ok(())
    }

    /// Replace the annotation list of `link`. Every entry must be held.
    pub fn set_link_info(&mut self, link: NeuronId, info: Vec<NeuronId>) -> NeuroResult<()> {
        for r in &info {
            self.slot(*r)?;
        }
        let held = self.held_mut(link)?;
        let Some(body) = held.guard.link_mut() else {
            return Err(kind_mismatch(link, "link", &held.neuron).into());
        };
        body.info = info;
        held.neuron.mark_changed();
        self.track_annotations(link)?;
        self.publish(GraphEvent::NeuronChanged { id: link });
        Ok(())
    }

    fn rewrite_link(&mut self, link: NeuronId, ends: LinkEnds) -> NeuroResult<()> {
        let held = self.held_mut(link)?;
        let Some(body) = held.guard.link_mut() else {
            return Err(kind_mismatch(link, "link", &held.neuron).into());
        };
        body.ends = ends;
        held.neuron.mark_changed();
        self.graph.store().track_link(link, ends);
        self.track_annotations(link)?;
        Ok(())
    }

    fn track_annotations(&self, id: NeuronId) -> Result<(), LockError> {
        let annotations = self.body(id)?.annotations();
        self.graph.store().track_annotations(id, annotations);
        Ok(())
    }

    // ── Crate-internal structural edits ─────────────────────────────────

    pub(crate) fn body_mut(&mut self, id: NeuronId) -> Result<&mut NeuronBody, LockError> {
        let held = self.held_mut(id)?;
        held.neuron.mark_changed();
        Ok(&mut held.guard)
    }

    /// Release all locks now.
    pub fn release(self) {}
}

impl Drop for LockedSet<'_> {
    fn drop(&mut self) {
        while let Some(held) = self.held.pop() {
            drop(held);
        }
        leave(self.graph.key());
        self.graph.after_release();
    }
}

impl std::fmt::Debug for LockedSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

fn kind_mismatch(id: NeuronId, expected: &str, neuron: &Neuron) -> EntityError {
    EntityError::KindMismatch {
        id: id.get(),
        expected: expected.to_string(),
        actual: neuron.type_tag().to_string(),
    }
}
