//! Graph facade: the explicit context object every operation goes through.
//!
//! A [`Graph`] owns the id allocator, the store, the lock bookkeeping, the
//! link resolution cache, the scalar index and the event bus. Several
//! independent graphs can live in one process.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cancel::CancelFlag;
use crate::config::{GraphConfig, StorageMode};
use crate::error::{EntityError, IndexError, NeuroError, NeuroResult, StoreError};
use crate::event::{EventBus, EventSink, GraphEvent, Subscription};
use crate::id::{IdAllocator, NeuronId};
use crate::index::{IndexEntry, Lookup, ScalarIndex, ScalarKey};
use crate::links::LinkCache;
use crate::lock::{self, LockedSet};
use crate::neuron::{LinkEnds, Neuron, NeuronBody, ScalarValue};
use crate::store::{AttachReport, CANCEL_POLL_INTERVAL, SaveReport, Store, VerifyReport};

static NEXT_GRAPH_KEY: AtomicU64 = AtomicU64::new(1);

/// Which links a view covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
    /// Out-links followed by in-links; a self-link appears once.
    Both,
}

/// A lock-bracketed list of ids.
///
/// The ids and every entity they name stay locked until the view is
/// released or dropped, so structural changes cannot interleave with
/// enumeration.
pub struct LockedView<'g> {
    set: LockedSet<'g>,
    ids: Vec<NeuronId>,
}

impl<'g> LockedView<'g> {
    pub fn ids(&self) -> &[NeuronId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: NeuronId) -> bool {
        self.ids.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = NeuronId> + '_ {
        self.ids.iter().copied()
    }

    /// Endpoints of a link in this view.
    pub fn ends(&self, link: NeuronId) -> Option<LinkEnds> {
        self.set.body(link).ok()?.link().map(|l| l.ends())
    }

    pub fn locked(&self) -> &LockedSet<'g> {
        &self.set
    }

    /// Mutate through the held locks, e.g. to clear a cluster being enumerated.
    pub fn locked_mut(&mut self) -> &mut LockedSet<'g> {
        &mut self.set
    }

    pub fn release(self) {}
}

impl std::fmt::Debug for LockedView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.ids).finish()
    }
}

/// Snapshot of graph state.
#[derive(Debug, Clone)]
pub struct GraphInfo {
    pub storage_mode: StorageMode,
    pub high_water_mark: usize,
    pub resident: usize,
    pub dirty: usize,
    pub stored: usize,
    pub streamed: usize,
    pub tombstones: usize,
    pub next_id: u64,
    pub memoized_in_lists: usize,
    pub indexed_sources: usize,
    pub path: Option<PathBuf>,
}

impl std::fmt::Display for GraphInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "neurograph info")?;
        writeln!(f, "  mode:            {}", self.storage_mode)?;
        writeln!(f, "  high-water mark: {}", self.high_water_mark)?;
        writeln!(f, "  resident:        {}", self.resident)?;
        writeln!(f, "  dirty:           {}", self.dirty)?;
        writeln!(f, "  stored:          {}", self.stored)?;
        writeln!(f, "  streamed:        {}", self.streamed)?;
        writeln!(f, "  tombstones:      {}", self.tombstones)?;
        writeln!(f, "  next id:         {}", self.next_id)?;
        writeln!(f, "  in-link memos:   {}", self.memoized_in_lists)?;
        writeln!(f, "  indexed sources: {}", self.indexed_sources)?;
        match &self.path {
            Some(path) => writeln!(f, "  attached:        {}", path.display())?,
            None => writeln!(f, "  attached:        (none)")?,
        }
        Ok(())
    }
}

/// What destroying one entity reads from another.
struct Facts {
    links_out: Vec<NeuronId>,
    owners: Vec<NeuronId>,
    children: Vec<NeuronId>,
    ends: Option<LinkEnds>,
    annotations: Vec<NeuronId>,
}

impl Facts {
    fn of(body: &NeuronBody) -> Self {
        Self {
            links_out: body.links_out().to_vec(),
            owners: body.clustered_by().to_vec(),
            children: body.cluster().map(|c| c.children().to_vec()).unwrap_or_default(),
            ends: body.link().map(|l| l.ends()),
            annotations: body.annotations(),
        }
    }
}

/// Entities a destroy removes, and every entity it has to lock.
#[derive(Debug, Default)]
struct Plan {
    doomed: BTreeSet<NeuronId>,
    touched: BTreeSet<NeuronId>,
    /// `(referrer, doomed)`: an info entry or cluster meaning to clear.
    detach: BTreeSet<(NeuronId, NeuronId)>,
}

/// A concurrent, persistent, partially resident property graph.
pub struct Graph {
    key: u64,
    config: GraphConfig,
    ids: IdAllocator,
    store: Store,
    links: Arc<LinkCache>,
    index: Arc<ScalarIndex>,
    bus: EventBus,
    _sinks: Vec<Subscription>,
}

impl Graph {
    /// Create an empty, detached graph.
    pub fn new(config: GraphConfig) -> NeuroResult<Self> {
        config.validate()?;
        let store = Store::new(&config)?;
        let links = Arc::new(LinkCache::new(config.links_in_cache_capacity));
        let index = Arc::new(ScalarIndex::new(config.index.clone()));
        let bus = EventBus::new();
        let sinks = vec![
            bus.subscribe(Arc::clone(&links) as Arc<dyn EventSink>),
            bus.subscribe(Arc::clone(&index) as Arc<dyn EventSink>),
        ];
        tracing::info!(
            mode = %config.storage_mode,
            high_water_mark = config.cache_high_water_mark,
            "initializing graph"
        );
        Ok(Self {
            key: NEXT_GRAPH_KEY.fetch_add(1, Ordering::Relaxed),
            config,
            ids: IdAllocator::new(),
            store,
            links,
            index,
            bus,
            _sinks: sinks,
        })
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub(crate) fn publish(&self, event: &GraphEvent) {
        self.bus.publish(event);
    }

    /// Register a sink for graph events.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> Subscription {
        self.bus.subscribe(sink)
    }

    /// Evict if over the high-water mark. Runs whenever a lock set is released.
    pub(crate) fn after_release(&self) {
        for id in self.store.maybe_evict() {
            self.publish(&GraphEvent::Evicted { id });
        }
    }

    // ── Identity ────────────────────────────────────────────────────────

    /// Commit an entity: assign a durable id, make it resident, announce it.
    ///
    /// Links are appended to their From-entity's out-list; clusters become
    /// owners of their initial members. Every referenced entity, meanings and
    /// info entries included, must be live, and stays locked until the new
    /// entity is wired in.
    pub fn add(&self, neuron: &Neuron) -> NeuroResult<NeuronId> {
        if neuron.is_registered() {
            return Err(EntityError::InvalidEntity {
                id: neuron.id().to_string(),
                reason: "entity is already registered".into(),
            }
            .into());
        }
        if neuron.is_deleted() {
            return Err(EntityError::InvalidEntity {
                id: neuron.id().to_string(),
                reason: "entity handle belongs to a destroyed or cleared graph".into(),
            }
            .into());
        }

        let (ends, children, annotations) = {
            let body = neuron.body().lock();
            let children = body.cluster().map(|c| c.children().to_vec());
            (body.link().map(|l| l.ends()), children, body.annotations())
        };
        if ends.is_some() || children.is_some() {
            lock::ensure_unlocked(self.key)?;
        }
        let ends_refs = ends.iter().flat_map(|e| [e.from, e.to]);
        let member_refs = children.iter().flatten().copied();
        for r in ends_refs.chain(member_refs).chain(annotations.iter().copied()) {
            self.ensure_live(r)?;
        }

        let id = self.ids.next_id()?;
        if !neuron.assign_id(id) {
            return Err(EntityError::InvalidEntity {
                id: neuron.id().to_string(),
                reason: "entity is already registered".into(),
            }
            .into());
        }
        self.store.register(neuron.clone());
        self.publish(&GraphEvent::Created {
            id,
            tag: neuron.type_tag(),
        });

        let attached = match (ends, children) {
            (Some(ends), _) => self.attach_link(id, ends, annotations),
            (None, Some(children)) => self.attach_members(id, &children, annotations),
            (None, None) => Ok(()),
        };
        if let Err(e) = attached {
            self.abandon(neuron);
            return Err(e);
        }
        tracing::trace!(%id, tag = %neuron.type_tag(), "added entity");
        self.after_release();
        Ok(id)
    }

    /// [`add`](Self::add) for a handle the caller does not keep.
    pub fn create(&self, neuron: Neuron) -> NeuroResult<NeuronId> {
        self.add(&neuron)
    }

    /// Create a link `from -> to` classified by `meaning`.
    pub fn link(&self, from: NeuronId, to: NeuronId, meaning: NeuronId) -> NeuroResult<NeuronId> {
        self.add(&Neuron::link(from, to, meaning))
    }

    fn attach_link(
        &self,
        id: NeuronId,
        ends: LinkEnds,
        annotations: Vec<NeuronId>,
    ) -> NeuroResult<()> {
        let wanted = [id, ends.from, ends.to]
            .into_iter()
            .chain(annotations.iter().copied());
        let mut set = self.request_locks(wanted)?;
        set.body_mut(ends.from)?.links_out.push(id);
        self.store.track_link(id, ends);
        self.store.track_annotations(id, annotations);
        let target_value = set.value(ends.to)?.cloned();
        self.publish(&GraphEvent::LinkChanged {
            link: id,
            before: None,
            after: Some(ends),
            target_value,
        });
        Ok(())
    }

    fn attach_members(
        &self,
        id: NeuronId,
        children: &[NeuronId],
        annotations: Vec<NeuronId>,
    ) -> NeuroResult<()> {
        let wanted = std::iter::once(id)
            .chain(children.iter().copied())
            .chain(annotations.iter().copied());
        let mut set = self.request_locks(wanted)?;
        for child in children {
            set.body_mut(*child)?.add_owner(id);
        }
        self.store.track_annotations(id, annotations);
        Ok(())
    }

    /// Undo a half-finished add.
    fn abandon(&self, neuron: &Neuron) {
        let id = neuron.id();
        neuron.mark_deleted();
        self.store.forget(id);
        self.publish(&GraphEvent::Removed {
            id,
            tag: neuron.type_tag(),
        });
    }

    /// Resolve `id`, paging it in if needed. Never fails; store errors are logged.
    pub fn find(&self, id: NeuronId) -> Option<Neuron> {
        match self.store.page_in(id) {
            Ok(found) => found.filter(|n| !n.is_deleted()),
            Err(e) => {
                tracing::warn!(%id, error = %e, "failed to page in entity");
                None
            }
        }
    }

    /// Resolve `id`, distinguishing unknown ids from destroyed ones.
    pub fn get(&self, id: NeuronId) -> NeuroResult<Neuron> {
        if id.is_temp() {
            return Err(EntityError::InvalidEntity {
                id: id.to_string(),
                reason: "placeholder id does not name an entity".into(),
            }
            .into());
        }
        if self.store.is_tombstoned(id) {
            return Err(EntityError::Deleted { id: id.get() }.into());
        }
        match self.store.page_in(id)? {
            Some(n) if n.is_deleted() => Err(EntityError::Deleted { id: id.get() }.into()),
            Some(n) => Ok(n),
            None if self.store.is_tombstoned(id) => Err(EntityError::Deleted { id: id.get() }.into()),
            None => Err(EntityError::NotFound { id: id.get() }.into()),
        }
    }

    pub fn contains(&self, id: NeuronId) -> bool {
        self.store.contains(id)
    }

    fn ensure_live(&self, id: NeuronId) -> NeuroResult<()> {
        if self.store.is_tombstoned(id) {
            return Err(EntityError::Deleted { id: id.get() }.into());
        }
        if !self.store.contains(id) {
            return Err(EntityError::NotFound { id: id.get() }.into());
        }
        Ok(())
    }

    // ── Locking ─────────────────────────────────────────────────────────

    /// Lock every entity one logical operation touches.
    ///
    /// See [`LockedSet`] for the guarantees. Dropping the set releases it.
    pub fn request_locks(
        &self,
        ids: impl IntoIterator<Item = NeuronId>,
    ) -> NeuroResult<LockedSet<'_>> {
        LockedSet::acquire(self, ids)
    }

    /// Read one entity under its own lock.
    pub fn peek<R>(&self, id: NeuronId, read: impl FnOnce(&NeuronBody) -> R) -> NeuroResult<R> {
        let set = self.request_locks([id])?;
        Ok(read(set.body(id)?))
    }

    /// Drop a reference to an entity that turned out not to exist.
    fn prune_dangling(&self, owner: NeuronId, missing: NeuronId) -> NeuroResult<()> {
        let mut set = self.request_locks([owner])?;
        let body = set.body_mut(owner)?;
        body.links_out.retain(|l| *l != missing);
        if let Some(cluster) = body.cluster_mut() {
            cluster.children.retain(|c| *c != missing);
        }
        let error = StoreError::ReferentialViolation {
            id: owner.get(),
            missing: missing.get(),
        };
        tracing::warn!(%error, "pruned dangling reference");
        Ok(())
    }

    // ── Destroy ─────────────────────────────────────────────────────────

    /// Destroy an entity and everything that cannot outlive it.
    ///
    /// Links from and to the entity are destroyed too (recursively, since
    /// links can be linked), and so are links it classifies as their
    /// meaning. The entity is detached from owning clusters, removed from
    /// link info lists, and cleared where it was a cluster's meaning. A
    /// destroyed cluster releases its members. Existing handles observe
    /// [`Neuron::is_deleted`].
    pub fn destroy(&self, id: NeuronId) -> NeuroResult<()> {
        lock::ensure_unlocked(self.key)?;
        let mut extra: BTreeSet<NeuronId> = BTreeSet::new();
        loop {
            self.get(id)?;
            let Ok(plan) = self.plan_destroy(id, |x| Ok(self.peek(x, Facts::of).ok())) else {
                continue;
            };
            let wanted: BTreeSet<NeuronId> = plan
                .touched
                .iter()
                .chain(extra.iter())
                .copied()
                .filter(|x| *x == id || self.store.contains(*x))
                .collect();

            let mut set = match self.request_locks(wanted) {
                Ok(set) => set,
                Err(NeuroError::Entity(
                    EntityError::Deleted { id: other } | EntityError::NotFound { id: other },
                )) if other != id.get() => continue,
                Err(e) => return Err(e),
            };
            let verified = self.plan_destroy(id, |x| {
                if set.contains(x) {
                    Ok(set.body(x).ok().map(Facts::of))
                } else if self.store.contains(x) {
                    Err(x)
                } else {
                    Ok(None)
                }
            });
            match verified {
                Ok(plan) => {
                    self.apply_destroy(&mut set, &plan)?;
                    tracing::debug!(%id, destroyed = plan.doomed.len(), "destroyed entity");
                    return Ok(());
                }
                Err(missing) => {
                    extra.insert(missing);
                }
            }
        }
    }

    /// Compute the destroy closure of `root`, reading entities through `read`.
    ///
    /// `read` returns `Err(id)` when it cannot see `id`, which aborts the plan.
    fn plan_destroy<F>(&self, root: NeuronId, mut read: F) -> Result<Plan, NeuronId>
    where
        F: FnMut(NeuronId) -> Result<Option<Facts>, NeuronId>,
    {
        let mut plan = Plan::default();
        let mut work = vec![root];
        while let Some(e) = work.pop() {
            if plan.doomed.contains(&e) {
                continue;
            }
            let Some(facts) = read(e)? else {
                continue;
            };
            plan.doomed.insert(e);
            plan.touched.insert(e);
            plan.touched.extend(facts.links_out.iter().copied());
            work.extend(facts.links_out.iter().copied());
            for candidate in self.store.links_in_candidates(e) {
                plan.touched.insert(candidate);
                let points_here = read(candidate)?
                    .and_then(|f| f.ends)
                    .is_some_and(|ends| ends.to == e);
                if points_here {
                    work.push(candidate);
                }
            }
            for referrer in self.store.annotation_candidates(e) {
                let Some(named) = read(referrer)? else {
                    continue;
                };
                if named.ends.is_some_and(|ends| ends.meaning == e) {
                    plan.touched.insert(referrer);
                    work.push(referrer);
                } else if named.annotations.contains(&e) {
                    plan.touched.insert(referrer);
                    plan.detach.insert((referrer, e));
                }
            }
            plan.touched.extend(facts.owners);
            plan.touched.extend(facts.children);
            if let Some(ends) = facts.ends {
                plan.touched.insert(ends.from);
            }
        }
        Ok(plan)
    }

    fn apply_destroy(&self, set: &mut LockedSet<'_>, plan: &Plan) -> NeuroResult<()> {
        for &(referrer, gone) in &plan.detach {
            if plan.doomed.contains(&referrer) {
                continue;
            }
            let body = set.body_mut(referrer)?;
            body.drop_annotation(gone);
            let annotations = body.annotations();
            self.store.track_annotations(referrer, annotations);
            self.publish(&GraphEvent::NeuronChanged { id: referrer });
        }
        for &doomed in &plan.doomed {
            let facts = Facts::of(set.body(doomed)?);
            if let Some(ends) = facts.ends {
                if !plan.doomed.contains(&ends.from) {
                    set.body_mut(ends.from)?.remove_out(doomed);
                }
                self.publish(&GraphEvent::LinkChanged {
                    link: doomed,
                    before: Some(ends),
                    after: None,
                    target_value: None,
                });
            }
            for owner in facts.owners {
                if plan.doomed.contains(&owner) {
                    continue;
                }
                if let Some(cluster) = set.body_mut(owner)?.cluster_mut() {
                    cluster.children.retain(|c| *c != doomed);
                }
                self.publish(&GraphEvent::NeuronChanged { id: owner });
            }
            let members: BTreeSet<NeuronId> = facts.children.into_iter().collect();
            for child in members {
                if !plan.doomed.contains(&child) {
                    set.body_mut(child)?.remove_owner(doomed);
                }
            }

            let neuron = set.neuron(doomed)?.clone();
            neuron.mark_deleted();
            self.store.forget(doomed);
            self.publish(&GraphEvent::Removed {
                id: doomed,
                tag: neuron.type_tag(),
            });
        }
        Ok(())
    }

    // ── Link views ──────────────────────────────────────────────────────

    /// Outgoing links of `id`, locked.
    pub fn links_out(&self, id: NeuronId) -> NeuroResult<LockedView<'_>> {
        self.links(id, Direction::Out)
    }

    /// Every link whose To-end is `id`, locked.
    pub fn links_in(&self, id: NeuronId) -> NeuroResult<LockedView<'_>> {
        self.links(id, Direction::In)
    }

    /// Links of `id` in the given direction, locked together with `id`.
    pub fn links(&self, id: NeuronId, direction: Direction) -> NeuroResult<LockedView<'_>> {
        lock::ensure_unlocked(self.key)?;
        let want_out = direction != Direction::In;
        let want_in = direction != Direction::Out;
        loop {
            let outs: Vec<NeuronId> = if want_out {
                self.peek(id, |b| b.links_out().to_vec())?
            } else {
                Vec::new()
            };
            let (ins, memo) = if want_in {
                match self.links.get(id) {
                    Some(memo) => (memo.to_vec(), Some(memo)),
                    None => (self.store.links_in_candidates(id).into_iter().collect(), None),
                }
            } else {
                (Vec::new(), None)
            };

            let wanted = std::iter::once(id)
                .chain(outs.iter().copied())
                .chain(ins.iter().copied());
            let set = match self.request_locks(wanted) {
                Ok(set) => set,
                Err(NeuroError::Entity(EntityError::NotFound { id: missing }))
                    if missing != id.get() =>
                {
                    if let Some(missing) = NeuronId::new(missing).filter(|m| outs.contains(m)) {
                        self.prune_dangling(id, missing)?;
                    }
                    self.links.invalidate(id);
                    continue;
                }
                Err(NeuroError::Entity(EntityError::Deleted { id: missing }))
                    if missing != id.get() =>
                {
                    self.links.invalidate(id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if want_out && set.body(id)?.links_out() != outs.as_slice() {
                continue;
            }
            let mut ids = outs;
            if want_in {
                let verified: Vec<NeuronId> = match memo {
                    Some(memo) => {
                        if !self.links.is_current(id, &memo) {
                            continue;
                        }
                        memo.to_vec()
                    }
                    None => {
                        // Nothing can start or stop pointing at `id` while it is locked.
                        let fresh = self.store.links_in_candidates(id);
                        if !fresh.iter().all(|l| set.contains(*l)) {
                            continue;
                        }
                        let verified: Vec<(NeuronId, NeuronId)> = fresh
                            .into_iter()
                            .filter_map(|l| {
                                let ends = set.body(l).ok()?.link()?.ends();
                                (ends.to == id).then_some((l, ends.from))
                            })
                            .collect();
                        let links: Vec<NeuronId> = verified.iter().map(|(l, _)| *l).collect();
                        self.links
                            .insert(id, links.clone(), verified.iter().map(|(_, from)| *from));
                        links
                    }
                };
                let seen: HashSet<NeuronId> = ids.iter().copied().collect();
                ids.extend(verified.into_iter().filter(|l| !seen.contains(l)));
            }
            return Ok(LockedView { set, ids });
        }
    }

    // ── Clusters ────────────────────────────────────────────────────────

    /// Members of `cluster`, locked together with the cluster.
    pub fn children(&self, cluster: NeuronId) -> NeuroResult<LockedView<'_>> {
        lock::ensure_unlocked(self.key)?;
        loop {
            let (kids, kind) = self.peek(cluster, |b| {
                (b.cluster().map(|c| c.children().to_vec()), b.payload().tag())
            })?;
            let Some(kids) = kids else {
                return Err(EntityError::KindMismatch {
                    id: cluster.get(),
                    expected: "cluster".into(),
                    actual: kind.to_string(),
                }
                .into());
            };
            let wanted = std::iter::once(cluster).chain(kids.iter().copied());
            let set = match self.request_locks(wanted) {
                Ok(set) => set,
                Err(NeuroError::Entity(EntityError::NotFound { id: missing }))
                    if missing != cluster.get() =>
                {
                    if let Some(missing) = NeuronId::new(missing) {
                        self.prune_dangling(cluster, missing)?;
                    }
                    continue;
                }
                Err(NeuroError::Entity(EntityError::Deleted { id: missing }))
                    if missing != cluster.get() =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            };
            let current = set.body(cluster)?.cluster().map(|c| c.children().to_vec());
            if current.as_deref() != Some(kids.as_slice()) {
                continue;
            }
            return Ok(LockedView { set, ids: kids });
        }
    }

    pub fn add_child(&self, cluster: NeuronId, child: NeuronId) -> NeuroResult<()> {
        self.request_locks([cluster, child])?.add_child(cluster, child)
    }

    pub fn add_children(&self, cluster: NeuronId, children: &[NeuronId]) -> NeuroResult<()> {
        let mut set = self.request_locks(std::iter::once(cluster).chain(children.iter().copied()))?;
        set.add_children(cluster, children)
    }

    pub fn remove_child(&self, cluster: NeuronId, child: NeuronId) -> NeuroResult<bool> {
        self.request_locks([cluster, child])?.remove_child(cluster, child)
    }

    pub fn clear_children(&self, cluster: NeuronId) -> NeuroResult<()> {
        let mut view = self.children(cluster)?;
        view.locked_mut().clear_children(cluster)
    }

    // ── Locked mutator wrappers ─────────────────────────────────────────

    pub fn set_value(&self, id: NeuronId, value: impl Into<ScalarValue>) -> NeuroResult<()> {
        self.request_locks([id])?.set_value(id, value)
    }

    /// Point `link` at `new_to`, locking the link and both targets.
    pub fn retarget(&self, link: NeuronId, new_to: NeuronId) -> NeuroResult<()> {
        loop {
            let before = self.link_ends(link)?;
            let mut set = self.request_locks([link, before.to, new_to])?;
            if set.body(link)?.link().map(|l| l.to()) != Some(before.to) {
                continue;
            }
            return set.retarget(link, new_to);
        }
    }

    /// Reclassify `link`, locking it, its target and the new meaning.
    pub fn set_link_meaning(&self, link: NeuronId, meaning: NeuronId) -> NeuroResult<()> {
        loop {
            let before = self.link_ends(link)?;
            let mut set = self.request_locks([link, before.to, meaning])?;
            if set.body(link)?.link().map(|l| l.to()) != Some(before.to) {
                continue;
            }
            return set.set_link_meaning(link, meaning);
        }
    }

    /// Replace the info list of `link`, locking it and every entry.
    pub fn set_link_info(&self, link: NeuronId, info: Vec<NeuronId>) -> NeuroResult<()> {
        let mut set = self.request_locks(std::iter::once(link).chain(info.iter().copied()))?;
        set.set_link_info(link, info)
    }

    pub fn set_cluster_meaning(
        &self,
        cluster: NeuronId,
        meaning: Option<NeuronId>,
    ) -> NeuroResult<()> {
        let mut set = self.request_locks(std::iter::once(cluster).chain(meaning))?;
        set.set_cluster_meaning(cluster, meaning)
    }

    /// Move `link` to a new From-entity, locking the link and both sources.
    pub fn set_link_from(&self, link: NeuronId, new_from: NeuronId) -> NeuroResult<()> {
        loop {
            let before = self.link_ends(link)?;
            let mut set = self.request_locks([link, before.from, before.to, new_from])?;
            if set.body(link)?.link().map(|l| l.from()) != Some(before.from) {
                continue;
            }
            return set.set_link_from(link, new_from);
        }
    }

    fn link_ends(&self, link: NeuronId) -> NeuroResult<LinkEnds> {
        let (ends, kind) = self.peek(link, |b| (b.link().map(|l| l.ends()), b.payload().tag()))?;
        ends.ok_or_else(|| {
            EntityError::KindMismatch {
                id: link.get(),
                expected: "link".into(),
                actual: kind.to_string(),
            }
            .into()
        })
    }

    // ── Scalar index ────────────────────────────────────────────────────

    /// First target reachable from `source` over an out-link whose target
    /// carries `value`.
    ///
    /// `Ok(None)` is a miss, not proof of absence: unregistered value kinds
    /// always miss, and callers fall back to scanning [`links_out`](Self::links_out).
    pub fn find_first(
        &self,
        source: NeuronId,
        value: impl Into<ScalarValue>,
    ) -> NeuroResult<Option<NeuronId>> {
        let value = value.into();
        if !self.index.supports(value.kind()) {
            let miss = IndexError::UnsupportedQuery {
                kind: value.kind().to_string(),
            };
            tracing::debug!(%source, error = %miss, "index miss");
            return Ok(None);
        }
        match self.index.lookup(source, &value) {
            Lookup::Hit(target) => return Ok(Some(target)),
            Lookup::Miss => return Ok(None),
            Lookup::Unindexed => {}
        }
        self.index_source(source)?;
        Ok(match self.index.lookup(source, &value) {
            Lookup::Hit(target) => Some(target),
            Lookup::Miss | Lookup::Unindexed => None,
        })
    }

    /// Build the scalar index of `source` from its current out-links.
    ///
    /// Blocks while the source, its out-links and their targets are locked.
    /// Returns the number of indexed values.
    pub fn index_source(&self, source: NeuronId) -> NeuroResult<usize> {
        lock::ensure_unlocked(self.key)?;
        let mut unreachable: BTreeSet<NeuronId> = BTreeSet::new();
        loop {
            let outs = self.peek(source, |b| b.links_out().to_vec())?;
            let targets: Vec<NeuronId> = outs
                .iter()
                .filter_map(|l| self.store.link_ends(*l).map(|e| e.to))
                .filter(|t| !unreachable.contains(t))
                .collect();
            let wanted = std::iter::once(source)
                .chain(outs.iter().copied())
                .chain(targets.iter().copied());
            let set = match self.request_locks(wanted) {
                Ok(set) => set,
                Err(NeuroError::Entity(
                    EntityError::NotFound { id: missing } | EntityError::Deleted { id: missing },
                )) if missing != source.get() => {
                    if let Some(missing) = NeuronId::new(missing) {
                        if outs.contains(&missing) {
                            self.prune_dangling(source, missing)?;
                        } else {
                            unreachable.insert(missing);
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            if set.body(source)?.links_out() != outs.as_slice() {
                continue;
            }

            let mut entries = Vec::with_capacity(outs.len());
            let mut stale = false;
            for link in &outs {
                let Some(ends) = set.body(*link)?.link().map(|l| l.ends()) else {
                    continue;
                };
                if unreachable.contains(&ends.to) {
                    continue;
                }
                if !set.contains(ends.to) {
                    stale = true;
                    break;
                }
                if let Some(value) = set.value(ends.to)? {
                    entries.push((
                        ScalarKey::from(value),
                        IndexEntry {
                            target: ends.to,
                            link: *link,
                        },
                    ));
                }
            }
            if stale {
                continue;
            }
            return Ok(self.index.install(source, entries));
        }
    }

    pub fn is_indexed(&self, source: NeuronId) -> bool {
        self.index.is_indexed(source)
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Write the whole graph to `path` atomically and attach to the result.
    pub fn save(&self, path: impl AsRef<Path>) -> NeuroResult<SaveReport> {
        self.save_with(path, &CancelFlag::new())
    }

    /// [`save`](Self::save) with cooperative cancellation.
    pub fn save_with(&self, path: impl AsRef<Path>, cancel: &CancelFlag) -> NeuroResult<SaveReport> {
        lock::ensure_unlocked(self.key)?;
        Ok(self.store.save(path.as_ref(), self.ids.peek_next(), cancel)?)
    }

    /// Clear, then attach the graph file at `path`. Entities page in lazily.
    pub fn load(&self, path: impl AsRef<Path>) -> NeuroResult<AttachReport> {
        let path = path.as_ref();
        self.clear()?;
        let report = self.store.attach(path)?;
        self.ids.advance_past(report.next_id.saturating_sub(1));
        self.publish(&GraphEvent::AfterLoaded {
            path: path.to_path_buf(),
            records: report.records,
        });
        Ok(report)
    }

    /// Evict everything and detach from the backing medium.
    pub fn clear(&self) -> NeuroResult<()> {
        lock::ensure_unlocked(self.key)?;
        let dropped = self.store.clear()?;
        self.ids.reset();
        self.publish(&GraphEvent::Cleared);
        tracing::info!(dropped, "cleared graph");
        Ok(())
    }

    /// Materialize every stored entity. Returns how many were paged in.
    ///
    /// In stream mode this still respects the high-water mark.
    pub fn preload(&self, cancel: &CancelFlag) -> NeuroResult<usize> {
        lock::ensure_unlocked(self.key)?;
        let mut loaded = 0;
        for (i, id) in self.store.stored_ids().into_iter().enumerate() {
            if i % CANCEL_POLL_INTERVAL == 0 {
                if cancel.is_cancelled() {
                    return Err(StoreError::Cancelled.into());
                }
                self.after_release();
            }
            if !self.store.is_resident(id) && self.store.page_in(id)?.is_some() {
                loaded += 1;
            }
        }
        self.after_release();
        tracing::info!(loaded, "preloaded graph");
        Ok(loaded)
    }

    /// Decode every stored record and report problems.
    pub fn verify(&self, cancel: &CancelFlag) -> NeuroResult<VerifyReport> {
        Ok(self.store.verify(cancel)?)
    }

    pub fn info(&self) -> GraphInfo {
        let stats = self.store.stats();
        GraphInfo {
            storage_mode: self.config.storage_mode,
            high_water_mark: self.config.cache_high_water_mark,
            resident: stats.resident,
            dirty: stats.dirty,
            stored: stats.stored,
            streamed: stats.streamed,
            tombstones: stats.tombstones,
            next_id: self.ids.peek_next(),
            memoized_in_lists: self.links.len(),
            indexed_sources: self.index.len(),
            path: stats.path,
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("store", &self.store)
            .field("links", &self.links)
            .field("index", &self.index)
            .finish()
    }
}
