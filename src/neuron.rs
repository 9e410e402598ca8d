//! Entity model: neurons, links and clusters.
//!
//! A [`Neuron`] is a cheap, clonable handle to one resident entity. Its body
//! ([`NeuronBody`]) sits behind a per-entity mutex that only the lock manager
//! hands out, so reading or writing entity internals always happens under a
//! held lock set. Entities refer to each other strictly by [`NeuronId`].
//!
//! Links are entities too: a link's body carries its endpoints and meaning,
//! and the link id sits in the out-list of its From-entity. The in-list of
//! the To-entity is derived and never stored.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::id::NeuronId;

/// Durable type discriminator written into every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeTag {
    Neuron = 1,
    Int = 2,
    Double = 3,
    Text = 4,
    Link = 5,
    Cluster = 6,
}

impl TypeTag {
    /// Decode a tag byte; `None` for anything this version does not know.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(TypeTag::Neuron),
            2 => Some(TypeTag::Int),
            3 => Some(TypeTag::Double),
            4 => Some(TypeTag::Text),
            5 => Some(TypeTag::Link),
            6 => Some(TypeTag::Cluster),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TypeTag::Neuron => "neuron",
            TypeTag::Int => "int",
            TypeTag::Double => "double",
            TypeTag::Text => "text",
            TypeTag::Link => "link",
            TypeTag::Cluster => "cluster",
        };
        f.write_str(name)
    }
}

/// Runtime type of a scalar payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalarKind {
    Int,
    Double,
    Text,
}

impl std::fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarKind::Int => f.write_str("int"),
            ScalarKind::Double => f.write_str("double"),
            ScalarKind::Text => f.write_str("text"),
        }
    }
}

/// Typed scalar carried by value neurons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Int(i64),
    Double(f64),
    Text(String),
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarValue::Int(_) => ScalarKind::Int,
            ScalarValue::Double(_) => ScalarKind::Double,
            ScalarValue::Text(_) => ScalarKind::Text,
        }
    }

    fn tag(&self) -> TypeTag {
        match self {
            ScalarValue::Int(_) => TypeTag::Int,
            ScalarValue::Double(_) => TypeTag::Double,
            ScalarValue::Text(_) => TypeTag::Text,
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Double(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Text(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Text(v)
    }
}

/// Endpoints and classifier of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkEnds {
    pub from: NeuronId,
    pub to: NeuronId,
    pub meaning: NeuronId,
}

impl LinkEnds {
    pub fn is_self_link(&self) -> bool {
        self.from == self.to
    }
}

/// Link-specific part of an entity body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkBody {
    pub(crate) ends: LinkEnds,
    /// Ordered annotation references.
    pub(crate) info: Vec<NeuronId>,
}

impl LinkBody {
    pub fn ends(&self) -> LinkEnds {
        self.ends
    }

    pub fn from(&self) -> NeuronId {
        self.ends.from
    }

    pub fn to(&self) -> NeuronId {
        self.ends.to
    }

    pub fn meaning(&self) -> NeuronId {
        self.ends.meaning
    }

    pub fn info(&self) -> &[NeuronId] {
        &self.info
    }
}

/// Cluster-specific part of an entity body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterBody {
    pub(crate) meaning: Option<NeuronId>,
    pub(crate) children: Vec<NeuronId>,
    /// Whether member order is significant.
    pub(crate) ordered: bool,
}

impl ClusterBody {
    pub fn meaning(&self) -> Option<NeuronId> {
        self.meaning
    }

    pub fn children(&self) -> &[NeuronId] {
        &self.children
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn contains(&self, child: NeuronId) -> bool {
        self.children.contains(&child)
    }
}

/// What an entity carries beyond its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Plain,
    Scalar(ScalarValue),
    Link(LinkBody),
    Cluster(ClusterBody),
}

impl Payload {
    pub fn tag(&self) -> TypeTag {
        match self {
            Payload::Plain => TypeTag::Neuron,
            Payload::Scalar(v) => v.tag(),
            Payload::Link(_) => TypeTag::Link,
            Payload::Cluster(_) => TypeTag::Cluster,
        }
    }
}

/// Lock-protected contents of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronBody {
    pub(crate) payload: Payload,
    /// Authoritative outgoing links, in creation order.
    pub(crate) links_out: Vec<NeuronId>,
    /// Clusters this entity is a member of.
    pub(crate) clustered_by: Vec<NeuronId>,
}

impl NeuronBody {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            links_out: Vec::new(),
            clustered_by: Vec::new(),
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn links_out(&self) -> &[NeuronId] {
        &self.links_out
    }

    pub fn clustered_by(&self) -> &[NeuronId] {
        &self.clustered_by
    }

    pub fn scalar(&self) -> Option<&ScalarValue> {
        match &self.payload {
            Payload::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn link(&self) -> Option<&LinkBody> {
        match &self.payload {
            Payload::Link(l) => Some(l),
            _ => None,
        }
    }

    pub fn cluster(&self) -> Option<&ClusterBody> {
        match &self.payload {
            Payload::Cluster(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn link_mut(&mut self) -> Option<&mut LinkBody> {
        match &mut self.payload {
            Payload::Link(l) => Some(l),
            _ => None,
        }
    }

    pub(crate) fn cluster_mut(&mut self) -> Option<&mut ClusterBody> {
        match &mut self.payload {
            Payload::Cluster(c) => Some(c),
            _ => None,
        }
    }

    /// Entities this body names as a classifier or annotation: a link's
    /// meaning and info list, a cluster's meaning.
    pub fn annotations(&self) -> Vec<NeuronId> {
        let mut refs: Vec<NeuronId> = match &self.payload {
            Payload::Link(l) => std::iter::once(l.ends.meaning)
                .chain(l.info.iter().copied())
                .collect(),
            Payload::Cluster(c) => c.meaning.into_iter().collect(),
            Payload::Plain | Payload::Scalar(_) => Vec::new(),
        };
        refs.sort_unstable();
        refs.dedup();
        refs
    }

    /// Forget `gone` as an info entry or cluster meaning. A link's own
    /// meaning is left alone; such a link is destroyed instead.
    pub(crate) fn drop_annotation(&mut self, gone: NeuronId) -> bool {
        match &mut self.payload {
            Payload::Link(l) => {
                let before = l.info.len();
                l.info.retain(|r| *r != gone);
                before != l.info.len()
            }
            Payload::Cluster(c) if c.meaning == Some(gone) => {
                c.meaning = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn add_owner(&mut self, cluster: NeuronId) {
        if !self.clustered_by.contains(&cluster) {
            self.clustered_by.push(cluster);
        }
    }

    pub(crate) fn remove_owner(&mut self, cluster: NeuronId) {
        self.clustered_by.retain(|c| *c != cluster);
    }

    pub(crate) fn remove_out(&mut self, link: NeuronId) -> bool {
        let before = self.links_out.len();
        self.links_out.retain(|l| *l != link);
        before != self.links_out.len()
    }
}

struct NeuronInner {
    id: AtomicU64,
    tag: TypeTag,
    deleted: AtomicBool,
    changed: AtomicBool,
    /// Bumped on every mutation; lets a save tell whether it flushed the latest state.
    generation: AtomicU64,
    body: Arc<Mutex<NeuronBody>>,
}

/// Handle to a neuron, link or cluster.
///
/// Clones share the same entity. A handle outlives the entity's residency
/// guarantees: after `Graph::destroy`, every holder observes
/// [`is_deleted`](Self::is_deleted) instead of a stale live object.
#[derive(Clone)]
pub struct Neuron {
    inner: Arc<NeuronInner>,
}

impl Neuron {
    /// Build an uncommitted entity carrying `NeuronId::TEMP`.
    pub fn new(payload: Payload) -> Self {
        let tag = payload.tag();
        Self::with_state(NeuronId::TEMP, tag, NeuronBody::new(payload), true)
    }

    pub fn plain() -> Self {
        Self::new(Payload::Plain)
    }

    pub fn scalar(value: impl Into<ScalarValue>) -> Self {
        Self::new(Payload::Scalar(value.into()))
    }

    /// Uncommitted link; it joins `from`'s out-list when added to a graph.
    pub fn link(from: NeuronId, to: NeuronId, meaning: NeuronId) -> Self {
        Self::new(Payload::Link(LinkBody {
            ends: LinkEnds { from, to, meaning },
            info: Vec::new(),
        }))
    }

    /// Uncommitted link with an annotation list.
    pub fn link_with_info(
        from: NeuronId,
        to: NeuronId,
        meaning: NeuronId,
        info: Vec<NeuronId>,
    ) -> Self {
        Self::new(Payload::Link(LinkBody {
            ends: LinkEnds { from, to, meaning },
            info,
        }))
    }

    /// Uncommitted cluster with initial members.
    pub fn cluster(meaning: Option<NeuronId>, ordered: bool, children: Vec<NeuronId>) -> Self {
        Self::new(Payload::Cluster(ClusterBody {
            meaning,
            children,
            ordered,
        }))
    }

    /// Rebuild a committed, clean entity from storage.
    pub(crate) fn from_stored(id: NeuronId, body: NeuronBody) -> Self {
        let tag = body.payload.tag();
        Self::with_state(id, tag, body, false)
    }

    fn with_state(id: NeuronId, tag: TypeTag, body: NeuronBody, changed: bool) -> Self {
        Self {
            inner: Arc::new(NeuronInner {
                id: AtomicU64::new(id.get()),
                tag,
                deleted: AtomicBool::new(false),
                changed: AtomicBool::new(changed),
                generation: AtomicU64::new(0),
                body: Arc::new(Mutex::new(body)),
            }),
        }
    }

    pub fn id(&self) -> NeuronId {
        NeuronId::new(self.inner.id.load(Ordering::Acquire)).unwrap_or(NeuronId::TEMP)
    }

    pub fn is_registered(&self) -> bool {
        !self.id().is_temp()
    }

    pub fn type_tag(&self) -> TypeTag {
        self.inner.tag
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::Acquire)
    }

    /// Set by mutators, cleared only after a successful flush.
    pub fn is_changed(&self) -> bool {
        self.inner.changed.load(Ordering::Acquire)
    }

    /// Whether two handles point at the same entity.
    pub fn ptr_eq(&self, other: &Neuron) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Swap the placeholder for a durable id. Fails if already committed.
    pub(crate) fn assign_id(&self, id: NeuronId) -> bool {
        self.inner
            .id
            .compare_exchange(
                NeuronId::TEMP.get(),
                id.get(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_changed(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.changed.store(true, Ordering::Release);
    }

    pub(crate) fn mark_deleted(&self) {
        self.inner.deleted.store(true, Ordering::Release);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Clear the dirty flag if nothing changed since `generation` was read.
    ///
    /// Callers hold the body lock, so no mutation can interleave.
    pub(crate) fn clear_changed_if(&self, generation: u64) -> bool {
        if self.generation() == generation {
            self.inner.changed.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub(crate) fn body(&self) -> &Arc<Mutex<NeuronBody>> {
        &self.inner.body
    }

    /// Whether anything besides the resident cache references this entity.
    ///
    /// Only meaningful when called on the cache's own handle.
    pub(crate) fn in_use(&self) -> bool {
        Arc::strong_count(&self.inner) > 1
            || Arc::strong_count(&self.inner.body) > 1
            || self.inner.body.is_locked()
    }
}

impl std::fmt::Debug for Neuron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neuron")
            .field("id", &self.id())
            .field("tag", &self.type_tag())
            .field("deleted", &self.is_deleted())
            .field("changed", &self.is_changed())
            .finish()
    }
}
