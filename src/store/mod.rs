//! Persistence and residency.
//!
//! The store keeps two views of the graph:
//!
//! - **resident**: an LRU of materialized [`Neuron`] handles. A resident
//!   handle is authoritative for its entity.
//! - **directory**: what durable storage holds, `id -> location`, built by
//!   scanning frame headers of the attached aggregate file and updated as
//!   stream files are written. It also derives the reverse link direction
//!   (`to -> [link]`) and the reverse annotation direction
//!   (`meaning -> [referrer]`) from what frame headers carry.
//!
//! Entities refer to each other by id only, so any one of them can be paged
//! in while its neighbours stay on disk.

pub(crate) mod file;
pub(crate) mod record;
pub(crate) mod stream;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::cancel::CancelFlag;
use crate::config::{GraphConfig, StorageMode};
use crate::error::{StoreError, StoreResult};
use crate::id::NeuronId;
use crate::neuron::{LinkEnds, Neuron, NeuronBody, Payload};

use self::file::{AttachedFile, FileWriter};
use self::record::{decode_frame, encode_frame};
use self::stream::StreamDir;

/// How often bulk loops poll their cancellation flag.
pub(crate) const CANCEL_POLL_INTERVAL: usize = 1024;

#[derive(Debug, Clone, Copy)]
enum Location {
    Aggregate { offset: usize, len: usize },
    Stream,
}

#[derive(Debug, Clone)]
struct DirEntry {
    location: Location,
    ends: Option<LinkEnds>,
    /// Meanings and info entries the stored record names.
    annotations: Vec<NeuronId>,
    /// Changes whenever the stored bytes for this id change.
    version: u64,
}

#[derive(Default)]
struct Directory {
    medium: Option<Arc<AttachedFile>>,
    entries: HashMap<NeuronId, DirEntry>,
    /// Reverse link direction as stored: to-id -> link ids.
    incoming: HashMap<NeuronId, Vec<NeuronId>>,
    /// Reverse annotation direction as stored: referenced id -> referrers.
    annotated: HashMap<NeuronId, Vec<NeuronId>>,
    clock: u64,
}

impl Directory {
    fn stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, id: NeuronId, entry: DirEntry) {
        self.unlink(id);
        if let Some(ends) = entry.ends {
            self.incoming.entry(ends.to).or_default().push(id);
        }
        for r in &entry.annotations {
            self.annotated.entry(*r).or_default().push(id);
        }
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: NeuronId) -> Option<DirEntry> {
        self.unlink(id);
        self.entries.remove(&id)
    }

    fn unlink(&mut self, id: NeuronId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        if let Some(ends) = entry.ends {
            detach(&mut self.incoming, ends.to, id);
        }
        for r in &entry.annotations {
            detach(&mut self.annotated, *r, id);
        }
    }
}

fn detach(map: &mut HashMap<NeuronId, Vec<NeuronId>>, key: NeuronId, id: NeuronId) {
    if let Some(ids) = map.get_mut(&key) {
        ids.retain(|x| *x != id);
        if ids.is_empty() {
            map.remove(&key);
        }
    }
}

/// Summary of attaching a graph file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachReport {
    pub path: PathBuf,
    pub records: usize,
    pub skipped: usize,
    pub next_id: u64,
}

/// Summary of a completed save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub path: PathBuf,
    pub records: u64,
    /// Entities whose dirty flag the save cleared.
    pub flushed: usize,
}

/// Result of decoding every stored record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyReport {
    pub checked: usize,
    pub malformed: Vec<(NeuronId, String)>,
    /// `(record, missing reference)` pairs.
    pub dangling: Vec<(NeuronId, NeuronId)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.malformed.is_empty() && self.dangling.is_empty()
    }
}

impl std::fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "records checked: {}", self.checked)?;
        writeln!(f, "malformed: {}", self.malformed.len())?;
        for (id, message) in &self.malformed {
            writeln!(f, "  {id}: {message}")?;
        }
        writeln!(f, "dangling references: {}", self.dangling.len())?;
        for (id, missing) in &self.dangling {
            writeln!(f, "  {id} -> {missing}")?;
        }
        Ok(())
    }
}

/// Residency counters for [`GraphInfo`](crate::graph::GraphInfo).
#[derive(Debug, Clone, Default)]
pub(crate) struct StoreStats {
    pub resident: usize,
    pub dirty: usize,
    pub stored: usize,
    pub streamed: usize,
    pub tombstones: usize,
    pub path: Option<PathBuf>,
}

pub(crate) struct Store {
    mode: StorageMode,
    high_water_mark: usize,
    stream: Option<StreamDir>,
    resident: Mutex<LruCache<NeuronId, Neuron>>,
    disk: RwLock<Directory>,
    /// Current endpoints of every resident link.
    resident_links: DashMap<NeuronId, LinkEnds>,
    /// Current annotations of every resident link or cluster that has any.
    resident_annotations: DashMap<NeuronId, Vec<NeuronId>>,
    /// Destroyed ids, kept so lookups report `Deleted` rather than `NotFound`.
    tombstones: DashSet<NeuronId>,
    /// Serializes save, attach and clear; eviction skips while it is held.
    io: Mutex<()>,
}

impl Store {
    pub fn new(config: &GraphConfig) -> StoreResult<Self> {
        let stream = match (config.storage_mode, &config.stream_dir) {
            (StorageMode::AlwaysStream, Some(dir)) => {
                let stream = StreamDir::open(dir)?;
                let stale = stream.purge()?;
                if stale > 0 {
                    tracing::info!(dir = %dir.display(), stale, "removed stale stream files");
                }
                Some(stream)
            }
            _ => None,
        };
        Ok(Self {
            mode: config.storage_mode,
            high_water_mark: config.cache_high_water_mark,
            stream,
            resident: Mutex::new(LruCache::unbounded()),
            disk: RwLock::new(Directory::default()),
            resident_links: DashMap::new(),
            resident_annotations: DashMap::new(),
            tombstones: DashSet::new(),
            io: Mutex::new(()),
        })
    }

    // ── Residency ───────────────────────────────────────────────────────

    /// Resident handle for `id`, marking it most recently used.
    pub fn resident(&self, id: NeuronId) -> Option<Neuron> {
        self.resident.lock().get(&id).cloned()
    }

    pub fn is_resident(&self, id: NeuronId) -> bool {
        self.resident.lock().contains(&id)
    }

    pub fn is_tombstoned(&self, id: NeuronId) -> bool {
        self.tombstones.contains(&id)
    }

    /// Whether `id` names a live entity, resident or stored.
    pub fn contains(&self, id: NeuronId) -> bool {
        if self.is_tombstoned(id) {
            return false;
        }
        self.is_resident(id) || self.disk.read().entries.contains_key(&id)
    }

    /// Make a freshly committed entity resident.
    pub fn register(&self, neuron: Neuron) {
        self.resident.lock().put(neuron.id(), neuron);
    }

    /// Record the current endpoints of a resident link.
    pub fn track_link(&self, link: NeuronId, ends: LinkEnds) {
        self.resident_links.insert(link, ends);
    }

    /// Record what a resident entity currently names as meaning or annotation.
    pub fn track_annotations(&self, id: NeuronId, annotations: Vec<NeuronId>) {
        if annotations.is_empty() {
            self.resident_annotations.remove(&id);
        } else {
            self.resident_annotations.insert(id, annotations);
        }
    }

    /// Drop a destroyed entity everywhere except the tombstone set.
    pub fn forget(&self, id: NeuronId) {
        self.tombstones.insert(id);
        self.resident.lock().pop(&id);
        self.resident_links.remove(&id);
        self.resident_annotations.remove(&id);
        self.disk.write().remove(id);
        if let Some(stream) = &self.stream {
            stream.remove(id);
        }
    }

    /// Current endpoints of a link, resident or stored.
    pub fn link_ends(&self, link: NeuronId) -> Option<LinkEnds> {
        if let Some(ends) = self.resident_links.get(&link) {
            return Some(*ends);
        }
        if self.is_tombstoned(link) {
            return None;
        }
        self.disk.read().entries.get(&link).and_then(|e| e.ends)
    }

    /// Every link whose To-end may be `to`.
    ///
    /// Stored links are taken from the directory unless resident, in which
    /// case the resident endpoints win. The result can be stale by the time
    /// the caller locks it and must be re-checked under the lock.
    pub fn links_in_candidates(&self, to: NeuronId) -> BTreeSet<NeuronId> {
        let mut out: BTreeSet<NeuronId> = self
            .resident_links
            .iter()
            .filter(|e| e.value().to == to)
            .map(|e| *e.key())
            .collect();
        let disk = self.disk.read();
        if let Some(links) = disk.incoming.get(&to) {
            out.extend(links.iter().copied().filter(|l| {
                !self.resident_links.contains_key(l) && !self.tombstones.contains(l)
            }));
        }
        out
    }

    /// Every entity that may name `target` as a meaning or annotation.
    ///
    /// Resident entities answer from their tracked annotations, stored ones
    /// from their frame headers. Like
    /// [`links_in_candidates`](Self::links_in_candidates), the result must be
    /// re-checked under the lock.
    pub fn annotation_candidates(&self, target: NeuronId) -> BTreeSet<NeuronId> {
        let mut out: BTreeSet<NeuronId> = self
            .resident_annotations
            .iter()
            .filter(|e| e.value().contains(&target))
            .map(|e| *e.key())
            .collect();
        let disk = self.disk.read();
        if let Some(referrers) = disk.annotated.get(&target) {
            out.extend(referrers.iter().copied().filter(|r| {
                !self.resident_annotations.contains_key(r) && !self.tombstones.contains(r)
            }));
        }
        out
    }

    /// Resolve `id`, deserializing it on first touch.
    ///
    /// Returns `Ok(None)` for unknown and destroyed ids. A record that fails
    /// to decode, or a link whose ends or meaning no longer resolve, is
    /// logged, dropped from the directory, and reported as absent.
    pub fn page_in(&self, id: NeuronId) -> StoreResult<Option<Neuron>> {
        loop {
            if self.is_tombstoned(id) {
                return Ok(None);
            }
            if let Some(neuron) = self.resident(id) {
                return Ok(Some(neuron));
            }
            let Some((frame, version)) = self.read_stored(id)? else {
                return Ok(None);
            };
            let body = match decode_frame(&frame) {
                Ok((stored, body)) if stored == id => body,
                Ok((stored, _)) => {
                    self.drop_malformed(
                        id,
                        StoreError::Malformed {
                            id: id.get(),
                            message: format!("record is filed under {stored}"),
                        },
                    );
                    return Ok(None);
                }
                Err(e) => {
                    self.drop_malformed(id, e);
                    return Ok(None);
                }
            };
            let Some(body) = self.sanitize(id, body) else {
                return Ok(None);
            };
            let ends = body.link().map(|l| l.ends());
            let annotations = body.annotations();
            let neuron = Neuron::from_stored(id, body);

            let mut cache = self.resident.lock();
            if let Some(existing) = cache.get(&id) {
                return Ok(Some(existing.clone()));
            }
            if self.is_tombstoned(id) {
                return Ok(None);
            }
            let current = self.disk.read().entries.get(&id).map(|e| e.version);
            if current != Some(version) {
                // Rewritten while we decoded; read again.
                continue;
            }
            if let Some(ends) = ends {
                self.resident_links.insert(id, ends);
            }
            self.track_annotations(id, annotations);
            cache.put(id, neuron.clone());
            tracing::trace!(%id, "paged in");
            return Ok(Some(neuron));
        }
    }

    fn read_stored(&self, id: NeuronId) -> StoreResult<Option<(Vec<u8>, u64)>> {
        let disk = self.disk.read();
        let Some(entry) = disk.entries.get(&id) else {
            return Ok(None);
        };
        let frame = match entry.location {
            Location::Aggregate { offset, len } => disk
                .medium
                .as_ref()
                .and_then(|m| m.frame(offset, len))
                .map(<[u8]>::to_vec)
                .ok_or_else(|| StoreError::Malformed {
                    id: id.get(),
                    message: "record lies outside the attached file".into(),
                })?,
            Location::Stream => match &self.stream {
                Some(stream) => stream.read(id)?,
                None => {
                    return Err(StoreError::Malformed {
                        id: id.get(),
                        message: "stream record without a stream directory".into(),
                    });
                }
            },
        };
        Ok(Some((frame, entry.version)))
    }

    fn drop_malformed(&self, id: NeuronId, error: StoreError) {
        tracing::warn!(%id, %error, "skipping malformed record");
        self.disk.write().remove(id);
    }

    /// Drop references that resolve to nothing.
    ///
    /// A link without its ends or meaning cannot be repaired and is dropped
    /// as a whole.
    fn sanitize(&self, id: NeuronId, mut body: NeuronBody) -> Option<NeuronBody> {
        if let Some(ends) = body.link().map(|l| l.ends()) {
            let missing = [ends.from, ends.to, ends.meaning]
                .into_iter()
                .find(|r| !self.contains(*r));
            if let Some(missing) = missing {
                self.drop_malformed(
                    id,
                    StoreError::ReferentialViolation {
                        id: id.get(),
                        missing: missing.get(),
                    },
                );
                return None;
            }
        }
        let mut dropped = Vec::new();
        let mut keep = |r: &NeuronId| {
            let ok = self.contains(*r);
            if !ok {
                dropped.push(*r);
            }
            ok
        };
        body.links_out.retain(&mut keep);
        body.clustered_by.retain(&mut keep);
        match &mut body.payload {
            Payload::Cluster(c) => {
                c.children.retain(&mut keep);
                if c.meaning.is_some_and(|m| !keep(&m)) {
                    c.meaning = None;
                }
            }
            Payload::Link(l) => l.info.retain(&mut keep),
            Payload::Plain | Payload::Scalar(_) => {}
        }
        for missing in dropped {
            let error = StoreError::ReferentialViolation {
                id: id.get(),
                missing: missing.get(),
            };
            tracing::warn!(%error, "dropping dangling reference");
        }
        Some(body)
    }

    // ── Eviction ────────────────────────────────────────────────────────

    /// Evict least-recently-used entities above the high-water mark.
    ///
    /// Only stream mode evicts. Entities that anyone else holds a handle to
    /// or has locked stay resident; dirty ones are flushed to their stream
    /// file first. Returns the evicted ids.
    pub fn maybe_evict(&self) -> Vec<NeuronId> {
        let Some(stream) = self.stream.as_ref().filter(|_| self.mode == StorageMode::AlwaysStream)
        else {
            return Vec::new();
        };
        let mut cache = self.resident.lock();
        if cache.len() <= self.high_water_mark {
            return Vec::new();
        }
        let Some(_io) = self.io.try_lock() else {
            return Vec::new();
        };
        let excess = cache.len() - self.high_water_mark;
        let victims: Vec<NeuronId> = cache
            .iter()
            .rev()
            .filter(|(_, n)| !n.in_use())
            .map(|(id, _)| *id)
            .take(excess)
            .collect();

        let mut evicted = Vec::with_capacity(victims.len());
        for id in victims {
            let Some(neuron) = cache.peek(&id) else {
                continue;
            };
            if neuron.is_changed() {
                if let Err(e) = self.flush_to_stream(stream, neuron) {
                    tracing::warn!(%id, error = %e, "cannot flush entity; keeping it resident");
                    continue;
                }
            }
            cache.pop(&id);
            self.resident_links.remove(&id);
            self.resident_annotations.remove(&id);
            evicted.push(id);
        }
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), resident = cache.len(), "evicted entities");
        }
        evicted
    }

    fn flush_to_stream(&self, stream: &StreamDir, neuron: &Neuron) -> StoreResult<()> {
        let id = neuron.id();
        let Some(body) = neuron.body().try_lock() else {
            return Err(StoreError::Io {
                source: std::io::Error::other("entity is locked"),
            });
        };
        let frame = encode_frame(id, &body)?;
        stream.write(id, &frame)?;
        let mut disk = self.disk.write();
        let version = disk.stamp();
        disk.insert(
            id,
            DirEntry {
                location: Location::Stream,
                ends: body.link().map(|l| l.ends()),
                annotations: body.annotations(),
                version,
            },
        );
        Ok(())
    }

    // ── Attach / save / clear ───────────────────────────────────────────

    /// Attach an aggregate file as the backing medium.
    ///
    /// Only frame headers are read. Records with an unknown tag, and links
    /// whose endpoints or meaning are not in the file, are logged and
    /// skipped. Other annotations that do not resolve are logged here and
    /// dropped when the record is paged in.
    pub fn attach(&self, path: &Path) -> StoreResult<AttachReport> {
        let _io = self.io.lock();
        self.install(path)
    }

    fn install(&self, path: &Path) -> StoreResult<AttachReport> {
        let file = Arc::new(AttachedFile::open(path)?);
        let scan = file.scan();
        let mut skipped = scan.corrupt;
        let mut entries: HashMap<NeuronId, DirEntry> = HashMap::with_capacity(scan.frames.len());
        for (header, offset) in &scan.frames {
            if header.type_tag().is_none() {
                tracing::warn!(id = %header.id, tag = header.tag, "skipping record with unknown type tag");
                skipped += 1;
                continue;
            }
            let entry = DirEntry {
                location: Location::Aggregate {
                    offset: *offset,
                    len: header.frame_len(),
                },
                ends: header.ends,
                annotations: header.annotations(),
                version: 0,
            };
            if entries.insert(header.id, entry).is_some() {
                tracing::warn!(id = %header.id, "duplicate record; the later one wins");
                skipped += 1;
            }
        }

        // Links need both ends and their meaning; dropping one link can
        // orphan links that target it.
        loop {
            let orphans: Vec<(NeuronId, NeuronId)> = entries
                .iter()
                .filter_map(|(id, e)| {
                    let ends = e.ends?;
                    [ends.from, ends.to, ends.meaning]
                        .into_iter()
                        .find(|end| !entries.contains_key(end))
                        .map(|missing| (*id, missing))
                })
                .collect();
            if orphans.is_empty() {
                break;
            }
            for (id, missing) in orphans {
                let error = StoreError::ReferentialViolation {
                    id: id.get(),
                    missing: missing.get(),
                };
                tracing::warn!(%error, "skipping link record");
                entries.remove(&id);
                skipped += 1;
            }
        }
        for (id, entry) in &entries {
            for missing in entry.annotations.iter().filter(|r| !entries.contains_key(*r)) {
                let error = StoreError::ReferentialViolation {
                    id: id.get(),
                    missing: missing.get(),
                };
                tracing::warn!(%error, "record names a missing annotation");
            }
        }

        let mut directory = Directory {
            medium: Some(Arc::clone(&file)),
            ..Directory::default()
        };
        for (id, entry) in entries {
            directory.insert(id, entry);
        }
        let max_id = directory.entries.keys().map(|id| id.get()).max().unwrap_or(0);
        let next_id = file.header().next_id.max(max_id + 1);
        let records = directory.entries.len();
        *self.disk.write() = directory;

        tracing::info!(path = %path.display(), records, skipped, next_id, "attached graph file");
        Ok(AttachReport {
            path: path.to_path_buf(),
            records,
            skipped,
            next_id,
        })
    }

    /// Write every live entity to `path` and re-attach to it.
    ///
    /// Resident entities are written from memory under their body lock;
    /// everything else is copied from its stored frame. The new file replaces
    /// `path` only once complete. The caller must not hold any entity lock.
    pub fn save(&self, path: &Path, next_id: u64, cancel: &CancelFlag) -> StoreResult<SaveReport> {
        let _io = self.io.lock();

        let resident: HashMap<NeuronId, Neuron> = self
            .resident
            .lock()
            .iter()
            .map(|(id, n)| (*id, n.clone()))
            .collect();
        let ids: BTreeSet<NeuronId> = {
            let disk = self.disk.read();
            disk.entries
                .keys()
                .chain(resident.keys())
                .copied()
                .filter(|id| !self.is_tombstoned(*id))
                .collect()
        };

        let mut writer = FileWriter::create(path)?;
        let mut written: Vec<(&Neuron, u64)> = Vec::with_capacity(resident.len());
        for (i, id) in ids.iter().enumerate() {
            if i % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
                tracing::info!(path = %path.display(), written = i, "save cancelled");
                return Err(StoreError::Cancelled);
            }
            if let Some(neuron) = resident.get(id) {
                let body = neuron.body().lock();
                if neuron.is_deleted() {
                    continue;
                }
                let frame = encode_frame(*id, &body)?;
                let generation = neuron.generation();
                drop(body);
                writer.push(&frame)?;
                written.push((neuron, generation));
            } else if let Some((frame, _)) = self.read_stored(*id)? {
                writer.push(&frame)?;
            }
        }
        let records = writer.finish(next_id)?;

        let mut flushed = 0;
        for (neuron, generation) in written {
            let _body = neuron.body().lock();
            if neuron.clear_changed_if(generation) {
                flushed += 1;
            }
        }
        drop(resident);

        self.install(path)?;
        if let Some(stream) = &self.stream {
            stream.purge()?;
        }
        tracing::info!(path = %path.display(), records, flushed, "saved graph");
        Ok(SaveReport {
            path: path.to_path_buf(),
            records,
            flushed,
        })
    }

    /// Evict everything and detach from the backing medium.
    ///
    /// Outstanding handles are marked deleted so nothing stale survives into
    /// the next graph.
    pub fn clear(&self) -> StoreResult<usize> {
        let _io = self.io.lock();
        let drained: Vec<Neuron> = {
            let mut cache = self.resident.lock();
            let all = cache.iter().map(|(_, n)| n.clone()).collect();
            cache.clear();
            all
        };
        for neuron in &drained {
            neuron.mark_deleted();
        }
        *self.disk.write() = Directory::default();
        self.resident_links.clear();
        self.resident_annotations.clear();
        self.tombstones.clear();
        if let Some(stream) = &self.stream {
            stream.purge()?;
        }
        Ok(drained.len())
    }

    // ── Bulk tooling ────────────────────────────────────────────────────

    /// Ids present in durable storage, ascending.
    pub fn stored_ids(&self) -> Vec<NeuronId> {
        let disk = self.disk.read();
        let mut ids: Vec<NeuronId> = disk
            .entries
            .keys()
            .copied()
            .filter(|id| !self.is_tombstoned(*id))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Decode every stored record without making it resident.
    pub fn verify(&self, cancel: &CancelFlag) -> StoreResult<VerifyReport> {
        let mut report = VerifyReport::default();
        for (i, id) in self.stored_ids().into_iter().enumerate() {
            if i % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let Some((frame, _)) = self.read_stored(id)? else {
                continue;
            };
            report.checked += 1;
            match decode_frame(&frame) {
                Ok((_, body)) => {
                    let mut refs: Vec<NeuronId> = body
                        .links_out()
                        .iter()
                        .chain(body.clustered_by())
                        .copied()
                        .collect();
                    if let Some(c) = body.cluster() {
                        refs.extend_from_slice(c.children());
                    }
                    if let Some(l) = body.link() {
                        refs.extend([l.from(), l.to()]);
                    }
                    refs.extend(body.annotations());
                    refs.sort_unstable();
                    refs.dedup();
                    for r in refs {
                        if !self.contains(r) {
                            report.dangling.push((id, r));
                        }
                    }
                }
                Err(e) => report.malformed.push((id, e.to_string())),
            }
        }
        Ok(report)
    }

    pub fn stats(&self) -> StoreStats {
        let (resident, dirty) = {
            let cache = self.resident.lock();
            let dirty = cache.iter().filter(|(_, n)| n.is_changed()).count();
            (cache.len(), dirty)
        };
        let disk = self.disk.read();
        StoreStats {
            resident,
            dirty,
            stored: disk.entries.len(),
            streamed: disk
                .entries
                .values()
                .filter(|e| matches!(e.location, Location::Stream))
                .count(),
            tombstones: self.tombstones.len(),
            path: disk.medium.as_ref().map(|m| m.path().to_path_buf()),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("mode", &self.mode)
            .field("high_water_mark", &self.high_water_mark)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neuron::{ClusterBody, LinkBody, ScalarValue};
    use tempfile::TempDir;

    fn nid(raw: u64) -> NeuronId {
        NeuronId::new(raw).unwrap()
    }

    fn committed(id: u64, payload: Payload) -> Neuron {
        let n = Neuron::new(payload);
        assert!(n.assign_id(nid(id)));
        n
    }

    fn link_payload(from: u64, to: u64, meaning: u64) -> Payload {
        Payload::Link(LinkBody {
            ends: LinkEnds {
                from: nid(from),
                to: nid(to),
                meaning: nid(meaning),
            },
            info: Vec::new(),
        })
    }

    #[test]
    fn save_attach_page_in() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.ngr");
        let store = Store::new(&GraphConfig::default()).unwrap();
        store.register(committed(1, Payload::Scalar(ScalarValue::Int(7))));
        store.register(committed(2, Payload::Plain));
        store.register(committed(3, link_payload(1, 2, 1)));
        store.track_link(
            nid(3),
            LinkEnds {
                from: nid(1),
                to: nid(2),
                meaning: nid(1),
            },
        );

        let report = store.save(&path, 4, &CancelFlag::new()).unwrap();
        assert_eq!(report.records, 3);
        assert_eq!(report.flushed, 3);
        store.clear().unwrap();
        assert!(!store.contains(nid(1)));

        let attached = store.attach(&path).unwrap();
        assert_eq!(attached.records, 3);
        assert_eq!(attached.next_id, 4);
        assert!(!store.is_resident(nid(2)));
        assert_eq!(store.links_in_candidates(nid(2)), BTreeSet::from([nid(3)]));

        let n = store.page_in(nid(1)).unwrap().unwrap();
        assert!(!n.is_changed());
        assert_eq!(n.body().lock().scalar(), Some(&ScalarValue::Int(7)));
        assert!(store.page_in(nid(99)).unwrap().is_none());
    }

    #[test]
    fn cancelled_save_keeps_previous_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.ngr");
        let store = Store::new(&GraphConfig::default()).unwrap();
        store.register(committed(1, Payload::Plain));
        store.save(&path, 2, &CancelFlag::new()).unwrap();
        let before = std::fs::read(&path).unwrap();

        store.register(committed(2, Payload::Plain));
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(matches!(
            store.save(&path, 3, &cancel),
            Err(StoreError::Cancelled)
        ));
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn stream_mode_evicts_lru_and_flushes_dirty() {
        let dir = TempDir::new().unwrap();
        let config = GraphConfig::streaming(dir.path().join("stream"), 2);
        let store = Store::new(&config).unwrap();
        for i in 1..=4 {
            store.register(committed(i, Payload::Scalar(ScalarValue::Int(i as i64))));
        }
        let held = store.resident(nid(1)).unwrap();

        let evicted = store.maybe_evict();
        assert_eq!(evicted, vec![nid(2), nid(3)]);
        assert!(store.is_resident(nid(1)));
        assert!(store.contains(nid(2)));
        assert_eq!(store.stats().streamed, 2);
        drop(held);

        let back = store.page_in(nid(2)).unwrap().unwrap();
        assert!(!back.is_changed());
        assert_eq!(back.body().lock().scalar(), Some(&ScalarValue::Int(2)));
    }

    #[test]
    fn in_memory_mode_never_evicts() {
        let mut config = GraphConfig::default();
        config.cache_high_water_mark = 1;
        let store = Store::new(&config).unwrap();
        for i in 1..=3 {
            store.register(committed(i, Payload::Plain));
        }
        assert!(store.maybe_evict().is_empty());
        assert_eq!(store.stats().resident, 3);
    }

    #[test]
    fn forgotten_ids_are_tombstoned() {
        let store = Store::new(&GraphConfig::default()).unwrap();
        store.register(committed(1, Payload::Plain));
        store.forget(nid(1));
        assert!(store.is_tombstoned(nid(1)));
        assert!(!store.contains(nid(1)));
        assert!(store.page_in(nid(1)).unwrap().is_none());
    }

    #[test]
    fn forget_removes_stream_file() {
        let dir = TempDir::new().unwrap();
        let stream_dir = dir.path().join("stream");
        let store = Store::new(&GraphConfig::streaming(stream_dir.clone(), 1)).unwrap();
        for i in 1..=2 {
            store.register(committed(i, Payload::Plain));
        }
        assert_eq!(store.maybe_evict(), vec![nid(1)]);
        assert!(stream_dir.join("1.rec").exists());

        store.forget(nid(1));
        assert!(!stream_dir.join("1.rec").exists());
        assert_eq!(store.stats().streamed, 0);
        assert!(store.page_in(nid(1)).unwrap().is_none());
    }

    #[test]
    fn annotation_referrers_survive_save_and_attach() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.ngr");
        let store = Store::new(&GraphConfig::default()).unwrap();
        store.register(committed(1, Payload::Plain));
        store.register(committed(
            2,
            Payload::Cluster(ClusterBody {
                meaning: Some(nid(1)),
                children: Vec::new(),
                ordered: false,
            }),
        ));
        store.track_annotations(nid(2), vec![nid(1)]);
        assert_eq!(store.annotation_candidates(nid(1)), BTreeSet::from([nid(2)]));

        store.save(&path, 3, &CancelFlag::new()).unwrap();
        store.clear().unwrap();
        assert!(store.annotation_candidates(nid(1)).is_empty());
        store.attach(&path).unwrap();
        assert!(!store.is_resident(nid(2)));
        assert_eq!(store.annotation_candidates(nid(1)), BTreeSet::from([nid(2)]));

        store.forget(nid(2));
        assert!(store.annotation_candidates(nid(1)).is_empty());
    }

    #[test]
    fn dangling_annotations_are_reported_and_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.ngr");
        let mut writer = FileWriter::create(&path).unwrap();
        let plain = NeuronBody::new(Payload::Plain);
        writer.push(&encode_frame(nid(1), &plain).unwrap()).unwrap();
        // Meaning 9 is not in the file, so the link cannot be kept.
        writer
            .push(&encode_frame(nid(2), &NeuronBody::new(link_payload(1, 1, 9))).unwrap())
            .unwrap();
        let cluster = NeuronBody::new(Payload::Cluster(ClusterBody {
            meaning: Some(nid(8)),
            children: Vec::new(),
            ordered: true,
        }));
        writer.push(&encode_frame(nid(3), &cluster).unwrap()).unwrap();
        let annotated = NeuronBody::new(Payload::Link(LinkBody {
            ends: LinkEnds {
                from: nid(1),
                to: nid(1),
                meaning: nid(1),
            },
            info: vec![nid(7)],
        }));
        writer.push(&encode_frame(nid(4), &annotated).unwrap()).unwrap();
        writer.finish(5).unwrap();

        let store = Store::new(&GraphConfig::default()).unwrap();
        let report = store.attach(&path).unwrap();
        assert_eq!(report.skipped, 1);
        assert!(!store.contains(nid(2)));

        let verify = store.verify(&CancelFlag::new()).unwrap();
        assert!(!verify.is_clean());
        assert_eq!(verify.dangling, vec![(nid(3), nid(8)), (nid(4), nid(7))]);

        let cluster = store.page_in(nid(3)).unwrap().unwrap();
        assert_eq!(cluster.body().lock().cluster().unwrap().meaning(), None);
        let link = store.page_in(nid(4)).unwrap().unwrap();
        assert!(link.body().lock().link().unwrap().info().is_empty());
    }

    #[test]
    fn clear_marks_outstanding_handles_deleted() {
        let store = Store::new(&GraphConfig::default()).unwrap();
        let n = committed(1, Payload::Plain);
        store.register(n.clone());
        assert_eq!(store.clear().unwrap(), 1);
        assert!(n.is_deleted());
        assert_eq!(store.stats().resident, 0);
    }

    #[test]
    fn attach_skips_links_with_missing_ends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.ngr");
        let mut writer = FileWriter::create(&path).unwrap();
        let plain = NeuronBody::new(Payload::Plain);
        writer.push(&encode_frame(nid(1), &plain).unwrap()).unwrap();
        writer
            .push(&encode_frame(nid(2), &NeuronBody::new(link_payload(1, 9, 1))).unwrap())
            .unwrap();
        // Targets link 2, so it goes too.
        writer
            .push(&encode_frame(nid(3), &NeuronBody::new(link_payload(1, 2, 1))).unwrap())
            .unwrap();
        writer.finish(4).unwrap();

        let store = Store::new(&GraphConfig::default()).unwrap();
        let report = store.attach(&path).unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.skipped, 2);
        assert!(store.contains(nid(1)));
        assert!(!store.contains(nid(2)));
    }

    #[test]
    fn malformed_record_is_skipped_on_page_in() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.ngr");
        let mut writer = FileWriter::create(&path).unwrap();
        writer
            .push(&encode_frame(nid(1), &NeuronBody::new(Payload::Plain)).unwrap())
            .unwrap();
        let mut bad = encode_frame(
            nid(2),
            &NeuronBody::new(Payload::Scalar(ScalarValue::Text("x".into()))),
        )
        .unwrap();
        // Unknown payload variant.
        bad[record::FRAME_HEADER_SIZE] = 0xee;
        writer.push(&bad).unwrap();
        writer.finish(3).unwrap();

        let store = Store::new(&GraphConfig::default()).unwrap();
        store.attach(&path).unwrap();
        let report = store.verify(&CancelFlag::new()).unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.malformed.len(), 1);

        assert!(store.page_in(nid(2)).unwrap().is_none());
        assert!(!store.contains(nid(2)));
        assert!(store.page_in(nid(1)).unwrap().is_some());
    }
}
