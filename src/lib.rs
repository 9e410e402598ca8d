// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # neurograph
//!
//! A concurrent, persistent, partially resident property graph.
//!
//! Entities reference each other by id only, so any of them can be paged in
//! or evicted while its neighbors stay on disk. Only outgoing links are
//! stored; incoming links are derived and memoized. Every mutation goes
//! through a sorted, all-or-nothing lock set.
//!
//! ## Architecture
//!
//! - **Identity** (`id`, `neuron`): one id space for neurons, links and clusters
//! - **Lock manager** (`lock`): sorted multi-entity lock sets with guarded mutators
//! - **Store** (`store`): LRU residency, aggregate file via mmap, per-entity stream files
//! - **Link resolution cache** (`links`): memoized reverse traversal
//! - **Scalar index** (`index`): first-match lookups by target value
//! - **Events** (`event`): synchronous publish/subscribe keeping the caches coherent
//!
//! ## Library usage
//!
//! ```no_run
//! use neurograph::{Graph, GraphConfig, Neuron};
//!
//! let graph = Graph::new(GraphConfig::default()).unwrap();
//! let adverb = graph.create(Neuron::plain()).unwrap();
//! let a = graph.create(Neuron::plain()).unwrap();
//! let b = graph.create(Neuron::scalar("quickly")).unwrap();
//! let link = graph.link(a, b, adverb).unwrap();
//!
//! let view = graph.links_in(b).unwrap();
//! assert_eq!(view.ids(), &[link]);
//! view.release();
//!
//! assert_eq!(graph.find_first(a, "quickly").unwrap(), Some(b));
//! graph.save("graph.ngr").unwrap();
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod id;
pub mod index;
pub mod links;
pub mod lock;
pub mod neuron;
pub mod store;

pub use cancel::CancelFlag;
pub use config::{GraphConfig, IndexConfig, StorageMode};
pub use error::{NeuroError, NeuroResult};
pub use event::{EventSink, GraphEvent, Subscription};
pub use graph::{Direction, Graph, GraphInfo, LockedView};
pub use id::NeuronId;
pub use lock::LockedSet;
pub use neuron::{LinkEnds, Neuron, NeuronBody, Payload, ScalarKind, ScalarValue, TypeTag};
pub use store::{AttachReport, SaveReport, VerifyReport};
