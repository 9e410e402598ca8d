//! End-to-end tests for the neurograph public API.
//!
//! Covers link symmetry, lock atomicity under contention, scalar index
//! soundness, deletion visibility and event delivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use neurograph::error::{EntityError, LockError};
use neurograph::event::EventLog;
use neurograph::{
    Direction, Graph, GraphConfig, GraphEvent, NeuroError, Neuron, NeuronId, ScalarValue,
};
use rand::Rng;
use rand::seq::SliceRandom;

fn test_graph() -> Graph {
    Graph::new(GraphConfig::default()).unwrap()
}

fn plains(graph: &Graph, n: usize) -> Vec<NeuronId> {
    (0..n).map(|_| graph.create(Neuron::plain()).unwrap()).collect()
}

#[test]
fn links_are_visible_from_both_ends() {
    let g = test_graph();
    let meaning = g.create(Neuron::plain()).unwrap();
    let nodes = plains(&g, 20);
    let mut rng = rand::thread_rng();
    let mut links = Vec::new();
    for _ in 0..60 {
        let from = *nodes.choose(&mut rng).unwrap();
        let to = *nodes.choose(&mut rng).unwrap();
        links.push((g.link(from, to, meaning).unwrap(), from, to));
    }

    for (link, from, to) in links {
        assert!(g.links_out(from).unwrap().contains(link));
        assert!(g.links_in(to).unwrap().contains(link));
    }
}

#[test]
fn self_link_appears_once() {
    let g = test_graph();
    let meaning = g.create(Neuron::plain()).unwrap();
    let a = g.create(Neuron::plain()).unwrap();
    let b = g.create(Neuron::plain()).unwrap();
    let self_link = g.link(a, a, meaning).unwrap();
    let out = g.link(a, b, meaning).unwrap();
    let inbound = g.link(b, a, meaning).unwrap();

    assert_eq!(g.links_out(a).unwrap().ids(), &[self_link, out]);
    assert_eq!(g.links_in(a).unwrap().ids(), &[self_link, inbound]);
    let both = g.links(a, Direction::Both).unwrap();
    assert_eq!(both.ids(), &[self_link, out, inbound]);
}

#[test]
fn in_links_reconverge_after_retarget_and_destroy() {
    let g = test_graph();
    let meaning = g.create(Neuron::plain()).unwrap();
    let [a, b, c] = plains(&g, 3).try_into().unwrap();
    let l1 = g.link(a, b, meaning).unwrap();
    let l2 = g.link(c, b, meaning).unwrap();
    // Memoize.
    assert_eq!(g.links_in(b).unwrap().len(), 2);

    g.retarget(l1, c).unwrap();
    assert_eq!(g.links_in(b).unwrap().ids(), &[l2]);
    assert_eq!(g.links_in(c).unwrap().ids(), &[l1]);

    g.destroy(l2).unwrap();
    assert!(g.links_in(b).unwrap().is_empty());
    assert!(g.links_out(c).unwrap().is_empty());
}

#[test]
fn concurrent_add_child_loses_nothing() {
    const THREADS: usize = 16;
    const PER_THREAD: usize = 25;

    let g = test_graph();
    let cluster = g.create(Neuron::cluster(None, true, Vec::new())).unwrap();

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..PER_THREAD {
                    let child = g.create(Neuron::plain()).unwrap();
                    g.add_child(cluster, child).unwrap();
                }
            });
        }
    });

    let view = g.children(cluster).unwrap();
    assert_eq!(view.len(), THREADS * PER_THREAD);
    let unique: HashSet<NeuronId> = view.iter().collect();
    assert_eq!(unique.len(), THREADS * PER_THREAD);
    for child in view.iter() {
        assert_eq!(view.locked().body(child).unwrap().clustered_by(), &[cluster]);
    }
}

#[test]
fn children_view_supports_bulk_clear() {
    let g = test_graph();
    let kids = plains(&g, 5);
    let cluster = g.create(Neuron::cluster(None, false, kids.clone())).unwrap();

    let mut view = g.children(cluster).unwrap();
    assert_eq!(view.ids(), kids.as_slice());
    view.locked_mut().clear_children(cluster).unwrap();
    view.release();

    assert!(g.children(cluster).unwrap().is_empty());
    for kid in kids {
        assert!(g.peek(kid, |b| b.clustered_by().is_empty()).unwrap());
    }
}

#[test]
fn index_never_returns_destroyed_targets() {
    let g = test_graph();
    let colour = g.create(Neuron::plain()).unwrap();
    let src = g.create(Neuron::plain()).unwrap();
    let t = g.create(Neuron::scalar("red")).unwrap();
    let l = g.link(src, t, colour).unwrap();
    assert_eq!(g.find_first(src, "red").unwrap(), Some(t));

    g.destroy(l).unwrap();
    let t2 = g.create(Neuron::scalar("red")).unwrap();
    g.link(src, t2, colour).unwrap();

    let found = g.find_first(src, "red").unwrap();
    assert_ne!(found, Some(t));
    assert!(found.is_none() || found == Some(t2));
    if let Some(hit) = found {
        assert!(g.contains(hit));
    }
}

#[test]
fn index_drops_destroyed_target_neuron() {
    let g = test_graph();
    let colour = g.create(Neuron::plain()).unwrap();
    let src = g.create(Neuron::plain()).unwrap();
    let t = g.create(Neuron::scalar(42i64)).unwrap();
    let t2 = g.create(Neuron::scalar(42i64)).unwrap();
    g.link(src, t, colour).unwrap();
    g.link(src, t2, colour).unwrap();
    assert_eq!(g.find_first(src, 42i64).unwrap(), Some(t));

    g.destroy(t).unwrap();
    assert_eq!(g.find_first(src, 42i64).unwrap(), Some(t2));
}

#[test]
fn index_stays_sound_under_random_mutation() {
    let g = test_graph();
    let meaning = g.create(Neuron::plain()).unwrap();
    let src = g.create(Neuron::plain()).unwrap();
    let mut rng = rand::thread_rng();
    let mut live: Vec<(NeuronId, NeuronId)> = Vec::new();

    for _ in 0..300 {
        match rng.gen_range(0..4) {
            0 | 1 => {
                let t = g.create(Neuron::scalar(rng.gen_range(0..8i64))).unwrap();
                live.push((g.link(src, t, meaning).unwrap(), t));
            }
            2 if !live.is_empty() => {
                let (link, _) = live.swap_remove(rng.gen_range(0..live.len()));
                g.destroy(link).unwrap();
            }
            _ if !live.is_empty() => {
                let (_, t) = live[rng.gen_range(0..live.len())];
                g.set_value(t, rng.gen_range(0..8i64)).unwrap();
            }
            _ => {}
        }

        let wanted = rng.gen_range(0..8i64);
        if let Some(hit) = g.find_first(src, wanted).unwrap() {
            assert!(live.iter().any(|(_, t)| *t == hit), "stale hit {hit}");
            let value = g.peek(hit, |b| b.scalar().cloned()).unwrap();
            assert_eq!(value, Some(ScalarValue::Int(wanted)));
        }
    }
}

#[test]
fn destroyed_targets_stay_destroyed() {
    let g = test_graph();
    let meaning = g.create(Neuron::plain()).unwrap();
    let target = g.create(Neuron::plain()).unwrap();
    let sources = plains(&g, 4);
    let links: Vec<NeuronId> = sources
        .iter()
        .map(|s| g.link(*s, target, meaning).unwrap())
        .collect();
    assert_eq!(g.links_in(target).unwrap().len(), 4);
    let handle = g.find(target).unwrap();

    g.destroy(target).unwrap();

    assert!(handle.is_deleted());
    assert!(matches!(
        g.links_in(target),
        Err(NeuroError::Entity(EntityError::Deleted { .. }))
    ));
    for (source, link) in sources.iter().zip(&links) {
        assert!(g.find(*link).is_none());
        assert!(g.links_out(*source).unwrap().is_empty());
    }
    let err = g.link(sources[0], target, meaning).unwrap_err();
    assert!(matches!(err, NeuroError::Entity(EntityError::Deleted { .. })));
    let err = g
        .create(Neuron::cluster(None, true, vec![target]))
        .unwrap_err();
    assert!(matches!(err, NeuroError::Entity(EntityError::Deleted { .. })));
}

#[test]
fn nested_lock_request_is_refused() {
    let g = test_graph();
    let [a, b] = plains(&g, 2).try_into().unwrap();
    let held = g.request_locks([a]).unwrap();
    assert!(matches!(
        g.request_locks([b]),
        Err(NeuroError::Lock(LockError::Nested { held: 1 }))
    ));
    assert!(matches!(
        g.links_out(b),
        Err(NeuroError::Lock(LockError::Nested { .. }))
    ));
    drop(held);
    assert!(g.links_out(b).unwrap().is_empty());
}

#[test]
fn inverted_overlapping_lock_sets_make_progress() {
    let g = Arc::new(test_graph());
    let [a, b, c] = plains(&g, 3).try_into().unwrap();
    let (done, finished) = mpsc::channel();

    for order in [[a, b, c], [c, b, a]] {
        let g = Arc::clone(&g);
        let done = done.clone();
        std::thread::spawn(move || {
            for _ in 0..2_000 {
                // One thread holds {first, second} and asks for {third}; the
                // other the reverse. Nesting is refused, so each drops its set
                // and requests the union instead.
                let first = g.request_locks([order[0], order[1]]).unwrap();
                let nested = g.request_locks([order[2]]);
                assert!(nested.is_err());
                drop(first);
                let all = g.request_locks(order).unwrap();
                assert_eq!(all.len(), 3);
            }
            done.send(()).unwrap();
        });
    }
    drop(done);

    for _ in 0..2 {
        finished
            .recv_timeout(Duration::from_secs(60))
            .expect("lock sets deadlocked");
    }
}

#[test]
fn concurrent_links_and_destroys_keep_views_consistent() {
    let g = test_graph();
    let meaning = g.create(Neuron::plain()).unwrap();
    let hub = g.create(Neuron::plain()).unwrap();
    let spokes = plains(&g, 8);

    std::thread::scope(|s| {
        for chunk in spokes.chunks(2) {
            let g = &g;
            s.spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..50 {
                    let spoke = chunk[rng.gen_range(0..chunk.len())];
                    let link = g.link(spoke, hub, meaning).unwrap();
                    if rng.gen_bool(0.5) {
                        g.destroy(link).unwrap();
                    }
                }
            });
        }
        s.spawn(|| {
            for _ in 0..50 {
                let view = g.links_in(hub).unwrap();
                for link in view.iter() {
                    assert_eq!(view.ends(link).unwrap().to, hub);
                }
            }
        });
    });

    let incoming = g.links_in(hub).unwrap().len();
    let outgoing: usize = spokes
        .iter()
        .map(|s| g.links_out(*s).unwrap().len())
        .sum();
    assert_eq!(incoming, outgoing);
}

#[test]
fn subscriptions_receive_events_until_dropped() {
    let g = test_graph();
    let log = Arc::new(EventLog::new());
    let sub = g.subscribe(log.clone());

    let n = g.create(Neuron::scalar(1.5)).unwrap();
    g.set_value(n, 2.5).unwrap();
    g.destroy(n).unwrap();
    assert_eq!(
        log.drain(),
        vec![
            GraphEvent::Created {
                id: n,
                tag: neurograph::TypeTag::Double
            },
            GraphEvent::NeuronChanged { id: n },
            GraphEvent::Removed {
                id: n,
                tag: neurograph::TypeTag::Double
            },
        ]
    );

    assert!(sub.is_attached());
    drop(sub);
    g.create(Neuron::plain()).unwrap();
    g.clear().unwrap();
    assert!(log.is_empty());
}

#[test]
fn subscription_does_not_keep_graph_alive() {
    let g = test_graph();
    let sub = g.subscribe(Arc::new(|_: &GraphEvent| {}));
    drop(g);
    assert!(!sub.is_attached());
}
