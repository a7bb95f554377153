use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fxprop::{
    ComputationResult, Entity, EntityRef, FallbackReason, Property, PropertyKind,
};
use fxstore::{FailureKind, PropertyStore, StoreConfig, StoreError};

#[derive(Debug)]
struct Node(&'static str);

impl EntityRef for Node {
    fn name(&self) -> String {
        self.0.to_string()
    }
}

fn monotone(new: &Property, old: &Property) -> bool {
    new.downcast::<u32>().unwrap() >= old.downcast::<u32>().unwrap()
}

fn value_of(p: &Property) -> u32 {
    *p.downcast::<u32>().unwrap()
}

#[test]
fn eager_computations_store_final_values() {
    let nodes: Vec<Entity> = ["a", "bb", "ccc"]
        .iter()
        .map(|n| Entity::new(Node(n)))
        .collect();
    let store = PropertyStore::new(StoreConfig::sequential(), Arc::new(nodes.clone()));
    let kind = store.register_kind_without_fallback(PropertyKind::new("len", monotone));

    store.schedule(
        kind,
        |_| true,
        Arc::new(move |_, entity| {
            let len = entity.downcast_ref::<Node>().unwrap().0.len() as u32;
            ComputationResult::Final {
                property: Property::new(kind, len),
                entity,
            }
        }),
    );
    store.await_completion(true).unwrap();

    for (node, expected) in nodes.iter().zip([1u32, 2, 3]) {
        let result = store.query(node, kind);
        assert!(result.is_final());
        assert_eq!(value_of(result.property().unwrap()), expected);
    }
    assert_eq!(store.collect_final(kind).len(), 3);
    assert_eq!(store.scheduled_tasks(), 3);
    assert_eq!(store.processed_tasks(), 3);
}

#[test]
fn fallback_reason_distinguishes_uncovered_from_unregistered() {
    let a = Entity::new(Node("a"));
    let x = Entity::new(Node("x"));
    let universe = vec![a.clone(), x.clone()];

    let reasoned = || {
        PropertyKind::new("coverage", monotone).with_fallback(|_, reason| match reason {
            FallbackReason::NoAnalysisRegistered => 100u32,
            FallbackReason::NotCoveredByRegisteredAnalysis => 200u32,
        })
    };

    // Nothing ever computes the kind.
    let store = PropertyStore::new(StoreConfig::sequential(), Arc::new(universe.clone()));
    let kind = store.register_kind(reasoned()).unwrap();
    store.force(&x, kind);
    store.await_completion(true).unwrap();
    assert_eq!(value_of(store.query(&x, kind).property().unwrap()), 100);

    // An analysis computes the kind but skips `x`.
    let store = PropertyStore::new(StoreConfig::sequential(), Arc::new(universe));
    let kind = store.register_kind(reasoned()).unwrap();
    store.schedule(
        kind,
        |entity| entity.name() == "a",
        Arc::new(move |_, entity| ComputationResult::Final {
            property: Property::new(kind, 1u32),
            entity,
        }),
    );
    store.force(&x, kind);
    store.await_completion(true).unwrap();
    assert_eq!(value_of(store.query(&a, kind).property().unwrap()), 1);
    assert_eq!(value_of(store.query(&x, kind).property().unwrap()), 200);
}

#[test]
fn fallback_covers_every_demanded_entity() {
    #[derive(Debug)]
    struct Cell(u32);
    impl EntityRef for Cell {
        fn name(&self) -> String {
            format!("c{}", self.0)
        }
    }

    let cells: Vec<Entity> = (0..100).map(|i| Entity::new(Cell(i))).collect();
    let store = PropertyStore::new(StoreConfig::sequential(), Arc::new(cells.clone()));
    let kind = store
        .register_kind(PropertyKind::new("init", monotone).with_fallback(|_, _| 0u32))
        .unwrap();

    for cell in &cells {
        store.force(cell, kind);
    }
    store.await_completion(true).unwrap();

    let finals = store.collect_final(kind);
    assert_eq!(finals.len(), 100);
    assert!(finals.iter().all(|(_, p)| value_of(p) == 0));
}

#[test]
fn non_refining_update_is_rejected() {
    let a = Entity::new(Node("a"));
    let store = PropertyStore::new(StoreConfig::sequential(), Arc::new(vec![a.clone()]));
    let kind = store.register_kind_without_fallback(PropertyKind::new("level", monotone));

    store.schedule(
        kind,
        |_| true,
        Arc::new(move |_, entity| ComputationResult::Final {
            property: Property::new(kind, 5u32),
            entity,
        }),
    );
    store.schedule(
        kind,
        |_| true,
        Arc::new(move |_, entity| ComputationResult::Final {
            property: Property::new(kind, 3u32),
            entity,
        }),
    );

    match store.await_completion(true) {
        Err(StoreError::ComputationFailures(failures)) => {
            assert_eq!(failures.len(), 1);
            match &failures[0].error {
                FailureKind::IllegalRefinement { old, attempted } => {
                    assert_eq!(value_of(old), 5);
                    assert_eq!(value_of(attempted), 3);
                }
                other => panic!("expected a refinement failure, got {other:?}"),
            }
        }
        other => panic!("expected bundled failures, got {other:?}"),
    }
    // The stored value is untouched by the rejected update.
    assert_eq!(value_of(store.query(&a, kind).property().unwrap()), 5);
    assert!(store.query(&a, kind).is_final());
}

#[test]
fn lazy_computation_runs_at_most_once_per_entity() {
    let a = Entity::new(Node("a"));
    let x = Entity::new(Node("x"));
    let store = PropertyStore::new(
        StoreConfig::sequential(),
        Arc::new(vec![a.clone(), x.clone()]),
    );
    let kind = store.register_kind_without_fallback(PropertyKind::new("lazy", monotone));

    let runs = Arc::new(AtomicUsize::new(0));
    store.register_lazy(kind, {
        let runs = Arc::clone(&runs);
        Arc::new(move |_, entity| {
            runs.fetch_add(1, Ordering::SeqCst);
            ComputationResult::Final {
                property: Property::new(kind, 7u32),
                entity,
            }
        })
    });

    store.require(&a, &x, kind);
    store.require(&a, &x, kind);
    store.force(&x, kind);
    store.await_completion(true).unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(value_of(store.query(&x, kind).property().unwrap()), 7);

    // Forcing a completed pair again must not restart the computation.
    store.force(&x, kind);
    store.await_completion(true).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn query_never_triggers_lazy_computations() {
    let x = Entity::new(Node("x"));
    let store = PropertyStore::new(StoreConfig::sequential(), Arc::new(vec![x.clone()]));
    let kind = store.register_kind_without_fallback(PropertyKind::new("lazy", monotone));

    let runs = Arc::new(AtomicUsize::new(0));
    store.register_lazy(kind, {
        let runs = Arc::clone(&runs);
        Arc::new(move |_, entity| {
            runs.fetch_add(1, Ordering::SeqCst);
            ComputationResult::Final {
                property: Property::new(kind, 7u32),
                entity,
            }
        })
    });

    assert!(store.query(&x, kind).is_unknown());
    store.await_completion(true).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(store.query(&x, kind).is_unknown());
}

#[test]
fn demanded_pair_without_fallback_fails_the_run() {
    let x = Entity::new(Node("x"));
    let store = PropertyStore::new(StoreConfig::sequential(), Arc::new(vec![x.clone()]));
    let kind = store.register_kind_without_fallback(PropertyKind::new("bare", monotone));

    store.force(&x, kind);
    match store.await_completion(true) {
        Err(StoreError::ComputationFailures(failures)) => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].error, FailureKind::MissingFallback));
        }
        other => panic!("expected bundled failures, got {other:?}"),
    }
}

#[test]
fn unresolved_pairs_are_reported_without_fallbacks() {
    let x = Entity::new(Node("x"));
    let store = PropertyStore::new(StoreConfig::sequential(), Arc::new(vec![x.clone()]));
    let kind = store.register_kind_without_fallback(PropertyKind::new("bare", monotone));

    store.force(&x, kind);
    match store.await_completion(false) {
        Err(StoreError::Unresolved(pairs)) => {
            assert_eq!(pairs.len(), 1);
            assert_eq!(pairs[0].0, x);
            assert_eq!(pairs[0].1, kind);
        }
        other => panic!("expected unresolved pairs, got {other:?}"),
    }
}

#[test]
fn panicking_computation_is_isolated() {
    let good = Entity::new(Node("good"));
    let bad = Entity::new(Node("bad"));
    let store = PropertyStore::new(
        StoreConfig::sequential(),
        Arc::new(vec![good.clone(), bad.clone()]),
    );
    let kind = store.register_kind_without_fallback(PropertyKind::new("risky", monotone));

    store.schedule(
        kind,
        |_| true,
        Arc::new(move |_, entity| {
            if entity.name() == "bad" {
                panic!("computation exploded");
            }
            ComputationResult::Final {
                property: Property::new(kind, 1u32),
                entity,
            }
        }),
    );

    match store.await_completion(true) {
        Err(StoreError::ComputationFailures(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].entity.as_ref(), Some(&bad));
            match &failures[0].error {
                FailureKind::Panicked(msg) => assert!(msg.contains("exploded")),
                other => panic!("expected a panic failure, got {other:?}"),
            }
        }
        other => panic!("expected bundled failures, got {other:?}"),
    }
    assert!(store.query(&good, kind).is_final());
}

#[test]
fn multi_results_are_processed_independently() {
    let a = Entity::new(Node("a"));
    let b = Entity::new(Node("b"));
    let store = PropertyStore::new(
        StoreConfig::sequential(),
        Arc::new(vec![a.clone(), b.clone()]),
    );
    let kind = store.register_kind_without_fallback(PropertyKind::new("pair", monotone));

    let b_for_comp = b.clone();
    store.schedule(
        kind,
        |entity| entity.name() == "a",
        Arc::new(move |_, entity| {
            ComputationResult::Multi(vec![
                ComputationResult::Final {
                    entity: entity.clone(),
                    property: Property::new(kind, 1u32),
                },
                ComputationResult::Final {
                    entity: b_for_comp.clone(),
                    property: Property::new(kind, 2u32),
                },
            ])
        }),
    );
    store.await_completion(true).unwrap();

    assert_eq!(value_of(store.query(&a, kind).property().unwrap()), 1);
    assert_eq!(value_of(store.query(&b, kind).property().unwrap()), 2);
}

#[test]
fn suspended_computation_reruns_once_the_dependee_appears() {
    let src = Entity::new(Node("src"));
    let sink = Entity::new(Node("sink"));
    let store = PropertyStore::new(
        StoreConfig::sequential(),
        Arc::new(vec![src.clone(), sink.clone()]),
    );
    let kind = store.register_kind_without_fallback(PropertyKind::new("flow", monotone));

    let runs = Arc::new(AtomicUsize::new(0));
    let src_dep = src.clone();
    store.schedule(
        kind,
        |entity| entity.name() == "sink",
        Arc::new({
            let runs = Arc::clone(&runs);
            move |store, entity| {
                runs.fetch_add(1, Ordering::SeqCst);
                let observed = store.require(&entity, &src_dep, kind);
                match observed.property() {
                    Some(p) => ComputationResult::Final {
                        property: Property::new(kind, value_of(p) + 1),
                        entity,
                    },
                    None => ComputationResult::Suspended {
                        dependee: observed.key(),
                        entity,
                        kind,
                    },
                }
            }
        }),
    );
    store.schedule(
        kind,
        |entity| entity.name() == "src",
        Arc::new(move |_, entity| ComputationResult::Final {
            property: Property::new(kind, 10u32),
            entity,
        }),
    );
    store.await_completion(true).unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(value_of(store.query(&sink, kind).property().unwrap()), 11);
}
