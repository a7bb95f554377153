use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use smallvec::SmallVec;

use fxprop::{Entity, Finality, PropertyKindId};

use crate::store::PropertyStore;
use crate::tracker::ComputationKey;

struct Member {
    entity: Entity,
    kind: PropertyKindId,
    dependees: Vec<(Entity, PropertyKindId)>,
}

/// Close dependency cycles among parked computations.
///
/// Called at quiescence, after fallback injection had its chance: every
/// remaining waiting computation is waiting on another waiting computation
/// or on nothing that will ever change. The dependency graph over waiting
/// records is condensed into strongly connected components, and every
/// *closed sink* component (no member waiting on anything outside the
/// component, no edge leaving it) is finalized: all member records are
/// retired first, then each member slot is finalized at its kind's
/// cycle meet of the current bound. Finalization notifications wake the
/// components one layer up; they are resolved in the next quiescence round.
///
/// Runs on the joining thread while all workers are parked, so the waiting
/// snapshot cannot change underneath it.
pub(crate) fn resolve_quiescent_cycles(store: &PropertyStore) -> bool {
    let waiting = store.tracker.waiting();
    if waiting.is_empty() {
        return false;
    }

    let mut members: HashMap<ComputationKey, Member> = HashMap::new();
    let mut owners: HashMap<(Entity, PropertyKindId), SmallVec<ComputationKey, 1>> =
        HashMap::new();

    for (key, record) in &waiting {
        let record = record.lock();
        owners
            .entry((record.entity.clone(), record.kind))
            .or_default()
            .push(*key);
        members.insert(
            *key,
            Member {
                entity: record.entity.clone(),
                kind: record.kind,
                dependees: record
                    .dependees
                    .iter()
                    .filter(|d| !d.is_final())
                    .map(|d| (d.entity().clone(), d.kind()))
                    .collect(),
            },
        );
    }

    // Edge per observed dependee, from depender to every waiting producer
    // of that pair. A non-final dependee nobody is producing pins the
    // depender to the open world; its component must not be closed here.
    let mut graph: DiGraphMap<ComputationKey, ()> = DiGraphMap::new();
    let mut open_world: HashSet<ComputationKey> = HashSet::new();
    for (key, member) in &members {
        graph.add_node(*key);
        for (entity, kind) in &member.dependees {
            if store.table.read(entity, *kind).is_final() {
                continue;
            }
            match owners.get(&(entity.clone(), *kind)) {
                Some(producers) => {
                    for producer in producers {
                        graph.add_edge(*key, *producer, ());
                    }
                }
                None => {
                    open_world.insert(*key);
                }
            }
        }
    }

    let mut progressed = false;
    for scc in tarjan_scc(&graph) {
        let scc_set: HashSet<ComputationKey> = scc.iter().copied().collect();
        let closed = scc.iter().all(|key| {
            !open_world.contains(key) && graph.neighbors(*key).all(|n| scc_set.contains(&n))
        });
        if !closed {
            continue;
        }

        debug!("finalizing dependency cycle of {} computation(s)", scc.len());

        // Retire every member before touching any slot, so the member
        // notifications triggered below hit only keys that miss in the
        // arena.
        for key in &scc {
            if let Some(record) = store.tracker.remove(*key) {
                record.lock().retire();
            }
            progressed = true;
        }

        for key in &scc {
            let member = &members[key];
            let bound = store
                .table
                .slot(&member.entity, member.kind)
                .lock()
                .value()
                .map(|(property, _)| property.clone());
            match bound {
                Some(bound) => {
                    let kind = store.registry.get(member.kind);
                    let value = kind.meet_on_cycle(&member.entity, &bound);
                    store.apply_update(&member.entity, member.kind, value, Finality::Final);
                }
                None => warn!(
                    "cycle member {:?} / {} has no bound to finalize",
                    member.entity,
                    store.registry.name(member.kind)
                ),
            }
        }
    }

    progressed
}
