use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::SlotMap;
use smallvec::SmallVec;

use fxprop::{Continuation, Entity, PropertyKindId, QueryResult};

slotmap::new_key_type! {
    /// Stable handle to one in-flight computation.
    pub struct ComputationKey;
}

/// Where an in-flight computation currently is.
///
/// The phase machine is what makes re-runs coalesce: any number of dependee
/// changes while `Waiting` claim the single `Waiting -> Scheduled` edge, so
/// at most one replay task per computation is ever queued, and a replay
/// only moves to `Running` once it holds the continuation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::EnumIs)]
pub enum Phase {
    /// Parked; a dependee change must schedule a replay.
    Waiting,
    /// A replay task is queued but has not started.
    Scheduled,
    /// The continuation is executing; the record holds no continuation.
    Running,
    /// Finished for good; the record is about to leave the arena.
    Retired,
}

/// Book-keeping for one computation that returned an intermediate result.
pub struct InFlight {
    pub entity: Entity,
    pub kind: PropertyKindId,
    /// Present exactly while the phase is `Waiting` or `Scheduled`.
    pub continuation: Option<Continuation>,
    /// Dependee values as observed when the continuation was installed.
    pub dependees: SmallVec<QueryResult, 4>,
    pub phase: Phase,
}

impl InFlight {
    pub fn new(entity: Entity, kind: PropertyKindId) -> Self {
        InFlight {
            entity,
            kind,
            continuation: None,
            dependees: SmallVec::new(),
            phase: Phase::Running,
        }
    }

    /// Claim the single transition that schedules a replay. Returns false
    /// when someone else already claimed it or the record is past waiting.
    pub fn claim_for_schedule(&mut self) -> bool {
        if self.phase.is_waiting() {
            self.phase = Phase::Scheduled;
            true
        } else {
            false
        }
    }

    pub fn depends_on(&self, entity: &Entity, kind: PropertyKindId) -> bool {
        self.dependees
            .iter()
            .any(|d| d.kind() == kind && d.entity() == entity)
    }

    pub fn retire(&mut self) -> Option<Continuation> {
        self.phase = Phase::Retired;
        self.dependees.clear();
        self.continuation.take()
    }
}

/// Arena of in-flight computations.
///
/// Records are shared `Arc<Mutex<..>>` handles so slot depender lists can
/// point at them with plain keys while the arena lock stays short-lived.
/// Keys of removed records simply miss on lookup, which is how stale
/// depender entries are skipped.
pub struct DependencyTracker {
    arena: Mutex<SlotMap<ComputationKey, Arc<Mutex<InFlight>>>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        DependencyTracker {
            arena: Mutex::new(SlotMap::with_key()),
        }
    }

    pub fn insert(&self, record: InFlight) -> ComputationKey {
        self.arena.lock().insert(Arc::new(Mutex::new(record)))
    }

    pub fn get(&self, key: ComputationKey) -> Option<Arc<Mutex<InFlight>>> {
        self.arena.lock().get(key).map(Arc::clone)
    }

    pub fn remove(&self, key: ComputationKey) -> Option<Arc<Mutex<InFlight>>> {
        self.arena.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.arena.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.lock().is_empty()
    }

    /// Snapshot of every record currently in the waiting phase.
    pub fn waiting(&self) -> Vec<(ComputationKey, Arc<Mutex<InFlight>>)> {
        self.arena
            .lock()
            .iter()
            .filter(|(_, record)| record.lock().phase.is_waiting())
            .map(|(key, record)| (key, Arc::clone(record)))
            .collect()
    }
}

impl Default for DependencyTracker {
    fn default() -> Self {
        DependencyTracker::new()
    }
}
