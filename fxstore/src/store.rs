use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use log::{debug, error, trace};
use parking_lot::{Mutex, RwLock};

use fxprop::{
    ComputationResult, Continuation, DependeeUpdate, Entity, EntityUniverse, FallbackReason,
    Finality, Property, PropertyKey, PropertyKind, PropertyKindId, QueryResult,
};

use crate::config::{Backend, DebugFlags, StoreConfig};
use crate::cycles::resolve_quiescent_cycles;
use crate::error::{FailureKind, StoreError, StoreResult, TaskFailure};
use crate::registry::KindRegistry;
use crate::scheduler::{PoolScheduler, SequentialScheduler, Task, TaskExecutor, TaskScheduler};
use crate::table::{PropertyTable, SuspendedCompute};
use crate::tracker::{ComputationKey, DependencyTracker, InFlight, Phase};

/// A property computation: invoked with the store and one entity, returns
/// what it could derive. Computations query other properties through
/// [`PropertyStore::require`] and report the observed values as dependees
/// of an intermediate result.
pub type PropertyComputation =
    Arc<dyn Fn(&PropertyStore, Entity) -> ComputationResult + Send + Sync>;

/// Dependee values one derivation step observed, kept for `validate`.
struct DerivationRecord {
    entity: Entity,
    kind: PropertyKindId,
    observed: Vec<QueryResult>,
}

pub(crate) enum UpdateOutcome {
    Stored,
    Unchanged,
    Rejected,
}

/// The fixpoint engine.
///
/// Analyses register property kinds, then schedule eager computations over
/// the entity universe or register lazy ones triggered on demand.
/// `await_completion` drives the configured scheduler until nothing can
/// change anymore: tasks drain, fallbacks are injected for demanded but
/// never-computed pairs, and dependency cycles among parked computations
/// are closed. Afterwards every demanded pair holds a final value or the
/// run reports why not.
pub struct PropertyStore {
    pub(crate) registry: KindRegistry,
    pub(crate) table: PropertyTable,
    pub(crate) tracker: DependencyTracker,
    scheduler: Box<dyn TaskScheduler>,
    universe: Arc<dyn EntityUniverse>,
    lazy: RwLock<HashMap<PropertyKindId, PropertyComputation>>,
    /// Kinds some analysis was registered or stored a bound for; decides
    /// which [`FallbackReason`] an injected fallback carries.
    computed_kinds: RwLock<HashSet<PropertyKindId>>,
    failures: Mutex<Vec<TaskFailure>>,
    derivations: Mutex<Vec<DerivationRecord>>,
    debug: DebugFlags,
}

impl PropertyStore {
    pub fn new(config: StoreConfig, universe: Arc<dyn EntityUniverse>) -> Self {
        let scheduler: Box<dyn TaskScheduler> = match config.backend {
            Backend::Sequential => Box::new(SequentialScheduler::new()),
            Backend::Parallel { workers } => Box::new(PoolScheduler::new(workers)),
        };
        PropertyStore {
            registry: KindRegistry::new(),
            table: PropertyTable::new(),
            tracker: DependencyTracker::new(),
            scheduler,
            universe,
            lazy: RwLock::new(HashMap::new()),
            computed_kinds: RwLock::new(HashSet::new()),
            failures: Mutex::new(Vec::new()),
            derivations: Mutex::new(Vec::new()),
            debug: config.debug,
        }
    }

    pub fn register_kind(&self, kind: PropertyKind) -> StoreResult<PropertyKindId> {
        self.registry.register(kind)
    }

    pub fn register_kind_without_fallback(&self, kind: PropertyKind) -> PropertyKindId {
        self.registry.register_without_fallback(kind)
    }

    /// Queue `computation` for every universe entity accepted by `filter`.
    pub fn schedule<F>(&self, produces: PropertyKindId, filter: F, computation: PropertyComputation)
    where
        F: Fn(&Entity) -> bool,
    {
        self.computed_kinds.write().insert(produces);
        let mut count = 0usize;
        for entity in self.universe.entities() {
            if filter(&entity) {
                count += 1;
                self.scheduler.submit(Task::Compute {
                    computation: Arc::clone(&computation),
                    entity,
                    kind: Some(produces),
                });
            }
        }
        debug!(
            "scheduled {count} computation(s) for `{}`",
            self.registry.name(produces)
        );
    }

    /// Register a computation run on demand, at most once per entity, the
    /// first time some consumer requires or forces the pair.
    pub fn register_lazy(&self, kind: PropertyKindId, computation: PropertyComputation) {
        self.computed_kinds.write().insert(kind);
        self.lazy.write().insert(kind, computation);
    }

    /// Demand a value for the pair without depending on it. The pair is
    /// covered by fallback injection even if nothing else ever asks.
    pub fn force(&self, entity: &Entity, kind: PropertyKindId) {
        self.table.slot(entity, kind).lock().forced = true;
        self.trigger_lazy(entity, kind);
    }

    /// Look up a dependee from within a computation: triggers the lazy
    /// computation for the pair, if any, and returns the current result.
    /// The durable dependency edge is established by listing the returned
    /// result among the dependees of the intermediate result.
    pub fn require(
        &self,
        depender: &Entity,
        entity: &Entity,
        kind: PropertyKindId,
    ) -> QueryResult {
        trace!(
            "{depender:?} requires {entity:?} / {}",
            self.registry.name(kind)
        );
        self.trigger_lazy(entity, kind);
        self.table.read(entity, kind)
    }

    /// Current result for a pair. Never triggers anything.
    pub fn query(&self, entity: &Entity, kind: PropertyKindId) -> QueryResult {
        self.table.read(entity, kind)
    }

    /// Every entity holding a final value of `kind`.
    pub fn collect_final(&self, kind: PropertyKindId) -> Vec<(Entity, Property)> {
        self.table
            .pairs()
            .into_iter()
            .filter(|(_, k, _)| *k == kind)
            .filter_map(|(entity, _, slot)| {
                let guard = slot.lock();
                match guard.value() {
                    Some((property, Finality::Final)) => Some((entity.clone(), property.clone())),
                    _ => None,
                }
            })
            .collect()
    }

    /// Drive the scheduler until nothing can change anymore.
    ///
    /// With `use_fallbacks`, demanded pairs no analysis covered are
    /// finalized at their kind's fallback before cycles are closed.
    /// Collected per-task failures are reported in one bundle; pairs left
    /// neither final nor failed are reported as unresolved.
    pub fn await_completion(&self, use_fallbacks: bool) -> StoreResult<()> {
        let run = StoreRun {
            store: self,
            use_fallbacks,
        };
        self.scheduler.run(&run);

        let failures = std::mem::take(&mut *self.failures.lock());
        if !failures.is_empty() {
            return Err(StoreError::ComputationFailures(failures));
        }

        let unresolved = self.unresolved_pairs();
        if !unresolved.is_empty() {
            return Err(StoreError::Unresolved(unresolved));
        }
        Ok(())
    }

    /// Cross-check the run against the recorded debug state.
    pub fn validate(&self) -> StoreResult<()> {
        let pending = self.tracker.len();
        if pending > 0 {
            return Err(StoreError::NotQuiescent { pending });
        }

        if self.debug.contains(DebugFlags::RECORD_HISTORY) {
            for (entity, kind_id, slot) in self.table.pairs() {
                let kind = self.registry.get(kind_id);
                let history = slot.lock().history.clone();
                for (step, window) in history.windows(2).enumerate() {
                    if !kind.refines(&window[1], &window[0]) {
                        return Err(StoreError::NonMonotoneHistory {
                            entity,
                            kind: kind.name(),
                            step: step + 1,
                        });
                    }
                }
            }
        }

        if self.debug.contains(DebugFlags::RECORD_DERIVATIONS) {
            for record in self.derivations.lock().iter() {
                for observed in &record.observed {
                    let Some(observed_property) = observed.property() else {
                        continue;
                    };
                    let kind = self.registry.get(observed.kind());
                    let current = self.table.read(observed.entity(), observed.kind());
                    let stale = match current.property() {
                        None => true,
                        Some(current_property) => {
                            if observed.is_final() {
                                !kind.refines(current_property, observed_property)
                                    || !kind.refines(observed_property, current_property)
                            } else {
                                !kind.refines(current_property, observed_property)
                            }
                        }
                    };
                    if stale {
                        return Err(StoreError::StaleDerivation {
                            entity: record.entity.clone(),
                            kind: self.registry.name(record.kind),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn scheduled_tasks(&self) -> usize {
        self.scheduler.submitted()
    }

    pub fn processed_tasks(&self) -> usize {
        self.scheduler.processed()
    }

    fn unresolved_pairs(&self) -> Vec<(Entity, PropertyKindId)> {
        let mut seen = HashSet::new();
        let mut unresolved = Vec::new();
        for (_, record) in self.tracker.waiting() {
            let record = record.lock();
            if seen.insert((record.entity.clone(), record.kind)) {
                unresolved.push((record.entity.clone(), record.kind));
            }
        }
        for (entity, kind, slot) in self.table.pairs() {
            let guard = slot.lock();
            let demanded = guard.forced
                || guard.triggered
                || !guard.dependers.is_empty()
                || !guard.suspended.is_empty();
            if demanded && !guard.is_final() && seen.insert((entity.clone(), kind)) {
                unresolved.push((entity, kind));
            }
        }
        unresolved
    }

    fn trigger_lazy(&self, entity: &Entity, kind: PropertyKindId) {
        let Some(computation) = self.lazy.read().get(&kind).cloned() else {
            return;
        };
        let slot = self.table.slot(entity, kind);
        let mut guard = slot.lock();
        if guard.triggered || guard.value().is_some() {
            return;
        }
        guard.triggered = true;
        drop(guard);
        self.scheduler.submit(Task::Compute {
            computation,
            entity: entity.clone(),
            kind: Some(kind),
        });
    }

    fn run_computation(
        &self,
        computation: PropertyComputation,
        entity: Entity,
        kind: Option<PropertyKindId>,
    ) {
        match catch_unwind(AssertUnwindSafe(|| computation(self, entity.clone()))) {
            Ok(result) => {
                let mut reuse = None;
                self.process_result(result, &mut reuse, Some(&computation));
            }
            Err(payload) => {
                self.failures
                    .lock()
                    .push(TaskFailure::panicked(Some(entity), kind, &*payload));
            }
        }
    }

    fn run_replay(&self, key: ComputationKey) {
        let Some(record) = self.tracker.get(key) else {
            return;
        };
        loop {
            let (entity, kind_id, observed) = {
                let guard = record.lock();
                if !guard.phase.is_scheduled() {
                    return;
                }
                (guard.entity.clone(), guard.kind, guard.dependees.clone())
            };

            let update = observed.iter().find_map(|obs| {
                let current = self.table.read(obs.entity(), obs.kind());
                let kind = self.registry.get(obs.kind());
                if !strictly_newer(&kind, &current, obs) {
                    return None;
                }
                match current {
                    QueryResult::Bound {
                        entity,
                        property,
                        finality,
                    } => Some(DependeeUpdate {
                        entity,
                        property,
                        finality,
                    }),
                    QueryResult::Unknown(_) => None,
                }
            });

            match update {
                Some(update) => {
                    let mut continuation = {
                        let mut guard = record.lock();
                        guard.phase = Phase::Running;
                        guard
                            .continuation
                            .take()
                            .expect("scheduled record lost its continuation")
                    };
                    match catch_unwind(AssertUnwindSafe(|| continuation.resume(&update))) {
                        Ok(result) => {
                            let mut reuse = Some(key);
                            self.process_result(result, &mut reuse, None);
                            if let Some(key) = reuse {
                                self.retire_record(key);
                            }
                        }
                        Err(payload) => {
                            self.failures.lock().push(TaskFailure::panicked(
                                Some(entity),
                                Some(kind_id),
                                &*payload,
                            ));
                            self.retire_record(key);
                        }
                    }
                    return;
                }
                None => {
                    // Nothing newer: park again. A change that raced with
                    // the scan above found the phase still scheduled and
                    // did not queue a replay, so re-check once parked.
                    record.lock().phase = Phase::Waiting;
                    let changed = observed.iter().any(|obs| {
                        let current = self.table.read(obs.entity(), obs.kind());
                        let kind = self.registry.get(obs.kind());
                        strictly_newer(&kind, &current, obs)
                    });
                    if !changed || !record.lock().claim_for_schedule() {
                        return;
                    }
                }
            }
        }
    }

    fn process_result(
        &self,
        result: ComputationResult,
        reuse: &mut Option<ComputationKey>,
        origin: Option<&PropertyComputation>,
    ) {
        match result {
            ComputationResult::Final { entity, property } => {
                self.apply_update(&entity, property.kind(), property, Finality::Final);
            }
            ComputationResult::NoResult => {}
            ComputationResult::Multi(results) => {
                for result in results {
                    self.process_result(result, reuse, origin);
                }
            }
            ComputationResult::Suspended {
                entity,
                kind,
                dependee,
            } => match origin {
                Some(computation) => {
                    self.park_suspended(Arc::clone(computation), entity, kind, dependee)
                }
                None => {
                    error!("continuation for {entity:?} suspended; dropping it");
                    debug_assert!(false, "continuations must not suspend");
                }
            },
            ComputationResult::Intermediate {
                entity,
                kind,
                bound,
                dependees,
                continuation,
            } => {
                self.process_intermediate(entity, kind, bound, dependees, continuation, reuse.take());
            }
        }
    }

    fn park_suspended(
        &self,
        computation: PropertyComputation,
        entity: Entity,
        kind: PropertyKindId,
        dependee: PropertyKey,
    ) {
        let slot = self.table.slot(&dependee.entity, dependee.kind);
        let mut guard = slot.lock();
        if guard.value().is_some() {
            drop(guard);
            self.scheduler.submit(Task::Compute {
                computation,
                entity,
                kind: Some(kind),
            });
        } else {
            guard.suspended.push(SuspendedCompute {
                computation,
                entity,
                kind: Some(kind),
            });
            drop(guard);
            self.trigger_lazy(&dependee.entity, dependee.kind);
        }
    }

    fn process_intermediate(
        &self,
        entity: Entity,
        kind_id: PropertyKindId,
        bound: Property,
        dependees: Vec<QueryResult>,
        continuation: Continuation,
        reuse: Option<ComputationKey>,
    ) {
        if dependees.is_empty() {
            // Nothing could ever refine the bound, so it is final already.
            debug_assert!(false, "intermediate result without dependees");
            self.apply_update(&entity, kind_id, bound, Finality::Final);
            if let Some(key) = reuse {
                self.retire_record(key);
            }
            return;
        }

        if let UpdateOutcome::Rejected =
            self.apply_update(&entity, kind_id, bound, Finality::Open)
        {
            if let Some(key) = reuse {
                self.retire_record(key);
            }
            return;
        }

        if self.debug.contains(DebugFlags::RECORD_DERIVATIONS) {
            self.derivations.lock().push(DerivationRecord {
                entity: entity.clone(),
                kind: kind_id,
                observed: dependees.clone(),
            });
        }

        let key = match reuse {
            Some(key) => {
                let record = self
                    .tracker
                    .get(key)
                    .expect("reused record left the arena");
                let mut guard = record.lock();
                guard.continuation = Some(continuation);
                guard.dependees = dependees.iter().cloned().collect();
                guard.phase = Phase::Waiting;
                key
            }
            None => {
                let mut record = InFlight::new(entity.clone(), kind_id);
                record.continuation = Some(continuation);
                record.dependees = dependees.iter().cloned().collect();
                record.phase = Phase::Waiting;
                self.tracker.insert(record)
            }
        };

        // Register interest, then close the race: any dependee that moved
        // between observation and registration schedules the replay here.
        let mut changed = false;
        for observed in &dependees {
            let slot = self.table.slot(observed.entity(), observed.kind());
            let mut guard = slot.lock();
            if !guard.dependers.contains(&key) {
                guard.dependers.push(key);
            }
            let current = guard.query_result(observed.entity(), observed.kind());
            drop(guard);
            let kind = self.registry.get(observed.kind());
            if strictly_newer(&kind, &current, observed) {
                changed = true;
            }
        }
        if changed {
            let Some(record) = self.tracker.get(key) else {
                return;
            };
            let claimed = record.lock().claim_for_schedule();
            if claimed {
                self.scheduler.submit(Task::Replay { key });
            }
        }
    }

    fn retire_record(&self, key: ComputationKey) {
        if let Some(record) = self.tracker.remove(key) {
            record.lock().retire();
        }
    }

    /// Store a new value for the pair, enforce refinement, and wake
    /// everyone interested. Slot lock is released before any record is
    /// locked or any task submitted.
    pub(crate) fn apply_update(
        &self,
        entity: &Entity,
        kind_id: PropertyKindId,
        property: Property,
        finality: Finality,
    ) -> UpdateOutcome {
        debug_assert_eq!(property.kind(), kind_id);
        let kind = self.registry.get(kind_id);
        let slot = self.table.slot(entity, kind_id);
        let mut guard = slot.lock();

        match guard.value() {
            Some((old, Finality::Final)) => {
                let same = kind.refines(&property, old) && kind.refines(old, &property);
                if !same {
                    let old = old.clone();
                    drop(guard);
                    self.failures.lock().push(TaskFailure {
                        entity: Some(entity.clone()),
                        kind: Some(kind_id),
                        error: FailureKind::IllegalRefinement {
                            old,
                            attempted: property,
                        },
                    });
                    return UpdateOutcome::Rejected;
                }
                return UpdateOutcome::Unchanged;
            }
            Some((old, Finality::Open)) => {
                if !kind.refines(&property, old) {
                    let old = old.clone();
                    drop(guard);
                    self.failures.lock().push(TaskFailure {
                        entity: Some(entity.clone()),
                        kind: Some(kind_id),
                        error: FailureKind::IllegalRefinement {
                            old,
                            attempted: property,
                        },
                    });
                    return UpdateOutcome::Rejected;
                }
                let same = kind.refines(old, &property);
                if same && finality.is_open() {
                    return UpdateOutcome::Unchanged;
                }
            }
            None => {}
        }

        guard.set_value(property.clone(), finality);
        if self.debug.contains(DebugFlags::RECORD_HISTORY) {
            guard.history.push(property.clone());
        }
        let suspended = std::mem::take(&mut guard.suspended);
        let dependers = if finality.is_final() {
            std::mem::take(&mut guard.dependers)
        } else {
            guard.dependers.clone()
        };
        drop(guard);

        if !self.computed_kinds.read().contains(&kind_id) {
            self.computed_kinds.write().insert(kind_id);
        }

        for parked in suspended {
            self.scheduler.submit(Task::Compute {
                computation: parked.computation,
                entity: parked.entity,
                kind: parked.kind,
            });
        }

        for key in dependers {
            let Some(record) = self.tracker.get(key) else {
                continue;
            };
            let mut guard = record.lock();
            if guard.depends_on(entity, kind_id) && guard.claim_for_schedule() {
                drop(guard);
                self.scheduler.submit(Task::Replay { key });
            }
        }
        UpdateOutcome::Stored
    }

    fn inject_fallbacks(&self) -> bool {
        let mut progressed = false;
        for (entity, kind_id, slot) in self.table.pairs() {
            let demanded = {
                let guard = slot.lock();
                if guard.value().is_some() {
                    continue;
                }
                guard.forced || !guard.dependers.is_empty() || !guard.suspended.is_empty()
            };
            if !demanded {
                continue;
            }
            // A pair a failed computation was producing keeps its failure
            // as the outcome; this also keeps the scan from reporting the
            // same missing fallback every round.
            if self
                .failures
                .lock()
                .iter()
                .any(|f| f.kind == Some(kind_id) && f.entity.as_ref() == Some(&entity))
            {
                continue;
            }
            let kind = self.registry.get(kind_id);
            let reason = if self.computed_kinds.read().contains(&kind_id) {
                FallbackReason::NotCoveredByRegisteredAnalysis
            } else {
                FallbackReason::NoAnalysisRegistered
            };
            match kind.fallback(&entity, reason) {
                Some(value) => {
                    debug!("injecting fallback for {entity:?} / {}", kind.name());
                    let property = Property::from_arc(kind_id, value);
                    if let UpdateOutcome::Stored =
                        self.apply_update(&entity, kind_id, property, Finality::Final)
                    {
                        progressed = true;
                    }
                }
                None => {
                    self.failures.lock().push(TaskFailure {
                        entity: Some(entity.clone()),
                        kind: Some(kind_id),
                        error: FailureKind::MissingFallback,
                    });
                }
            }
        }
        progressed
    }
}

struct StoreRun<'a> {
    store: &'a PropertyStore,
    use_fallbacks: bool,
}

impl TaskExecutor for StoreRun<'_> {
    fn execute(&self, task: Task) {
        if self.store.debug.contains(DebugFlags::TRACE_TASKS) {
            trace!("executing {task:?}");
        }
        match task {
            Task::Compute {
                computation,
                entity,
                kind,
            } => self.store.run_computation(computation, entity, kind),
            Task::Replay { key } => self.store.run_replay(key),
        }
    }

    fn on_quiescence(&self) -> bool {
        if self.use_fallbacks && self.store.inject_fallbacks() {
            return true;
        }
        resolve_quiescent_cycles(self.store)
    }
}

/// True when `current` carries strictly more information than `observed`.
fn strictly_newer(kind: &PropertyKind, current: &QueryResult, observed: &QueryResult) -> bool {
    match (current, observed) {
        (QueryResult::Unknown(_), _) => false,
        (QueryResult::Bound { .. }, QueryResult::Unknown(_)) => true,
        (
            QueryResult::Bound {
                property: current_property,
                finality: current_finality,
                ..
            },
            QueryResult::Bound {
                property: observed_property,
                finality: observed_finality,
                ..
            },
        ) => {
            if current_finality.is_final() && observed_finality.is_open() {
                return true;
            }
            kind.refines(current_property, observed_property)
                && !kind.refines(observed_property, current_property)
        }
    }
}
