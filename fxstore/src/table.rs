use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use fxprop::{Entity, Finality, Property, PropertyKindId, QueryResult};

use crate::store::PropertyComputation;
use crate::tracker::ComputationKey;

/// A whole computation parked on a slot until the slot has any value.
pub struct SuspendedCompute {
    pub computation: PropertyComputation,
    pub entity: Entity,
    pub kind: Option<PropertyKindId>,
}

/// Per entity/kind cell of the table.
///
/// All cross-slot coordination goes through the store; a slot only knows
/// its own value, who is waiting on it, and a few scheduling flags. The
/// slot mutex is the innermost lock in the engine and is never held while
/// another slot or an in-flight record is locked.
pub struct Slot {
    value: Option<(Property, Finality)>,
    /// In-flight computations to notify when the value changes.
    pub dependers: SmallVec<ComputationKey, 2>,
    /// Whole computations to resubmit once the slot has any value.
    pub suspended: SmallVec<SuspendedCompute, 1>,
    /// A lazy computation for this slot has already been submitted.
    pub triggered: bool,
    /// `force` was called on this pair, so fallback injection must cover
    /// it even if nothing ever depended on it.
    pub forced: bool,
    /// Every bound stored so far, oldest first. Only populated with
    /// `DebugFlags::RECORD_HISTORY`.
    pub history: Vec<Property>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            value: None,
            dependers: SmallVec::new(),
            suspended: SmallVec::new(),
            triggered: false,
            forced: false,
            history: Vec::new(),
        }
    }

    pub fn value(&self) -> Option<&(Property, Finality)> {
        self.value.as_ref()
    }

    pub fn is_final(&self) -> bool {
        matches!(self.value, Some((_, Finality::Final)))
    }

    pub fn set_value(&mut self, property: Property, finality: Finality) {
        self.value = Some((property, finality));
    }

    pub fn query_result(&self, entity: &Entity, kind: PropertyKindId) -> QueryResult {
        match &self.value {
            None => QueryResult::unknown(entity.clone(), kind),
            Some((property, Finality::Open)) => {
                QueryResult::open_bound(entity.clone(), property.clone())
            }
            Some((property, Finality::Final)) => {
                QueryResult::final_bound(entity.clone(), property.clone())
            }
        }
    }
}

/// Concurrent entity/property table.
///
/// The map itself is only touched to find or create slots; every value
/// access goes through the slot mutex. Shard locks are therefore held for
/// map operations only, never across user code.
pub struct PropertyTable {
    slots: DashMap<(Entity, PropertyKindId), Arc<Mutex<Slot>>>,
}

impl PropertyTable {
    pub fn new() -> Self {
        PropertyTable {
            slots: DashMap::new(),
        }
    }

    /// Find or create the slot for a pair. The returned handle is cloned
    /// out of the map so the shard lock is released before the caller
    /// locks the slot.
    pub fn slot(&self, entity: &Entity, kind: PropertyKindId) -> Arc<Mutex<Slot>> {
        Arc::clone(
            &self
                .slots
                .entry((entity.clone(), kind))
                .or_insert_with(|| Arc::new(Mutex::new(Slot::new()))),
        )
    }

    /// The slot for a pair, if one was ever created.
    pub fn peek(&self, entity: &Entity, kind: PropertyKindId) -> Option<Arc<Mutex<Slot>>> {
        self.slots
            .get(&(entity.clone(), kind))
            .map(|entry| Arc::clone(&entry))
    }

    /// Current result for a pair without creating a slot.
    pub fn read(&self, entity: &Entity, kind: PropertyKindId) -> QueryResult {
        match self.peek(entity, kind) {
            Some(slot) => slot.lock().query_result(entity, kind),
            None => QueryResult::unknown(entity.clone(), kind),
        }
    }

    /// Snapshot of every pair with a slot. Slots created concurrently with
    /// the scan may or may not be included.
    pub fn pairs(&self) -> Vec<(Entity, PropertyKindId, Arc<Mutex<Slot>>)> {
        self.slots
            .iter()
            .map(|entry| {
                let (entity, kind) = entry.key();
                (entity.clone(), *kind, Arc::clone(entry.value()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for PropertyTable {
    fn default() -> Self {
        PropertyTable::new()
    }
}
