use std::fmt;
use std::sync::Arc;

use crate::entity::Entity;
use crate::property::{Property, PropertyValue};

/// Dense index identifying a registered property kind.
///
/// Ids are handed out by the engine's kind registry in registration order
/// and are only meaningful relative to the store that produced them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyKindId(u32);

impl PropertyKindId {
    pub fn from_index(index: usize) -> Self {
        PropertyKindId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for PropertyKindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyKindId({})", self.0)
    }
}

/// Why a fallback value is being injected for an entity/kind pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::EnumIs)]
pub enum FallbackReason {
    /// No analysis computing this kind was ever registered with the store.
    NoAnalysisRegistered,
    /// Analyses computing this kind ran, but none of them covered this
    /// entity.
    NotCoveredByRegisteredAnalysis,
}

type RefinesFn = dyn Fn(&Property, &Property) -> bool + Send + Sync;
type FallbackFn = dyn Fn(&Entity, FallbackReason) -> Arc<dyn PropertyValue> + Send + Sync;
type CycleMeetFn = dyn Fn(&Entity, &Property) -> Property + Send + Sync;

/// Descriptor for one family of derivable properties.
///
/// The descriptor carries everything the engine needs to know about a kind
/// without understanding the property values themselves: a refinement check
/// defining the direction of the lattice, an optional fallback for pairs no
/// analysis covers, and an optional meet applied when a dependency cycle is
/// resolved at quiescence.
///
/// The refinement check compares *values of this kind*; the engine
/// guarantees it is never called across kinds.
pub struct PropertyKind {
    name: &'static str,
    refines: Box<RefinesFn>,
    fallback: Option<Box<FallbackFn>>,
    cycle_meet: Option<Box<CycleMeetFn>>,
}

impl PropertyKind {
    /// Create a descriptor.
    ///
    /// `refines(new, old)` must return true iff `new` is at least as
    /// precise as `old`. Every update the engine accepts for this kind has
    /// to satisfy it; updates that do not are rejected as refinement
    /// violations.
    pub fn new<F>(name: &'static str, refines: F) -> Self
    where
        F: Fn(&Property, &Property) -> bool + Send + Sync + 'static,
    {
        PropertyKind {
            name,
            refines: Box::new(refines),
            fallback: None,
            cycle_meet: None,
        }
    }

    /// Attach the fallback used when no analysis produces a value for an
    /// entity of this kind. The closure returns the bare value; the engine
    /// tags it with this kind's id and stores it as final.
    pub fn with_fallback<V, F>(mut self, fallback: F) -> Self
    where
        V: PropertyValue,
        F: Fn(&Entity, FallbackReason) -> V + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(move |entity, reason| {
            Arc::new(fallback(entity, reason)) as Arc<dyn PropertyValue>
        }));
        self
    }

    /// Attach the meet applied when this kind participates in a dependency
    /// cycle that has to be closed at quiescence. Without one, cycles are
    /// closed by finalizing the current bound unchanged.
    pub fn with_cycle_meet<F>(mut self, meet: F) -> Self
    where
        F: Fn(&Entity, &Property) -> Property + Send + Sync + 'static,
    {
        self.cycle_meet = Some(Box::new(meet));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True iff `new` is at least as precise as `old`.
    pub fn refines(&self, new: &Property, old: &Property) -> bool {
        (self.refines)(new, old)
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn fallback(
        &self,
        entity: &Entity,
        reason: FallbackReason,
    ) -> Option<Arc<dyn PropertyValue>> {
        self.fallback.as_ref().map(|f| f(entity, reason))
    }

    /// Value a cycle member is finalized at, given its current bound.
    pub fn meet_on_cycle(&self, entity: &Entity, bound: &Property) -> Property {
        match &self.cycle_meet {
            Some(meet) => meet(entity, bound),
            None => bound.clone(),
        }
    }
}

impl fmt::Debug for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyKind")
            .field("name", &self.name)
            .field("has_fallback", &self.fallback.is_some())
            .field("has_cycle_meet", &self.cycle_meet.is_some())
            .finish()
    }
}
