use std::any::Any;
use std::fmt;

use crate::entity::Entity;
use crate::kind::PropertyKindId;
use crate::property::Property;
use crate::query::{Finality, PropertyKey, QueryResult};

/// One observed change to a dependee, handed to a resumed continuation.
#[derive(Clone, Debug)]
pub struct DependeeUpdate {
    pub entity: Entity,
    pub property: Property,
    pub finality: Finality,
}

impl DependeeUpdate {
    pub fn key(&self) -> PropertyKey {
        PropertyKey::new(self.entity.clone(), self.property.kind())
    }

    pub fn is_final(&self) -> bool {
        self.finality.is_final()
    }
}

type StepFn =
    dyn Fn(&mut (dyn Any + Send), &DependeeUpdate) -> ComputationResult + Send + Sync;

/// Resumable remainder of a computation that returned an intermediate
/// result.
///
/// The continuation is an explicit state record plus a step function that
/// reads and updates it. The engine owns the record between resumptions, so
/// a step never observes its own state concurrently; the step must derive
/// its next result from the record and the delivered update alone.
pub struct Continuation {
    state: Box<dyn Any + Send>,
    step: Box<StepFn>,
}

impl Continuation {
    /// Build a continuation over a typed state record.
    pub fn new<S, F>(state: S, step: F) -> Self
    where
        S: Any + Send,
        F: Fn(&mut S, &DependeeUpdate) -> ComputationResult + Send + Sync + 'static,
    {
        Continuation {
            state: Box::new(state),
            step: Box::new(move |state, update| {
                let state = state
                    .downcast_mut::<S>()
                    .expect("continuation state record changed type between resumptions");
                step(state, update)
            }),
        }
    }

    /// Build a continuation that needs no state of its own.
    pub fn stateless<F>(step: F) -> Self
    where
        F: Fn(&DependeeUpdate) -> ComputationResult + Send + Sync + 'static,
    {
        Continuation::new((), move |_, update| step(update))
    }

    pub fn resume(&mut self, update: &DependeeUpdate) -> ComputationResult {
        (self.step)(&mut *self.state, update)
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Continuation")
    }
}

/// Value a property computation hands back to the engine.
#[derive(Debug)]
pub enum ComputationResult {
    /// The property is fully determined and will never be refined.
    Final { entity: Entity, property: Property },
    /// A sound bound that may still improve once the listed dependees
    /// change. The continuation is resumed with one `DependeeUpdate` per
    /// observed change.
    Intermediate {
        entity: Entity,
        kind: PropertyKindId,
        bound: Property,
        dependees: Vec<QueryResult>,
        continuation: Continuation,
    },
    /// Several results produced by one computation, processed
    /// independently.
    Multi(Vec<ComputationResult>),
    /// The computation cannot make progress until the dependee has any
    /// value at all; the whole computation is re-run from scratch then.
    Suspended {
        entity: Entity,
        kind: PropertyKindId,
        dependee: PropertyKey,
    },
    /// The computation inspected the entity and has nothing to contribute.
    NoResult,
}

impl ComputationResult {
    pub fn is_no_result(&self) -> bool {
        matches!(self, ComputationResult::NoResult)
    }
}
