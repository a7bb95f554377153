//! Task types and the scheduler seam.
//!
//! The store drives either backend through the same two traits: it hands
//! tasks to a [`TaskScheduler`] and the scheduler hands them back, one at a
//! time, to a [`TaskExecutor`]. Everything the engine guarantees holds for
//! both backends; the sequential one exists for debugging and for runs that
//! must be reproducible.

use std::fmt;

use fxprop::{Entity, PropertyKindId};

use crate::store::PropertyComputation;
use crate::tracker::ComputationKey;

mod pool;
mod sequential;

pub use pool::PoolScheduler;
pub use sequential::SequentialScheduler;

/// Unit of scheduled work.
pub enum Task {
    /// Run a computation from the top for one entity.
    Compute {
        computation: PropertyComputation,
        entity: Entity,
        /// Kind the computation is expected to produce, when known; used
        /// only for failure reporting.
        kind: Option<PropertyKindId>,
    },
    /// Resume the continuation of an in-flight computation.
    Replay { key: ComputationKey },
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Compute { entity, kind, .. } => f
                .debug_struct("Compute")
                .field("entity", entity)
                .field("kind", kind)
                .finish_non_exhaustive(),
            Task::Replay { key } => f.debug_tuple("Replay").field(key).finish(),
        }
    }
}

/// Consumer side of the scheduler seam, implemented by the store.
pub trait TaskExecutor: Sync {
    fn execute(&self, task: Task);

    /// Called with no tasks queued and none running. Must return true only
    /// if it changed engine state (injected fallbacks, resolved a cycle);
    /// returning true without progress would spin the scheduler forever.
    fn on_quiescence(&self) -> bool;
}

/// Producer side of the scheduler seam.
///
/// `submit` may be called from within `execute` (computations schedule
/// other computations) and from within `on_quiescence`.
pub trait TaskScheduler: Send + Sync {
    fn submit(&self, task: Task);

    /// Run until quiescent and `on_quiescence` reports no more progress.
    fn run(&self, executor: &dyn TaskExecutor);

    fn submitted(&self) -> usize;

    fn processed(&self) -> usize;
}
