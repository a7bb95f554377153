use fxprop::{Entity, Property, PropertyKindId};

/// Errors surfaced by the store's public API.
///
/// Per-task problems (panics, refinement violations, missing fallbacks for
/// demanded pairs) are collected as [`TaskFailure`]s during the run and
/// surface together in `ComputationFailures` when the run is joined.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("property kind `{kind}` registered without a fallback")]
    MissingFallback { kind: &'static str },

    #[error("{} computation(s) failed", .0.len())]
    ComputationFailures(Vec<TaskFailure>),

    #[error("{} entity/kind pair(s) left unresolved at quiescence", .0.len())]
    Unresolved(Vec<(Entity, PropertyKindId)>),

    #[error("store is not quiescent: {pending} computation(s) still in flight")]
    NotQuiescent { pending: usize },

    #[error(
        "non-monotone history for {entity:?} / {kind}: step {step} does not refine its predecessor"
    )]
    NonMonotoneHistory {
        entity: Entity,
        kind: &'static str,
        step: usize,
    },

    #[error(
        "stale derivation for {entity:?} / {kind}: observed dependee value is incompatible with its final value"
    )]
    StaleDerivation { entity: Entity, kind: &'static str },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One failed computation, collected during a run and reported in bulk when
/// the run is joined.
#[derive(Debug)]
pub struct TaskFailure {
    pub entity: Option<Entity>,
    pub kind: Option<PropertyKindId>,
    pub error: FailureKind,
}

#[derive(Debug)]
pub enum FailureKind {
    /// The computation panicked; the payload is its message when one could
    /// be recovered.
    Panicked(String),
    /// The computation produced a value that does not refine the stored
    /// bound.
    IllegalRefinement { old: Property, attempted: Property },
    /// Fallback injection was required but the kind has no fallback.
    MissingFallback,
}

impl TaskFailure {
    pub fn panicked(
        entity: Option<Entity>,
        kind: Option<PropertyKindId>,
        payload: &(dyn std::any::Any + Send),
    ) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic payload of unknown type".to_string());
        TaskFailure {
            entity,
            kind,
            error: FailureKind::Panicked(message),
        }
    }
}
