use std::fmt;
use std::sync::Arc;

use downcast_rs::{DowncastSync, impl_downcast};

/// Program element that properties can be attached to.
///
/// Implementors are supplied by the embedding program model (methods,
/// fields, classes, call sites, parameters). The engine never inspects the
/// payload beyond its identity; analyses recover their concrete types via
/// downcasting.
pub trait EntityRef: DowncastSync + fmt::Debug {
    /// Short diagnostic label used in log lines and error messages.
    fn name(&self) -> String {
        format!("{self:?}")
    }
}
impl_downcast!(sync EntityRef);

/// Cheap-to-clone handle to an [`EntityRef`].
///
/// Entities are compared, ordered and hashed by *identity* (the address of
/// the shared payload), never by structural equality. Two handles obtained
/// from the same `Entity::new` call compare equal; two structurally
/// identical payloads allocated separately do not.
#[derive(Clone)]
pub struct Entity(Arc<dyn EntityRef>);

impl Entity {
    pub fn new<E: EntityRef>(payload: E) -> Self {
        Entity(Arc::new(payload))
    }

    pub fn from_arc(payload: Arc<dyn EntityRef>) -> Self {
        Entity(payload)
    }

    pub fn payload(&self) -> &dyn EntityRef {
        &*self.0
    }

    /// Downcast the payload to a concrete program-element type.
    pub fn downcast_ref<E: EntityRef>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    pub fn name(&self) -> String {
        self.0.name()
    }

    // Data pointer only; the vtable half of the fat pointer is not stable
    // across codegen units.
    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Entity {}

impl PartialOrd for Entity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.addr().cmp(&other.addr())
    }
}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.0.name())
    }
}

/// Enumeration source for the known entity universe.
///
/// Supplied by the embedding program model; consumed by eager batch
/// scheduling. The universe is fixed for the lifetime of one analysis phase
/// but may be only partially covered by any individual analysis.
pub trait EntityUniverse: Send + Sync {
    fn entities(&self) -> Vec<Entity>;
}

impl EntityUniverse for Vec<Entity> {
    fn entities(&self) -> Vec<Entity> {
        self.clone()
    }
}
