use std::fmt;
use std::sync::Arc;

use downcast_rs::{DowncastSync, impl_downcast};

use crate::kind::PropertyKindId;

/// Concrete value carried by a [`Property`].
///
/// Analyses define their own value types; the engine treats them as opaque
/// and only ever clones the shared handle. The blanket impl makes any
/// thread-safe `Debug` type usable without a manual impl.
pub trait PropertyValue: DowncastSync + fmt::Debug {}
impl_downcast!(sync PropertyValue);

impl<T> PropertyValue for T where T: std::any::Any + fmt::Debug + Send + Sync {}

/// Immutable property value tagged with the kind it belongs to.
///
/// Cloning is cheap; the payload is shared. Refinement ordering between two
/// properties of the same kind is decided by the kind descriptor, never by
/// the value itself.
#[derive(Clone)]
pub struct Property {
    kind: PropertyKindId,
    value: Arc<dyn PropertyValue>,
}

impl Property {
    pub fn new<V: PropertyValue>(kind: PropertyKindId, value: V) -> Self {
        Property {
            kind,
            value: Arc::new(value),
        }
    }

    pub fn from_arc(kind: PropertyKindId, value: Arc<dyn PropertyValue>) -> Self {
        Property { kind, value }
    }

    pub fn kind(&self) -> PropertyKindId {
        self.kind
    }

    pub fn value(&self) -> &dyn PropertyValue {
        &*self.value
    }

    pub fn shared_value(&self) -> Arc<dyn PropertyValue> {
        Arc::clone(&self.value)
    }

    /// Downcast the payload to the analysis-defined value type.
    pub fn downcast<V: PropertyValue>(&self) -> Option<&V> {
        self.value.downcast_ref::<V>()
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Property({:?}, {:?})", self.kind, self.value)
    }
}
