use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use fxprop::{PropertyKind, PropertyKindId};

use crate::error::{StoreError, StoreResult};

/// Registry handing out dense kind ids.
///
/// Registration order defines the id space; ids are never reused. Kinds
/// without a fallback are rejected by `register` so that the missing value
/// is caught at registration time rather than deep inside fallback
/// injection; `register_without_fallback` is the explicit opt-out for kinds
/// whose analyses are known to cover the whole universe.
pub struct KindRegistry {
    kinds: RwLock<Vec<Arc<PropertyKind>>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        KindRegistry {
            kinds: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, kind: PropertyKind) -> StoreResult<PropertyKindId> {
        if !kind.has_fallback() {
            return Err(StoreError::MissingFallback { kind: kind.name() });
        }
        Ok(self.insert(kind))
    }

    pub fn register_without_fallback(&self, kind: PropertyKind) -> PropertyKindId {
        self.insert(kind)
    }

    fn insert(&self, kind: PropertyKind) -> PropertyKindId {
        let mut kinds = self.kinds.write();
        let id = PropertyKindId::from_index(kinds.len());
        debug!("registering property kind `{}` as {:?}", kind.name(), id);
        kinds.push(Arc::new(kind));
        id
    }

    /// Panics on ids not produced by this registry.
    pub fn get(&self, id: PropertyKindId) -> Arc<PropertyKind> {
        Arc::clone(
            self.kinds
                .read()
                .get(id.index())
                .expect("property kind id from a different registry"),
        )
    }

    pub fn name(&self, id: PropertyKindId) -> &'static str {
        self.get(id).name()
    }

    pub fn len(&self) -> usize {
        self.kinds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.read().is_empty()
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        KindRegistry::new()
    }
}
