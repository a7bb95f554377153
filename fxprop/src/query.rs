use crate::entity::Entity;
use crate::kind::PropertyKindId;
use crate::property::Property;

/// Lookup key: one entity/kind pair.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PropertyKey {
    pub entity: Entity,
    pub kind: PropertyKindId,
}

impl PropertyKey {
    pub fn new(entity: Entity, kind: PropertyKindId) -> Self {
        PropertyKey { entity, kind }
    }
}

/// Whether a bound can still be refined.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::EnumIs)]
pub enum Finality {
    /// The value will never change again.
    Final,
    /// The value is a sound bound that later updates may refine.
    Open,
}

/// Outcome of looking up a property, observed at one point in time.
///
/// `Unknown` means no value has been stored yet for the pair; `Bound`
/// carries the current value together with its finality. Results are
/// snapshots: an `Open` bound observed now may already have been refined by
/// the time the observer acts on it, which is exactly the situation the
/// engine's dependency tracking exists to handle.
#[derive(Clone, Debug, strum::EnumIs)]
pub enum QueryResult {
    Unknown(PropertyKey),
    Bound {
        entity: Entity,
        property: Property,
        finality: Finality,
    },
}

impl QueryResult {
    pub fn unknown(entity: Entity, kind: PropertyKindId) -> Self {
        QueryResult::Unknown(PropertyKey::new(entity, kind))
    }

    pub fn final_bound(entity: Entity, property: Property) -> Self {
        QueryResult::Bound {
            entity,
            property,
            finality: Finality::Final,
        }
    }

    pub fn open_bound(entity: Entity, property: Property) -> Self {
        QueryResult::Bound {
            entity,
            property,
            finality: Finality::Open,
        }
    }

    pub fn entity(&self) -> &Entity {
        match self {
            QueryResult::Unknown(key) => &key.entity,
            QueryResult::Bound { entity, .. } => entity,
        }
    }

    pub fn kind(&self) -> PropertyKindId {
        match self {
            QueryResult::Unknown(key) => key.kind,
            QueryResult::Bound { property, .. } => property.kind(),
        }
    }

    /// The stored value, if any has been observed.
    pub fn property(&self) -> Option<&Property> {
        match self {
            QueryResult::Unknown(_) => None,
            QueryResult::Bound { property, .. } => Some(property),
        }
    }

    pub fn finality(&self) -> Option<Finality> {
        match self {
            QueryResult::Unknown(_) => None,
            QueryResult::Bound { finality, .. } => Some(*finality),
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            QueryResult::Bound {
                finality: Finality::Final,
                ..
            }
        )
    }

    pub fn key(&self) -> PropertyKey {
        PropertyKey::new(self.entity().clone(), self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;

    #[derive(Debug)]
    struct Site(&'static str);
    impl EntityRef for Site {}

    #[test]
    fn accessors_cover_both_variants() {
        let e = Entity::new(Site("call"));
        let kind = PropertyKindId::from_index(2);

        let u = QueryResult::unknown(e.clone(), kind);
        assert!(u.is_unknown());
        assert_eq!(u.kind(), kind);
        assert!(u.property().is_none());
        assert!(u.finality().is_none());
        assert!(!u.is_final());
        assert_eq!(u.key(), PropertyKey::new(e.clone(), kind));

        let open = QueryResult::open_bound(e.clone(), Property::new(kind, 1u32));
        assert!(open.is_bound());
        assert!(!open.is_final());
        assert_eq!(open.finality(), Some(Finality::Open));

        let fin = QueryResult::final_bound(e.clone(), Property::new(kind, 2u32));
        assert!(fin.is_final());
        assert_eq!(fin.key(), u.key());
        assert_eq!(fin.property().and_then(|p| p.downcast::<u32>()), Some(&2));
    }
}
