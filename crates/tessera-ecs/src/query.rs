#![allow(private_interfaces)]

use std::any::TypeId;
use std::marker::PhantomData;

use crate::component::{Component, ComponentStore};
use crate::entity::EntityUid;

/// Implemented for query parameter types (`&T`, `Option<&T>` and tuples of them).
///
/// Only present components match; stopped components awaiting cull are skipped.
pub trait WorldQuery {
    type Item<'w>;

    /// The TypeIds of components this query requires.
    fn required_type_ids() -> Vec<TypeId>;

    /// Fetch the item for an entity, or `None` if a required component is missing.
    fn fetch<'w>(store: &'w ComponentStore, uid: EntityUid) -> Option<Self::Item<'w>>;
}

impl<T: Component> WorldQuery for &T {
    type Item<'w> = &'w T;

    fn required_type_ids() -> Vec<TypeId> {
        vec![TypeId::of::<T>()]
    }

    fn fetch<'w>(store: &'w ComponentStore, uid: EntityUid) -> Option<Self::Item<'w>> {
        store.typed::<T>()?.get_present(uid)
    }
}

impl<T: Component> WorldQuery for Option<&T> {
    type Item<'w> = Option<&'w T>;

    fn required_type_ids() -> Vec<TypeId> {
        vec![]
    }

    fn fetch<'w>(store: &'w ComponentStore, uid: EntityUid) -> Option<Self::Item<'w>> {
        Some(store.typed::<T>().and_then(|set| set.get_present(uid)))
    }
}

macro_rules! impl_world_query_tuple {
    ($($name:ident),+) => {
        impl<$($name: WorldQuery),+> WorldQuery for ($($name,)+) {
            type Item<'w> = ($($name::Item<'w>,)+);

            fn required_type_ids() -> Vec<TypeId> {
                let mut ids = Vec::new();
                $(ids.extend($name::required_type_ids());)+
                ids
            }

            fn fetch<'w>(store: &'w ComponentStore, uid: EntityUid) -> Option<Self::Item<'w>> {
                Some(($($name::fetch(store, uid)?,)+))
            }
        }
    };
}

impl_world_query_tuple!(A);
impl_world_query_tuple!(A, B);
impl_world_query_tuple!(A, B, C);
impl_world_query_tuple!(A, B, C, D);
impl_world_query_tuple!(A, B, C, D, E);
impl_world_query_tuple!(A, B, C, D, E, F);

/// Entities worth testing against `Q`: the smallest required storage, or
/// every live entity when nothing is required.
pub(crate) fn candidates<Q: WorldQuery>(
    store: &ComponentStore,
    alive: impl Iterator<Item = EntityUid>,
) -> Vec<EntityUid> {
    let required = Q::required_type_ids();
    if required.is_empty() {
        return alive.collect();
    }

    let mut best: Option<&[EntityUid]> = None;
    for type_id in &required {
        // A required type with no storage cannot match anything.
        let Some(storage) = store.storage(*type_id) else {
            return Vec::new();
        };
        let entities = storage.entities();
        if best.map_or(true, |b| entities.len() < b.len()) {
            best = Some(entities);
        }
    }
    best.map(<[EntityUid]>::to_vec).unwrap_or_default()
}

/// Iterator returned by `EntityManager::query`. Yields `(EntityUid, Q::Item)`.
pub struct QueryIter<'w, Q: WorldQuery> {
    store: &'w ComponentStore,
    candidates: std::vec::IntoIter<EntityUid>,
    _marker: PhantomData<Q>,
}

impl<'w, Q: WorldQuery> QueryIter<'w, Q> {
    pub(crate) fn new(store: &'w ComponentStore, candidates: Vec<EntityUid>) -> Self {
        Self {
            store,
            candidates: candidates.into_iter(),
            _marker: PhantomData,
        }
    }
}

impl<'w, Q: WorldQuery> Iterator for QueryIter<'w, Q> {
    type Item = (EntityUid, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        for uid in self.candidates.by_ref() {
            if let Some(item) = Q::fetch(self.store, uid) {
                return Some((uid, item));
            }
        }
        None
    }
}
