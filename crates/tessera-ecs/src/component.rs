use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use tessera_core::{GameTick, Transform};

use crate::dependency::Dependencies;
use crate::entity::EntityUid;

/// A type that can be attached to entities.
///
/// Implementors may override [`Component::declare_dependencies`] to have
/// sibling components wired into their fields automatically.
pub trait Component: Sized + 'static {
    /// Declare the sibling dependencies of this component type.
    fn declare_dependencies(_deps: &mut Dependencies<Self>) {}
}

impl Component for Transform {}

/// A component whose state can be captured and applied from outside, e.g.
/// by a replication layer.
pub trait NetworkedComponent: Component {
    type State: Clone + 'static;

    fn get_state(&self) -> Self::State;
    fn apply_state(&mut self, state: Self::State);
}

/// Identity of one component instance. A re-added component of the same
/// type on the same entity gets a new serial.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId {
    owner: EntityUid,
    type_id: TypeId,
    serial: u64,
}

impl ComponentId {
    pub(crate) fn new(owner: EntityUid, type_id: TypeId, serial: u64) -> Self {
        Self {
            owner,
            type_id,
            serial,
        }
    }

    /// The entity that owns the component.
    pub fn owner(&self) -> EntityUid {
        self.owner
    }

    /// The concrete component type.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({}#{})", self.owner, self.serial)
    }
}

/// Life stage of a single component. Stages only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentLifeStage {
    Added,
    Initializing,
    Initialized,
    Starting,
    Running,
    Stopping,
    /// Logically removed; still in storage until the next cull.
    Stopped,
    Deleted,
}

impl ComponentLifeStage {
    /// Whether lookups by type still see the component.
    pub fn is_present(self) -> bool {
        self < ComponentLifeStage::Stopped
    }

    pub fn is_initialized(self) -> bool {
        self >= ComponentLifeStage::Initializing
    }

    /// Started and not yet shutting down.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ComponentLifeStage::Starting | ComponentLifeStage::Running
        )
    }

    /// Removal has begun.
    pub fn is_removing(self) -> bool {
        self >= ComponentLifeStage::Stopping
    }
}

/// Bookkeeping stored next to every component value.
#[derive(Debug, Clone)]
pub struct ComponentMeta {
    pub id: ComponentId,
    pub life_stage: ComponentLifeStage,
    pub creation_tick: GameTick,
    pub last_modified_tick: GameTick,
    /// Whether state changes should be replicated.
    pub net_sync: bool,
}

impl ComponentMeta {
    pub(crate) fn new(id: ComponentId, tick: GameTick) -> Self {
        Self {
            id,
            life_stage: ComponentLifeStage::Added,
            creation_tick: tick,
            last_modified_tick: tick,
            net_sync: true,
        }
    }
}

// ---- Lifecycle events ----

/// Raised once the component is stored and wired, before initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentAdd {
    pub component: ComponentId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentInit {
    pub component: ComponentId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentStartup {
    pub component: ComponentId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentShutdown {
    pub component: ComponentId,
}

/// Raised after the component is stopped and unwired from its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentRemove {
    pub component: ComponentId,
}

// ---- Storage ----

pub(crate) struct ComponentSlot<T> {
    pub value: T,
    pub meta: ComponentMeta,
}

/// Why a boxed value could not be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertError {
    /// The box holds another type.
    WrongType,
    /// The entity already has a present component of this type.
    Occupied,
}

/// Type-erased component storage interface.
pub(crate) trait ComponentStorage: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn meta(&self, uid: EntityUid) -> Option<&ComponentMeta>;
    fn meta_mut(&mut self, uid: EntityUid) -> Option<&mut ComponentMeta>;
    fn value(&self, uid: EntityUid) -> Option<&dyn Any>;
    fn value_mut(&mut self, uid: EntityUid) -> Option<&mut dyn Any>;
    /// Store a boxed value in a free or stopped slot.
    fn insert_boxed(&mut self, uid: EntityUid, value: Box<dyn Any>, meta: ComponentMeta) -> Result<(), InsertError>;
    /// Drop the component, returning its metadata.
    fn remove(&mut self, uid: EntityUid) -> Option<ComponentMeta>;
    fn entities(&self) -> &[EntityUid];
}

/// Sparse-set storage for a single component type. Provides O(1)
/// insert/remove/lookup and dense iteration.
pub(crate) struct SparseSet<T> {
    /// Maps entity → dense index.
    sparse: HashMap<EntityUid, usize>,
    /// Packed component slots.
    dense: Vec<ComponentSlot<T>>,
    /// Entity owning each dense slot (for iteration).
    entities: Vec<EntityUid>,
}

impl<T> SparseSet<T> {
    pub fn new() -> Self {
        Self {
            sparse: HashMap::new(),
            dense: Vec::new(),
            entities: Vec::new(),
        }
    }

    /// Insert the slot for an entity. A stopped slot awaiting cull is
    /// replaced and returned; a present one is never replaced and the value
    /// comes back as the error.
    pub fn insert(&mut self, uid: EntityUid, value: T, meta: ComponentMeta) -> Result<Option<ComponentSlot<T>>, T> {
        if let Some(&dense_idx) = self.sparse.get(&uid) {
            if self.dense[dense_idx].meta.life_stage.is_present() {
                return Err(value);
            }
            Ok(Some(std::mem::replace(&mut self.dense[dense_idx], ComponentSlot { value, meta })))
        } else {
            let slot = ComponentSlot { value, meta };
            self.sparse.insert(uid, self.dense.len());
            self.dense.push(slot);
            self.entities.push(uid);
            Ok(None)
        }
    }

    pub fn get(&self, uid: EntityUid) -> Option<&ComponentSlot<T>> {
        self.sparse.get(&uid).map(|&i| &self.dense[i])
    }

    pub fn get_mut(&mut self, uid: EntityUid) -> Option<&mut ComponentSlot<T>> {
        self.sparse.get(&uid).map(|&i| &mut self.dense[i])
    }

    /// The component value, if it has not been logically removed.
    pub fn get_present(&self, uid: EntityUid) -> Option<&T> {
        self.get(uid)
            .filter(|slot| slot.meta.life_stage.is_present())
            .map(|slot| &slot.value)
    }

    pub fn get_present_mut(&mut self, uid: EntityUid) -> Option<&mut T> {
        self.get_mut(uid)
            .filter(|slot| slot.meta.life_stage.is_present())
            .map(|slot| &mut slot.value)
    }

    pub fn take(&mut self, uid: EntityUid) -> Option<ComponentSlot<T>> {
        let dense_idx = self.sparse.remove(&uid)?;
        let slot = self.dense.swap_remove(dense_idx);
        self.entities.swap_remove(dense_idx);
        // Swap-remove moved the last element into the freed slot.
        if let Some(&moved) = self.entities.get(dense_idx) {
            self.sparse.insert(moved, dense_idx);
        }
        Some(slot)
    }

    /// Iterate over present components.
    pub fn iter(&self) -> impl Iterator<Item = (EntityUid, &T)> {
        self.entities
            .iter()
            .copied()
            .zip(self.dense.iter())
            .filter(|(_, slot)| slot.meta.life_stage.is_present())
            .map(|(uid, slot)| (uid, &slot.value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityUid, &mut T)> {
        self.entities
            .iter()
            .copied()
            .zip(self.dense.iter_mut())
            .filter(|(_, slot)| slot.meta.life_stage.is_present())
            .map(|(uid, slot)| (uid, &mut slot.value))
    }
}

impl<T: Component> ComponentStorage for SparseSet<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn meta(&self, uid: EntityUid) -> Option<&ComponentMeta> {
        self.get(uid).map(|slot| &slot.meta)
    }

    fn meta_mut(&mut self, uid: EntityUid) -> Option<&mut ComponentMeta> {
        self.get_mut(uid).map(|slot| &mut slot.meta)
    }

    fn value(&self, uid: EntityUid) -> Option<&dyn Any> {
        self.get(uid).map(|slot| &slot.value as &dyn Any)
    }

    fn value_mut(&mut self, uid: EntityUid) -> Option<&mut dyn Any> {
        self.get_mut(uid).map(|slot| &mut slot.value as &mut dyn Any)
    }

    fn insert_boxed(&mut self, uid: EntityUid, value: Box<dyn Any>, meta: ComponentMeta) -> Result<(), InsertError> {
        let value = value.downcast::<T>().map_err(|_| InsertError::WrongType)?;
        debug_assert!(self.get_present(uid).is_none(), "present slot for {} would be replaced", uid);
        self.insert(uid, *value, meta)
            .map(|_| ())
            .map_err(|_| InsertError::Occupied)
    }

    fn remove(&mut self, uid: EntityUid) -> Option<ComponentMeta> {
        self.take(uid).map(|slot| slot.meta)
    }

    fn entities(&self) -> &[EntityUid] {
        &self.entities
    }
}

/// All component storages, keyed by concrete component type.
#[derive(Default)]
pub(crate) struct ComponentStore {
    storages: HashMap<TypeId, Box<dyn ComponentStorage>>,
}

impl ComponentStore {
    pub fn storage(&self, type_id: TypeId) -> Option<&Box<dyn ComponentStorage>> {
        self.storages.get(&type_id)
    }

    pub fn storage_or_insert(
        &mut self,
        type_id: TypeId,
        new_storage: fn() -> Box<dyn ComponentStorage>,
    ) -> &mut Box<dyn ComponentStorage> {
        self.storages.entry(type_id).or_insert_with(new_storage)
    }

    pub fn typed<T: Component>(&self) -> Option<&SparseSet<T>> {
        self.storages
            .get(&TypeId::of::<T>())
            .and_then(|s| s.as_any().downcast_ref::<SparseSet<T>>())
    }

    pub fn typed_mut<T: Component>(&mut self) -> Option<&mut SparseSet<T>> {
        self.storages
            .get_mut(&TypeId::of::<T>())
            .and_then(|s| s.as_any_mut().downcast_mut::<SparseSet<T>>())
    }

    pub fn meta(&self, type_id: TypeId, uid: EntityUid) -> Option<&ComponentMeta> {
        self.storages.get(&type_id)?.meta(uid)
    }

    pub fn meta_mut(&mut self, type_id: TypeId, uid: EntityUid) -> Option<&mut ComponentMeta> {
        self.storages.get_mut(&type_id)?.meta_mut(uid)
    }

    /// Metadata of a specific instance, if it is still stored.
    pub fn meta_of(&self, id: ComponentId) -> Option<&ComponentMeta> {
        self.meta(id.type_id(), id.owner()).filter(|m| m.id == id)
    }

    pub fn meta_of_mut(&mut self, id: ComponentId) -> Option<&mut ComponentMeta> {
        self.meta_mut(id.type_id(), id.owner()).filter(|m| m.id == id)
    }

    pub fn value(&self, type_id: TypeId, uid: EntityUid) -> Option<&dyn Any> {
        self.storages.get(&type_id)?.value(uid)
    }

    pub fn value_mut(&mut self, type_id: TypeId, uid: EntityUid) -> Option<&mut dyn Any> {
        self.storages.get_mut(&type_id)?.value_mut(uid)
    }

    /// Whether a present component of the given type exists on the entity.
    pub fn is_present(&self, type_id: TypeId, uid: EntityUid) -> bool {
        self.meta(type_id, uid)
            .is_some_and(|m| m.life_stage.is_present())
    }

    pub fn remove(&mut self, type_id: TypeId, uid: EntityUid) -> Option<ComponentMeta> {
        self.storages.get_mut(&type_id)?.remove(uid)
    }

    /// Drop every slot an entity owns, whatever its stage.
    pub fn remove_entity(&mut self, uid: EntityUid) -> usize {
        self.storages
            .values_mut()
            .filter_map(|storage| storage.remove(uid))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(uid: u64, serial: u64) -> ComponentMeta {
        let owner = EntityUid::from_raw(uid);
        ComponentMeta::new(ComponentId::new(owner, TypeId::of::<i32>(), serial), GameTick::ZERO)
    }

    fn uid(raw: u64) -> EntityUid {
        EntityUid::from_raw(raw)
    }

    #[test]
    fn insert_and_get() {
        let mut set = SparseSet::new();
        set.insert(uid(5), 42i32, meta(5, 1)).unwrap();
        assert_eq!(set.get_present(uid(5)), Some(&42));
        assert_eq!(set.get_present(uid(1)), None);
    }

    #[test]
    fn present_slot_is_never_replaced() {
        let mut set = SparseSet::new();
        set.insert(uid(1), 1i32, meta(1, 1)).unwrap();
        assert_eq!(set.insert(uid(1), 2, meta(1, 2)).err(), Some(2));
        assert_eq!(set.get_present(uid(1)), Some(&1));
        assert_eq!(set.entities.len(), 1);
    }

    #[test]
    fn stopped_slot_is_replaced() {
        let mut set = SparseSet::new();
        set.insert(uid(1), 1i32, meta(1, 1)).unwrap();
        if let Some(slot) = set.get_mut(uid(1)) {
            slot.meta.life_stage = ComponentLifeStage::Stopped;
        }
        let old = set.insert(uid(1), 2, meta(1, 2)).unwrap();
        assert_eq!(old.map(|s| s.value), Some(1));
        assert_eq!(set.get_present(uid(1)), Some(&2));
        assert_eq!(set.entities.len(), 1);
    }

    #[test]
    fn remove_and_swap() {
        let mut set = SparseSet::new();
        set.insert(uid(1), 'a', meta(1, 1)).unwrap();
        set.insert(uid(2), 'b', meta(2, 2)).unwrap();
        set.insert(uid(3), 'c', meta(3, 3)).unwrap();
        assert_eq!(set.take(uid(1)).map(|s| s.value), Some('a'));
        assert!(set.get(uid(1)).is_none());
        assert_eq!(set.get_present(uid(2)), Some(&'b'));
        assert_eq!(set.get_present(uid(3)), Some(&'c'));
        assert_eq!(set.entities.len(), 2);
    }

    #[test]
    fn stopped_slots_are_hidden() {
        let mut set = SparseSet::new();
        set.insert(uid(1), 10i32, meta(1, 1)).unwrap();
        set.insert(uid(2), 20i32, meta(2, 2)).unwrap();
        if let Some(slot) = set.get_mut(uid(1)) {
            slot.meta.life_stage = ComponentLifeStage::Stopped;
        }

        assert_eq!(set.get_present(uid(1)), None);
        assert!(set.get(uid(1)).is_some());
        let items: Vec<_> = set.iter().collect();
        assert_eq!(items, vec![(uid(2), &20)]);
        assert_eq!(set.entities.len(), 2);
    }

    fn transform_storage() -> Box<dyn ComponentStorage> {
        Box::new(SparseSet::<Transform>::new())
    }

    #[test]
    fn store_removes_whole_entity() {
        let mut store = ComponentStore::default();
        let set = store.storage_or_insert(TypeId::of::<Transform>(), transform_storage);
        let id = ComponentId::new(uid(1), TypeId::of::<Transform>(), 1);
        assert!(set.insert_boxed(uid(1), Box::new(Transform::default()), ComponentMeta::new(id, GameTick::ZERO)).is_ok());
        assert_eq!(
            set.insert_boxed(uid(2), Box::new(5u8), ComponentMeta::new(id, GameTick::ZERO)),
            Err(InsertError::WrongType)
        );

        assert!(store.is_present(TypeId::of::<Transform>(), uid(1)));
        assert!(store.meta_of(id).is_some());
        assert_eq!(store.remove_entity(uid(1)), 1);
        assert!(store.meta_of(id).is_none());
        assert_eq!(store.remove_entity(uid(1)), 0);
    }

    #[test]
    fn life_stage_predicates() {
        use ComponentLifeStage::*;
        assert!(Running.is_present());
        assert!(Stopping.is_present());
        assert!(!Stopped.is_present());
        assert!(Starting.is_running());
        assert!(!Initialized.is_running());
        assert!(Initializing.is_initialized());
        assert!(!Added.is_initialized());
        assert!(Stopping.is_removing());
    }
}
