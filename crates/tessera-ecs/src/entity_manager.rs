//! The entity manager owns every entity and component and drives the
//! component lifecycle:
//!
//! `Added -> Initializing -> Initialized -> Starting -> Running -> Stopping -> Stopped -> Deleted`
//!
//! Every mutation goes through storage, then dependency wiring, then the
//! matching lifecycle event on the bus.

use std::any::{type_name, Any, TypeId};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use tessera_core::GameTick;
use tracing::{debug, info, trace, warn};

use crate::component::{
    Component, ComponentAdd, ComponentId, ComponentInit, ComponentLifeStage, ComponentMeta, ComponentRemove,
    ComponentShutdown, ComponentStartup, ComponentStore, InsertError, NetworkedComponent,
};
use crate::config::EcsConfig;
use crate::dependency::{Dep, DependencyWiring};
use crate::entity::{EntityAllocator, EntityDeleted, EntityLifeStage, EntityMeta, EntityTerminating, EntityUid};
use crate::error::{EcsError, EcsResult};
use crate::event::{EventBus, EventFuture};
use crate::prototype::{ComponentEntry, EntityPrototype, PrototypeLibrary};
use crate::query::{self, QueryIter, WorldQuery};
use crate::registry::ComponentRegistry;
use crate::system::SystemManager;

/// The central ECS container.
pub struct EntityManager {
    config: EcsConfig,
    registry: ComponentRegistry,
    entities: EntityAllocator,
    store: ComponentStore,
    wiring: DependencyWiring,
    bus: EventBus,
    systems: SystemManager,
    prototypes: PrototypeLibrary,
    queued_deletions: VecDeque<EntityUid>,
    queued_set: HashSet<EntityUid>,
    /// Components removed with deferral, awaiting cull.
    removed: Vec<ComponentId>,
    current_tick: GameTick,
    next_serial: u64,
}

impl EntityManager {
    pub fn new(registry: ComponentRegistry) -> Self {
        Self::with_config(registry, EcsConfig::default())
    }

    pub fn with_config(registry: ComponentRegistry, config: EcsConfig) -> Self {
        Self {
            config,
            registry,
            entities: EntityAllocator::new(),
            store: ComponentStore::default(),
            wiring: DependencyWiring::default(),
            bus: EventBus::new(),
            systems: SystemManager::new(),
            prototypes: PrototypeLibrary::new(),
            queued_deletions: VecDeque::new(),
            queued_set: HashSet::new(),
            removed: Vec::new(),
            current_tick: GameTick::ZERO,
            next_serial: 0,
        }
    }

    pub fn config(&self) -> &EcsConfig {
        &self.config
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn event_bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    pub fn systems(&self) -> &SystemManager {
        &self.systems
    }

    pub fn systems_mut(&mut self) -> &mut SystemManager {
        &mut self.systems
    }

    pub fn prototypes(&self) -> &PrototypeLibrary {
        &self.prototypes
    }

    pub fn prototypes_mut(&mut self) -> &mut PrototypeLibrary {
        &mut self.prototypes
    }

    pub fn current_tick(&self) -> GameTick {
        self.current_tick
    }

    // ---- Entity management ----

    /// Allocate an entity and add its prototype's components without
    /// initializing them.
    pub fn create_entity_uninitialized(&mut self, prototype: Option<&str>) -> EcsResult<EntityUid> {
        let Some(id) = prototype else {
            return Ok(self.allocate_entity(None));
        };
        let proto = self.prototypes.index(id)?.clone();
        let uid = self.allocate_entity(Some(&proto));
        if let Err(err) = self.add_prototype_components(uid, &proto) {
            self.delete_entity(uid);
            return Err(EcsError::entity_creation(id, err));
        }
        Ok(uid)
    }

    /// Initialize, then start, every component of a freshly created entity.
    pub fn initialize_and_start_entity(&mut self, uid: EntityUid) -> EcsResult<()> {
        let stage = self.entity_life_stage(uid).ok_or(EcsError::EntityNotFound(uid))?;
        if stage != EntityLifeStage::PreInit {
            warn!("Entity {} is already initialized ({:?})", uid, stage);
            return Ok(());
        }

        self.set_entity_stage(uid, EntityLifeStage::PreInit, EntityLifeStage::Initializing);
        for id in self.component_ids(uid) {
            self.initialize_component(id);
        }
        // A handler may have deleted the entity.
        if !self.set_entity_stage(uid, EntityLifeStage::Initializing, EntityLifeStage::Initialized) {
            return Ok(());
        }
        for id in self.component_ids(uid) {
            self.start_component(id);
        }
        Ok(())
    }

    /// Create an entity, optionally from a prototype, and bring it to life.
    pub fn spawn_entity(&mut self, prototype: Option<&str>) -> EcsResult<EntityUid> {
        let uid = self.create_entity_uninitialized(prototype)?;
        self.initialize_and_start_entity(uid)?;
        debug!("Spawned entity {} ({})", uid, prototype.unwrap_or("no prototype"));
        Ok(uid)
    }

    fn allocate_entity(&mut self, prototype: Option<&EntityPrototype>) -> EntityUid {
        let uid = self.entities.allocate(self.current_tick);
        if let (Some(meta), Some(proto)) = (self.entities.meta_mut(uid), prototype) {
            meta.name = proto.name.clone();
            meta.prototype = Some(proto.id.clone());
        }
        uid
    }

    fn add_prototype_components(&mut self, uid: EntityUid, proto: &EntityPrototype) -> EcsResult<()> {
        for entry in &proto.components {
            let (type_id, component, value) = self.instantiate(entry)?;
            self.add_boxed(uid, type_id, component, value, false)?;
        }
        Ok(())
    }

    fn instantiate(&self, entry: &ComponentEntry) -> EcsResult<(TypeId, &'static str, Box<dyn Any>)> {
        let registration = self
            .registry
            .get_registration(&entry.component, self.config.ignore_case_component_names)?;
        let value = if entry.data.is_empty() {
            (registration.factory)()
        } else {
            let loader = registration
                .loader
                .ok_or_else(|| EcsError::ComponentNotDeserializable(entry.component.clone()))?;
            loader(toml::Value::Table(entry.data.clone())).map_err(|source| EcsError::ComponentData {
                component: entry.component.clone(),
                source,
            })?
        };
        Ok((registration.type_id(), registration.type_name(), value))
    }

    /// Tear an entity down: `EntityTerminating`, logical removal of every
    /// component (newest first), physical deletion, then `EntityDeleted`.
    /// Re-entrant calls while the entity terminates are ignored.
    pub fn delete_entity(&mut self, uid: EntityUid) {
        let Some(stage) = self.entity_life_stage(uid) else {
            return;
        };
        if stage >= EntityLifeStage::Terminating {
            warn!("Entity {} is already being deleted", uid);
            return;
        }
        if let Some(meta) = self.entities.meta_mut(uid) {
            meta.life_stage = EntityLifeStage::Terminating;
        }

        self.raise_local_event_broadcast(uid, &mut EntityTerminating { entity: uid });

        for id in self.component_ids(uid).into_iter().rev() {
            self.remove_component_inner(id, true);
        }

        let slots = self.store.remove_entity(uid);
        self.entities.deallocate(uid);
        if self.queued_set.remove(&uid) {
            self.queued_deletions.retain(|&queued| queued != uid);
        }
        debug!("Deleted entity {} ({} components)", uid, slots);

        self.raise_event(&mut EntityDeleted { entity: uid });
    }

    /// Delete the entity during the next tick. Queuing twice is a no-op.
    pub fn queue_delete_entity(&mut self, uid: EntityUid) {
        if self.queued_set.insert(uid) {
            self.queued_deletions.push_back(uid);
        }
    }

    pub fn is_queued_for_deletion(&self, uid: EntityUid) -> bool {
        self.queued_set.contains(&uid)
    }

    /// Delete every queued entity, including ones queued while processing.
    pub fn process_queued_deletions(&mut self) -> usize {
        let mut deleted = 0;
        while let Some(uid) = self.queued_deletions.pop_front() {
            self.queued_set.remove(&uid);
            if self.entity_exists(uid) {
                self.delete_entity(uid);
                deleted += 1;
            }
        }
        deleted
    }

    pub fn entity_exists(&self, uid: EntityUid) -> bool {
        self.entities.is_alive(uid)
    }

    pub fn entity_meta(&self, uid: EntityUid) -> Option<&EntityMeta> {
        self.entities.meta(uid)
    }

    pub fn entity_life_stage(&self, uid: EntityUid) -> Option<EntityLifeStage> {
        self.entities.meta(uid).map(|meta| meta.life_stage)
    }

    pub fn entity_name(&self, uid: EntityUid) -> Option<&str> {
        self.entities.meta(uid)?.name.as_deref()
    }

    pub fn set_entity_name(&mut self, uid: EntityUid, name: impl Into<String>) -> EcsResult<()> {
        let meta = self.entities.meta_mut(uid).ok_or(EcsError::EntityNotFound(uid))?;
        meta.name = Some(name.into());
        Ok(())
    }

    /// Live entities in creation order.
    pub fn entities(&self) -> impl Iterator<Item = EntityUid> + '_ {
        self.entities.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn set_entity_stage(&mut self, uid: EntityUid, from: EntityLifeStage, to: EntityLifeStage) -> bool {
        match self.entities.meta_mut(uid) {
            Some(meta) if meta.life_stage == from => {
                meta.life_stage = to;
                true
            }
            _ => false,
        }
    }

    /// Present components of an entity, in add order.
    fn component_ids(&self, uid: EntityUid) -> Vec<ComponentId> {
        self.entities.meta(uid).map_or_else(Vec::new, |meta| {
            meta.components
                .iter()
                .filter_map(|&type_id| self.present_id(type_id, uid))
                .collect()
        })
    }

    fn present_types(&self, uid: EntityUid) -> Vec<TypeId> {
        self.entities.meta(uid).map_or_else(Vec::new, |meta| {
            meta.components
                .iter()
                .copied()
                .filter(|&type_id| self.store.is_present(type_id, uid))
                .collect()
        })
    }

    // ---- Adding components ----

    /// Add a component. Fails if one of the same type is already present.
    /// On an initialized entity the component is initialized and started
    /// before this returns.
    pub fn add_component<C: Component>(&mut self, uid: EntityUid, component: C) -> EcsResult<ComponentId> {
        self.add_boxed(uid, TypeId::of::<C>(), type_name::<C>(), Box::new(component), false)
    }

    /// Add a component, removing any present one of the same type first.
    pub fn add_component_overwrite<C: Component>(&mut self, uid: EntityUid, component: C) -> EcsResult<ComponentId> {
        self.add_boxed(uid, TypeId::of::<C>(), type_name::<C>(), Box::new(component), true)
    }

    /// The present `C`, adding a default one if there is none.
    pub fn ensure_component<C: Component + Default>(&mut self, uid: EntityUid) -> EcsResult<ComponentId> {
        match self.component_id::<C>(uid) {
            Some(id) => Ok(id),
            None => self.add_component(uid, C::default()),
        }
    }

    fn add_boxed(
        &mut self,
        uid: EntityUid,
        type_id: TypeId,
        component: &'static str,
        value: Box<dyn Any>,
        overwrite: bool,
    ) -> EcsResult<ComponentId> {
        if !self.accepts_components(uid) {
            return Err(EcsError::EntityNotFound(uid));
        }
        let registration = self
            .registry
            .registration_by_type(type_id)
            .ok_or(EcsError::UnregisteredComponent(component))?;
        let (new_storage, describe) = (registration.new_storage, registration.describe);
        self.wiring.ensure(type_id, describe)?;

        if let Some(existing) = self.present_id(type_id, uid) {
            if !overwrite {
                return Err(EcsError::DuplicateComponent {
                    entity: uid,
                    component,
                });
            }
            self.remove_component_inner(existing, false);
            if !self.accepts_components(uid) {
                return Err(EcsError::EntityNotFound(uid));
            }
            // A shutdown or remove handler may have added a replacement.
            if self.present_id(type_id, uid).is_some() {
                return Err(EcsError::DuplicateComponent {
                    entity: uid,
                    component,
                });
            }
        }

        self.next_serial += 1;
        let id = ComponentId::new(uid, type_id, self.next_serial);
        let meta = ComponentMeta::new(id, self.current_tick);
        match self
            .store
            .storage_or_insert(type_id, new_storage)
            .insert_boxed(uid, value, meta)
        {
            Ok(()) => {}
            Err(InsertError::WrongType) => return Err(EcsError::UnregisteredComponent(component)),
            Err(InsertError::Occupied) => {
                return Err(EcsError::DuplicateComponent {
                    entity: uid,
                    component,
                })
            }
        }

        let tick = self.current_tick;
        let siblings = match self.entities.meta_mut(uid) {
            Some(entity) => {
                entity.components.retain(|&t| t != type_id);
                entity.components.push(type_id);
                entity.last_modified_tick = tick;
                entity.components.clone()
            }
            None => return Err(EcsError::EntityNotFound(uid)),
        };
        self.wiring
            .wire_added(&mut self.store, &self.registry, uid, &siblings, id);
        trace!("Added {} to entity {}", component, uid);

        self.raise_component_event(id, &mut ComponentAdd { component: id });
        match self.entity_life_stage(uid) {
            Some(EntityLifeStage::Initializing) => self.initialize_component(id),
            Some(EntityLifeStage::Initialized) => {
                self.initialize_component(id);
                self.start_component(id);
            }
            _ => {}
        }
        Ok(id)
    }

    fn accepts_components(&self, uid: EntityUid) -> bool {
        self.entity_life_stage(uid)
            .is_some_and(|stage| stage < EntityLifeStage::Terminating)
    }

    // ---- Lifecycle ----

    /// Move a component from `from` to `to`. Fails if a handler already
    /// moved or deleted it.
    fn transition(&mut self, id: ComponentId, from: ComponentLifeStage, to: ComponentLifeStage) -> bool {
        match self.store.meta_of_mut(id) {
            Some(meta) if meta.life_stage == from => {
                meta.life_stage = to;
                trace!("{:?}: {:?} -> {:?}", id, from, to);
                true
            }
            _ => false,
        }
    }

    fn initialize_component(&mut self, id: ComponentId) {
        if !self.transition(id, ComponentLifeStage::Added, ComponentLifeStage::Initializing) {
            return;
        }
        self.raise_component_event(id, &mut ComponentInit { component: id });
        self.transition(id, ComponentLifeStage::Initializing, ComponentLifeStage::Initialized);
    }

    fn start_component(&mut self, id: ComponentId) {
        if !self.transition(id, ComponentLifeStage::Initialized, ComponentLifeStage::Starting) {
            return;
        }
        self.raise_component_event(id, &mut ComponentStartup { component: id });
        self.transition(id, ComponentLifeStage::Starting, ComponentLifeStage::Running);
    }

    // ---- Removing components ----

    /// Remove a component immediately: shut down, unwire, `ComponentRemove`,
    /// then drop it from storage.
    pub fn remove_component<C: Component>(&mut self, uid: EntityUid) -> EcsResult<()> {
        let id = self.require_component::<C>(uid)?;
        self.remove_component_inner(id, false);
        Ok(())
    }

    /// Remove a component logically. It stays in storage, invisible to
    /// lookups by type, until the next cull.
    pub fn remove_component_deferred<C: Component>(&mut self, uid: EntityUid) -> EcsResult<()> {
        let id = self.require_component::<C>(uid)?;
        self.remove_component_inner(id, true);
        Ok(())
    }

    /// Remove a specific instance. Instances already removing are ignored.
    pub fn remove_component_by_id(&mut self, id: ComponentId, deferred: bool) {
        self.remove_component_inner(id, deferred);
    }

    fn remove_component_inner(&mut self, id: ComponentId, deferred: bool) {
        let Some(stage) = self.store.meta_of(id).map(|meta| meta.life_stage) else {
            return;
        };
        if stage.is_removing() {
            return;
        }
        if stage.is_running() {
            self.transition(id, stage, ComponentLifeStage::Stopping);
            self.raise_component_event(id, &mut ComponentShutdown { component: id });
        }
        match self.store.meta_of_mut(id) {
            Some(meta) if meta.life_stage < ComponentLifeStage::Stopped => {
                trace!("{:?}: {:?} -> Stopped", id, meta.life_stage);
                meta.life_stage = ComponentLifeStage::Stopped;
            }
            _ => return,
        }

        let uid = id.owner();
        let siblings = self
            .entities
            .meta(uid)
            .map(|meta| meta.components.clone())
            .unwrap_or_default();
        self.wiring
            .wire_removed(&mut self.store, &self.registry, uid, &siblings, id);
        let tick = self.current_tick;
        if let Some(entity) = self.entities.meta_mut(uid) {
            entity.components.retain(|&t| t != id.type_id());
            entity.last_modified_tick = tick;
        }

        self.raise_component_event(id, &mut ComponentRemove { component: id });

        if deferred {
            self.removed.push(id);
        } else {
            self.delete_component(id);
        }
    }

    fn delete_component(&mut self, id: ComponentId) -> bool {
        if self.store.meta_of(id).is_none() {
            return false;
        }
        self.store.remove(id.type_id(), id.owner());
        trace!("{:?}: Stopped -> Deleted", id);
        true
    }

    /// Physically delete every component removed with deferral.
    pub fn cull_removed_components(&mut self) -> usize {
        let removed = std::mem::take(&mut self.removed);
        removed
            .into_iter()
            .filter(|&id| self.delete_component(id))
            .count()
    }

    fn require_component<C: Component>(&self, uid: EntityUid) -> EcsResult<ComponentId> {
        if !self.entity_exists(uid) {
            return Err(EcsError::EntityNotFound(uid));
        }
        self.component_id::<C>(uid).ok_or(EcsError::ComponentNotFound {
            entity: uid,
            component: type_name::<C>(),
        })
    }

    // ---- Component lookup ----

    pub fn has_component<C: Component>(&self, uid: EntityUid) -> bool {
        self.store.is_present(TypeId::of::<C>(), uid)
    }

    pub fn get_component<C: Component>(&self, uid: EntityUid) -> EcsResult<&C> {
        self.try_get_component(uid).ok_or(EcsError::ComponentNotFound {
            entity: uid,
            component: type_name::<C>(),
        })
    }

    pub fn get_component_mut<C: Component>(&mut self, uid: EntityUid) -> EcsResult<&mut C> {
        self.try_get_component_mut(uid).ok_or(EcsError::ComponentNotFound {
            entity: uid,
            component: type_name::<C>(),
        })
    }

    pub fn try_get_component<C: Component>(&self, uid: EntityUid) -> Option<&C> {
        self.store.typed::<C>()?.get_present(uid)
    }

    pub fn try_get_component_mut<C: Component>(&mut self, uid: EntityUid) -> Option<&mut C> {
        self.store.typed_mut::<C>()?.get_present_mut(uid)
    }

    /// The stored `C` in any life stage, including one removed with
    /// deferral but not yet culled.
    pub fn get_component_any_stage<C: Component>(&self, uid: EntityUid) -> Option<&C> {
        self.store.typed::<C>()?.get(uid).map(|slot| &slot.value)
    }

    /// A specific instance, while it is still stored.
    pub fn component_by_id<C: Component>(&self, id: ComponentId) -> Option<&C> {
        self.store
            .typed::<C>()?
            .get(id.owner())
            .filter(|slot| slot.meta.id == id)
            .map(|slot| &slot.value)
    }

    pub fn component_id<C: Component>(&self, uid: EntityUid) -> Option<ComponentId> {
        self.present_id(TypeId::of::<C>(), uid)
    }

    fn present_id(&self, type_id: TypeId, uid: EntityUid) -> Option<ComponentId> {
        self.store
            .meta(type_id, uid)
            .filter(|meta| meta.life_stage.is_present())
            .map(|meta| meta.id)
    }

    /// Life stage of an instance. Anything no longer stored is `Deleted`.
    pub fn component_life_stage(&self, id: ComponentId) -> ComponentLifeStage {
        self.store
            .meta_of(id)
            .map_or(ComponentLifeStage::Deleted, |meta| meta.life_stage)
    }

    pub fn component_meta<C: Component>(&self, uid: EntityUid) -> Option<&ComponentMeta> {
        self.store
            .meta(TypeId::of::<C>(), uid)
            .filter(|meta| meta.life_stage.is_present())
    }

    /// Follow a dependency field to its sibling, viewed as `T`.
    pub fn resolve<T: ?Sized + 'static>(&self, dep: &Dep<T>) -> Option<&T> {
        self.resolve_id::<T>(dep.get()?)
    }

    pub fn resolve_mut<T: ?Sized + 'static>(&mut self, dep: &Dep<T>) -> Option<&mut T> {
        self.resolve_id_mut::<T>(dep.get()?)
    }

    /// A present instance viewed as one of its reference types.
    pub fn resolve_id<T: ?Sized + 'static>(&self, id: ComponentId) -> Option<&T> {
        if !self.store.meta_of(id)?.life_stage.is_present() {
            return None;
        }
        let value = self.store.value(id.type_id(), id.owner())?;
        self.registry.cast_ref::<T>(id.type_id(), value)
    }

    pub fn resolve_id_mut<T: ?Sized + 'static>(&mut self, id: ComponentId) -> Option<&mut T> {
        if !self.store.meta_of(id)?.life_stage.is_present() {
            return None;
        }
        let value = self.store.value_mut(id.type_id(), id.owner())?;
        self.registry.cast_mut::<T>(id.type_id(), value)
    }

    /// The first present component, in add order, satisfying reference type `T`.
    pub fn try_get_reference<T: ?Sized + 'static>(&self, uid: EntityUid) -> Option<&T> {
        let id = self.reference_provider::<T>(uid)?;
        self.resolve_id::<T>(id)
    }

    pub fn try_get_reference_mut<T: ?Sized + 'static>(&mut self, uid: EntityUid) -> Option<&mut T> {
        let id = self.reference_provider::<T>(uid)?;
        self.resolve_id_mut::<T>(id)
    }

    fn reference_provider<T: ?Sized + 'static>(&self, uid: EntityUid) -> Option<ComponentId> {
        let target = TypeId::of::<T>();
        self.entities
            .meta(uid)?
            .components
            .iter()
            .copied()
            .filter(|&type_id| self.registry.satisfies(type_id, target))
            .find_map(|type_id| self.present_id(type_id, uid))
    }

    // ---- Net ids ----

    pub fn has_component_by_net_id(&self, uid: EntityUid, net_id: u16) -> EcsResult<bool> {
        let registration = self.registry.registration_by_net_id(net_id)?;
        Ok(self.store.is_present(registration.type_id(), uid))
    }

    pub fn get_component_by_net_id(&self, uid: EntityUid, net_id: u16) -> EcsResult<&dyn Any> {
        let registration = self.registry.registration_by_net_id(net_id)?;
        let not_found = EcsError::ComponentNotFound {
            entity: uid,
            component: registration.type_name(),
        };
        let Some(id) = self.present_id(registration.type_id(), uid) else {
            return Err(not_found);
        };
        self.store.value(id.type_id(), uid).ok_or(not_found)
    }

    pub fn remove_component_by_net_id(&mut self, uid: EntityUid, net_id: u16) -> EcsResult<()> {
        let registration = self.registry.registration_by_net_id(net_id)?;
        let component = registration.type_name();
        let id = self
            .present_id(registration.type_id(), uid)
            .ok_or(EcsError::ComponentNotFound { entity: uid, component })?;
        self.remove_component_inner(id, false);
        Ok(())
    }

    // ---- Dirty tracking and state ----

    /// Stamp the current tick on the component and its entity.
    pub fn dirty<C: Component>(&mut self, uid: EntityUid) -> EcsResult<()> {
        let id = self.require_component::<C>(uid)?;
        self.mark_dirty(id);
        Ok(())
    }

    fn mark_dirty(&mut self, id: ComponentId) {
        let tick = self.current_tick;
        if let Some(meta) = self.store.meta_of_mut(id) {
            meta.last_modified_tick = tick;
        }
        if let Some(entity) = self.entities.meta_mut(id.owner()) {
            entity.last_modified_tick = tick;
        }
    }

    pub fn set_net_sync<C: Component>(&mut self, uid: EntityUid, net_sync: bool) -> EcsResult<()> {
        let id = self.require_component::<C>(uid)?;
        if let Some(meta) = self.store.meta_of_mut(id) {
            meta.net_sync = net_sync;
        }
        Ok(())
    }

    pub fn component_state<C: NetworkedComponent>(&self, uid: EntityUid) -> EcsResult<C::State> {
        Ok(self.get_component::<C>(uid)?.get_state())
    }

    /// Apply captured state, adding the component through the normal
    /// lifecycle first if the entity lacks it.
    pub fn apply_component_state<C: NetworkedComponent>(
        &mut self,
        uid: EntityUid,
        state: C::State,
    ) -> EcsResult<ComponentId> {
        let id = match self.component_id::<C>(uid) {
            Some(id) => id,
            None => {
                let value = (self.registry.registration::<C>()?.factory)();
                self.add_boxed(uid, TypeId::of::<C>(), type_name::<C>(), value, false)?
            }
        };
        if let Some(component) = self.try_get_component_mut::<C>(uid) {
            component.apply_state(state);
        }
        self.mark_dirty(id);
        Ok(id)
    }

    // ---- Queries ----

    /// Every present `C`.
    pub fn entity_query<C: Component>(&self) -> impl Iterator<Item = (EntityUid, &C)> + '_ {
        self.store.typed::<C>().into_iter().flat_map(|set| set.iter())
    }

    pub fn entity_query_mut<C: Component>(&mut self) -> impl Iterator<Item = (EntityUid, &mut C)> + '_ {
        self.store
            .typed_mut::<C>()
            .into_iter()
            .flat_map(|set| set.iter_mut())
    }

    /// Query entities matching a component pattern such as
    /// `(&Transform, Option<&Health>)`.
    pub fn query<Q: WorldQuery>(&self) -> QueryIter<'_, Q> {
        let candidates = query::candidates::<Q>(&self.store, self.entities.iter());
        QueryIter::new(&self.store, candidates)
    }

    // ---- Events ----

    /// Deliver `event` to the directed handlers of every component type the
    /// entity has. Reference-mode handlers mutate `event` in place.
    pub fn raise_local_event<E: 'static>(&mut self, uid: EntityUid, event: &mut E) {
        self.dispatch_local(uid, event);
        self.bus.complete_await(&*event);
    }

    /// Directed dispatch followed by broadcast dispatch of the same event.
    /// Broadcast handlers see changes made by the directed ones.
    pub fn raise_local_event_broadcast<E: 'static>(&mut self, uid: EntityUid, event: &mut E) {
        self.dispatch_local(uid, event);
        self.dispatch_broadcast(event);
        self.bus.complete_await(&*event);
    }

    /// Deliver `event` to every broadcast handler.
    pub fn raise_event<E: 'static>(&mut self, event: &mut E) {
        self.dispatch_broadcast(event);
        self.bus.complete_await(&*event);
    }

    fn dispatch_local<E: 'static>(&mut self, uid: EntityUid, event: &mut E) {
        let present = self.present_types(uid);
        let handlers = self.bus.local_handlers::<E>(&present);
        for handler in handlers {
            handler(&mut *self, uid, &mut *event);
        }
    }

    fn dispatch_broadcast<E: 'static>(&mut self, event: &mut E) {
        let handlers = self.bus.broadcast_handlers::<E>();
        for handler in handlers {
            handler(&mut *self, &mut *event);
        }
    }

    /// Deliver a lifecycle event to the subscription of the component's own type.
    fn raise_component_event<E: 'static>(&mut self, id: ComponentId, event: &mut E) {
        let handlers = self.bus.local_handlers::<E>(&[id.type_id()]);
        for handler in handlers {
            handler(&mut *self, id.owner(), &mut *event);
        }
        self.bus.complete_await(&*event);
    }

    pub fn queue_event<E: 'static>(&mut self, event: E) {
        self.bus.queue_event(event);
    }

    pub fn queue_local_event<E: 'static>(&mut self, uid: EntityUid, event: E) {
        self.bus.queue_local_event(uid, event);
    }

    /// Deliver queued events until the queue is empty, including events
    /// queued by the handlers themselves.
    pub fn process_event_queue(&mut self) -> usize {
        let mut processed = 0;
        while let Some(queued) = self.bus.pop_queued() {
            queued(&mut *self);
            processed += 1;
        }
        processed
    }

    pub fn await_event<E: Clone + 'static>(&mut self) -> EcsResult<EventFuture<E>> {
        self.bus.await_event::<E>()
    }

    // ---- Systems ----

    /// Construct every registered system and let each subscribe, in update
    /// order. If a subscription step fails, every system's subscriptions are
    /// dropped again and the manager stays uninitialized.
    pub fn initialize_systems(&mut self) -> EcsResult<()> {
        let inits = self.systems.build()?;
        for (index, (_, init)) in inits.iter().enumerate() {
            if let Err(err) = init(&mut self.bus) {
                for (key, _) in &inits[..=index] {
                    self.bus.unsubscribe_events(*key);
                }
                return Err(err);
            }
        }
        self.systems.finish_initialization();
        Ok(())
    }

    pub fn get_entity_system<T: ?Sized + 'static>(&self) -> EcsResult<Rc<T>> {
        self.systems.get_entity_system::<T>()
    }

    /// Advance one tick: update systems in order, drain the event queue,
    /// delete queued entities, cull removed components.
    pub fn tick_update(&mut self, frame_time: f32) {
        for (key, system) in self.systems.ordered_systems() {
            trace!("Updating {}", key);
            system.update(self, frame_time);
        }
        if self.config.process_queue_each_tick {
            self.process_event_queue();
        }
        self.process_queued_deletions();
        if self.config.cull_each_tick {
            self.cull_removed_components();
        }
        self.current_tick = self.current_tick.next();
    }

    /// Delete every entity, then shut systems down in reverse update order
    /// and drop their subscriptions.
    pub fn shutdown(&mut self) {
        let uids: Vec<EntityUid> = self.entities.iter().collect();
        for uid in uids {
            self.delete_entity(uid);
        }
        self.queued_deletions.clear();
        self.queued_set.clear();
        self.cull_removed_components();

        let systems = self.systems.ordered_systems();
        for (key, system) in systems.iter().rev() {
            system.shutdown(self);
            self.bus.unsubscribe_events(*key);
        }
        self.systems.clear();
        info!("Entity manager shut down ({} systems)", systems.len());
    }
}
