//! Per-type singleton systems.
//!
//! Systems are registered as factories. [`SystemManager`] builds them all at
//! initialization, resolving system-to-system dependencies through a
//! [`SystemResolver`], then lets each one subscribe to events in the global
//! update order.

use std::any::{type_name, Any, TypeId};
use std::marker::PhantomData;
use std::rc::Rc;

use tracing::{debug, info};

use crate::component::Component;
use crate::entity::EntityUid;
use crate::entity_manager::EntityManager;
use crate::error::{EcsError, EcsResult};
use crate::event::EventBus;
use crate::ordering::{order_keys, short_type_name, EventOrdering, SystemKey};
use crate::services::Services;

/// A singleton that reacts to events and runs once per tick.
///
/// Systems are shared behind `Rc` so their event handlers can outlive any
/// single borrow; mutable state belongs in interior cells.
pub trait EntitySystem: Any {
    /// Subscribe to events. Called once, in update order.
    fn initialize(&self, _subs: &mut Subscriptions<'_, Self>) -> EcsResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }

    fn update(&self, _em: &mut EntityManager, _frame_time: f32) {}

    fn shutdown(&self, _em: &mut EntityManager) {}

    /// Systems this one must update before.
    fn updates_before(&self) -> Vec<SystemKey> {
        Vec::new()
    }

    /// Systems this one must update after.
    fn updates_after(&self) -> Vec<SystemKey> {
        Vec::new()
    }
}

// ---- Subscriptions ----

/// Subscription helper handed to [`EntitySystem::initialize`]. Every
/// handler registered through it is keyed by the system's type.
pub struct Subscriptions<'a, S> {
    bus: &'a mut EventBus,
    system: Rc<S>,
}

impl<'a, S: EntitySystem> Subscriptions<'a, S> {
    pub(crate) fn new(bus: &'a mut EventBus, system: Rc<S>) -> Self {
        Self { bus, system }
    }

    pub fn key(&self) -> SystemKey {
        SystemKey::of::<S>()
    }

    /// Subscribe to `E` raised at entities with a `C` component.
    pub fn local<C: Component, E: 'static>(&mut self) -> LocalSubscription<'_, S, C, E> {
        LocalSubscription {
            bus: &mut *self.bus,
            system: self.system.clone(),
            ordering: EventOrdering::of::<S>(),
            _marker: PhantomData,
        }
    }

    /// Subscribe to broadcast `E`.
    pub fn broadcast<E: 'static>(&mut self) -> BroadcastSubscription<'_, S, E> {
        BroadcastSubscription {
            bus: &mut *self.bus,
            system: self.system.clone(),
            ordering: EventOrdering::of::<S>(),
            _marker: PhantomData,
        }
    }

    /// Direct bus access for subscriptions keyed by something else.
    pub fn bus(&mut self) -> &mut EventBus {
        &mut *self.bus
    }
}

pub struct LocalSubscription<'s, S, C, E> {
    bus: &'s mut EventBus,
    system: Rc<S>,
    ordering: EventOrdering,
    _marker: PhantomData<fn(C, E)>,
}

impl<S: EntitySystem, C: Component, E: 'static> LocalSubscription<'_, S, C, E> {
    pub fn before<T: ?Sized + 'static>(mut self) -> Self {
        self.ordering = self.ordering.before::<T>();
        self
    }

    pub fn after<T: ?Sized + 'static>(mut self) -> Self {
        self.ordering = self.ordering.after::<T>();
        self
    }

    pub fn by_ref(self, handler: impl Fn(&S, &mut EntityManager, EntityUid, &mut E) + 'static) -> EcsResult<()> {
        let system = self.system;
        self.bus.subscribe_local_event::<C, E>(
            self.ordering,
            move |em: &mut EntityManager, uid: EntityUid, event: &mut E| handler(&*system, em, uid, event),
        )
    }

    pub fn by_value(self, handler: impl Fn(&S, &mut EntityManager, EntityUid, E) + 'static) -> EcsResult<()>
    where
        E: Clone,
    {
        let system = self.system;
        self.bus.subscribe_local_event_by_value::<C, E>(
            self.ordering,
            move |em: &mut EntityManager, uid: EntityUid, event: E| handler(&*system, em, uid, event),
        )
    }
}

pub struct BroadcastSubscription<'s, S, E> {
    bus: &'s mut EventBus,
    system: Rc<S>,
    ordering: EventOrdering,
    _marker: PhantomData<fn(E)>,
}

impl<S: EntitySystem, E: 'static> BroadcastSubscription<'_, S, E> {
    pub fn before<T: ?Sized + 'static>(mut self) -> Self {
        self.ordering = self.ordering.before::<T>();
        self
    }

    pub fn after<T: ?Sized + 'static>(mut self) -> Self {
        self.ordering = self.ordering.after::<T>();
        self
    }

    pub fn by_ref(self, handler: impl Fn(&S, &mut EntityManager, &mut E) + 'static) -> EcsResult<()> {
        let system = self.system;
        self.bus.subscribe_event::<E>(self.ordering, move |em: &mut EntityManager, event: &mut E| {
            handler(&*system, em, event)
        })
    }

    pub fn by_value(self, handler: impl Fn(&S, &mut EntityManager, E) + 'static) -> EcsResult<()>
    where
        E: Clone,
    {
        let system = self.system;
        self.bus.subscribe_event_by_value::<E>(self.ordering, move |em: &mut EntityManager, event: E| {
            handler(&*system, em, event)
        })
    }
}

// ---- Registration ----

type Factory<S> = Box<dyn FnOnce(&mut SystemResolver<'_>) -> EcsResult<S>>;
type Alias<S> = Box<dyn Fn(Rc<S>) -> Box<dyn Any>>;
type BuildFn = Box<dyn FnOnce(&mut SystemResolver<'_>) -> EcsResult<SystemEntry>>;
type InitFn = Rc<dyn Fn(&mut EventBus) -> EcsResult<()>>;

/// How to construct a system, plus the trait objects it can be looked up as.
pub struct SystemRegistration<S> {
    factory: Factory<S>,
    aliases: Vec<(TypeId, Alias<S>)>,
}

impl<S: EntitySystem> SystemRegistration<S> {
    pub fn new(factory: impl FnOnce(&mut SystemResolver<'_>) -> EcsResult<S> + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            aliases: Vec::new(),
        }
    }

    /// Make the system resolvable as `T`, usually a trait object it implements.
    pub fn alias<T: ?Sized + 'static>(mut self, cast: fn(Rc<S>) -> Rc<T>) -> Self {
        let alias: Alias<S> = Box::new(move |system: Rc<S>| Box::new(cast(system)) as Box<dyn Any>);
        self.aliases.push((TypeId::of::<T>(), alias));
        self
    }
}

impl<S: EntitySystem + Default> Default for SystemRegistration<S> {
    fn default() -> Self {
        Self::new(|_| Ok(S::default()))
    }
}

/// A constructed system.
struct SystemEntry {
    key: SystemKey,
    system: Rc<dyn EntitySystem>,
    /// `Rc<T>` for the concrete type and every alias, boxed as `Any`.
    views: Vec<(TypeId, Box<dyn Any>)>,
    before: Vec<SystemKey>,
    after: Vec<SystemKey>,
    init: InitFn,
}

impl SystemEntry {
    fn new<S: EntitySystem>(system: Rc<S>, aliases: Vec<(TypeId, Alias<S>)>) -> Self {
        let own: Box<dyn Any> = Box::new(system.clone());
        let mut views = vec![(TypeId::of::<S>(), own)];
        views.extend(aliases.into_iter().map(|(id, alias)| (id, alias(system.clone()))));

        let subscriber = system.clone();
        let init: InitFn = Rc::new(move |bus: &mut EventBus| {
            let mut subs = Subscriptions::new(bus, subscriber.clone());
            subscriber.initialize(&mut subs)
        });

        Self {
            key: SystemKey::of::<S>(),
            before: system.updates_before(),
            after: system.updates_after(),
            system,
            views,
            init,
        }
    }

    fn view<T: ?Sized + 'static>(&self) -> Option<Rc<T>> {
        self.views
            .iter()
            .find(|(id, _)| *id == TypeId::of::<T>())
            .and_then(|(_, view)| view.downcast_ref::<Rc<T>>())
            .cloned()
    }
}

/// A registered system, built or not.
struct SystemSlot {
    key: SystemKey,
    /// Every type the system can be looked up as.
    provides: Vec<TypeId>,
    build: Option<BuildFn>,
    entry: Option<SystemEntry>,
}

fn provider_index<T: ?Sized + 'static>(slots: &[SystemSlot]) -> EcsResult<usize> {
    let requested = TypeId::of::<T>();
    let matches: Vec<usize> = (0..slots.len())
        .filter(|&i| slots[i].provides.contains(&requested))
        .collect();
    match matches.as_slice() {
        [index] => Ok(*index),
        [] => Err(EcsError::UnknownSystem(short_type_name(type_name::<T>()))),
        _ => Err(EcsError::AmbiguousSystem {
            requested: short_type_name(type_name::<T>()),
            candidates: matches.iter().map(|&i| slots[i].key.name()).collect(),
        }),
    }
}

/// Constructor-time access to other systems and to services.
pub struct SystemResolver<'a> {
    slots: &'a mut [SystemSlot],
    services: &'a Services,
}

impl SystemResolver<'_> {
    /// The system providing `T`, constructing it first if needed.
    pub fn system<T: ?Sized + 'static>(&mut self) -> EcsResult<Rc<T>> {
        let index = provider_index::<T>(self.slots)?;
        self.construct(index)?;
        self.slots[index]
            .entry
            .as_ref()
            .and_then(SystemEntry::view::<T>)
            .ok_or(EcsError::UnknownSystem(short_type_name(type_name::<T>())))
    }

    pub fn service<T: 'static>(&self) -> EcsResult<Rc<T>> {
        self.services
            .get::<T>()
            .ok_or(EcsError::UnknownService(short_type_name(type_name::<T>())))
    }

    fn construct(&mut self, index: usize) -> EcsResult<()> {
        if self.slots[index].entry.is_some() {
            return Ok(());
        }
        // A slot without a factory is mid-construction further up the stack.
        let build = self.slots[index]
            .build
            .take()
            .ok_or(EcsError::SystemDependencyCycle(self.slots[index].key.name()))?;
        let entry = build(&mut *self)?;
        debug!("Constructed system {}", entry.key);
        self.slots[index].entry = Some(entry);
        Ok(())
    }
}

// ---- Manager ----

/// Owns one instance per registered system type and the update order.
#[derive(Default)]
pub struct SystemManager {
    slots: Vec<SystemSlot>,
    update_order: Vec<usize>,
    services: Services,
    initialized: bool,
}

impl SystemManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a system constructed through `Default`.
    pub fn register<S: EntitySystem + Default>(&mut self) -> EcsResult<()> {
        self.register_with(SystemRegistration::<S>::default())
    }

    pub fn register_with<S: EntitySystem>(&mut self, registration: SystemRegistration<S>) -> EcsResult<()> {
        if self.initialized {
            return Err(EcsError::SystemsAlreadyInitialized);
        }
        let key = SystemKey::of::<S>();
        if self.slots.iter().any(|slot| slot.key == key) {
            return Err(EcsError::DuplicateSystem(key.name()));
        }

        let mut provides = vec![TypeId::of::<S>()];
        provides.extend(registration.aliases.iter().map(|(id, _)| *id));

        let SystemRegistration { factory, aliases } = registration;
        let build: BuildFn = Box::new(move |resolver: &mut SystemResolver<'_>| {
            let system = Rc::new(factory(resolver)?);
            Ok(SystemEntry::new(system, aliases))
        });

        self.slots.push(SystemSlot {
            key,
            provides,
            build: Some(build),
            entry: None,
        });
        Ok(())
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Services are only injected at construction, so provide them before
    /// initialization.
    pub fn services_mut(&mut self) -> &mut Services {
        &mut self.services
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Construct every system and compute the update order. Returns the
    /// subscription steps, in update order, for the caller to run against
    /// the bus. The manager counts as initialized only once the caller
    /// reports every step succeeded through [`Self::finish_initialization`].
    pub(crate) fn build(&mut self) -> EcsResult<Vec<(SystemKey, InitFn)>> {
        if self.initialized {
            return Err(EcsError::SystemsAlreadyInitialized);
        }

        let mut resolver = SystemResolver {
            slots: &mut self.slots,
            services: &self.services,
        };
        for index in 0..resolver.slots.len() {
            resolver.construct(index)?;
        }

        let order = order_keys(
            "system update order",
            self.slots
                .iter()
                .filter_map(|slot| slot.entry.as_ref())
                .map(|entry| (entry.key, entry.before.as_slice(), entry.after.as_slice())),
        )?;
        self.update_order = order
            .iter()
            .filter_map(|key| self.slots.iter().position(|slot| slot.key == *key))
            .collect();

        Ok(self
            .update_order
            .iter()
            .filter_map(|&index| self.slots[index].entry.as_ref())
            .map(|entry| (entry.key, entry.init.clone()))
            .collect())
    }

    pub(crate) fn finish_initialization(&mut self) {
        self.initialized = true;
        info!(
            "Initialized {} systems: {:?}",
            self.update_order.len(),
            self.update_order()
        );
    }

    /// The system providing `T`, once systems are initialized.
    pub fn get_entity_system<T: ?Sized + 'static>(&self) -> EcsResult<Rc<T>> {
        let index = provider_index::<T>(&self.slots)?;
        self.slots[index]
            .entry
            .as_ref()
            .and_then(SystemEntry::view::<T>)
            .ok_or(EcsError::UnknownSystem(short_type_name(type_name::<T>())))
    }

    pub fn try_get_entity_system<T: ?Sized + 'static>(&self) -> Option<Rc<T>> {
        self.get_entity_system::<T>().ok()
    }

    pub fn update_order(&self) -> Vec<SystemKey> {
        self.update_order.iter().map(|&i| self.slots[i].key).collect()
    }

    /// Built systems in update order.
    pub(crate) fn ordered_systems(&self) -> Vec<(SystemKey, Rc<dyn EntitySystem>)> {
        self.update_order
            .iter()
            .filter_map(|&i| {
                let entry = self.slots[i].entry.as_ref()?;
                Some((entry.key, entry.system.clone()))
            })
            .collect()
    }

    /// Forget every built system. Registrations are kept but cannot be rebuilt.
    pub(crate) fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.entry = None;
        }
        self.update_order.clear();
    }
}
