//! Tessera ECS - Entity Component System runtime
//!
//! Entities are bare ids. Components live in sparse-set storage keyed by
//! concrete type, move through an explicit lifecycle and can have sibling
//! dependencies wired into their fields. Systems are per-type singletons
//! that react to events on a typed, ordered event bus.

mod component;
mod config;
mod dependency;
mod entity;
mod entity_manager;
mod error;
mod event;
mod ordering;
mod prototype;
mod query;
mod registry;
mod services;
mod system;

#[cfg(test)]
mod scenario_tests;

pub use component::{
    Component, ComponentAdd, ComponentId, ComponentInit, ComponentLifeStage, ComponentMeta, ComponentRemove,
    ComponentShutdown, ComponentStartup, NetworkedComponent,
};
pub use config::EcsConfig;
pub use dependency::{Dep, Dependencies, DependencyField, DependencySlot, Required, SlotKind};
pub use entity::{EntityDeleted, EntityLifeStage, EntityMeta, EntityTerminating, EntityUid};
pub use entity_manager::EntityManager;
pub use error::{EcsError, EcsResult};
pub use event::{BroadcastHandler, EventBus, EventFuture, EventMode, LocalHandler};
pub use ordering::{EventOrdering, SystemKey};
pub use prototype::{ComponentEntry, EntityPrototype, PrototypeLibrary};
pub use query::{QueryIter, WorldQuery};
pub use registry::{ComponentRegistration, ComponentRegistry, Registrar, RegistrationBuilder};
pub use services::Services;
pub use system::{
    BroadcastSubscription, EntitySystem, LocalSubscription, SystemManager, SystemRegistration, SystemResolver,
    Subscriptions,
};
