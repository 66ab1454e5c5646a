//! Sibling dependencies between components of one entity.
//!
//! A component declares its dependency fields once per type through
//! [`Component::declare_dependencies`]. The entity manager keeps every declared
//! field pointed at a present sibling that satisfies the field's target type,
//! and clears it as part of the sibling's removal.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use crate::component::{Component, ComponentId, ComponentStore};
use crate::entity::EntityUid;
use crate::error::{EcsError, EcsResult};
use crate::registry::ComponentRegistry;

/// A nullable handle to a sibling component satisfying `T`.
///
/// `T` may be a concrete component type or a reference type such as a trait
/// object the sibling was registered under. Resolve it through
/// `EntityManager::resolve`.
pub struct Dep<T: ?Sized + 'static> {
    target: Option<ComponentId>,
    _marker: PhantomData<fn() -> *const T>,
}

impl<T: ?Sized + 'static> Dep<T> {
    pub fn get(&self) -> Option<ComponentId> {
        self.target
    }

    pub fn is_resolved(&self) -> bool {
        self.target.is_some()
    }

    pub fn points_to(&self, id: ComponentId) -> bool {
        self.target == Some(id)
    }
}

impl<T: ?Sized + 'static> Clone for Dep<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized + 'static> Copy for Dep<T> {}

impl<T: ?Sized + 'static> Default for Dep<T> {
    fn default() -> Self {
        Self {
            target: None,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized + 'static> PartialEq for Dep<T> {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target
    }
}

impl<T: ?Sized + 'static> fmt::Debug for Dep<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dep<{}>({:?})", type_name::<T>(), self.target)
    }
}

/// A handle that always points somewhere. Valid as a plain field, rejected
/// as a dependency slot since wiring has to be able to clear it.
pub struct Required<T: ?Sized + 'static> {
    target: ComponentId,
    _marker: PhantomData<fn() -> *const T>,
}

impl<T: ?Sized + 'static> Required<T> {
    pub fn new(target: ComponentId) -> Self {
        Self {
            target,
            _marker: PhantomData,
        }
    }

    pub fn get(&self) -> ComponentId {
        self.target
    }
}

/// How a dependency slot can hold its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Nullable,
    NonNullable,
    Value,
}

/// A field type that can be named as a dependency slot.
pub trait DependencySlot: 'static {
    /// The component or reference type the slot points at.
    type Target: ?Sized + 'static;
    const KIND: SlotKind;

    fn current(&self) -> Option<ComponentId>;
    fn assign(&mut self, target: Option<ComponentId>);
}

impl<T: ?Sized + 'static> DependencySlot for Dep<T> {
    type Target = T;
    const KIND: SlotKind = SlotKind::Nullable;

    fn current(&self) -> Option<ComponentId> {
        self.target
    }

    fn assign(&mut self, target: Option<ComponentId>) {
        self.target = target;
    }
}

impl<T: ?Sized + 'static> DependencySlot for Required<T> {
    type Target = T;
    const KIND: SlotKind = SlotKind::NonNullable;

    fn current(&self) -> Option<ComponentId> {
        Some(self.target)
    }

    fn assign(&mut self, target: Option<ComponentId>) {
        if let Some(target) = target {
            self.target = target;
        }
    }
}

macro_rules! impl_value_slot {
    ($($ty:ty),+) => {
        $(
            impl DependencySlot for $ty {
                type Target = $ty;
                const KIND: SlotKind = SlotKind::Value;

                fn current(&self) -> Option<ComponentId> {
                    None
                }

                fn assign(&mut self, _target: Option<ComponentId>) {}
            }
        )+
    };
}

impl_value_slot!(bool, char, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

type SlotGet = Box<dyn Fn(&mut dyn Any) -> Option<ComponentId>>;
type SlotSet = Box<dyn Fn(&mut dyn Any, Option<ComponentId>)>;
type SlotCallback = Box<dyn Fn(&mut dyn Any, ComponentId)>;

/// One declared dependency field, type-erased over the declaring component.
pub(crate) struct DependencyDecl {
    pub target: TypeId,
    pub target_name: &'static str,
    pub kind: SlotKind,
    get: SlotGet,
    set: SlotSet,
    on_added: Option<SlotCallback>,
    on_removed: Option<SlotCallback>,
}

impl DependencyDecl {
    fn current(&self, component: &mut dyn Any) -> Option<ComponentId> {
        (self.get)(component)
    }

    fn attach(&self, component: &mut dyn Any, target: ComponentId) {
        (self.set)(&mut *component, Some(target));
        if let Some(callback) = &self.on_added {
            callback(component, target);
        }
    }

    fn detach(&self, component: &mut dyn Any, target: ComponentId) {
        (self.set)(&mut *component, None);
        if let Some(callback) = &self.on_removed {
            callback(component, target);
        }
    }
}

/// Builder handed to [`Component::declare_dependencies`].
pub struct Dependencies<C> {
    decls: Vec<DependencyDecl>,
    _marker: PhantomData<fn(C)>,
}

impl<C: Component> Dependencies<C> {
    fn new() -> Self {
        Self {
            decls: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Declare a dependency field, given an accessor to it.
    pub fn field<S: DependencySlot>(&mut self, access: fn(&mut C) -> &mut S) -> DependencyField<'_, C> {
        let get = move |any: &mut dyn Any| any.downcast_mut::<C>().and_then(|c| access(c).current());
        let set = move |any: &mut dyn Any, target: Option<ComponentId>| {
            if let Some(c) = any.downcast_mut::<C>() {
                access(c).assign(target);
            }
        };
        self.decls.push(DependencyDecl {
            target: TypeId::of::<S::Target>(),
            target_name: type_name::<S::Target>(),
            kind: S::KIND,
            get: Box::new(get),
            set: Box::new(set),
            on_added: None,
            on_removed: None,
        });
        let index = self.decls.len() - 1;
        DependencyField {
            decl: &mut self.decls[index],
            _marker: PhantomData,
        }
    }
}

/// A declared field, used to attach callbacks.
pub struct DependencyField<'a, C> {
    decl: &'a mut DependencyDecl,
    _marker: PhantomData<fn(C)>,
}

impl<C: Component> DependencyField<'_, C> {
    /// Called after the field is resolved to a sibling.
    pub fn on_added(mut self, callback: fn(&mut C, ComponentId)) -> Self {
        self.decl.on_added = Some(erase_callback(callback));
        self
    }

    /// Called after the field is cleared, with the departing sibling.
    pub fn on_removed(mut self, callback: fn(&mut C, ComponentId)) -> Self {
        self.decl.on_removed = Some(erase_callback(callback));
        self
    }
}

fn erase_callback<C: Component>(callback: fn(&mut C, ComponentId)) -> SlotCallback {
    Box::new(move |any: &mut dyn Any, target: ComponentId| {
        if let Some(c) = any.downcast_mut::<C>() {
            callback(c, target);
        }
    })
}

/// The validated dependency descriptor of one component type.
pub(crate) struct ComponentDependencies {
    decls: Vec<DependencyDecl>,
}

impl ComponentDependencies {
    /// Collect and validate the declarations of `C`.
    pub fn describe<C: Component>() -> EcsResult<ComponentDependencies> {
        let mut deps = Dependencies::<C>::new();
        C::declare_dependencies(&mut deps);

        for decl in &deps.decls {
            match decl.kind {
                SlotKind::Nullable => {}
                SlotKind::NonNullable => {
                    return Err(EcsError::DependencyNotNullable {
                        component: type_name::<C>(),
                        target: decl.target_name,
                    })
                }
                SlotKind::Value => {
                    return Err(EcsError::DependencyValueType {
                        component: type_name::<C>(),
                        target: decl.target_name,
                    })
                }
            }
        }

        Ok(ComponentDependencies { decls: deps.decls })
    }
}

/// Cache of validated descriptors plus the wiring passes run on add/remove.
#[derive(Default)]
pub(crate) struct DependencyWiring {
    descriptors: HashMap<TypeId, ComponentDependencies>,
}

impl DependencyWiring {
    /// Make sure the descriptor of a type is built, surfacing declaration errors.
    pub fn ensure(
        &mut self,
        type_id: TypeId,
        describe: fn() -> EcsResult<ComponentDependencies>,
    ) -> EcsResult<()> {
        if !self.descriptors.contains_key(&type_id) {
            let deps = describe()?;
            self.descriptors.insert(type_id, deps);
        }
        Ok(())
    }

    /// Resolve the fields of a newly stored component and fill empty sibling
    /// fields it satisfies. `siblings` lists the entity's types in add order.
    pub fn wire_added(
        &self,
        store: &mut ComponentStore,
        registry: &ComponentRegistry,
        uid: EntityUid,
        siblings: &[TypeId],
        added: ComponentId,
    ) {
        let added_type = added.type_id();

        if let Some(deps) = self.descriptors.get(&added_type) {
            for decl in &deps.decls {
                let Some(target) = find_provider(store, registry, uid, siblings, decl.target, None) else {
                    continue;
                };
                if let Some(value) = store.value_mut(added_type, uid) {
                    decl.attach(value, target);
                }
            }
        }

        for &sibling in siblings {
            if sibling == added_type || !store.is_present(sibling, uid) {
                continue;
            }
            let Some(deps) = self.descriptors.get(&sibling) else {
                continue;
            };
            for decl in &deps.decls {
                if !registry.satisfies(added_type, decl.target) {
                    continue;
                }
                let Some(value) = store.value_mut(sibling, uid) else {
                    continue;
                };
                if decl.current(value).is_none() {
                    decl.attach(value, added);
                }
            }
        }
    }

    /// Clear every field pointing at a component being removed, falling back
    /// to another provider when one is present, then clear its own fields.
    pub fn wire_removed(
        &self,
        store: &mut ComponentStore,
        registry: &ComponentRegistry,
        uid: EntityUid,
        siblings: &[TypeId],
        removed: ComponentId,
    ) {
        let removed_type = removed.type_id();

        for &sibling in siblings {
            if sibling == removed_type || !store.is_present(sibling, uid) {
                continue;
            }
            let Some(deps) = self.descriptors.get(&sibling) else {
                continue;
            };
            for decl in &deps.decls {
                let Some(value) = store.value_mut(sibling, uid) else {
                    continue;
                };
                if decl.current(value) != Some(removed) {
                    continue;
                }
                decl.detach(value, removed);

                let replacement =
                    find_provider(store, registry, uid, siblings, decl.target, Some(removed_type));
                if let (Some(next), Some(value)) = (replacement, store.value_mut(sibling, uid)) {
                    decl.attach(value, next);
                }
            }
        }

        if let Some(deps) = self.descriptors.get(&removed_type) {
            for decl in &deps.decls {
                let Some(value) = store.value_mut(removed_type, uid) else {
                    continue;
                };
                if let Some(old) = decl.current(value) {
                    decl.detach(value, old);
                }
            }
        }
    }
}

/// First present sibling, in add order, that satisfies `target`.
fn find_provider(
    store: &ComponentStore,
    registry: &ComponentRegistry,
    uid: EntityUid,
    siblings: &[TypeId],
    target: TypeId,
    exclude: Option<TypeId>,
) -> Option<ComponentId> {
    siblings
        .iter()
        .copied()
        .filter(|&t| Some(t) != exclude && registry.satisfies(t, target))
        .find_map(|t| store.meta(t, uid).filter(|m| m.life_stage.is_present()).map(|m| m.id))
}
