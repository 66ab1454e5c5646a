//! Component registry: names, reference types and net ids for every
//! component type the runtime can store.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::component::{Component, ComponentStorage, SparseSet};
use crate::dependency::ComponentDependencies;
use crate::error::{EcsError, EcsResult};

/// A registration step in a startup registration table.
pub type Registrar = fn(&mut ComponentRegistry) -> EcsResult<()>;

type DataLoader = fn(toml::Value) -> Result<Box<dyn Any>, toml::de::Error>;
type Projection = Rc<dyn Fn(&dyn Any) -> Option<&dyn Any>>;
type ProjectionMut = Rc<dyn Fn(&mut dyn Any) -> Option<&mut dyn Any>>;

/// Casts a stored concrete component to reference type `T`.
struct RefCaster<T: ?Sized + 'static> {
    cast_ref: Box<dyn Fn(&dyn Any) -> Option<&T>>,
    cast_mut: Box<dyn Fn(&mut dyn Any) -> Option<&mut T>>,
}

fn ref_cast<T: ?Sized, F>(f: F) -> F
where
    F: Fn(&dyn Any) -> Option<&T>,
{
    f
}

fn mut_cast<T: ?Sized, F>(f: F) -> F
where
    F: Fn(&mut dyn Any) -> Option<&mut T>,
{
    f
}

fn projection<F>(f: F) -> F
where
    F: Fn(&dyn Any) -> Option<&dyn Any>,
{
    f
}

fn projection_mut<F>(f: F) -> F
where
    F: Fn(&mut dyn Any) -> Option<&mut dyn Any>,
{
    f
}

fn caster<C: Component, T: ?Sized + 'static>(
    as_ref: fn(&C) -> &T,
    as_mut: fn(&mut C) -> &mut T,
) -> Rc<dyn Any> {
    Rc::new(RefCaster::<T> {
        cast_ref: Box::new(ref_cast(move |any: &dyn Any| any.downcast_ref::<C>().map(as_ref))),
        cast_mut: Box::new(mut_cast(move |any: &mut dyn Any| any.downcast_mut::<C>().map(as_mut))),
    })
}

/// One reference type a registration satisfies.
#[derive(Clone)]
struct ReferenceEntry {
    type_id: TypeId,
    name: &'static str,
    /// Projections from the concrete type down to the type the caster expects.
    via: Vec<(Projection, ProjectionMut)>,
    /// A `RefCaster<T>` for this entry's reference type.
    caster: Rc<dyn Any>,
    explicit: bool,
}

impl ReferenceEntry {
    fn new<C: Component, T: ?Sized + 'static>(
        as_ref: fn(&C) -> &T,
        as_mut: fn(&mut C) -> &mut T,
        explicit: bool,
    ) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
            via: Vec::new(),
            caster: caster(as_ref, as_mut),
            explicit,
        }
    }
}

struct BaseLink {
    type_id: TypeId,
    name: &'static str,
    project: Projection,
    project_mut: ProjectionMut,
}

fn new_storage<C: Component>() -> Box<dyn ComponentStorage> {
    Box::new(SparseSet::<C>::new())
}

fn default_factory<C: Component + Default>() -> Box<dyn Any> {
    Box::new(C::default())
}

fn data_loader<C: Component + DeserializeOwned>(data: toml::Value) -> Result<Box<dyn Any>, toml::de::Error> {
    let component: C = serde::Deserialize::deserialize(data)?;
    Ok(Box::new(component))
}

/// Registration name for a type: its short name without a `Component` suffix.
fn default_name<C>() -> String {
    let full = type_name::<C>();
    let base = full.split('<').next().unwrap_or(full);
    let short = base.rsplit("::").next().unwrap_or(base);
    match short.strip_suffix("Component") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => short.to_string(),
    }
}

/// Immutable metadata for one registered component type.
pub struct ComponentRegistration {
    name: String,
    type_id: TypeId,
    type_name: &'static str,
    net_id: Option<u16>,
    networked: bool,
    references: HashMap<TypeId, ReferenceEntry>,
    reference_order: Vec<TypeId>,
    pub(crate) new_storage: fn() -> Box<dyn ComponentStorage>,
    pub(crate) factory: fn() -> Box<dyn Any>,
    pub(crate) loader: Option<DataLoader>,
    pub(crate) describe: fn() -> EcsResult<ComponentDependencies>,
}

impl ComponentRegistration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn net_id(&self) -> Option<u16> {
        self.net_id
    }

    pub fn is_networked(&self) -> bool {
        self.networked
    }

    /// Whether prototype data can be deserialized into this component.
    pub fn accepts_data(&self) -> bool {
        self.loader.is_some()
    }

    /// Whether this component can be looked up as reference type `reference`.
    pub fn satisfies(&self, reference: TypeId) -> bool {
        self.references.contains_key(&reference)
    }

    /// Names of every reference type, starting with the concrete type.
    pub fn reference_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.reference_order
            .iter()
            .filter_map(|id| self.references.get(id))
            .map(|entry| entry.name)
    }
}

/// Describes how a component type should be registered.
pub struct RegistrationBuilder<C> {
    name: Option<String>,
    net_id: Option<u16>,
    networked: bool,
    recursive: bool,
    allow_override: bool,
    base: Option<BaseLink>,
    references: Vec<ReferenceEntry>,
    loader: Option<DataLoader>,
    _marker: PhantomData<fn() -> C>,
}

impl<C: Component + Default> RegistrationBuilder<C> {
    pub fn new() -> Self {
        Self {
            name: None,
            net_id: None,
            networked: false,
            recursive: true,
            allow_override: false,
            base: None,
            references: Vec::new(),
            loader: None,
            _marker: PhantomData,
        }
    }

    /// Override the registration name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Also satisfy reference type `T`, usually a trait object.
    pub fn reference<T: ?Sized + 'static>(
        mut self,
        as_ref: fn(&C) -> &T,
        as_mut: fn(&mut C) -> &mut T,
    ) -> Self {
        self.references.push(ReferenceEntry::new(as_ref, as_mut, true));
        self
    }

    /// Declare a registered base component embedded in this one. With
    /// recursive semantics the base's reference types are inherited.
    pub fn extends<B: Component>(mut self, as_ref: fn(&C) -> &B, as_mut: fn(&mut C) -> &mut B) -> Self {
        let project: Projection = Rc::new(projection(move |any: &dyn Any| {
            any.downcast_ref::<C>().map(|c| as_ref(c) as &dyn Any)
        }));
        let project_mut: ProjectionMut = Rc::new(projection_mut(move |any: &mut dyn Any| {
            any.downcast_mut::<C>().map(|c| as_mut(c) as &mut dyn Any)
        }));
        self.base = Some(BaseLink {
            type_id: TypeId::of::<B>(),
            name: type_name::<B>(),
            project,
            project_mut,
        });
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn net_id(mut self, net_id: u16) -> Self {
        self.net_id = Some(net_id);
        self.networked = true;
        self
    }

    /// Take part in net id generation.
    pub fn networked(mut self) -> Self {
        self.networked = true;
        self
    }

    /// Permit routing reference types already provided by other components.
    pub fn allow_reference_override(mut self) -> Self {
        self.allow_override = true;
        self
    }

    /// Accept prototype data through serde.
    pub fn with_data(mut self) -> Self
    where
        C: DeserializeOwned,
    {
        self.loader = Some(data_loader::<C>);
        self
    }
}

impl<C: Component + Default> Default for RegistrationBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps component names, types and net ids to their registrations.
#[derive(Default)]
pub struct ComponentRegistry {
    registrations: Vec<ComponentRegistration>,
    by_type: HashMap<TypeId, usize>,
    by_name: HashMap<String, usize>,
    by_lower_name: HashMap<String, usize>,
    by_net_id: HashMap<u16, usize>,
    reference_owners: HashMap<TypeId, Vec<usize>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a startup registration table.
    pub fn from_table(table: &[Registrar]) -> EcsResult<Self> {
        let mut registry = Self::new();
        for register in table {
            register(&mut registry)?;
        }
        Ok(registry)
    }

    /// Register a component type with default settings.
    pub fn register<C: Component + Default>(&mut self) -> EcsResult<()> {
        self.register_with(RegistrationBuilder::<C>::new())
    }

    pub fn register_with<C: Component + Default>(&mut self, builder: RegistrationBuilder<C>) -> EcsResult<()> {
        let type_id = TypeId::of::<C>();
        let component = type_name::<C>();
        if self.by_type.contains_key(&type_id) {
            return Err(EcsError::DuplicateRegistration(component));
        }

        let name = builder.name.unwrap_or_else(default_name::<C>);
        let lower = name.to_lowercase();
        let clash = self
            .by_name
            .get(&name)
            .or_else(|| self.by_lower_name.get(&lower))
            .copied();
        if let Some(existing) = clash {
            return Err(EcsError::DuplicateComponentName {
                name,
                existing: self.registrations[existing].type_name,
            });
        }
        if let Some(net_id) = builder.net_id {
            if let Some(&existing) = self.by_net_id.get(&net_id) {
                return Err(EcsError::DuplicateNetId {
                    net_id,
                    existing: self.registrations[existing].type_name,
                });
            }
        }

        let mut references = HashMap::new();
        let mut reference_order = Vec::new();
        let identity = ReferenceEntry::new::<C, C>(|c| c, |c| c, false);
        reference_order.push(identity.type_id);
        references.insert(identity.type_id, identity);

        for entry in builder.references {
            if entry.type_id == type_id || references.contains_key(&entry.type_id) {
                continue;
            }
            if let Some(&owner) = self
                .reference_owners
                .get(&entry.type_id)
                .and_then(|owners| owners.first())
            {
                if !builder.allow_override {
                    return Err(EcsError::DuplicateReference {
                        reference: entry.name,
                        existing: self.registrations[owner].type_name,
                        component,
                    });
                }
            }
            reference_order.push(entry.type_id);
            references.insert(entry.type_id, entry);
        }

        if let (Some(base), true) = (&builder.base, builder.recursive) {
            let base_index = *self
                .by_type
                .get(&base.type_id)
                .ok_or(EcsError::UnregisteredComponent(base.name))?;
            let inherited = &self.registrations[base_index];
            for id in &inherited.reference_order {
                let Some(entry) = inherited.references.get(id) else {
                    continue;
                };
                if references.contains_key(&entry.type_id) {
                    continue;
                }
                let mut via = vec![(base.project.clone(), base.project_mut.clone())];
                via.extend(entry.via.iter().cloned());
                reference_order.push(entry.type_id);
                references.insert(
                    entry.type_id,
                    ReferenceEntry {
                        via,
                        explicit: false,
                        ..entry.clone()
                    },
                );
            }
        }

        let index = self.registrations.len();
        for entry in references.values().filter(|entry| entry.explicit) {
            self.reference_owners.entry(entry.type_id).or_default().push(index);
        }
        if let Some(net_id) = builder.net_id {
            self.by_net_id.insert(net_id, index);
        }
        self.by_type.insert(type_id, index);
        self.by_name.insert(name.clone(), index);
        self.by_lower_name.insert(lower, index);

        debug!(
            "Registered component {} ({}), {} reference types",
            name,
            component,
            reference_order.len()
        );

        self.registrations.push(ComponentRegistration {
            name,
            type_id,
            type_name: component,
            net_id: builder.net_id,
            networked: builder.networked,
            references,
            reference_order,
            new_storage: new_storage::<C>,
            factory: default_factory::<C>,
            loader: builder.loader,
            describe: ComponentDependencies::describe::<C>,
        });
        Ok(())
    }

    /// Assign net ids, in name order, to networked registrations without one.
    pub fn generate_net_ids(&mut self) {
        let mut pending: Vec<usize> = (0..self.registrations.len())
            .filter(|&i| self.registrations[i].networked && self.registrations[i].net_id.is_none())
            .collect();
        pending.sort_by(|&a, &b| self.registrations[a].name.cmp(&self.registrations[b].name));

        let mut next = self
            .by_net_id
            .keys()
            .max()
            .map_or(0, |&max| max.saturating_add(1));
        for index in pending {
            while self.by_net_id.contains_key(&next) {
                next = next.saturating_add(1);
            }
            self.registrations[index].net_id = Some(next);
            self.by_net_id.insert(next, index);
            next = next.saturating_add(1);
        }
    }

    // ---- Lookup ----

    pub fn get_registration(&self, name: &str, ignore_case: bool) -> EcsResult<&ComponentRegistration> {
        self.try_get_registration(name, ignore_case)
            .ok_or_else(|| EcsError::UnknownComponentType(name.to_string()))
    }

    pub fn try_get_registration(&self, name: &str, ignore_case: bool) -> Option<&ComponentRegistration> {
        let index = if ignore_case {
            self.by_lower_name.get(&name.to_lowercase())
        } else {
            self.by_name.get(name)
        }?;
        self.registrations.get(*index)
    }

    pub fn registration<C: Component>(&self) -> EcsResult<&ComponentRegistration> {
        self.registration_by_type(TypeId::of::<C>())
            .ok_or(EcsError::UnregisteredComponent(type_name::<C>()))
    }

    pub fn registration_by_type(&self, type_id: TypeId) -> Option<&ComponentRegistration> {
        self.by_type.get(&type_id).map(|&i| &self.registrations[i])
    }

    pub fn registration_by_net_id(&self, net_id: u16) -> EcsResult<&ComponentRegistration> {
        self.by_net_id
            .get(&net_id)
            .map(|&i| &self.registrations[i])
            .ok_or(EcsError::UnknownNetId(net_id))
    }

    pub fn is_registered<C: Component>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<C>())
    }

    /// Whether concrete component type `concrete` satisfies `reference`.
    pub fn satisfies(&self, concrete: TypeId, reference: TypeId) -> bool {
        self.registration_by_type(concrete)
            .is_some_and(|reg| reg.satisfies(reference))
    }

    /// Concrete types registered as providing `reference`, explicit or inherited.
    pub fn providers(&self, reference: TypeId) -> impl Iterator<Item = &ComponentRegistration> + '_ {
        self.registrations
            .iter()
            .filter(move |reg| reg.satisfies(reference))
    }

    /// Registrations in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentRegistration> {
        self.registrations.iter()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    // ---- Reference casts ----

    /// View a stored component of type `concrete` as reference type `T`.
    pub(crate) fn cast_ref<'a, T: ?Sized + 'static>(
        &self,
        concrete: TypeId,
        value: &'a dyn Any,
    ) -> Option<&'a T> {
        let entry = self.registration_by_type(concrete)?.references.get(&TypeId::of::<T>())?;
        let caster = entry.caster.downcast_ref::<RefCaster<T>>()?;
        let mut value = value;
        for (project, _) in &entry.via {
            value = project(value)?;
        }
        (caster.cast_ref)(value)
    }

    pub(crate) fn cast_mut<'a, T: ?Sized + 'static>(
        &self,
        concrete: TypeId,
        value: &'a mut dyn Any,
    ) -> Option<&'a mut T> {
        let entry = self.registration_by_type(concrete)?.references.get(&TypeId::of::<T>())?;
        let caster = entry.caster.downcast_ref::<RefCaster<T>>()?;
        let mut value = value;
        for (_, project) in &entry.via {
            value = project(value)?;
        }
        (caster.cast_mut)(value)
    }
}
