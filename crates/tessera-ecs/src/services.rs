use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::rc::Rc;

/// Type map of shared services handed to system constructors.
#[derive(Default)]
pub struct Services {
    map: HashMap<TypeId, Rc<dyn Any>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provide a service, replacing any previous value of the same type.
    pub fn insert<T: 'static>(&mut self, value: T) {
        self.insert_rc(Rc::new(value));
    }

    /// Provide an already shared service.
    pub fn insert_rc<T: 'static>(&mut self, value: Rc<T>) {
        self.map.insert(TypeId::of::<T>(), value);
    }

    pub fn get<T: 'static>(&self) -> Option<Rc<T>> {
        self.map
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    /// Remove a service, returning it if it existed.
    pub fn remove<T: 'static>(&mut self) -> Option<Rc<T>> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|service| service.downcast::<T>().ok())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
