//! Declarative entity templates loaded from TOML.
//!
//! ```toml
//! [[prototypes]]
//! id = "crate"
//! name = "Wooden crate"
//!
//! [[prototypes.components]]
//! type = "Transform"
//! position = [4.0, 2.0]
//!
//! [[prototypes.components]]
//! type = "Health"
//! ```
//!
//! Every key of a component entry other than `type` is handed to the
//! component's registered data loader.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EcsError, EcsResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPrototype {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub components: Vec<ComponentEntry>,
}

/// One component of a prototype: its registration name plus field data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentEntry {
    #[serde(rename = "type")]
    pub component: String,
    #[serde(flatten)]
    pub data: toml::Table,
}

impl ComponentEntry {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            data: toml::Table::new(),
        }
    }
}

#[derive(Deserialize)]
struct PrototypeFile {
    #[serde(default)]
    prototypes: Vec<EntityPrototype>,
}

/// All known prototypes, by id.
#[derive(Debug, Default)]
pub struct PrototypeLibrary {
    prototypes: HashMap<String, EntityPrototype>,
}

impl PrototypeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document of `[[prototypes]]` and add them, replacing
    /// prototypes with the same id. Returns how many were loaded.
    pub fn load_str(&mut self, text: &str) -> EcsResult<usize> {
        let file: PrototypeFile = toml::from_str(text)?;
        let count = file.prototypes.len();
        for prototype in file.prototypes {
            self.insert(prototype);
        }
        debug!("Loaded {} prototypes", count);
        Ok(count)
    }

    pub fn insert(&mut self, prototype: EntityPrototype) {
        self.prototypes.insert(prototype.id.clone(), prototype);
    }

    pub fn get(&self, id: &str) -> Option<&EntityPrototype> {
        self.prototypes.get(id)
    }

    pub fn index(&self, id: &str) -> EcsResult<&EntityPrototype> {
        self.get(id)
            .ok_or_else(|| EcsError::UnknownPrototype(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.prototypes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }
}
