use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt;

use tessera_core::GameTick;

/// An entity handle. Ids are issued monotonically and never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityUid(u64);

impl EntityUid {
    /// The id no live entity ever has.
    pub const INVALID: EntityUid = EntityUid(0);

    /// Create a handle from a raw id (mainly for testing).
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Debug for EntityUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityUid({})", self.0)
    }
}

impl fmt::Display for EntityUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an entity as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntityLifeStage {
    /// Allocated; components are added but not yet initialized.
    PreInit,
    Initializing,
    /// Every component has been initialized and started.
    Initialized,
    /// Deletion is in progress.
    Terminating,
    Deleted,
}

/// Raised at the entity, then broadcast, before its components are torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityTerminating {
    pub entity: EntityUid,
}

/// Broadcast once an entity is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDeleted {
    pub entity: EntityUid,
}

/// Per-entity bookkeeping owned by the allocator.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    pub name: Option<String>,
    pub prototype: Option<String>,
    pub life_stage: EntityLifeStage,
    pub creation_tick: GameTick,
    pub last_modified_tick: GameTick,
    /// Concrete component types in the order they were added.
    pub(crate) components: Vec<TypeId>,
}

/// Issues entity ids and tracks the live set.
pub struct EntityAllocator {
    next: u64,
    alive: BTreeMap<EntityUid, EntityMeta>,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            alive: BTreeMap::new(),
        }
    }

    /// Allocate a fresh entity in the `PreInit` stage.
    pub fn allocate(&mut self, tick: GameTick) -> EntityUid {
        let uid = EntityUid(self.next);
        self.next += 1;
        self.alive.insert(
            uid,
            EntityMeta {
                name: None,
                prototype: None,
                life_stage: EntityLifeStage::PreInit,
                creation_tick: tick,
                last_modified_tick: tick,
                components: Vec::new(),
            },
        );
        uid
    }

    /// Drop an entity from the live set. Returns its metadata if it was alive.
    pub fn deallocate(&mut self, uid: EntityUid) -> Option<EntityMeta> {
        self.alive.remove(&uid)
    }

    pub fn is_alive(&self, uid: EntityUid) -> bool {
        self.alive.contains_key(&uid)
    }

    pub fn meta(&self, uid: EntityUid) -> Option<&EntityMeta> {
        self.alive.get(&uid)
    }

    pub fn meta_mut(&mut self, uid: EntityUid) -> Option<&mut EntityMeta> {
        self.alive.get_mut(&uid)
    }

    /// Live entities in creation order.
    pub fn iter(&self) -> impl Iterator<Item = EntityUid> + '_ {
        self.alive.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.alive.len()
    }
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}
