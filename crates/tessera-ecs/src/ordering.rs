//! Deterministic topological ordering of systems.
//!
//! Used for handler order within one event type and for the global update
//! order. Unconstrained keys keep their first-seen order.

use std::any::{type_name, TypeId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::hash::Hash;

use crate::error::{EcsError, EcsResult};

/// Identifies a system type. Used as subscriber identity and ordering key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemKey {
    id: TypeId,
    name: &'static str,
}

impl SystemKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: short_type_name(type_name::<T>()),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for SystemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for SystemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Ordering constraints of one subscription: its key plus the systems it
/// must run before or after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOrdering {
    key: SystemKey,
    before: Vec<SystemKey>,
    after: Vec<SystemKey>,
}

impl EventOrdering {
    pub fn new(key: SystemKey) -> Self {
        Self {
            key,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Ordering keyed by system type `S`.
    pub fn of<S: ?Sized + 'static>() -> Self {
        Self::new(SystemKey::of::<S>())
    }

    pub fn before<T: ?Sized + 'static>(self) -> Self {
        self.before_key(SystemKey::of::<T>())
    }

    pub fn after<T: ?Sized + 'static>(self) -> Self {
        self.after_key(SystemKey::of::<T>())
    }

    pub fn before_key(mut self, key: SystemKey) -> Self {
        self.before.push(key);
        self
    }

    pub fn after_key(mut self, key: SystemKey) -> Self {
        self.after.push(key);
        self
    }

    pub fn key(&self) -> SystemKey {
        self.key
    }

    pub(crate) fn constraints(&self) -> (SystemKey, &[SystemKey], &[SystemKey]) {
        (self.key, &self.before, &self.after)
    }
}

/// Kahn's algorithm over `nodes`, where an edge `(a, b)` means `a` comes
/// first. Ready nodes are taken in their original order. On a cycle the
/// nodes that could not be placed are returned.
pub(crate) fn topological_sort<K: Copy + Eq + Hash>(nodes: &[K], edges: &[(K, K)]) -> Result<Vec<K>, Vec<K>> {
    let index: HashMap<K, usize> = nodes.iter().enumerate().map(|(i, &k)| (k, i)).collect();
    let mut indegree = vec![0usize; nodes.len()];
    let mut successors = vec![Vec::new(); nodes.len()];

    for (from, to) in edges {
        let (Some(&from), Some(&to)) = (index.get(from), index.get(to)) else {
            continue;
        };
        successors[from].push(to);
        indegree[to] += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..nodes.len())
        .filter(|&i| indegree[i] == 0)
        .map(Reverse)
        .collect();
    let mut sorted = Vec::with_capacity(nodes.len());

    while let Some(Reverse(node)) = ready.pop() {
        sorted.push(nodes[node]);
        for &next in &successors[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if sorted.len() == nodes.len() {
        Ok(sorted)
    } else {
        Err((0..nodes.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| nodes[i])
            .collect())
    }
}

/// Order the distinct keys among `entries` by their before/after constraints.
/// Constraints naming keys that are not present are ignored.
pub(crate) fn order_keys<'a>(
    context: &str,
    entries: impl IntoIterator<Item = (SystemKey, &'a [SystemKey], &'a [SystemKey])>,
) -> EcsResult<Vec<SystemKey>> {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();

    for (key, before, after) in entries {
        if !nodes.contains(&key) {
            nodes.push(key);
        }
        edges.extend(after.iter().map(|&a| (a, key)));
        edges.extend(before.iter().map(|&b| (key, b)));
    }

    topological_sort(&nodes, &edges).map_err(|members| EcsError::OrderingCycle {
        context: context.to_string(),
        members: members.iter().map(|k| k.name()).collect(),
    })
}
