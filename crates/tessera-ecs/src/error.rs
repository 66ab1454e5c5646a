use crate::entity::EntityUid;

/// Result alias used throughout the ECS.
pub type EcsResult<T> = Result<T, EcsError>;

/// Errors raised by the ECS runtime.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    // ---- Registry ----
    #[error("unknown component type '{0}'")]
    UnknownComponentType(String),

    #[error("component type {0} is not registered")]
    UnregisteredComponent(&'static str),

    #[error("no component is registered with net id {0}")]
    UnknownNetId(u16),

    #[error("component type {0} is already registered")]
    DuplicateRegistration(&'static str),

    #[error("component name '{name}' is already used by {existing}")]
    DuplicateComponentName { name: String, existing: &'static str },

    #[error("reference type {reference} is already provided by {existing}, cannot also route it to {component}")]
    DuplicateReference {
        reference: &'static str,
        existing: &'static str,
        component: &'static str,
    },

    #[error("net id {net_id} is already assigned to {existing}")]
    DuplicateNetId { net_id: u16, existing: &'static str },

    // ---- Dependency wiring ----
    #[error("dependency of {component} on {target} is a value type and can never be cleared")]
    DependencyValueType {
        component: &'static str,
        target: &'static str,
    },

    #[error("dependency of {component} on {target} is not nullable and can never be cleared")]
    DependencyNotNullable {
        component: &'static str,
        target: &'static str,
    },

    // ---- Entities and components ----
    #[error("entity {0} does not exist")]
    EntityNotFound(EntityUid),

    #[error("entity {entity} has no {component} component")]
    ComponentNotFound {
        entity: EntityUid,
        component: &'static str,
    },

    #[error("entity {entity} already has a {component} component")]
    DuplicateComponent {
        entity: EntityUid,
        component: &'static str,
    },

    #[error("failed to create entity from prototype '{prototype}': {source}")]
    EntityCreation {
        prototype: String,
        #[source]
        source: Box<EcsError>,
    },

    #[error("invalid data for component '{component}': {source}")]
    ComponentData {
        component: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("component '{0}' does not accept prototype data")]
    ComponentNotDeserializable(String),

    #[error("unknown prototype '{0}'")]
    UnknownPrototype(String),

    #[error("invalid prototype data: {0}")]
    InvalidPrototypeData(#[from] toml::de::Error),

    // ---- Events ----
    #[error("event {event} is subscribed {existing}, cannot also subscribe it {requested}")]
    MixedEventMode {
        event: &'static str,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("{subscriber} already subscribes to {event} on {target}")]
    DuplicateSubscription {
        subscriber: &'static str,
        event: &'static str,
        target: &'static str,
    },

    #[error("ordering cycle in {context}: {members:?}")]
    OrderingCycle {
        context: String,
        members: Vec<&'static str>,
    },

    #[error("cannot await the same event type twice: {0}")]
    AlreadyAwaiting(&'static str),

    // ---- Systems ----
    #[error("system {0} is not registered")]
    UnknownSystem(&'static str),

    #[error("{requested} is provided by more than one system: {candidates:?}")]
    AmbiguousSystem {
        requested: &'static str,
        candidates: Vec<&'static str>,
    },

    #[error("system {0} is already registered")]
    DuplicateSystem(&'static str),

    #[error("system dependency cycle while constructing {0}")]
    SystemDependencyCycle(&'static str),

    #[error("systems are already initialized")]
    SystemsAlreadyInitialized,

    #[error("service {0} has not been provided")]
    UnknownService(&'static str),
}

impl EcsError {
    /// Wrap an error raised while building an entity from a prototype.
    pub fn entity_creation(prototype: impl Into<String>, source: EcsError) -> Self {
        EcsError::EntityCreation {
            prototype: prototype.into(),
            source: Box::new(source),
        }
    }

    /// The innermost cause, looking through `EntityCreation` wrappers.
    pub fn root_cause(&self) -> &EcsError {
        match self {
            EcsError::EntityCreation { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
