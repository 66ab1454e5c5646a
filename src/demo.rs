//! Headless demo world: drifters that move, age and expire.

use std::cell::Cell;

use serde::Deserialize;
use tessera_core::{Transform, Vec2};
use tessera_ecs::{
    Component, ComponentRegistry, Dep, Dependencies, EcsConfig, EcsResult, EntityDeleted, EntityManager,
    EntitySystem, EntityUid, Registrar, RegistrationBuilder, Subscriptions, SystemKey,
};
use tracing::{debug, info};

pub const PROTOTYPES: &str = r#"
[[prototypes]]
id = "drifter"
name = "Drifter"

[[prototypes.components]]
type = "Transform"

[[prototypes.components]]
type = "Velocity"
linear = [1.0, 0.0]
angular = 0.5

[[prototypes.components]]
type = "Lifetime"
ticks = 90

[[prototypes]]
id = "marker"
name = "Marker"

[[prototypes.components]]
type = "Transform"
"#;

// ---- Components ----

/// Moves the sibling transform every tick.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Velocity {
    pub linear: Vec2,
    pub angular: f32,
    #[serde(skip)]
    pub transform: Dep<Transform>,
}

impl Component for Velocity {
    fn declare_dependencies(deps: &mut Dependencies<Self>) {
        deps.field(|c| &mut c.transform);
    }
}

/// Ticks left before the entity expires.
#[derive(Debug, Default, Deserialize)]
pub struct Lifetime {
    pub ticks: u32,
}

impl Component for Lifetime {}

/// Raised at an entity whose lifetime ran out.
#[derive(Debug, Clone, Copy)]
pub struct Expired;

pub fn registry() -> EcsResult<ComponentRegistry> {
    let table: &[Registrar] = &[
        |r| r.register_with(RegistrationBuilder::<Transform>::new().with_data()),
        |r| r.register_with(RegistrationBuilder::<Velocity>::new().with_data().networked()),
        |r| r.register_with(RegistrationBuilder::<Lifetime>::new().with_data().networked()),
    ];
    let mut registry = ComponentRegistry::from_table(table)?;
    registry.generate_net_ids();
    Ok(registry)
}

// ---- Systems ----

#[derive(Default)]
pub struct MovementSystem;

impl EntitySystem for MovementSystem {
    fn update(&self, em: &mut EntityManager, frame_time: f32) {
        let moves: Vec<(Dep<Transform>, Vec2, f32)> = em
            .entity_query::<Velocity>()
            .map(|(_, v)| (v.transform, v.linear * frame_time, v.angular * frame_time))
            .collect();
        for (transform, offset, spin) in moves {
            if let Some(transform) = em.resolve_mut(&transform) {
                transform.translate(offset);
                transform.rotate(spin);
            }
        }
    }
}

#[derive(Default)]
pub struct LifetimeSystem;

impl EntitySystem for LifetimeSystem {
    fn initialize(&self, subs: &mut Subscriptions<'_, Self>) -> EcsResult<()> {
        subs.local::<Lifetime, Expired>()
            .by_value(|_, em, uid, _| em.queue_delete_entity(uid))
    }

    fn update(&self, em: &mut EntityManager, _frame_time: f32) {
        let mut expired = Vec::new();
        for (uid, lifetime) in em.entity_query_mut::<Lifetime>() {
            lifetime.ticks = lifetime.ticks.saturating_sub(1);
            if lifetime.ticks == 0 {
                expired.push(uid);
            }
        }
        for uid in expired {
            em.raise_local_event(uid, &mut Expired);
        }
    }

    fn updates_after(&self) -> Vec<SystemKey> {
        vec![SystemKey::of::<MovementSystem>()]
    }
}

/// Counts expirations.
#[derive(Default)]
pub struct StatsSystem {
    deleted: Cell<u32>,
}

impl StatsSystem {
    pub fn deleted(&self) -> u32 {
        self.deleted.get()
    }
}

impl EntitySystem for StatsSystem {
    fn initialize(&self, subs: &mut Subscriptions<'_, Self>) -> EcsResult<()> {
        subs.broadcast::<EntityDeleted>().by_value(|stats, _, ev| {
            stats.deleted.set(stats.deleted.get() + 1);
            debug!("Entity {} expired", ev.entity);
        })
    }

    fn shutdown(&self, _em: &mut EntityManager) {
        info!("{} entities expired", self.deleted.get());
    }
}

// ---- World ----

/// Build an entity manager with the demo components, prototypes and systems.
pub fn build_world(config: EcsConfig) -> EcsResult<EntityManager> {
    let mut em = EntityManager::with_config(registry()?, config);
    em.prototypes_mut().load_str(PROTOTYPES)?;
    em.systems_mut().register::<MovementSystem>()?;
    em.systems_mut().register::<LifetimeSystem>()?;
    em.systems_mut().register::<StatsSystem>()?;
    em.initialize_systems()?;
    Ok(em)
}

/// Spawn drifters fanned out around the origin with staggered lifetimes.
pub fn spawn_drifters(em: &mut EntityManager, count: u32) -> EcsResult<Vec<EntityUid>> {
    let mut spawned = Vec::with_capacity(count as usize);
    for i in 0..count {
        let uid = em.spawn_entity(Some("drifter"))?;
        let angle = i as f32 / count.max(1) as f32 * std::f32::consts::TAU;
        em.get_component_mut::<Velocity>(uid)?.linear = Vec2::from_angle(angle);
        em.get_component_mut::<Lifetime>(uid)?.ticks += i * 5;
        spawned.push(uid);
    }
    em.spawn_entity(Some("marker"))?;
    info!("Spawned {} drifters", count);
    Ok(spawned)
}
