//! End-to-end scenarios across registry, wiring, bus, systems and the
//! entity manager.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::FutureExt;
use tessera_core::{Transform, Vec2};

use crate::*;

// ---- Components ----

trait TestTrait {
    fn value(&self) -> i32;
}

#[derive(Default)]
struct TestOne {
    two: Dep<TestTwo>,
    three: Dep<TestThree>,
    four: Dep<TestFour>,
}

impl Component for TestOne {
    fn declare_dependencies(deps: &mut Dependencies<Self>) {
        deps.field(|c| &mut c.two);
        deps.field(|c| &mut c.three);
        deps.field(|c| &mut c.four);
    }
}

#[derive(Default)]
struct TestTwo {
    own: Dep<TestTwo>,
    transform: Dep<Transform>,
}

impl Component for TestTwo {
    fn declare_dependencies(deps: &mut Dependencies<Self>) {
        deps.field(|c| &mut c.own);
        deps.field(|c| &mut c.transform);
    }
}

#[derive(Default)]
struct TestThree {
    one: Dep<TestOne>,
}

impl Component for TestThree {
    fn declare_dependencies(deps: &mut Dependencies<Self>) {
        deps.field(|c| &mut c.one);
    }
}

#[derive(Default, serde::Deserialize)]
#[serde(default)]
struct TestInterface {
    value: i32,
}

impl Component for TestInterface {}

impl TestTrait for TestInterface {
    fn value(&self) -> i32 {
        self.value
    }
}

#[derive(Default)]
struct SecondInterface;

impl Component for SecondInterface {}

impl TestTrait for SecondInterface {
    fn value(&self) -> i32 {
        -1
    }
}

#[derive(Default)]
struct TestFour {
    interface: Dep<dyn TestTrait>,
    attached: u32,
    detached: u32,
}

impl Component for TestFour {
    fn declare_dependencies(deps: &mut Dependencies<Self>) {
        deps.field(|c| &mut c.interface)
            .on_added(|c, _| c.attached += 1)
            .on_removed(|c, _| c.detached += 1);
    }
}

#[derive(Default)]
struct BadValue {
    count: i32,
}

impl Component for BadValue {
    fn declare_dependencies(deps: &mut Dependencies<Self>) {
        deps.field(|c| &mut c.count);
    }
}

/// Another holder of `TestTwo`, alongside `TestOne`.
#[derive(Default)]
struct Watcher {
    two: Dep<TestTwo>,
    transform: Dep<Transform>,
}

impl Component for Watcher {
    fn declare_dependencies(deps: &mut Dependencies<Self>) {
        deps.field(|c| &mut c.two);
        deps.field(|c| &mut c.transform);
    }
}

struct Strict {
    plain: Required<Plain>,
}

impl Default for Strict {
    fn default() -> Self {
        let placeholder = ComponentId::new(EntityUid::from_raw(0), TypeId::of::<Plain>(), 0);
        Self {
            plain: Required::new(placeholder),
        }
    }
}

impl Component for Strict {
    fn declare_dependencies(deps: &mut Dependencies<Self>) {
        deps.field(|c| &mut c.plain);
    }
}

#[derive(Default)]
struct Plain;

impl Component for Plain {}

#[derive(Default)]
struct Other;

impl Component for Other {}

const PROTOTYPES: &str = r#"
[[prototypes]]
id = "dummyOne"
name = "Dummy"

[[prototypes.components]]
type = "Transform"
position = [1.0, 2.0]

[[prototypes.components]]
type = "TestOne"

[[prototypes.components]]
type = "TestTwo"

[[prototypes.components]]
type = "TestThree"

[[prototypes.components]]
type = "TestInterface"
value = 7

[[prototypes.components]]
type = "TestFour"

[[prototypes]]
id = "badValue"

[[prototypes.components]]
type = "Plain"

[[prototypes.components]]
type = "BadValue"

[[prototypes]]
id = "strict"

[[prototypes.components]]
type = "Plain"

[[prototypes.components]]
type = "Strict"

[[prototypes]]
id = "badData"

[[prototypes.components]]
type = "Transform"
rotation = "north"

[[prototypes]]
id = "plainWithData"

[[prototypes.components]]
type = "Plain"
size = 3

[[prototypes]]
id = "lowercase"

[[prototypes.components]]
type = "testone"
"#;

fn registry() -> ComponentRegistry {
    let table: &[Registrar] = &[
        |r| r.register_with(RegistrationBuilder::<Transform>::new().with_data()),
        |r| r.register::<TestOne>(),
        |r| r.register::<TestTwo>(),
        |r| r.register::<TestThree>(),
        |r| r.register::<TestFour>(),
        |r| {
            r.register_with(
                RegistrationBuilder::<TestInterface>::new()
                    .with_data()
                    .reference::<dyn TestTrait>(|c| c, |c| c),
            )
        },
        |r| {
            r.register_with(
                RegistrationBuilder::<SecondInterface>::new()
                    .reference::<dyn TestTrait>(|c| c, |c| c)
                    .allow_reference_override(),
            )
        },
        |r| r.register::<BadValue>(),
        |r| r.register::<Watcher>(),
        |r| r.register::<Strict>(),
        |r| r.register::<Plain>(),
        |r| r.register::<Other>(),
    ];
    ComponentRegistry::from_table(table).unwrap()
}

fn manager() -> EntityManager {
    let mut em = EntityManager::new(registry());
    em.prototypes_mut().load_str(PROTOTYPES).unwrap();
    em
}

// ---- Dependency wiring ----

#[test]
fn dependencies_resolve_regardless_of_add_order() {
    let mut em = manager();
    let orders: [&[&str]; 3] = [&["one", "two", "three"], &["two", "one", "three"], &["three", "two", "one"]];

    for order in orders {
        let uid = em.spawn_entity(None).unwrap();
        for name in order {
            match *name {
                "one" => em.add_component(uid, TestOne::default()).unwrap(),
                "two" => em.add_component(uid, TestTwo::default()).unwrap(),
                _ => em.add_component(uid, TestThree::default()).unwrap(),
            };
        }
        let two = em.component_id::<TestTwo>(uid).unwrap();
        let three = em.component_id::<TestThree>(uid).unwrap();
        let one = em.get_component::<TestOne>(uid).unwrap();
        assert!(one.two.points_to(two), "order {:?}", order);
        assert!(one.three.points_to(three), "order {:?}", order);
    }
}

#[test]
fn removal_nulls_dependents_synchronously() {
    let mut em = manager();
    let uid = em.spawn_entity(None).unwrap();
    em.add_component(uid, TestOne::default()).unwrap();
    em.add_component(uid, TestTwo::default()).unwrap();
    let three = em.add_component(uid, TestThree::default()).unwrap();

    em.remove_component::<TestTwo>(uid).unwrap();
    let one = em.get_component::<TestOne>(uid).unwrap();
    assert!(!one.two.is_resolved());
    assert!(one.three.points_to(three));

    // Deferred removal unwires just the same, before any cull.
    em.remove_component_deferred::<TestThree>(uid).unwrap();
    assert!(!em.get_component::<TestOne>(uid).unwrap().three.is_resolved());
}

#[test]
fn removal_nulls_every_dependent() {
    let mut em = manager();
    let uid = em.spawn_entity(None).unwrap();
    let transform = em.add_component(uid, Transform::default()).unwrap();
    em.add_component(uid, TestOne::default()).unwrap();
    em.add_component(uid, Watcher::default()).unwrap();
    let two = em.add_component(uid, TestTwo::default()).unwrap();
    assert!(em.get_component::<TestOne>(uid).unwrap().two.points_to(two));
    assert!(em.get_component::<Watcher>(uid).unwrap().two.points_to(two));

    em.remove_component::<TestTwo>(uid).unwrap();
    assert!(!em.get_component::<TestOne>(uid).unwrap().two.is_resolved());
    let watcher = em.get_component::<Watcher>(uid).unwrap();
    assert!(!watcher.two.is_resolved());
    assert!(watcher.transform.points_to(transform));
}

#[test]
fn self_dependency_resolves_to_own_instance() {
    let mut em = manager();
    let uid = em.spawn_entity(None).unwrap();
    let id = em.add_component(uid, TestTwo::default()).unwrap();

    let two = em.get_component::<TestTwo>(uid).unwrap();
    assert!(two.own.points_to(id));
    let own = two.own;
    assert!(em.resolve(&own).is_some());
}

#[test]
fn dummy_one_is_fully_wired_after_spawn() {
    let mut em = manager();
    let uid = em.spawn_entity(Some("dummyOne")).unwrap();
    assert_eq!(em.entity_name(uid), Some("Dummy"));
    assert_eq!(em.entity_meta(uid).and_then(|m| m.prototype.as_deref()), Some("dummyOne"));

    let transform = em.component_id::<Transform>(uid).unwrap();
    let one_id = em.component_id::<TestOne>(uid).unwrap();
    let two_id = em.component_id::<TestTwo>(uid).unwrap();
    let four_id = em.component_id::<TestFour>(uid).unwrap();

    let one = em.get_component::<TestOne>(uid).unwrap();
    assert!(one.two.points_to(two_id));
    assert!(one.four.points_to(four_id));

    let two = em.get_component::<TestTwo>(uid).unwrap();
    assert!(two.own.points_to(two_id));
    assert!(two.transform.points_to(transform));

    let three = em.get_component::<TestThree>(uid).unwrap();
    assert!(three.one.points_to(one_id));

    let four = em.get_component::<TestFour>(uid).unwrap();
    let interface = four.interface;
    assert_eq!(four.attached, 1);
    assert_eq!(em.resolve(&interface).map(|t| t.value()), Some(7));

    assert_eq!(em.get_component::<Transform>(uid).unwrap().position, Vec2::new(1.0, 2.0));
    for id in [transform, one_id, two_id, four_id] {
        assert_eq!(em.component_life_stage(id), ComponentLifeStage::Running);
    }
}

#[test]
fn interface_dependency_prefers_earliest_provider() {
    let mut em = manager();
    let uid = em.spawn_entity(None).unwrap();
    em.add_component(uid, TestFour::default()).unwrap();
    let first = em.add_component(uid, TestInterface { value: 3 }).unwrap();
    let second = em.add_component(uid, SecondInterface).unwrap();

    assert!(em.get_component::<TestFour>(uid).unwrap().interface.points_to(first));
    assert_eq!(em.try_get_reference::<dyn TestTrait>(uid).map(|t| t.value()), Some(3));

    em.remove_component::<TestInterface>(uid).unwrap();
    let four = em.get_component::<TestFour>(uid).unwrap();
    assert!(four.interface.points_to(second));
    assert_eq!((four.attached, four.detached), (2, 1));
    assert_eq!(em.try_get_reference::<dyn TestTrait>(uid).map(|t| t.value()), Some(-1));
}

#[test]
fn value_dependency_fails_entity_creation() {
    let mut em = manager();
    let err = em.spawn_entity(Some("badValue")).unwrap_err();
    assert!(matches!(err, EcsError::EntityCreation { ref prototype, .. } if prototype == "badValue"));
    assert!(matches!(err.root_cause(), EcsError::DependencyValueType { .. }));
    // The half-built entity is torn down.
    assert_eq!(em.entity_count(), 0);
}

#[test]
fn non_nullable_dependency_fails_entity_creation() {
    let mut em = manager();
    let err = em.spawn_entity(Some("strict")).unwrap_err();
    assert!(matches!(err, EcsError::EntityCreation { ref prototype, .. } if prototype == "strict"));
    assert!(matches!(err.root_cause(), EcsError::DependencyNotNullable { .. }));
    assert_eq!(em.entity_count(), 0);
}

#[test]
fn bad_prototype_data_is_wrapped() {
    let mut em = manager();
    let err = em.spawn_entity(Some("badData")).unwrap_err();
    assert!(matches!(err.root_cause(), EcsError::ComponentData { .. }));

    let err = em.spawn_entity(Some("plainWithData")).unwrap_err();
    assert!(matches!(err.root_cause(), EcsError::ComponentNotDeserializable(_)));

    let err = em.spawn_entity(Some("lowercase")).unwrap_err();
    assert!(matches!(err.root_cause(), EcsError::UnknownComponentType(_)));

    assert!(matches!(
        em.spawn_entity(Some("missing")),
        Err(EcsError::UnknownPrototype(_))
    ));
    assert_eq!(em.entity_count(), 0);
}

#[test]
fn case_insensitive_component_names() {
    let config = EcsConfig {
        ignore_case_component_names: true,
        ..EcsConfig::default()
    };
    let mut em = EntityManager::with_config(registry(), config);
    em.prototypes_mut().load_str(PROTOTYPES).unwrap();
    let uid = em.spawn_entity(Some("lowercase")).unwrap();
    assert!(em.has_component::<TestOne>(uid));
}

#[test]
fn re_added_component_is_a_new_instance() {
    let mut em = manager();
    let uid = em.spawn_entity(None).unwrap();
    em.add_component(uid, TestThree::default()).unwrap();
    let first = em.add_component(uid, TestOne::default()).unwrap();
    assert!(em.get_component::<TestThree>(uid).unwrap().one.points_to(first));

    em.remove_component_deferred::<TestOne>(uid).unwrap();
    assert_eq!(em.cull_removed_components(), 1);
    assert_eq!(em.component_life_stage(first), ComponentLifeStage::Deleted);

    let second = em.add_component(uid, TestOne::default()).unwrap();
    assert_ne!(first, second);
    let three = em.get_component::<TestThree>(uid).unwrap();
    assert!(three.one.points_to(second));
    assert!(!three.one.points_to(first));
}

// ---- Events and systems ----

#[derive(Debug, Default, Clone)]
struct Ping(Vec<&'static str>);

#[derive(Default)]
struct SysA;
#[derive(Default)]
struct SysB;
#[derive(Default)]
struct SysC;
#[derive(Default)]
struct SysD;

impl EntitySystem for SysA {
    fn initialize(&self, subs: &mut Subscriptions<'_, Self>) -> EcsResult<()> {
        subs.broadcast::<Ping>().by_ref(|_, _, ev| ev.0.push("A"))
    }
}

impl EntitySystem for SysB {
    fn initialize(&self, subs: &mut Subscriptions<'_, Self>) -> EcsResult<()> {
        subs.broadcast::<Ping>().after::<SysA>().by_ref(|_, _, ev| ev.0.push("B"))
    }
}

impl EntitySystem for SysC {
    fn initialize(&self, subs: &mut Subscriptions<'_, Self>) -> EcsResult<()> {
        subs.broadcast::<Ping>().before::<SysB>().by_ref(|_, _, ev| ev.0.push("C"))
    }
}

impl EntitySystem for SysD {
    fn initialize(&self, subs: &mut Subscriptions<'_, Self>) -> EcsResult<()> {
        subs.broadcast::<Ping>()
            .after::<SysA>()
            .before::<SysC>()
            .by_ref(|_, _, ev| ev.0.push("D"))
    }
}

#[test]
fn handlers_follow_ordering_constraints() {
    let mut em = manager();
    em.systems_mut().register::<SysA>().unwrap();
    em.systems_mut().register::<SysB>().unwrap();
    em.systems_mut().register::<SysC>().unwrap();
    em.systems_mut().register::<SysD>().unwrap();
    em.initialize_systems().unwrap();

    let mut ping = Ping::default();
    em.raise_event(&mut ping);
    assert_eq!(ping.0, vec!["A", "D", "C", "B"]);
}

#[derive(Default)]
struct ByRef;
#[derive(Default)]
struct ByValue;

impl EntitySystem for ByRef {
    fn initialize(&self, subs: &mut Subscriptions<'_, Self>) -> EcsResult<()> {
        subs.broadcast::<Ping>().by_ref(|_, _, _| {})
    }
}

impl EntitySystem for ByValue {
    fn initialize(&self, subs: &mut Subscriptions<'_, Self>) -> EcsResult<()> {
        subs.local::<Plain, Ping>().by_value(|_, _, _, _| {})
    }
}

#[test]
fn mixed_modes_fail_initialization() {
    let mut em = manager();
    em.systems_mut().register::<ByRef>().unwrap();
    em.systems_mut().register::<ByValue>().unwrap();
    assert!(matches!(
        em.initialize_systems(),
        Err(EcsError::MixedEventMode { event: "Ping", .. })
    ));

    // Nothing stays subscribed, so a retry hits the same conflict rather
    // than a duplicate subscription.
    assert_eq!(em.event_bus().subscription_count::<Ping>(), 0);
    assert!(!em.systems().is_initialized());
    assert!(matches!(
        em.initialize_systems(),
        Err(EcsError::MixedEventMode { event: "Ping", .. })
    ));
}

#[test]
fn failed_initialization_can_be_retried() {
    let mut em = manager();
    em.event_bus_mut()
        .subscribe_event_by_value::<Ping>(EventOrdering::of::<First>(), |_, _| {})
        .unwrap();
    em.systems_mut().register::<SysA>().unwrap();
    assert!(em.initialize_systems().is_err());

    em.event_bus_mut().unsubscribe_event::<Ping>(SystemKey::of::<First>());
    em.initialize_systems().unwrap();
    assert!(em.systems().is_initialized());

    let mut ping = Ping::default();
    em.raise_event(&mut ping);
    assert_eq!(ping.0, vec!["A"]);
}

#[test]
fn by_value_handlers_get_their_own_copy() {
    let mut em = manager();
    let uid = em.spawn_entity(None).unwrap();
    em.add_component(uid, Plain).unwrap();
    let seen = Rc::new(Cell::new(0));
    let sink = seen.clone();
    em.event_bus_mut()
        .subscribe_local_event_by_value::<Plain, Ping>(EventOrdering::of::<SysA>(), move |_, _, mut ev| {
            ev.0.push("mutated");
            sink.set(ev.0.len());
        })
        .unwrap();

    let mut ping = Ping(vec!["caller"]);
    em.raise_local_event(uid, &mut ping);
    assert_eq!(seen.get(), 2);
    assert_eq!(ping.0, vec!["caller"]);

    // No handler for entities without the component.
    let bare = em.spawn_entity(None).unwrap();
    em.raise_local_event(bare, &mut ping);
    assert_eq!(seen.get(), 2);
}

#[derive(Debug, Clone, Copy)]
struct Poke;

#[test]
fn deferred_removal_from_handler_is_reentrant() {
    let mut em = manager();
    let removals = Rc::new(RefCell::new(Vec::new()));
    let bus = em.event_bus_mut();
    bus.subscribe_local_event::<Plain, Poke>(EventOrdering::of::<SysA>(), |em, uid, _| {
        em.remove_component_deferred::<Plain>(uid).unwrap();
        em.remove_component_deferred::<Other>(uid).unwrap();
        em.queue_delete_entity(uid);
    })
    .unwrap();
    let sink = removals.clone();
    bus.subscribe_local_event::<Plain, ComponentRemove>(EventOrdering::of::<SysA>(), move |_, _, _| {
        sink.borrow_mut().push("Plain")
    })
    .unwrap();
    let sink = removals.clone();
    bus.subscribe_local_event::<Other, ComponentRemove>(EventOrdering::of::<SysA>(), move |_, _, _| {
        sink.borrow_mut().push("Other")
    })
    .unwrap();

    let uid = em.spawn_entity(None).unwrap();
    let plain = em.add_component(uid, Plain).unwrap();
    let other = em.add_component(uid, Other).unwrap();

    em.raise_local_event(uid, &mut Poke);
    assert_eq!(em.component_life_stage(plain), ComponentLifeStage::Stopped);
    assert_eq!(em.component_life_stage(other), ComponentLifeStage::Stopped);
    assert!(em.entity_exists(uid));

    em.tick_update(0.0);
    assert_eq!(em.component_life_stage(plain), ComponentLifeStage::Deleted);
    assert_eq!(em.component_life_stage(other), ComponentLifeStage::Deleted);
    assert!(!em.entity_exists(uid));
    assert_eq!(*removals.borrow(), vec!["Plain", "Other"]);
}

#[test]
fn entity_deleted_during_component_removal() {
    let mut em = manager();
    let terminating = Rc::new(Cell::new(0));
    let bus = em.event_bus_mut();
    bus.subscribe_local_event::<Plain, Poke>(EventOrdering::of::<SysA>(), |em, uid, _| {
        em.remove_component_deferred::<Plain>(uid).unwrap();
        em.remove_component_deferred::<Other>(uid).unwrap();
        em.queue_delete_entity(uid);
    })
    .unwrap();
    bus.subscribe_local_event::<Other, ComponentRemove>(EventOrdering::of::<SysA>(), |em, uid, _| {
        em.delete_entity(uid)
    })
    .unwrap();
    let count = terminating.clone();
    bus.subscribe_event::<EntityTerminating>(EventOrdering::of::<SysA>(), move |_, _| count.set(count.get() + 1))
        .unwrap();

    let uid = em.spawn_entity(None).unwrap();
    em.add_component(uid, Plain).unwrap();
    em.add_component(uid, Other).unwrap();

    em.raise_local_event(uid, &mut Poke);
    assert!(!em.entity_exists(uid));
    em.tick_update(0.0);
    assert_eq!(terminating.get(), 1);
    assert_eq!(em.entity_count(), 0);
}

struct First;
struct Second;

#[derive(Debug, Clone, Copy)]
struct Kill(EntityUid);

#[test]
fn dispatch_continues_after_target_is_deleted() {
    let mut em = manager();
    let observed = Rc::new(RefCell::new(None));
    let bus = em.event_bus_mut();
    bus.subscribe_event::<Kill>(EventOrdering::of::<First>(), |em, ev| em.delete_entity(ev.0))
        .unwrap();
    let sink = observed.clone();
    bus.subscribe_event::<Kill>(EventOrdering::of::<Second>().after::<First>(), move |em, ev| {
        *sink.borrow_mut() = Some((em.entity_exists(ev.0), em.has_component::<Plain>(ev.0)))
    })
    .unwrap();

    let uid = em.spawn_entity(None).unwrap();
    em.add_component(uid, Plain).unwrap();
    em.raise_event(&mut Kill(uid));
    assert_eq!(*observed.borrow(), Some((false, false)));
}

#[test]
fn overwrite_yields_to_replacement_added_by_remove_handler() {
    let mut em = manager();
    let removed = Rc::new(RefCell::new(Vec::new()));
    let replaced = Rc::new(Cell::new(false));
    let sink = removed.clone();
    let once = replaced.clone();
    em.event_bus_mut()
        .subscribe_local_event::<TestInterface, ComponentRemove>(EventOrdering::of::<First>(), move |em, uid, ev| {
            sink.borrow_mut().push(ev.component);
            if !once.replace(true) {
                em.add_component(uid, TestInterface { value: 99 }).unwrap();
            }
        })
        .unwrap();

    let uid = em.spawn_entity(None).unwrap();
    let original = em.add_component(uid, TestInterface { value: 1 }).unwrap();
    let err = em
        .add_component_overwrite(uid, TestInterface { value: 2 })
        .unwrap_err();
    assert!(matches!(err, EcsError::DuplicateComponent { .. }));

    // The handler's instance survives untouched and was never removed.
    let current = em.component_id::<TestInterface>(uid).unwrap();
    assert_ne!(current, original);
    assert_eq!(em.get_component::<TestInterface>(uid).unwrap().value, 99);
    assert_eq!(em.component_life_stage(current), ComponentLifeStage::Running);
    assert_eq!(em.component_life_stage(original), ComponentLifeStage::Deleted);
    assert_eq!(*removed.borrow(), vec![original]);
}

#[test]
fn directed_event_can_also_broadcast() {
    let mut em = manager();
    let bus = em.event_bus_mut();
    bus.subscribe_local_event::<Plain, Ping>(EventOrdering::of::<First>(), |_, _, ev| ev.0.push("local"))
        .unwrap();
    bus.subscribe_event::<Ping>(EventOrdering::of::<Second>(), |_, ev| ev.0.push("broadcast"))
        .unwrap();

    let uid = em.spawn_entity(None).unwrap();
    em.add_component(uid, Plain).unwrap();
    let mut ping = Ping::default();
    em.raise_local_event_broadcast(uid, &mut ping);
    assert_eq!(ping.0, vec!["local", "broadcast"]);

    // Entities without a directed subscriber still reach broadcast handlers.
    let bare = em.spawn_entity(None).unwrap();
    let mut ping = Ping::default();
    em.raise_local_event_broadcast(bare, &mut ping);
    assert_eq!(ping.0, vec!["broadcast"]);
}

#[test]
fn terminating_is_directed_then_broadcast() {
    let mut em = manager();
    let log = Rc::new(RefCell::new(Vec::new()));
    let bus = em.event_bus_mut();
    let sink = log.clone();
    bus.subscribe_local_event::<Plain, EntityTerminating>(EventOrdering::of::<First>(), move |_, _, _| {
        sink.borrow_mut().push("local")
    })
    .unwrap();
    let sink = log.clone();
    bus.subscribe_event::<EntityTerminating>(EventOrdering::of::<Second>(), move |_, _| {
        sink.borrow_mut().push("broadcast")
    })
    .unwrap();

    let uid = em.spawn_entity(None).unwrap();
    em.add_component(uid, Plain).unwrap();
    em.delete_entity(uid);
    assert_eq!(*log.borrow(), vec!["local", "broadcast"]);
}

#[test]
fn queue_drains_events_raised_while_draining() {
    let mut em = manager();
    let pings = Rc::new(Cell::new(0));
    let bus = em.event_bus_mut();
    bus.subscribe_event_by_value::<Poke>(EventOrdering::of::<First>(), |em, _| {
        em.queue_event(Ping::default())
    })
    .unwrap();
    let count = pings.clone();
    bus.subscribe_event::<Ping>(EventOrdering::of::<First>(), move |_, _| count.set(count.get() + 1))
        .unwrap();

    em.queue_event(Poke);
    assert_eq!(pings.get(), 0);
    assert_eq!(em.event_bus().queued_len(), 1);
    assert_eq!(em.process_event_queue(), 2);
    assert_eq!(pings.get(), 1);
}

#[test]
fn await_resolves_on_next_raise() {
    let mut em = manager();
    let uid = em.spawn_entity(None).unwrap();
    let mut future = em.await_event::<Ping>().unwrap();
    assert!(matches!(em.await_event::<Ping>(), Err(EcsError::AlreadyAwaiting(_))));
    assert!((&mut future).now_or_never().is_none());

    em.raise_local_event(uid, &mut Ping(vec!["local"]));
    assert_eq!(future.now_or_never().map(|p| p.0), Some(vec!["local"]));

    // The slot is free again once resolved.
    let future = em.await_event::<Ping>().unwrap();
    em.queue_event(Ping(vec!["queued"]));
    em.process_event_queue();
    assert_eq!(future.now_or_never().map(|p| p.0), Some(vec!["queued"]));
}

fn log_stage<C: Component, E: 'static>(bus: &mut EventBus, log: &Rc<RefCell<Vec<&'static str>>>, label: &'static str) {
    let sink = log.clone();
    bus.subscribe_local_event::<C, E>(EventOrdering::of::<First>(), move |_, _, _| sink.borrow_mut().push(label))
        .unwrap();
}

#[test]
fn components_initialize_before_any_starts() {
    let mut em = manager();
    let log = Rc::new(RefCell::new(Vec::new()));
    let bus = em.event_bus_mut();
    log_stage::<TestOne, ComponentInit>(bus, &log, "init TestOne");
    log_stage::<TestOne, ComponentStartup>(bus, &log, "start TestOne");
    log_stage::<TestTwo, ComponentInit>(bus, &log, "init TestTwo");
    log_stage::<TestTwo, ComponentStartup>(bus, &log, "start TestTwo");

    em.spawn_entity(Some("dummyOne")).unwrap();
    assert_eq!(
        *log.borrow(),
        vec!["init TestOne", "init TestTwo", "start TestOne", "start TestTwo"]
    );
}

// ---- Tick loop ----

type Journal = RefCell<Vec<String>>;

struct Mover {
    journal: Rc<Journal>,
}

impl EntitySystem for Mover {
    fn update(&self, em: &mut EntityManager, frame_time: f32) {
        for (_, transform) in em.entity_query_mut::<Transform>() {
            transform.translate(Vec2::new(frame_time, 0.0));
        }
        self.journal.borrow_mut().push("update Mover".into());
    }

    fn shutdown(&self, _em: &mut EntityManager) {
        self.journal.borrow_mut().push("shutdown Mover".into());
    }

    fn updates_after(&self) -> Vec<SystemKey> {
        vec![SystemKey::of::<Reporter>()]
    }
}

struct Reporter {
    journal: Rc<Journal>,
    mover: Rc<Mover>,
}

impl EntitySystem for Reporter {
    fn initialize(&self, subs: &mut Subscriptions<'_, Self>) -> EcsResult<()> {
        subs.broadcast::<EntityDeleted>()
            .by_value(|sys, _, ev| sys.journal.borrow_mut().push(format!("deleted {}", ev.entity)))
    }

    fn update(&self, _em: &mut EntityManager, _frame_time: f32) {
        self.journal.borrow_mut().push("update Reporter".into());
    }

    fn shutdown(&self, _em: &mut EntityManager) {
        self.journal.borrow_mut().push("shutdown Reporter".into());
    }
}

fn register_tick_systems(em: &mut EntityManager, journal: Rc<Journal>) {
    em.systems_mut().services_mut().insert_rc(journal);
    em.systems_mut()
        .register_with(SystemRegistration::new(|r| {
            Ok(Reporter {
                journal: r.service::<Journal>()?,
                mover: r.system::<Mover>()?,
            })
        }))
        .unwrap();
    em.systems_mut()
        .register_with(SystemRegistration::new(|r| {
            Ok(Mover {
                journal: r.service::<Journal>()?,
            })
        }))
        .unwrap();
}

#[test]
fn tick_runs_systems_in_update_order() {
    let mut em = manager();
    let journal = Rc::new(Journal::default());
    register_tick_systems(&mut em, journal.clone());
    em.initialize_systems().unwrap();

    let reporter = em.get_entity_system::<Reporter>().unwrap();
    let mover = em.get_entity_system::<Mover>().unwrap();
    assert!(Rc::ptr_eq(&reporter.mover, &mover));

    let uid = em.spawn_entity(None).unwrap();
    em.add_component(uid, Transform::default()).unwrap();
    em.tick_update(0.5);
    em.tick_update(0.5);

    assert_eq!(em.get_component::<Transform>(uid).unwrap().position, Vec2::new(1.0, 0.0));
    assert_eq!(em.current_tick().value(), 2);
    assert_eq!(
        journal.borrow()[..2],
        ["update Reporter".to_string(), "update Mover".to_string()]
    );
}

#[test]
fn shutdown_tears_down_entities_then_systems() {
    let mut em = manager();
    let journal = Rc::new(Journal::default());
    register_tick_systems(&mut em, journal.clone());
    em.initialize_systems().unwrap();
    let uid = em.spawn_entity(Some("dummyOne")).unwrap();
    assert_eq!(em.event_bus().subscription_count::<EntityDeleted>(), 1);

    em.shutdown();
    assert_eq!(em.entity_count(), 0);
    assert_eq!(em.event_bus().subscription_count::<EntityDeleted>(), 0);
    assert_eq!(
        *journal.borrow(),
        vec![
            format!("deleted {}", uid),
            "shutdown Mover".to_string(),
            "shutdown Reporter".to_string(),
        ]
    );
    assert!(em.get_entity_system::<Mover>().is_err());
}
