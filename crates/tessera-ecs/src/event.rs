//! Typed event bus.
//!
//! Subscriptions are either directed (keyed by a component type, delivered
//! when the target entity has a present component of that type) or
//! broadcast. Every event type has a single delivery mode: by reference,
//! where handlers share one mutable binding, or by value, where each handler
//! receives its own clone.
//!
//! Handlers are stored as reference-counted closures so dispatch can
//! snapshot the ordered list and release the bus before invoking them with
//! `&mut EntityManager`. That keeps the bus re-entrant.

use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use tracing::trace;

use crate::component::Component;
use crate::entity::EntityUid;
use crate::entity_manager::EntityManager;
use crate::error::{EcsError, EcsResult};
use crate::ordering::{order_keys, short_type_name, EventOrdering, SystemKey};

/// Handler of a directed event.
pub type LocalHandler<E> = Rc<dyn Fn(&mut EntityManager, EntityUid, &mut E)>;
/// Handler of a broadcast event.
pub type BroadcastHandler<E> = Rc<dyn Fn(&mut EntityManager, &mut E)>;

pub(crate) type QueuedEvent = Box<dyn FnOnce(&mut EntityManager)>;

/// How handlers of an event type receive the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    ByValue,
    ByRef,
}

impl EventMode {
    fn describe(self) -> &'static str {
        match self {
            EventMode::ByValue => "by value",
            EventMode::ByRef => "by reference",
        }
    }
}

struct Subscription {
    ordering: EventOrdering,
    /// Component type for directed subscriptions, `None` for broadcast.
    target: Option<TypeId>,
    seq: u64,
    /// A `LocalHandler<E>` or a `BroadcastHandler<E>`.
    handler: Box<dyn Any>,
}

/// Every subscription to one event type plus its cached handler order.
struct EventSubscriptions {
    name: &'static str,
    mode: Option<EventMode>,
    subs: Vec<Subscription>,
    ranks: HashMap<SystemKey, usize>,
}

impl EventSubscriptions {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            mode: None,
            subs: Vec::new(),
            ranks: HashMap::new(),
        }
    }

    fn compute_ranks(&self) -> EcsResult<HashMap<SystemKey, usize>> {
        let context = format!("handlers of {}", self.name);
        let order = order_keys(&context, self.subs.iter().map(|sub| sub.ordering.constraints()))?;
        Ok(order.into_iter().enumerate().map(|(rank, key)| (key, rank)).collect())
    }

    fn rank(&self, sub: &Subscription) -> usize {
        self.ranks.get(&sub.ordering.key()).copied().unwrap_or(usize::MAX)
    }

    /// Handlers of type `H` whose subscription passes `keep`, in dispatch order.
    fn ordered<H: Clone + 'static>(&self, keep: impl Fn(&Subscription) -> bool) -> Vec<H> {
        let mut matched: Vec<(usize, u64, H)> = self
            .subs
            .iter()
            .filter(|sub| keep(sub))
            .filter_map(|sub| {
                let handler = sub.handler.downcast_ref::<H>()?;
                Some((self.rank(sub), sub.seq, handler.clone()))
            })
            .collect();
        matched.sort_by_key(|(rank, seq, _)| (*rank, *seq));
        matched.into_iter().map(|(_, _, handler)| handler).collect()
    }
}

// ---- Await ----

struct AwaitState<E> {
    value: Option<E>,
    waker: Option<Waker>,
}

/// Resolves with a copy of the next raised event of type `E`.
pub struct EventFuture<E> {
    shared: Arc<Mutex<AwaitState<E>>>,
}

impl<E> Future for EventFuture<E> {
    type Output = E;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<E> {
        let mut state = self.shared.lock();
        match state.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

struct AwaitSlot {
    /// Whether the future is still held by someone.
    pending: Box<dyn Fn() -> bool>,
    complete: Box<dyn FnOnce(&dyn Any)>,
}

fn await_slot<E: Clone + 'static>(shared: Weak<Mutex<AwaitState<E>>>) -> AwaitSlot {
    let alive = shared.clone();
    AwaitSlot {
        pending: Box::new(move || alive.strong_count() > 0),
        complete: Box::new(move |event: &dyn Any| {
            let (Some(shared), Some(event)) = (shared.upgrade(), event.downcast_ref::<E>()) else {
                return;
            };
            let waker = {
                let mut state = shared.lock();
                state.value = Some(event.clone());
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }),
    }
}

// ---- Bus ----

/// Subscription tables, the deferred event queue and pending awaits.
#[derive(Default)]
pub struct EventBus {
    events: HashMap<TypeId, EventSubscriptions>,
    next_seq: u64,
    queue: VecDeque<QueuedEvent>,
    awaiting: HashMap<TypeId, AwaitSlot>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Subscribe ----

    /// Subscribe to `E` raised at entities with a `C` component. The handler
    /// receives the caller's binding and may mutate it in place.
    pub fn subscribe_local_event<C, E>(
        &mut self,
        ordering: EventOrdering,
        handler: impl Fn(&mut EntityManager, EntityUid, &mut E) + 'static,
    ) -> EcsResult<()>
    where
        C: Component,
        E: 'static,
    {
        let handler: LocalHandler<E> = Rc::new(handler);
        self.subscribe::<E>(EventMode::ByRef, ordering, Some(target_of::<C>()), Box::new(handler))
    }

    /// Subscribe to `E` at entities with a `C` component, receiving a copy.
    pub fn subscribe_local_event_by_value<C, E>(
        &mut self,
        ordering: EventOrdering,
        handler: impl Fn(&mut EntityManager, EntityUid, E) + 'static,
    ) -> EcsResult<()>
    where
        C: Component,
        E: Clone + 'static,
    {
        let handler: LocalHandler<E> =
            Rc::new(move |em: &mut EntityManager, uid: EntityUid, event: &mut E| handler(em, uid, event.clone()));
        self.subscribe::<E>(EventMode::ByValue, ordering, Some(target_of::<C>()), Box::new(handler))
    }

    /// Subscribe to broadcast `E` by reference.
    pub fn subscribe_event<E: 'static>(
        &mut self,
        ordering: EventOrdering,
        handler: impl Fn(&mut EntityManager, &mut E) + 'static,
    ) -> EcsResult<()> {
        let handler: BroadcastHandler<E> = Rc::new(handler);
        self.subscribe::<E>(EventMode::ByRef, ordering, None, Box::new(handler))
    }

    /// Subscribe to broadcast `E`, receiving a copy.
    pub fn subscribe_event_by_value<E: Clone + 'static>(
        &mut self,
        ordering: EventOrdering,
        handler: impl Fn(&mut EntityManager, E) + 'static,
    ) -> EcsResult<()> {
        let handler: BroadcastHandler<E> =
            Rc::new(move |em: &mut EntityManager, event: &mut E| handler(em, event.clone()));
        self.subscribe::<E>(EventMode::ByValue, ordering, None, Box::new(handler))
    }

    fn subscribe<E: 'static>(
        &mut self,
        mode: EventMode,
        ordering: EventOrdering,
        target: Option<(TypeId, &'static str)>,
        handler: Box<dyn Any>,
    ) -> EcsResult<()> {
        let seq = self.next_seq;
        let entry = self
            .events
            .entry(TypeId::of::<E>())
            .or_insert_with(|| EventSubscriptions::new(short_type_name(type_name::<E>())));

        if let Some(existing) = entry.mode.filter(|&existing| existing != mode) {
            return Err(EcsError::MixedEventMode {
                event: entry.name,
                existing: existing.describe(),
                requested: mode.describe(),
            });
        }

        let subscriber = ordering.key();
        let existing = match target {
            Some((component, _)) => entry.subs.iter().find(|sub| sub.target == Some(component)),
            None => entry
                .subs
                .iter()
                .find(|sub| sub.target.is_none() && sub.ordering.key() == subscriber),
        };
        if let Some(existing) = existing {
            return Err(EcsError::DuplicateSubscription {
                subscriber: existing.ordering.key().name(),
                event: entry.name,
                target: target.map_or("broadcast", |(_, name)| name),
            });
        }

        entry.subs.push(Subscription {
            ordering,
            target: target.map(|(component, _)| component),
            seq,
            handler,
        });
        match entry.compute_ranks() {
            Ok(ranks) => entry.ranks = ranks,
            Err(err) => {
                entry.subs.pop();
                return Err(err);
            }
        }
        entry.mode = Some(mode);
        self.next_seq += 1;

        trace!(
            "{} subscribed to {} ({})",
            subscriber,
            entry.name,
            target.map_or("broadcast", |(_, name)| name)
        );
        Ok(())
    }

    // ---- Unsubscribe ----

    /// Drop the directed subscription to `E` on `C`. Returns whether one existed.
    pub fn unsubscribe_local_event<C: Component, E: 'static>(&mut self) -> bool {
        let component = TypeId::of::<C>();
        self.remove_where(TypeId::of::<E>(), |sub| sub.target == Some(component)) > 0
    }

    /// Drop `subscriber`'s broadcast subscription to `E`.
    pub fn unsubscribe_event<E: 'static>(&mut self, subscriber: SystemKey) -> bool {
        self.remove_where(TypeId::of::<E>(), |sub| {
            sub.target.is_none() && sub.ordering.key() == subscriber
        }) > 0
    }

    /// Drop every subscription owned by `subscriber`. Unknown subscribers are a no-op.
    pub fn unsubscribe_events(&mut self, subscriber: SystemKey) {
        let events: Vec<TypeId> = self.events.keys().copied().collect();
        for event in events {
            self.remove_where(event, |sub| sub.ordering.key() == subscriber);
        }
    }

    fn remove_where(&mut self, event: TypeId, predicate: impl Fn(&Subscription) -> bool) -> usize {
        let Some(entry) = self.events.get_mut(&event) else {
            return 0;
        };
        let before = entry.subs.len();
        entry.subs.retain(|sub| !predicate(sub));
        let removed = before - entry.subs.len();
        if removed > 0 {
            if entry.subs.is_empty() {
                entry.mode = None;
            }
            // Dropping nodes from an acyclic graph keeps it acyclic.
            if let Ok(ranks) = entry.compute_ranks() {
                entry.ranks = ranks;
            }
        }
        removed
    }

    // ---- Introspection ----

    pub fn subscription_count<E: 'static>(&self) -> usize {
        self.events.get(&TypeId::of::<E>()).map_or(0, |entry| entry.subs.len())
    }

    pub fn event_mode<E: 'static>(&self) -> Option<EventMode> {
        self.events.get(&TypeId::of::<E>()).and_then(|entry| entry.mode)
    }

    // ---- Dispatch snapshots ----

    /// Directed handlers of `E` for the given present component types.
    pub(crate) fn local_handlers<E: 'static>(&self, present: &[TypeId]) -> Vec<LocalHandler<E>> {
        self.events.get(&TypeId::of::<E>()).map_or_else(Vec::new, |entry| {
            entry.ordered::<LocalHandler<E>>(|sub| sub.target.is_some_and(|t| present.contains(&t)))
        })
    }

    pub(crate) fn broadcast_handlers<E: 'static>(&self) -> Vec<BroadcastHandler<E>> {
        self.events.get(&TypeId::of::<E>()).map_or_else(Vec::new, |entry| {
            entry.ordered::<BroadcastHandler<E>>(|sub| sub.target.is_none())
        })
    }

    // ---- Queue ----

    /// Queue a broadcast event until the queue is processed.
    pub fn queue_event<E: 'static>(&mut self, mut event: E) {
        self.queue
            .push_back(Box::new(move |em: &mut EntityManager| em.raise_event(&mut event)));
    }

    /// Queue a directed event until the queue is processed.
    pub fn queue_local_event<E: 'static>(&mut self, uid: EntityUid, mut event: E) {
        self.queue
            .push_back(Box::new(move |em: &mut EntityManager| em.raise_local_event(uid, &mut event)));
    }

    pub(crate) fn pop_queued(&mut self) -> Option<QueuedEvent> {
        self.queue.pop_front()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    // ---- Await ----

    /// A future resolving with the next raised `E`. Only one await per event
    /// type may be outstanding.
    pub fn await_event<E: Clone + 'static>(&mut self) -> EcsResult<EventFuture<E>> {
        let key = TypeId::of::<E>();
        if self.awaiting.get(&key).is_some_and(|slot| (slot.pending)()) {
            return Err(EcsError::AlreadyAwaiting(short_type_name(type_name::<E>())));
        }
        let shared = Arc::new(Mutex::new(AwaitState {
            value: None,
            waker: None,
        }));
        self.awaiting.insert(key, await_slot(Arc::downgrade(&shared)));
        Ok(EventFuture { shared })
    }

    /// Resolve the pending await on `E`, if any.
    pub(crate) fn complete_await<E: 'static>(&mut self, event: &E) {
        if let Some(slot) = self.awaiting.remove(&TypeId::of::<E>()) {
            (slot.complete)(event as &dyn Any);
        }
    }
}

fn target_of<C: Component>() -> (TypeId, &'static str) {
    (TypeId::of::<C>(), short_type_name(type_name::<C>()))
}
