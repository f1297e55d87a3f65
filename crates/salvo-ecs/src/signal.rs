//! Named, deferred entity signals.
//!
//! A signal says "these entities reached event S". Producers publish at any
//! time (typically after a parallel pass, once per tick). Publications sit in
//! a pending set until the pipeline dispatches them, at the start of every
//! tick and after every stage's command flush. Dispatch routes each signal
//! into the mailbox of every subscriber, merging repeated publications and
//! dropping handles whose entity no longer exists. A consumer drains its
//! mailbox with [`SignalQueue::take`].
//!
//! Consequences:
//!
//! - a publish during tick N reaches subscribers by tick N+1 at the latest,
//!   and a subscriber scheduled in a later stage of tick N sees it in N;
//! - a handle appears at most once per delivery;
//! - nothing is retried, and consumers must still re-validate handles, since
//!   an entity can die between delivery and use.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use parking_lot::Mutex;
use tracing::trace;

use crate::entity::EntityHandle;
use crate::world::World;

// ---------------------------------------------------------------------------
// SignalName
// ---------------------------------------------------------------------------

/// Name of a signal. Intended to be declared as a constant by the producer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalName(&'static str);

impl SignalName {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalName({:?})", self.0)
    }
}

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

// ---------------------------------------------------------------------------
// SignalDelivery
// ---------------------------------------------------------------------------

/// The signals drained from one subscriber's mailbox.
///
/// Handles are sorted and unique per signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalDelivery {
    signals: BTreeMap<SignalName, Vec<EntityHandle>>,
}

impl SignalDelivery {
    /// Entities delivered for `signal` (empty if none).
    pub fn entities(&self, signal: SignalName) -> &[EntityHandle] {
        self.signals.get(&signal).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (SignalName, &[EntityHandle])> {
        self.signals.iter().map(|(s, e)| (*s, e.as_slice()))
    }

    /// Total number of delivered handles across all signals.
    pub fn len(&self) -> usize {
        self.signals.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

// ---------------------------------------------------------------------------
// SignalQueue
// ---------------------------------------------------------------------------

type Mailbox = BTreeMap<SignalName, BTreeSet<EntityHandle>>;

/// Subscription registry plus pending publications and per-subscriber
/// mailboxes.
#[derive(Default)]
pub struct SignalQueue {
    /// Subscribers per signal, in subscription order.
    subscriptions: HashMap<SignalName, Vec<String>>,
    pending: Mutex<Mailbox>,
    mailboxes: Mutex<HashMap<String, Mailbox>>,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `subscriber` to `signal`. Subscribing twice is a no-op.
    pub fn subscribe(&mut self, signal: SignalName, subscriber: &str) {
        let subscribers = self.subscriptions.entry(signal).or_default();
        if !subscribers.iter().any(|s| s == subscriber) {
            subscribers.push(subscriber.to_owned());
        }
    }

    /// Remove a subscription and discard anything already routed to it.
    pub fn unsubscribe(&mut self, signal: SignalName, subscriber: &str) {
        if let Some(subscribers) = self.subscriptions.get_mut(&signal) {
            subscribers.retain(|s| s != subscriber);
        }
        if let Some(mailbox) = self.mailboxes.get_mut().get_mut(subscriber) {
            mailbox.remove(&signal);
        }
    }

    pub fn subscribers(&self, signal: SignalName) -> &[String] {
        self.subscriptions
            .get(&signal)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Record that `entities` reached `signal`. Safe to call from any thread.
    pub fn publish<I>(&self, signal: SignalName, entities: I)
    where
        I: IntoIterator<Item = EntityHandle>,
    {
        let mut pending = self.pending.lock();
        let mut entities = entities.into_iter().peekable();
        if entities.peek().is_none() {
            return;
        }
        pending.entry(signal).or_default().extend(entities);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Route pending publications into subscriber mailboxes.
    ///
    /// Handles of destroyed entities are dropped, as are signals nobody
    /// subscribes to. Returns the number of handles routed (counted once per
    /// subscriber).
    pub fn dispatch(&self, world: &World) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return 0;
        }
        let mut mailboxes = self.mailboxes.lock();
        let mut routed = 0;
        for (signal, entities) in pending {
            let subscribers = self.subscribers(signal);
            if subscribers.is_empty() {
                trace!(%signal, count = entities.len(), "signal has no subscribers, dropping");
                continue;
            }
            let live: Vec<EntityHandle> = entities
                .into_iter()
                .filter(|e| world.is_alive(*e))
                .collect();
            if live.is_empty() {
                continue;
            }
            for subscriber in subscribers {
                let slot = mailboxes
                    .entry(subscriber.clone())
                    .or_default()
                    .entry(signal)
                    .or_default();
                slot.extend(live.iter().copied());
                routed += live.len();
            }
        }
        routed
    }

    /// Whether anything is waiting for `subscriber`.
    pub fn has_mail(&self, subscriber: &str) -> bool {
        self.mailboxes
            .lock()
            .get(subscriber)
            .is_some_and(|m| !m.is_empty())
    }

    /// Drain `subscriber`'s mailbox, dropping handles that died since
    /// dispatch.
    pub fn take(&self, subscriber: &str, world: &World) -> SignalDelivery {
        let mailbox = self
            .mailboxes
            .lock()
            .remove(subscriber)
            .unwrap_or_default();
        let signals = mailbox
            .into_iter()
            .filter_map(|(signal, entities)| {
                let live: Vec<EntityHandle> = entities
                    .into_iter()
                    .filter(|e| world.is_alive(*e))
                    .collect();
                (!live.is_empty()).then_some((signal, live))
            })
            .collect();
        SignalDelivery { signals }
    }
}

impl fmt::Debug for SignalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalQueue")
            .field("subscriptions", &self.subscriptions)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::FragmentBundle;

    const HIT: SignalName = SignalName::new("test.hit");
    const MISS: SignalName = SignalName::new("test.miss");

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    struct Body;

    fn world_with(n: usize) -> (World, Vec<EntityHandle>) {
        let mut world = World::new();
        world.register_fragment::<Body>("body");
        let handles = (0..n)
            .map(|_| world.spawn(FragmentBundle::new().with(Body)).unwrap())
            .collect();
        (world, handles)
    }

    #[test]
    fn publish_is_invisible_until_dispatch() {
        let (world, e) = world_with(1);
        let mut queue = SignalQueue::new();
        queue.subscribe(HIT, "hits");
        queue.publish(HIT, [e[0]]);
        assert!(queue.take("hits", &world).is_empty());
        assert_eq!(queue.dispatch(&world), 1);
        assert_eq!(queue.take("hits", &world).entities(HIT), &[e[0]]);
    }

    #[test]
    fn repeated_publishes_merge_and_dedup() {
        let (world, e) = world_with(3);
        let mut queue = SignalQueue::new();
        queue.subscribe(HIT, "hits");
        queue.publish(HIT, [e[2], e[0]]);
        queue.dispatch(&world);
        queue.publish(HIT, [e[0], e[1], e[0]]);
        queue.dispatch(&world);

        let delivery = queue.take("hits", &world);
        assert_eq!(delivery.entities(HIT), &[e[0], e[1], e[2]]);
        assert_eq!(delivery.len(), 3);
        assert!(queue.take("hits", &world).is_empty(), "take drains the mailbox");
    }

    #[test]
    fn every_subscriber_gets_its_own_copy() {
        let (world, e) = world_with(1);
        let mut queue = SignalQueue::new();
        queue.subscribe(HIT, "damage");
        queue.subscribe(HIT, "telemetry");
        queue.subscribe(HIT, "telemetry");
        assert_eq!(queue.subscribers(HIT).len(), 2);

        queue.publish(HIT, [e[0]]);
        queue.dispatch(&world);
        assert_eq!(queue.take("damage", &world).entities(HIT), &[e[0]]);
        assert!(queue.has_mail("telemetry"));
        assert_eq!(queue.take("telemetry", &world).entities(HIT), &[e[0]]);
    }

    #[test]
    fn dead_entities_are_dropped_at_dispatch_and_take() {
        let (mut world, e) = world_with(3);
        let mut queue = SignalQueue::new();
        queue.subscribe(HIT, "hits");

        queue.publish(HIT, [e[0], e[1]]);
        world.destroy(e[0]).unwrap();
        queue.dispatch(&world);
        world.destroy(e[1]).unwrap();

        assert!(queue.take("hits", &world).is_empty());
    }

    #[test]
    fn unsubscribed_signals_are_dropped() {
        let (world, e) = world_with(1);
        let mut queue = SignalQueue::new();
        queue.subscribe(HIT, "hits");
        queue.publish(MISS, [e[0]]);
        assert!(queue.has_pending());
        assert_eq!(queue.dispatch(&world), 0);
        assert!(!queue.has_pending());
        assert!(!queue.has_mail("hits"));
    }

    #[test]
    fn empty_publish_is_ignored() {
        let queue = SignalQueue::new();
        queue.publish(HIT, std::iter::empty());
        assert!(!queue.has_pending());
    }

    #[test]
    fn unsubscribe_discards_routed_signals() {
        let (world, e) = world_with(1);
        let mut queue = SignalQueue::new();
        queue.subscribe(HIT, "hits");
        queue.publish(HIT, [e[0]]);
        queue.dispatch(&world);
        queue.unsubscribe(HIT, "hits");
        assert!(queue.take("hits", &world).is_empty());
        assert!(queue.subscribers(HIT).is_empty());
    }
}
