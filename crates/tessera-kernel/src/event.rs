//! Event dispatch
//!
//! Subscriptions are keyed by receiver, optional sender and event type.
//! Dispatch never runs handlers under the hub lock: it snapshots the
//! matching subscriber records, releases the lock, and invokes an
//! independent clone of each record. Subscribing or unsubscribing from
//! inside a handler (or from another thread) therefore never affects an
//! in-flight dispatch.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::hash::EventId;
use crate::object::ObjectId;
use crate::variant::VariantMap;

/// Subscriber record owned by the event hub
pub trait EventHandler: Send + Sync {
    /// Object that subscribed
    fn receiver(&self) -> ObjectId;

    /// Deliver an event synchronously on the calling thread
    fn invoke(&self, event: EventId, data: &mut VariantMap);

    /// Independent copy of this record, used for the duration of one dispatch
    fn clone_handler(&self) -> Box<dyn EventHandler>;
}

/// Handler backed by a native closure
pub struct FnEventHandler {
    receiver: ObjectId,
    func: Arc<dyn Fn(EventId, &mut VariantMap) + Send + Sync>,
}

impl FnEventHandler {
    pub fn new<F>(receiver: ObjectId, func: F) -> Self
    where
        F: Fn(EventId, &mut VariantMap) + Send + Sync + 'static,
    {
        Self {
            receiver,
            func: Arc::new(func),
        }
    }
}

impl EventHandler for FnEventHandler {
    fn receiver(&self) -> ObjectId {
        self.receiver
    }

    fn invoke(&self, event: EventId, data: &mut VariantMap) {
        (self.func)(event, data)
    }

    fn clone_handler(&self) -> Box<dyn EventHandler> {
        Box::new(Self {
            receiver: self.receiver,
            func: self.func.clone(),
        })
    }
}

struct Subscription {
    receiver: ObjectId,
    sender: Option<ObjectId>,
    event: EventId,
    handler: Arc<dyn EventHandler>,
}

impl Subscription {
    fn matches(&self, receiver: ObjectId, sender: Option<ObjectId>, event: EventId) -> bool {
        self.receiver == receiver && self.sender == sender && self.event == event
    }
}

/// Event hub shared by every object of a context
#[derive(Default)]
pub struct EventHub {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe `receiver` to `event`, optionally only when raised by `sender`
    ///
    /// An existing subscription with the same key is replaced; the replaced
    /// handler is released after the hub lock is dropped.
    pub fn subscribe(
        &self,
        receiver: ObjectId,
        sender: Option<ObjectId>,
        event: EventId,
        handler: Box<dyn EventHandler>,
    ) {
        let handler: Arc<dyn EventHandler> = Arc::from(handler);
        let replaced = {
            let mut subscriptions = self.subscriptions.lock();
            match subscriptions
                .iter_mut()
                .find(|s| s.matches(receiver, sender, event))
            {
                Some(existing) => Some(std::mem::replace(&mut existing.handler, handler)),
                None => {
                    subscriptions.push(Subscription {
                        receiver,
                        sender,
                        event,
                        handler,
                    });
                    None
                }
            }
        };
        trace!(%receiver, ?sender, %event, replaced = replaced.is_some(), "Subscribed to event");
        drop(replaced);
    }

    /// Remove one subscription; returns whether it existed
    pub fn unsubscribe(&self, receiver: ObjectId, sender: Option<ObjectId>, event: EventId) -> bool {
        let removed = {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions
                .iter()
                .position(|s| s.matches(receiver, sender, event))
                .map(|index| subscriptions.remove(index))
        };
        removed.is_some()
    }

    /// Remove every subscription in which `object` is the receiver or the sender
    pub fn remove_object(&self, object: ObjectId) -> usize {
        let removed: Vec<Subscription> = {
            let mut subscriptions = self.subscriptions.lock();
            let (removed, kept) = std::mem::take(&mut *subscriptions)
                .into_iter()
                .partition(|s| s.receiver == object || s.sender == Some(object));
            *subscriptions = kept;
            removed
        };
        if !removed.is_empty() {
            trace!(%object, count = removed.len(), "Removed event subscriptions");
        }
        removed.len()
    }

    pub fn has_subscription(&self, receiver: ObjectId, sender: Option<ObjectId>, event: EventId) -> bool {
        self.subscriptions
            .lock()
            .iter()
            .any(|s| s.matches(receiver, sender, event))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Raise `event`, optionally on behalf of `sender`
    ///
    /// Subscribers bound to the specific sender run first, then subscribers
    /// listening to the event from any sender. Returns how many handlers ran.
    pub fn send_event(&self, sender: Option<ObjectId>, event: EventId, data: &mut VariantMap) -> usize {
        let snapshot: Vec<Arc<dyn EventHandler>> = {
            let subscriptions = self.subscriptions.lock();
            let specific = subscriptions
                .iter()
                .filter(|s| s.event == event && sender.is_some() && s.sender == sender);
            let global = subscriptions
                .iter()
                .filter(|s| s.event == event && s.sender.is_none());
            specific.chain(global).map(|s| s.handler.clone()).collect()
        };

        for handler in &snapshot {
            let handler = handler.clone_handler();
            handler.invoke(event, data);
        }
        snapshot.len()
    }
}
