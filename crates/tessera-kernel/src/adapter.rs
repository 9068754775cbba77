//! Event delivery into a managed runtime
//!
//! [`EventAdapter`] is the subscriber record created when managed code
//! subscribes to a native event. It owns exactly one [`ManagedHandle`]
//! keeping the managed delegate alive; every copy made by the event hub
//! owns its own cloned handle, and each is released once when the copy is
//! dropped.

use std::fmt;
use std::sync::Arc;

use crate::event::EventHandler;
use crate::hash::EventId;
use crate::handle::{HandleRuntime, ManagedHandle, RawHandle};
use crate::object::{Object, ObjectId};
use crate::variant::VariantMap;

/// Managed entry point invoked for every delivered event
pub type ManagedEventCallback = unsafe extern "system" fn(event: u32, data: *mut VariantMap);

/// Subscriber record forwarding events to a managed callback
pub struct EventAdapter {
    receiver: ObjectId,
    callback: ManagedEventCallback,
    handle: ManagedHandle,
}

impl EventAdapter {
    /// # Safety
    ///
    /// `callback` must stay callable, from any thread, for as long as
    /// `handle` is alive.
    pub unsafe fn new(receiver: ObjectId, callback: ManagedEventCallback, handle: ManagedHandle) -> Self {
        Self {
            receiver,
            callback,
            handle,
        }
    }

    pub fn handle(&self) -> RawHandle {
        self.handle.raw()
    }
}

impl EventHandler for EventAdapter {
    fn receiver(&self) -> ObjectId {
        self.receiver
    }

    fn invoke(&self, event: EventId, data: &mut VariantMap) {
        // SAFETY: guaranteed by the contract of `EventAdapter::new`; the
        // payload pointer is only valid for the duration of the call.
        unsafe { (self.callback)(event.value(), data as *mut VariantMap) }
    }

    fn clone_handler(&self) -> Box<dyn EventHandler> {
        Box::new(Self {
            receiver: self.receiver,
            callback: self.callback,
            handle: self.handle.clone(),
        })
    }
}

impl fmt::Debug for EventAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventAdapter")
            .field("receiver", &self.receiver)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Subscribe a managed callback to `event` raised on `sender` (or any sender)
///
/// Takes ownership of `handle`. If the receiver is no longer attached to an
/// event hub the handle is released immediately and `false` is returned.
///
/// # Safety
///
/// `handle` must be null or a live handle of `runtime` owned by the caller,
/// and `callback` must satisfy the contract of [`EventAdapter::new`].
pub unsafe fn subscribe_managed(
    receiver: &dyn Object,
    sender: Option<&dyn Object>,
    event: EventId,
    callback: ManagedEventCallback,
    handle: RawHandle,
    runtime: Arc<dyn HandleRuntime>,
) -> bool {
    // SAFETY: forwarded from the caller.
    let handle = unsafe { ManagedHandle::from_raw(handle, runtime) };
    let Some(events) = receiver.base().events() else {
        return false;
    };
    let adapter = unsafe { EventAdapter::new(receiver.object_id(), callback, handle) };
    events.subscribe(
        receiver.object_id(),
        sender.map(|s| s.object_id()),
        event,
        Box::new(adapter),
    );
    true
}
