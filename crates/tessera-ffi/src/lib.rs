//! Tessera FFI
//!
//! C ABI consumed by the managed runtime. The managed side installs its
//! handle callbacks, creates objects through a context, and subscribes
//! delegates to native events by handing over a handle it will never free
//! itself. Native code clones that handle for every copy of the
//! subscription it makes and frees each copy exactly once.
//!
//! Pointer conventions:
//! - a context is an `Arc<Context>` leaked with `Arc::into_raw`
//! - an object is a boxed `SharedObject`; releasing it drops one reference
//! - a variant map is a boxed `VariantMap`

use std::ffi::{CStr, c_char, c_void};
use std::sync::Arc;

use tracing::debug;

use tessera_kernel::adapter::subscribe_managed;
use tessera_kernel::handle::{CloneHandleFn, FreeHandleFn};
use tessera_kernel::{
    Context, EventHub, EventId, HandleRuntime, ManagedEventCallback, ManagedHandle, Object, RawHandle, SharedObject,
    StringHash, TypeId, Variant, VariantMap,
};

pub mod error;
mod guard;
mod runtime;

pub use error::{FfiError, FfiResult, TESSERA_ERR_FAILED, TESSERA_ERR_INVALID_STATE, TESSERA_ERR_UNKNOWN_TYPE, TESSERA_OK};

use guard::{guard_status, guard_void, guard_with_default};

unsafe fn context_ref<'a>(context: *const Context) -> FfiResult<&'a Context> {
    // SAFETY: non-null pointers come from `tessera_context_new`.
    unsafe { context.as_ref() }.ok_or(FfiError::NullPointer("context"))
}

unsafe fn object_ref<'a>(object: *const SharedObject, what: &'static str) -> FfiResult<&'a SharedObject> {
    // SAFETY: non-null pointers come from `tessera_context_create_object`.
    unsafe { object.as_ref() }.ok_or(FfiError::NullPointer(what))
}

// ============================================================================
// Handles
// ============================================================================

/// Install the managed runtime's handle callbacks
///
/// # Safety
///
/// Both callbacks must stay valid for the life of the process and be
/// callable from any thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_set_handle_callbacks(
    clone: Option<CloneHandleFn>,
    free: Option<FreeHandleFn>,
) -> i32 {
    guard_status("set_handle_callbacks", || {
        let clone = clone.ok_or(FfiError::NullPointer("clone"))?;
        let free = free.ok_or(FfiError::NullPointer("free"))?;
        // SAFETY: forwarded from the caller.
        unsafe { runtime::install(clone, free) };
        Ok(())
    })
}

/// Duplicate a handle through the installed runtime
///
/// Returns null for a null handle or when no callbacks are installed.
///
/// # Safety
///
/// `handle` must be null or a live handle of the installed runtime.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_clone_handle(handle: *mut c_void) -> *mut c_void {
    guard_with_default("clone_handle", std::ptr::null_mut(), || {
        let raw = RawHandle(handle);
        if raw.is_null() {
            return Ok(std::ptr::null_mut());
        }
        Ok(runtime::current()?.clone_handle(raw).as_ptr())
    })
}

/// Release a handle through the installed runtime
///
/// # Safety
///
/// `handle` must be null or a live handle of the installed runtime that the
/// caller owns.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_free_handle(handle: *mut c_void) {
    guard_void("free_handle", || {
        let raw = RawHandle(handle);
        if raw.is_null() {
            return;
        }
        match runtime::current() {
            Ok(runtime) => runtime.free_handle(raw),
            Err(e) => debug!(error = %e, "Handle not released"),
        }
    })
}

// ============================================================================
// Context and objects
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn tessera_context_new() -> *const Context {
    guard_with_default("context_new", std::ptr::null(), || Ok(Arc::into_raw(Context::new())))
}

/// # Safety
///
/// `context` must be null or a pointer returned by [`tessera_context_new`]
/// that has not been freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_context_free(context: *const Context) {
    guard_void("context_free", || {
        if !context.is_null() {
            // SAFETY: guaranteed by the caller.
            drop(unsafe { Arc::from_raw(context) });
        }
    })
}

/// Create an object of a registered type; null on failure
///
/// # Safety
///
/// `context` must be null or a live context pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_context_create_object(context: *const Context, type_id: u32) -> *mut SharedObject {
    guard_with_default("context_create_object", std::ptr::null_mut(), || {
        let context = unsafe { context_ref(context) }?;
        let object = context.create_object(TypeId::from_value(type_id))?;
        Ok(Box::into_raw(Box::new(object)))
    })
}

/// Send an event without a sender; returns the number of handlers invoked
///
/// # Safety
///
/// `context` must be null or a live context pointer; `data` must be null or
/// a map from [`tessera_variant_map_new`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_context_send_event(context: *const Context, event: u32, data: *mut VariantMap) -> i32 {
    let mut delivered = 0;
    let status = guard_status("context_send_event", || {
        let context = unsafe { context_ref(context) }?;
        delivered = unsafe { dispatch(context.events(), None, EventId::from_value(event), data) };
        Ok(())
    });
    if status == TESSERA_OK { delivered } else { status }
}

/// Drop one reference to an object
///
/// # Safety
///
/// `object` must be null or a pointer returned by
/// [`tessera_context_create_object`] that has not been released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_object_release(object: *mut SharedObject) {
    guard_void("object_release", || {
        if !object.is_null() {
            // SAFETY: guaranteed by the caller.
            drop(unsafe { Box::from_raw(object) });
        }
    })
}

/// # Safety
///
/// `object` must be null or a live object pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_object_type(object: *const SharedObject) -> u32 {
    guard_with_default("object_type", StringHash::EMPTY.value(), || {
        Ok(unsafe { object_ref(object, "object") }?.object_type().value())
    })
}

/// # Safety
///
/// `object` must be null or a live object pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_object_id(object: *const SharedObject) -> u64 {
    guard_with_default("object_id", 0, || Ok(unsafe { object_ref(object, "object") }?.object_id().value()))
}

// ============================================================================
// Events
// ============================================================================

/// Subscribe a managed delegate to `event`, optionally only from `sender`
///
/// Ownership of `handle` passes to native code whenever callbacks are
/// installed, including when the call fails; it is released when the
/// subscription ends. Subscribing again with the same receiver, sender and
/// event replaces the previous delegate.
///
/// # Safety
///
/// `receiver` and `sender` must be null or live object pointers, `handle`
/// must be null or a live handle owned by the caller, and `callback` must
/// stay callable from any thread while the subscription exists.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_object_subscribe_to_event(
    receiver: *const SharedObject,
    sender: *const SharedObject,
    event: u32,
    callback: Option<ManagedEventCallback>,
    handle: *mut c_void,
) -> i32 {
    guard_status("object_subscribe_to_event", || {
        let runtime = runtime::current()?;
        // SAFETY: the caller hands over ownership of the handle.
        let owned = unsafe { ManagedHandle::from_raw(RawHandle(handle), runtime.clone()) };
        let receiver = unsafe { object_ref(receiver, "receiver") }?;
        let sender = if sender.is_null() {
            None
        } else {
            Some(unsafe { object_ref(sender, "sender") }?)
        };
        let callback = callback.ok_or(FfiError::NullPointer("callback"))?;

        // SAFETY: callback contract forwarded from the caller; the handle is
        // owned by `owned` and released from here on by the adapter.
        let subscribed = unsafe {
            subscribe_managed(
                &**receiver,
                sender.map(|s| &**s),
                EventId::from_value(event),
                callback,
                owned.into_raw(),
                runtime,
            )
        };
        if subscribed { Ok(()) } else { Err(FfiError::Detached) }
    })
}

/// Remove a subscription; returns whether one existed
///
/// # Safety
///
/// `receiver` and `sender` must be null or live object pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_object_unsubscribe_from_event(
    receiver: *const SharedObject,
    sender: *const SharedObject,
    event: u32,
) -> bool {
    guard_with_default("object_unsubscribe_from_event", false, || {
        let receiver = unsafe { object_ref(receiver, "receiver") }?;
        let sender = if sender.is_null() {
            None
        } else {
            Some(unsafe { object_ref(sender, "sender") }?.object_id())
        };
        let events = receiver.base().events().ok_or(FfiError::Detached)?;
        Ok(events.unsubscribe(receiver.object_id(), sender, EventId::from_value(event)))
    })
}

/// Raise `event` from `sender`; returns the number of handlers invoked or a
/// negative status
///
/// # Safety
///
/// `sender` must be null or a live object pointer; `data` must be null or a
/// map from [`tessera_variant_map_new`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_object_send_event(sender: *const SharedObject, event: u32, data: *mut VariantMap) -> i32 {
    let mut delivered = 0;
    let status = guard_status("object_send_event", || {
        let sender = unsafe { object_ref(sender, "sender") }?;
        let events = sender.base().events().ok_or(FfiError::Detached)?;
        delivered = unsafe { dispatch(&events, Some(sender), EventId::from_value(event), data) };
        Ok(())
    });
    if status == TESSERA_OK { delivered } else { status }
}

unsafe fn dispatch(
    events: &EventHub,
    sender: Option<&SharedObject>,
    event: EventId,
    data: *mut VariantMap,
) -> i32 {
    let sender = sender.map(|s| s.object_id());
    // SAFETY: non-null maps come from `tessera_variant_map_new`.
    let count = match unsafe { data.as_mut() } {
        Some(data) => events.send_event(sender, event, data),
        None => events.send_event(sender, event, &mut VariantMap::new()),
    };
    i32::try_from(count).unwrap_or(i32::MAX)
}

// ============================================================================
// Payloads and names
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn tessera_variant_map_new() -> *mut VariantMap {
    guard_with_default("variant_map_new", std::ptr::null_mut(), || {
        Ok(Box::into_raw(Box::new(VariantMap::new())))
    })
}

/// # Safety
///
/// `map` must be null or a pointer returned by [`tessera_variant_map_new`]
/// that has not been freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_variant_map_free(map: *mut VariantMap) {
    guard_void("variant_map_free", || {
        if !map.is_null() {
            drop(unsafe { Box::from_raw(map) });
        }
    })
}

/// # Safety
///
/// `map` must be null or a live map pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_variant_map_set_int(map: *mut VariantMap, key: u32, value: i32) -> i32 {
    guard_status("variant_map_set_int", || {
        let map = unsafe { map.as_mut() }.ok_or(FfiError::NullPointer("map"))?;
        map.insert(StringHash::from_value(key), Variant::Int(value));
        Ok(())
    })
}

/// Read an integer entry; returns false when missing or not an integer
///
/// # Safety
///
/// `map` must be null or a live map pointer; `out` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_variant_map_get_int(map: *const VariantMap, key: u32, out: *mut i32) -> bool {
    guard_with_default("variant_map_get_int", false, || {
        let map = unsafe { map.as_ref() }.ok_or(FfiError::NullPointer("map"))?;
        let out = unsafe { out.as_mut() }.ok_or(FfiError::NullPointer("out"))?;
        match map.get(&StringHash::from_value(key)).and_then(Variant::as_i32) {
            Some(value) => {
                *out = value;
                Ok(true)
            }
            None => Ok(false),
        }
    })
}

/// Hash a NUL-terminated UTF-8 name into a type or event id
///
/// # Safety
///
/// `name` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tessera_type_id_from_name(name: *const c_char) -> u32 {
    guard_with_default("type_id_from_name", StringHash::EMPTY.value(), || {
        if name.is_null() {
            return Err(FfiError::NullPointer("name"));
        }
        // SAFETY: guaranteed by the caller.
        let name = unsafe { CStr::from_ptr(name) }
            .to_str()
            .map_err(|_| FfiError::InvalidString("name"))?;
        Ok(StringHash::new(name).value())
    })
}

#[cfg(test)]
mod tests;
