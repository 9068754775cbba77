use super::*;

use std::collections::HashSet;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tessera_kernel::{ObjectBase, Registrable, impl_object};

// Handles are plain numbers; the set holds the ones still alive. Tests run
// in parallel against one installed runtime, so they only look at their own
// handles and events.
static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(1);
static LIVE: LazyLock<Mutex<HashSet<usize>>> = LazyLock::new(|| Mutex::new(HashSet::new()));
static RECEIVED: LazyLock<Mutex<Vec<(u32, i32)>>> = LazyLock::new(|| Mutex::new(Vec::new()));
// Frees of handles that were not live. A panic inside the extern callback
// would abort the test binary, so violations are recorded and asserted on
// from the test body instead.
static BAD_FREES: LazyLock<Mutex<Vec<usize>>> = LazyLock::new(|| Mutex::new(Vec::new()));

const P_VALUE: StringHash = StringHash::new("Value");

fn alloc() -> *mut c_void {
    let id = NEXT_HANDLE.fetch_add(1, Ordering::SeqCst);
    LIVE.lock().insert(id);
    id as *mut c_void
}

fn is_live(handle: *mut c_void) -> bool {
    LIVE.lock().contains(&(handle as usize))
}

unsafe extern "system" fn clone_handle(_handle: *mut c_void) -> *mut c_void {
    alloc()
}

unsafe extern "system" fn free_handle(handle: *mut c_void) {
    let id = handle as usize;
    if !LIVE.lock().remove(&id) {
        BAD_FREES.lock().push(id);
    }
}

fn bad_frees(handle: *mut c_void) -> usize {
    BAD_FREES.lock().iter().filter(|id| **id == handle as usize).count()
}

#[track_caller]
fn assert_released_once(handle: *mut c_void) {
    assert!(!is_live(handle), "handle {handle:?} still live");
    assert_eq!(bad_frees(handle), 0, "handle {handle:?} released more than once");
}

unsafe extern "system" fn on_event(event: u32, data: *mut VariantMap) {
    let data = unsafe { &mut *data };
    let value = data.get(&P_VALUE).and_then(Variant::as_i32).unwrap_or(-1);
    RECEIVED.lock().push((event, value));
    data.insert(P_VALUE, Variant::Int(value + 1));
}

fn received(event: EventId) -> Vec<i32> {
    RECEIVED
        .lock()
        .iter()
        .filter(|(e, _)| *e == event.value())
        .map(|(_, v)| *v)
        .collect()
}

struct Widget {
    base: ObjectBase,
}

impl_object!(Widget);

impl Registrable for Widget {
    const TYPE_NAME: &'static str = "Widget";

    fn create(base: ObjectBase) -> Self {
        Self { base }
    }
}

fn setup() -> *const Context {
    assert_eq!(
        unsafe { tessera_set_handle_callbacks(Some(clone_handle), Some(free_handle)) },
        TESSERA_OK
    );
    let context = tessera_context_new();
    unsafe { &*context }.registry().register_type::<Widget>(None).unwrap();
    context
}

#[test]
fn test_clone_then_free_leaves_original_valid() {
    setup();
    let original = alloc();
    let copy = unsafe { tessera_clone_handle(original) };
    assert_ne!(copy, original);
    assert!(is_live(copy));

    unsafe { tessera_free_handle(copy) };
    assert_released_once(copy);
    assert!(is_live(original));

    unsafe { tessera_free_handle(original) };
    assert_released_once(original);
}

#[test]
fn test_double_free_is_recorded_not_aborted() {
    setup();
    let handle = alloc();
    unsafe {
        tessera_free_handle(handle);
        tessera_free_handle(handle);
    }
    assert!(!is_live(handle));
    assert_eq!(bad_frees(handle), 1);
}

#[test]
fn test_null_handles_are_ignored() {
    setup();
    assert!(unsafe { tessera_clone_handle(std::ptr::null_mut()) }.is_null());
    unsafe { tessera_free_handle(std::ptr::null_mut()) };
}

#[test]
fn test_missing_callbacks_are_rejected() {
    assert_eq!(
        unsafe { tessera_set_handle_callbacks(None, Some(free_handle)) },
        TESSERA_ERR_INVALID_STATE
    );
}

#[test]
fn test_create_object_by_name() {
    let context = setup();
    let type_id = unsafe { tessera_type_id_from_name(c"Widget".as_ptr()) };
    assert_eq!(type_id, Widget::TYPE_ID.value());

    let object = unsafe { tessera_context_create_object(context, type_id) };
    assert!(!object.is_null());
    assert_eq!(unsafe { tessera_object_type(object) }, type_id);
    assert_ne!(unsafe { tessera_object_id(object) }, 0);

    let unknown = unsafe { tessera_type_id_from_name(c"Missing".as_ptr()) };
    assert!(unsafe { tessera_context_create_object(context, unknown) }.is_null());
    assert!(unsafe { tessera_context_create_object(std::ptr::null(), type_id) }.is_null());

    unsafe {
        tessera_object_release(object);
        tessera_context_free(context);
    }
}

#[test]
fn test_subscription_owns_and_releases_handle() {
    const EVENT: EventId = StringHash::new("Clicked");
    let context = setup();
    let receiver = unsafe { tessera_context_create_object(context, Widget::TYPE_ID.value()) };
    let sender = unsafe { tessera_context_create_object(context, Widget::TYPE_ID.value()) };
    let handle = alloc();

    let status = unsafe { tessera_object_subscribe_to_event(receiver, sender, EVENT.value(), Some(on_event), handle) };
    assert_eq!(status, TESSERA_OK);

    let data = tessera_variant_map_new();
    unsafe { tessera_variant_map_set_int(data, P_VALUE.value(), 41) };
    assert_eq!(unsafe { tessera_object_send_event(sender, EVENT.value(), data) }, 1);
    assert_eq!(received(EVENT), vec![41]);

    // The handler wrote back into the payload.
    let mut value = 0;
    assert!(unsafe { tessera_variant_map_get_int(data, P_VALUE.value(), &mut value) });
    assert_eq!(value, 42);

    // A different sender does not match the filtered subscription.
    assert_eq!(unsafe { tessera_context_send_event(context, EVENT.value(), data) }, 0);

    // The subscription keeps its own handle until the receiver goes away.
    assert!(is_live(handle));
    unsafe { tessera_object_release(receiver) };
    assert_released_once(handle);

    unsafe {
        tessera_variant_map_free(data);
        tessera_object_release(sender);
        tessera_context_free(context);
    }
}

#[test]
fn test_unsubscribe_releases_handle_once() {
    const EVENT: EventId = StringHash::new("Hovered");
    let context = setup();
    let receiver = unsafe { tessera_context_create_object(context, Widget::TYPE_ID.value()) };
    let handle = alloc();
    unsafe { tessera_object_subscribe_to_event(receiver, std::ptr::null(), EVENT.value(), Some(on_event), handle) };

    assert_eq!(unsafe { tessera_context_send_event(context, EVENT.value(), std::ptr::null_mut()) }, 1);
    assert_eq!(received(EVENT), vec![-1]);

    assert!(unsafe { tessera_object_unsubscribe_from_event(receiver, std::ptr::null(), EVENT.value()) });
    assert_released_once(handle);
    assert!(!unsafe { tessera_object_unsubscribe_from_event(receiver, std::ptr::null(), EVENT.value()) });
    assert_eq!(unsafe { tessera_context_send_event(context, EVENT.value(), std::ptr::null_mut()) }, 0);

    unsafe {
        tessera_object_release(receiver);
        tessera_context_free(context);
    }
    assert_released_once(handle);
}

#[test]
fn test_failed_subscribe_still_releases_handle() {
    const EVENT: EventId = StringHash::new("Dropped");
    setup();
    let handle = alloc();
    let status =
        unsafe { tessera_object_subscribe_to_event(std::ptr::null(), std::ptr::null(), EVENT.value(), Some(on_event), handle) };
    assert_eq!(status, TESSERA_ERR_INVALID_STATE);
    assert_released_once(handle);
}

#[test]
fn test_send_from_null_sender_is_invalid() {
    setup();
    let status = unsafe { tessera_object_send_event(std::ptr::null(), StringHash::new("Any").value(), std::ptr::null_mut()) };
    assert_eq!(status, TESSERA_ERR_INVALID_STATE);
}
