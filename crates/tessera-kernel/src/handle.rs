//! Opaque handles into a managed runtime
//!
//! A handle keeps a managed object alive from native code. Handles are
//! duplicated and released only through the owning runtime's callbacks;
//! native code never interprets the pointer.

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

/// Raw opaque handle value
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub *mut c_void);

// SAFETY: the pointer is an opaque token owned by the managed runtime, which
// accepts clone and free requests from any thread.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(std::ptr::null_mut());

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }
}

/// Duplicate a managed handle; the result is released independently
pub type CloneHandleFn = unsafe extern "system" fn(handle: *mut c_void) -> *mut c_void;

/// Release a managed handle
pub type FreeHandleFn = unsafe extern "system" fn(handle: *mut c_void);

/// Handle lifetime operations provided by the managed runtime
pub trait HandleRuntime: Send + Sync {
    fn clone_handle(&self, handle: RawHandle) -> RawHandle;

    fn free_handle(&self, handle: RawHandle);
}

/// Runtime backed by callbacks installed from the managed side
#[derive(Clone, Copy)]
pub struct ExternHandleRuntime {
    clone: CloneHandleFn,
    free: FreeHandleFn,
}

impl ExternHandleRuntime {
    /// # Safety
    ///
    /// Both callbacks must be valid for the lifetime of every handle created
    /// through this runtime and must be callable from any thread.
    pub unsafe fn new(clone: CloneHandleFn, free: FreeHandleFn) -> Self {
        Self { clone, free }
    }
}

impl HandleRuntime for ExternHandleRuntime {
    fn clone_handle(&self, handle: RawHandle) -> RawHandle {
        // SAFETY: guaranteed by the contract of `ExternHandleRuntime::new`.
        RawHandle(unsafe { (self.clone)(handle.0) })
    }

    fn free_handle(&self, handle: RawHandle) {
        // SAFETY: guaranteed by the contract of `ExternHandleRuntime::new`.
        unsafe { (self.free)(handle.0) }
    }
}

impl fmt::Debug for ExternHandleRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternHandleRuntime").finish_non_exhaustive()
    }
}

/// Owned managed handle
///
/// Cloning asks the runtime for an independent handle; dropping releases
/// this one exactly once. A null handle is never passed to the runtime.
pub struct ManagedHandle {
    raw: RawHandle,
    runtime: Arc<dyn HandleRuntime>,
}

impl ManagedHandle {
    /// Take ownership of a raw handle
    ///
    /// # Safety
    ///
    /// `raw` must be null or a live handle of `runtime` that no one else
    /// will release.
    pub unsafe fn from_raw(raw: RawHandle, runtime: Arc<dyn HandleRuntime>) -> Self {
        Self { raw, runtime }
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }

    pub fn runtime(&self) -> &Arc<dyn HandleRuntime> {
        &self.runtime
    }

    /// Give up ownership without releasing the handle
    pub fn into_raw(self) -> RawHandle {
        let raw = self.raw;
        std::mem::forget(self);
        raw
    }
}

impl Clone for ManagedHandle {
    fn clone(&self) -> Self {
        let raw = if self.raw.is_null() {
            RawHandle::NULL
        } else {
            self.runtime.clone_handle(self.raw)
        };
        Self {
            raw,
            runtime: self.runtime.clone(),
        }
    }
}

impl Drop for ManagedHandle {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            self.runtime.free_handle(std::mem::replace(&mut self.raw, RawHandle::NULL));
        }
    }
}

impl fmt::Debug for ManagedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ManagedHandle").field(&self.raw.0).finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runtime that hands out numbered handles and tracks which are live
    #[derive(Default)]
    pub struct CountingRuntime {
        next: AtomicUsize,
        pub clones: AtomicUsize,
        pub frees: AtomicUsize,
        live: Mutex<HashMap<usize, usize>>,
    }

    impl CountingRuntime {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                next: AtomicUsize::new(1),
                ..Default::default()
            })
        }

        pub fn alloc(&self) -> RawHandle {
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            *self.live.lock().entry(id).or_default() += 1;
            RawHandle(id as *mut c_void)
        }

        pub fn live(&self) -> usize {
            self.live.lock().values().sum()
        }
    }

    impl HandleRuntime for CountingRuntime {
        fn clone_handle(&self, _handle: RawHandle) -> RawHandle {
            self.clones.fetch_add(1, Ordering::SeqCst);
            self.alloc()
        }

        fn free_handle(&self, handle: RawHandle) {
            self.frees.fetch_add(1, Ordering::SeqCst);
            let mut live = self.live.lock();
            let id = handle.0 as usize;
            let count = live.get_mut(&id).expect("handle freed twice");
            *count -= 1;
            if *count == 0 {
                live.remove(&id);
            }
        }
    }
}
