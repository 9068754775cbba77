//! Handle callbacks installed by the managed runtime
//!
//! The managed side installs its clone and free callbacks once at startup.
//! Every handle that crosses the boundary afterwards is owned through the
//! installed runtime.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use tessera_kernel::HandleRuntime;
use tessera_kernel::handle::{CloneHandleFn, ExternHandleRuntime, FreeHandleFn};

use crate::error::{FfiError, FfiResult};

static RUNTIME: RwLock<Option<Arc<ExternHandleRuntime>>> = RwLock::new(None);

/// Install (or replace) the callbacks
///
/// # Safety
///
/// Same contract as [`ExternHandleRuntime::new`].
pub(crate) unsafe fn install(clone: CloneHandleFn, free: FreeHandleFn) {
    // SAFETY: forwarded from the caller.
    let runtime = unsafe { ExternHandleRuntime::new(clone, free) };
    let replaced = RUNTIME.write().replace(Arc::new(runtime)).is_some();
    info!(replaced, "Managed handle callbacks installed");
}

/// Currently installed runtime
pub(crate) fn current() -> FfiResult<Arc<dyn HandleRuntime>> {
    RUNTIME
        .read()
        .clone()
        .map(|runtime| runtime as Arc<dyn HandleRuntime>)
        .ok_or(FfiError::RuntimeNotInstalled)
}
