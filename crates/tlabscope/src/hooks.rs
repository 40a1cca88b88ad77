//! Process-wide aggregator and the C ABI attach points.
//!
//! The attachment layer (a user-space breakpoint handler or a test harness) calls
//! [`alloc_outside_tlab`] or [`alloc_in_new_tlab`] with a filled [`RegisterContext`] and
//! hands the returned integer back to the runtime. Both functions load the installed
//! aggregator without locking and never unwind into the caller.

use arc_swap::ArcSwapOption;
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock};

use crate::aggregator::{Aggregator, Verdict};
use crate::context::{AllocPath, RegisterContext};
use crate::error::InstallError;

static AGGREGATOR: OnceLock<ArcSwapOption<Aggregator>> = OnceLock::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

fn slot() -> &'static ArcSwapOption<Aggregator> {
    AGGREGATOR.get_or_init(|| ArcSwapOption::from(None))
}

/// Makes `aggregator` the target of the C ABI hooks.
///
/// Fails if another aggregator is installed; [`uninstall`] it first.
pub fn install(aggregator: Aggregator) -> Result<Arc<Aggregator>, InstallError> {
    let _guard = INSTALL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let slot = slot();
    if slot.load().is_some() {
        tracing::warn!(target: "tlabscope::hooks", "aggregator already installed");
        return Err(InstallError::AlreadyInstalled);
    }

    let aggregator = Arc::new(aggregator);
    slot.store(Some(Arc::clone(&aggregator)));
    tracing::info!(
        target: "tlabscope::hooks",
        process_id = aggregator.process_id(),
        verdict = ?aggregator.verdict(),
        "aggregator installed"
    );
    Ok(aggregator)
}

/// Detaches the installed aggregator and returns it for a final drain.
///
/// Hook calls already running keep their own reference and finish against it.
pub fn uninstall() -> Option<Arc<Aggregator>> {
    let _guard = INSTALL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let previous = slot().swap(None);
    if let Some(aggregator) = &previous {
        tracing::info!(
            target: "tlabscope::hooks",
            keys = aggregator.table().len(),
            dropped = aggregator.dropped_events(),
            "aggregator uninstalled"
        );
    }
    previous
}

pub fn installed() -> Option<Arc<Aggregator>> {
    AGGREGATOR.get().and_then(|slot| slot.load_full())
}

#[inline]
fn dispatch(path: AllocPath, ctx: *const RegisterContext) -> c_int {
    // SAFETY: the caller guarantees `ctx` is null or points at a live context for the
    // duration of the call.
    let Some(ctx) = (unsafe { ctx.as_ref() }) else {
        return Verdict::Suppress.code();
    };
    let Some(slot) = AGGREGATOR.get() else {
        return Verdict::Suppress.code();
    };
    let guard = slot.load();
    let Some(aggregator) = &*guard else {
        return Verdict::Suppress.code();
    };

    catch_unwind(AssertUnwindSafe(|| aggregator.handle(path, ctx)))
        .unwrap_or(Verdict::Suppress)
        .code()
}

/// Attach point for `AllocTracer::send_allocation_outside_tlab_event`.
///
/// Returns 0 to suppress the runtime's own event or 1 to forward it. Returns 0 without
/// recording anything when `ctx` is null or no aggregator is installed.
///
/// # Safety
///
/// `ctx` must be null or valid for reads of a `RegisterContext` for the whole call.
#[no_mangle]
pub unsafe extern "C" fn alloc_outside_tlab(ctx: *const RegisterContext) -> c_int {
    dispatch(AllocPath::OutsideTlab, ctx)
}

/// Attach point for `AllocTracer::send_allocation_in_new_tlab_event`.
///
/// Same contract as [`alloc_outside_tlab`].
///
/// # Safety
///
/// `ctx` must be null or valid for reads of a `RegisterContext` for the whole call.
#[no_mangle]
pub unsafe extern "C" fn alloc_in_new_tlab(ctx: *const RegisterContext) -> c_int {
    dispatch(AllocPath::InNewTlab, ctx)
}
