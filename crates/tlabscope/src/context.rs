//! Call contexts of the trapped allocation entry points.

use crate::aggregator::AllocationEvent;

/// Shared library of the monitored runtime that exports the allocation entry points.
pub const RUNTIME_LIBRARY: &str = "libjvm.so";

/// Read access to the integer arguments of a trapped call.
///
/// Index `n` is the `n`th integer argument in the platform calling convention. Indices
/// past what the context holds read as 0.
pub trait CallContext {
    fn arg(&self, index: usize) -> u64;

    /// Process that made the call, when the attachment layer knows it.
    fn process_id(&self) -> Option<u32> {
        None
    }
}

/// Host-filled snapshot of a trapped call.
///
/// `args` holds the first six integer arguments in calling-convention order:
///
/// | index | x86_64 SysV | aarch64 |
/// |-------|-------------|---------|
/// | 0     | `rdi`       | `x0`    |
/// | 1     | `rsi`       | `x1`    |
/// | 2     | `rdx`       | `x2`    |
/// | 3     | `rcx`       | `x3`    |
/// | 4     | `r8`        | `x4`    |
/// | 5     | `r9`        | `x5`    |
///
/// A `pid` of 0 means unknown; the aggregator then attributes the event to its own
/// configured process.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterContext {
    pub pid: u32,
    pub args: [u64; 6],
}

impl RegisterContext {
    pub const fn new(pid: u32, args: [u64; 6]) -> Self {
        Self { pid, args }
    }
}

impl CallContext for RegisterContext {
    #[inline]
    fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    #[inline]
    fn process_id(&self) -> Option<u32> {
        (self.pid != 0).then_some(self.pid)
    }
}

impl<C: CallContext + ?Sized> CallContext for &C {
    fn arg(&self, index: usize) -> u64 {
        (**self).arg(index)
    }

    fn process_id(&self) -> Option<u32> {
        (**self).process_id()
    }
}

/// The two hooked allocation paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocPath {
    /// `AllocTracer::send_allocation_outside_tlab_event(KlassHandle klass, size_t alloc_size)`
    OutsideTlab,
    /// `AllocTracer::send_allocation_in_new_tlab_event(KlassHandle klass, size_t tlab_size,
    /// size_t alloc_size)`
    InNewTlab,
}

impl AllocPath {
    pub const ALL: [AllocPath; 2] = [AllocPath::OutsideTlab, AllocPath::InNewTlab];

    /// Mangled name of the entry point inside [`RUNTIME_LIBRARY`].
    pub fn symbol(&self) -> &'static str {
        match self {
            AllocPath::OutsideTlab => {
                "_ZN11AllocTracer34send_allocation_outside_tlab_eventE11KlassHandlem"
            }
            AllocPath::InNewTlab => {
                "_ZN11AllocTracer33send_allocation_in_new_tlab_eventE11KlassHandlemm"
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocPath::OutsideTlab => "outside-tlab",
            AllocPath::InNewTlab => "in-new-tlab",
        }
    }

    /// Reads exactly this path's arguments and fills the missing field with 0.
    #[inline]
    pub fn extract<C: CallContext + ?Sized>(&self, ctx: &C) -> AllocationEvent {
        match self {
            AllocPath::OutsideTlab => AllocationEvent {
                class_handle: ctx.arg(0),
                size: ctx.arg(1),
                tlab_size: 0,
            },
            AllocPath::InNewTlab => AllocationEvent {
                class_handle: ctx.arg(0),
                tlab_size: ctx.arg(1),
                size: ctx.arg(2),
            },
        }
    }
}
