//! A low-overhead allocation event aggregator for managed runtimes.
//!
//! Two allocation entry points of the monitored runtime are hooked (see [`hooks`]); every
//! event is attributed to a deduplicated call stack, the allocated type's name is recovered
//! from the runtime's own class metadata with raw memory reads, and counters are accumulated
//! per `(process, stack)` bucket in a bounded lock-free table.
//!
//! Nothing on the event path allocates, blocks or propagates errors to the instrumented
//! program: unreadable memory yields an empty type name, a failed stack capture yields
//! [`StackId::UNKNOWN`] and a full table drops the event.
//!
//! ## Usage
//!
//! ```rust
//! use tlabscope::{Aggregator, RegisterContext, RuntimeLayout, Verdict};
//!
//! let aggregator = Aggregator::builder()
//!     .runtime(RuntimeLayout::HotspotJdk8)
//!     .build()
//!     .unwrap();
//!
//! // The attachment layer fills the trapped call's arguments.
//! let ctx = RegisterContext::new(std::process::id(), [0, 128, 0, 0, 0, 0]);
//! assert_eq!(aggregator.alloc_outside_tlab(&ctx), Verdict::Suppress);
//!
//! let snapshot = aggregator.snapshot();
//! assert_eq!(snapshot.entries[0].count, 1);
//! assert_eq!(snapshot.entries[0].size, 128);
//! ```

mod aggregator;
mod config;
mod context;
mod error;
pub mod hooks;
mod layout;
mod memory;
pub mod output;
mod stack;
mod table;
mod type_name;

pub use aggregator::{AllocationEvent, Aggregator, AggregatorBuilder, Verdict};
pub use config::AggregatorConfig;
pub use context::{AllocPath, CallContext, RegisterContext, RUNTIME_LIBRARY};
pub use error::{ConfigError, InstallError, ReadFault};
pub use hooks::{install, installed, uninstall};
pub use layout::{FieldLayout, LayoutDescriptor, RuntimeLayout};
pub use memory::{MemoryReader, ProcessMemory, SyntheticMemory};
pub use output::{format_bytes, Format, Reporter, Snapshot, SnapshotEntry};
pub use stack::{
    BacktraceWalker, StackId, StackRecord, StackTable, StackWalker, DEFAULT_STACK_CAPACITY,
    MAX_STACK_DEPTH,
};
pub use table::{
    AggregatedData, AggregationTable, EventKey, Recorded, TableFull, DEFAULT_TABLE_CAPACITY,
};
pub use type_name::{TypeName, TypeNameResolver, TYPE_NAME_LEN};
