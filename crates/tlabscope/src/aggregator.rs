use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::AggregatorConfig;
use crate::context::{AllocPath, CallContext};
use crate::error::ConfigError;
use crate::layout::{LayoutDescriptor, RuntimeLayout};
use crate::memory::{MemoryReader, ProcessMemory};
use crate::output::{Snapshot, SnapshotEntry};
use crate::stack::{BacktraceWalker, StackId, StackRecord, StackTable, StackWalker};
use crate::table::{AggregatedData, AggregationTable, EventKey, Recorded, TableFull};
use crate::type_name::{TypeName, TypeNameResolver};

/// One allocation, normalized across entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationEvent {
    pub class_handle: u64,
    pub size: u64,
    pub tlab_size: u64,
}

/// Per-event decision handed back to the attachment layer.
///
/// `Suppress` (0) drops the runtime's own allocation event after it has been counted,
/// `Forward` (1) lets it continue to the runtime's regular event consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum Verdict {
    #[default]
    Suppress = 0,
    Forward = 1,
}

impl Verdict {
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Aggregates allocation events per `(process, call stack)`.
///
/// All state is allocated by [`AggregatorBuilder::build`]; the event methods only touch
/// preallocated atomics and can be called concurrently from any number of threads.
pub struct Aggregator<M = ProcessMemory, W = BacktraceWalker> {
    process_id: u32,
    verdict: Verdict,
    walker: W,
    stacks: StackTable,
    types: TypeNameResolver<M>,
    table: AggregationTable,
    dropped: AtomicU64,
}

impl Aggregator {
    /// Starts an [`AggregatorBuilder`] reading the current process with the platform
    /// unwinder.
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::new()
    }
}

impl<M: MemoryReader, W: StackWalker> Aggregator<M, W> {
    /// Attach point for allocations made outside any thread-local buffer.
    #[inline]
    pub fn alloc_outside_tlab<C: CallContext + ?Sized>(&self, ctx: &C) -> Verdict {
        self.handle(AllocPath::OutsideTlab, ctx)
    }

    /// Attach point for allocations that started a fresh thread-local buffer.
    #[inline]
    pub fn alloc_in_new_tlab<C: CallContext + ?Sized>(&self, ctx: &C) -> Verdict {
        self.handle(AllocPath::InNewTlab, ctx)
    }

    /// Normalizes the arguments of `path` and counts the event under the context's process,
    /// falling back to the configured one.
    #[inline]
    pub fn handle<C: CallContext + ?Sized>(&self, path: AllocPath, ctx: &C) -> Verdict {
        let event = path.extract(ctx);
        let process_id = ctx.process_id().unwrap_or(self.process_id);
        self.generate_event(process_id, event)
    }

    /// Counts `event` and returns the configured verdict.
    ///
    /// Never fails: a full table is recorded in [`Aggregator::dropped_events`].
    #[inline]
    pub fn generate_event(&self, process_id: u32, event: AllocationEvent) -> Verdict {
        if self.record_event(process_id, event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.verdict
    }

    /// Like [`Aggregator::generate_event`] but reports how the table was affected and does
    /// not count drops.
    pub fn record_event(
        &self,
        process_id: u32,
        event: AllocationEvent,
    ) -> Result<Recorded, TableFull> {
        let key = EventKey::new(process_id, self.resolve_stack());
        self.table.record(key, event.size, event.tlab_size, || {
            self.resolve_type_name(event.class_handle)
        })
    }

    #[inline]
    pub fn resolve_stack(&self) -> StackId {
        self.stacks.capture(&self.walker)
    }

    #[inline]
    pub fn resolve_type_name(&self, class_handle: u64) -> TypeName {
        self.types.resolve(class_handle)
    }

    /// Current counters of one key, if it has been recorded.
    pub fn get(&self, key: &EventKey) -> Option<AggregatedData> {
        self.table.get(key)
    }

    /// Frames currently stored under `id`.
    pub fn stack(&self, id: StackId) -> Option<StackRecord> {
        self.stacks.lookup(id)
    }

    /// Events lost because their key was new and the table was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Copies the aggregation table together with the frames of every referenced stack.
    ///
    /// Entries are ordered by total allocated bytes, largest first.
    pub fn snapshot(&self) -> Snapshot {
        let mut entries: Vec<SnapshotEntry> = self
            .table
            .entries()
            .into_iter()
            .map(|(key, data)| SnapshotEntry {
                pid: key.process_id,
                stack_id: key.stack_id,
                type_name: data.type_name.to_string_lossy().into_owned(),
                count: data.count,
                size: data.size,
                tlab_size: data.tlab_size,
                frames: self
                    .stacks
                    .lookup(key.stack_id)
                    .map(|record| record.frames)
                    .unwrap_or_default(),
            })
            .collect();
        entries.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then_with(|| b.count.cmp(&a.count))
                .then_with(|| (a.pid, a.stack_id).cmp(&(b.pid, b.stack_id)))
        });

        Snapshot {
            entries,
            dropped_events: self.dropped_events(),
            table_len: self.table.len(),
            table_capacity: self.table.capacity(),
            stacks_len: self.stacks.occupied(),
            stacks_capacity: self.stacks.capacity(),
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn layout(&self) -> &LayoutDescriptor {
        self.types.layout()
    }

    pub fn table(&self) -> &AggregationTable {
        &self.table
    }

    pub fn stacks(&self) -> &StackTable {
        &self.stacks
    }
}

/// Builder for an [`Aggregator`].
///
/// Every setting starts from [`AggregatorConfig::default`]. At [`build`](Self::build) time
/// the `TLABSCOPE_*` environment variables are applied on top of what the builder was told,
/// then the result is validated.
///
/// # Examples
///
/// ```rust
/// use tlabscope::{Aggregator, RuntimeLayout, Verdict};
///
/// let aggregator = Aggregator::builder()
///     .runtime(RuntimeLayout::HotspotJdk11)
///     .table_capacity(4096)
///     .verdict(Verdict::Forward)
///     .build()
///     .unwrap();
/// assert_eq!(aggregator.table().capacity(), 4096);
/// ```
///
/// Reading a synthetic heap instead of process memory:
///
/// ```rust
/// use tlabscope::{Aggregator, SyntheticMemory};
///
/// let heap = SyntheticMemory::new().map(0x1000, 64);
/// let aggregator = Aggregator::builder().memory(heap).build().unwrap();
/// assert!(aggregator.resolve_type_name(0x1000).is_empty());
/// ```
pub struct AggregatorBuilder<M = ProcessMemory, W = BacktraceWalker> {
    config: AggregatorConfig,
    memory: M,
    walker: W,
}

impl AggregatorBuilder {
    pub fn new() -> Self {
        Self {
            config: AggregatorConfig::default(),
            memory: ProcessMemory::current(),
            walker: BacktraceWalker,
        }
    }
}

impl Default for AggregatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MemoryReader, W: StackWalker> AggregatorBuilder<M, W> {
    /// Replaces every setting with `config`.
    pub fn config(mut self, config: AggregatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Selects a known runtime build. Clears any custom layout.
    ///
    /// Default: [`RuntimeLayout::HotspotJdk8`]
    pub fn runtime(mut self, runtime: RuntimeLayout) -> Self {
        self.config.runtime = runtime;
        self.config.layout = None;
        self
    }

    /// Uses explicit field offsets instead of a preset.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tlabscope::{Aggregator, FieldLayout, LayoutDescriptor};
    ///
    /// let aggregator = Aggregator::builder()
    ///     .layout(LayoutDescriptor {
    ///         class_name: FieldLayout::new(32, 8),
    ///         name_chars: FieldLayout::new(6, 64),
    ///     })
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(aggregator.layout().class_name.offset, 32);
    /// ```
    pub fn layout(mut self, layout: LayoutDescriptor) -> Self {
        self.config.layout = Some(layout);
        self
    }

    /// Number of distinct call stacks kept.
    ///
    /// Default: `8192`
    pub fn stack_capacity(mut self, capacity: usize) -> Self {
        self.config.stack_capacity = capacity;
        self
    }

    /// Frames captured per stack, at most [`MAX_STACK_DEPTH`](crate::MAX_STACK_DEPTH).
    ///
    /// Default: `127`
    pub fn stack_depth(mut self, depth: usize) -> Self {
        self.config.stack_depth = depth;
        self
    }

    /// Number of distinct `(process, stack)` keys kept. Events for new keys beyond this are
    /// dropped.
    ///
    /// Default: `10240`
    pub fn table_capacity(mut self, capacity: usize) -> Self {
        self.config.table_capacity = capacity;
        self
    }

    /// Decision returned for every event.
    ///
    /// Default: [`Verdict::Suppress`]
    pub fn verdict(mut self, verdict: Verdict) -> Self {
        self.config.verdict = verdict;
        self
    }

    /// Process events are attributed to when the call context does not carry one.
    ///
    /// Default: the current process
    pub fn process_id(mut self, pid: u32) -> Self {
        self.config.process_id = Some(pid);
        self
    }

    /// Reads class metadata through `memory`.
    pub fn memory<M2: MemoryReader>(self, memory: M2) -> AggregatorBuilder<M2, W> {
        AggregatorBuilder {
            config: self.config,
            memory,
            walker: self.walker,
        }
    }

    /// Captures call stacks with `walker`.
    pub fn walker<W2: StackWalker>(self, walker: W2) -> AggregatorBuilder<M, W2> {
        AggregatorBuilder {
            config: self.config,
            memory: self.memory,
            walker,
        }
    }

    /// Applies the `TLABSCOPE_*` environment, validates and allocates both tables.
    pub fn build(self) -> Result<Aggregator<M, W>, ConfigError> {
        self.build_with_env(|var| std::env::var(var).ok())
    }

    /// Same as [`build`](Self::build) with environment lookups going through `lookup`.
    pub fn build_with_env<F>(mut self, lookup: F) -> Result<Aggregator<M, W>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.config.apply_env_with(lookup)?;
        self.config.validate()?;

        let config = self.config;
        let layout = config.layout();
        let process_id = config.process_id.unwrap_or_else(std::process::id);

        tracing::debug!(
            target: "tlabscope::aggregator",
            runtime = %config.runtime,
            custom_layout = config.layout.is_some(),
            class_name_offset = layout.class_name.offset,
            name_chars_offset = layout.name_chars.offset,
            stack_capacity = config.stack_capacity,
            stack_depth = config.stack_depth,
            table_capacity = config.table_capacity,
            verdict = ?config.verdict,
            process_id,
            "building aggregator"
        );

        Ok(Aggregator {
            process_id,
            verdict: config.verdict,
            walker: self.walker,
            stacks: StackTable::new(config.stack_capacity, config.stack_depth),
            types: TypeNameResolver::new(layout, self.memory),
            table: AggregationTable::new(config.table_capacity),
            dropped: AtomicU64::new(0),
        })
    }
}
