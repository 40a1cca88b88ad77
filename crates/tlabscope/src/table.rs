//! Bounded lock-free aggregation table.
//!
//! Fixed-size open addressing with linear probing, no deletion. A bucket moves
//! `EMPTY -> INITIALIZING -> READY` exactly once: the thread whose CAS wins the
//! `EMPTY -> INITIALIZING` step writes the key, the first event's counters and the type
//! name, then publishes with a release store. Every other event for that key is a set of
//! relaxed `fetch_add`s on the bucket's counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use thiserror::Error;

use crate::stack::StackId;
use crate::type_name::{TypeName, TYPE_NAME_LEN};

/// Default number of buckets, the size of a default kernel BPF hash map.
pub const DEFAULT_TABLE_CAPACITY: usize = 10240;

const EMPTY: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

const NAME_WORDS: usize = TYPE_NAME_LEN / 8;
const SPINS_BEFORE_YIELD: u32 = 64;

/// Identifies one aggregation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub process_id: u32,
    pub stack_id: StackId,
}

impl EventKey {
    pub fn new(process_id: u32, stack_id: StackId) -> Self {
        Self {
            process_id,
            stack_id,
        }
    }

    fn bucket_hash(&self) -> u64 {
        let pid = self.process_id as u64;
        let mixed = self.stack_id.0 ^ ((pid << 32) | pid);
        mixed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(29)
    }
}

/// Counters accumulated for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatedData {
    pub count: u64,
    pub tlab_size: u64,
    pub size: u64,
    pub type_name: TypeName,
}

/// Outcome of a successful [`AggregationTable::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// First event for the key; the bucket was created with this event's values.
    Created,
    /// The key already existed and its counters were incremented.
    Updated,
}

/// The key was new and no bucket was left for it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("aggregation table is full ({capacity} keys)")]
pub struct TableFull {
    pub capacity: usize,
}

struct Bucket {
    state: AtomicU8,
    process_id: AtomicU32,
    stack_id: AtomicU64,
    count: AtomicU64,
    tlab_size: AtomicU64,
    size: AtomicU64,
    type_name: [AtomicU64; NAME_WORDS],
}

impl Bucket {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            process_id: AtomicU32::new(0),
            stack_id: AtomicU64::new(0),
            count: AtomicU64::new(0),
            tlab_size: AtomicU64::new(0),
            size: AtomicU64::new(0),
            type_name: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Only meaningful once the bucket is `READY`.
    fn holds(&self, key: &EventKey) -> bool {
        self.process_id.load(Ordering::Relaxed) == key.process_id
            && self.stack_id.load(Ordering::Relaxed) == key.stack_id.0
    }

    #[inline]
    fn add(&self, size: u64, tlab_size: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.size.fetch_add(size, Ordering::Relaxed);
        self.tlab_size.fetch_add(tlab_size, Ordering::Relaxed);
    }

    fn store_name(&self, name: &TypeName) {
        for (word, chunk) in self.type_name.iter().zip(name.as_bytes().chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            word.store(u64::from_ne_bytes(raw), Ordering::Relaxed);
        }
    }

    fn load_name(&self) -> TypeName {
        let mut raw = [0u8; TYPE_NAME_LEN];
        for (word, chunk) in self.type_name.iter().zip(raw.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_ne_bytes());
        }
        TypeName::from_array(raw)
    }

    fn data(&self) -> AggregatedData {
        AggregatedData {
            count: self.count.load(Ordering::Relaxed),
            tlab_size: self.tlab_size.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            type_name: self.load_name(),
        }
    }

    fn key(&self) -> EventKey {
        EventKey {
            process_id: self.process_id.load(Ordering::Relaxed),
            stack_id: StackId(self.stack_id.load(Ordering::Relaxed)),
        }
    }

    /// Spins until a bucket claimed by another thread is published.
    fn wait_ready(&self) -> u8 {
        let mut spins = 0u32;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state != INITIALIZING {
                return state;
            }
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }
}

pub struct AggregationTable {
    buckets: Box<[Bucket]>,
    len: AtomicUsize,
    max_distance: AtomicUsize,
}

impl AggregationTable {
    /// Allocates all `capacity` buckets up front.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buckets: (0..capacity).map(|_| Bucket::new()).collect(),
            len: AtomicUsize::new(0),
            max_distance: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slots(&self, key: &EventKey, limit: usize) -> impl Iterator<Item = (usize, &Bucket)> {
        let capacity = self.buckets.len();
        let start = (key.bucket_hash() % capacity as u64) as usize;
        (0..limit.min(capacity)).map(move |i| (i, &self.buckets[(start + i) % capacity]))
    }

    /// Fetch-or-initialize, then increment.
    ///
    /// `type_name` is only called by the thread that claims the bucket for a new key, so
    /// the first writer's name wins and updates never resolve a name. A full table rejects
    /// new keys after a lookup bounded by the longest displacement seen so far, without
    /// calling `type_name`. The per-key sequence is linearizable; two concurrent first
    /// events for one key yield exactly one `Created` and one `Updated`.
    pub fn record<F>(
        &self,
        key: EventKey,
        size: u64,
        tlab_size: u64,
        type_name: F,
    ) -> Result<Recorded, TableFull>
    where
        F: FnOnce() -> TypeName,
    {
        if let Some(bucket) = self.find(&key) {
            bucket.add(size, tlab_size);
            return Ok(Recorded::Updated);
        }
        if self.len.load(Ordering::Acquire) >= self.capacity() {
            // The bound read by `find` may predate the insert that filled the table.
            if let Some(bucket) = self.find(&key) {
                bucket.add(size, tlab_size);
                return Ok(Recorded::Updated);
            }
            return Err(TableFull {
                capacity: self.capacity(),
            });
        }

        let mut type_name = Some(type_name);

        for (distance, bucket) in self.slots(&key, self.capacity()) {
            loop {
                match bucket.state.load(Ordering::Acquire) {
                    READY => {
                        if bucket.holds(&key) {
                            bucket.add(size, tlab_size);
                            return Ok(Recorded::Updated);
                        }
                        break;
                    }
                    INITIALIZING => {
                        bucket.wait_ready();
                    }
                    _ => {
                        if bucket
                            .state
                            .compare_exchange(
                                EMPTY,
                                INITIALIZING,
                                Ordering::Acquire,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            let name = type_name
                                .take()
                                .map(|resolve| resolve())
                                .unwrap_or_default();
                            bucket.process_id.store(key.process_id, Ordering::Relaxed);
                            bucket.stack_id.store(key.stack_id.0, Ordering::Relaxed);
                            bucket.count.store(1, Ordering::Relaxed);
                            bucket.size.store(size, Ordering::Relaxed);
                            bucket.tlab_size.store(tlab_size, Ordering::Relaxed);
                            bucket.store_name(&name);
                            self.max_distance.fetch_max(distance, Ordering::Relaxed);
                            bucket.state.store(READY, Ordering::Release);
                            self.len.fetch_add(1, Ordering::Release);
                            return Ok(Recorded::Created);
                        }
                    }
                }
            }
        }

        Err(TableFull {
            capacity: self.capacity(),
        })
    }

    /// Looks up a published bucket holding `key`.
    ///
    /// Stops at the first empty bucket or after the longest displacement any key was
    /// inserted at. A key published concurrently with a stale bound is missed here and
    /// found again by the insertion scan in [`record`](Self::record).
    fn find(&self, key: &EventKey) -> Option<&Bucket> {
        let limit = self.max_distance.load(Ordering::Relaxed) + 1;
        for (_, bucket) in self.slots(key, limit) {
            match bucket.state.load(Ordering::Acquire) {
                EMPTY => return None,
                READY if bucket.holds(key) => return Some(bucket),
                READY => {}
                _ => {
                    if bucket.wait_ready() == READY && bucket.holds(key) {
                        return Some(bucket);
                    }
                }
            }
        }
        None
    }

    pub fn get(&self, key: &EventKey) -> Option<AggregatedData> {
        self.find(key).map(Bucket::data)
    }

    /// Copies every published bucket.
    ///
    /// Counters of one bucket are read one after another, so under concurrent updates a
    /// row may combine a `count` and a `size` from slightly different moments.
    pub fn entries(&self) -> Vec<(EventKey, AggregatedData)> {
        self.buckets
            .iter()
            .filter(|bucket| bucket.state.load(Ordering::Acquire) == READY)
            .map(|bucket| (bucket.key(), bucket.data()))
            .collect()
    }
}
