//! Deduplicated call-stack table.
//!
//! Stacks are stored in a fixed array of slots indexed by a hash of their frames, so the
//! id of a stack is its slot index. An identical stack always lands on the same slot and
//! reuses its id. A different stack hashing to an occupied slot replaces the previous
//! occupant, which keeps the table bounded at the cost of occasionally re-attributing an
//! old id.
//!
//! Each slot is guarded by a sequence counter: writers claim it with a CAS from even to
//! odd and publish with the next even value, readers retry if the counter moved while they
//! copied. Nobody ever waits on a slot another thread is writing.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

/// Number of distinct stacks the table can hold.
pub const DEFAULT_STACK_CAPACITY: usize = 8192;

/// Upper bound on frames captured per stack (the perf stack depth limit).
pub const MAX_STACK_DEPTH: usize = 127;

const READ_RETRIES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackId(pub u64);

impl StackId {
    /// Substituted when no stack could be captured. Events carrying it are still
    /// aggregated, under one shared bucket per process.
    pub const UNKNOWN: StackId = StackId(u64::MAX);

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "unknown")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Return addresses of one captured stack, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRecord {
    pub frames: Vec<u64>,
}

/// Produces the return addresses of the calling thread.
pub trait StackWalker: Send + Sync {
    /// Fills `frames` innermost first and returns how many were written.
    fn walk(&self, frames: &mut [u64]) -> usize;
}

/// Walks the current thread with the platform unwinder.
///
/// Only instruction pointers are collected; symbolication is left to whoever drains the
/// stack table.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktraceWalker;

impl StackWalker for BacktraceWalker {
    #[inline]
    fn walk(&self, frames: &mut [u64]) -> usize {
        let mut depth = 0;
        // SAFETY: the unwinder is only used to read instruction pointers; no symbol
        // resolution happens here, which is the part that needs the global lock.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if depth == frames.len() {
                    return false;
                }
                frames[depth] = frame.ip() as u64;
                depth += 1;
                true
            });
        }
        depth
    }
}

struct StackSlot {
    seq: AtomicU64,
    hash: AtomicU64,
    len: AtomicUsize,
}

pub struct StackTable {
    depth: usize,
    slots: Box<[StackSlot]>,
    frames: Box<[AtomicU64]>,
}

impl StackTable {
    /// Allocates every slot up front; the table never grows afterwards.
    pub fn new(capacity: usize, depth: usize) -> Self {
        let capacity = capacity.max(1);
        let depth = depth.clamp(1, MAX_STACK_DEPTH);

        let slots = (0..capacity)
            .map(|_| StackSlot {
                seq: AtomicU64::new(0),
                hash: AtomicU64::new(0),
                len: AtomicUsize::new(0),
            })
            .collect();
        let frames = (0..capacity * depth).map(|_| AtomicU64::new(0)).collect();

        Self {
            depth,
            slots,
            frames,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Walks the calling thread and interns the result.
    #[inline]
    pub fn capture<W: StackWalker + ?Sized>(&self, walker: &W) -> StackId {
        let mut frames = [0u64; MAX_STACK_DEPTH];
        let n = walker.walk(&mut frames[..self.depth]);
        self.intern(&frames[..n.min(self.depth)])
    }

    /// Returns the id for `frames`, recording them if the slot holds anything else.
    ///
    /// An empty stack maps to [`StackId::UNKNOWN`]. Frames beyond the table depth are
    /// ignored.
    pub fn intern(&self, frames: &[u64]) -> StackId {
        if frames.is_empty() {
            return StackId::UNKNOWN;
        }
        let frames = &frames[..frames.len().min(self.depth)];
        let hash = hash_frames(frames);
        let index = (hash % self.slots.len() as u64) as usize;
        let id = StackId(index as u64);
        let slot = &self.slots[index];

        let seq = slot.seq.load(Ordering::Acquire);
        if seq & 1 == 1 {
            // Someone is writing this slot right now, most likely the same hot stack.
            return id;
        }
        if self.matches(index, seq, hash, frames) {
            return id;
        }
        if slot
            .seq
            .compare_exchange(seq, seq + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return id;
        }
        fence(Ordering::Release);

        slot.hash.store(hash, Ordering::Relaxed);
        slot.len.store(frames.len(), Ordering::Relaxed);
        let base = index * self.depth;
        for (cell, &ip) in self.frames[base..base + frames.len()].iter().zip(frames) {
            cell.store(ip, Ordering::Relaxed);
        }

        slot.seq.store(seq + 2, Ordering::Release);
        id
    }

    fn matches(&self, index: usize, seq: u64, hash: u64, frames: &[u64]) -> bool {
        let slot = &self.slots[index];
        if slot.hash.load(Ordering::Relaxed) != hash
            || slot.len.load(Ordering::Relaxed) != frames.len()
        {
            return false;
        }
        let base = index * self.depth;
        let same = self.frames[base..base + frames.len()]
            .iter()
            .zip(frames)
            .all(|(cell, &ip)| cell.load(Ordering::Relaxed) == ip);
        fence(Ordering::Acquire);
        same && slot.seq.load(Ordering::Relaxed) == seq
    }

    /// Copies the stack currently stored under `id`.
    ///
    /// Returns `None` for [`StackId::UNKNOWN`], out-of-range ids, never-written slots, and
    /// slots that kept changing while being copied.
    pub fn lookup(&self, id: StackId) -> Option<StackRecord> {
        let index = usize::try_from(id.0).ok()?;
        let slot = self.slots.get(index)?;
        let base = index * self.depth;

        for _ in 0..READ_RETRIES {
            let seq = slot.seq.load(Ordering::Acquire);
            if seq & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let len = slot.len.load(Ordering::Relaxed).min(self.depth);
            let frames: Vec<u64> = self.frames[base..base + len]
                .iter()
                .map(|cell| cell.load(Ordering::Relaxed))
                .collect();
            fence(Ordering::Acquire);
            if slot.seq.load(Ordering::Relaxed) != seq {
                continue;
            }
            return if frames.is_empty() {
                None
            } else {
                Some(StackRecord { frames })
            };
        }
        None
    }

    /// Number of slots holding a stack.
    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.len.load(Ordering::Relaxed) > 0)
            .count()
    }
}

fn hash_frames(frames: &[u64]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for &ip in frames {
        hasher.write_u64(ip);
    }
    hasher.finish()
}
