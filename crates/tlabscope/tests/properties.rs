use std::sync::atomic::{AtomicU64, Ordering};

use tlabscope::{
    AggregatorBuilder, AllocationEvent, EventKey, RegisterContext, Recorded, RuntimeLayout,
    StackId, StackWalker, SyntheticMemory, TypeName, Verdict,
};

const STRING_KLASS: u64 = 0x10_0000;
const STRING_SYMBOL: u64 = 0x20_0000;
const OBJECT_KLASS: u64 = 0x30_0000;
const OBJECT_SYMBOL: u64 = 0x40_0000;

/// Reports whatever stack was last selected, like a thread sitting in one call site.
struct ScriptedStack(AtomicU64);

impl ScriptedStack {
    fn at(site: u64) -> Self {
        Self(AtomicU64::new(site))
    }
}

impl StackWalker for ScriptedStack {
    fn walk(&self, frames: &mut [u64]) -> usize {
        let site = self.0.load(Ordering::Relaxed);
        let stack = [site, 0x4000_0000, 0x5000_0000];
        let n = stack.len().min(frames.len());
        frames[..n].copy_from_slice(&stack[..n]);
        n
    }
}

fn no_env(_: &str) -> Option<String> {
    None
}

fn jdk8_heap() -> SyntheticMemory {
    let mut heap = SyntheticMemory::new()
        .map(STRING_KLASS, 64)
        .map(STRING_SYMBOL, 128)
        .map(OBJECT_KLASS, 64)
        .map(OBJECT_SYMBOL, 128);
    heap.write_u64(STRING_KLASS + 16, STRING_SYMBOL).unwrap();
    heap.write(STRING_SYMBOL + 8, b"java/lang/String").unwrap();
    heap.write_u64(OBJECT_KLASS + 16, OBJECT_SYMBOL).unwrap();
    heap.write(OBJECT_SYMBOL + 8, b"java/lang/Object").unwrap();
    heap
}

#[test]
fn repeated_events_accumulate_exact_sums() {
    let aggregator = AggregatorBuilder::new()
        .memory(jdk8_heap())
        .walker(ScriptedStack::at(0x1111))
        .process_id(10)
        .build_with_env(no_env)
        .unwrap();

    let sizes = [24u64, 32, 48, 4096, 16];
    for &size in &sizes {
        aggregator.alloc_outside_tlab(&RegisterContext::new(0, [STRING_KLASS, size, 0, 0, 0, 0]));
        aggregator.alloc_in_new_tlab(&RegisterContext::new(
            0,
            [STRING_KLASS, 8192, size, 0, 0, 0],
        ));
    }

    let key = EventKey::new(10, aggregator.resolve_stack());
    let data = aggregator.get(&key).unwrap();
    assert_eq!(data.count, 2 * sizes.len() as u64);
    assert_eq!(data.size, 2 * sizes.iter().sum::<u64>());
    assert_eq!(data.tlab_size, 8192 * sizes.len() as u64);
}

#[test]
fn first_observed_type_name_wins() {
    let aggregator = AggregatorBuilder::new()
        .memory(jdk8_heap())
        .walker(ScriptedStack::at(0x2222))
        .process_id(10)
        .build_with_env(no_env)
        .unwrap();

    aggregator.alloc_outside_tlab(&RegisterContext::new(0, [OBJECT_KLASS, 16, 0, 0, 0, 0]));
    aggregator.alloc_outside_tlab(&RegisterContext::new(0, [STRING_KLASS, 24, 0, 0, 0, 0]));

    let snapshot = aggregator.snapshot();
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].type_name, "java/lang/Object");
    assert_eq!(snapshot.entries[0].count, 2);
}

#[test]
fn both_paths_normalize_to_the_same_counters() {
    let build = || {
        AggregatorBuilder::new()
            .memory(jdk8_heap())
            .walker(ScriptedStack::at(0x3333))
            .process_id(10)
            .build_with_env(no_env)
            .unwrap()
    };

    let outside = build();
    outside.alloc_outside_tlab(&RegisterContext::new(0, [STRING_KLASS, 100, 0, 0, 0, 0]));

    let in_new = build();
    in_new.alloc_in_new_tlab(&RegisterContext::new(0, [STRING_KLASS, 0, 100, 0, 0, 0]));

    let a = outside.snapshot();
    let b = in_new.snapshot();
    assert_eq!(a.entries, b.entries);
    assert_eq!(a.entries[0].size, 100);
    assert_eq!(a.entries[0].tlab_size, 0);
}

#[test]
fn unmapped_class_handle_degrades_to_empty_name() {
    let aggregator = AggregatorBuilder::new()
        .memory(jdk8_heap())
        .walker(ScriptedStack::at(0x4444))
        .process_id(10)
        .build_with_env(no_env)
        .unwrap();

    for _ in 0..3 {
        let verdict =
            aggregator.alloc_outside_tlab(&RegisterContext::new(0, [0xdead_beef, 40, 0, 0, 0, 0]));
        assert_eq!(verdict, Verdict::Suppress);
    }

    let key = EventKey::new(10, aggregator.resolve_stack());
    let data = aggregator.get(&key).unwrap();
    assert_eq!(data.type_name, TypeName::EMPTY);
    assert_eq!(data.count, 3);
    assert_eq!(data.size, 120);
}

#[test]
fn identical_stacks_reuse_their_id() {
    let aggregator = AggregatorBuilder::new()
        .memory(SyntheticMemory::new())
        .walker(ScriptedStack::at(0x5555))
        .build_with_env(no_env)
        .unwrap();

    let first = aggregator.resolve_stack();
    let second = aggregator.resolve_stack();
    assert_eq!(first, second);
    assert!(!first.is_unknown());
    assert_eq!(
        aggregator.stack(first).unwrap().frames,
        vec![0x5555, 0x4000_0000, 0x5000_0000]
    );
}

#[test]
fn full_table_drops_new_keys_and_keeps_existing() {
    let walker = ScriptedStack::at(0x100);
    let aggregator = AggregatorBuilder::new()
        .memory(jdk8_heap())
        .walker(walker)
        .process_id(10)
        .table_capacity(3)
        .build_with_env(no_env)
        .unwrap();
    let event = AllocationEvent {
        class_handle: STRING_KLASS,
        size: 8,
        tlab_size: 0,
    };

    for pid in 1..=3 {
        assert_eq!(aggregator.record_event(pid, event), Ok(Recorded::Created));
    }
    assert!(aggregator.record_event(4, event).is_err());
    aggregator.generate_event(5, event);
    aggregator.generate_event(1, event);

    let stack = aggregator.resolve_stack();
    assert!(aggregator.get(&EventKey::new(4, stack)).is_none());
    assert!(aggregator.get(&EventKey::new(5, stack)).is_none());
    assert_eq!(aggregator.get(&EventKey::new(1, stack)).unwrap().count, 2);
    assert_eq!(aggregator.get(&EventKey::new(2, stack)).unwrap().count, 1);
    assert_eq!(aggregator.dropped_events(), 1);
    assert_eq!(aggregator.table().len(), 3);
}

#[test]
fn concurrent_events_on_a_new_key_are_all_counted() {
    const THREADS: u64 = 8;
    const EVENTS: u64 = 5_000;

    let aggregator = AggregatorBuilder::new()
        .memory(jdk8_heap())
        .walker(ScriptedStack::at(0x7777))
        .process_id(10)
        .build_with_env(no_env)
        .unwrap();

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let aggregator = &aggregator;
            s.spawn(move || {
                let klass = if t % 2 == 0 { STRING_KLASS } else { OBJECT_KLASS };
                let ctx = RegisterContext::new(0, [klass, 8, 64, 0, 0, 0]);
                for _ in 0..EVENTS {
                    aggregator.alloc_in_new_tlab(&ctx);
                }
            });
        }
    });

    let snapshot = aggregator.snapshot();
    assert_eq!(snapshot.entries.len(), 1);
    let entry = &snapshot.entries[0];
    assert_eq!(entry.count, THREADS * EVENTS);
    assert_eq!(entry.size, 64 * THREADS * EVENTS);
    assert_eq!(entry.tlab_size, 8 * THREADS * EVENTS);
    assert!(entry.type_name == "java/lang/String" || entry.type_name == "java/lang/Object");
    assert_eq!(snapshot.dropped_events, 0);
}

#[test]
fn failed_capture_uses_the_unknown_stack() {
    struct Broken;
    impl StackWalker for Broken {
        fn walk(&self, _: &mut [u64]) -> usize {
            0
        }
    }

    let aggregator = AggregatorBuilder::new()
        .memory(jdk8_heap())
        .walker(Broken)
        .process_id(3)
        .build_with_env(no_env)
        .unwrap();

    aggregator.alloc_outside_tlab(&RegisterContext::new(0, [STRING_KLASS, 24, 0, 0, 0, 0]));
    aggregator.alloc_outside_tlab(&RegisterContext::new(0, [STRING_KLASS, 24, 0, 0, 0, 0]));

    let snapshot = aggregator.snapshot();
    assert_eq!(snapshot.entries[0].stack_id, StackId::UNKNOWN);
    assert_eq!(snapshot.entries[0].count, 2);
}

#[test]
fn layout_choice_changes_resolution() {
    let mut heap = SyntheticMemory::new().map(0x1000, 64).map(0x2000, 128);
    heap.write_u64(0x1000 + 24, 0x2000).unwrap();
    heap.write(0x2000 + 6, b"java/lang/Thread").unwrap();

    let jdk17 = AggregatorBuilder::new()
        .memory(&heap)
        .walker(ScriptedStack::at(1))
        .runtime(RuntimeLayout::HotspotJdk17)
        .build_with_env(no_env)
        .unwrap();
    assert_eq!(
        jdk17.resolve_type_name(0x1000).to_string_lossy(),
        "java/lang/Thread"
    );

    let jdk8 = AggregatorBuilder::new()
        .memory(&heap)
        .walker(ScriptedStack::at(1))
        .build_with_env(no_env)
        .unwrap();
    assert!(jdk8.resolve_type_name(0x1000).is_empty());
}
