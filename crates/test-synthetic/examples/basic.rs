use std::error::Error;
use std::hint::black_box;

use test_synthetic::{init_tracing, FakeClass};
use tlabscope::{hooks, Aggregator, Format, RegisterContext};

const THREADS: usize = 4;
const ITERATIONS: u64 = 1000;

#[inline(never)]
fn allocate_string(ctx: &RegisterContext) -> i32 {
    unsafe { hooks::alloc_outside_tlab(black_box(ctx)) }
}

#[inline(never)]
fn allocate_int_array(ctx: &RegisterContext) -> i32 {
    unsafe { hooks::alloc_in_new_tlab(black_box(ctx)) }
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let format: Format = match std::env::args().nth(1) {
        Some(name) => name.parse()?,
        None => Format::Table,
    };

    let string_class = FakeClass::new("java/lang/String");
    let array_class = FakeClass::new("[I");

    tlabscope::install(Aggregator::builder().build()?)?;

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let strings = string_class.outside_tlab(24);
                let arrays = array_class.in_new_tlab(16 * 1024, 4096);
                for _ in 0..ITERATIONS {
                    black_box(allocate_string(&strings));
                    black_box(allocate_int_array(&arrays));
                }
            });
        }
    });

    let aggregator = tlabscope::uninstall().ok_or("aggregator vanished")?;
    format.reporter().report(&aggregator.snapshot())?;
    Ok(())
}
