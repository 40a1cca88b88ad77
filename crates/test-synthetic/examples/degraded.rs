use std::error::Error;
use std::hint::black_box;

use test_synthetic::{init_tracing, FakeClass};
use tlabscope::{hooks, Aggregator, Format, RegisterContext, Verdict};

#[inline(never)]
fn first_site(ctx: &RegisterContext) -> i32 {
    unsafe { hooks::alloc_outside_tlab(black_box(ctx)) }
}

#[inline(never)]
fn second_site(ctx: &RegisterContext) -> i32 {
    unsafe { hooks::alloc_outside_tlab(black_box(ctx)) }
}

#[inline(never)]
fn third_site(ctx: &RegisterContext) -> i32 {
    unsafe { hooks::alloc_in_new_tlab(black_box(ctx)) }
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let known = FakeClass::new("java/util/HashMap$Node");
    let dangling = RegisterContext::new(0, [0xdead_0000, 32, 0, 0, 0, 0]);

    // No aggregator yet: the hooks fall back to suppressing.
    assert_eq!(unsafe { hooks::alloc_outside_tlab(&dangling) }, 0);

    tlabscope::install(
        Aggregator::builder()
            .table_capacity(2)
            .verdict(Verdict::Forward)
            .build()?,
    )?;

    for _ in 0..3 {
        assert_eq!(first_site(&known.outside_tlab(32)), 1);
        assert_eq!(second_site(&dangling), 1);
        assert_eq!(third_site(&known.in_new_tlab(8192, 32)), 1);
    }
    assert_eq!(unsafe { hooks::alloc_outside_tlab(std::ptr::null()) }, 0);

    let aggregator = tlabscope::uninstall().ok_or("aggregator vanished")?;
    Format::JsonPretty.reporter().report(&aggregator.snapshot())?;
    Ok(())
}
