use std::error::Error;

use test_synthetic::{init_tracing, FakeClass};
use tlabscope::{format_bytes, Aggregator, AggregatorConfig, Reporter, Snapshot};
use tracing::{info, info_span};

struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, snapshot: &Snapshot) -> Result<(), Box<dyn Error>> {
        info!(
            "{} buckets, {} dropped",
            snapshot.entries.len(),
            snapshot.dropped_events
        );

        for entry in &snapshot.entries {
            let span = info_span!("bucket", pid = entry.pid, stack = %entry.stack_id);
            let _enter = span.enter();
            info!(
                "{}: {} allocations, {} total, {} avg",
                entry.type_name,
                entry.count,
                format_bytes(entry.size),
                format_bytes(entry.avg_size())
            );
        }

        Ok(())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let class = FakeClass::new("java/lang/StringBuilder");
    let mut config = AggregatorConfig::from_json(r#"{ "table_capacity": 256 }"#)?;
    config.apply_env()?;
    info!(table_capacity = config.table_capacity, "config resolved");

    let aggregator = Aggregator::builder().config(config).build()?;
    for size in [16, 32, 64] {
        aggregator.alloc_outside_tlab(&class.outside_tlab(size));
    }

    TracingReporter.report(&aggregator.snapshot())?;
    Ok(())
}
