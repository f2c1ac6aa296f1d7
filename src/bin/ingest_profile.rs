//! Ingestion profile: throughput and RSS at various table sizes.
//!
//! Ingests 10K, 100K and 1M rows through sequential and parallel
//! pipelines, then reads every table back once. Prints a comparison
//! table to stdout.
//!
//! Run: cargo run --release --bin ingest_profile
//! Logging: RUST_LOG=rowstore=debug

use std::sync::Arc;
use std::time::Instant;

use rowstore::{
    Cell, ColumnSpec, ContainerSettings, DataType, IngestionPipeline, Row, Schema, StoreContext,
    StoreSettings, Value,
};
use sysinfo::{ProcessRefreshKind, RefreshKind, System};

// ── Row generators ─────────────────────────────────────────────────────

fn schema() -> Schema {
    Schema::new(vec![
        ColumnSpec::new("id", DataType::Long),
        ColumnSpec::new("score", DataType::Double),
        ColumnSpec::new("category", DataType::String),
        ColumnSpec::new("flag", DataType::Boolean),
    ])
}

fn make_row(i: usize) -> Row {
    Row::new(
        format!("Row{}", i),
        vec![
            Cell::Value(Value::Long(i as i64)),
            Cell::Value(Value::Double(i as f64 * 0.5)),
            Cell::Value(Value::String(format!("cat_{}", i % 20))),
            Cell::Value(Value::Boolean(i % 2 == 0)),
        ],
    )
}

// ── RSS measurement ────────────────────────────────────────────────────

fn get_process_rss() -> u64 {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
    );
    sys.refresh_all();
    match sysinfo::get_current_pid() {
        Ok(pid) => sys.process(pid).map(|p| p.memory()).unwrap_or(0),
        Err(_) => 0,
    }
}

struct Measurement {
    ingest_secs: f64,
    read_secs: f64,
    rss_bytes: u64,
    spilled: bool,
}

fn measure(ctx: &Arc<StoreContext>, rows: usize, sequential: bool) -> rowstore::Result<Measurement> {
    std::thread::sleep(std::time::Duration::from_millis(100));
    let baseline = get_process_rss();

    let settings = ContainerSettings {
        sequential,
        ..ContainerSettings::default()
    };
    let start = Instant::now();
    let mut pipeline = IngestionPipeline::new(ctx, schema(), settings, None)?;
    for i in 0..rows {
        pipeline.add_row(make_row(i))?;
    }
    let table = pipeline.close()?;
    let ingest_secs = start.elapsed().as_secs_f64();

    let start = Instant::now();
    let read = table.iter()?.count();
    let read_secs = start.elapsed().as_secs_f64();
    assert_eq!(read, rows);

    let rss_bytes = get_process_rss().saturating_sub(baseline);
    let spilled = table.buffer().uses_out_file();
    pipeline.clear();
    Ok(Measurement {
        ingest_secs,
        read_secs,
        rss_bytes,
        spilled,
    })
}

// ── Main ───────────────────────────────────────────────────────────────

fn main() -> rowstore::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let ctx = StoreContext::new(StoreSettings::from_env())?;

    println!("rowstore ingestion profile");
    println!("==========================");
    println!();
    println!(
        "{:<10} {:<11} {:>12} {:>12} {:>10} {:>8}",
        "Rows", "Mode", "rows/s in", "rows/s out", "RSS (MB)", "Spilled"
    );
    println!("{:-<68}", "");

    for size in [10_000, 100_000, 1_000_000] {
        for sequential in [true, false] {
            eprint!("Measuring {} ({})... ", size, if sequential { "seq" } else { "par" });
            let m = measure(&ctx, size, sequential)?;
            println!(
                "{:<10} {:<11} {:>12.0} {:>12.0} {:>10.1} {:>8}",
                size,
                if sequential { "sequential" } else { "parallel" },
                size as f64 / m.ingest_secs.max(f64::EPSILON),
                size as f64 / m.read_secs.max(f64::EPSILON),
                m.rss_bytes as f64 / (1024.0 * 1024.0),
                if m.spilled { "yes" } else { "no" }
            );
            eprintln!("done");
        }
    }

    let stats = ctx.cache().stats();
    println!();
    println!(
        "cache: {} distinct, {} hard hits, {} soft hits, {} misses",
        stats.distinct, stats.hard_hits, stats.soft_hits, stats.misses
    );
    ctx.shutdown();
    Ok(())
}
