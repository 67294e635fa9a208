use std::time::Instant;

use clap::Parser;

use deferq_spool::Spool;
use deferq_util::init_tracing;

/// Benchmark single-producer / single-consumer spool throughput.
#[derive(Parser, Debug)]
struct Args {
    /// Number of records to push through the spool
    #[arg(long, default_value = "1000000")]
    records: usize,

    /// Payload size in bytes
    #[arg(long, default_value = "256")]
    payload: usize,

    /// Segment size in bytes (page-aligned)
    #[arg(long, default_value = "209715200")]
    segment_size: usize,

    /// Directory for the spool files
    #[arg(long, default_value = "test_data/bench_spool")]
    dir: String,

    /// Read every record back after the write pass
    #[arg(long, default_value = "true")]
    read_back: bool,
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();

    let spool = Spool::open(&args.dir, "bench", args.segment_size)?;
    let mut payload = vec![0u8; args.payload];
    fastrand::fill(&mut payload);

    tracing::info!(
        "Benchmark: {} records of {} bytes, {} byte segments",
        args.records,
        args.payload,
        args.segment_size
    );

    let start = Instant::now();
    for i in 0..args.records {
        spool.write(i as u64, &payload)?;
    }
    let write_secs = start.elapsed().as_secs_f64();
    tracing::info!(
        "write: {:.2} s, {:.2} records/sec, {:.2} MiB/sec",
        write_secs,
        args.records as f64 / write_secs,
        (args.records * args.payload) as f64 / write_secs / (1024.0 * 1024.0)
    );

    if args.read_back {
        let start = Instant::now();
        for _ in 0..args.records {
            spool.read()?;
        }
        let read_secs = start.elapsed().as_secs_f64();
        tracing::info!(
            "read: {:.2} s, {:.2} records/sec",
            read_secs,
            args.records as f64 / read_secs
        );
    }

    spool.close()?;
    Ok(())
}
