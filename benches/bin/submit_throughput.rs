use std::sync::Arc;

use clap::Parser;
use tokio::time::Instant;

use deferq_broker::{Broker, BrokerConfig};
use deferq_index::{Job, make_rocks_index};
use deferq_util::init_tracing;

/// Benchmark submission load on the delay engine.
#[derive(Parser, Debug)]
struct Args {
    /// Number of jobs to submit
    #[arg(long, default_value = "100000")]
    jobs: usize,

    /// Parallel submitter tasks
    #[arg(long, default_value = "50")]
    parallelism: usize,

    /// Maximum payload size (randomized 32..max)
    #[arg(long, default_value = "256")]
    max_payload: usize,

    /// Delay attached to every job, in seconds (0 = straight to ready)
    #[arg(long, default_value = "3600")]
    delay: u64,

    /// Number of delay buckets
    #[arg(long, default_value = "30")]
    buckets: u32,

    /// Path for the RocksDB index
    #[arg(long, default_value = "test_data/bench_index")]
    db_path: String,

    /// Sync writes for the RocksDB backend
    #[arg(long, default_value = "false")]
    pub sync_write: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args = Args::parse();

    std::fs::create_dir_all(&args.db_path).unwrap();
    let index = make_rocks_index(&args.db_path, args.sync_write).unwrap();

    let broker = Arc::new(
        Broker::try_new(
            index,
            BrokerConfig {
                bucket_count: args.buckets,
                spool_dir: "test_data/bench_spool".into(),
                ..BrokerConfig::default()
            },
        )
        .await
        .unwrap(),
    );

    tracing::info!("Benchmark: submitting {} jobs...", args.jobs);
    tracing::info!(
        "parallel={}, buckets={}, delay={}s, max_payload={}",
        args.parallelism,
        args.buckets,
        args.delay,
        args.max_payload
    );

    let mut tasks = Vec::new();
    let jobs_per_worker = args.jobs / args.parallelism;

    let start = Instant::now();

    for worker in 0..args.parallelism {
        let broker = broker.clone();
        let max_payload = args.max_payload;
        let delay = args.delay;
        tasks.push(tokio::spawn(async move {
            for i in 0..jobs_per_worker {
                let size = fastrand::usize(32..max_payload);
                let mut buf = vec![0u8; size];
                fastrand::fill(&mut buf);

                let id = format!("{}-{worker}-{i}", uuid::Uuid::new_v4());
                broker
                    .submit(Job::new(id, "bench", delay, buf))
                    .await
                    .unwrap();
            }
        }));
    }

    for t in tasks {
        t.await.unwrap();
    }

    let elapsed = start.elapsed().as_secs_f64();
    let rate = (jobs_per_worker * args.parallelism) as f64 / elapsed;

    tracing::info!("Total time: {:.2} s", elapsed);
    tracing::info!("Throughput: {:.2} jobs/sec", rate);
    tracing::info!("Bucket loads: {:?}", broker.bucket_job_counts());

    broker.shutdown().await;
}
