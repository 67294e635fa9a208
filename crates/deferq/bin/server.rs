use std::{sync::Arc, time::Duration};

use clap::Parser;

use deferq_broker::{Broker, BrokerConfig};
use deferq_index::make_rocks_index;
use deferq_util::init_tracing;

/// Standalone delayed-job broker node.
#[derive(Parser, Debug)]
struct Args {
    /// Path for the RocksDB index
    #[arg(long, default_value = "deferq_data/index")]
    db_path: String,

    /// Directory for named spool queues
    #[arg(long, default_value = "deferq_data/spool")]
    spool_dir: String,

    /// Number of delay buckets
    #[arg(long, default_value = "30")]
    buckets: u32,

    /// Sync writes for the RocksDB backend
    #[arg(long, default_value = "false")]
    sync_write: bool,

    /// Heartbeat log interval in seconds
    #[arg(long, default_value = "30")]
    heartbeat_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    let heartbeat_secs = args.heartbeat_secs;

    std::fs::create_dir_all(&args.db_path)?;
    let index = make_rocks_index(&args.db_path, args.sync_write)?;

    let broker = Arc::new(
        Broker::try_new(
            index,
            BrokerConfig {
                bucket_count: args.buckets,
                spool_dir: args.spool_dir.clone().into(),
                ..BrokerConfig::default()
            },
        )
        .await?,
    );

    tracing::info!(buckets = args.buckets, db = %args.db_path, "deferq broker running");

    let heartbeat_broker = broker.clone();
    let heartbeat = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(heartbeat_secs)).await;
            let delayed: i64 = heartbeat_broker.bucket_job_counts().iter().sum();
            tracing::info!(delayed, "heartbeat");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    heartbeat.abort();
    broker.shutdown().await;

    Ok(())
}
