mod bucket;
mod dispatcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bucket::Bucket;
use deferq_index::{Index, IndexError, Job, JobCard, JobStatus};
use deferq_spool::{DEFAULT_SEGMENT_SIZE, Spool, SpoolError};
use deferq_util::{UnixMillis, unix_millis};

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("the number of buckets must be greater than 0")]
    InvalidBucketCount,

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("broker is shutting down")]
    ShuttingDown,

    #[error("dispatcher channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Number of delay buckets; must be > 0.
    pub bucket_count: u32,
    /// Scan interval right after a timer reset.
    pub timer_default: Duration,
    /// Minimum improvement over the scheduled wake before a new job
    /// triggers a timer reset.
    pub timer_reset_threshold: Duration,
    /// Scan interval while a bucket holds no delayed jobs.
    pub timer_sleep: Duration,
    /// Cadence of the orphaned-job sweep.
    pub sweep_interval: Duration,
    /// How far past its due time a DELAY job must be before the sweeper
    /// considers it orphaned.
    pub sweep_grace: Duration,
    /// Submission payload ceiling.
    pub max_payload: usize,
    /// Directory holding the named spool queues.
    pub spool_dir: PathBuf,
    /// Spool segment size; must be a multiple of the page size.
    pub spool_segment_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            bucket_count: 30,
            timer_default: Duration::from_secs(1),
            timer_reset_threshold: Duration::from_secs(5),
            timer_sleep: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            sweep_grace: Duration::from_secs(30),
            max_payload: 1024 * 1024,
            spool_dir: PathBuf::from("."),
            spool_segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TaskGroup {
    handles: SegQueue<tokio::task::JoinHandle<()>>,
    closed: AtomicBool,
}

impl TaskGroup {
    fn new() -> Self {
        Self {
            handles: SegQueue::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Hard gate: no tasks after shutdown
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let handle = tokio::spawn(fut);

        if self.closed.load(Ordering::Acquire) {
            handle.abort();
        } else {
            self.handles.push(handle);
        }
    }

    /// Wait for every spawned loop to observe the cancellation and return.
    async fn join_all(&self) {
        self.closed.store(true, Ordering::Release);
        while let Some(handle) = self.handles.pop() {
            let _ = handle.await;
        }
    }
}

/// A delayed-job broker: dispatcher, bucket fleet, orphan sweeper and the
/// named spool queues, all running against one persistent index.
///
/// Explicitly constructed; several brokers can coexist in one process.
#[derive(Debug)]
pub struct Broker<I: Index + 'static> {
    pub config: BrokerConfig,
    index: Arc<I>,
    buckets: Arc<Vec<Arc<Bucket>>>,
    submit_tx: mpsc::Sender<JobCard>,
    spools: DashMap<String, Arc<Spool>>,
    shutdown: CancellationToken,
    tasks: TaskGroup,
}

impl<I: Index + 'static> Broker<I> {
    pub async fn try_new(index: I, config: BrokerConfig) -> Result<Self, BrokerError> {
        if config.bucket_count == 0 {
            return Err(BrokerError::InvalidBucketCount);
        }

        let index = Arc::new(index);
        let shutdown = CancellationToken::new();
        let tasks = TaskGroup::new();

        let mut buckets = Vec::with_capacity(config.bucket_count as usize);
        for id in 0..config.bucket_count {
            buckets.push(Bucket::start(id, index.clone(), &config, shutdown.clone(), &tasks).await?);
        }
        let buckets = Arc::new(buckets);

        let (submit_tx, submit_rx) = mpsc::channel(64);
        dispatcher::start(
            index.clone(),
            buckets.clone(),
            submit_rx,
            shutdown.clone(),
            &tasks,
        );

        let broker = Broker {
            config,
            index,
            buckets,
            submit_tx,
            spools: DashMap::new(),
            shutdown,
            tasks,
        };

        broker.start_sweeper();

        Ok(broker)
    }

    /// Accept a job. Validation and the job-pool write happen inline and
    /// return the first error; routing and promotion then proceed
    /// asynchronously with failures logged only.
    pub async fn submit(&self, job: Job) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::ShuttingDown);
        }
        job.check(self.config.max_payload)?;
        self.index.add_to_job_pool(&job).await?;
        self.submit_tx
            .send(job.card())
            .await
            .map_err(|_| BrokerError::ChannelClosed)
    }

    /// Pop the next ready job for a topic; `None` when the queue is empty.
    /// The returned job is RESERVED.
    pub async fn pop(&self, topic: &str) -> Result<Option<Job>, BrokerError> {
        Ok(self.index.pop_ready(topic).await?)
    }

    /// Mark a reserved job FINISHED and drop its record.
    pub async fn finish(&self, id: &str) -> Result<(), BrokerError> {
        self.index.set_job_status(id, JobStatus::Finished).await?;
        self.index.remove_job(id).await?;
        Ok(())
    }

    /// The durable hand-off queue for `name`, opened lazily under
    /// `config.spool_dir`. All open spools are closed at shutdown.
    pub fn spool(&self, name: &str) -> Result<Arc<Spool>, BrokerError> {
        if let Some(spool) = self.spools.get(name) {
            return Ok(spool.clone());
        }
        let spool = Arc::new(Spool::open(
            &self.config.spool_dir,
            name,
            self.config.spool_segment_size,
        )?);
        match self.spools.entry(name.to_string()) {
            dashmap::Entry::Occupied(e) => Ok(e.get().clone()),
            dashmap::Entry::Vacant(v) => {
                v.insert(spool.clone());
                Ok(spool)
            }
        }
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    /// Per-bucket delayed-job counts (routing snapshot, test observability).
    pub fn bucket_job_counts(&self) -> Vec<i64> {
        self.buckets.iter().map(|b| b.job_num()).collect()
    }

    /// Per-bucket next scheduled scan instants.
    pub fn bucket_next_times(&self) -> Vec<UnixMillis> {
        self.buckets.iter().map(|b| b.next_time()).collect()
    }

    /// Rehydrates overdue DELAY jobs back onto their ready queue: jobs a
    /// failed promotion dropped from every bucket set, and jobs a stalled
    /// scanner left sitting in theirs.
    fn start_sweeper(&self) {
        let index = self.index.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.sweep_interval;
        let grace = self.config.sweep_grace;

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if shutdown.is_cancelled() {
                    break;
                }

                let cutoff = unix_millis().saturating_sub(grace.as_millis() as u64);
                let orphans = match index.scan_overdue_delay_jobs(cutoff).await {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(%err, "orphan scan failed");
                        continue;
                    }
                };

                for (id, bucket) in orphans {
                    if let Some(bucket) = bucket {
                        // Yank any leftover delayed entry first so a later
                        // scan cannot promote the job a second time.
                        if let Err(err) = index.remove_from_bucket(bucket, &id).await {
                            tracing::warn!(job = %id, %err, "bucket removal failed");
                            continue;
                        }
                    }

                    match index.add_to_ready_queue(&id).await {
                        Ok(()) => {
                            if let Err(err) = index.set_job_status(&id, JobStatus::Ready).await {
                                tracing::warn!(job = %id, %err, "set READY status failed");
                            }
                            tracing::info!(job = %id, "rehydrated orphaned delay job");
                        }
                        Err(err) => {
                            tracing::warn!(job = %id, %err, "rehydration failed, retrying next sweep");
                        }
                    }
                }
            }
        });
    }

    /// Stop every loop, wait for them, then flush and close the spools.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.join_all().await;

        for entry in self.spools.iter() {
            if let Err(err) = entry.value().close() {
                tracing::warn!(queue = %entry.key(), %err, "spool close failed");
            }
        }
    }
}
