use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use deferq_index::{BucketId, Index, JobCard, JobId, JobStatus};
use deferq_util::{UnixMillis, unix_millis};

use crate::{BrokerConfig, BrokerError, TaskGroup};

/// One shard of the delayed-job set. Owns an adaptive timer that wakes when
/// the shard's earliest job is due; runs one receive loop and one scanner
/// loop for the lifetime of the process.
#[derive(Debug)]
pub(crate) struct Bucket {
    pub(crate) id: BucketId,
    // Written only by the receive loop; the dispatcher reads a snapshot at
    // sort time, so staleness affects routing quality, not correctness.
    job_num: AtomicI64,
    // Wall-clock instant of the next scheduled scan, written only by the
    // scanner loop.
    next_time: AtomicU64,
    pub(crate) recv_job: mpsc::Sender<JobCard>,
}

impl Bucket {
    pub(crate) async fn start<I: Index + 'static>(
        id: BucketId,
        index: Arc<I>,
        config: &BrokerConfig,
        shutdown: CancellationToken,
        tasks: &TaskGroup,
    ) -> Result<Arc<Self>, BrokerError> {
        // A previous run may have stopped mid-way; the set survives in the
        // index.
        let restored = index.bucket_job_count(id).await?;

        let (recv_tx, recv_rx) = mpsc::channel(1);
        let (promote_tx, promote_rx) = mpsc::channel(1);
        let (reset_tx, reset_rx) = mpsc::channel(1);

        let bucket = Arc::new(Self {
            id,
            job_num: AtomicI64::new(restored as i64),
            next_time: AtomicU64::new(unix_millis() + config.timer_default.as_millis() as u64),
            recv_job: recv_tx,
        });

        tasks.spawn(Self::receive_loop(
            bucket.clone(),
            index.clone(),
            config.timer_reset_threshold,
            recv_rx,
            promote_rx,
            reset_tx,
            shutdown.clone(),
        ));
        tasks.spawn(Self::scanner_loop(
            bucket.clone(),
            index,
            config.timer_default,
            config.timer_sleep,
            promote_tx,
            reset_rx,
            shutdown,
        ));

        Ok(bucket)
    }

    pub(crate) fn job_num(&self) -> i64 {
        self.job_num.load(Ordering::Relaxed)
    }

    pub(crate) fn next_time(&self) -> UnixMillis {
        self.next_time.load(Ordering::Relaxed)
    }

    /// Accepts newly routed cards and promotion requests from the scanner.
    async fn receive_loop<I: Index>(
        bucket: Arc<Bucket>,
        index: Arc<I>,
        reset_threshold: Duration,
        mut recv_rx: mpsc::Receiver<JobCard>,
        mut promote_rx: mpsc::Receiver<JobId>,
        reset_tx: mpsc::Sender<()>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(card) = recv_rx.recv() => {
                    bucket.on_recv(&*index, reset_threshold, &reset_tx, card).await;
                }

                Some(id) = promote_rx.recv() => {
                    bucket.on_promote(&*index, id).await;
                }
            }
        }
    }

    async fn on_recv<I: Index>(
        &self,
        index: &I,
        reset_threshold: Duration,
        reset_tx: &mpsc::Sender<()>,
        card: JobCard,
    ) {
        if let Err(err) = index.add_to_bucket(self.id, &card).await {
            // Job stays in the pool with its prior status.
            tracing::error!(bucket = self.id, job = %card.id, %err, "add to bucket failed");
            return;
        }
        if let Err(err) = index.set_job_status(&card.id, JobStatus::Delay).await {
            tracing::warn!(bucket = self.id, job = %card.id, %err, "set DELAY status failed");
        }
        self.job_num.fetch_add(1, Ordering::Relaxed);

        // Re-arm the scanner only when the new job is due well before the
        // currently scheduled wake; the threshold keeps bursts from
        // thrashing the timer.
        let now = unix_millis();
        let next = self.next_time.load(Ordering::Relaxed);
        if next > now {
            let until_scan = Duration::from_millis(next - now);
            let delay = Duration::from_secs(card.delay);
            if until_scan.saturating_sub(delay) > reset_threshold {
                // Advisory: drop the signal if the scanner is mid-scan.
                if reset_tx.try_send(()).is_ok() {
                    tracing::debug!(bucket = self.id, job = %card.id, "timer reset requested");
                }
            }
        }
    }

    async fn on_promote<I: Index>(&self, index: &I, id: JobId) {
        if let Err(err) = index.add_to_ready_queue(&id).await {
            // Already removed from the delayed set; the sweeper picks it up.
            tracing::error!(bucket = self.id, job = %id, %err, "add to ready queue failed");
            return;
        }
        if let Err(err) = index.set_job_status(&id, JobStatus::Ready).await {
            tracing::warn!(bucket = self.id, job = %id, %err, "set READY status failed");
        }
        self.job_num.fetch_sub(1, Ordering::Relaxed);
    }

    /// Drives the adaptive timer: wake, drain due jobs into `promote`,
    /// re-arm for the next earliest due time.
    async fn scanner_loop<I: Index>(
        bucket: Arc<Bucket>,
        index: Arc<I>,
        timer_default: Duration,
        timer_sleep: Duration,
        promote_tx: mpsc::Sender<JobId>,
        mut reset_rx: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) {
        let mut duration = timer_default;
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                () = sleep.as_mut() => {
                    match index.retrieve_due_jobs(bucket.id).await {
                        Err(err) => {
                            // Re-arm with the previous cadence and retry.
                            tracing::error!(bucket = bucket.id, %err, "due-job retrieval failed");
                        }
                        Ok(due) => {
                            for id in due.ids {
                                // Synchronous hand-off: back-pressure from a
                                // slow ready queue must slow scanning, so no
                                // helper tasks here.
                                if promote_tx.send(id).await.is_err() {
                                    return;
                                }
                            }
                            duration = match due.next_due_secs {
                                Some(secs) => Duration::from_secs(secs),
                                None => timer_sleep,
                            };
                            tracing::debug!(bucket = bucket.id, next_scan_in = ?duration, "scan complete");
                        }
                    }
                    bucket.arm(duration);
                    sleep.as_mut().reset(Instant::now() + duration);
                }

                Some(()) = reset_rx.recv() => {
                    duration = timer_default;
                    bucket.arm(duration);
                    sleep.as_mut().reset(Instant::now() + duration);
                }
            }
        }
    }

    fn arm(&self, duration: Duration) {
        self.next_time.store(
            unix_millis() + duration.as_millis() as u64,
            Ordering::Relaxed,
        );
    }
}
