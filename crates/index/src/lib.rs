pub mod rocks_index;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use deferq_util::UnixMillis;

pub type JobId = String;
pub type Topic = String;
pub type BucketId = u32;

/// Lifecycle of a job inside the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Held in a bucket until its due time.
    Delay,
    /// On the topic's ready queue, waiting for a consumer.
    Ready,
    /// Popped by a consumer, ttr window running.
    Reserved,
    /// Consumer reported completion; record is about to be removed.
    Finished,
}

/// A submitted job. Immutable after creation except for the fields the
/// index stamps while routing (`status`, `due_at`, `bucket`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub topic: Topic,
    /// Seconds to hold the job before it becomes ready; 0 means immediate.
    pub delay: u64,
    /// Time-to-run after reserve, in seconds. Carried, not enforced.
    pub ttr: u64,
    pub payload: Vec<u8>,
    pub status: JobStatus,
    /// Wall-clock due instant, stamped when the job lands in a bucket.
    pub due_at: Option<UnixMillis>,
    /// The bucket that owns the delayed entry, stamped with `due_at`.
    pub bucket: Option<BucketId>,
}

impl Job {
    pub fn new(
        id: impl Into<JobId>,
        topic: impl Into<Topic>,
        delay: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            delay,
            ttr: 0,
            payload,
            status: JobStatus::Delay,
            due_at: None,
            bucket: None,
        }
    }

    pub fn with_ttr(mut self, ttr: u64) -> Self {
        self.ttr = ttr;
        self
    }

    pub fn card(&self) -> JobCard {
        JobCard {
            id: self.id.clone(),
            topic: self.topic.clone(),
            delay: self.delay,
        }
    }

    /// Submission-time validation.
    pub fn check(&self, max_payload: usize) -> Result<(), IndexError> {
        if self.id.is_empty() {
            return Err(IndexError::InvalidJob("empty job id"));
        }
        if self.topic.is_empty() {
            return Err(IndexError::InvalidJob("empty topic"));
        }
        if self.payload.len() > max_payload {
            return Err(IndexError::InvalidJob(
                "payload exceeds the configured maximum",
            ));
        }
        Ok(())
    }
}

/// Lightweight descriptor routed through the dispatcher and bucket channels;
/// the full job lives in the index keyed by id.
#[derive(Debug, Clone)]
pub struct JobCard {
    pub id: JobId,
    pub topic: Topic,
    pub delay: u64,
}

/// Result of draining a bucket's due entries.
#[derive(Debug, Clone)]
pub struct DueJobs {
    /// Ids whose due time has passed, in due order. Already removed from
    /// the bucket set.
    pub ids: Vec<JobId>,
    /// Whole seconds until the earliest remaining entry, rounded up;
    /// `None` when the bucket set is empty.
    pub next_due_secs: Option<u64>,
}

#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("column family not found: {0}")]
    MissingColumnFamily(&'static str),

    #[error("invalid key encoding: {0}")]
    KeyDecode(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("invalid job: {0}")]
    InvalidJob(&'static str),

    #[error("job codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub fn make_rocks_index(
    path: &str,
    sync_write: bool,
) -> Result<rocks_index::RocksIndex, IndexError> {
    rocks_index::RocksIndex::open(path, sync_write)
}

/// The persistent index the delay engine runs against: the job pool, one
/// due-ordered delayed set per bucket, and one FIFO ready queue per topic.
#[async_trait]
pub trait Index: Send + Sync + std::fmt::Debug {
    /// Persist a freshly submitted job record.
    async fn add_to_job_pool(&self, job: &Job) -> Result<(), IndexError>;

    /// Fetch a job record by id.
    async fn get_job(&self, id: &str) -> Result<Job, IndexError>;

    /// Update the status field of a job record.
    async fn set_job_status(&self, id: &str, status: JobStatus) -> Result<(), IndexError>;

    /// Delete a job record (after FINISHED has been observed).
    async fn remove_job(&self, id: &str) -> Result<(), IndexError>;

    /// Record `(id, due = now + delay)` in the bucket's due-ordered set.
    /// Idempotent on id: re-adding an id already in the bucket is a no-op.
    async fn add_to_bucket(&self, bucket: BucketId, card: &JobCard) -> Result<(), IndexError>;

    /// Remove every entry with `due <= now` from the bucket set and return
    /// the ids together with the sleep hint for the next earliest entry.
    async fn retrieve_due_jobs(&self, bucket: BucketId) -> Result<DueJobs, IndexError>;

    /// Current cardinality of the bucket set (restored into `job_num` on
    /// startup).
    async fn bucket_job_count(&self, bucket: BucketId) -> Result<u64, IndexError>;

    /// Drop the id's delayed entry from the bucket, if present. The sweeper
    /// yanks entries through this before rehydrating a job, so a later scan
    /// cannot promote it a second time.
    async fn remove_from_bucket(&self, bucket: BucketId, id: &str) -> Result<(), IndexError>;

    /// Append the job to its topic's ready queue.
    async fn add_to_ready_queue(&self, id: &str) -> Result<(), IndexError>;

    /// Pop the head of the topic's ready queue, mark it RESERVED and return
    /// it. Entries whose job record has disappeared are skipped.
    async fn pop_ready(&self, topic: &str) -> Result<Option<Job>, IndexError>;

    /// DELAY jobs whose stamped due time is at or before `cutoff`, with the
    /// bucket that was routing them. Feed for the orphan sweeper.
    async fn scan_overdue_delay_jobs(
        &self,
        cutoff: UnixMillis,
    ) -> Result<Vec<(JobId, Option<BucketId>)>, IndexError>;

    /// Force pending writes down to disk.
    async fn flush(&self) -> Result<(), IndexError>;
}
