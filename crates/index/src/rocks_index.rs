use crate::*;
use deferq_util::{UnixMillis, secs_until, unix_millis};

use async_trait::async_trait;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch, WriteOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// RocksDB-backed index. Column families:
/// - `jobs`:    id -> serialized job record
/// - `bucket`:  bucket(4 BE) ++ due_millis(8 BE) ++ id -> ∅   (due-ordered)
/// - `members`: bucket(4 BE) ++ id -> due_millis(8 BE)        (idempotency, counting)
/// - `ready`:   topic ++ 0x00 ++ seq(8 BE) -> id              (per-topic FIFO)
#[derive(Debug)]
pub struct RocksIndex {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    sync_write: bool,
    // Monotonic across topics; per-topic FIFO order only needs monotonicity.
    ready_seq: AtomicU64,
}

impl RocksIndex {
    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_write); // fsync WAL before returning
        write_opts
    }

    pub fn open(path: &str, sync_write: bool) -> Result<Self, IndexError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new("jobs", Options::default()),
            ColumnFamilyDescriptor::new("bucket", Options::default()),
            ColumnFamilyDescriptor::new("members", Options::default()),
            ColumnFamilyDescriptor::new("ready", Options::default()),
        ];

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cfs)?;

        // Re-seed the ready-queue sequence past anything still on disk so a
        // restart cannot collide with (or reorder before) pending entries.
        let ready_cf = db
            .cf_handle("ready")
            .ok_or(IndexError::MissingColumnFamily("ready"))?;
        let mut max_seq = 0u64;
        for pair in db.iterator_cf(&ready_cf, IteratorMode::Start) {
            let (key, _) = pair?;
            if key.len() >= 8 {
                max_seq = max_seq.max(Self::be_u64(&key[key.len() - 8..], "ready seq")? + 1);
            }
        }
        drop(ready_cf);

        Ok(Self {
            db: Arc::new(db),
            sync_write,
            ready_seq: AtomicU64::new(max_seq),
        })
    }

    fn encode_due_key(bucket: BucketId, due: UnixMillis, id: &str) -> Vec<u8> {
        let mut v = Vec::with_capacity(12 + id.len());
        v.extend_from_slice(&bucket.to_be_bytes());
        v.extend_from_slice(&due.to_be_bytes());
        v.extend_from_slice(id.as_bytes());
        v
    }

    fn encode_member_key(bucket: BucketId, id: &str) -> Vec<u8> {
        let mut v = Vec::with_capacity(4 + id.len());
        v.extend_from_slice(&bucket.to_be_bytes());
        v.extend_from_slice(id.as_bytes());
        v
    }

    fn encode_ready_key(topic: &str, seq: u64) -> Vec<u8> {
        let mut v = Vec::with_capacity(topic.len() + 9);
        v.extend_from_slice(topic.as_bytes());
        v.push(0);
        v.extend_from_slice(&seq.to_be_bytes());
        v
    }

    fn ready_prefix(topic: &str) -> Vec<u8> {
        let mut v = Vec::with_capacity(topic.len() + 1);
        v.extend_from_slice(topic.as_bytes());
        v.push(0);
        v
    }

    #[inline]
    fn cf(&self, name: &'static str) -> Result<Arc<BoundColumnFamily<'_>>, IndexError> {
        self.db
            .cf_handle(name)
            .ok_or(IndexError::MissingColumnFamily(name))
    }

    #[inline]
    fn be_u64(bytes: &[u8], ctx: &str) -> Result<u64, IndexError> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| {
            IndexError::KeyDecode(format!("{ctx}: expected 8 bytes, got {}", bytes.len()))
        })?;
        Ok(u64::from_be_bytes(arr))
    }

    fn load_job(&self, id: &str) -> Result<Job, IndexError> {
        let jobs_cf = self.cf("jobs")?;
        let raw = self
            .db
            .get_cf(&jobs_cf, id.as_bytes())?
            .ok_or_else(|| IndexError::JobNotFound(id.to_string()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn store_job(&self, job: &Job) -> Result<(), IndexError> {
        let jobs_cf = self.cf("jobs")?;
        let raw = serde_json::to_vec(job)?;
        self.db
            .put_cf_opt(&jobs_cf, job.id.as_bytes(), raw, &self.write_opts())?;
        Ok(())
    }
}

#[async_trait]
impl Index for RocksIndex {
    async fn add_to_job_pool(&self, job: &Job) -> Result<(), IndexError> {
        self.store_job(job)
    }

    async fn get_job(&self, id: &str) -> Result<Job, IndexError> {
        self.load_job(id)
    }

    async fn set_job_status(&self, id: &str, status: JobStatus) -> Result<(), IndexError> {
        let mut job = self.load_job(id)?;
        job.status = status;
        self.store_job(&job)
    }

    async fn remove_job(&self, id: &str) -> Result<(), IndexError> {
        let jobs_cf = self.cf("jobs")?;
        self.db
            .delete_cf_opt(&jobs_cf, id.as_bytes(), &self.write_opts())?;
        Ok(())
    }

    async fn add_to_bucket(&self, bucket: BucketId, card: &JobCard) -> Result<(), IndexError> {
        let bucket_cf = self.cf("bucket")?;
        let members_cf = self.cf("members")?;
        let jobs_cf = self.cf("jobs")?;

        let member_key = Self::encode_member_key(bucket, &card.id);
        if self.db.get_cf(&members_cf, &member_key)?.is_some() {
            // Already delayed in this bucket; keep the original due time.
            return Ok(());
        }

        let mut job = self.load_job(&card.id)?;
        let due = unix_millis() + card.delay * 1000;
        job.due_at = Some(due);
        job.bucket = Some(bucket);

        let mut batch = WriteBatch::default();
        batch.put_cf(&bucket_cf, Self::encode_due_key(bucket, due, &card.id), []);
        batch.put_cf(&members_cf, member_key, due.to_be_bytes());
        batch.put_cf(&jobs_cf, card.id.as_bytes(), serde_json::to_vec(&job)?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(())
    }

    async fn retrieve_due_jobs(&self, bucket: BucketId) -> Result<DueJobs, IndexError> {
        let bucket_cf = self.cf("bucket")?;
        let members_cf = self.cf("members")?;

        let prefix = bucket.to_be_bytes();
        let now = unix_millis();

        let mut batch = WriteBatch::default();
        let mut ids = Vec::new();
        let mut next_due = None;

        let iter = self.db.iterator_cf(
            &bucket_cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for pair in iter {
            let (key, _) = pair?;
            if !key.starts_with(&prefix) {
                break;
            }
            if key.len() < 12 {
                return Err(IndexError::KeyDecode(format!(
                    "bucket key too short: {} bytes",
                    key.len()
                )));
            }

            let due = Self::be_u64(&key[4..12], "bucket due")?;
            if due > now {
                next_due = Some(due);
                break;
            }

            let id = std::str::from_utf8(&key[12..])
                .map_err(|e| IndexError::KeyDecode(format!("bucket job id: {e}")))?
                .to_string();

            batch.delete_cf(&members_cf, Self::encode_member_key(bucket, &id));
            batch.delete_cf(&bucket_cf, key);
            ids.push(id);
        }

        if !ids.is_empty() {
            self.db.write_opt(batch, &self.write_opts())?;
        }

        Ok(DueJobs {
            ids,
            // due > now here, so the rounded-up value is never 0
            next_due_secs: next_due.map(|d| secs_until(d, now)),
        })
    }

    async fn bucket_job_count(&self, bucket: BucketId) -> Result<u64, IndexError> {
        let members_cf = self.cf("members")?;
        let prefix = bucket.to_be_bytes();

        let mut count = 0u64;
        let iter = self.db.iterator_cf(
            &members_cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for pair in iter {
            let (key, _) = pair?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    async fn remove_from_bucket(&self, bucket: BucketId, id: &str) -> Result<(), IndexError> {
        let bucket_cf = self.cf("bucket")?;
        let members_cf = self.cf("members")?;

        let member_key = Self::encode_member_key(bucket, id);
        let Some(raw_due) = self.db.get_cf(&members_cf, &member_key)? else {
            return Ok(());
        };
        let due = Self::be_u64(&raw_due, "member due")?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&bucket_cf, Self::encode_due_key(bucket, due, id));
        batch.delete_cf(&members_cf, member_key);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    async fn add_to_ready_queue(&self, id: &str) -> Result<(), IndexError> {
        let ready_cf = self.cf("ready")?;
        let job = self.load_job(id)?;

        let seq = self.ready_seq.fetch_add(1, Ordering::SeqCst);
        self.db.put_cf_opt(
            &ready_cf,
            Self::encode_ready_key(&job.topic, seq),
            id.as_bytes(),
            &self.write_opts(),
        )?;
        Ok(())
    }

    async fn pop_ready(&self, topic: &str) -> Result<Option<Job>, IndexError> {
        let ready_cf = self.cf("ready")?;
        let prefix = Self::ready_prefix(topic);

        loop {
            let head = self
                .db
                .iterator_cf(
                    &ready_cf,
                    IteratorMode::From(&prefix, rocksdb::Direction::Forward),
                )
                .next();

            let Some(pair) = head else { return Ok(None) };
            let (key, raw_id) = pair?;
            if !key.starts_with(&prefix) {
                return Ok(None);
            }

            self.db.delete_cf_opt(&ready_cf, &key, &self.write_opts())?;

            let id = std::str::from_utf8(&raw_id)
                .map_err(|e| IndexError::KeyDecode(format!("ready job id: {e}")))?;
            match self.load_job(id) {
                Ok(mut job) => {
                    job.status = JobStatus::Reserved;
                    self.store_job(&job)?;
                    return Ok(Some(job));
                }
                // Dangling entry (record already removed); keep popping.
                Err(IndexError::JobNotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn scan_overdue_delay_jobs(
        &self,
        cutoff: UnixMillis,
    ) -> Result<Vec<(JobId, Option<BucketId>)>, IndexError> {
        let jobs_cf = self.cf("jobs")?;

        let mut out = Vec::new();
        for pair in self.db.iterator_cf(&jobs_cf, IteratorMode::Start) {
            let (_, raw) = pair?;
            let job: Job = serde_json::from_slice(&raw)?;
            if job.status == JobStatus::Delay && job.due_at.is_some_and(|due| due <= cutoff) {
                out.push((job.id, job.bucket));
            }
        }
        Ok(out)
    }

    async fn flush(&self) -> Result<(), IndexError> {
        self.db.flush()?;
        Ok(())
    }
}
