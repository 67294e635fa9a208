use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use deferq_index::{Index, JobCard, JobStatus};

use crate::TaskGroup;
use crate::bucket::Bucket;

/// Routes accepted cards: zero-delay jobs short-circuit onto the ready
/// queue, delayed jobs go to the least-loaded bucket.
pub(crate) fn start<I: Index + 'static>(
    index: Arc<I>,
    buckets: Arc<Vec<Arc<Bucket>>>,
    mut submit_rx: mpsc::Receiver<JobCard>,
    shutdown: CancellationToken,
    tasks: &TaskGroup,
) {
    tasks.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                card = submit_rx.recv() => {
                    let Some(card) = card else { break };
                    dispatch(&*index, &buckets, card).await;
                }
            }
        }
        tracing::debug!("dispatcher stopped");
    });
}

async fn dispatch<I: Index>(index: &I, buckets: &[Arc<Bucket>], card: JobCard) {
    if card.delay == 0 {
        // Plain queue use: no bucket involved.
        match index.add_to_ready_queue(&card.id).await {
            Ok(()) => {
                if let Err(err) = index.set_job_status(&card.id, JobStatus::Ready).await {
                    tracing::warn!(job = %card.id, %err, "set READY status failed");
                }
            }
            Err(err) => tracing::error!(job = %card.id, %err, "direct enqueue failed"),
        }
        return;
    }

    // Sort a snapshot by load. Bucket counts are small (order tens), so a
    // sort per arrival is cheaper than a concurrent priority structure.
    let mut order: Vec<(i64, usize)> = buckets
        .iter()
        .enumerate()
        .map(|(i, b)| (b.job_num(), i))
        .collect();
    order.sort_by_key(|&(n, _)| n);

    let target = &buckets[order[0].1];
    // Blocking send: back-pressure from a busy bucket is intended.
    if target.recv_job.send(card).await.is_err() {
        tracing::error!(bucket = target.id, "bucket receive channel closed");
    }
}
