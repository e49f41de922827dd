//! Bounded FIFO of scan jobs shared by the worker pool
//!
//! Every `pop` removes the job under the queue lock, so a job is handed to exactly
//! one worker. A worker that panics after popping loses that job; nothing is
//! re-delivered.

use super::ScanJob;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
#[error("job queue is full (capacity {capacity})")]
pub struct QueueFull {
    pub job: ScanJob,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct JobQueue {
    jobs: Mutex<VecDeque<ScanJob>>,
    capacity: usize,
}

impl JobQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Queue sized to exactly hold `jobs`, filled in the given order
    pub async fn from_jobs(jobs: Vec<ScanJob>) -> Self {
        let queue = Self::with_capacity(jobs.len());
        let rejected = queue.extend(jobs).await;
        if rejected > 0 {
            log::warn!("{} jobs did not fit in the queue", rejected);
        }
        queue
    }

    /// Push every job in order; returns how many were rejected as over capacity
    pub async fn extend(&self, jobs: Vec<ScanJob>) -> usize {
        let mut rejected = 0;
        for job in jobs {
            if let Err(full) = self.push(job).await {
                log::debug!("{} dropped: {}", full.job.port, full);
                rejected += 1;
            }
        }
        rejected
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn push(&self, job: ScanJob) -> Result<(), QueueFull> {
        let mut jobs = self.jobs.lock().await;
        if jobs.len() >= self.capacity {
            return Err(QueueFull {
                job,
                capacity: self.capacity,
            });
        }
        jobs.push_back(job);
        Ok(())
    }

    /// Take the next job, `None` once the queue is drained
    pub async fn pop(&self) -> Option<ScanJob> {
        self.jobs.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}
