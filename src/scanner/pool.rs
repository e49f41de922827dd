//! Fixed-size pool of probe workers draining the job queue

use super::aggregator::ResultSink;
use super::queue::JobQueue;
use super::ScanJob;
use crate::config::MAX_WORKERS;
use crate::network::stealth::EvasionThrottle;
use crate::network::{PortResult, PortState, ProbeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// `W` workers sharing one queue, one probe set and one result sink
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    probes: Arc<ProbeSet>,
    throttle: EvasionThrottle,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(workers: usize, probes: ProbeSet, throttle: EvasionThrottle, cancel: CancellationToken) -> Self {
        Self {
            workers: workers.clamp(1, MAX_WORKERS),
            probes: Arc::new(probes),
            throttle,
            cancel,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every worker to completion and return how many jobs were processed
    ///
    /// The sink is consumed; once this returns, no sender remains alive, so the
    /// aggregator can finish.
    pub async fn run(&self, queue: Arc<JobQueue>, sink: ResultSink) -> usize {
        let mut handles = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let worker = Worker {
                id,
                queue: queue.clone(),
                probes: self.probes.clone(),
                throttle: self.throttle,
                sink: sink.clone(),
                cancel: self.cancel.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(sink);

        let mut processed = 0;
        for (id, outcome) in futures::future::join_all(handles).await.into_iter().enumerate() {
            match outcome {
                Ok(count) => processed += count,
                Err(e) => log::error!("Worker {} died, its in-flight job is lost: {}", id, e),
            }
        }
        log::debug!("{} workers processed {} jobs", self.workers, processed);
        processed
    }
}

struct Worker {
    id: usize,
    queue: Arc<JobQueue>,
    probes: Arc<ProbeSet>,
    throttle: EvasionThrottle,
    sink: ResultSink,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) -> usize {
        let mut processed = 0;
        loop {
            if self.cancel.is_cancelled() {
                log::debug!("Worker {} stopping on cancel", self.id);
                break;
            }
            let Some(job) = self.queue.pop().await else {
                break;
            };

            self.throttle.pause().await;
            let result = self.probe(job).await;
            processed += 1;

            if !self.sink.submit(result).await {
                log::warn!("Worker {} lost the result collector, exiting", self.id);
                break;
            }
        }
        processed
    }

    async fn probe(&self, job: ScanJob) -> PortResult {
        let start = Instant::now();
        match self.probes.probe(job.host, job.port, job.protocol).await {
            Ok(state) => PortResult::new(job.host, job.port, job.protocol, state)
                .with_response_time(start.elapsed()),
            Err(e) => {
                log::warn!("Probe {}:{}/{} failed: {}", job.host, job.port, job.protocol, e);
                PortResult::new(job.host, job.port, job.protocol, PortState::Filtered)
                    .with_response_time(start.elapsed())
                    .with_error(e.to_string())
            }
        }
    }
}
