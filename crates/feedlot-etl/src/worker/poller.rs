//! Finds files that need a worker and feeds them to the pool.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};

use crate::error::WorkerError;
use crate::state::{FileState, StateController, TransitionError};
use crate::worker::job::IngestJob;
use crate::worker::pool::WorkerPool;

/// Sleep granularity while waiting for the next tick.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(100);

pub struct Poller {
    controller: StateController,
    limit: u32,
}

impl Poller {
    /// `limit` caps how many files of each kind one sweep picks up.
    pub fn new(controller: StateController, limit: u32) -> Self {
        Self {
            controller,
            limit: limit.max(1),
        }
    }

    /// One sweep. Reclaims stale leases first, then collects, in order:
    /// new uploads, due retries, unleased `parsing` files (dead-letter
    /// retries and reclaimed work) and approved files.
    pub fn poll(&self, now: DateTime<Utc>) -> Result<Vec<IngestJob>, TransitionError> {
        let reclaimed = self.controller.reclaim_stale_leases(now)?;
        if !reclaimed.is_empty() {
            info!("Reclaimed {} stale leases", reclaimed.len());
        }

        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        let mut push = |job: IngestJob| {
            if seen.insert(job.file_id.clone()) {
                jobs.push(job);
            }
        };

        for file in self.controller.files_in_state(FileState::Uploaded, self.limit)? {
            push(IngestJob::ingest(file.id));
        }
        for file in self.controller.due_retries(now, self.limit)? {
            push(IngestJob::ingest(file.id));
        }
        for file in self.controller.files_in_state(FileState::Parsing, self.limit)? {
            if !file.is_leased_at(now) {
                push(IngestJob::ingest(file.id));
            }
        }
        for file in self.controller.files_in_state(FileState::Approved, self.limit)? {
            if !file.is_leased_at(now) {
                push(IngestJob::load(file.id));
            }
        }

        Ok(jobs)
    }

    /// Polls once and submits what it found. Returns the number queued.
    pub fn tick(&self, pool: &WorkerPool) -> Result<usize, WorkerError> {
        let jobs = match self.poll(Utc::now()) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Poll failed: {}", e);
                return Ok(0);
            }
        };

        let mut queued = 0;
        for job in jobs {
            if pool.submit(job)? {
                queued += 1;
            }
        }
        if queued > 0 {
            debug!("Queued {} files", queued);
        }
        Ok(queued)
    }

    /// Ticks every `interval` until `shutdown` is set or the pool closes.
    pub fn run(
        &self,
        pool: &WorkerPool,
        interval: Duration,
        shutdown: &AtomicBool,
    ) -> Result<(), WorkerError> {
        info!("Polling every {:?}", interval);

        while !shutdown.load(Ordering::Relaxed) {
            match self.tick(pool) {
                Ok(_) => {}
                Err(WorkerError::ChannelClosed) if shutdown.load(Ordering::Relaxed) => break,
                Err(e) => return Err(e),
            }

            while let Some(result) = pool.try_recv_result() {
                debug!(
                    "Job {} for file {} took {:?}",
                    result.job_id, result.file_id, result.duration
                );
            }

            let mut waited = Duration::ZERO;
            while waited < interval && !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(SHUTDOWN_CHECK);
                waited += SHUTDOWN_CHECK;
            }
        }

        info!("Poller stopped");
        Ok(())
    }
}
