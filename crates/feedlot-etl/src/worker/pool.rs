use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, error, info, warn};
use tokio::runtime::Runtime;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::WorkerError;
use crate::pipeline::{
    BroadcastProgress, IngestOutcome, NoopProgress, Pipeline, PipelineError, ProgressReporter,
    ProgressUpdate,
};
use crate::worker::job::{IngestJob, JobKind, JobResult};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// File ids queued or running. Keeps the poller from stacking duplicates.
type InFlight = Arc<Mutex<HashSet<String>>>;

pub struct WorkerPool {
    job_sender: Sender<IngestJob>,
    result_receiver: Receiver<JobResult>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    in_flight: InFlight,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<Pipeline>, worker_count: usize) -> Result<Self, WorkerError> {
        Self::with_progress_sender(pipeline, worker_count, None)
    }

    /// Starts `worker_count` threads, each driving the pipeline on its own
    /// current-thread runtime.
    pub fn with_progress_sender(
        pipeline: Arc<Pipeline>,
        worker_count: usize,
        progress_sender: Option<Arc<broadcast::Sender<ProgressUpdate>>>,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be > 0".to_string(),
            ));
        }

        let (job_sender, job_receiver) = bounded::<IngestJob>(worker_count * 2);
        let (result_sender, result_receiver) = unbounded::<JobResult>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
        let pool_id = Uuid::new_v4().simple().to_string();

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(WorkerError::Runtime)?;

            let worker = Worker {
                owner: format!("worker-{}-{}", worker_id, pool_id),
                runtime,
                pipeline: Arc::clone(&pipeline),
                jobs: job_receiver.clone(),
                results: result_sender.clone(),
                shutdown: Arc::clone(&shutdown),
                in_flight: Arc::clone(&in_flight),
                progress_sender: progress_sender.clone(),
            };

            let handle = thread::Builder::new()
                .name(format!("etl-worker-{}", worker_id))
                .spawn(move || worker.run())
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            job_sender,
            result_receiver,
            workers,
            shutdown,
            in_flight,
        })
    }

    /// Queues a job, blocking while the queue is full.
    ///
    /// Returns `Ok(false)` without queueing when the same file is already
    /// queued or running.
    pub fn submit(&self, job: IngestJob) -> Result<bool, WorkerError> {
        if self.is_shutdown() {
            return Err(WorkerError::ChannelClosed);
        }
        if !self.mark_in_flight(&job.file_id) {
            debug!("File {} already queued, skipping", job.file_id);
            return Ok(false);
        }

        let file_id = job.file_id.clone();
        let mut pending = job;
        loop {
            match self.job_sender.send_timeout(pending, RECV_TIMEOUT) {
                Ok(()) => return Ok(true),
                Err(SendTimeoutError::Timeout(job)) => {
                    if self.is_shutdown() {
                        self.clear_in_flight(&file_id);
                        return Err(WorkerError::ChannelClosed);
                    }
                    pending = job;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.clear_in_flight(&file_id);
                    return Err(WorkerError::ChannelClosed);
                }
            }
        }
    }

    pub fn try_recv_result(&self) -> Option<JobResult> {
        self.result_receiver.try_recv().ok()
    }

    pub fn recv_result(&self) -> Option<JobResult> {
        self.result_receiver.recv().ok()
    }

    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<JobResult> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    /// Number of files queued or being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Waits for every worker to stop. Jobs already running finish first.
    pub fn wait(self) {
        drop(self.job_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn mark_in_flight(&self, file_id: &str) -> bool {
        match self.in_flight.lock() {
            Ok(mut set) => set.insert(file_id.to_string()),
            // A poisoned set only loses deduplication.
            Err(poisoned) => poisoned.into_inner().insert(file_id.to_string()),
        }
    }

    fn clear_in_flight(&self, file_id: &str) {
        clear_in_flight(&self.in_flight, file_id);
    }
}

fn clear_in_flight(in_flight: &InFlight, file_id: &str) {
    match in_flight.lock() {
        Ok(mut set) => set.remove(file_id),
        Err(poisoned) => poisoned.into_inner().remove(file_id),
    };
}

struct Worker {
    owner: String,
    runtime: Runtime,
    pipeline: Arc<Pipeline>,
    jobs: Receiver<IngestJob>,
    results: Sender<JobResult>,
    shutdown: Arc<AtomicBool>,
    in_flight: InFlight,
    progress_sender: Option<Arc<broadcast::Sender<ProgressUpdate>>>,
}

impl Worker {
    fn run(self) {
        debug!("Worker {} started", self.owner);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("Worker {} received shutdown signal", self.owner);
                break;
            }

            match self.jobs.recv_timeout(RECV_TIMEOUT) {
                Ok(job) => {
                    let result = self.process(&job);
                    clear_in_flight(&self.in_flight, &job.file_id);

                    if let Err(e) = self.results.send(result) {
                        error!("Worker {} failed to send result: {}", self.owner, e);
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Worker {} job channel disconnected", self.owner);
                    break;
                }
            }
        }

        debug!("Worker {} stopped", self.owner);
    }

    fn process(&self, job: &IngestJob) -> JobResult {
        debug!(
            "Worker {} running {} for file {}",
            self.owner, job.kind, job.file_id
        );
        let started = Instant::now();

        let outcome = match &self.progress_sender {
            Some(sender) => {
                let progress = BroadcastProgress::new(&job.file_id, Arc::clone(sender));
                self.runtime.block_on(self.execute(job, &progress))
            }
            None => self.runtime.block_on(self.execute(job, &NoopProgress)),
        };

        match &outcome {
            Ok(IngestOutcome::Finished { state, report }) => info!(
                "File {} reached {} ({} rows, {} loadable)",
                job.file_id, state, report.rows_total, report.rows_loadable
            ),
            Ok(IngestOutcome::Failed { kind, message, .. }) => {
                warn!("File {} failed ({:?}): {}", job.file_id, kind, message)
            }
            Ok(IngestOutcome::Cancelled) => info!("File {} was cancelled", job.file_id),
            Ok(IngestOutcome::Superseded) => {
                debug!("File {} was claimed elsewhere", job.file_id)
            }
            Err(e) => error!("File {} could not be processed: {}", job.file_id, e),
        }

        JobResult::new(
            job,
            &self.owner,
            outcome.map_err(|e| e.to_string()),
            started.elapsed(),
        )
    }

    async fn execute(
        &self,
        job: &IngestJob,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestOutcome, PipelineError> {
        match job.kind {
            JobKind::Ingest => self.pipeline.ingest(&job.file_id, &self.owner, progress).await,
            JobKind::Load => self.pipeline.load(&job.file_id, &self.owner, progress).await,
        }
    }
}
