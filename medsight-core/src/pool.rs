//! Bounded inference worker pool.
//!
//! Submissions go through a bounded `async-channel` queue with `try_send`, so a full queue is
//! reported immediately as [`AnalysisError::ServiceOverloaded`] instead of blocking the caller.
//! Each job carries a one-shot reply channel; callers wait on it for at most the configured
//! request timeout. A job whose caller has timed out is skipped if no worker has picked it up yet.

use std::{
    fmt,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use async_channel::{Receiver, Sender, TrySendError, bounded};
use log::{debug, info, warn};

use medsight_utils::config::WorkerSettings;

use crate::dispatcher::{AnalysisRequest, AnalysisResult, InferenceDispatcher};
use crate::error::AnalysisError;

type Reply = Result<AnalysisResult, AnalysisError>;

struct Job {
    request: AnalysisRequest,
    reply: mpsc::SyncSender<Reply>,
    enqueued: Instant,
    cancelled: Arc<AtomicBool>,
}

/// Fixed set of worker threads draining a bounded job queue.
pub struct WorkerPool {
    sender: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_depth: NonZeroUsize,
    timeout: Duration,
}

impl WorkerPool {
    pub fn new(dispatcher: Arc<InferenceDispatcher>, settings: &WorkerSettings) -> Result<Self> {
        let workers = NonZeroUsize::new(settings.workers)
            .context("worker pool needs at least one worker")?;
        let queue_depth = NonZeroUsize::new(settings.queue_depth)
            .context("worker pool queue depth must be at least 1")?;
        let timeout = settings.request_timeout();
        anyhow::ensure!(!timeout.is_zero(), "request timeout must be positive");

        let (sender, receiver) = bounded::<Job>(queue_depth.get());
        let mut handles = Vec::with_capacity(workers.get());
        for index in 0..workers.get() {
            let receiver = receiver.clone();
            let dispatcher = Arc::clone(&dispatcher);
            let handle = thread::Builder::new()
                .name(format!("medsight-worker-{index}"))
                .spawn(move || worker_loop(index, &receiver, &dispatcher))
                .with_context(|| format!("failed to spawn inference worker {index}"))?;
            handles.push(handle);
        }
        info!(
            "inference pool started: {} workers, queue depth {}, timeout {:?}",
            workers, queue_depth, timeout
        );

        Ok(Self {
            sender,
            workers: handles,
            queue_depth,
            timeout,
        })
    }

    /// Queue a request without blocking.
    pub fn submit(&self, request: AnalysisRequest) -> Result<PendingAnalysis, AnalysisError> {
        let (reply, receiver) = mpsc::sync_channel(1);
        let model_id = request.model_id.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let job = Job {
            request,
            reply,
            enqueued: Instant::now(),
            cancelled: Arc::clone(&cancelled),
        };
        match self.sender.try_send(job) {
            Ok(()) => Ok(PendingAnalysis {
                receiver,
                model_id,
                timeout: self.timeout,
                cancelled,
            }),
            Err(TrySendError::Full(_)) => {
                warn!(
                    "rejecting request for '{model_id}': {} jobs already queued",
                    self.queue_depth
                );
                Err(AnalysisError::ServiceOverloaded(format!(
                    "server is busy ({} requests queued); retry later",
                    self.queue_depth
                )))
            }
            Err(TrySendError::Closed(_)) => Err(AnalysisError::ServiceOverloaded(
                "server is shutting down".to_string(),
            )),
        }
    }

    /// Submit and wait for the result.
    pub fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        self.submit(request)?.wait()
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.get()
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("queue_depth", &self.queue_depth)
            .field("queued", &self.queued())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("inference worker panicked during shutdown");
            }
        }
        debug!("inference pool stopped");
    }
}

fn worker_loop(index: usize, receiver: &Receiver<Job>, dispatcher: &InferenceDispatcher) {
    while let Ok(job) = receiver.recv_blocking() {
        if job.cancelled.load(Ordering::Acquire) {
            debug!(
                "worker {index} skipping '{}': caller gave up after {:.2?}",
                job.request.model_id,
                job.enqueued.elapsed()
            );
            continue;
        }
        debug!(
            "worker {index} picked up '{}' after {:.2?} in queue",
            job.request.model_id,
            job.enqueued.elapsed()
        );
        let result = dispatcher.analyze(&job.request);
        if job.reply.send(result).is_err() {
            debug!(
                "worker {index}: caller stopped waiting for '{}'",
                job.request.model_id
            );
        }
    }
    debug!("worker {index} exiting");
}

/// Handle to a queued request.
#[derive(Debug)]
pub struct PendingAnalysis {
    receiver: mpsc::Receiver<Reply>,
    model_id: String,
    timeout: Duration,
    cancelled: Arc<AtomicBool>,
}

impl PendingAnalysis {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Wait up to the pool's request timeout.
    pub fn wait(self) -> Result<AnalysisResult, AnalysisError> {
        let timeout = self.timeout;
        self.wait_timeout(timeout)
    }

    /// Wait up to `timeout`.
    ///
    /// On expiry the job is marked cancelled: a worker that has not started it skips it, one
    /// that already has runs it to completion and the result is discarded.
    pub fn wait_timeout(self, timeout: Duration) -> Result<AnalysisResult, AnalysisError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.cancelled.store(true, Ordering::Release);
                warn!("request for '{}' timed out after {timeout:?}", self.model_id);
                Err(AnalysisError::inference(
                    self.model_id,
                    anyhow!("timed out after {timeout:?} waiting for inference"),
                ))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(AnalysisError::inference(
                self.model_id,
                anyhow!("inference worker exited without a result"),
            )),
        }
    }
}
