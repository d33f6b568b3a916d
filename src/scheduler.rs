//! Bounded-concurrency, rate-limited ingestion queue.
//!
//! A fixed pool of worker tasks drains one queue of file ids. Before each
//! job a worker waits on a shared GCRA limiter (`governor`), so admissions to
//! the classification service never exceed `max_per_window` per window no
//! matter how many workers are configured.
//!
//! Each job drives the status state machine:
//!
//! ```text
//! pending ──▶ processing ──▶ complete
//!                  │
//!                  ├──▶ pending   (failure, retry_count < max_retries)
//!                  └──▶ error     (failure, retry_count reaches max_retries)
//! ```
//!
//! Failures, including a panicking processor, are converted into state
//! transitions at the job boundary and never stop a worker. A failure after
//! the metadata commit ([`VectorSyncError`]) leaves the file `complete` and
//! only charges its retry budget. Nothing re-enqueues a failed file on its
//! own; recovery or an explicit retry does.
//!
//! A file id is tracked from `enqueue` until its job finishes. A second
//! `enqueue` of a queued id is ignored. A second `enqueue` of an id whose job
//! is already running is remembered, and the id is queued again once that
//! job finishes, so a reanalyze issued mid-job is not lost.

use anyhow::Result;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::IngestConfig;
use crate::models::{FileRecord, FileStatus};
use crate::pipeline::VectorSyncError;
use crate::store::RecordStore;

/// Work performed for one file between `processing` and `complete`.
#[async_trait]
pub trait FileProcessor: Send + Sync {
    async fn process(&self, file: &FileRecord) -> Result<()>;
}

type AdmissionLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_concurrent: usize,
    pub max_per_window: u32,
    pub window: Duration,
    pub max_retries: i64,
}

impl SchedulerOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            max_per_window: config.max_per_window,
            window: Duration::from_millis(config.window_ms),
            max_retries: config.max_retries,
        }
    }

    fn quota(&self) -> Result<Quota> {
        let burst = NonZeroU32::new(self.max_per_window)
            .ok_or_else(|| anyhow::anyhow!("ingest.max_per_window must be >= 1"))?;
        let period = self.window / self.max_per_window;
        let quota = Quota::with_period(period)
            .ok_or_else(|| anyhow::anyhow!("ingest.window_ms too small for max_per_window"))?;
        Ok(quota.allow_burst(burst))
    }
}

#[derive(Debug, Default)]
struct Slot {
    running: bool,
    rerun: bool,
}

struct Shared {
    store: RecordStore,
    processor: Arc<dyn FileProcessor>,
    limiter: AdmissionLimiter,
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Ids enqueued or processing.
    in_flight: Mutex<HashMap<String, Slot>>,
    idle: Notify,
    max_retries: i64,
}

impl Shared {
    fn start(&self, file_id: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.entry(file_id.to_string()).or_default().running = true;
    }

    fn finish(&self, file_id: &str) {
        // same lock order as `Scheduler::enqueue`
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());

        if in_flight.get(file_id).is_some_and(|slot| slot.rerun) {
            let requeued = sender
                .as_ref()
                .is_some_and(|tx| tx.send(file_id.to_string()).is_ok());
            if requeued {
                debug!(file_id, "requeued after a request during processing");
                in_flight.insert(file_id.to_string(), Slot::default());
                return;
            }
            warn!(file_id, "rerun dropped, scheduler stopping");
        }

        in_flight.remove(file_id);
        if in_flight.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

pub struct Scheduler {
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Spawn the worker pool. Must be called inside a Tokio runtime.
    pub fn start(
        store: RecordStore,
        processor: Arc<dyn FileProcessor>,
        options: SchedulerOptions,
    ) -> Result<Self> {
        let limiter = RateLimiter::direct(options.quota()?);
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let shared = Arc::new(Shared {
            store,
            processor,
            limiter,
            sender: Mutex::new(Some(tx)),
            in_flight: Mutex::new(HashMap::new()),
            idle: Notify::new(),
            max_retries: options.max_retries,
        });

        let worker_count = options.max_concurrent.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let rx = rx.clone();
            let shared = shared.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, shared).await;
            }));
        }

        info!(
            workers = worker_count,
            max_per_window = options.max_per_window,
            window_ms = options.window.as_millis() as u64,
            "ingestion scheduler started"
        );

        Ok(Self {
            workers: Mutex::new(workers),
            shared,
        })
    }

    /// Queue `file_id` for processing.
    ///
    /// Returns `false` when the id is already queued or processing, or when
    /// the scheduler has been shut down. An id that is processing is queued
    /// again as soon as its current job finishes.
    pub fn enqueue(&self, file_id: &str) -> bool {
        let sender = self.shared.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = sender.as_ref() else {
            warn!(file_id, "enqueue after shutdown ignored");
            return false;
        };

        let mut in_flight = self
            .shared
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = in_flight.get_mut(file_id) {
            if slot.running {
                slot.rerun = true;
                debug!(file_id, "processing, rerun scheduled");
            } else {
                debug!(file_id, "already queued");
            }
            return false;
        }

        if tx.send(file_id.to_string()).is_err() {
            return false;
        }
        in_flight.insert(file_id.to_string(), Slot::default());
        true
    }

    pub fn in_flight(&self) -> usize {
        self.shared
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Resolve once nothing is queued or processing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work, let queued jobs drain, and join the workers.
    pub async fn shutdown(&self) {
        let sender = self
            .shared
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(sender);

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "ingestion worker terminated abnormally");
            }
        }
        info!("ingestion scheduler stopped");
    }

    /// Stop without draining. Files caught mid-job stay in `processing`
    /// until the next startup recovery.
    pub fn abort(&self) {
        self.shared
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in &workers {
            handle.abort();
        }
        debug!(workers = workers.len(), "ingestion scheduler aborted");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // close the queue so idle workers exit
        self.shared
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    shared: Arc<Shared>,
) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(file_id) = next else {
            debug!(worker_id, "queue closed, worker exiting");
            return;
        };

        shared.limiter.until_ready().await;
        shared.start(&file_id);
        run_job(&shared, &file_id).await;
        shared.finish(&file_id);
    }
}

#[instrument(skip_all, fields(file_id = %file_id))]
async fn run_job(shared: &Shared, file_id: &str) {
    let file = match shared.store.get_file(file_id).await {
        Ok(Some(file)) => file,
        Ok(None) => {
            debug!("file deleted before processing");
            return;
        }
        Err(e) => {
            error!(error = %e, "could not load file record");
            return;
        }
    };

    // a `complete` file carrying an error only needs its vectors rebuilt
    let vectors_only = match file.status {
        FileStatus::Error => {
            debug!(status = %file.status, "file not awaiting processing, skipped");
            return;
        }
        FileStatus::Complete if file.error_message.is_none() => {
            debug!(status = %file.status, "file not awaiting processing, skipped");
            return;
        }
        FileStatus::Complete => true,
        FileStatus::Pending | FileStatus::Processing => false,
    };

    if !vectors_only {
        if let Err(e) = shared.store.mark_processing(file_id).await {
            error!(error = %e, "could not mark file processing");
            return;
        }
    }

    let processor = shared.processor.clone();
    let job_file = file.clone();
    let outcome = tokio::spawn(async move { processor.process(&job_file).await }).await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            let vector_only = e.downcast_ref::<VectorSyncError>().is_some();
            Some((format!("{:#}", e), vector_only))
        }
        Err(join_err) => Some((format!("processing aborted: {}", join_err), false)),
    };

    match failure {
        None => match shared.store.mark_complete(file_id).await {
            Ok(true) => info!(filename = %file.filename, "file processed"),
            Ok(false) => debug!("file changed during processing, left as is"),
            Err(e) => error!(error = %e, "could not mark file complete"),
        },
        Some((message, vector_only)) => {
            let recorded = if vector_only {
                shared.store.record_vector_failure(file_id, &message).await
            } else {
                shared
                    .store
                    .record_failure(file_id, &message, shared.max_retries)
                    .await
            };
            match recorded {
                Ok(Some(view)) => warn!(
                    status = %view.status,
                    retry_count = view.retry_count,
                    error = %message,
                    "file processing failed"
                ),
                Ok(None) => debug!("file changed during processing, failure not recorded"),
                Err(e) => error!(error = %e, "could not record failure"),
            }
        }
    }
}
