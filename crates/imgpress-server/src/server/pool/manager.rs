//! Process-wide pool of compression workers.
//!
//! [`WorkerPool`] owns a fixed set of worker tasks, each listening on its own
//! bounded [`mpsc::Receiver`] and handling one [`WorkRequest`] at a time. Work
//! is distributed round-robin, so the number of workers is the hard cap on
//! concurrent calls to the compression service no matter how many batches
//! are running.
//!
//! The pool also tracks in-flight batches so shutdown can wait for them to
//! drain before cancelling.

use super::worker::worker_loop;
use crate::server::{
    streaming::request::WorkRequest,
    telemetry::{decrement_batches_inflight, increment_batches_inflight},
};
use core::time::Duration;
use imgpress_core::{Compressor, Error, Result};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const WORKER_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// A cooperative pool of asynchronous workers that process [`WorkRequest`]s.
pub struct WorkerPool {
    workers: Vec<mpsc::Sender<WorkRequest>>,
    next_worker: AtomicUsize,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
    shutting_down: AtomicBool,
    batches_inflight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawns `num_workers` worker tasks sharing `compressor` and returns the
    /// pool that feeds them.
    ///
    /// Each worker gets a queue of one: a worker holds at most one pending
    /// request besides the one it is executing, and a sender to a busy worker
    /// waits instead of piling up work.
    pub fn spawn(
        compressor: Arc<dyn Compressor>,
        num_workers: usize,
        shutdown_timeout: Duration,
    ) -> Self {
        let shutdown_token = CancellationToken::new();
        let mut workers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let (tx, rx) = mpsc::channel(1);
            workers.push(tx);
            tokio::spawn(worker_loop(
                worker_id,
                rx,
                Arc::clone(&compressor),
                shutdown_token.clone(),
            ));
        }

        Self::new(workers, shutdown_token, shutdown_timeout)
    }

    /// Constructs a [`WorkerPool`] from already initialized worker channels.
    pub fn new(
        workers: Vec<mpsc::Sender<WorkRequest>>,
        shutdown_token: CancellationToken,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            workers,
            next_worker: AtomicUsize::new(0),
            shutdown_token,
            shutdown_timeout,
            shutting_down: AtomicBool::new(false),
            batches_inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Returns the index of the next worker to receive work (round-robin).
    pub fn next_worker_index(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Sends a [`WorkRequest`] to the next worker in the pool, waiting while
    /// that worker's queue is full.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once the pool has been cancelled.
    /// - [`Error::ChannelError`] if the worker's channel is closed.
    pub async fn send_to_next_worker(&self, request: WorkRequest) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        let worker_idx = self.next_worker_index();
        let worker = &self.workers[worker_idx];

        tokio::select! {
            biased;
            () = self.shutdown_token.cancelled() => Err(Error::ServiceShutdown),
            sent = worker.send(request) => sent.map_err(|_| Error::ChannelError {
                context: format!("Worker {worker_idx} channel closed"),
            }),
        }
    }

    /// `true` once shutdown has begun. New requests must be refused.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn batches_inflight(&self) -> usize {
        self.batches_inflight.load(Ordering::Acquire)
    }

    /// Registers a new batch. The batch counts as in flight until the
    /// returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] if shutdown has begun.
    pub fn begin_batch(&self) -> Result<BatchGuard> {
        if self.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }
        self.batches_inflight.fetch_add(1, Ordering::AcqRel);
        increment_batches_inflight();
        Ok(BatchGuard {
            counter: Arc::clone(&self.batches_inflight),
        })
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Refuses new batches.
    /// - Waits up to the configured shutdown timeout for in-flight batches.
    /// - Cancels the shared [`CancellationToken`]; queued requests are
    ///   answered with [`Error::ServiceShutdown`].
    /// - Sends a [`WorkRequest::Shutdown`] to each worker and waits (up to 3
    ///   seconds per worker) for the acknowledgement.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new requests ===
        tracing::info!("Refusing new requests");
        self.shutting_down.store(true, Ordering::Release);

        // === Phase 1: Wait for in-flight batches to drain ===
        tracing::info!(
            "Draining in-flight batches ({} active)",
            self.batches_inflight()
        );
        let drain_result = timeout(self.shutdown_timeout, async {
            while self.batches_inflight() > 0 {
                sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => tracing::debug!("All in-flight batches drained successfully"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} batches still active)",
                self.batches_inflight()
            ),
        }

        // === Phase 2: Cancel any remaining work ===
        tracing::debug!("Cancelling remaining work via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Notify workers to shut down ===
        tracing::debug!("Notifying all workers to shut down");
        let mut shutdown_handles = Vec::with_capacity(self.workers.len());

        for (i, worker) in self.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if let Err(e) = worker.send(WorkRequest::Shutdown { response: tx }).await {
                tracing::error!("Failed to send shutdown to worker {i}: {e}");
            } else {
                shutdown_handles.push((i, rx));
            }
        }

        let ack_futures = shutdown_handles.into_iter().map(|(i, rx)| async move {
            match timeout(WORKER_ACK_TIMEOUT, rx).await {
                Ok(Ok(())) => tracing::trace!("Worker {i} shutdown acknowledged"),
                Ok(Err(e)) => tracing::error!("Worker {i} returned error: {e}"),
                Err(_) => tracing::warn!("Worker {i} shutdown timed out"),
            }
        });

        futures::future::join_all(ack_futures).await;

        tracing::info!("Worker pool shutdown complete");
        Ok(())
    }
}

/// Marks one batch as in flight for as long as it lives.
#[derive(Debug)]
pub struct BatchGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
        decrement_batches_inflight();
    }
}
