//! Process-wide compression worker pool.
//!
//! - [`manager`] - [`WorkerPool`]: round-robin dispatch, batch accounting and
//!   phased shutdown.
//! - [`worker`] - the worker task loop.
//!
//! [`PooledCompressor`] adapts the pool back into a [`Compressor`], so the
//! batch orchestrator and every ingress adapter share one bounded set of
//! outbound calls.

pub mod manager;
pub mod worker;

use crate::server::streaming::request::WorkRequest;
use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use imgpress_core::{Compressor, Error, Result, TargetFormat};
use manager::WorkerPool;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A [`Compressor`] that runs every call on a [`WorkerPool`].
///
/// `inner` is the compressor the workers were spawned with; it is consulted
/// for readiness and the default deadline without going through the pool.
#[derive(Clone)]
pub struct PooledCompressor {
    pool: Arc<WorkerPool>,
    inner: Arc<dyn Compressor>,
}

impl PooledCompressor {
    pub fn new(pool: Arc<WorkerPool>, inner: Arc<dyn Compressor>) -> Self {
        Self { pool, inner }
    }
}

#[async_trait]
impl Compressor for PooledCompressor {
    async fn compress(&self, bytes: Bytes, format: TargetFormat) -> Result<Bytes> {
        let (response, rx) = oneshot::channel();
        self.pool
            .send_to_next_worker(WorkRequest::Compress {
                bytes,
                format,
                response,
            })
            .await?;

        rx.await.map_err(|_| Error::ChannelError {
            context: "worker dropped the request without replying".to_string(),
        })?
    }

    fn default_timeout(&self) -> Duration {
        self.inner.default_timeout()
    }

    fn check_ready(&self) -> Result<()> {
        self.inner.check_ready()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns its input unchanged, optionally after a delay. Inputs starting
    /// with `b'!'` fail.
    #[derive(Default)]
    pub(crate) struct EchoCompressor {
        pub delay: Duration,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl Compressor for EchoCompressor {
        async fn compress(&self, bytes: Bytes, _format: TargetFormat) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if bytes.first() == Some(&b'!') {
                return Err(Error::Upstream {
                    status: Some(400),
                    message: "Decode error".to_string(),
                });
            }
            Ok(bytes)
        }
    }

    fn pooled(inner: Arc<EchoCompressor>, workers: usize) -> PooledCompressor {
        let pool = WorkerPool::spawn(inner.clone(), workers, Duration::from_millis(50));
        PooledCompressor::new(Arc::new(pool), inner)
    }

    #[tokio::test]
    async fn round_trips_through_workers() -> Result<()> {
        let inner = Arc::new(EchoCompressor::default());
        let compressor = pooled(Arc::clone(&inner), 2);

        let out = compressor
            .compress(Bytes::from_static(b"image"), TargetFormat::Png)
            .await?;
        assert_eq!(out, Bytes::from_static(b"image"));

        let err = compressor
            .compress(Bytes::from_static(b"!bad"), TargetFormat::Png)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream { status: Some(400), .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn worker_count_caps_concurrent_calls() {
        let inner = Arc::new(EchoCompressor {
            delay: Duration::from_millis(30),
            ..Default::default()
        });
        let compressor = pooled(Arc::clone(&inner), 2);

        let calls = (0..8).map(|_| compressor.compress(Bytes::from_static(b"x"), TargetFormat::Original));
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 8);
        assert!(inner.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn calls_after_shutdown_are_refused() -> Result<()> {
        let inner = Arc::new(EchoCompressor::default());
        let pool = Arc::new(WorkerPool::spawn(inner.clone(), 1, Duration::from_millis(50)));
        let compressor = PooledCompressor::new(Arc::clone(&pool), inner);
        pool.shutdown().await?;

        let err = compressor
            .compress(Bytes::from_static(b"x"), TargetFormat::Original)
            .await
            .unwrap_err();
        assert_eq!(err, Error::ServiceShutdown);
        Ok(())
    }
}
