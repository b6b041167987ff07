//! Failure-isolated fan-out of compression calls.
//!
//! [`BatchOrchestrator`] turns an ordered list of [`SourceItem`]s into a lazy
//! stream of [`CompressionOutcome`]s. Every item gets exactly one compression
//! attempt and exactly one outcome, no matter how its siblings fare. At most
//! `concurrency` calls are in flight at once (`1` degrades to strictly
//! sequential processing), and outcomes are yielded in completion order.
//!
//! Each attempt is bounded by a deadline. An attempt that exceeds it becomes a
//! [`CompressionOutcome::Failure`] like any other per-item error and never
//! aborts the batch.

use crate::{
    BatchResult, CompressedImage, CompressionOutcome, Compressor, Error, ImageKind, Result,
    SourceItem, TargetFormat, naming::output_name,
};
use bytes::Bytes;
use core::{num::NonZeroUsize, time::Duration};
use futures::{Stream, StreamExt, stream};
use std::sync::Arc;
use tokio_util::task::AbortOnDropHandle;
use tracing::Instrument;

/// Calls in flight per batch when nothing else is configured.
pub const DEFAULT_CONCURRENCY: NonZeroUsize = match NonZeroUsize::new(4) {
    Some(n) => n,
    None => unreachable!(),
};

/// Drives a [`Compressor`] over a batch of items.
///
/// Cloning is cheap and shares the underlying compressor.
pub struct BatchOrchestrator<C: ?Sized> {
    compressor: Arc<C>,
    concurrency: NonZeroUsize,
    item_timeout: Option<Duration>,
}

impl<C: ?Sized> Clone for BatchOrchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            compressor: Arc::clone(&self.compressor),
            concurrency: self.concurrency,
            item_timeout: self.item_timeout,
        }
    }
}

impl<C: Compressor + ?Sized + 'static> BatchOrchestrator<C> {
    pub fn new(compressor: Arc<C>) -> Self {
        Self {
            compressor,
            concurrency: DEFAULT_CONCURRENCY,
            item_timeout: None,
        }
    }

    /// Caps the number of compression calls in flight for one batch.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: NonZeroUsize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Overrides the per-item deadline. Defaults to
    /// [`Compressor::default_timeout`].
    #[must_use]
    pub const fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    pub fn compressor(&self) -> &Arc<C> {
        &self.compressor
    }

    pub const fn concurrency(&self) -> NonZeroUsize {
        self.concurrency
    }

    pub fn item_timeout(&self) -> Duration {
        self.item_timeout
            .unwrap_or_else(|| self.compressor.default_timeout())
    }

    /// Starts processing `items`, returning their outcomes as they complete.
    ///
    /// The stream is finite and yields exactly `items.len()` outcomes. It does
    /// no work until polled. Each admitted attempt runs as its own task, so
    /// attempts keep making progress (and meet their deadline) while the
    /// consumer is busy; a slow consumer only delays the admission of further
    /// items. Dropping the stream aborts any attempts that have not yet
    /// resolved.
    pub fn run(
        &self,
        items: Vec<SourceItem>,
        format: TargetFormat,
    ) -> impl Stream<Item = CompressionOutcome> + Send + use<C> {
        let compressor = Arc::clone(&self.compressor);
        let timeout = self.item_timeout();

        stream::iter(items)
            .map(move |item| {
                let source_name = item.name.clone();
                let work = resolve(Arc::clone(&compressor), item, format, timeout);
                let task = AbortOnDropHandle::new(tokio::spawn(work.in_current_span()));

                async move {
                    task.await.unwrap_or_else(|e| {
                        tracing::error!(item = %source_name, error = %e, "Compression task failed");
                        CompressionOutcome::Failure {
                            source_name,
                            reason: format!("Compression task failed: {e}"),
                        }
                    })
                }
            })
            .buffer_unordered(self.concurrency.get())
    }

    /// Runs a whole batch and gathers every outcome.
    pub async fn collect(&self, items: Vec<SourceItem>, format: TargetFormat) -> BatchResult {
        let outcomes = self.run(items, format).collect().await;
        BatchResult { outcomes }
    }

    /// Compresses a single item under the same deadline and naming rules as a
    /// batch, but hands back the typed error instead of a failure outcome.
    ///
    /// # Errors
    ///
    /// Any error produced by the compressor, or [`Error::Timeout`].
    pub async fn compress_single(
        &self,
        item: SourceItem,
        format: TargetFormat,
    ) -> Result<CompressedImage> {
        let SourceItem {
            name,
            bytes,
            declared_mime_type,
        } = item;

        let mime_type = match format.mime_type() {
            Some(mime) => mime.to_string(),
            None => declared_mime_type
                .or_else(|| ImageKind::sniff(&bytes).map(|k| k.mime_type().to_string()))
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        };

        let bytes = attempt(self.compressor.as_ref(), bytes, format, self.item_timeout()).await?;

        Ok(CompressedImage {
            output_name: output_name(&name, format),
            mime_type,
            bytes,
        })
    }
}

async fn attempt<C: Compressor + ?Sized>(
    compressor: &C,
    bytes: Bytes,
    format: TargetFormat,
    timeout: Duration,
) -> Result<Bytes> {
    tokio::time::timeout(timeout, compressor.compress(bytes, format))
        .await
        .unwrap_or(Err(Error::Timeout { after: timeout }))
}

#[tracing::instrument(skip_all, fields(item = %item.name, bytes = item.bytes.len()))]
async fn resolve<C: Compressor + ?Sized>(
    compressor: Arc<C>,
    item: SourceItem,
    format: TargetFormat,
    timeout: Duration,
) -> CompressionOutcome {
    let SourceItem { name, bytes, .. } = item;

    match attempt(compressor.as_ref(), bytes, format, timeout).await {
        Ok(bytes) => {
            let output_name = output_name(&name, format);
            tracing::debug!(%output_name, output_bytes = bytes.len(), "Item compressed");
            CompressionOutcome::Success {
                source_name: name,
                output_name,
                bytes,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Item failed, continuing with the rest of the batch");
            CompressionOutcome::Failure {
                source_name: name,
                reason: e.to_string(),
            }
        }
    }
}
