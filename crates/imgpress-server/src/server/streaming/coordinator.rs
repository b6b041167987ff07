use crate::server::{
    pool::manager::BatchGuard,
    telemetry::{increment_item_failures, increment_items_compressed, record_batch_duration},
};
use axum::body::Body;
use futures::Stream;
use imgpress_core::{
    ArchiveStreamer, BatchOrchestrator, Compressor, SourceItem, TargetFormat, stream_batch,
};
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};
use tokio_util::{
    io::ReaderStream,
    sync::{CancellationToken, DropGuard},
};
use tracing::Instrument;

/// Runs a batch in the background and returns the HTTP body its archive is
/// streamed into.
///
/// The archive writer and the body are joined by an in-memory pipe of
/// `buffer_bytes`. When the client reads slowly the pipe fills and the writer
/// waits while admitted compressions keep running. When the client
/// disconnects the body is dropped, which cancels the batch at once: the
/// pipeline stops, unfinished compressions are aborted and the archive is
/// never finalized.
///
/// `guard` keeps the batch registered as in flight until the archive is
/// finalized or abandoned.
pub fn stream_archive(
    orchestrator: BatchOrchestrator<dyn Compressor>,
    items: Vec<SourceItem>,
    format: TargetFormat,
    buffer_bytes: usize,
    guard: BatchGuard,
) -> Body {
    let (writer, reader) = tokio::io::duplex(buffer_bytes);
    let cancel = CancellationToken::new();
    let start = Instant::now();

    let body = DisconnectAware {
        inner: ReaderStream::new(reader),
        _cancel_on_drop: cancel.clone().drop_guard(),
    };

    let fut = async move {
        let _guard = guard;
        let archive = ArchiveStreamer::begin(writer);

        match stream_batch(&orchestrator, items, format, archive, &cancel).await {
            Ok(report) => {
                increment_items_compressed(report.succeeded() as u64);
                increment_item_failures(report.failed() as u64);
                record_batch_duration(start.elapsed().as_secs_f64() * 1000.0);
                for failure in &report.failures {
                    tracing::info!(
                        item = %failure.source_name,
                        reason = %failure.reason,
                        "Item left out of archive"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Batch stream aborted");
            }
        }
    };

    tokio::spawn(fut.instrument(tracing::info_span!("batch_stream")));

    Body::from_stream(body)
}

/// Response body stream that cancels its batch when the server drops it.
struct DisconnectAware<S> {
    inner: S,
    _cancel_on_drop: DropGuard,
}

impl<S: Stream + Unpin> Stream for DisconnectAware<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::pool::{manager::WorkerPool, tests::EchoCompressor};
    use core::time::Duration;
    use std::{
        io::Read,
        sync::{Arc, atomic::Ordering},
    };

    #[tokio::test]
    async fn body_carries_complete_archive() {
        let compressor: Arc<dyn Compressor> = Arc::new(EchoCompressor::default());
        let pool = WorkerPool::spawn(Arc::clone(&compressor), 1, Duration::from_millis(50));
        let orchestrator = BatchOrchestrator::new(compressor);

        let items = vec![
            SourceItem::new("a.png", &b"alpha"[..], None).unwrap(),
            SourceItem::new("b.png", &b"!bad"[..], None).unwrap(),
        ];
        let guard = pool.begin_batch().unwrap();

        let body = stream_archive(orchestrator, items, TargetFormat::Original, 16, guard);
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        assert_eq!(archive.len(), 1);
        let mut entry = archive.by_index(0).unwrap();
        assert_eq!(entry.name(), "compressed_a.png");
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"alpha");
        drop(entry);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.batches_inflight(), 0, "guard outlived the batch");
    }

    #[tokio::test]
    async fn dropped_body_cancels_batch() {
        let inner = Arc::new(EchoCompressor {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let compressor: Arc<dyn Compressor> = inner.clone();
        let pool = WorkerPool::spawn(Arc::clone(&compressor), 1, Duration::from_millis(50));
        let orchestrator =
            BatchOrchestrator::new(compressor).with_concurrency(core::num::NonZeroUsize::MIN);

        let items = (0..5)
            .map(|i| SourceItem::new(&format!("{i}.png"), &b"pixels"[..], None).unwrap())
            .collect();
        let guard = pool.begin_batch().unwrap();

        let body = stream_archive(orchestrator, items, TargetFormat::Original, 64 * 1024, guard);
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(body);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(inner.calls.load(Ordering::SeqCst) < 5, "batch outlived its client");
        assert_eq!(pool.batches_inflight(), 0, "guard outlived the batch");
    }
}
