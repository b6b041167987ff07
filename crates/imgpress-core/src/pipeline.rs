//! Batch-to-archive pipeline.
//!
//! [`stream_batch`] connects a [`BatchOrchestrator`] to an [`ArchiveStreamer`]:
//! each successful outcome is appended to the archive as soon as it completes,
//! failures are recorded in the returned [`BatchReport`] and never reach the
//! archive. The archive is finalized only after every item has an outcome.
//!
//! If the transport fails mid-batch, or the caller cancels the batch because
//! the consumer went away, the pipeline stops pulling outcomes, which aborts
//! any pending compression attempts, and returns the error without
//! finalizing.

use crate::{
    ArchiveEntry, BatchReport, CompressionOutcome, Compressor, Error, ItemFailure, Result,
    SourceItem,
    TargetFormat, archive::ArchiveStreamer, batch::BatchOrchestrator,
};
use futures::StreamExt;
use std::pin::pin;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// Compresses `items` and streams the successes into `archive`.
///
/// # Errors
///
/// Returns [`crate::Error::Transport`] if the archive cannot be written or
/// `cancel` fires before the archive is finalized. Item failures are never
/// errors here; they are listed in the report.
#[tracing::instrument(skip_all, fields(items = items.len(), %format))]
pub async fn stream_batch<C, W>(
    orchestrator: &BatchOrchestrator<C>,
    items: Vec<SourceItem>,
    format: TargetFormat,
    mut archive: ArchiveStreamer<W>,
    cancel: &CancellationToken,
) -> Result<BatchReport>
where
    C: Compressor + ?Sized + 'static,
    W: AsyncWrite + Unpin,
{
    let mut outcomes = pin!(orchestrator.run(items, format));
    let mut report = BatchReport::default();

    loop {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(abandoned(&report)),
            next = outcomes.next() => match next {
                Some(outcome) => outcome,
                None => break,
            },
        };

        match outcome {
            CompressionOutcome::Success {
                source_name,
                output_name,
                bytes,
            } => {
                let entry = ArchiveEntry {
                    name: output_name,
                    content: bytes,
                };
                let name = archive.append(entry).await.inspect_err(|e| {
                    tracing::warn!(error = %e, item = %source_name, "Archive transport failed, abandoning batch");
                })?;
                report.entries.push(name);
            }
            CompressionOutcome::Failure {
                source_name,
                reason,
            } => report.failures.push(ItemFailure {
                source_name,
                reason,
            }),
        }
    }

    if cancel.is_cancelled() {
        return Err(abandoned(&report));
    }
    archive.finalize().await?;

    tracing::info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        "Batch archived"
    );
    Ok(report)
}

fn abandoned(report: &BatchReport) -> Error {
    tracing::warn!(
        archived = report.succeeded(),
        "Consumer went away, abandoning batch"
    );
    Error::transport("consumer disconnected")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        archive::tests::read_archive,
        batch::tests::{FakeCompressor, PNG_SIGNATURE, item},
    };
    use core::time::Duration;
    use std::{
        collections::HashMap,
        sync::{Arc, atomic::Ordering},
    };
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn archive_contains_only_successes() -> Result<()> {
        let orchestrator = BatchOrchestrator::new(Arc::new(FakeCompressor::default()));
        let items = vec![
            item("a.jpg", b"a"),
            item("b.jpg", b"!b"),
            item("c.jpg", b"c"),
            item("d.jpg", b"!d"),
            item("e.jpg", b"e"),
        ];

        let mut out = Vec::new();
        let report = stream_batch(
            &orchestrator,
            items,
            TargetFormat::Png,
            ArchiveStreamer::begin(&mut out),
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(report.succeeded(), 3);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.total(), 5);

        let mut failed: Vec<_> = report.failures.iter().map(|f| f.source_name.as_str()).collect();
        failed.sort_unstable();
        assert_eq!(failed, ["b.jpg", "d.jpg"]);

        let mut entries = read_archive(&out);
        entries.sort();
        let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["compressed_a.png", "compressed_c.png", "compressed_e.png"]);
        for (_, content) in &entries {
            assert!(content.starts_with(&PNG_SIGNATURE));
        }
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_sources_get_distinct_entries() -> Result<()> {
        let orchestrator = BatchOrchestrator::new(Arc::new(FakeCompressor::default()))
            .with_concurrency(core::num::NonZeroUsize::MIN);
        let items = vec![item("photo.jpg", b"1"), item("photo.jpg", b"2")];

        let mut out = Vec::new();
        let report = stream_batch(
            &orchestrator,
            items,
            TargetFormat::Png,
            ArchiveStreamer::begin(&mut out),
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(report.entries, ["compressed_photo.png", "compressed_photo(1).png"]);
        assert_eq!(read_archive(&out).len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn all_failures_still_produce_valid_archive() -> Result<()> {
        let orchestrator = BatchOrchestrator::new(Arc::new(FakeCompressor::default()));
        let items = vec![item("a.png", b"!a"), item("b.png", b"!b")];

        let mut out = Vec::new();
        let report = stream_batch(
            &orchestrator,
            items,
            TargetFormat::Original,
            ArchiveStreamer::begin(&mut out),
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(report.succeeded(), 0);
        assert_eq!(report.failed(), 2);
        assert!(read_archive(&out).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn first_entry_is_readable_before_batch_completes() -> Result<()> {
        let orchestrator = BatchOrchestrator::new(Arc::new(FakeCompressor::default()))
            .with_item_timeout(Duration::from_millis(500));
        let items = vec![item("fast.png", b"f"), item("slow.png", b"~")];

        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            stream_batch(
                &orchestrator,
                items,
                TargetFormat::Original,
                ArchiveStreamer::begin(writer),
                &CancellationToken::new(),
            )
            .await
        });

        let mut first = [0_u8; 4];
        reader.read_exact(&mut first).await.expect("no bytes streamed");
        assert_eq!(&first, b"PK\x03\x04", "expected a local file header");
        assert!(!task.is_finished(), "batch finished before the slow item resolved");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.expect("read failed");
        let report = task.await.expect("pipeline panicked")?;

        let mut archive = first.to_vec();
        archive.extend_from_slice(&rest);
        let names: Vec<_> = read_archive(&archive).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["compressed_fast.png"]);
        assert_eq!(report.failures[0].source_name, "slow.png");
        Ok(())
    }

    #[tokio::test]
    async fn slow_reader_does_not_time_out_pending_items() -> Result<()> {
        let compressor = Arc::new(FakeCompressor {
            delays: HashMap::from([(b's', Duration::from_millis(100))]),
            ..Default::default()
        });
        let orchestrator = BatchOrchestrator::new(compressor)
            .with_concurrency(core::num::NonZeroUsize::new(2).unwrap())
            .with_item_timeout(Duration::from_millis(300));

        let mut large = vec![b'f'];
        large.resize(8 * 1024, 0xAB);
        let items = vec![item("fast.png", &large), item("slow.png", b"s")];

        let (writer, mut reader) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move {
            stream_batch(
                &orchestrator,
                items,
                TargetFormat::Original,
                ArchiveStreamer::begin(writer).stored(),
                &CancellationToken::new(),
            )
            .await
        });

        // The first entry overfills the pipe, so the writer is stuck until
        // long after the slow item's deadline would have passed.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let mut archive = Vec::new();
        reader.read_to_end(&mut archive).await.expect("read failed");
        let report = task.await.expect("pipeline panicked")?;

        assert!(report.failures.is_empty(), "got {:?}", report.failures);
        let mut names: Vec<_> = read_archive(&archive).into_iter().map(|(n, _)| n).collect();
        names.sort();
        assert_eq!(names, ["compressed_fast.png", "compressed_slow.png"]);
        Ok(())
    }

    #[tokio::test]
    async fn consumer_disconnect_aborts_batch() {
        let compressor = Arc::new(FakeCompressor {
            delays: HashMap::from([(b's', Duration::from_millis(100))]),
            ..Default::default()
        });
        let orchestrator = BatchOrchestrator::new(compressor)
            .with_concurrency(core::num::NonZeroUsize::MIN);
        let items = vec![item("first.png", b"f"), item("second.png", b"s")];

        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            stream_batch(
                &orchestrator,
                items,
                TargetFormat::Original,
                ArchiveStreamer::begin(writer),
                &CancellationToken::new(),
            )
            .await
        });

        let mut first = [0_u8; 4];
        reader.read_exact(&mut first).await.expect("no bytes streamed");
        drop(reader);

        let err = task.await.expect("pipeline panicked").unwrap_err();
        assert!(matches!(err, Error::Transport { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn cancellation_stops_batch_without_waiting_for_a_write() {
        let compressor = Arc::new(FakeCompressor {
            delays: HashMap::from([
                (b's', Duration::from_millis(50)),
                (b't', Duration::from_millis(50)),
            ]),
            ..Default::default()
        });
        let orchestrator = BatchOrchestrator::new(Arc::clone(&compressor))
            .with_concurrency(core::num::NonZeroUsize::MIN);
        let items = vec![
            item("first.png", b"f"),
            item("second.png", b"s"),
            item("third.png", b"t"),
        ];

        let cancel = CancellationToken::new();
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                stream_batch(
                    &orchestrator,
                    items,
                    TargetFormat::Original,
                    ArchiveStreamer::begin(writer),
                    &cancel,
                )
                .await
            }
        });

        let mut first = [0_u8; 4];
        reader.read_exact(&mut first).await.expect("no bytes streamed");
        // The reader stays open, so no write fails; only the token signals the
        // departure.
        cancel.cancel();

        let err = task.await.expect("pipeline panicked").unwrap_err();
        assert!(matches!(err, Error::Transport { .. }), "got {err:?}");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.expect("read failed");
        assert!(
            !rest.windows(4).any(|w| w == b"PK\x05\x06"),
            "archive was finalized after cancellation"
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(compressor.calls.load(Ordering::SeqCst) < 3, "batch kept running");
    }
}
