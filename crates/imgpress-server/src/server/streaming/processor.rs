use bytes::Bytes;
use imgpress_core::{Compressor, Result, TargetFormat};
use tokio::sync::oneshot;

/// Handles a single compression request within a worker.
///
/// Performs exactly one call on `compressor` and sends the result back on
/// `response`. A closed `response` means the caller stopped waiting: before
/// the call the work is skipped, after it the result is discarded.
#[allow(clippy::used_underscore_binding)]
pub async fn handle_compress_request(
    _worker_id: usize,
    compressor: &dyn Compressor,
    bytes: Bytes,
    format: TargetFormat,
    response: oneshot::Sender<Result<Bytes>>,
) {
    if response.is_closed() {
        tracing::debug!("Worker {_worker_id} skipping request abandoned by its caller");
        return;
    }

    let result = compressor.compress(bytes, format).await;

    if response.send(result).is_err() {
        tracing::debug!("Worker {_worker_id} discarding result, caller went away");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Compressor for Counting {
        async fn compress(&self, bytes: Bytes, _format: TargetFormat) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(bytes)
        }
    }

    #[tokio::test]
    async fn replies_with_compressor_result() {
        let compressor = Counting::default();
        let (tx, rx) = oneshot::channel();

        handle_compress_request(0, &compressor, Bytes::from_static(b"img"), TargetFormat::Png, tx)
            .await;

        assert_eq!(rx.await.expect("no reply"), Ok(Bytes::from_static(b"img")));
        assert_eq!(compressor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skips_work_when_caller_is_gone() {
        let compressor = Counting::default();
        let (tx, rx) = oneshot::channel();
        drop(rx);

        handle_compress_request(0, &compressor, Bytes::from_static(b"img"), TargetFormat::Png, tx)
            .await;

        assert_eq!(compressor.calls.load(Ordering::SeqCst), 0);
    }
}
