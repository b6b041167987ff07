use crate::server::streaming::{processor::handle_compress_request, request::WorkRequest};
use imgpress_core::{Compressor, Error};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Worker task responsible for processing [`WorkRequest`] messages.
///
/// The worker listens on its channel and executes one request at a time until
/// it receives [`WorkRequest::Shutdown`]. Requests still queued after
/// `shutdown_token` is cancelled are answered with
/// [`Error::ServiceShutdown`] without calling the compressor.
///
/// # Request Types
///
/// - [`WorkRequest::Compress`]: one call to the compressor via
///   [`handle_compress_request`].
/// - [`WorkRequest::Shutdown`]: acknowledge and stop.
pub async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<WorkRequest>,
    compressor: Arc<dyn Compressor>,
    shutdown_token: CancellationToken,
) {
    tracing::trace!("Worker {worker_id} started");

    while let Some(work) = rx.recv().await {
        match work {
            WorkRequest::Compress { response, .. } if shutdown_token.is_cancelled() => {
                let _ = response.send(Err(Error::ServiceShutdown));
            }
            WorkRequest::Compress {
                bytes,
                format,
                response,
            } => {
                handle_compress_request(worker_id, compressor.as_ref(), bytes, format, response)
                    .await;
            }
            WorkRequest::Shutdown { response } => {
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}
