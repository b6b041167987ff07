use bytes::Bytes;
use imgpress_core::{Result, TargetFormat};
use tokio::sync::oneshot;

/// A message sent from the worker pool to an individual worker task.
///
/// [`WorkRequest`]s travel over bounded channels and are consumed by the
/// worker's main loop, one at a time.
#[derive(Debug)]
pub enum WorkRequest {
    /// Compress one image and reply on `response`.
    ///
    /// If `response` is already closed when the worker picks the request up,
    /// the caller has given up (timeout or disconnect) and the call is
    /// skipped.
    Compress {
        bytes: Bytes,
        format: TargetFormat,
        response: oneshot::Sender<Result<Bytes>>,
    },

    /// Request the worker to shut down gracefully.
    ///
    /// - `response`: One-shot channel for acknowledging that the worker has
    ///   completed its shutdown routine.
    Shutdown { response: oneshot::Sender<()> },
}
