//! Error types for the compression pipeline.
//!
//! This module defines the central [`Error`] enum shared by every layer of the
//! system: the compression client, the batch orchestrator, the archive
//! streamer and the ingress adapters built on top of them. Errors are `Clone`
//! so a single failure can be both recorded in a batch report and logged.
//!
//! ## Error Classes
//!
//! - Input errors (`InvalidInput`): malformed or missing uploads, unknown
//!   target formats. Surfaced immediately and never retried.
//! - Per-item upstream errors (`ServiceUnavailable`, `UnsupportedFormat`,
//!   `Upstream`, `Timeout`): isolated to one item inside a batch.
//! - `Configuration`: the service credential is missing or unusable.
//! - `Transport`: the output stream could not be written. Fatal to the batch
//!   in progress.
//! - Internal plumbing (`ChannelError`, `ServiceShutdown`).

use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the compression pipeline.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The caller supplied malformed or missing input.
    #[error("{reason}")]
    InvalidInput { reason: String },

    /// The service credential is missing or invalid.
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// The remote service could not be reached or refused our credentials.
    #[error("Compression service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    /// The remote service rejected the requested target format.
    #[error("Unsupported format: {format}")]
    UnsupportedFormat { format: String },

    /// The remote service failed to process the image.
    #[error("Compression service error{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Upstream { status: Option<u16>, message: String },

    /// A single compression call exceeded its deadline.
    #[error("Compression timed out after {}s", after.as_secs_f32())]
    Timeout { after: Duration },

    /// The output transport was closed or failed mid-stream.
    #[error("Transport error: {context}")]
    Transport { context: String },

    /// Internal channel send/receive failure (e.g., closed worker queue).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn transport(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
        }
    }

    /// Returns `true` for errors that belong to one item of a batch rather
    /// than to the batch or the request as a whole.
    pub const fn is_item_scoped(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. }
                | Self::ServiceUnavailable { .. }
                | Self::UnsupportedFormat { .. }
                | Self::Upstream { .. }
                | Self::Timeout { .. }
        )
    }
}

impl From<async_zip::error::ZipError> for Error {
    fn from(err: async_zip::error::ZipError) -> Self {
        Self::Transport {
            context: err.to_string(),
        }
    }
}
