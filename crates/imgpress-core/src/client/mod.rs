//! Compression client abstraction.
//!
//! A [`Compressor`] performs exactly one outbound compression call per
//! invocation. It never retries: retry and timeout policy belong to the
//! caller (see [`crate::batch::BatchOrchestrator`]).
//!
//! ## Implementations
//!
//! - [`TinifyClient`] - the Tinify HTTP API.

mod tinify;

pub use tinify::{TinifyClient, TinifyConfig};

use crate::{Result, TargetFormat};
use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;

/// Timeout applied to a single compression call when nothing else is
/// configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// One call to an external image compression service.
#[async_trait]
pub trait Compressor: Send + Sync {
    /// Compresses `bytes`, converting to `format` unless it is
    /// [`TargetFormat::Original`].
    ///
    /// # Errors
    ///
    /// - [`crate::Error::InvalidInput`] if `bytes` is empty.
    /// - [`crate::Error::Configuration`] if the service credential is unusable.
    /// - [`crate::Error::ServiceUnavailable`], [`crate::Error::UnsupportedFormat`]
    ///   or [`crate::Error::Upstream`] for remote failures.
    async fn compress(&self, bytes: Bytes, format: TargetFormat) -> Result<Bytes>;

    /// Deadline callers should apply to a single [`Compressor::compress`] call.
    fn default_timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Cheap, local check that the client is configured well enough to try a
    /// call. Lets ingress adapters fail before committing a response.
    fn check_ready(&self) -> Result<()> {
        Ok(())
    }
}
