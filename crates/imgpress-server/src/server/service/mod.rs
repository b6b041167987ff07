//! HTTP service implementation.
//!
//! This module turns multipart uploads into work for the shared
//! [`BatchOrchestrator`](imgpress_core::BatchOrchestrator) and maps every
//! failure onto a JSON error body.
//!
//! ## Structure
//!
//! - [`handler`] - axum router and endpoint handlers (`CompressService`).
//! - [`multipart`] - bounded upload reading.
//! - [`error`] - HTTP error responses.

pub mod error;
pub mod handler;
pub mod multipart;
