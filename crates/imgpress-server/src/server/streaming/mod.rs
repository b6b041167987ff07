//! Work dispatch and response streaming.
//!
//! - [`request`] - messages exchanged between the pool and its workers.
//! - [`processor`] - executes one compression request inside a worker.
//! - [`coordinator`] - runs a batch pipeline behind a streamed HTTP body.

pub mod coordinator;
pub mod processor;
pub mod request;
