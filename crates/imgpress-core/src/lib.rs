#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

pub mod archive;
pub mod batch;
pub mod client;
pub mod naming;
pub mod pipeline;

pub use archive::ArchiveStreamer;
pub use batch::BatchOrchestrator;
pub use client::{Compressor, TinifyClient, TinifyConfig};
pub use pipeline::stream_batch;
