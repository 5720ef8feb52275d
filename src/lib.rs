//! mediagate library
//!
//! Media ingestion pipeline: content-sniffed validation, image
//! normalization, content-addressed deduplication and publishing to an
//! object store.

pub mod cli;
pub mod config;
pub mod logging;
pub mod media;
pub mod metrics;
