//! GHG Processor Library
//!
//! A Rust library for preparing eddy-covariance raw archives for an
//! external flux processor.
//!
//! This library provides tools for:
//! - Building a fixed-interval inventory of raw archives across source trees
//! - Parsing archive metadata and per-column raw data statistics
//! - Grouping intervals by instrument configuration fingerprint
//! - Flagging intervals with threshold rules on the raw statistics
//! - Partitioning each group into batches sized for the worker pool
//! - Writing per-group metadata descriptors, column maps and run files

pub mod archive;
pub mod batch;
pub mod cli;
pub mod config;
pub mod constants;
pub mod descriptor;
pub mod error;
pub mod filter;
pub mod grouping;
pub mod ini;
pub mod inventory;
pub mod models;
pub mod processor;
pub mod store;

// Re-export commonly used types
pub use config::ProcessingConfig;
pub use error::{GhgError, Result};
pub use models::{Batch, ConfigurationGroup, FileRecord, ProcessingStats, RecordStatus};
pub use processor::GhgProcessor;
