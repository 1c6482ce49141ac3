//! PktMask: sanitize capture files by zeroing sensitive TCP payload bytes
//! while preserving everything a network-analysis tool depends on: frame
//! count and order, timestamps, headers, lengths, and valid checksums.
//!
//! The heavy lifting lives in the member crates (`capture`, `masking`,
//! `decoder`); this crate composes them into pipeline stages, fans the
//! pipeline out over batches of files, and renders the run report.

pub mod batch;
pub mod config;
pub mod pipeline;
pub mod report;

pub use crate::{
    batch::{discover_inputs, run_batch, FileResult},
    config::{BatchOptions, MaskOptions},
    pipeline::{MaskStage, Pipeline, ProgressEvent, ProgressSink, Stage, StageStats},
    report::RunReport,
};
