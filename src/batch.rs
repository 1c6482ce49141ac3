//! Batch processing: fan the pipeline out over many capture files.
//!
//! Files are independent; workers share only the read-only pipeline, the
//! progress sink, and the cancellation flag. Results come back in input
//! discovery order regardless of which worker finished first.

use crate::{config::BatchOptions, pipeline::{Pipeline, ProgressSink, StageStats}};
use anyhow::{bail, Context as _, Error};
use log::warn;
use masking::Cancelled;
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

const CAPTURE_EXTENSIONS: &[&str] = &["pcap", "pcapng", "cap"];

pub struct FileResult {
    pub input: PathBuf,
    pub output: PathBuf,
    pub outcome: Result<Vec<StageStats>, Error>,
}

impl FileResult {
    pub fn is_cancelled(&self) -> bool {
        match &self.outcome {
            Err(err) => err.is::<Cancelled>(),
            Ok(_) => false,
        }
    }
}

/// Expand the command-line inputs into concrete capture files, in input
/// order; directories contribute their capture files sorted by name.
pub fn discover_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>, Error> {
    let mut inputs = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = fs::read_dir(path)
                .with_context(|| format!("listing {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .map(|e| CAPTURE_EXTENSIONS.contains(&e))
                        .unwrap_or(false)
                })
                .collect();
            entries.sort();
            if entries.is_empty() {
                warn!("{} contains no capture files", path.display());
            }
            inputs.extend(entries);
        } else if path.is_file() {
            inputs.push(path.clone());
        } else {
            bail!("input {} does not exist", path.display());
        }
    }
    Ok(inputs)
}

/// Process every input through the pipeline, in parallel across files.
///
/// A failing file does not stop the others unless `stop_on_error` is set,
/// in which case the cancel flag is raised and remaining files come back as
/// cancelled.
pub fn run_batch(
    pipeline: &Pipeline,
    inputs: &[PathBuf],
    output_dir: &Path,
    options: &BatchOptions,
    progress: &dyn ProgressSink,
    cancel: &AtomicBool,
) -> Result<Vec<FileResult>, Error> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.unwrap_or(0))
        .build()
        .context("building the worker pool")?;

    let results = pool.install(|| {
        inputs
            .par_iter()
            .map(|input| {
                let name = input.file_name().unwrap_or_default();
                let output = output_dir.join(name);
                if cancel.load(Ordering::Relaxed) {
                    return FileResult {
                        input: input.clone(),
                        output,
                        outcome: Err(Error::new(Cancelled)),
                    };
                }
                let outcome = pipeline.run(input, &output, progress, cancel);
                if outcome.is_err() && options.stop_on_error {
                    cancel.store(true, Ordering::Relaxed);
                }
                FileResult {
                    input: input.clone(),
                    output,
                    outcome,
                }
            })
            .collect()
    });
    Ok(results)
}
