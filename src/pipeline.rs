//! Pipeline stages and their runner.
//!
//! Every stage exposes the same operation: read a capture, write a capture,
//! report stats. The runner threads the output of stage N into stage N+1
//! through a temporary directory that disappears on every exit path.

use crate::config::MaskOptions;
use anyhow::{ensure, Context as _, Error};
use capture::Dissector;
use decoder::{mapping, Decoder};
use log::{debug, info};
use masking::{ApplyConfig, RecordTypeCounts};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::{Duration, Instant},
};
use tempfile::TempDir;

/// Emit a frame-progress event every this many frames.
const PROGRESS_INTERVAL: u64 = 4096;

#[derive(Clone, Debug, Default, Serialize)]
pub struct StageStats {
    pub frames_processed: u64,
    pub frames_modified: u64,
    pub duration: Duration,
    pub bytes_masked: u64,
    pub frame_errors: u64,
    pub checksum_errors: u64,
    pub mapping_collisions: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<RecordTypeCounts>,
}

/// Progress events, delivered synchronously. Consumers must not block.
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    StageStart {
        stage: &'a str,
    },
    FrameProgress {
        processed: u64,
        total: Option<u64>,
    },
    StageEnd {
        stats: &'a StageStats,
    },
    Error {
        recoverable: bool,
        message: String,
    },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, file: &Path, event: ProgressEvent);
}

/// Sink that discards all events.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_event(&self, _file: &Path, _event: ProgressEvent) {}
}

/// Sink that forwards events to the log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_event(&self, file: &Path, event: ProgressEvent) {
        match event {
            ProgressEvent::StageStart { stage } => {
                info!("{}: {} starting", file.display(), stage)
            }
            ProgressEvent::FrameProgress { processed, .. } => {
                debug!("{}: {} frames", file.display(), processed)
            }
            ProgressEvent::StageEnd { stats } => info!(
                "{}: {} frames, {} modified, {} bytes masked",
                file.display(),
                stats.frames_processed,
                stats.frames_modified,
                stats.bytes_masked
            ),
            ProgressEvent::Error { message, .. } => {
                info!("{}: {}", file.display(), message)
            }
        }
    }
}

/// A processing stage over capture files.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Process `input` into `output`. On error the stage must not leave a
    /// partially written `output` behind.
    fn process(
        &self,
        input: &Path,
        output: &Path,
        progress: &dyn ProgressSink,
        cancel: &AtomicBool,
    ) -> Result<StageStats, Error>;
}

/// An ordered stage composition over one file.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Run all stages in order. Intermediate files live in a temporary
    /// directory removed when this returns, success or not.
    pub fn run(
        &self,
        input: &Path,
        output: &Path,
        progress: &dyn ProgressSink,
        cancel: &AtomicBool,
    ) -> Result<Vec<StageStats>, Error> {
        ensure!(!self.stages.is_empty(), "pipeline has no stages");
        let workdir = TempDir::new().context("creating the pipeline work directory")?;
        let mut all_stats = Vec::with_capacity(self.stages.len());
        let mut current = input.to_path_buf();
        for (position, stage) in self.stages.iter().enumerate() {
            let stage_output = if position + 1 == self.stages.len() {
                output.to_path_buf()
            } else {
                workdir
                    .path()
                    .join(format!("stage-{}-{}.tmp", position, stage.name()))
            };
            let stats = stage
                .process(&current, &stage_output, progress, cancel)
                .with_context(|| format!("stage {} failed on {}", stage.name(), input.display()))?;
            all_stats.push(stats);
            current = stage_output;
        }
        Ok(all_stats)
    }
}

/// The payload-masking stage: reassemble (external decoder), analyze, apply.
pub struct MaskStage {
    options: MaskOptions,
    dissector: Dissector,
}

impl MaskStage {
    pub fn new(options: MaskOptions) -> Self {
        let dissector = Dissector::new(&options.extra_vxlan_ports);
        Self { options, dissector }
    }

    fn run(
        &self,
        input: &Path,
        output: &Path,
        progress: &dyn ProgressSink,
        cancel: &AtomicBool,
        started: Instant,
    ) -> Result<StageStats, Error> {
        // Reassembly preprocessing. The intermediate capture lives in its
        // own temp dir, deleted when analysis is done unless kept.
        let mut mapping_collisions = 0;
        let mut intermediate: Option<TempDir> = None;
        let analysis_input = if self.options.reassemble {
            let tool = Decoder::new(&self.options.decoder_program)
                .timeout(self.options.decoder_timeout)
                .tls_ports(&self.options.extra_tls_ports);
            let version = tool.probe()?;
            debug!("decoder: {}", version);

            let workdir = TempDir::new().context("creating the intermediate directory")?;
            let reassembled = workdir.path().join("reassembled.pcapng");
            tool.reassemble(input, &reassembled)?;

            let map = mapping::frame_map(input, &reassembled, &self.dissector)?;
            mapping_collisions = map.collisions;
            debug!(
                "{}: {} reassembled frames map back to the original, {} unmatched",
                input.display(),
                map.len(),
                map.unmatched
            );

            if self.options.keep_intermediate {
                let kept = workdir.into_path();
                info!("keeping intermediate capture in {}", kept.display());
            } else {
                intermediate = Some(workdir);
            }
            reassembled
        } else {
            input.to_path_buf()
        };

        let (rules, mark_stats) = masking::analyze(&analysis_input, &self.dissector)?;
        debug!(
            "{}: {} records across {} flow directions, {} keep rules",
            input.display(),
            mark_stats.records.total(),
            mark_stats.flows,
            mark_stats.rules
        );
        // The reassembled capture is only needed for analysis.
        drop(intermediate);

        let apply_config = ApplyConfig {
            policy: self.options.policy,
            dissector: self.dissector.clone(),
        };
        let apply_stats = masking::apply(
            input,
            output,
            &rules,
            &apply_config,
            cancel,
            &mut |processed| {
                if processed % PROGRESS_INTERVAL == 0 {
                    progress.on_event(
                        input,
                        ProgressEvent::FrameProgress {
                            processed,
                            total: None,
                        },
                    );
                }
            },
        )?;

        Ok(StageStats {
            frames_processed: apply_stats.frames_in,
            frames_modified: apply_stats.frames_modified,
            duration: started.elapsed(),
            bytes_masked: apply_stats.bytes_masked,
            frame_errors: mark_stats.frame_errors + apply_stats.frame_errors,
            checksum_errors: apply_stats.checksum_errors,
            mapping_collisions,
            records: Some(mark_stats.records),
        })
    }
}

impl Stage for MaskStage {
    fn name(&self) -> &str {
        "mask"
    }

    fn process(
        &self,
        input: &Path,
        output: &Path,
        progress: &dyn ProgressSink,
        cancel: &AtomicBool,
    ) -> Result<StageStats, Error> {
        progress.on_event(input, ProgressEvent::StageStart { stage: self.name() });
        let started = Instant::now();
        match self.run(input, output, progress, cancel, started) {
            Ok(stats) => {
                progress.on_event(input, ProgressEvent::StageEnd { stats: &stats });
                Ok(stats)
            }
            Err(err) => {
                // Never leave a half-written capture behind.
                let _ = std::fs::remove_file(output);
                progress.on_event(
                    input,
                    ProgressEvent::Error {
                        recoverable: false,
                        message: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }
}
