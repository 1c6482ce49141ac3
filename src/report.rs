//! The run report: per-file outcomes and totals.

use crate::{batch::FileResult, pipeline::StageStats};
use anyhow::Error;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Ok,
    Failed,
    Cancelled,
}

#[derive(Debug, Serialize)]
pub struct FileReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stages: Vec<StageStats>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started: String,
    pub files: Vec<FileReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunReport {
    pub fn from_results(results: Vec<FileResult>) -> Self {
        let started = chrono::Local::now().to_rfc3339();
        let mut files = Vec::with_capacity(results.len());
        let (mut succeeded, mut failed, mut cancelled) = (0, 0, 0);
        for result in results {
            let FileResult {
                input,
                output,
                outcome,
            } = result;
            let (status, error, stages) = match outcome {
                Ok(stages) => {
                    succeeded += 1;
                    (FileStatus::Ok, None, stages)
                }
                Err(err) if err.is::<masking::Cancelled>() => {
                    cancelled += 1;
                    (FileStatus::Cancelled, Some(format_chain(&err)), Vec::new())
                }
                Err(err) => {
                    failed += 1;
                    (FileStatus::Failed, Some(format_chain(&err)), Vec::new())
                }
            };
            files.push(FileReport {
                input,
                output,
                status,
                error,
                stages,
            });
        }
        Self {
            started,
            files,
            succeeded,
            failed,
            cancelled,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Human-readable per-file summary for the terminal.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for file in &self.files {
            match file.status {
                FileStatus::Ok => {
                    let frames: u64 = file.stages.iter().map(|s| s.frames_processed).sum();
                    let modified: u64 = file.stages.iter().map(|s| s.frames_modified).sum();
                    let masked: u64 = file.stages.iter().map(|s| s.bytes_masked).sum();
                    let collisions: u64 = file.stages.iter().map(|s| s.mapping_collisions).sum();
                    let mut line = format!(
                        "{}: {} frames in, {} frames out, {} modified, {} bytes masked",
                        file.input.display(),
                        frames,
                        frames,
                        modified,
                        masked
                    );
                    if collisions > 0 {
                        line.push_str(&format!(", {} mapping collisions", collisions));
                    }
                    lines.push(line);
                }
                FileStatus::Failed => lines.push(format!(
                    "{}: FAILED: {}",
                    file.input.display(),
                    file.error.as_deref().unwrap_or("unknown error")
                )),
                FileStatus::Cancelled => {
                    lines.push(format!("{}: cancelled", file.input.display()))
                }
            }
        }
        lines.push(format!(
            "{} succeeded, {} failed, {} cancelled",
            self.succeeded, self.failed, self.cancelled
        ));
        lines
    }
}

fn format_chain(err: &Error) -> String {
    let mut message = err.to_string();
    for cause in err.chain().skip(1) {
        message.push_str(": ");
        message.push_str(&cause.to_string());
    }
    message
}
