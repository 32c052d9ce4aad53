//! Append-only log of finished generation runs.
//!
//! One JSON object per line, appended under an exclusive file lock so that
//! concurrent runs (threads or processes) never interleave records.

use crate::{CohortRequest, Gender, Result, RunError, RunResult, RunStage};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Summary of one finished run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub finished_at: DateTime<Utc>,
    pub pathology_ids: Vec<String>,
    pub count: u32,
    pub seed: Option<u64>,
    pub gender: Option<Gender>,
    #[serde(default)]
    pub overrides: BTreeMap<String, f64>,
    pub status: RunStatus,
    pub stage: Option<RunStage>,
    pub error: Option<String>,
    pub patient_count: Option<u64>,
    pub elapsed_ms: u64,
    pub restored_cleanly: bool,
}

impl RunRecord {
    pub fn succeeded(request: &CohortRequest, result: &RunResult) -> Self {
        Self {
            id: result.run_id,
            finished_at: Utc::now(),
            pathology_ids: request.pathology_ids.clone(),
            count: request.count,
            seed: request.seed,
            gender: result.gender,
            overrides: request.prevalence_overrides.clone(),
            status: RunStatus::Succeeded,
            stage: None,
            error: None,
            patient_count: Some(result.patient_count),
            elapsed_ms: millis(result.elapsed),
            restored_cleanly: true,
        }
    }

    pub fn failed(
        run_id: Uuid,
        request: &CohortRequest,
        gender: Option<Gender>,
        error: &RunError,
        elapsed: Duration,
    ) -> Self {
        Self {
            id: run_id,
            finished_at: Utc::now(),
            pathology_ids: request.pathology_ids.clone(),
            count: request.count,
            seed: request.seed,
            gender,
            overrides: request.prevalence_overrides.clone(),
            status: RunStatus::Failed,
            stage: Some(error.stage),
            error: Some(error.to_string()),
            patient_count: None,
            elapsed_ms: millis(elapsed),
            restored_cleanly: error.restored_cleanly(),
        }
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// JSONL run log with file locking
#[derive(Clone, Debug)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &RunRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(record)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        file.unlock()?;
        tracing::debug!("Appended run {} to run log", record.id);
        Ok(())
    }
}

/// Read every run recorded at `path`; unreadable lines are skipped
pub fn read_runs(path: &Path) -> Result<Vec<RunRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut runs = Vec::new();
    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<RunRecord>(&line) {
            Ok(run) => runs.push(run),
            Err(e) => {
                tracing::warn!("Failed to parse run at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} runs from run log", runs.len());
    Ok(runs)
}
