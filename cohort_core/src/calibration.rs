//! Prevalence calibration of engine modules.
//!
//! Calibrating a module is an exclusive, scoped mutation:
//! 1. Take the module's advisory lock (a file lock, so it serializes threads
//!    and processes alike)
//! 2. Snapshot the current bytes and persist them to the recovery journal
//! 3. Write the rebalanced module atomically (temp file + rename)
//! 4. Restore the snapshot when the [`ModuleMutation`] is restored or dropped
//!
//! The journal lets a later process put a module back when its calibrating
//! process died before restoring (see [`PrevalenceCalibrator::recover_orphans`]).

use crate::engine::CancelToken;
use crate::module_graph::{DecisionPoint, ModuleGraph, Partition};
use crate::{Error, ModuleRef, PathologySpec, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;

/// How often a blocked calibration re-checks the module lock and its cancel token
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

// ============================================================================
// Weight computation
// ============================================================================

/// Desired prevalence for one module
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationTarget {
    pub module: ModuleRef,
    /// Decision list to rebalance; located automatically when `None`
    pub decision: Option<DecisionPoint>,
    pub prevalence: f64,
}

impl CalibrationTarget {
    pub fn new(module: impl Into<ModuleRef>, prevalence: f64) -> Self {
        Self {
            module: module.into(),
            decision: None,
            prevalence,
        }
    }

    pub fn at(mut self, point: DecisionPoint) -> Self {
        self.decision = Some(point);
        self
    }

    pub fn for_pathology(spec: &PathologySpec, prevalence: f64) -> Self {
        Self {
            module: spec.module.clone(),
            decision: spec.decision_state.clone().map(DecisionPoint::state),
            prevalence,
        }
    }
}

/// New probability assignment for one decision list
#[derive(Clone, Debug)]
pub struct AdjustedWeights {
    pub point: DecisionPoint,
    pub partition: Partition,
    pub previous: Vec<f64>,
    pub weights: Vec<f64>,
}

impl AdjustedWeights {
    pub fn condition_total(&self) -> f64 {
        self.partition.condition.iter().map(|&i| self.weights[i]).sum()
    }

    pub fn healthy_total(&self) -> f64 {
        self.partition.healthy.iter().map(|&i| self.weights[i]).sum()
    }

    pub fn previous_condition_total(&self) -> f64 {
        self.partition.condition.iter().map(|&i| self.previous[i]).sum()
    }
}

/// Rebalance a decision list so the condition group totals `p` and the
/// healthy group totals `1 - p`
///
/// Within a group, edges keep their relative weights. A group whose
/// current total is zero receives its target spread evenly.
pub fn compute_adjusted_weights(
    graph: &ModuleGraph,
    target: &CalibrationTarget,
) -> Result<AdjustedWeights> {
    let p = target.prevalence;
    if !p.is_finite() || !(0.0..=1.0).contains(&p) {
        return Err(Error::InvalidRequest(format!(
            "prevalence for module '{}' must be within [0, 1], got {}",
            target.module, p
        )));
    }

    let point = match &target.decision {
        Some(point) => point.clone(),
        None => graph.locate_decision_state()?,
    };
    let partition = graph.classify(&point)?;
    let previous: Vec<f64> = graph
        .decision_list(&point)?
        .edges
        .iter()
        .map(|e| e.probability.unwrap_or(0.0))
        .collect();

    let mut weights = previous.clone();
    rescale_group(&mut weights, &previous, &partition.condition, p);
    rescale_group(&mut weights, &previous, &partition.healthy, 1.0 - p);

    Ok(AdjustedWeights {
        point,
        partition,
        previous,
        weights,
    })
}

fn rescale_group(weights: &mut [f64], previous: &[f64], group: &[usize], target_total: f64) {
    let old_total: f64 = group.iter().map(|&i| previous[i]).sum();
    if old_total > 0.0 {
        let factor = target_total / old_total;
        for &i in group {
            weights[i] = previous[i] * factor;
        }
    } else {
        let even = target_total / group.len() as f64;
        for &i in group {
            weights[i] = even;
        }
    }
}

// ============================================================================
// Scoped mutation
// ============================================================================

/// What happens when a module is already being calibrated
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Wait until the current holder restores the module
    #[default]
    Block,
    /// Fail immediately with `Error::Busy`
    FailFast,
}

/// Recovery journal record, one per live mutation
#[derive(Serialize, Deserialize)]
struct JournalEntry {
    module: ModuleRef,
    path: PathBuf,
    created_at: DateTime<Utc>,
    pid: u32,
    /// Verbatim pre-calibration content
    original: String,
    /// Content written by the calibration; recovery only fires while the file still holds it
    calibrated: String,
}

/// Handle to a live calibration of one module
///
/// Holds the module lock until restored. Restoring is idempotent, and an
/// unrestored handle restores itself when dropped.
pub struct ModuleMutation {
    module: ModuleRef,
    path: PathBuf,
    snapshot: String,
    created_at: DateTime<Utc>,
    applied: AdjustedWeights,
    journal_path: PathBuf,
    lock: Option<File>,
    consumed: bool,
    abandoned: bool,
}

impl ModuleMutation {
    pub fn module(&self) -> &ModuleRef {
        &self.module
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Module content exactly as it was before calibration
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn applied(&self) -> &AdjustedWeights {
        &self.applied
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Write the snapshot back and release the module
    ///
    /// A consumed handle performs no write and returns `Ok(())`.
    pub fn restore(&mut self) -> Result<()> {
        if self.consumed {
            tracing::debug!("Module {} already restored", self.module);
            return Ok(());
        }

        write_atomic(&self.path, self.snapshot.as_bytes())
            .map_err(|e| Error::calibration_io(self.module.as_str(), e))?;
        self.consumed = true;

        discard_journal_entry(&self.journal_path);
        self.release_lock();

        tracing::info!("Restored module {} ({:?})", self.module, self.path);
        Ok(())
    }

    /// Give up on restoring in-process. The journal entry stays behind so the
    /// next calibrator (or `recover_orphans`) can put the module back.
    pub(crate) fn abandon(&mut self) {
        self.abandoned = true;
        self.release_lock();
    }

    fn release_lock(&mut self) {
        if let Some(file) = self.lock.take() {
            if let Err(e) = file.unlock() {
                tracing::warn!("Failed to unlock module {}: {}", self.module, e);
            }
        }
    }
}

impl Drop for ModuleMutation {
    fn drop(&mut self) {
        if !self.consumed && !self.abandoned {
            tracing::warn!(
                "Calibration of module {} dropped while live, restoring",
                self.module
            );
            if let Err(e) = self.restore() {
                tracing::error!(
                    "Failed to restore module {}: {}. Recovery journal kept at {:?}",
                    self.module,
                    e,
                    self.journal_path
                );
            }
        }
        self.release_lock();
    }
}

/// Guard over every mutation of one run
///
/// Restores in reverse acquisition order, either explicitly through
/// [`CalibrationScope::restore_all`] or when dropped (including unwinding).
#[derive(Default)]
pub struct CalibrationScope {
    mutations: Vec<ModuleMutation>,
}

impl CalibrationScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: ModuleMutation) {
        self.mutations.push(mutation);
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn mutations(&self) -> &[ModuleMutation] {
        &self.mutations
    }

    /// Restore everything, newest first. Returns every restore failure.
    pub fn restore_all(&mut self) -> Vec<Error> {
        let mut failures = Vec::new();
        while let Some(mut mutation) = self.mutations.pop() {
            if let Err(e) = mutation.restore() {
                tracing::error!("Failed to restore module {}: {}", mutation.module, e);
                mutation.abandon();
                failures.push(e);
            }
        }
        failures
    }
}

impl Drop for CalibrationScope {
    fn drop(&mut self) {
        if !self.mutations.is_empty() {
            for failure in self.restore_all() {
                tracing::error!("Restoration during scope exit failed: {}", failure);
            }
        }
    }
}

// ============================================================================
// Calibrator
// ============================================================================

/// Applies and restores prevalence calibrations under a modules directory
#[derive(Clone, Debug)]
pub struct PrevalenceCalibrator {
    modules_dir: PathBuf,
    lock_dir: PathBuf,
    journal_dir: PathBuf,
    policy: LockPolicy,
}

impl PrevalenceCalibrator {
    /// Locks and journal entries live under `state_dir`
    pub fn new(modules_dir: impl Into<PathBuf>, state_dir: &Path, policy: LockPolicy) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            lock_dir: state_dir.join("locks"),
            journal_dir: state_dir.join("journal"),
            policy,
        }
    }

    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Resolve a module reference to its file, searching one level of
    /// sub-directories for bare names
    pub fn module_path(&self, module: &ModuleRef) -> Result<PathBuf> {
        let file_name = format!("{}.json", module.as_str());
        let direct = self.modules_dir.join(&file_name);
        if direct.is_file() {
            return Ok(direct);
        }

        if !module.as_str().contains('/') {
            if let Ok(entries) = fs::read_dir(&self.modules_dir) {
                let mut dirs: Vec<PathBuf> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect();
                dirs.sort();
                if let Some(found) = dirs
                    .into_iter()
                    .map(|d| d.join(&file_name))
                    .find(|candidate| candidate.is_file())
                {
                    return Ok(found);
                }
            }
        }

        Err(Error::calibration_io(
            module.as_str(),
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no module file under {:?}", self.modules_dir),
            ),
        ))
    }

    /// Take exclusive rights on the module, snapshot it, and write the
    /// recalibrated content
    pub fn apply_and_backup(&self, target: &CalibrationTarget) -> Result<ModuleMutation> {
        self.apply_cancellable(target, &CancelToken::new())
    }

    /// [`apply_and_backup`](Self::apply_and_backup) that gives up with
    /// `Error::Cancelled` while waiting on a busy module under `LockPolicy::Block`
    pub fn apply_cancellable(
        &self,
        target: &CalibrationTarget,
        cancel: &CancelToken,
    ) -> Result<ModuleMutation> {
        let module = &target.module;
        // Every early return below drops `lock`, which releases the module
        let lock = self.acquire(module, cancel)?;

        let path = self.module_path(module)?;
        let journal_path = self.journal_path(module);
        self.recover_entry(&journal_path)?;

        let bytes = fs::read(&path).map_err(|e| Error::calibration_io(module.as_str(), e))?;
        let snapshot = String::from_utf8(bytes)
            .map_err(|_| Error::malformed(module.as_str(), "module file is not valid UTF-8"))?;

        let mut graph = ModuleGraph::parse_labeled(module.as_str(), &snapshot)?;
        let applied = compute_adjusted_weights(&graph, target)?;
        graph.set_probabilities(&applied.point, &applied.weights)?;
        let calibrated = graph.serialize()?;

        let created_at = Utc::now();
        let entry = JournalEntry {
            module: module.clone(),
            path: path.clone(),
            created_at,
            pid: std::process::id(),
            original: snapshot.clone(),
            calibrated: calibrated.clone(),
        };
        fs::create_dir_all(&self.journal_dir)
            .map_err(|e| Error::calibration_io(module.as_str(), e))?;
        write_atomic(&journal_path, serde_json::to_string(&entry)?.as_bytes())
            .map_err(|e| Error::calibration_io(module.as_str(), e))?;

        if let Err(e) = write_atomic(&path, calibrated.as_bytes()) {
            // The rename never happened, so the module still holds the snapshot
            discard_journal_entry(&journal_path);
            return Err(Error::calibration_io(module.as_str(), e));
        }

        tracing::info!(
            "Calibrated module {} at {}: condition total {:.6} -> {:.6}",
            module,
            applied.point,
            applied.previous_condition_total(),
            applied.condition_total()
        );

        Ok(ModuleMutation {
            module: module.clone(),
            path,
            snapshot,
            created_at,
            applied,
            journal_path,
            lock: Some(lock),
            consumed: false,
            abandoned: false,
        })
    }

    /// Write the mutation's snapshot back; a no-op for consumed handles
    pub fn restore(&self, mutation: &mut ModuleMutation) -> Result<()> {
        mutation.restore()
    }

    /// Restore modules left calibrated by processes that died mid-run
    ///
    /// Entries whose lock is still held belong to a live run and are skipped.
    pub fn recover_orphans(&self) -> Result<Vec<ModuleRef>> {
        if !self.journal_dir.exists() {
            return Ok(Vec::new());
        }

        let mut journal_files: Vec<PathBuf> = fs::read_dir(&self.journal_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .collect();
        journal_files.sort();

        let mut recovered = Vec::new();
        for journal_path in journal_files {
            let Some(stem) = journal_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let lock = self.open_lock_file(&self.lock_dir.join(format!("{}.lock", stem)))?;
            if let Err(e) = lock.try_lock_exclusive() {
                if e.kind() == fs2::lock_contended_error().kind() {
                    tracing::debug!("Journal entry {:?} belongs to a live run", journal_path);
                } else {
                    tracing::warn!("Unable to lock for {:?}: {}", journal_path, e);
                }
                continue;
            }

            if let Some(module) = self.recover_entry(&journal_path)? {
                recovered.push(module);
            }
            lock.unlock()?;
        }

        if !recovered.is_empty() {
            tracing::warn!("Recovered {} orphaned calibration(s)", recovered.len());
        }
        Ok(recovered)
    }

    fn acquire(&self, module: &ModuleRef, cancel: &CancelToken) -> Result<File> {
        let lock = self
            .open_lock_file(&self.lock_path(module))
            .map_err(|e| match e {
                Error::Io(io) => Error::calibration_io(module.as_str(), io),
                other => other,
            })?;

        let mut waiting = false;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match lock.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => match self.policy {
                    LockPolicy::FailFast => {
                        return Err(Error::Busy {
                            module: module.to_string(),
                        })
                    }
                    LockPolicy::Block => {
                        if !waiting {
                            tracing::info!(
                                "Module {} is being calibrated elsewhere, waiting",
                                module
                            );
                            waiting = true;
                        }
                        thread::sleep(LOCK_POLL_INTERVAL);
                    }
                },
                Err(e) => return Err(Error::calibration_io(module.as_str(), e)),
            }
        }

        tracing::debug!("Acquired calibration lock for module {}", module);
        Ok(lock)
    }

    fn open_lock_file(&self, path: &Path) -> Result<File> {
        fs::create_dir_all(&self.lock_dir)?;
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?)
    }

    /// Put back a module described by a leftover journal entry.
    /// Caller must hold the module lock.
    fn recover_entry(&self, journal_path: &Path) -> Result<Option<ModuleRef>> {
        let text = match fs::read_to_string(journal_path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: JournalEntry = match serde_json::from_str(&text) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(
                    "Discarding unreadable journal entry {:?}: {}",
                    journal_path,
                    e
                );
                fs::remove_file(journal_path)?;
                return Ok(None);
            }
        };

        let current = fs::read(&entry.path).ok();
        let recovered = if current.as_deref() == Some(entry.calibrated.as_bytes()) {
            write_atomic(&entry.path, entry.original.as_bytes())
                .map_err(|e| Error::calibration_io(entry.module.as_str(), e))?;
            tracing::warn!(
                "Restored module {} left calibrated by process {} since {}",
                entry.module,
                entry.pid,
                entry.created_at
            );
            Some(entry.module)
        } else {
            tracing::warn!(
                "Discarding stale journal entry for module {}; file no longer holds the calibrated content",
                entry.module
            );
            None
        };

        fs::remove_file(journal_path)?;
        Ok(recovered)
    }

    fn lock_path(&self, module: &ModuleRef) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", module.file_stem()))
    }

    fn journal_path(&self, module: &ModuleRef) -> PathBuf {
        self.journal_dir.join(format!("{}.json", module.file_stem()))
    }
}

/// Remove a journal entry, logging anything but an already-missing file.
/// Returns whether the entry is gone.
fn discard_journal_entry(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!("Failed to remove journal entry {:?}: {}", path, e);
            false
        }
    }
}

/// Replace `path` atomically, keeping its permissions
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "path missing parent"))?;
    let permissions = fs::metadata(path).ok().map(|m| m.permissions());

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    if let Some(permissions) = permissions {
        temp.as_file().set_permissions(permissions)?;
    }

    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::module_graph::PROBABILITY_TOLERANCE;
    use proptest::prelude::*;

    /// Build a module whose gate has the given raw condition and healthy weights
    fn module_text(condition: &[f64], healthy: &[f64]) -> String {
        let total: f64 = condition.iter().chain(healthy).sum();
        let mut branches = Vec::new();
        for w in condition {
            branches.push(format!(
                r#"{{ "distribution": {}, "transition": "Onset" }}"#,
                w / total
            ));
        }
        for w in healthy {
            branches.push(format!(
                r#"{{ "distribution": {}, "transition": "Terminal" }}"#,
                w / total
            ));
        }
        format!(
            r#"{{ "name": "Generated", "states": {{
                "Initial": {{ "type": "Initial", "direct_transition": "Gate" }},
                "Gate": {{ "type": "Simple", "distributed_transition": [{}] }},
                "Onset": {{ "type": "ConditionOnset", "direct_transition": "Terminal" }},
                "Terminal": {{ "type": "Terminal" }} }} }}"#,
            branches.join(", ")
        )
    }

    proptest! {
        #[test]
        fn adjusted_groups_hit_targets(
            condition in prop::collection::vec(0.001f64..1.0, 1..4),
            healthy in prop::collection::vec(0.001f64..1.0, 1..4),
            p in 0.0f64..=1.0,
        ) {
            let graph = ModuleGraph::parse(&module_text(&condition, &healthy)).unwrap();
            let adjusted = compute_adjusted_weights(&graph, &CalibrationTarget::new("generated", p)).unwrap();

            prop_assert!((adjusted.condition_total() - p).abs() < PROBABILITY_TOLERANCE);
            prop_assert!((adjusted.healthy_total() - (1.0 - p)).abs() < PROBABILITY_TOLERANCE);
            let sum: f64 = adjusted.weights.iter().sum();
            prop_assert!((sum - 1.0).abs() < PROBABILITY_TOLERANCE);

            // The rewritten module still satisfies the graph invariants
            let mut rewritten = graph.clone();
            rewritten.set_probabilities(&adjusted.point, &adjusted.weights).unwrap();
            prop_assert!(ModuleGraph::parse(&rewritten.serialize().unwrap()).is_ok());
        }
    }
}
