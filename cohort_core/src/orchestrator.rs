//! Generation orchestrator.
//!
//! A run proceeds through fixed stages:
//!
//! 1. **Validate** the request shape and check the engine can start
//! 2. **Resolve** pathologies and the gender filter (conflicts stop here)
//! 3. **Calibrate** prevalence overrides inside a [`CalibrationScope`],
//!    in ascending module order
//! 4. **Generate** by invoking the engine exactly once
//! 5. **Restore** every calibrated module, newest first, whatever step 4 did
//!
//! Nothing before stage 3 touches the file system or starts a process.

use crate::calibration::{CalibrationScope, CalibrationTarget, PrevalenceCalibrator};
use crate::engine::{
    CancelToken, EngineParams, GenerationEngine, ProgressHook, SubprocessEngine,
};
use crate::run_log::{RunLog, RunRecord};
use crate::{
    advisory_skews, gender, CohortRequest, Config, Error, Gender, PathologyRegistry,
    ResolvedFilter, Result, RunError, RunResult, RunStage,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Record files the engine writes next to patients that are not patients
const NON_PATIENT_PREFIXES: [&str; 2] = ["hospitalInformation", "practitionerInformation"];

pub struct GenerationOrchestrator<E: GenerationEngine> {
    registry: Arc<PathologyRegistry>,
    calibrator: PrevalenceCalibrator,
    engine: E,
    output_dir: PathBuf,
    clear_output: bool,
    run_log: Option<RunLog>,
    progress: Option<ProgressHook>,
}

impl GenerationOrchestrator<SubprocessEngine> {
    /// Wire up the subprocess engine, catalog, calibrator and run log from
    /// configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = match &config.generation.registry_path {
            Some(path) => PathologyRegistry::load_from(path)?,
            None => PathologyRegistry::builtin(),
        };
        let calibrator = PrevalenceCalibrator::new(
            config.modules_dir(),
            &config.paths.state_dir,
            config.calibration.lock_policy,
        );

        Ok(Self::new(
            Arc::new(registry),
            calibrator,
            SubprocessEngine::from_config(&config.engine),
            config.output_dir(),
        )
        .with_clear_output(config.generation.clear_output)
        .with_run_log(RunLog::new(config.run_log_path())))
    }
}

impl<E: GenerationEngine> GenerationOrchestrator<E> {
    pub fn new(
        registry: Arc<PathologyRegistry>,
        calibrator: PrevalenceCalibrator,
        engine: E,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            calibrator,
            engine,
            output_dir: output_dir.into(),
            clear_output: true,
            run_log: None,
            progress: None,
        }
    }

    pub fn with_clear_output(mut self, clear_output: bool) -> Self {
        self.clear_output = clear_output;
        self
    }

    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    /// Forward engine progress to `hook`
    pub fn with_progress(mut self, hook: ProgressHook) -> Self {
        self.progress = Some(hook);
        self
    }

    pub fn registry(&self) -> &PathologyRegistry {
        &self.registry
    }

    pub fn calibrator(&self) -> &PrevalenceCalibrator {
        &self.calibrator
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Resolve the gender filter for a selection without running anything
    pub fn resolve_filter<S: AsRef<str>>(&self, pathology_ids: &[S]) -> Result<ResolvedFilter> {
        let specs = self.registry.lookup(pathology_ids)?;
        Ok(gender::resolve(&specs))
    }

    /// Execute one generation run. Blocks until the engine finishes, fails,
    /// times out or `cancel` fires; every calibrated module is restored
    /// before this returns.
    pub fn run(
        &self,
        request: &CohortRequest,
        cancel: &CancelToken,
    ) -> std::result::Result<RunResult, RunError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut filter_gender = None;

        tracing::info!(
            "Run {}: {} patient(s) for {:?}",
            run_id,
            request.count,
            request.pathology_ids
        );
        let outcome = self.execute(run_id, request, cancel, started, &mut filter_gender);

        match &outcome {
            Ok(result) => {
                tracing::info!(
                    "Run {} succeeded: {} patient(s) in {:.1}s",
                    run_id,
                    result.patient_count,
                    result.elapsed.as_secs_f64()
                );
                self.record(RunRecord::succeeded(request, result));
            }
            Err(error) => {
                tracing::error!("Run {} failed: {}", run_id, error);
                self.record(RunRecord::failed(
                    run_id,
                    request,
                    filter_gender,
                    error,
                    started.elapsed(),
                ));
            }
        }
        outcome
    }

    fn execute(
        &self,
        run_id: Uuid,
        request: &CohortRequest,
        cancel: &CancelToken,
        started: Instant,
        filter_gender: &mut Option<Gender>,
    ) -> std::result::Result<RunResult, RunError> {
        request
            .validate()
            .map_err(|e| RunError::precheck(RunStage::Validate, e))?;
        let mut params = EngineParams {
            count: request.count,
            seed: request.seed,
            gender: None,
            modules_dir: self.calibrator.modules_dir().to_path_buf(),
            output_dir: self.output_dir.clone(),
            age_range: request.age_range,
            only_alive: request.only_alive,
            progress: self.progress.clone(),
        };
        self.engine
            .preflight(&params)
            .map_err(|e| RunError::precheck(RunStage::Validate, e))?;

        let specs = self
            .registry
            .lookup(&request.pathology_ids)
            .map_err(|e| RunError::precheck(RunStage::Resolve, e))?;
        let forced = match gender::resolve(&specs) {
            ResolvedFilter::Conflict(pairs) => {
                return Err(RunError::precheck(
                    RunStage::Resolve,
                    Error::Conflict { pairs },
                ))
            }
            ResolvedFilter::Forced(gender) => Some(gender),
            ResolvedFilter::None => None,
        };
        *filter_gender = forced;
        params.gender = forced;
        for (id, fraction) in advisory_skews(&specs) {
            tracing::info!(
                "{} typically affects {:.0}% female patients (advisory only)",
                id,
                fraction * 100.0
            );
        }

        let targets = self
            .plan_calibrations(request)
            .map_err(|e| RunError::precheck(RunStage::Calibrate, e))?;

        let mut scope = CalibrationScope::new();
        for target in &targets {
            match self.calibrator.apply_cancellable(target, cancel) {
                Ok(mutation) => scope.push(mutation),
                Err(cause) => {
                    return Err(RunError {
                        stage: RunStage::Calibrate,
                        cause,
                        restore_failures: scope.restore_all(),
                    })
                }
            }
        }

        let generated = self.generate(&params, cancel);
        let restore_failures = scope.restore_all();

        let reported_records = match generated {
            Ok(reported) => reported,
            Err(cause) => {
                return Err(RunError {
                    stage: RunStage::Generate,
                    cause,
                    restore_failures,
                })
            }
        };

        let mut restore_failures = restore_failures.into_iter();
        if let Some(cause) = restore_failures.next() {
            return Err(RunError {
                stage: RunStage::Restore,
                cause,
                restore_failures: restore_failures.collect(),
            });
        }

        let patient_count = match count_patient_records(&self.output_dir) {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(
                    "Unable to count records in {:?}: {}",
                    self.output_dir,
                    e
                );
                reported_records.unwrap_or(0)
            }
        };

        Ok(RunResult {
            run_id,
            output_location: self.output_dir.clone(),
            patient_count,
            gender: forced,
            elapsed: started.elapsed(),
        })
    }

    /// Calibration targets in global lock order
    fn plan_calibrations(&self, request: &CohortRequest) -> Result<Vec<CalibrationTarget>> {
        let mut planned: Vec<(&str, CalibrationTarget)> = Vec::new();
        for (id, &prevalence) in &request.prevalence_overrides {
            let spec = self
                .registry
                .get(id)
                .ok_or_else(|| Error::UnknownPathology { id: id.clone() })?;
            if !spec.adjustable {
                return Err(Error::NonAdjustable { id: id.clone() });
            }
            planned.push((id.as_str(), CalibrationTarget::for_pathology(spec, prevalence)));
        }

        planned.sort_by(|a, b| a.1.module.cmp(&b.1.module));
        if let Some(pair) = planned.windows(2).find(|w| w[0].1.module == w[1].1.module) {
            return Err(Error::InvalidRequest(format!(
                "'{}' and '{}' both override module '{}'",
                pair[0].0, pair[1].0, pair[0].1.module
            )));
        }

        Ok(planned.into_iter().map(|(_, target)| target).collect())
    }

    /// Prepare the output directory and run the engine once
    fn generate(&self, params: &EngineParams, cancel: &CancelToken) -> Result<Option<u64>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if self.clear_output {
            let removed = clear_records(&self.output_dir)?;
            if removed > 0 {
                tracing::info!("Removed {} previous record(s) from {:?}", removed, self.output_dir);
            }
        }
        fs::create_dir_all(&self.output_dir)?;

        let outcome = self.engine.generate(params, cancel)?;
        tracing::debug!(
            "Engine {} exited with {:?}",
            self.engine.name(),
            outcome.exit_code
        );
        Ok(outcome.reported_records)
    }

    fn record(&self, record: RunRecord) {
        if let Some(log) = &self.run_log {
            if let Err(e) = log.append(&record) {
                tracing::warn!("Failed to append run {} to {:?}: {}", record.id, log.path(), e);
            }
        }
    }
}

fn is_patient_record(path: &Path) -> bool {
    let is_json = path.extension().map_or(false, |ext| ext == "json");
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    is_json && !NON_PATIENT_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn count_patient_records(dir: &Path) -> std::io::Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_patient_record(&path) {
            count += 1;
        }
    }
    Ok(count)
}

/// Remove every `*.json` record left in `dir` by a previous run
fn clear_records(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

impl<E: GenerationEngine> std::fmt::Debug for GenerationOrchestrator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationOrchestrator")
            .field("engine", &self.engine.name())
            .field("pathologies", &self.registry.len())
            .field("output_dir", &self.output_dir)
            .field("clear_output", &self.clear_output)
            .finish()
    }
}
