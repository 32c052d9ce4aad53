//! Error types for the cohort_core library.

use std::fmt;
use std::io;
use std::time::Duration;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cohort_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pathology catalog validation error
    #[error("Catalog validation error: {0}")]
    CatalogValidation(String),

    /// Cohort request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A requested pathology id is not in the registry
    #[error("Unknown pathology '{id}'")]
    UnknownPathology { id: String },

    /// Selected pathologies force both genders
    #[error("Conflicting gender constraints: {}", describe_pairs(.pairs))]
    Conflict { pairs: Vec<(String, String)> },

    /// A prevalence override targets a pathology that cannot be recalibrated
    #[error("Pathology '{id}' does not support prevalence adjustment")]
    NonAdjustable { id: String },

    /// Module content violates the state graph invariants
    #[error("Malformed module '{module}': {reason}")]
    MalformedModule { module: String, reason: String },

    /// Module file could not be read or written during calibration
    #[error("Calibration IO error on module '{module}': {source}")]
    CalibrationIo {
        module: String,
        #[source]
        source: io::Error,
    },

    /// Module is already under exclusive calibration
    #[error("Module '{module}' is already being calibrated")]
    Busy { module: String },

    /// Engine program, jar or directories missing before the run starts
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// External engine exited unsuccessfully or could not be started
    #[error("Engine failed ({}): {diagnostic}", describe_exit(.exit_code))]
    Subprocess {
        exit_code: Option<i32>,
        diagnostic: String,
    },

    /// External engine exceeded its time budget
    #[error("Engine timed out after {after:?}")]
    Timeout { after: Duration },

    /// Caller requested cancellation
    #[error("Run cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn malformed(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedModule {
            module: module.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn calibration_io(module: impl Into<String>, source: io::Error) -> Self {
        Error::CalibrationIo {
            module: module.into(),
            source,
        }
    }
}

fn describe_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(female, male)| format!("{} (female only) vs {} (male only)", female, male))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code".to_string(),
    }
}

/// Stage of a generation run at which a failure surfaced
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Validate,
    Resolve,
    Calibrate,
    Generate,
    Restore,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Validate => "validate",
            RunStage::Resolve => "resolve",
            RunStage::Calibrate => "calibrate",
            RunStage::Generate => "generate",
            RunStage::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// Structured failure of a generation run.
///
/// `cause` is the error that ended the run. Any module that could not be
/// put back afterwards is listed in `restore_failures`; those never replace
/// the cause.
#[derive(Debug)]
pub struct RunError {
    pub stage: RunStage,
    pub cause: Error,
    pub restore_failures: Vec<Error>,
}

impl RunError {
    /// Failure raised before any module was touched
    pub fn precheck(stage: RunStage, cause: Error) -> Self {
        Self {
            stage,
            cause,
            restore_failures: Vec::new(),
        }
    }

    /// True when every calibrated module was restored
    pub fn restored_cleanly(&self) -> bool {
        self.restore_failures.is_empty()
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.cause)?;
        if !self.restore_failures.is_empty() {
            write!(
                f,
                "; additionally {} module(s) could not be restored:",
                self.restore_failures.len()
            )?;
            for failure in &self.restore_failures {
                write!(f, " [{}]", failure)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}
