#![forbid(unsafe_code)]

//! Core domain model and orchestration for constrained synthetic cohort generation.
//!
//! This crate provides:
//! - Domain types (pathologies, gender rules, cohort requests, run results)
//! - The pathology registry and gender constraint resolution
//! - Parsing and rewriting of engine module state graphs
//! - Scoped prevalence calibration with guaranteed restoration
//! - The generation orchestrator and its external engine abstraction

pub mod types;
pub mod error;
pub mod registry;
pub mod gender;
pub mod module_graph;
pub mod calibration;
pub mod engine;
pub mod orchestrator;
pub mod run_log;
pub mod config;
pub mod logging;

// Re-export commonly used types
pub use error::{Error, Result, RunError, RunStage};
pub use types::*;
pub use registry::PathologyRegistry;
pub use gender::{advisory_skews, resolve};
pub use module_graph::{DecisionPoint, ModuleGraph};
pub use calibration::{
    compute_adjusted_weights, AdjustedWeights, CalibrationScope, CalibrationTarget, LockPolicy,
    ModuleMutation, PrevalenceCalibrator,
};
pub use engine::{
    CancelToken, EngineOutcome, EngineParams, GenerationEngine, Progress, ProgressHook,
    SubprocessEngine,
};
pub use orchestrator::GenerationOrchestrator;
pub use run_log::{read_runs, RunLog, RunRecord, RunStatus};
pub use config::Config;
