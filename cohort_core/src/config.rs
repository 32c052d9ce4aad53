//! Configuration file support for cohort generation.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/cohort/config.toml`.

use crate::calibration::LockPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub generation: GenerationConfig,
}

/// Directory layout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Engine module files (shared, mutated during calibration)
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,

    /// Where the engine writes patient records
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Locks, recovery journal and run log
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            modules_dir: default_modules_dir(),
            output_dir: default_output_dir(),
            state_dir: default_state_dir(),
        }
    }
}

/// External engine invocation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments placed before the generated flags
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Arguments placed after the generated flags (exporter settings)
    #[serde(default = "default_extra_args")]
    pub extra_args: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// No limit when absent
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            extra_args: default_extra_args(),
            working_dir: None,
            timeout_secs: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct CalibrationConfig {
    #[serde(default)]
    pub lock_policy: LockPolicy,
}

/// Run behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Remove previous `*.json` records before each run
    #[serde(default = "default_clear_output")]
    pub clear_output: bool,

    /// Alternate pathology catalog; the built-in catalog is used when absent
    #[serde(default)]
    pub registry_path: Option<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            clear_output: default_clear_output(),
            registry_path: None,
        }
    }
}

// Default value functions
fn home_dir_or_current() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("src/main/resources/modules")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output/fhir")
}

fn default_state_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| home_dir_or_current().join(".local/share"));
    base.join("cohort")
}

fn default_program() -> String {
    "java".into()
}

fn default_args() -> Vec<String> {
    vec!["-jar".into(), "build/libs/synthea-with-dependencies.jar".into()]
}

fn default_extra_args() -> Vec<String> {
    vec![
        "--exporter.fhir.export=true".into(),
        "--exporter.hospital.fhir.export=false".into(),
        "--exporter.practitioner.fhir.export=false".into(),
        "--exporter.years_of_history=10".into(),
    ]
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_clear_output() -> bool {
    true
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!("Loaded config from {:?}", path);

        let errors = config.validate();
        if !errors.is_empty() {
            return Err(Error::Config(errors.join("; ")));
        }
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| home_dir_or_current().join(".config"));
        base.join("cohort").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Check for settings the engine or calibrator cannot work with
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.engine.program.trim().is_empty() {
            errors.push("engine.program must not be empty".to_string());
        }
        if self.engine.timeout_secs == Some(0) {
            errors.push("engine.timeout_secs must be > 0 when set".to_string());
        }
        if self.engine.poll_interval_ms == 0 {
            errors.push("engine.poll_interval_ms must be > 0".to_string());
        }
        if self.paths.modules_dir.as_os_str().is_empty() {
            errors.push("paths.modules_dir must not be empty".to_string());
        }
        if self.paths.state_dir.as_os_str().is_empty() {
            errors.push("paths.state_dir must not be empty".to_string());
        }

        errors
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.paths.state_dir.join("runs.jsonl")
    }

    /// `path` as the engine sees it: relative paths are anchored at
    /// `engine.working_dir`, then made absolute
    pub fn engine_path(&self, path: &Path) -> PathBuf {
        let anchored = match &self.engine.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        if anchored.is_absolute() {
            return anchored;
        }
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(anchored),
            Err(_) => anchored,
        }
    }

    /// Modules directory shared by the calibrator and the engine
    pub fn modules_dir(&self) -> PathBuf {
        self.engine_path(&self.paths.modules_dir)
    }

    /// Record directory the engine writes into
    pub fn output_dir(&self) -> PathBuf {
        self.engine_path(&self.paths.output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.program, "java");
        assert!(config.engine.timeout_secs.is_none());
        assert_eq!(config.calibration.lock_policy, LockPolicy::Block);
        assert!(config.generation.clear_output);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.engine.args, parsed.engine.args);
        assert_eq!(config.paths.modules_dir, parsed.paths.modules_dir);
        assert_eq!(
            config.calibration.lock_policy,
            parsed.calibration.lock_policy
        );
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[engine]
program = "/opt/synthea/run_synthea"
timeout_secs = 600

[calibration]
lock_policy = "fail_fast"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.program, "/opt/synthea/run_synthea");
        assert_eq!(config.engine.timeout_secs, Some(600));
        assert_eq!(config.engine.poll_interval_ms, 100); // default
        assert_eq!(config.calibration.lock_policy, LockPolicy::FailFast);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[engine]\nprogram = \"\"\ntimeout_secs = 0\n").unwrap();

        match Config::load_from(&path) {
            Err(Error::Config(msg)) => {
                assert!(msg.contains("engine.program"));
                assert!(msg.contains("timeout_secs"));
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.generation.clear_output = false;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(!loaded.generation.clear_output);
    }

    #[test]
    fn test_relative_paths_follow_engine_working_dir() {
        let mut config = Config::default();
        config.engine.working_dir = Some(PathBuf::from("/opt/synthea"));
        config.paths.state_dir = PathBuf::from("/var/lib/cohort");

        assert_eq!(
            config.modules_dir(),
            PathBuf::from("/opt/synthea/src/main/resources/modules")
        );
        assert_eq!(config.output_dir(), PathBuf::from("/opt/synthea/output/fhir"));

        config.paths.output_dir = PathBuf::from("/srv/cohorts/fhir");
        assert_eq!(config.output_dir(), PathBuf::from("/srv/cohorts/fhir"));
    }

    #[test]
    fn test_relative_paths_without_working_dir_are_absolute() {
        let config = Config::default();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(config.output_dir(), cwd.join("output/fhir"));
        assert!(config.modules_dir().is_absolute());
    }
}
