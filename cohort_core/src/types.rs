//! Core domain types for constrained cohort generation.
//!
//! This module defines the fundamental types used throughout the system:
//! - Genders and per-pathology gender rules
//! - Pathology definitions and module references
//! - Cohort requests and resolved gender filters
//! - Run results

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::{Error, Result};

// ============================================================================
// Gender Types
// ============================================================================

/// Biological sex used as a generation filter
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gender {
    #[serde(rename = "F")]
    Female,
    #[serde(rename = "M")]
    Male,
}

impl Gender {
    /// Flag value understood by the generation engine
    pub fn as_flag(&self) -> &'static str {
        match self {
            Gender::Female => "F",
            Gender::Male => "M",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_flag())
    }
}

impl FromStr for Gender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "F" | "FEMALE" => Ok(Gender::Female),
            "M" | "MALE" => Ok(Gender::Male),
            other => Err(Error::InvalidRequest(format!("unknown gender '{}'", other))),
        }
    }
}

/// Epidemiological gender rule attached to a pathology
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenderRule {
    /// Biologically restricted to one sex; a hard filter
    Forced(Gender),
    /// Expected female fraction among affected patients; advisory only
    Weighted(f64),
    #[default]
    None,
}

// ============================================================================
// Pathology Types
// ============================================================================

/// Reference to an engine module, relative to the modules directory
/// (e.g. `lupus` or `veterans/veteran_ptsd`)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ModuleRef(pub String);

impl ModuleRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe form, used for lock and journal file names.
    /// Percent-encodes every byte outside `[A-Za-z0-9_-]`, so distinct refs
    /// never share a stem.
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                stem.push(byte as char);
            } else {
                stem.push_str(&format!("%{:02X}", byte));
            }
        }
        stem
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Clinical grouping used when listing the catalog
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PathologyCategory {
    Cardiovascular,
    Cancer,
    Metabolic,
    Respiratory,
    Neurological,
    Renal,
    Musculoskeletal,
    MentalHealth,
    Infectious,
    Allergy,
    Other,
}

/// A selectable disease or condition backed by an engine module
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PathologySpec {
    pub id: String,
    pub display_name: String,
    pub category: PathologyCategory,
    pub module: ModuleRef,
    #[serde(default)]
    pub gender_rule: GenderRule,
    #[serde(default)]
    pub adjustable: bool,
    /// Decision state to recalibrate; located automatically when absent
    #[serde(default)]
    pub decision_state: Option<String>,
}

// ============================================================================
// Request and Result Types
// ============================================================================

/// A request for one cohort generation run
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct CohortRequest {
    pub pathology_ids: Vec<String>,
    pub count: u32,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Pathology id → desired prevalence in [0, 1]
    #[serde(default)]
    pub prevalence_overrides: BTreeMap<String, f64>,
    /// Inclusive age bounds in years
    #[serde(default)]
    pub age_range: Option<(u32, u32)>,
    #[serde(default)]
    pub only_alive: bool,
}

impl CohortRequest {
    pub fn new<I, S>(pathology_ids: I, count: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pathology_ids: pathology_ids.into_iter().map(Into::into).collect(),
            count,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_override(mut self, id: impl Into<String>, prevalence: f64) -> Self {
        self.prevalence_overrides.insert(id.into(), prevalence);
        self
    }

    pub fn with_age_range(mut self, min: u32, max: u32) -> Self {
        self.age_range = Some((min, max));
        self
    }

    /// Check request shape; no registry access
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(Error::InvalidRequest("patient count must be > 0".into()));
        }
        if let Some((min, max)) = self.age_range {
            if min > max {
                return Err(Error::InvalidRequest(format!(
                    "age range {}-{} is inverted",
                    min, max
                )));
            }
        }
        for (id, p) in &self.prevalence_overrides {
            if !p.is_finite() || !(0.0..=1.0).contains(p) {
                return Err(Error::InvalidRequest(format!(
                    "prevalence for '{}' must be within [0, 1], got {}",
                    id, p
                )));
            }
            if !self.pathology_ids.iter().any(|selected| selected == id) {
                return Err(Error::InvalidRequest(format!(
                    "prevalence override for '{}' which is not among the selected pathologies",
                    id
                )));
            }
        }
        Ok(())
    }
}

/// Gender filter derived from a pathology selection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedFilter {
    Forced(Gender),
    /// Every (female-forcing, male-forcing) pathology id pair
    Conflict(Vec<(String, String)>),
    None,
}

/// Outcome of a successful generation run
#[derive(Clone, Debug)]
pub struct RunResult {
    pub run_id: Uuid,
    pub output_location: PathBuf,
    pub patient_count: u64,
    pub gender: Option<Gender>,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gender_parsing() {
        assert_eq!("f".parse::<Gender>().unwrap(), Gender::Female);
        assert_eq!("Male".parse::<Gender>().unwrap(), Gender::Male);
        assert!("x".parse::<Gender>().is_err());
    }

    #[test]
    fn test_module_ref_file_stem_is_flat() {
        let module = ModuleRef::new("veterans/veteran_ptsd");
        assert_eq!(module.file_stem(), "veterans%2Fveteran_ptsd");
        assert!(!module.file_stem().contains('/'));
    }

    #[test]
    fn test_module_ref_file_stems_never_collide() {
        let refs = ["veterans/ptsd", "veterans_ptsd", "veterans%2Fptsd", "veterans ptsd"];
        let stems: std::collections::BTreeSet<String> =
            refs.iter().map(|r| ModuleRef::new(*r).file_stem()).collect();
        assert_eq!(stems.len(), refs.len());
    }

    #[test]
    fn test_request_rejects_zero_count() {
        let request = CohortRequest::new(["lupus"], 0);
        assert!(matches!(request.validate(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_request_rejects_out_of_range_prevalence() {
        let request = CohortRequest::new(["lupus"], 5).with_override("lupus", 1.5);
        assert!(matches!(request.validate(), Err(Error::InvalidRequest(_))));

        let request = CohortRequest::new(["lupus"], 5).with_override("lupus", f64::NAN);
        assert!(matches!(request.validate(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_request_rejects_override_outside_selection() {
        let request = CohortRequest::new(["gout"], 5).with_override("lupus", 0.3);
        assert!(matches!(request.validate(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_gender_rule_toml_forms() {
        #[derive(Deserialize)]
        struct Wrapper {
            rule: GenderRule,
        }

        let forced: Wrapper = toml::from_str("rule = { forced = \"F\" }").unwrap();
        assert_eq!(forced.rule, GenderRule::Forced(Gender::Female));

        let weighted: Wrapper = toml::from_str("rule = { weighted = 0.9 }").unwrap();
        assert_eq!(weighted.rule, GenderRule::Weighted(0.9));

        let none: Wrapper = toml::from_str("rule = \"none\"").unwrap();
        assert_eq!(none.rule, GenderRule::None);
    }
}
