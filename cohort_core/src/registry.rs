//! Pathology registry.
//!
//! The registry maps pathology ids to their engine module, gender rule and
//! adjustability. It is constructed explicitly and never mutated afterwards,
//! so a single instance can be shared across threads behind an `Arc`.

use crate::types::*;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Immutable catalog of selectable pathologies
#[derive(Clone, Debug)]
pub struct PathologyRegistry {
    pathologies: BTreeMap<String, PathologySpec>,
}

/// On-disk catalog layout: a list of `[[pathology]]` tables
#[derive(Deserialize)]
struct CatalogFile {
    #[serde(rename = "pathology", default)]
    pathologies: Vec<PathologySpec>,
}

impl PathologyRegistry {
    /// Build a registry from explicit definitions. Later duplicates replace earlier ones.
    pub fn from_specs(specs: impl IntoIterator<Item = PathologySpec>) -> Self {
        let pathologies = specs
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();
        Self { pathologies }
    }

    /// Load an alternate catalog from a TOML file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let file: CatalogFile = toml::from_str(&contents)?;
        let registry = Self::from_specs(file.pathologies);

        let errors = registry.validate();
        if !errors.is_empty() {
            return Err(Error::CatalogValidation(errors.join("; ")));
        }

        tracing::info!(
            "Loaded {} pathologies from {:?}",
            registry.pathologies.len(),
            path
        );
        Ok(registry)
    }

    /// Look up pathologies by id, sorted by id regardless of input order
    pub fn lookup<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<&PathologySpec>> {
        let mut specs = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id.as_ref();
            let spec = self
                .pathologies
                .get(id)
                .ok_or_else(|| Error::UnknownPathology { id: id.to_string() })?;
            specs.push(spec);
        }
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs.dedup_by(|a, b| a.id == b.id);
        Ok(specs)
    }

    pub fn get(&self, id: &str) -> Option<&PathologySpec> {
        self.pathologies.get(id)
    }

    pub fn len(&self) -> usize {
        self.pathologies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pathologies.is_empty()
    }

    /// All pathologies, sorted by id
    pub fn iter(&self) -> impl Iterator<Item = &PathologySpec> {
        self.pathologies.values()
    }

    /// Pathologies grouped by category, each group sorted by id
    pub fn by_category(&self) -> BTreeMap<PathologyCategory, Vec<&PathologySpec>> {
        let mut grouped: BTreeMap<PathologyCategory, Vec<&PathologySpec>> = BTreeMap::new();
        for spec in self.pathologies.values() {
            grouped.entry(spec.category).or_default().push(spec);
        }
        grouped
    }

    /// Validate the registry for consistency
    ///
    /// Returns a list of validation errors, or empty Vec if valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut adjustable_modules: HashMap<&ModuleRef, &str> = HashMap::new();

        for (id, spec) in &self.pathologies {
            if id.is_empty() || spec.id.is_empty() {
                errors.push("Pathology has empty ID".to_string());
            }
            if spec.display_name.is_empty() {
                errors.push(format!("Pathology '{}' has empty display name", id));
            }
            if spec.module.as_str().is_empty() {
                errors.push(format!("Pathology '{}' has empty module reference", id));
            }
            if let GenderRule::Weighted(fraction) = spec.gender_rule {
                if !(fraction > 0.0 && fraction < 1.0) {
                    errors.push(format!(
                        "Pathology '{}': weighted female fraction {} must be within (0, 1); use a forced rule instead",
                        id, fraction
                    ));
                }
            }
            if spec.decision_state.is_some() && !spec.adjustable {
                errors.push(format!(
                    "Pathology '{}' names a decision state but is not adjustable",
                    id
                ));
            }

            // Two adjustable pathologies on one module would calibrate it twice in one run
            if spec.adjustable {
                if let Some(other) = adjustable_modules.insert(&spec.module, id) {
                    errors.push(format!(
                        "Pathologies '{}' and '{}' both adjust module '{}'",
                        other, id, spec.module
                    ));
                }
            }
        }

        errors
    }

    /// The built-in catalog of engine pathologies
    pub fn builtin() -> Self {
        use PathologyCategory::*;

        // (id, display name, category, adjustable)
        const ENTRIES: &[(&str, &str, PathologyCategory, bool)] = &[
            // Cardiovascular
            ("hypertension", "Hypertension", Cardiovascular, true),
            ("atrial_fibrillation", "Atrial Fibrillation", Cardiovascular, true),
            ("myocardial_infarction", "Myocardial Infarction", Cardiovascular, true),
            ("congestive_heart_failure", "Congestive Heart Failure", Cardiovascular, true),
            ("stroke", "Stroke", Cardiovascular, true),
            ("stable_ischemic_heart_disease", "Stable Ischemic Heart Disease", Cardiovascular, true),
            // Cancers
            ("breast_cancer", "Breast Cancer", Cancer, true),
            ("lung_cancer", "Lung Cancer", Cancer, true),
            ("colorectal_cancer", "Colorectal Cancer", Cancer, true),
            ("acute_myeloid_leukemia", "Acute Myeloid Leukemia", Cancer, true),
            ("prostate_cancer", "Prostate Cancer", Cancer, true),
            ("cervical_cancer", "Cervical Cancer", Cancer, true),
            // Metabolic
            ("metabolic_syndrome_disease", "Metabolic Syndrome", Metabolic, true),
            ("metabolic_syndrome_care", "Metabolic Syndrome Care", Metabolic, false),
            ("hypothyroidism", "Hypothyroidism", Metabolic, true),
            ("gout", "Gout", Metabolic, true),
            // Respiratory
            ("asthma", "Asthma", Respiratory, true),
            ("copd", "COPD", Respiratory, true),
            ("bronchitis", "Bronchitis", Respiratory, true),
            ("covid19", "COVID-19", Respiratory, true),
            ("cystic_fibrosis", "Cystic Fibrosis", Respiratory, true),
            ("sinusitis", "Sinusitis", Respiratory, true),
            ("sleep_apnea", "Sleep Apnea", Respiratory, true),
            // Neurological
            ("dementia", "Dementia", Neurological, true),
            ("epilepsy", "Epilepsy", Neurological, true),
            ("attention_deficit_disorder", "Attention Deficit Disorder", Neurological, true),
            ("mTBI", "Mild Traumatic Brain Injury", Neurological, true),
            ("cerebral_palsy", "Cerebral Palsy", Neurological, true),
            // Renal
            ("chronic_kidney_disease", "Chronic Kidney Disease", Renal, true),
            ("kidney_transplant", "Kidney Transplant", Renal, false),
            ("dialysis", "Dialysis", Renal, false),
            // Musculoskeletal
            ("osteoarthritis", "Osteoarthritis", Musculoskeletal, true),
            ("osteoporosis", "Osteoporosis", Musculoskeletal, true),
            ("rheumatoid_arthritis", "Rheumatoid Arthritis", Musculoskeletal, true),
            ("fibromyalgia", "Fibromyalgia", Musculoskeletal, true),
            ("lupus", "Lupus", Musculoskeletal, true),
            ("total_joint_replacement", "Total Joint Replacement", Musculoskeletal, false),
            // Mental health
            ("opioid_addiction", "Opioid Addiction", MentalHealth, true),
            ("self_harm", "Self Harm", MentalHealth, true),
            ("veteran_ptsd", "PTSD (veterans)", MentalHealth, true),
            ("veteran_mdd", "Major Depressive Disorder (veterans)", MentalHealth, true),
            ("homelessness", "Homelessness", MentalHealth, false),
            // Infectious
            ("hiv_diagnosis", "HIV Diagnosis", Infectious, true),
            ("hiv_care", "HIV Care", Infectious, false),
            ("urinary_tract_infections", "Urinary Tract Infections", Infectious, true),
            ("sepsis", "Sepsis", Infectious, true),
            // Allergies
            ("allergic_rhinitis", "Allergic Rhinitis", Allergy, true),
            ("allergies", "Allergies", Allergy, true),
            ("food_allergies", "Food Allergies", Allergy, true),
            ("atopy", "Atopy", Allergy, true),
            // Other
            ("pregnancy", "Pregnancy", Other, false),
            ("contraceptives", "Contraceptives", Other, false),
            ("female_reproduction", "Female Reproduction", Other, false),
            ("endometriosis", "Endometriosis", Other, true),
            ("gallstones", "Gallstones", Other, true),
            ("appendicitis", "Appendicitis", Other, true),
            ("injuries", "Injuries", Other, false),
            ("ear_infections", "Ear Infections", Other, true),
            ("sore_throat", "Sore Throat", Other, true),
            ("dental_and_oral_examination", "Dental and Oral Examination", Other, false),
            ("wellness_encounters", "Wellness Encounters", Other, false),
        ];

        let specs = ENTRIES.iter().map(|&(id, name, category, adjustable)| PathologySpec {
            id: id.into(),
            display_name: name.into(),
            category,
            module: ModuleRef::new(id),
            gender_rule: builtin_gender_rule(id),
            adjustable,
            decision_state: None,
        });

        Self::from_specs(specs)
    }
}

/// Sex distribution among affected patients. Unlisted pathologies carry no rule.
fn builtin_gender_rule(id: &str) -> GenderRule {
    match id {
        // Exclusively female
        "pregnancy" | "female_reproduction" | "contraceptives" | "cervical_cancer"
        | "endometriosis" => GenderRule::Forced(Gender::Female),
        // Exclusively male
        "prostate_cancer" => GenderRule::Forced(Gender::Male),
        // Female predominance
        "breast_cancer" => GenderRule::Weighted(0.99),
        "lupus" => GenderRule::Weighted(0.90),
        "fibromyalgia" | "osteoporosis" | "hypothyroidism" => GenderRule::Weighted(0.80),
        "rheumatoid_arthritis" => GenderRule::Weighted(0.70),
        // Male predominance
        "sleep_apnea" => GenderRule::Weighted(0.35),
        "gout" => GenderRule::Weighted(0.20),
        _ => GenderRule::None,
    }
}
