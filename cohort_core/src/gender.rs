//! Gender constraint resolution.
//!
//! Forced rules are hard filters and dominate weighted rules. Weighted rules
//! describe expected epidemiological skew only: they are reported through
//! [`advisory_skews`] but never combined into a filter, so a weighted-only
//! selection always resolves to [`ResolvedFilter::None`].

use crate::{Gender, GenderRule, PathologySpec, ResolvedFilter};

/// Compute the single gender filter implied by a pathology selection
///
/// The result depends only on the set of pathologies, not their order.
pub fn resolve(specs: &[&PathologySpec]) -> ResolvedFilter {
    let mut sorted: Vec<&PathologySpec> = specs.to_vec();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted.dedup_by(|a, b| a.id == b.id);

    let forcing = |gender: Gender| -> Vec<&str> {
        sorted
            .iter()
            .filter(|s| s.gender_rule == GenderRule::Forced(gender))
            .map(|s| s.id.as_str())
            .collect()
    };
    let female = forcing(Gender::Female);
    let male = forcing(Gender::Male);

    match (female.is_empty(), male.is_empty()) {
        (false, false) => {
            let pairs = female
                .iter()
                .flat_map(|f| male.iter().map(move |m| (f.to_string(), m.to_string())))
                .collect::<Vec<_>>();
            tracing::warn!("Irreconcilable gender constraints: {:?}", pairs);
            ResolvedFilter::Conflict(pairs)
        }
        (false, true) => {
            tracing::debug!("Female-only pathologies selected: {:?}", female);
            ResolvedFilter::Forced(Gender::Female)
        }
        (true, false) => {
            tracing::debug!("Male-only pathologies selected: {:?}", male);
            ResolvedFilter::Forced(Gender::Male)
        }
        (true, true) => ResolvedFilter::None,
    }
}

/// Expected female fraction for every weighted pathology, sorted by id
pub fn advisory_skews(specs: &[&PathologySpec]) -> Vec<(String, f64)> {
    let mut skews: Vec<(String, f64)> = specs
        .iter()
        .filter_map(|s| match s.gender_rule {
            GenderRule::Weighted(fraction) => Some((s.id.clone(), fraction)),
            _ => None,
        })
        .collect();
    skews.sort_by(|a, b| a.0.cmp(&b.0));
    skews.dedup_by(|a, b| a.0 == b.0);
    skews
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PathologyRegistry;

    fn resolve_ids(ids: &[&str]) -> ResolvedFilter {
        let registry = PathologyRegistry::builtin();
        let specs = registry.lookup(ids).unwrap();
        resolve(&specs)
    }

    #[test]
    fn test_opposite_forced_rules_conflict_in_any_order() {
        let expected = ResolvedFilter::Conflict(vec![(
            "pregnancy".to_string(),
            "prostate_cancer".to_string(),
        )]);

        assert_eq!(resolve_ids(&["pregnancy", "prostate_cancer"]), expected);
        assert_eq!(resolve_ids(&["prostate_cancer", "pregnancy"]), expected);

        // Order of the slice handed to the resolver does not matter either
        let registry = PathologyRegistry::builtin();
        let a = registry.get("prostate_cancer").unwrap();
        let b = registry.get("pregnancy").unwrap();
        assert_eq!(resolve(&[a, b]), expected);
    }

    #[test]
    fn test_conflict_lists_every_pair() {
        let filter = resolve_ids(&["contraceptives", "pregnancy", "prostate_cancer"]);
        assert_eq!(
            filter,
            ResolvedFilter::Conflict(vec![
                ("contraceptives".into(), "prostate_cancer".into()),
                ("pregnancy".into(), "prostate_cancer".into()),
            ])
        );
    }

    #[test]
    fn test_single_forced_gender() {
        assert_eq!(
            resolve_ids(&["pregnancy", "asthma"]),
            ResolvedFilter::Forced(Gender::Female)
        );
        assert_eq!(
            resolve_ids(&["prostate_cancer"]),
            ResolvedFilter::Forced(Gender::Male)
        );
    }

    #[test]
    fn test_forced_dominates_weighted() {
        // gout skews male, pregnancy forces female
        assert_eq!(
            resolve_ids(&["gout", "pregnancy"]),
            ResolvedFilter::Forced(Gender::Female)
        );
    }

    #[test]
    fn test_weighted_rules_are_advisory() {
        assert_eq!(resolve_ids(&["lupus", "gout"]), ResolvedFilter::None);
        assert_eq!(resolve_ids(&[]), ResolvedFilter::None);
    }

    #[test]
    fn test_advisory_skews_sorted() {
        let registry = PathologyRegistry::builtin();
        let specs = registry.lookup(&["lupus", "asthma", "gout"]).unwrap();
        assert_eq!(
            advisory_skews(&specs),
            vec![("gout".to_string(), 0.20), ("lupus".to_string(), 0.90)]
        );
    }
}
