//! Per-family statistics and batch evaluation.
//!
//! Parallelism is across gene families: every family owns its evaluator
//! and CLV tables, and the per-family log-likelihoods reduce by
//! summation. A failing family aborts the whole batch with an error
//! naming it.

use rayon::prelude::*;

use crate::config::RecSettings;
use crate::evaluator::ReconciliationEvaluator;
use crate::gene_tree::GeneTree;
use crate::mapping::GeneSpeciesMap;
use crate::species_tree::SpeciesTree;
use velella_core::{Result, Summarizable, VelellaError};

/// One gene family: a name, a gene tree and its mapping.
#[derive(Debug, Clone)]
pub struct GeneFamily {
    /// Family name, used in stats and error messages.
    pub name: String,
    /// Gene tree in Newick form.
    pub gene_tree: String,
    /// Gene-to-species mapping.
    pub mapping: GeneSpeciesMap,
}

impl GeneFamily {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, gene_tree: impl Into<String>, mapping: GeneSpeciesMap) -> Self {
        Self {
            name: name.into(),
            gene_tree: gene_tree.into(),
            mapping,
        }
    }
}

/// Likelihood statistics for one family, before and after optimization.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FamilyStats {
    /// Family name.
    pub name: String,
    /// Joint log-likelihood before the search.
    pub initial_ll: f64,
    /// Reconciliation log-likelihood before the search.
    pub initial_llrec: f64,
    /// Sequence log-likelihood before the search.
    pub initial_llseq: f64,
    /// Final joint log-likelihood.
    pub ll: f64,
    /// Final reconciliation log-likelihood.
    pub llrec: f64,
    /// Final sequence log-likelihood.
    pub llseq: f64,
    /// Duplication rate used.
    pub dup_rate: f64,
    /// Loss rate used.
    pub loss_rate: f64,
    /// Transfer rate used.
    pub transfer_rate: f64,
}

impl FamilyStats {
    /// Render as `key = value` lines, one per statistic.
    pub fn to_text(&self) -> String {
        format!(
            "family = {}\n\
             initial_ll = {}\n\
             initial_llrec = {}\n\
             initial_llseq = {}\n\
             ll = {}\n\
             llrec = {}\n\
             llseq = {}\n\
             D = {}\n\
             L = {}\n\
             T = {}\n",
            self.name,
            self.initial_ll,
            self.initial_llrec,
            self.initial_llseq,
            self.ll,
            self.llrec,
            self.llseq,
            self.dup_rate,
            self.loss_rate,
            self.transfer_rate,
        )
    }
}

impl Summarizable for FamilyStats {
    fn summary(&self) -> String {
        format!("{}: ll {:.6} (rec {:.6})", self.name, self.ll, self.llrec)
    }
}

/// Evaluate every family against one species tree, in parallel.
///
/// Returns the per-family reconciliation log-likelihoods in input order
/// plus their sum. Families must be non-empty.
pub fn evaluate_families(
    species: &SpeciesTree,
    families: &[GeneFamily],
    settings: &RecSettings,
) -> Result<(Vec<f64>, f64)> {
    if families.is_empty() {
        return Err(VelellaError::InvalidInput("empty family set".into()));
    }
    let log_likelihoods: Vec<f64> = families
        .par_iter()
        .map(|family| {
            evaluate_family(species, family, settings).map_err(|error| {
                VelellaError::InvalidInput(format!("family '{}': {}", family.name, error))
            })
        })
        .collect::<Result<Vec<f64>>>()?;
    let total = log_likelihoods.iter().sum();
    Ok((log_likelihoods, total))
}

fn evaluate_family(
    species: &SpeciesTree,
    family: &GeneFamily,
    settings: &RecSettings,
) -> Result<f64> {
    let genes = GeneTree::from_newick(&family.gene_tree)?;
    let mut evaluator =
        ReconciliationEvaluator::new(species.clone(), &genes, &family.mapping, settings)?;
    evaluator.evaluate(&genes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn species() -> SpeciesTree {
        SpeciesTree::from_newick("((A,B),C);").unwrap()
    }

    fn mapping() -> GeneSpeciesMap {
        GeneSpeciesMap::from_pairs([("a", "A"), ("b", "B"), ("c", "C")])
    }

    #[test]
    fn batch_reduces_by_summation() {
        let families = vec![
            GeneFamily::new("fam1", "((a,b),c);", mapping()),
            GeneFamily::new("fam2", "((a,c),b);", mapping()),
            GeneFamily::new("fam3", "(a,c);", mapping()),
        ];
        let (per_family, total) =
            evaluate_families(&species(), &families, &RecSettings::default()).unwrap();
        assert_eq!(per_family.len(), 3);
        assert!((total - per_family.iter().sum::<f64>()).abs() < 1e-12);
        assert!(per_family.iter().all(|ll| ll.is_finite()));
    }

    #[test]
    fn batch_matches_serial_evaluation() {
        let families = vec![
            GeneFamily::new("fam1", "((a,b),c);", mapping()),
            GeneFamily::new("fam2", "((a,c),b);", mapping()),
        ];
        let (per_family, _) =
            evaluate_families(&species(), &families, &RecSettings::default()).unwrap();
        for (family, &parallel_ll) in families.iter().zip(&per_family) {
            let serial_ll =
                evaluate_family(&species(), family, &RecSettings::default()).unwrap();
            assert_eq!(serial_ll.to_bits(), parallel_ll.to_bits());
        }
    }

    #[test]
    fn failing_family_is_named() {
        let families = vec![
            GeneFamily::new("good", "((a,b),c);", mapping()),
            GeneFamily::new("broken", "((a,b),z);", mapping()),
        ];
        let error =
            evaluate_families(&species(), &families, &RecSettings::default()).unwrap_err();
        assert!(error.to_string().contains("broken"));
    }

    #[test]
    fn empty_family_set_rejected() {
        assert!(evaluate_families(&species(), &[], &RecSettings::default()).is_err());
    }

    #[test]
    fn stats_render_key_value_lines() {
        let stats = FamilyStats {
            name: "fam1".into(),
            initial_ll: -10.0,
            initial_llrec: -4.0,
            initial_llseq: -6.0,
            ll: -8.0,
            llrec: -3.0,
            llseq: -5.0,
            dup_rate: 0.2,
            loss_rate: 0.2,
            transfer_rate: 0.0,
        };
        let text = stats.to_text();
        assert_eq!(text.lines().count(), 10);
        assert!(text.contains("initial_ll = -10"));
        assert!(text.contains("D = 0.2"));
    }
}
