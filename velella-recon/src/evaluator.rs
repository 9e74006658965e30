//! The reconciliation evaluator façade.
//!
//! Owns the species tree, the gene-species mapping and one model
//! instance; exposes incremental evaluation (invalidate, re-evaluate),
//! rate updates and ML scenario inference. The gene tree itself is
//! borrowed per call so the SPR driver can own and edit it.

use crate::config::RecSettings;
use crate::gene_tree::{GeneTree, SubnodeId};
use crate::mapping::GeneSpeciesMap;
use crate::model::RecModel;
use crate::rates::RatesInput;
use crate::scenario::Scenario;
use crate::species_tree::SpeciesTree;
use velella_core::{Result, ScaledReal};

/// Reconciliation likelihood evaluator for one gene family.
#[derive(Debug)]
pub struct ReconciliationEvaluator {
    species: SpeciesTree,
    gene_to_species: Vec<usize>,
    model: RecModel<ScaledReal>,
    settings: RecSettings,
    warnings: Vec<String>,
}

impl ReconciliationEvaluator {
    /// Build an evaluator over one species tree / gene family pair.
    ///
    /// With `prune_species_tree` set, the species tree is first restricted
    /// to the species the family actually covers. Initial rates come from
    /// the settings (user rates or neutral defaults).
    pub fn new(
        species: SpeciesTree,
        genes: &GeneTree,
        mapping: &GeneSpeciesMap,
        settings: &RecSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let species = if settings.prune_species_tree {
            let covered = mapping.species_set(genes);
            species.pruned_to(&covered)?
        } else {
            species
        };
        let gene_to_species = mapping.resolve(genes, &species)?;
        let (dup, loss, transfer) = settings.initial_rates();
        let rates = RatesInput::global(species.node_count(), dup, loss, transfer);
        let model = RecModel::new(
            settings.model,
            &species,
            genes,
            &rates,
            settings.rooted_gene_tree,
            settings.no_dup,
            settings.dtl_iterations,
        )?;
        Ok(Self {
            species,
            gene_to_species,
            model,
            settings: settings.clone(),
            warnings: Vec::new(),
        })
    }

    /// The (possibly pruned) species tree this evaluator reconciles
    /// against.
    pub fn species(&self) -> &SpeciesTree {
        &self.species
    }

    /// The active settings.
    pub fn settings(&self) -> &RecSettings {
        &self.settings
    }

    /// Replace the rates with a global triple; invalidates all CLVs.
    pub fn set_global_rates(&mut self, dup: f64, loss: f64, transfer: f64) -> Result<()> {
        let rates = RatesInput::global(self.species.node_count(), dup, loss, transfer);
        self.set_rates(&rates)
    }

    /// Replace the rates with per-branch vectors; invalidates all CLVs.
    pub fn set_rates(&mut self, rates: &RatesInput) -> Result<()> {
        self.model
            .set_rates(&self.species, rates, self.settings.no_dup)
    }

    /// Record an invalidation seed for one gene half-edge.
    pub fn invalidate_clv(&mut self, subnode: SubnodeId) {
        self.model.invalidate_clv(subnode);
    }

    /// Invalidate every CLV.
    pub fn invalidate_all_clvs(&mut self) {
        self.model.invalidate_all_clvs();
    }

    /// The reconciliation log-likelihood of the gene tree.
    pub fn evaluate(&mut self, genes: &GeneTree) -> Result<f64> {
        let ll = self
            .model
            .compute_log_likelihood(&self.species, genes, &self.gene_to_species)?;
        self.warnings.extend(self.model.take_warnings());
        Ok(ll)
    }

    /// The most likely reconciliation scenario for the current state.
    pub fn infer_ml_scenario(&mut self, genes: &GeneTree) -> Result<Scenario> {
        self.model
            .infer_ml_scenario(&self.species, genes, &self.gene_to_species)
    }

    /// The current gene root (fixed in rooted mode, last inferred ML root
    /// otherwise).
    pub fn root(&self) -> Option<SubnodeId> {
        self.model.root()
    }

    /// Override the current gene root (rollback support).
    pub fn set_root(&mut self, root: Option<SubnodeId>) {
        self.model.set_root(root);
    }

    /// Numerical warnings accumulated so far.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}
