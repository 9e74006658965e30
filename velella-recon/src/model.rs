//! The reconciliation model kernel.
//!
//! The three model variants form a closed set dispatched by tag; the
//! shared machinery here owns what they have in common: validity-driven
//! post-order CLV updates, candidate-root enumeration, virtual-root
//! likelihoods, ML-root selection with the unrooted refinement loop, and
//! the scenario entry point.

use std::fmt;
use std::str::FromStr;

use crate::clv::ClvValidity;
use crate::gene_tree::{GeneTree, SubnodeId};
use crate::rates::RatesInput;
use crate::scenario::Scenario;
use crate::simple_ds::DsModel;
use crate::species_tree::SpeciesTree;
use crate::undated_dl::DlModel;
use crate::undated_dtl::DtlModel;
use velella_core::{ExtendedReal, Result, VelellaError};

/// Bound on the unrooted ML-root refinement loop. The root stabilizes
/// after one or two passes in practice; hitting the cap records a
/// numerical warning instead of looping further.
const MAX_ROOT_REFINEMENTS: usize = 10;

/// The reconciliation model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RecModelKind {
    /// Undated duplication-loss.
    UndatedDl,
    /// Undated duplication-transfer-loss.
    UndatedDtl,
    /// Duplication-speciation without loss (likelihood only).
    SimpleDs,
}

impl RecModelKind {
    /// True if the variant models horizontal transfers.
    pub fn accounts_for_transfers(self) -> bool {
        matches!(self, RecModelKind::UndatedDtl)
    }

    /// True if the variant can extract a reconciliation scenario.
    pub fn supports_scenarios(self) -> bool {
        !matches!(self, RecModelKind::SimpleDs)
    }
}

impl FromStr for RecModelKind {
    type Err = VelellaError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "UndatedDL" => Ok(RecModelKind::UndatedDl),
            "UndatedDTL" => Ok(RecModelKind::UndatedDtl),
            "SimpleDS" => Ok(RecModelKind::SimpleDs),
            other => Err(VelellaError::InvalidInput(format!(
                "unknown reconciliation model '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RecModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecModelKind::UndatedDl => "UndatedDL",
            RecModelKind::UndatedDtl => "UndatedDTL",
            RecModelKind::SimpleDs => "SimpleDS",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
enum ModelState<R: ExtendedReal> {
    UndatedDl(DlModel<R>),
    UndatedDtl(DtlModel<R>),
    SimpleDs(DsModel<R>),
}

/// One reconciliation model instance bound to a gene family.
#[derive(Debug, Clone)]
pub struct RecModel<R: ExtendedReal> {
    kind: RecModelKind,
    state: ModelState<R>,
    validity: ClvValidity,
    rooted: bool,
    gene_root: Option<SubnodeId>,
    warnings: Vec<String>,
}

impl<R: ExtendedReal> RecModel<R> {
    /// Build a model of the given kind over one species tree / gene tree
    /// pair, with initial rates.
    pub fn new(
        kind: RecModelKind,
        species: &SpeciesTree,
        genes: &GeneTree,
        rates: &RatesInput,
        rooted_gene_tree: bool,
        no_dup: bool,
        dtl_iterations: usize,
    ) -> Result<Self> {
        let gene_root = if rooted_gene_tree {
            Some(genes.root_edge().ok_or_else(|| {
                VelellaError::InvalidInput(
                    "rooted gene tree mode requires a rooted Newick input".into(),
                )
            })?)
        } else {
            None
        };
        let subnode_count = genes.subnode_count();
        let state = match kind {
            RecModelKind::UndatedDl => {
                ModelState::UndatedDl(DlModel::new(species, subnode_count, rates, no_dup)?)
            }
            RecModelKind::UndatedDtl => ModelState::UndatedDtl(DtlModel::new(
                species,
                subnode_count,
                rates,
                no_dup,
                dtl_iterations,
            )?),
            RecModelKind::SimpleDs => ModelState::SimpleDs(DsModel::new(subnode_count, rates)?),
        };
        Ok(Self {
            kind,
            state,
            validity: ClvValidity::new(subnode_count),
            rooted: rooted_gene_tree,
            gene_root,
            warnings: Vec::new(),
        })
    }

    /// The model variant.
    pub fn kind(&self) -> RecModelKind {
        self.kind
    }

    /// Replace the rates and invalidate every CLV.
    pub fn set_rates(
        &mut self,
        species: &SpeciesTree,
        rates: &RatesInput,
        no_dup: bool,
    ) -> Result<()> {
        match &mut self.state {
            ModelState::UndatedDl(model) => model.set_rates(species, rates, no_dup)?,
            ModelState::UndatedDtl(model) => model.set_rates(species, rates, no_dup)?,
            ModelState::SimpleDs(model) => model.set_rates(rates)?,
        }
        if !self.rooted {
            self.gene_root = None;
        }
        self.validity.invalidate_all();
        Ok(())
    }

    /// Record an invalidation seed for one half-edge.
    pub fn invalidate_clv(&mut self, subnode: SubnodeId) {
        self.validity.invalidate(subnode);
    }

    /// Invalidate every CLV.
    pub fn invalidate_all_clvs(&mut self) {
        self.validity.invalidate_all();
    }

    /// The current gene root (fixed in rooted mode, last ML root in
    /// unrooted mode).
    pub fn root(&self) -> Option<SubnodeId> {
        self.gene_root
    }

    /// Override the current gene root (used by rollbacks).
    pub fn set_root(&mut self, root: Option<SubnodeId>) {
        self.gene_root = root;
    }

    /// Drain accumulated numerical warnings.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Compute the reconciliation log-likelihood.
    ///
    /// Stale CLVs are recomputed in strict post-order, virtual-root rows
    /// are filled for every candidate root, and in unrooted mode the ML
    /// root is refined to a fixed point (bounded; the likelihood is
    /// monotone non-decreasing over refinements).
    pub fn compute_log_likelihood(
        &mut self,
        species: &SpeciesTree,
        genes: &GeneTree,
        gene_to_species: &[usize],
    ) -> Result<f64> {
        self.update_clvs(species, genes, gene_to_species)?;
        self.compute_likelihoods(species, genes, gene_to_species)?;
        if !self.rooted {
            let mut refinements = 0;
            loop {
                let previous = self.gene_root;
                self.gene_root = self.ml_root(genes);
                if self.gene_root == previous {
                    break;
                }
                refinements += 1;
                if refinements >= MAX_ROOT_REFINEMENTS {
                    self.warnings.push(format!(
                        "gene root did not stabilize after {} refinements",
                        MAX_ROOT_REFINEMENTS
                    ));
                    break;
                }
                self.update_clvs(species, genes, gene_to_species)?;
                self.compute_likelihoods(species, genes, gene_to_species)?;
            }
        }
        Ok(self.sum_log_likelihood(genes))
    }

    /// Extract the ML reconciliation scenario.
    pub fn infer_ml_scenario(
        &mut self,
        species: &SpeciesTree,
        genes: &GeneTree,
        gene_to_species: &[usize],
    ) -> Result<Scenario> {
        if !self.kind.supports_scenarios() {
            return Err(VelellaError::InvalidInput(format!(
                "model {} does not support scenario extraction",
                self.kind
            )));
        }
        self.update_clvs(species, genes, gene_to_species)?;
        self.compute_likelihoods(species, genes, gene_to_species)?;
        let (root, species_root) = self.ml_root_pair(species, genes).ok_or_else(|| {
            VelellaError::Internal("no candidate root with positive likelihood".into())
        })?;
        let mut scenario = Scenario::new(2 * genes.subnode_count(), species.node_count());
        scenario.set_roots(root, species_root);
        match &self.state {
            ModelState::UndatedDl(model) => model.backtrace(
                species,
                genes,
                gene_to_species,
                root,
                true,
                species_root,
                &mut scenario,
            )?,
            ModelState::UndatedDtl(model) => model.backtrace(
                species,
                genes,
                gene_to_species,
                root,
                true,
                species_root,
                &mut scenario,
            )?,
            ModelState::SimpleDs(_) => unreachable!("rejected above"),
        }
        Ok(scenario)
    }

    /// Candidate virtual-root half-edges for the current mode.
    fn candidate_roots(&self, genes: &GeneTree) -> Vec<SubnodeId> {
        match (self.rooted, self.gene_root) {
            (true, Some(root)) => vec![root],
            _ => genes.candidate_roots(),
        }
    }

    /// Spread pending invalidations, then recompute stale CLVs from every
    /// candidate root, children strictly before parents.
    fn update_clvs(
        &mut self,
        species: &SpeciesTree,
        genes: &GeneTree,
        gene_to_species: &[usize],
    ) -> Result<()> {
        self.validity.mark_invalid_upward(genes);
        for root in self.candidate_roots(genes) {
            self.update_path(species, genes, gene_to_species, root)?;
            self.update_path(species, genes, gene_to_species, genes.back(root))?;
        }
        Ok(())
    }

    fn update_path(
        &mut self,
        species: &SpeciesTree,
        genes: &GeneTree,
        gene_to_species: &[usize],
        start: SubnodeId,
    ) -> Result<()> {
        // Collect the stale part of the subtree; a valid node implies a
        // valid subtree because invalidation spreads upward.
        let mut stale = Vec::new();
        let mut stack = vec![start];
        while let Some(subnode) = stack.pop() {
            if self.validity.is_valid(subnode) {
                continue;
            }
            stale.push(subnode);
            if !genes.is_leaf(subnode) {
                let (left, right) = genes.children(subnode, false);
                stack.push(left);
                stack.push(right);
            }
        }
        for &subnode in stale.iter().rev() {
            match &mut self.state {
                ModelState::UndatedDl(model) => {
                    model.update_clv(species, genes, gene_to_species, subnode)?
                }
                ModelState::UndatedDtl(model) => {
                    model.update_clv(species, genes, gene_to_species, subnode)?
                }
                ModelState::SimpleDs(model) => {
                    model.update_clv(genes, gene_to_species, subnode)?
                }
            }
            self.validity.set_valid(subnode);
        }
        Ok(())
    }

    /// Fill the virtual-root rows for every candidate root.
    fn compute_likelihoods(
        &mut self,
        species: &SpeciesTree,
        genes: &GeneTree,
        gene_to_species: &[usize],
    ) -> Result<()> {
        for root in self.candidate_roots(genes) {
            match &mut self.state {
                ModelState::UndatedDl(model) => {
                    model.compute_virtual_root(species, genes, gene_to_species, root)?
                }
                ModelState::UndatedDtl(model) => {
                    model.compute_virtual_root(species, genes, gene_to_species, root)?
                }
                ModelState::SimpleDs(model) => {
                    model.compute_virtual_root(genes, gene_to_species, root)?
                }
            }
        }
        Ok(())
    }

    /// Marginal likelihood of one virtual root.
    fn root_likelihood(&self, genes: &GeneTree, root: SubnodeId) -> R {
        match &self.state {
            ModelState::UndatedDl(model) => model.clv().row_sum(model.clv().virtual_row(root)),
            ModelState::UndatedDtl(model) => model.clv().row_sum(model.clv().virtual_row(root)),
            ModelState::SimpleDs(model) => model.root_likelihood(root + genes.subnode_count()),
        }
    }

    /// Sum of candidate-root marginals, as a log.
    fn sum_log_likelihood(&self, genes: &GeneTree) -> f64 {
        let mut total = R::zero();
        for root in self.candidate_roots(genes) {
            total += self.root_likelihood(genes, root);
        }
        total.ln()
    }

    /// The candidate root with the largest marginal.
    fn ml_root(&self, genes: &GeneTree) -> Option<SubnodeId> {
        let mut best: Option<(SubnodeId, R)> = None;
        for root in self.candidate_roots(genes) {
            let likelihood = self.root_likelihood(genes, root);
            match best {
                Some((_, best_likelihood)) if !(likelihood > best_likelihood) => {}
                _ => best = Some((root, likelihood)),
            }
        }
        best.map(|(root, _)| root)
    }

    /// The `(gene root, species root)` pair maximizing the per-species
    /// virtual-root entry.
    fn ml_root_pair(
        &self,
        species: &SpeciesTree,
        genes: &GeneTree,
    ) -> Option<(SubnodeId, usize)> {
        let mut best: Option<(SubnodeId, usize, R)> = None;
        for root in self.candidate_roots(genes) {
            for &e in species.post_order() {
                let value = match &self.state {
                    ModelState::UndatedDl(model) => {
                        model.clv().get(model.clv().virtual_row(root), e)
                    }
                    ModelState::UndatedDtl(model) => {
                        model.clv().get(model.clv().virtual_row(root), e)
                    }
                    ModelState::SimpleDs(model) => {
                        model.root_likelihood(root + genes.subnode_count())
                    }
                };
                if value.is_zero() {
                    continue;
                }
                match best {
                    Some((_, _, best_value)) if !(value > best_value) => {}
                    _ => best = Some((root, e, value)),
                }
            }
        }
        best.map(|(root, e, _)| (root, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::GeneSpeciesMap;
    use velella_core::ScaledReal;

    fn build(
        kind: RecModelKind,
        species_newick: &str,
        gene_newick: &str,
        pairs: &[(&str, &str)],
        rates: (f64, f64, f64),
    ) -> (SpeciesTree, GeneTree, Vec<usize>, RecModel<ScaledReal>) {
        let species = SpeciesTree::from_newick(species_newick).unwrap();
        let genes = GeneTree::from_newick(gene_newick).unwrap();
        let map = GeneSpeciesMap::from_pairs(pairs.iter().copied());
        let g2s = map.resolve(&genes, &species).unwrap();
        let input = RatesInput::global(species.node_count(), rates.0, rates.1, rates.2);
        let model = RecModel::new(kind, &species, &genes, &input, false, false, 3).unwrap();
        (species, genes, g2s, model)
    }

    #[test]
    fn model_names_parse() {
        assert_eq!(
            "UndatedDL".parse::<RecModelKind>().unwrap(),
            RecModelKind::UndatedDl
        );
        assert_eq!(
            "UndatedDTL".parse::<RecModelKind>().unwrap(),
            RecModelKind::UndatedDtl
        );
        assert_eq!(
            "SimpleDS".parse::<RecModelKind>().unwrap(),
            RecModelKind::SimpleDs
        );
        assert!("DatedDL".parse::<RecModelKind>().is_err());
        assert_eq!(RecModelKind::UndatedDtl.to_string(), "UndatedDTL");
    }

    #[test]
    fn dl_likelihood_is_finite_and_negative() {
        let (species, genes, g2s, mut model) = build(
            RecModelKind::UndatedDl,
            "((A,B),C);",
            "((a,b),c);",
            &[("a", "A"), ("b", "B"), ("c", "C")],
            (0.1, 0.1, 0.0),
        );
        let ll = model
            .compute_log_likelihood(&species, &genes, &g2s)
            .unwrap();
        assert!(ll.is_finite());
        assert!(ll < 0.0);
    }

    #[test]
    fn dtl_likelihood_is_finite() {
        let (species, genes, g2s, mut model) = build(
            RecModelKind::UndatedDtl,
            "((A,B),(C,D));",
            "((a,c),(b,d));",
            &[("a", "A"), ("b", "B"), ("c", "C"), ("d", "D")],
            (0.1, 0.1, 0.1),
        );
        let ll = model
            .compute_log_likelihood(&species, &genes, &g2s)
            .unwrap();
        assert!(ll.is_finite(), "DTL must never return NaN or -inf, got {}", ll);
    }

    #[test]
    fn simple_ds_likelihood_is_finite() {
        let (species, genes, g2s, mut model) = build(
            RecModelKind::SimpleDs,
            "((A,B),C);",
            "((a,b),c);",
            &[("a", "A"), ("b", "B"), ("c", "C")],
            (0.5, 0.0, 0.0),
        );
        let ll = model
            .compute_log_likelihood(&species, &genes, &g2s)
            .unwrap();
        assert!(ll.is_finite());
    }

    #[test]
    fn repeat_evaluation_is_bit_identical() {
        let (species, genes, g2s, mut model) = build(
            RecModelKind::UndatedDl,
            "((A,B),C);",
            "((a,b),c);",
            &[("a", "A"), ("b", "B"), ("c", "C")],
            (0.1, 0.1, 0.0),
        );
        let first = model
            .compute_log_likelihood(&species, &genes, &g2s)
            .unwrap();
        for _ in 0..10 {
            let again = model
                .compute_log_likelihood(&species, &genes, &g2s)
                .unwrap();
            assert_eq!(first.to_bits(), again.to_bits());
        }
    }

    #[test]
    fn rate_change_invalidates_and_changes_likelihood() {
        let (species, genes, g2s, mut model) = build(
            RecModelKind::UndatedDl,
            "((A,B),C);",
            "((a,b),c);",
            &[("a", "A"), ("b", "B"), ("c", "C")],
            (0.1, 0.1, 0.0),
        );
        let before = model
            .compute_log_likelihood(&species, &genes, &g2s)
            .unwrap();
        let input = RatesInput::global(species.node_count(), 0.4, 0.4, 0.0);
        model.set_rates(&species, &input, false).unwrap();
        let after = model
            .compute_log_likelihood(&species, &genes, &g2s)
            .unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn simple_ds_refuses_scenarios() {
        let (species, genes, g2s, mut model) = build(
            RecModelKind::SimpleDs,
            "((A,B),C);",
            "((a,b),c);",
            &[("a", "A"), ("b", "B"), ("c", "C")],
            (0.5, 0.0, 0.0),
        );
        assert!(model.infer_ml_scenario(&species, &genes, &g2s).is_err());
    }

    #[test]
    fn rooted_mode_requires_rooted_input() {
        let species = SpeciesTree::from_newick("((A,B),C);").unwrap();
        let genes = GeneTree::from_newick("(a,b,(c,c2));").unwrap();
        let input = RatesInput::global(species.node_count(), 0.1, 0.1, 0.0);
        let result: Result<RecModel<ScaledReal>> =
            RecModel::new(RecModelKind::UndatedDl, &species, &genes, &input, true, false, 3);
        assert!(result.is_err());
    }
}
