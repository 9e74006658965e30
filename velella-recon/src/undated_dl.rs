//! The undated duplication–loss reconciliation model.
//!
//! Transfers are disallowed, which permits a closed-form treatment of the
//! duplication–loss self-reference: the recurrence divides by
//! `1 − 2·PD·uE` instead of iterating, and the extinction probabilities
//! come from the stable root of a per-branch quadratic.

use crate::clv::ClvTable;
use crate::gene_tree::{GeneTree, SubnodeId};
use crate::rates::{BranchRates, RatesInput};
use crate::scenario::{EventKind, Scenario};
use crate::species_tree::SpeciesTree;
use velella_core::{ExtendedReal, Result, VelellaError};

/// State of one UndatedDL instance.
#[derive(Debug, Clone)]
pub(crate) struct DlModel<R: ExtendedReal> {
    rates: BranchRates,
    /// Extinction probability per species branch.
    ue: Vec<f64>,
    clv: ClvTable<R>,
}

impl<R: ExtendedReal> DlModel<R> {
    pub fn new(
        species: &SpeciesTree,
        subnode_count: usize,
        rates: &RatesInput,
        no_dup: bool,
    ) -> Result<Self> {
        let mut model = Self {
            rates: BranchRates::normalize(rates, species.node_count(), false, no_dup)?,
            ue: Vec::new(),
            clv: ClvTable::new(subnode_count, species.node_count()),
        };
        model.compute_extinction(species)?;
        Ok(model)
    }

    pub fn set_rates(
        &mut self,
        species: &SpeciesTree,
        rates: &RatesInput,
        no_dup: bool,
    ) -> Result<()> {
        self.rates = BranchRates::normalize(rates, species.node_count(), false, no_dup)?;
        self.compute_extinction(species)
    }

    pub fn clv(&self) -> &ClvTable<R> {
        &self.clv
    }

    /// Solve `uE[e] = PL + PD·uE² (+ PS·uE[f]·uE[h])` per branch in
    /// species post-order, taking the stable quadratic root.
    fn compute_extinction(&mut self, species: &SpeciesTree) -> Result<()> {
        self.ue = vec![0.0; species.node_count()];
        for &e in species.post_order() {
            let node = species.node(e);
            let a = self.rates.pd[e];
            let mut c = self.rates.pl[e];
            if let (Some(f), Some(h)) = (node.left, node.right) {
                c += self.rates.ps[e] * self.ue[f] * self.ue[h];
            }
            let extinction = solve_stable_quadratic(a, c);
            if !(0.0..=1.0 + 1e-9).contains(&extinction) || extinction.is_nan() {
                return Err(VelellaError::Internal(format!(
                    "extinction probability {} out of range on species branch {}",
                    extinction, e
                )));
            }
            self.ue[e] = extinction;
        }
        Ok(())
    }

    /// Recompute the CLV row of one observed half-edge.
    pub fn update_clv(
        &mut self,
        species: &SpeciesTree,
        genes: &GeneTree,
        gene_to_species: &[usize],
        subnode: SubnodeId,
    ) -> Result<()> {
        for &e in species.post_order() {
            let value = self.probability(species, genes, gene_to_species, subnode, subnode, e, false)?;
            self.clv.set(subnode, e, value);
        }
        Ok(())
    }

    /// Fill the virtual-root row for the edge `root`–`back(root)`.
    pub fn compute_virtual_root(
        &mut self,
        species: &SpeciesTree,
        genes: &GeneTree,
        gene_to_species: &[usize],
        root: SubnodeId,
    ) -> Result<()> {
        let row = self.clv.virtual_row(root);
        for &e in species.post_order() {
            let value = self.probability(species, genes, gene_to_species, root, row, e, true)?;
            self.clv.set(row, e, value);
        }
        Ok(())
    }

    /// One cell of the recurrence. `row` is the CLV row being filled
    /// (`subnode` itself, or its virtual row).
    fn probability(
        &self,
        species: &SpeciesTree,
        genes: &GeneTree,
        gene_to_species: &[usize],
        subnode: SubnodeId,
        row: usize,
        e: usize,
        is_virtual_root: bool,
    ) -> Result<R> {
        let gene_leaf = !is_virtual_root && genes.is_leaf(subnode);
        let node = species.node(e);
        let species_leaf = node.is_leaf();

        if species_leaf && gene_leaf {
            return Ok(if gene_to_species[subnode] == e {
                R::from_f64(self.rates.ps[e])
            } else {
                R::zero()
            });
        }

        let mut proba = R::zero();
        if !gene_leaf {
            let (x, y) = genes.children(subnode, is_virtual_root);
            if let (Some(f), Some(h)) = (node.left, node.right) {
                let cross = self.clv.get(x, f) * self.clv.get(y, h)
                    + self.clv.get(x, h) * self.clv.get(y, f);
                proba += cross.scale_mul(self.rates.ps[e]);
            }
            proba += (self.clv.get(x, e) * self.clv.get(y, e)).scale_mul(self.rates.pd[e]);
        }
        if let (Some(f), Some(h)) = (node.left, node.right) {
            // Speciation followed by loss of the sister lineage.
            let sl = self.clv.get(row, f).scale_mul(self.ue[h])
                + self.clv.get(row, h).scale_mul(self.ue[f]);
            proba += sl.scale_mul(self.rates.ps[e]);
        }
        // Closed form for the duplication-then-loss self reference.
        let proba = proba.scale_div(1.0 - 2.0 * self.rates.pd[e] * self.ue[e]);
        if !proba.is_probability() {
            return Err(VelellaError::Internal(format!(
                "CLV out of [0,1] at gene row {}, species {}: {:?}",
                row, e, proba
            )));
        }
        Ok(proba)
    }

    /// Extract the most likely event chain below `(subnode, e)`.
    ///
    /// Candidates are ranked in the fixed order S-left, S-right, D,
    /// SL-left, SL-right; ties resolve to the earliest.
    pub fn backtrace(
        &self,
        species: &SpeciesTree,
        genes: &GeneTree,
        gene_to_species: &[usize],
        subnode: SubnodeId,
        is_virtual_root: bool,
        e: usize,
        scenario: &mut Scenario,
    ) -> Result<()> {
        let row = if is_virtual_root {
            self.clv.virtual_row(subnode)
        } else {
            subnode
        };
        let gene_leaf = !is_virtual_root && genes.is_leaf(subnode);
        let node = species.node(e);
        let species_leaf = node.is_leaf();

        if species_leaf && gene_leaf {
            if gene_to_species[subnode] == e {
                scenario.add_event(EventKind::None, row, e, None);
                return Ok(());
            }
            return Err(VelellaError::Internal(
                "backtrace reached a mismatched leaf pair".into(),
            ));
        }

        let mut values = [R::zero(); 5];
        let mut children = None;
        if !gene_leaf {
            let (x, y) = genes.children(subnode, is_virtual_root);
            children = Some((x, y));
            if let (Some(f), Some(h)) = (node.left, node.right) {
                values[0] = (self.clv.get(x, f) * self.clv.get(y, h)).scale_mul(self.rates.ps[e]);
                values[1] = (self.clv.get(x, h) * self.clv.get(y, f)).scale_mul(self.rates.ps[e]);
            }
            values[2] = (self.clv.get(x, e) * self.clv.get(y, e)).scale_mul(self.rates.pd[e]);
        }
        if let (Some(f), Some(h)) = (node.left, node.right) {
            values[3] = self.clv.get(row, f).scale_mul(self.ue[h] * self.rates.ps[e]);
            values[4] = self.clv.get(row, h).scale_mul(self.ue[f] * self.rates.ps[e]);
        }

        let best = argmax(&values);
        if values[best].is_zero() {
            return Err(VelellaError::Internal(format!(
                "backtrace found no positive event at gene row {}, species {}",
                row, e
            )));
        }
        let (f, h) = (node.left.unwrap_or(0), node.right.unwrap_or(0));
        match best {
            0 => {
                let (x, y) = children.expect("speciation requires gene children");
                scenario.add_event(EventKind::S, row, e, None);
                self.backtrace(species, genes, gene_to_species, x, false, f, scenario)?;
                self.backtrace(species, genes, gene_to_species, y, false, h, scenario)?;
            }
            1 => {
                let (x, y) = children.expect("speciation requires gene children");
                scenario.add_event(EventKind::S, row, e, None);
                self.backtrace(species, genes, gene_to_species, x, false, h, scenario)?;
                self.backtrace(species, genes, gene_to_species, y, false, f, scenario)?;
            }
            2 => {
                let (x, y) = children.expect("duplication requires gene children");
                scenario.add_event(EventKind::D, row, e, None);
                self.backtrace(species, genes, gene_to_species, x, false, e, scenario)?;
                self.backtrace(species, genes, gene_to_species, y, false, e, scenario)?;
            }
            3 => {
                scenario.add_event(EventKind::SL, row, e, None);
                self.backtrace(species, genes, gene_to_species, subnode, is_virtual_root, f, scenario)?;
            }
            _ => {
                scenario.add_event(EventKind::SL, row, e, None);
                self.backtrace(species, genes, gene_to_species, subnode, is_virtual_root, h, scenario)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn extinction(&self) -> &[f64] {
        &self.ue
    }
}

/// Stable root of `a·x² − x + c = 0`: `2c / (1 + sqrt(1 − 4ac))`.
fn solve_stable_quadratic(a: f64, c: f64) -> f64 {
    2.0 * c / (1.0 + (1.0 - 4.0 * a * c).sqrt())
}

/// Index of the largest value; earliest wins on ties.
pub(crate) fn argmax<R: ExtendedReal>(values: &[R]) -> usize {
    let mut best = 0;
    for (i, value) in values.iter().enumerate().skip(1) {
        if *value > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use velella_core::ScaledReal;

    fn setup() -> (SpeciesTree, GeneTree, Vec<usize>) {
        let species = SpeciesTree::from_newick("((A,B),C);").unwrap();
        let genes = GeneTree::from_newick("((a,b),c);").unwrap();
        let map = crate::mapping::GeneSpeciesMap::from_pairs([("a", "A"), ("b", "B"), ("c", "C")]);
        let gene_to_species = map.resolve(&genes, &species).unwrap();
        (species, genes, gene_to_species)
    }

    fn update_all<R: ExtendedReal>(
        model: &mut DlModel<R>,
        species: &SpeciesTree,
        genes: &GeneTree,
        g2s: &[usize],
    ) {
        // Leaf rows first, then inner rows in an order where children come
        // first: repeat passes until a full post-order is covered.
        for root in genes.candidate_roots() {
            for start in [root, genes.back(root)] {
                let mut order = Vec::new();
                let mut stack = vec![start];
                while let Some(id) = stack.pop() {
                    order.push(id);
                    if !genes.is_leaf(id) {
                        let (l, r) = genes.children(id, false);
                        stack.push(l);
                        stack.push(r);
                    }
                }
                for &id in order.iter().rev() {
                    model.update_clv(species, genes, g2s, id).unwrap();
                }
            }
        }
    }

    #[test]
    fn extinction_probabilities_in_bounds() {
        let (species, genes, _) = setup();
        let rates = RatesInput::global(species.node_count(), 0.1, 0.1, 0.0);
        let model: DlModel<f64> =
            DlModel::new(&species, genes.subnode_count(), &rates, false).unwrap();
        for &ue in model.extinction() {
            assert!((0.0..=1.0).contains(&ue), "uE = {}", ue);
        }
        // A leaf with no loss pressure would never go extinct; with loss
        // it must have positive extinction probability.
        assert!(model.extinction().iter().all(|&ue| ue > 0.0));
    }

    #[test]
    fn no_dup_extinction_is_linear_solution() {
        let (species, genes, _) = setup();
        let rates = RatesInput::global(species.node_count(), 0.4, 0.3, 0.0);
        let model: DlModel<f64> =
            DlModel::new(&species, genes.subnode_count(), &rates, true).unwrap();
        // With PD = 0 the leaf equation degenerates to uE = PL.
        let leaf = species.leaf_id("A").unwrap();
        assert!((model.extinction()[leaf] - 0.3 / 1.3).abs() < 1e-12);
    }

    #[test]
    fn leaf_clvs_match_mapping() {
        let (species, genes, g2s) = setup();
        let rates = RatesInput::global(species.node_count(), 0.1, 0.1, 0.0);
        let mut model: DlModel<f64> =
            DlModel::new(&species, genes.subnode_count(), &rates, false).unwrap();
        update_all(&mut model, &species, &genes, &g2s);
        for leaf in genes.leaf_subnodes() {
            let mapped = g2s[leaf];
            for &e in species.post_order() {
                let value = model.clv().get(leaf, e);
                if e == mapped {
                    assert!(value > 0.0, "mapped species entry must be positive");
                } else if species.node(e).is_leaf() {
                    assert_eq!(value, 0.0, "unmapped species leaf entry must be zero");
                }
            }
        }
    }

    #[test]
    fn clv_values_are_probabilities() {
        let (species, genes, g2s) = setup();
        let rates = RatesInput::global(species.node_count(), 0.2, 0.1, 0.0);
        let mut model: DlModel<ScaledReal> =
            DlModel::new(&species, genes.subnode_count(), &rates, false).unwrap();
        update_all(&mut model, &species, &genes, &g2s);
        for row in 0..genes.subnode_count() {
            for &e in species.post_order() {
                assert!(model.clv().get(row, e).is_probability());
            }
        }
    }

    #[test]
    fn scaled_and_f64_agree_on_small_trees() {
        let (species, genes, g2s) = setup();
        let rates = RatesInput::global(species.node_count(), 0.15, 0.1, 0.0);
        let mut plain: DlModel<f64> =
            DlModel::new(&species, genes.subnode_count(), &rates, false).unwrap();
        let mut scaled: DlModel<ScaledReal> =
            DlModel::new(&species, genes.subnode_count(), &rates, false).unwrap();
        update_all(&mut plain, &species, &genes, &g2s);
        update_all(&mut scaled, &species, &genes, &g2s);
        for row in 0..genes.subnode_count() {
            for &e in species.post_order() {
                let a = plain.clv().get(row, e);
                let b = scaled.clv().get(row, e).to_f64();
                assert!((a - b).abs() < 1e-12, "row {} species {}: {} vs {}", row, e, a, b);
            }
        }
    }
}
