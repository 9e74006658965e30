//! The undated duplication–transfer–loss reconciliation model.
//!
//! Transfers couple every species branch to every other through a mean
//! "transfer sum" aggregate. Transfers into the receiver's own ancestry
//! are forbidden: each receiver subtracts an ancestral correction
//! accumulated from the root down. Because the transfer-loss and
//! duplication-loss terms reference the cell being computed, extinction
//! probabilities and every CLV row are refreshed by a fixed number of
//! sweeps over the species post-order, recomputing the aggregates after
//! each sweep; the recurrence contracts under normalized rates.

use crate::clv::ClvTable;
use crate::gene_tree::{GeneTree, SubnodeId};
use crate::rates::{BranchRates, RatesInput};
use crate::scenario::{EventKind, Scenario};
use crate::species_tree::SpeciesTree;
use crate::undated_dl::argmax;
use velella_core::{ExtendedReal, Result, VelellaError};

/// State of one UndatedDTL instance.
#[derive(Debug, Clone)]
pub(crate) struct DtlModel<R: ExtendedReal> {
    rates: BranchRates,
    /// Fixed-point sweeps per refresh.
    iterations: usize,
    /// Extinction probability per species branch.
    ue: Vec<R>,
    /// Mean transfer-extinction sum and its ancestral corrections.
    te_sum: R,
    te_correction: Vec<R>,
    clv: ClvTable<R>,
    /// Per-row mean transfer sums and ancestral corrections.
    t_sum: Vec<R>,
    t_correction: Vec<Vec<R>>,
}

impl<R: ExtendedReal> DtlModel<R> {
    pub fn new(
        species: &SpeciesTree,
        subnode_count: usize,
        rates: &RatesInput,
        no_dup: bool,
        iterations: usize,
    ) -> Result<Self> {
        if iterations == 0 {
            return Err(VelellaError::Config(
                "DTL iteration count must be at least 1".into(),
            ));
        }
        let species_count = species.node_count();
        let rows = 2 * subnode_count;
        let mut model = Self {
            rates: BranchRates::normalize(rates, species_count, true, no_dup)?,
            iterations,
            ue: vec![R::zero(); species_count],
            te_sum: R::zero(),
            te_correction: vec![R::zero(); species_count],
            clv: ClvTable::new(subnode_count, species_count),
            t_sum: vec![R::zero(); rows],
            t_correction: vec![vec![R::zero(); species_count]; rows],
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
        self.rates = BranchRates::normalize(rates, species.node_count(), true, no_dup)?;
        self.compute_extinction(species)
    }

    pub fn clv(&self) -> &ClvTable<R> {
        &self.clv
    }

    fn corrected_transfer_sum(&self, row: usize, e: usize) -> R {
        self.t_sum[row].saturating_sub(self.t_correction[row][e])
    }

    fn corrected_extinction_sum(&self, e: usize) -> R {
        self.te_sum.saturating_sub(self.te_correction[e])
    }

    /// Iterate the extinction fixed point
    /// `uE = PL + PD·uE² + (Te − Ae)·uE (+ PS·uE_f·uE_h)`.
    fn compute_extinction(&mut self, species: &SpeciesTree) -> Result<()> {
        let species_count = species.node_count();
        self.ue = vec![R::zero(); species_count];
        self.te_sum = R::zero();
        self.te_correction = vec![R::zero(); species_count];
        for _ in 0..self.iterations {
            for &e in species.post_order() {
                let node = species.node(e);
                let mut proba = R::from_f64(self.rates.pl[e]);
                proba += (self.ue[e] * self.ue[e]).scale_mul(self.rates.pd[e]);
                proba += self.corrected_extinction_sum(e) * self.ue[e];
                if let (Some(f), Some(h)) = (node.left, node.right) {
                    proba += (self.ue[f] * self.ue[h]).scale_mul(self.rates.ps[e]);
                }
                if !proba.is_probability() {
                    return Err(VelellaError::Internal(format!(
                        "extinction probability out of range on species branch {}: {:?}",
                        e, proba
                    )));
                }
                self.ue[e] = proba;
            }
            let Self {
                rates,
                ue,
                te_sum,
                te_correction,
                ..
            } = self;
            update_transfer_sums(species, &rates.pt, ue, te_sum, te_correction);
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
        self.refresh_row(species, genes, gene_to_species, subnode, subnode, false)
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
        self.refresh_row(species, genes, gene_to_species, root, row, true)
    }

    fn refresh_row(
        &mut self,
        species: &SpeciesTree,
        genes: &GeneTree,
        gene_to_species: &[usize],
        subnode: SubnodeId,
        row: usize,
        is_virtual_root: bool,
    ) -> Result<()> {
        self.clv.clear_row(row);
        self.t_sum[row] = R::zero();
        for value in &mut self.t_correction[row] {
            *value = R::zero();
        }
        for _ in 0..self.iterations {
            for &e in species.post_order() {
                let value = self.probability(
                    species,
                    genes,
                    gene_to_species,
                    subnode,
                    row,
                    e,
                    is_virtual_root,
                )?;
                self.clv.set(row, e, value);
            }
            let Self {
                rates,
                clv,
                t_sum,
                t_correction,
                ..
            } = self;
            update_transfer_sums(
                species,
                &rates.pt,
                clv.row(row),
                &mut t_sum[row],
                &mut t_correction[row],
            );
        }
        Ok(())
    }

    /// One cell of the recurrence; reads the previous sweep's value of the
    /// same cell for the TL and DL self-referential terms.
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

        if species_leaf && gene_leaf && gene_to_species[subnode] == e {
            return Ok(R::from_f64(self.rates.ps[e]));
        }

        let previous = self.clv.get(row, e);
        let mut proba = R::zero();
        if !gene_leaf {
            let (x, y) = genes.children(subnode, is_virtual_root);
            if let (Some(f), Some(h)) = (node.left, node.right) {
                let cross = self.clv.get(x, f) * self.clv.get(y, h)
                    + self.clv.get(x, h) * self.clv.get(y, f);
                proba += cross.scale_mul(self.rates.ps[e]);
            }
            proba += (self.clv.get(x, e) * self.clv.get(y, e)).scale_mul(self.rates.pd[e]);
            // One child transfers away, the other stays.
            proba += self.corrected_transfer_sum(x, e) * self.clv.get(y, e);
            proba += self.corrected_transfer_sum(y, e) * self.clv.get(x, e);
        }
        if let (Some(f), Some(h)) = (node.left, node.right) {
            let sl = self.clv.get(row, f) * self.ue[h] + self.clv.get(row, h) * self.ue[f];
            proba += sl.scale_mul(self.rates.ps[e]);
        }
        // Transfer-loss: the lineage either stays here while a transferred
        // copy dies, or survives elsewhere while the copy here dies.
        proba += previous * self.corrected_extinction_sum(e);
        proba += self.corrected_transfer_sum(row, e) * self.ue[e];
        // Duplication-loss.
        proba += (previous * self.ue[e]).scale_mul(2.0 * self.rates.pd[e]);
        if !proba.is_probability() {
            return Err(VelellaError::Internal(format!(
                "CLV out of [0,1] at gene row {}, species {}: {:?}",
                row, e, proba
            )));
        }
        Ok(proba)
    }

    /// Best transfer destination for a CLV row received at `e`: the
    /// species branch maximizing `PT·uq`, excluding `e`'s own ancestry
    /// and blacklisted pairs.
    fn best_transfer_dest(
        &self,
        species: &SpeciesTree,
        scenario: &Scenario,
        row: usize,
        e: usize,
    ) -> Option<usize> {
        let mut best: Option<(usize, R)> = None;
        for &d in species.post_order() {
            if species.is_ancestor_or_self(d, e) || scenario.is_blacklisted(row, d) {
                continue;
            }
            let mass = self.clv.get(row, d).scale_mul(self.rates.pt[d]);
            if mass.is_zero() {
                continue;
            }
            match best {
                Some((_, best_mass)) if !(mass > best_mass) => {}
                _ => best = Some((d, mass)),
            }
        }
        best.map(|(d, _)| d)
    }

    /// Extract the most likely event chain below `(subnode, e)`.
    ///
    /// Candidate order: S-left, S-right, D, SL-left, SL-right, T-left,
    /// T-right, TL. Every visited `(row, species)` pair is blacklisted so
    /// transfer-loss chains cannot cycle.
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

        if species_leaf && gene_leaf && gene_to_species[subnode] == e {
            scenario.add_event(EventKind::None, row, e, None);
            return Ok(());
        }
        scenario.blacklist_pair(row, e);

        let mut values = [R::zero(); 8];
        let mut children = None;
        let mut dest_left = None;
        let mut dest_right = None;
        if !gene_leaf {
            let (x, y) = genes.children(subnode, is_virtual_root);
            children = Some((x, y));
            if let (Some(f), Some(h)) = (node.left, node.right) {
                values[0] = (self.clv.get(x, f) * self.clv.get(y, h)).scale_mul(self.rates.ps[e]);
                values[1] = (self.clv.get(x, h) * self.clv.get(y, f)).scale_mul(self.rates.ps[e]);
            }
            values[2] = (self.clv.get(x, e) * self.clv.get(y, e)).scale_mul(self.rates.pd[e]);
            dest_left = self.best_transfer_dest(species, scenario, x, e);
            if dest_left.is_some() {
                values[5] = self.corrected_transfer_sum(x, e) * self.clv.get(y, e);
            }
            dest_right = self.best_transfer_dest(species, scenario, y, e);
            if dest_right.is_some() {
                values[6] = self.corrected_transfer_sum(y, e) * self.clv.get(x, e);
            }
        }
        if let (Some(f), Some(h)) = (node.left, node.right) {
            values[3] = (self.clv.get(row, f) * self.ue[h]).scale_mul(self.rates.ps[e]);
            values[4] = (self.clv.get(row, h) * self.ue[f]).scale_mul(self.rates.ps[e]);
        }
        let dest_tl = self.best_transfer_dest(species, scenario, row, e);
        if dest_tl.is_some() {
            values[7] = self.corrected_transfer_sum(row, e) * self.ue[e];
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
            4 => {
                scenario.add_event(EventKind::SL, row, e, None);
                self.backtrace(species, genes, gene_to_species, subnode, is_virtual_root, h, scenario)?;
            }
            5 => {
                let (x, y) = children.expect("transfer requires gene children");
                let dest = dest_left.expect("transfer candidate implies a destination");
                scenario.add_event(EventKind::T, row, e, Some(dest));
                self.backtrace(species, genes, gene_to_species, x, false, dest, scenario)?;
                self.backtrace(species, genes, gene_to_species, y, false, e, scenario)?;
            }
            6 => {
                let (x, y) = children.expect("transfer requires gene children");
                let dest = dest_right.expect("transfer candidate implies a destination");
                scenario.add_event(EventKind::T, row, e, Some(dest));
                self.backtrace(species, genes, gene_to_species, y, false, dest, scenario)?;
                self.backtrace(species, genes, gene_to_species, x, false, e, scenario)?;
            }
            _ => {
                let dest = dest_tl.expect("transfer-loss candidate implies a destination");
                scenario.add_event(EventKind::TL, row, e, Some(dest));
                self.backtrace(species, genes, gene_to_species, subnode, is_virtual_root, dest, scenario)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn extinction(&self) -> &[R] {
        &self.ue
    }
}

/// Recompute a mean transfer sum and its ancestral corrections from the
/// current per-branch probabilities.
///
/// The correction of branch `e` accumulates `PT·p` along the path from the
/// root down to `e` inclusive, so `sum − correction[e]` approximates
/// transfers from any donor that is not an ancestor of `e`.
fn update_transfer_sums<R: ExtendedReal>(
    species: &SpeciesTree,
    pt: &[f64],
    probabilities: &[R],
    sum: &mut R,
    correction: &mut [R],
) {
    // Reverse post-order puts parents before children.
    for &e in species.post_order().iter().rev() {
        correction[e] = probabilities[e].scale_mul(pt[e]);
        if let Some(parent) = species.node(e).parent {
            let inherited = correction[parent];
            correction[e] += inherited;
        }
    }
    let species_count = species.node_count() as f64;
    *sum = R::zero();
    for &e in species.post_order() {
        correction[e] = correction[e].scale_div(species_count);
        *sum += probabilities[e].scale_mul(pt[e]);
    }
    *sum = sum.scale_div(species_count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use velella_core::ScaledReal;

    fn setup() -> (SpeciesTree, GeneTree, Vec<usize>) {
        let species = SpeciesTree::from_newick("((A,B),(C,D));").unwrap();
        let genes = GeneTree::from_newick("((a,c),(b,d));").unwrap();
        let map = crate::mapping::GeneSpeciesMap::from_pairs([
            ("a", "A"),
            ("b", "B"),
            ("c", "C"),
            ("d", "D"),
        ]);
        let gene_to_species = map.resolve(&genes, &species).unwrap();
        (species, genes, gene_to_species)
    }

    fn update_all<R: ExtendedReal>(
        model: &mut DtlModel<R>,
        species: &SpeciesTree,
        genes: &GeneTree,
        g2s: &[usize],
    ) {
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
        for root in genes.candidate_roots() {
            model.compute_virtual_root(species, genes, g2s, root).unwrap();
        }
    }

    #[test]
    fn extinction_stays_in_bounds() {
        let (species, genes, _) = setup();
        let rates = RatesInput::global(species.node_count(), 0.1, 0.2, 0.1);
        let model: DtlModel<ScaledReal> =
            DtlModel::new(&species, genes.subnode_count(), &rates, false, 3).unwrap();
        for &ue in model.extinction() {
            assert!(ue.is_probability());
            assert!(!ue.is_zero());
        }
    }

    #[test]
    fn transfer_sums_respect_ancestry() {
        let (species, _, _) = setup();
        let mut probabilities = vec![ScaledReal::new(0.5); species.node_count()];
        probabilities[species.root()] = ScaledReal::new(0.9);
        let pt = vec![0.1; species.node_count()];
        let mut sum = ScaledReal::zero();
        let mut correction = vec![ScaledReal::zero(); species.node_count()];
        update_transfer_sums(&species, &pt, &probabilities, &mut sum, &mut correction);
        // The root's correction equals the full contribution of itself;
        // a leaf's correction includes the whole root-to-leaf path and so
        // cannot be smaller than the root's.
        let leaf = species.leaf_id("A").unwrap();
        assert!(correction[leaf] >= correction[species.root()]);
        // Every branch has donors outside its own ancestry, so the
        // corrected sum stays strictly positive.
        for &e in species.post_order() {
            assert!(!sum.saturating_sub(correction[e]).is_zero());
        }
    }

    #[test]
    fn clvs_are_probabilities_after_iteration() {
        let (species, genes, g2s) = setup();
        let rates = RatesInput::global(species.node_count(), 0.1, 0.1, 0.15);
        let mut model: DtlModel<ScaledReal> =
            DtlModel::new(&species, genes.subnode_count(), &rates, false, 3).unwrap();
        update_all(&mut model, &species, &genes, &g2s);
        for row in 0..2 * genes.subnode_count() {
            for &e in species.post_order() {
                assert!(model.clv().get(row, e).is_probability());
            }
        }
    }

    #[test]
    fn zero_transfer_rate_behaves_like_dl() {
        let (species, genes, g2s) = setup();
        let rates = RatesInput::global(species.node_count(), 0.1, 0.1, 0.0);
        let mut model: DtlModel<ScaledReal> =
            DtlModel::new(&species, genes.subnode_count(), &rates, false, 3).unwrap();
        update_all(&mut model, &species, &genes, &g2s);
        // No transfer mass anywhere.
        for row in 0..2 * genes.subnode_count() {
            for &e in species.post_order() {
                assert!(model.corrected_transfer_sum(row, e).is_zero());
            }
        }
    }

    #[test]
    fn more_iterations_monotonically_accumulate() {
        let (species, genes, g2s) = setup();
        let rates = RatesInput::global(species.node_count(), 0.1, 0.1, 0.1);
        let mut coarse: DtlModel<ScaledReal> =
            DtlModel::new(&species, genes.subnode_count(), &rates, false, 1).unwrap();
        let mut fine: DtlModel<ScaledReal> =
            DtlModel::new(&species, genes.subnode_count(), &rates, false, 4).unwrap();
        update_all(&mut coarse, &species, &genes, &g2s);
        update_all(&mut fine, &species, &genes, &g2s);
        let root = genes.candidate_roots()[0];
        let coarse_sum = coarse.clv().row_sum(coarse.clv().virtual_row(root));
        let fine_sum = fine.clv().row_sum(fine.clv().virtual_row(root));
        // Each extra sweep only adds event paths.
        assert!(fine_sum >= coarse_sum);
    }
}
