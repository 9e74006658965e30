//! The no-loss duplication–speciation model.
//!
//! When loss is disallowed the species dimension of the CLV collapses:
//! each gene node only needs its probability, the set of species its
//! subtree covers, and its gene count. Speciation applies when the child
//! clades are disjoint, duplication otherwise, each weighted by the count
//! of orderings that realize it. Likelihood-only: no scenario backtrace.

use std::collections::BTreeSet;

use crate::gene_tree::{GeneTree, SubnodeId};
use crate::rates::RatesInput;
use velella_core::{ExtendedReal, Result, VelellaError};

#[derive(Debug, Clone)]
pub(crate) struct DsClv<R: ExtendedReal> {
    pub proba: R,
    pub clade: BTreeSet<usize>,
    pub genes_count: u32,
}

impl<R: ExtendedReal> Default for DsClv<R> {
    fn default() -> Self {
        Self {
            proba: R::zero(),
            clade: BTreeSet::new(),
            genes_count: 0,
        }
    }
}

/// State of one SimpleDS instance.
#[derive(Debug, Clone)]
pub(crate) struct DsModel<R: ExtendedReal> {
    ps: f64,
    pd: f64,
    clvs: Vec<DsClv<R>>,
}

impl<R: ExtendedReal> DsModel<R> {
    pub fn new(subnode_count: usize, rates: &RatesInput) -> Result<Self> {
        let mut model = Self {
            ps: 0.0,
            pd: 0.0,
            clvs: vec![DsClv::default(); 2 * subnode_count],
        };
        model.set_rates(rates)?;
        Ok(model)
    }

    /// Only the duplication rate is free; speciation has implicit weight 1.
    pub fn set_rates(&mut self, rates: &RatesInput) -> Result<()> {
        let dup = *rates.dup.first().ok_or_else(|| {
            VelellaError::InvalidInput("SimpleDS needs a duplication rate".into())
        })?;
        if !dup.is_finite() || dup < 0.0 {
            return Err(VelellaError::InvalidInput(format!(
                "duplication rate {} is not a finite non-negative number",
                dup
            )));
        }
        let sum = dup + 1.0;
        self.pd = dup / sum;
        self.ps = 1.0 / sum;
        Ok(())
    }

    pub fn root_likelihood(&self, virtual_row: usize) -> R {
        self.clvs[virtual_row].proba
    }

    pub fn update_clv(
        &mut self,
        genes: &GeneTree,
        gene_to_species: &[usize],
        subnode: SubnodeId,
    ) -> Result<()> {
        self.compute(genes, gene_to_species, subnode, subnode, false)
    }

    pub fn compute_virtual_root(
        &mut self,
        genes: &GeneTree,
        gene_to_species: &[usize],
        root: SubnodeId,
    ) -> Result<()> {
        let row = root + genes.subnode_count();
        self.compute(genes, gene_to_species, root, row, true)
    }

    fn compute(
        &mut self,
        genes: &GeneTree,
        gene_to_species: &[usize],
        subnode: SubnodeId,
        row: usize,
        is_virtual_root: bool,
    ) -> Result<()> {
        if !is_virtual_root && genes.is_leaf(subnode) {
            let clv = &mut self.clvs[row];
            clv.proba = R::from_f64(self.ps);
            clv.clade = BTreeSet::from([gene_to_species[subnode]]);
            clv.genes_count = 1;
            return Ok(());
        }

        let (x, y) = genes.children(subnode, is_virtual_root);
        let left_size = self.clvs[x].clade.len();
        let right_size = self.clvs[y].clade.len();
        let mut clade: BTreeSet<usize> = self.clvs[x].clade.clone();
        clade.extend(self.clvs[y].clade.iter().copied());
        let genes_count = self.clvs[x].genes_count + self.clvs[y].genes_count;
        let mut proba = self.clvs[x].proba * self.clvs[y].proba;

        if clade.len() == left_size + right_size {
            // Disjoint clades: speciation, one of 2^(|C|-1) orderings.
            proba = proba
                .scale_mul(self.ps)
                .scale_div((clade.len() as f64 - 1.0).exp2());
        } else {
            // Overlapping clades: duplication.
            let divisor =
                (genes_count as f64 - 1.0).exp2() - (clade.len() as f64 - 1.0).exp2();
            if divisor <= 0.0 {
                return Err(VelellaError::Internal(format!(
                    "degenerate duplication weight at gene row {}",
                    row
                )));
            }
            proba = proba.scale_mul(self.pd).scale_div(divisor);
        }

        let clv = &mut self.clvs[row];
        clv.proba = proba;
        clv.clade = clade;
        clv.genes_count = genes_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::GeneSpeciesMap;
    use crate::species_tree::SpeciesTree;
    use velella_core::ScaledReal;

    fn update_all<R: ExtendedReal>(
        model: &mut DsModel<R>,
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
                    model.update_clv(genes, g2s, id).unwrap();
                }
            }
        }
        for root in genes.candidate_roots() {
            model.compute_virtual_root(genes, g2s, root).unwrap();
        }
    }

    fn setup(gene_newick: &str) -> (GeneTree, Vec<usize>) {
        let species = SpeciesTree::from_newick("((A,B),C);").unwrap();
        let genes = GeneTree::from_newick(gene_newick).unwrap();
        let map = GeneSpeciesMap::from_pairs([
            ("a", "A"),
            ("a1", "A"),
            ("a2", "A"),
            ("b", "B"),
            ("c", "C"),
        ]);
        let g2s = map.resolve(&genes, &species).unwrap();
        (genes, g2s)
    }

    #[test]
    fn rates_normalize_against_speciation() {
        let rates = RatesInput::global(1, 1.0, 0.0, 0.0);
        let model: DsModel<f64> = DsModel::new(4, &rates).unwrap();
        assert!((model.pd - 0.5).abs() < 1e-12);
        assert!((model.ps - 0.5).abs() < 1e-12);
    }

    #[test]
    fn speciation_only_tree() {
        let (genes, g2s) = setup("((a,b),c);");
        let rates = RatesInput::global(1, 0.5, 0.0, 0.0);
        let mut model: DsModel<f64> = DsModel::new(genes.subnode_count(), &rates).unwrap();
        update_all(&mut model, &genes, &g2s);
        for root in genes.candidate_roots() {
            let row = root + genes.subnode_count();
            let value = model.root_likelihood(row);
            assert!(value > 0.0 && value <= 1.0);
        }
        // The virtual root covers all three species and three genes.
        let row = genes.candidate_roots()[0] + genes.subnode_count();
        assert_eq!(model.clvs[row].clade.len(), 3);
        assert_eq!(model.clvs[row].genes_count, 3);
    }

    #[test]
    fn duplication_detected_by_overlap() {
        let (genes, g2s) = setup("((a1,a2),b);");
        let rates = RatesInput::global(1, 0.5, 0.0, 0.0);
        let mut model: DsModel<ScaledReal> =
            DsModel::new(genes.subnode_count(), &rates).unwrap();
        update_all(&mut model, &genes, &g2s);
        // The (a1,a2) node has an overlapping union: one species, two genes.
        let inner = (0..genes.subnode_count())
            .find(|&id| {
                !genes.is_leaf(id) && {
                    let (l, r) = genes.children(id, false);
                    genes.is_leaf(l) && genes.is_leaf(r) && g2s[l] == g2s[r]
                }
            })
            .unwrap();
        assert_eq!(model.clvs[inner].clade.len(), 1);
        assert_eq!(model.clvs[inner].genes_count, 2);
        assert!(!model.clvs[inner].proba.is_zero());
    }

    #[test]
    fn zero_dup_rate_forbids_duplication() {
        let (genes, g2s) = setup("((a1,a2),b);");
        let rates = RatesInput::global(1, 0.0, 0.0, 0.0);
        let mut model: DsModel<f64> = DsModel::new(genes.subnode_count(), &rates).unwrap();
        update_all(&mut model, &genes, &g2s);
        // A duplication node gets probability zero when PD = 0.
        let row = genes.candidate_roots()[0] + genes.subnode_count();
        assert_eq!(model.root_likelihood(row), 0.0);
    }

    #[test]
    fn bad_rates_rejected() {
        let rates = RatesInput::per_branch(vec![], vec![], vec![]);
        assert!(DsModel::<f64>::new(4, &rates).is_err());
        let rates = RatesInput::global(1, f64::NAN, 0.0, 0.0);
        assert!(DsModel::<f64>::new(4, &rates).is_err());
    }
}
