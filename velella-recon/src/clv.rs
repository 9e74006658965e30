//! Conditional likelihood vector storage and validity tracking.
//!
//! `uq[row][species]` holds the probability that the gene subtree of a
//! directed gene node arose from a reconciliation rooted on a species
//! branch. The table has twice as many rows as there are subnodes: the
//! first block is indexed by observed half-edges, the second by virtual
//! roots (`row = subnode + subnode_count`), so a virtual root never needs
//! storage in the tree itself.

use std::collections::BTreeSet;

use crate::gene_tree::{GeneTree, SubnodeId};
use velella_core::ExtendedReal;

/// The `uq` table for one model instance.
#[derive(Debug, Clone)]
pub struct ClvTable<R> {
    rows: Vec<Vec<R>>,
    observed_rows: usize,
}

impl<R: ExtendedReal> ClvTable<R> {
    /// Allocate a zeroed table for `subnode_count` observed half-edges
    /// over `species_count` species branches.
    pub fn new(subnode_count: usize, species_count: usize) -> Self {
        Self {
            rows: vec![vec![R::zero(); species_count]; 2 * subnode_count],
            observed_rows: subnode_count,
        }
    }

    /// Row index of the virtual root sitting on `subnode`'s edge.
    pub fn virtual_row(&self, subnode: SubnodeId) -> usize {
        subnode + self.observed_rows
    }

    /// One table entry.
    pub fn get(&self, row: usize, species: usize) -> R {
        self.rows[row][species]
    }

    /// Set one table entry.
    pub fn set(&mut self, row: usize, species: usize, value: R) {
        self.rows[row][species] = value;
    }

    /// A full row.
    pub fn row(&self, row: usize) -> &[R] {
        &self.rows[row]
    }

    /// Zero out a row.
    pub fn clear_row(&mut self, row: usize) {
        for value in &mut self.rows[row] {
            *value = R::zero();
        }
    }

    /// Sum of a row (the virtual-root marginal when `row` is virtual).
    pub fn row_sum(&self, row: usize) -> R {
        let mut sum = R::zero();
        for &value in &self.rows[row] {
            sum += value;
        }
        sum
    }
}

/// Validity bits for observed CLV rows, with deferred upward marking.
///
/// Invalidation seeds are recorded eagerly and spread lazily: when CLVs
/// are next updated, every half-edge whose subtree contains a seed is
/// marked stale by walking `back.next` / `back.next.next` chains.
#[derive(Debug, Clone)]
pub struct ClvValidity {
    valid: Vec<bool>,
    seeds: BTreeSet<SubnodeId>,
}

impl ClvValidity {
    /// All-invalid state for `subnode_count` half-edges.
    pub fn new(subnode_count: usize) -> Self {
        Self {
            valid: vec![false; subnode_count],
            seeds: BTreeSet::new(),
        }
    }

    /// True if the CLV row of `subnode` reflects current state.
    pub fn is_valid(&self, subnode: SubnodeId) -> bool {
        self.valid[subnode]
    }

    /// Mark one row freshly computed.
    pub fn set_valid(&mut self, subnode: SubnodeId) {
        self.valid[subnode] = true;
    }

    /// Record an invalidation seed (spread on the next update pass).
    pub fn invalidate(&mut self, subnode: SubnodeId) {
        self.seeds.insert(subnode);
    }

    /// Drop every validity bit.
    pub fn invalidate_all(&mut self) {
        self.seeds.clear();
        for bit in &mut self.valid {
            *bit = false;
        }
    }

    /// Spread pending seeds: each seed invalidates itself and every
    /// half-edge whose subtree contains it.
    pub fn mark_invalid_upward(&mut self, genes: &GeneTree) {
        let seeds: Vec<SubnodeId> = std::mem::take(&mut self.seeds).into_iter().collect();
        let mut stack = seeds;
        while let Some(subnode) = stack.pop() {
            self.valid[subnode] = false;
            let back = genes.back(subnode);
            if let Some(next) = genes.next(back) {
                let next_next = genes.next(next).expect("broken subnode cycle");
                stack.push(next);
                stack.push(next_next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velella_core::ScaledReal;

    #[test]
    fn virtual_rows_follow_observed() {
        let table: ClvTable<f64> = ClvTable::new(10, 5);
        assert_eq!(table.virtual_row(0), 10);
        assert_eq!(table.virtual_row(9), 19);
    }

    #[test]
    fn row_sum_adds_entries() {
        let mut table: ClvTable<ScaledReal> = ClvTable::new(2, 3);
        table.set(0, 0, ScaledReal::new(0.25));
        table.set(0, 2, ScaledReal::new(0.5));
        assert!((table.row_sum(0).to_f64() - 0.75).abs() < 1e-12);
        table.clear_row(0);
        assert!(table.row_sum(0).is_zero());
    }

    #[test]
    fn upward_marking_reaches_containing_edges() {
        // ((a,b),c): invalidating leaf `a` must invalidate every half-edge
        // whose subtree contains a, and leave the rest valid.
        let genes = GeneTree::from_newick("((a,b),c);").unwrap();
        let mut validity = ClvValidity::new(genes.subnode_count());
        for id in 0..genes.subnode_count() {
            validity.set_valid(id);
        }
        validity.invalidate(0); // leaf a
        validity.mark_invalid_upward(&genes);

        for id in 0..genes.subnode_count() {
            let contains_a = subtree_contains_leaf(&genes, id, "a");
            assert_eq!(
                !validity.is_valid(id),
                contains_a,
                "subnode {} (contains a: {})",
                id,
                contains_a
            );
        }
    }

    #[test]
    fn invalidate_all_clears_everything() {
        let genes = GeneTree::from_newick("((a,b),c);").unwrap();
        let mut validity = ClvValidity::new(genes.subnode_count());
        for id in 0..genes.subnode_count() {
            validity.set_valid(id);
        }
        validity.invalidate_all();
        assert!((0..genes.subnode_count()).all(|id| !validity.is_valid(id)));
    }

    fn subtree_contains_leaf(genes: &GeneTree, subnode: SubnodeId, label: &str) -> bool {
        if genes.is_leaf(subnode) {
            return genes.subnode(subnode).label.as_deref() == Some(label);
        }
        let (left, right) = genes.children(subnode, false);
        subtree_contains_leaf(genes, left, label) || subtree_contains_leaf(genes, right, label)
    }
}
