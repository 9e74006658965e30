//! Joint sequence + reconciliation likelihood over one gene tree.
//!
//! The sequence term comes from an external evaluator behind the
//! [`SequenceEvaluator`] trait; the reconciliation term is weighted by
//! `rec_weight`. `JointTree` owns the gene tree and the rollback stack,
//! so SPR moves are applied, scored and reverted in one place.

use crate::evaluator::ReconciliationEvaluator;
use crate::gene_tree::{GeneTree, SprRollback, SubnodeId};
use velella_core::{Result, VelellaError};

/// External sequence-likelihood collaborator (Felsenstein pruning or any
/// other per-site model). Implementations may cache per-branch state keyed
/// by subnode index; `invalidate` mirrors the reconciliation CLV protocol.
pub trait SequenceEvaluator {
    /// Log-likelihood of the alignment given the gene tree.
    fn log_likelihood(&mut self, genes: &GeneTree) -> Result<f64>;

    /// A topological edit touched this half-edge.
    fn invalidate(&mut self, subnode: SubnodeId) {
        let _ = subnode;
    }
}

/// A sequence evaluator with no alignment signal: contributes a constant
/// term, turning the joint search into a reconciliation-only search.
#[derive(Debug, Clone, Default)]
pub struct FixedSequenceEvaluator {
    log_likelihood: f64,
}

impl FixedSequenceEvaluator {
    /// Evaluator always returning `log_likelihood`.
    pub fn new(log_likelihood: f64) -> Self {
        Self { log_likelihood }
    }
}

impl SequenceEvaluator for FixedSequenceEvaluator {
    fn log_likelihood(&mut self, _genes: &GeneTree) -> Result<f64> {
        Ok(self.log_likelihood)
    }
}

/// Rollback record for one applied move: the inverse topological edit,
/// the exact set of invalidated half-edges, and the prior gene root.
#[derive(Debug)]
struct MoveRollback {
    spr: SprRollback,
    invalidated: Vec<SubnodeId>,
    saved_root: Option<SubnodeId>,
}

/// A gene tree plus both likelihood evaluators.
pub struct JointTree {
    genes: GeneTree,
    reconciliation: ReconciliationEvaluator,
    sequences: Box<dyn SequenceEvaluator>,
    rec_weight: f64,
    rollbacks: Vec<MoveRollback>,
}

impl JointTree {
    /// Assemble a joint tree. `rec_weight` scales the reconciliation term.
    pub fn new(
        genes: GeneTree,
        reconciliation: ReconciliationEvaluator,
        sequences: Box<dyn SequenceEvaluator>,
        rec_weight: f64,
    ) -> Self {
        Self {
            genes,
            reconciliation,
            sequences,
            rec_weight,
            rollbacks: Vec::new(),
        }
    }

    /// The current gene tree.
    pub fn gene_tree(&self) -> &GeneTree {
        &self.genes
    }

    /// The reconciliation evaluator.
    pub fn reconciliation(&self) -> &ReconciliationEvaluator {
        &self.reconciliation
    }

    /// Mutable access to the reconciliation evaluator (rate updates).
    pub fn reconciliation_mut(&mut self) -> &mut ReconciliationEvaluator {
        &mut self.reconciliation
    }

    /// Sequence log-likelihood.
    pub fn sequence_loglk(&mut self) -> Result<f64> {
        self.sequences.log_likelihood(&self.genes)
    }

    /// Weighted reconciliation log-likelihood.
    pub fn reconciliation_loglk(&mut self) -> Result<f64> {
        Ok(self.reconciliation.evaluate(&self.genes)? * self.rec_weight)
    }

    /// Joint log-likelihood: `ℓ_seq + rec_weight · ℓ_rec`.
    pub fn joint_loglk(&mut self) -> Result<f64> {
        Ok(self.sequence_loglk()? + self.reconciliation_loglk()?)
    }

    /// Hash of the current unrooted topology.
    pub fn tree_hash(&self) -> u64 {
        self.genes.unrooted_hash()
    }

    /// Apply an SPR move and invalidate the given half-edges on both
    /// evaluators. The rollback record is pushed on the stack.
    pub fn apply_move(
        &mut self,
        prune: SubnodeId,
        regraft: SubnodeId,
        invalidated: Vec<SubnodeId>,
    ) -> Result<()> {
        let saved_root = self.reconciliation.root();
        let spr = self.genes.apply_spr(prune, regraft)?;
        for &subnode in &invalidated {
            self.reconciliation.invalidate_clv(subnode);
            self.sequences.invalidate(subnode);
        }
        self.rollbacks.push(MoveRollback {
            spr,
            invalidated,
            saved_root,
        });
        Ok(())
    }

    /// Undo the most recent move: reverse the edit, restore the saved
    /// gene root, and re-invalidate exactly the half-edges the move
    /// invalidated (their stored CLVs reflect the abandoned topology).
    pub fn rollback_last_move(&mut self) -> Result<()> {
        let rollback = self.rollbacks.pop().ok_or_else(|| {
            VelellaError::Internal("rollback requested with no move applied".into())
        })?;
        self.genes.undo_spr(&rollback.spr);
        self.reconciliation.set_root(rollback.saved_root);
        for &subnode in &rollback.invalidated {
            self.reconciliation.invalidate_clv(subnode);
            self.sequences.invalidate(subnode);
        }
        Ok(())
    }

    /// Number of moves currently on the rollback stack.
    pub fn pending_rollbacks(&self) -> usize {
        self.rollbacks.len()
    }
}
