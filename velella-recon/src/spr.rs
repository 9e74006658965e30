//! SPR search over gene-tree topologies under the joint likelihood.
//!
//! Candidate moves are enumerated per prune point by walking outward from
//! its two neighbor edges up to a radius; radius-1 moves are NNIs and are
//! emitted twice by the traversal, so they are de-duplicated by edge and
//! orientation. Each candidate is scored by apply → evaluate → rollback;
//! the best strictly-improving move is then re-applied and committed.

use crate::gene_tree::{GeneTree, SubnodeId};
use crate::joint::JointTree;
use velella_core::{Result, Summarizable};

/// Tolerance below which a move does not count as an improvement.
const IMPROVEMENT_EPSILON: f64 = 1e-9;

/// Mismatch between predicted and recomputed joint log-likelihood that
/// indicates a CLV invalidation problem.
const PREDICTION_TOLERANCE: f64 = 0.01;

/// One candidate SPR move.
#[derive(Debug, Clone)]
pub struct SprMove {
    /// Inner subnode to prune at.
    pub prune: SubnodeId,
    /// Half-edge naming the regraft edge.
    pub regraft: SubnodeId,
    /// Half-edges crossed between the prune point and the regraft edge.
    pub path: Vec<SubnodeId>,
}

impl SprMove {
    /// Half-edges whose CLVs the move invalidates: the path plus the
    /// neighborhoods of both surgery sites.
    fn invalidated(&self, genes: &GeneTree) -> Vec<SubnodeId> {
        let mut seeds = self.path.clone();
        let prune_next = genes.next(self.prune).expect("prune point is inner");
        let prune_next_next = genes.next(prune_next).expect("broken subnode cycle");
        seeds.extend_from_slice(&[
            self.prune,
            prune_next,
            prune_next_next,
            genes.back(prune_next),
            genes.back(prune_next_next),
            self.regraft,
            genes.back(self.regraft),
        ]);
        seeds.sort_unstable();
        seeds.dedup();
        seeds
    }
}

/// Outcome of one SPR search.
#[derive(Debug, Clone, Default)]
pub struct SprStats {
    /// Rounds executed (one round = one full candidate sweep).
    pub rounds: usize,
    /// Moves committed.
    pub accepted_moves: usize,
    /// Numerical warnings (predicted vs. recomputed mismatches).
    pub warnings: Vec<String>,
    /// Joint log-likelihood after the search.
    pub final_loglk: f64,
}

impl Summarizable for SprStats {
    fn summary(&self) -> String {
        format!(
            "SprSearch: {} rounds, {} accepted moves, {} warnings, final ll {:.6}",
            self.rounds,
            self.accepted_moves,
            self.warnings.len(),
            self.final_loglk
        )
    }
}

/// All inner subnodes, each a potential prune point.
fn prune_candidates(genes: &GeneTree) -> Vec<SubnodeId> {
    (0..genes.subnode_count())
        .filter(|&id| !genes.is_leaf(id))
        .collect()
}

/// Walk outward from the prune point's neighbor edges, collecting regraft
/// candidates up to `radius` edges away. Traversal stops at branches whose
/// support exceeds `support_threshold` (those edges may not be broken).
fn regraft_candidates(
    genes: &GeneTree,
    prune: SubnodeId,
    radius: usize,
    support_threshold: Option<f64>,
    moves: &mut Vec<SprMove>,
) {
    let prune_next = genes.next(prune).expect("prune point is inner");
    let prune_next_next = genes.next(prune_next).expect("broken subnode cycle");
    let mut path = Vec::new();
    walk_regrafts(
        genes,
        prune,
        genes.back(prune_next),
        radius,
        support_threshold,
        &mut path,
        moves,
    );
    walk_regrafts(
        genes,
        prune,
        genes.back(prune_next_next),
        radius,
        support_threshold,
        &mut path,
        moves,
    );
}

fn walk_regrafts(
    genes: &GeneTree,
    prune: SubnodeId,
    regraft: SubnodeId,
    radius: usize,
    support_threshold: Option<f64>,
    path: &mut Vec<SubnodeId>,
    moves: &mut Vec<SprMove>,
) {
    if let (Some(threshold), Some(support)) =
        (support_threshold, genes.subnode(regraft).support)
    {
        if support > threshold {
            return;
        }
    }
    if !path.is_empty() {
        moves.push(SprMove {
            prune,
            regraft,
            path: path.clone(),
        });
    }
    if path.len() < radius {
        if let Some(next) = genes.next(regraft) {
            let next_next = genes.next(next).expect("broken subnode cycle");
            path.push(regraft);
            walk_regrafts(genes, prune, genes.back(next), radius, support_threshold, path, moves);
            walk_regrafts(
                genes,
                prune,
                genes.back(next_next),
                radius,
                support_threshold,
                path,
                moves,
            );
            path.pop();
        }
    }
}

/// Enumerate all valid moves for one radius, dropping no-ops and the
/// duplicate NNI emissions.
fn collect_moves(genes: &GeneTree, radius: usize, support_threshold: Option<f64>) -> Vec<SprMove> {
    let mut potential = Vec::new();
    for prune in prune_candidates(genes) {
        regraft_candidates(genes, prune, radius, support_threshold, &mut potential);
    }
    // Radius-1 moves are NNIs and each is generated twice; key them by
    // undirected edge and orientation bit.
    let mut seen_nni = vec![[false; 2]; genes.subnode_count()];
    let mut moves = Vec::new();
    for candidate in potential {
        if genes.spr_yields_same_tree(candidate.prune, candidate.regraft) {
            continue;
        }
        if candidate.path.len() == 1 {
            let nni_edge = candidate.path[0];
            let edge_back = genes.back(nni_edge);
            let is_prune_next = genes
                .next(edge_back)
                .map(|next| next == candidate.prune)
                .unwrap_or(false);
            let is_regraft_next = genes
                .next(nni_edge)
                .map(|next| genes.back(next) == candidate.regraft)
                .unwrap_or(false);
            let orientation = usize::from(is_prune_next == is_regraft_next);
            let branch = nni_edge.min(edge_back);
            if seen_nni[branch][orientation] {
                continue;
            }
            seen_nni[branch][orientation] = true;
        }
        moves.push(candidate);
    }
    moves
}

/// Try every move within `radius`; commit the best strictly-improving one.
///
/// Returns true if a move was committed. `best_loglk` is updated to the
/// committed likelihood. A committed move whose recomputed likelihood
/// disagrees with the prediction by more than 0.01 records a warning
/// (the search continues).
pub fn spr_round(
    joint: &mut JointTree,
    radius: usize,
    best_loglk: &mut f64,
    stats: &mut SprStats,
) -> Result<bool> {
    let support_threshold = joint
        .reconciliation()
        .settings()
        .branch_length_threshold;
    let moves = collect_moves(joint.gene_tree(), radius, support_threshold);

    let mut best_move: Option<(usize, f64)> = None;
    for (index, candidate) in moves.iter().enumerate() {
        let invalidated = candidate.invalidated(joint.gene_tree());
        joint.apply_move(candidate.prune, candidate.regraft, invalidated)?;
        let loglk = joint.joint_loglk()?;
        joint.rollback_last_move()?;
        let current_best = best_move.map(|(_, ll)| ll).unwrap_or(*best_loglk);
        if loglk > current_best + IMPROVEMENT_EPSILON {
            best_move = Some((index, loglk));
        }
    }

    let (index, predicted) = match best_move {
        Some(found) => found,
        None => return Ok(false),
    };
    let winner = &moves[index];
    let invalidated = winner.invalidated(joint.gene_tree());
    joint.apply_move(winner.prune, winner.regraft, invalidated)?;
    let recomputed = joint.joint_loglk()?;
    if (recomputed - predicted).abs() > PREDICTION_TOLERANCE {
        stats.warnings.push(format!(
            "predicted joint log-likelihood {} but recomputed {} after move ({} -> {})",
            predicted, recomputed, winner.prune, winner.regraft
        ));
    }
    *best_loglk = recomputed;
    stats.accepted_moves += 1;
    Ok(true)
}

/// Hill-climb with SPR rounds of increasing radius: exhaust radius-1
/// (NNI) moves, then widen up to `max_radius`.
pub fn spr_search(joint: &mut JointTree, max_radius: usize) -> Result<SprStats> {
    let mut stats = SprStats::default();
    let mut best_loglk = joint.joint_loglk()?;
    for radius in 1..=max_radius.max(1) {
        loop {
            stats.rounds += 1;
            if !spr_round(joint, radius, &mut best_loglk, &mut stats)? {
                break;
            }
        }
    }
    stats.final_loglk = best_loglk;
    Ok(stats)
}
