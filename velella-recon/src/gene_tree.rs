//! Unrooted gene tree stored as directed half-edges.
//!
//! Every inner node is realized as three "subnodes" forming a `next` cycle;
//! each subnode has a `back` pointing to a subnode of the adjacent node.
//! Leaves have a single subnode. Subnode indices are stable for the
//! lifetime of the tree: tips occupy `[0, tip_count)`, inner subnodes
//! follow in groups of three. All links are indices into one arena —
//! the cyclic structure is never expressed through ownership.
//!
//! A *virtual root* on edge `r`–`back(r)` is an ephemeral concept: the
//! conditional likelihood tables reserve a second row block for it, and
//! [`GeneTree::children`] with `is_virtual_root = true` resolves its two
//! children as `(r, back(r))`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::newick::{self, ParsedTree};
use velella_core::{Result, Summarizable, VelellaError};

/// Index into the gene tree's subnode arena.
pub type SubnodeId = usize;

/// One directed half-edge of the unrooted gene tree.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Subnode {
    /// Index of this subnode in the arena.
    pub id: SubnodeId,
    /// Next subnode in this node's cycle (None for leaves).
    pub next: Option<SubnodeId>,
    /// The opposing half-edge on the adjacent node.
    pub back: SubnodeId,
    /// Taxon label (leaf subnodes only).
    pub label: Option<String>,
    /// Length of the edge shared with `back`.
    pub length: Option<f64>,
    /// Support value of the edge shared with `back`, parsed from inner
    /// node labels when numeric.
    pub support: Option<f64>,
}

/// An unrooted binary gene tree.
#[derive(Debug, Clone)]
pub struct GeneTree {
    subnodes: Vec<Subnode>,
    tip_count: usize,
    root_edge: Option<SubnodeId>,
}

/// Record needed to undo one SPR edit exactly.
#[derive(Debug, Clone)]
pub struct SprRollback {
    prune: SubnodeId,
    regraft: SubnodeId,
    regraft_back: SubnodeId,
    left_neighbor: SubnodeId,
    right_neighbor: SubnodeId,
    left_length: Option<f64>,
    right_length: Option<f64>,
    regraft_length: Option<f64>,
}

impl GeneTree {
    /// Parse a gene tree from Newick.
    ///
    /// A binary root is suppressed (its two child edges merge into one);
    /// the merged edge is remembered as the tree's root edge for
    /// rooted-gene-tree mode. A trifurcating root is read as an ordinary
    /// inner node of the unrooted tree.
    pub fn from_newick(input: &str) -> Result<Self> {
        let parsed = newick::parse(input)?;
        Self::from_parsed(&parsed)
    }

    fn from_parsed(parsed: &ParsedTree) -> Result<Self> {
        let root = parsed.root;
        let root_arity = parsed.nodes[root].children.len();
        if !(2..=3).contains(&root_arity) {
            return Err(VelellaError::InvalidInput(format!(
                "gene tree root must have 2 or 3 children, found {}",
                root_arity
            )));
        }
        for raw in &parsed.nodes {
            if raw.id == root {
                continue;
            }
            match raw.children.len() {
                0 => {
                    if raw.label.is_none() {
                        return Err(VelellaError::InvalidInput(
                            "gene tree leaf without a label".into(),
                        ));
                    }
                }
                2 => {}
                n => {
                    return Err(VelellaError::InvalidInput(format!(
                        "gene tree must be binary, found a node with {} children",
                        n
                    )))
                }
            }
        }
        let tip_count = parsed.leaf_count();
        if tip_count < 2 {
            return Err(VelellaError::InvalidInput(
                "gene tree needs at least 2 leaves".into(),
            ));
        }
        let suppress_root = root_arity == 2;

        // Tips first, then three consecutive subnodes per inner node.
        const UNSET: SubnodeId = SubnodeId::MAX;
        let mut up: Vec<SubnodeId> = vec![UNSET; parsed.nodes.len()];
        let mut subnodes: Vec<Subnode> = Vec::new();
        for raw in &parsed.nodes {
            if raw.is_leaf() {
                let id = subnodes.len();
                subnodes.push(Subnode {
                    id,
                    next: None,
                    back: UNSET,
                    label: raw.label.clone(),
                    length: None,
                    support: None,
                });
                up[raw.id] = id;
            }
        }
        for raw in &parsed.nodes {
            if raw.is_leaf() || (raw.id == root && suppress_root) {
                continue;
            }
            let base = subnodes.len();
            for offset in 0..3 {
                subnodes.push(Subnode {
                    id: base + offset,
                    next: Some(base + (offset + 1) % 3),
                    back: UNSET,
                    label: None,
                    length: None,
                    support: None,
                });
            }
            up[raw.id] = base;
        }

        // Wire parent-child edges. For a non-root inner node the first
        // subnode faces the parent; for a trifurcating root all three face
        // children.
        fn link(subnodes: &mut [Subnode], a: SubnodeId, b: SubnodeId) {
            subnodes[a].back = b;
            subnodes[b].back = a;
        }
        for raw in &parsed.nodes {
            if raw.is_leaf() || (raw.id == root && suppress_root) {
                continue;
            }
            let base = up[raw.id];
            let first_down = if raw.id == root { 0 } else { 1 };
            for (k, &child) in raw.children.iter().enumerate() {
                let down = base + first_down + k;
                let child_up = up[child];
                link(&mut subnodes, down, child_up);
                let length = parsed.nodes[child].length;
                let support = edge_support(parsed, child);
                for &side in &[down, child_up] {
                    subnodes[side].length = length;
                    subnodes[side].support = support;
                }
            }
        }

        let mut root_edge = None;
        if suppress_root {
            let c0 = parsed.nodes[root].children[0];
            let c1 = parsed.nodes[root].children[1];
            let (u0, u1) = (up[c0], up[c1]);
            link(&mut subnodes, u0, u1);
            let length = match (parsed.nodes[c0].length, parsed.nodes[c1].length) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
            };
            let support = edge_support(parsed, c0).or_else(|| edge_support(parsed, c1));
            for &side in &[u0, u1] {
                subnodes[side].length = length;
                subnodes[side].support = support;
            }
            root_edge = Some(u0);
        }

        debug_assert!(subnodes.iter().all(|s| s.back != UNSET));
        Ok(Self {
            subnodes,
            tip_count,
            root_edge,
        })
    }

    /// Access a subnode by id.
    pub fn subnode(&self, id: SubnodeId) -> &Subnode {
        &self.subnodes[id]
    }

    /// Total number of directed subnodes (`tip_count + 3 · inner_count`).
    pub fn subnode_count(&self) -> usize {
        self.subnodes.len()
    }

    /// Number of leaves.
    pub fn tip_count(&self) -> usize {
        self.tip_count
    }

    /// Number of inner nodes.
    pub fn inner_count(&self) -> usize {
        (self.subnodes.len() - self.tip_count) / 3
    }

    /// Largest subnode index.
    pub fn max_gene_id(&self) -> usize {
        self.subnodes.len() - 1
    }

    /// The root edge remembered from a rooted Newick input, if any.
    pub fn root_edge(&self) -> Option<SubnodeId> {
        self.root_edge
    }

    /// True if the subnode belongs to a leaf.
    pub fn is_leaf(&self, id: SubnodeId) -> bool {
        self.subnodes[id].next.is_none()
    }

    /// The opposing half-edge.
    pub fn back(&self, id: SubnodeId) -> SubnodeId {
        self.subnodes[id].back
    }

    /// Next subnode in the node cycle (None for leaves).
    pub fn next(&self, id: SubnodeId) -> Option<SubnodeId> {
        self.subnodes[id].next
    }

    /// Leaf subnode ids (tips occupy the first indices by construction).
    pub fn leaf_subnodes(&self) -> impl Iterator<Item = SubnodeId> {
        0..self.tip_count
    }

    /// The two child half-edges of `id` in the rooting direction away from
    /// `back(id)`. With `is_virtual_root`, `id` names the edge `id`–`back(id)`
    /// carrying a virtual root whose children are the edge's two ends.
    ///
    /// # Panics
    ///
    /// Panics if `id` is a leaf subnode and `is_virtual_root` is false.
    pub fn children(&self, id: SubnodeId, is_virtual_root: bool) -> (SubnodeId, SubnodeId) {
        if is_virtual_root {
            return (id, self.subnodes[id].back);
        }
        let next = self.subnodes[id]
            .next
            .expect("leaf subnode has no children");
        let next_next = self.subnodes[next].next.expect("broken subnode cycle");
        (self.subnodes[next].back, self.subnodes[next_next].back)
    }

    /// One candidate virtual-root half-edge per undirected edge.
    pub fn candidate_roots(&self) -> Vec<SubnodeId> {
        let mut marked = vec![false; self.subnodes.len()];
        let mut roots = Vec::new();
        for id in 0..self.subnodes.len() {
            if marked[id] || marked[self.subnodes[id].back] {
                continue;
            }
            roots.push(self.subnodes[id].back);
            marked[id] = true;
        }
        roots
    }

    /// Number of undirected edges.
    pub fn edge_count(&self) -> usize {
        self.candidate_roots().len()
    }

    /// Apply an SPR move: detach the subtree behind `back(prune)` together
    /// with the prune node, join the two vacated neighbor edges, and
    /// re-insert the prune node into the edge `regraft`–`back(regraft)`.
    ///
    /// `regraft` must lie outside the carried subtree; the move generator
    /// guarantees this by only walking outward from the prune node's
    /// neighbor edges. Returns the rollback record that undoes the edit.
    pub fn apply_spr(&mut self, prune: SubnodeId, regraft: SubnodeId) -> Result<SprRollback> {
        let pn = self.next(prune).ok_or_else(|| {
            VelellaError::InvalidInput("SPR prune point must be an inner subnode".into())
        })?;
        let pnn = self.next(pn).expect("broken subnode cycle");
        if self.spr_yields_same_tree(prune, regraft) {
            return Err(VelellaError::InvalidInput(
                "SPR move would not change the tree".into(),
            ));
        }
        let left_neighbor = self.back(pn);
        let right_neighbor = self.back(pnn);
        let regraft_back = self.back(regraft);
        let rollback = SprRollback {
            prune,
            regraft,
            regraft_back,
            left_neighbor,
            right_neighbor,
            left_length: self.subnodes[pn].length,
            right_length: self.subnodes[pnn].length,
            regraft_length: self.subnodes[regraft].length,
        };

        let joined = match (rollback.left_length, rollback.right_length) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        };
        self.link(left_neighbor, right_neighbor, joined);
        let half = rollback.regraft_length.map(|l| l / 2.0);
        self.link(pn, regraft, half);
        self.link(pnn, regraft_back, half);
        Ok(rollback)
    }

    /// Reverse an SPR edit, restoring the exact prior links and lengths.
    pub fn undo_spr(&mut self, rollback: &SprRollback) {
        let pn = self.next(rollback.prune).expect("prune point must be inner");
        let pnn = self.next(pn).expect("broken subnode cycle");
        self.link(rollback.regraft, rollback.regraft_back, rollback.regraft_length);
        self.link(pn, rollback.left_neighbor, rollback.left_length);
        self.link(pnn, rollback.right_neighbor, rollback.right_length);
    }

    /// True if regrafting `regraft` at `prune` reproduces the same tree.
    pub fn spr_yields_same_tree(&self, prune: SubnodeId, regraft: SubnodeId) -> bool {
        let pn = match self.next(prune) {
            Some(pn) => pn,
            None => return true,
        };
        let pnn = self.next(pn).expect("broken subnode cycle");
        regraft == prune
            || regraft == pn
            || regraft == pnn
            || regraft == self.back(prune)
            || regraft == self.back(pn)
            || regraft == self.back(pnn)
    }

    fn link(&mut self, a: SubnodeId, b: SubnodeId, length: Option<f64>) {
        self.subnodes[a].back = b;
        self.subnodes[b].back = a;
        self.subnodes[a].length = length;
        self.subnodes[b].length = length;
    }

    /// Deterministic hash of the unrooted topology, invariant under
    /// subnode renumbering and rooting direction. Anchored at the leaf
    /// with the smallest label hash.
    pub fn unrooted_hash(&self) -> u64 {
        let anchor = self
            .leaf_subnodes()
            .min_by_key(|&id| leaf_hash(self.subnodes[id].label.as_deref().unwrap_or("")))
            .expect("gene tree has leaves");
        let own = leaf_hash(self.subnodes[anchor].label.as_deref().unwrap_or(""));
        own.wrapping_add(self.subtree_hash(self.back(anchor), 1))
    }

    fn subtree_hash(&self, id: SubnodeId, depth: u64) -> u64 {
        if self.is_leaf(id) {
            return leaf_hash(self.subnodes[id].label.as_deref().unwrap_or(""));
        }
        let (left, right) = self.children(id, false);
        let h1 = self.subtree_hash(left, depth + 1);
        let h2 = self.subtree_hash(right, depth + 1);
        let (lo, hi) = if h1 <= h2 { (h1, h2) } else { (h2, h1) };
        let mut hasher = DefaultHasher::new();
        lo.wrapping_mul(depth).wrapping_add(hi).hash(&mut hasher);
        hasher.finish()
    }

    /// Serialize the tree to Newick, rooted on the edge `root`–`back(root)`.
    /// The root edge's length is split between the two halves.
    pub fn to_newick_rooted_at(&self, root: SubnodeId) -> String {
        let mut buf = String::from("(");
        self.write_subtree(root, &mut buf, true);
        buf.push(',');
        self.write_subtree(self.back(root), &mut buf, true);
        buf.push_str(");");
        buf
    }

    fn write_subtree(&self, id: SubnodeId, buf: &mut String, is_root_half: bool) {
        if self.is_leaf(id) {
            buf.push_str(self.subnodes[id].label.as_deref().unwrap_or(""));
        } else {
            let (left, right) = self.children(id, false);
            buf.push('(');
            self.write_subtree(left, buf, false);
            buf.push(',');
            self.write_subtree(right, buf, false);
            buf.push(')');
        }
        if let Some(length) = self.subnodes[id].length {
            let length = if is_root_half { length / 2.0 } else { length };
            buf.push(':');
            buf.push_str(&newick::format_length(length));
        }
    }
}

impl Summarizable for GeneTree {
    fn summary(&self) -> String {
        format!(
            "GeneTree: {} leaves, {} inner nodes, {} subnodes",
            self.tip_count,
            self.inner_count(),
            self.subnode_count()
        )
    }
}

fn leaf_hash(label: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    label.hash(&mut hasher);
    hasher.finish()
}

fn edge_support(parsed: &ParsedTree, child: usize) -> Option<f64> {
    let raw = &parsed.nodes[child];
    if raw.is_leaf() {
        return None;
    }
    raw.label.as_ref().and_then(|label| label.parse().ok())
}
