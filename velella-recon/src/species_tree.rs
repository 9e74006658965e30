//! Rooted binary species tree with a cached post-order.
//!
//! Uses arena-style storage: nodes live in a flat `Vec<SpeciesNode>` and are
//! referenced by index. The cached post-order is fixed at construction and
//! is the traversal contract for every reconciliation kernel: a node is
//! always visited after both of its children.

use std::collections::{BTreeSet, HashMap};

use crate::newick::{self, ParsedTree};
use velella_core::{Result, Summarizable, VelellaError};

/// Index into the species tree's node arena.
pub type SpeciesId = usize;

/// A single node of a rooted binary species tree.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpeciesNode {
    /// Index of this node in the arena.
    pub id: SpeciesId,
    /// Parent node (None for root).
    pub parent: Option<SpeciesId>,
    /// Left child (None for leaves).
    pub left: Option<SpeciesId>,
    /// Right child (None for leaves).
    pub right: Option<SpeciesId>,
    /// Branch length from this node to its parent.
    pub length: Option<f64>,
    /// Species label; auto-generated `species_<k>` for unlabeled inners.
    pub label: String,
}

impl SpeciesNode {
    /// True if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.left.is_none()
    }
}

/// A rooted binary species tree.
#[derive(Debug, Clone)]
pub struct SpeciesTree {
    nodes: Vec<SpeciesNode>,
    root: SpeciesId,
    post_order: Vec<SpeciesId>,
    leaf_ids: HashMap<String, SpeciesId>,
}

impl SpeciesTree {
    /// Parse a rooted binary species tree from a Newick string.
    ///
    /// Leaf labels must be present and distinct. Inner nodes without a
    /// label are named `species_<k>` in order of appearance.
    pub fn from_newick(input: &str) -> Result<Self> {
        let parsed = newick::parse(input)?;
        Self::from_parsed(&parsed)
    }

    fn from_parsed(parsed: &ParsedTree) -> Result<Self> {
        let mut nodes = Vec::with_capacity(parsed.nodes.len());
        let mut auto_label = 0usize;
        for raw in &parsed.nodes {
            let (left, right) = match raw.children.len() {
                0 => (None, None),
                2 => (Some(raw.children[0]), Some(raw.children[1])),
                n => {
                    return Err(VelellaError::InvalidInput(format!(
                        "species tree must be binary, found a node with {} children",
                        n
                    )))
                }
            };
            let label = match &raw.label {
                Some(label) => label.clone(),
                None if raw.is_leaf() => {
                    return Err(VelellaError::InvalidInput(
                        "species tree leaf without a label".into(),
                    ))
                }
                None => {
                    let label = format!("species_{}", auto_label);
                    auto_label += 1;
                    label
                }
            };
            nodes.push(SpeciesNode {
                id: raw.id,
                parent: raw.parent,
                left,
                right,
                length: raw.length,
                label,
            });
        }
        Self::build(nodes, parsed.root)
    }

    fn build(nodes: Vec<SpeciesNode>, root: SpeciesId) -> Result<Self> {
        let mut leaf_ids = HashMap::new();
        for node in &nodes {
            if node.is_leaf() {
                if leaf_ids.insert(node.label.clone(), node.id).is_some() {
                    return Err(VelellaError::InvalidInput(format!(
                        "duplicate species label '{}'",
                        node.label
                    )));
                }
            }
        }
        let post_order = compute_post_order(&nodes, root);
        Ok(Self {
            nodes,
            root,
            post_order,
            leaf_ids,
        })
    }

    /// Access a node by id.
    pub fn node(&self, id: SpeciesId) -> &SpeciesNode {
        &self.nodes[id]
    }

    /// The root node id.
    pub fn root(&self) -> SpeciesId {
        self.root
    }

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.leaf_ids.len()
    }

    /// The cached post-order: children always precede their parent.
    pub fn post_order(&self) -> &[SpeciesId] {
        &self.post_order
    }

    /// Leaf id for a species label.
    pub fn leaf_id(&self, label: &str) -> Option<SpeciesId> {
        self.leaf_ids.get(label).copied()
    }

    /// Sorted leaf labels.
    pub fn leaf_labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.leaf_ids.keys().map(String::as_str).collect();
        labels.sort_unstable();
        labels
    }

    /// True if `ancestor` lies on the path from `node` to the root,
    /// `node` itself included.
    pub fn is_ancestor_or_self(&self, ancestor: SpeciesId, node: SpeciesId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes[id].parent;
        }
        false
    }

    /// Restrict the tree to the given species, collapsing unary inner
    /// nodes. Used when a gene family covers only part of the species set.
    pub fn pruned_to(&self, keep: &BTreeSet<String>) -> Result<Self> {
        for label in keep {
            if !self.leaf_ids.contains_key(label) {
                return Err(VelellaError::InvalidInput(format!(
                    "species '{}' not present in the species tree",
                    label
                )));
            }
        }
        if keep.len() < 2 {
            return Err(VelellaError::InvalidInput(
                "species tree pruning needs at least 2 species".into(),
            ));
        }

        let mut nodes: Vec<SpeciesNode> = Vec::new();
        let root =
            self.prune_rec(self.root, keep, &mut nodes)
                .ok_or_else(|| {
                    VelellaError::Internal("species pruning produced an empty tree".into())
                })?;
        nodes[root].parent = None;
        nodes[root].length = None;
        Self::build(nodes, root)
    }

    /// Post-order rebuild keeping only subtrees that contain kept species.
    /// Unary nodes pass their surviving child through, summing lengths.
    fn prune_rec(
        &self,
        id: SpeciesId,
        keep: &BTreeSet<String>,
        out: &mut Vec<SpeciesNode>,
    ) -> Option<SpeciesId> {
        let node = &self.nodes[id];
        if node.is_leaf() {
            if !keep.contains(&node.label) {
                return None;
            }
            let new_id = out.len();
            out.push(SpeciesNode {
                id: new_id,
                parent: None,
                left: None,
                right: None,
                length: node.length,
                label: node.label.clone(),
            });
            return Some(new_id);
        }
        let left = self.prune_rec(node.left.unwrap(), keep, out);
        let right = self.prune_rec(node.right.unwrap(), keep, out);
        match (left, right) {
            (None, None) => None,
            (Some(child), None) | (None, Some(child)) => {
                let merged = node.length.unwrap_or(0.0) + out[child].length.unwrap_or(0.0);
                out[child].length = Some(merged);
                Some(child)
            }
            (Some(left), Some(right)) => {
                let new_id = out.len();
                out.push(SpeciesNode {
                    id: new_id,
                    parent: None,
                    left: Some(left),
                    right: Some(right),
                    length: node.length,
                    label: node.label.clone(),
                });
                out[left].parent = Some(new_id);
                out[right].parent = Some(new_id);
                Some(new_id)
            }
        }
    }

    /// Serialize to Newick.
    pub fn to_newick(&self) -> String {
        let mut buf = String::new();
        self.write_subtree(self.root, &mut buf);
        buf.push(';');
        buf
    }

    fn write_subtree(&self, id: SpeciesId, buf: &mut String) {
        let node = &self.nodes[id];
        if let (Some(left), Some(right)) = (node.left, node.right) {
            buf.push('(');
            self.write_subtree(left, buf);
            buf.push(',');
            self.write_subtree(right, buf);
            buf.push(')');
        }
        buf.push_str(&node.label);
        if let Some(length) = node.length {
            buf.push(':');
            buf.push_str(&newick::format_length(length));
        }
    }
}

impl Summarizable for SpeciesTree {
    fn summary(&self) -> String {
        format!(
            "SpeciesTree: {} nodes ({} leaves)",
            self.node_count(),
            self.leaf_count()
        )
    }
}

/// Post-order by reversing a right-first pre-order stack walk.
fn compute_post_order(nodes: &[SpeciesNode], root: SpeciesId) -> Vec<SpeciesId> {
    let mut order = Vec::with_capacity(nodes.len());
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        order.push(id);
        if let (Some(left), Some(right)) = (nodes[id].left, nodes[id].right) {
            stack.push(left);
            stack.push(right);
        }
    }
    order.reverse();
    order
}
