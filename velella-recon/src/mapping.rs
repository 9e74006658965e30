//! Gene-to-species leaf mapping.

use std::collections::HashMap;

use crate::gene_tree::GeneTree;
use crate::species_tree::SpeciesTree;
use velella_core::{Result, VelellaError};

/// Sentinel species index for non-leaf gene subnodes.
pub const UNMAPPED: usize = usize::MAX;

/// Mapping from gene leaf names to species names.
///
/// Gene leaves absent from the mapping fall back to their own name, so a
/// family whose genes are directly labeled with species needs no mapping
/// file at all.
#[derive(Debug, Clone, Default)]
pub struct GeneSpeciesMap {
    map: HashMap<String, String>,
}

impl GeneSpeciesMap {
    /// An empty mapping (identity fallback for every gene).
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a mapping from `gene<TAB>species` lines. Blank lines and
    /// `#` comments are skipped.
    pub fn from_text(text: &str) -> Result<Self> {
        let mut map = HashMap::new();
        for (line_number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let gene = fields.next().unwrap_or("");
            let species = fields.next().unwrap_or("");
            if gene.is_empty() || species.is_empty() || fields.next().is_some() {
                return Err(VelellaError::Parse(format!(
                    "mapping line {}: expected 'gene<TAB>species', got '{}'",
                    line_number + 1,
                    line
                )));
            }
            map.insert(gene.to_string(), species.to_string());
        }
        Ok(Self { map })
    }

    /// Build from explicit pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            map: pairs
                .into_iter()
                .map(|(g, s)| (g.into(), s.into()))
                .collect(),
        }
    }

    /// Species name for a gene name (identity fallback).
    pub fn species_for<'a>(&'a self, gene: &'a str) -> &'a str {
        self.map.get(gene).map(String::as_str).unwrap_or(gene)
    }

    /// Number of explicit entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if there are no explicit entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Resolve the mapping against concrete trees: produce, for every gene
    /// subnode, the species node index (leaves) or [`UNMAPPED`] (inners).
    ///
    /// # Errors
    ///
    /// A gene leaf whose species is not in the species tree is an
    /// `InvalidInput` error naming both.
    pub fn resolve(&self, genes: &GeneTree, species: &SpeciesTree) -> Result<Vec<usize>> {
        let mut gene_to_species = vec![UNMAPPED; genes.subnode_count()];
        for leaf in genes.leaf_subnodes() {
            let gene_name = genes
                .subnode(leaf)
                .label
                .as_deref()
                .ok_or_else(|| VelellaError::Internal("gene leaf without a label".into()))?;
            let species_name = self.species_for(gene_name);
            let species_id = species.leaf_id(species_name).ok_or_else(|| {
                VelellaError::InvalidInput(format!(
                    "gene '{}' maps to species '{}', which is not in the species tree",
                    gene_name, species_name
                ))
            })?;
            gene_to_species[leaf] = species_id;
        }
        Ok(gene_to_species)
    }

    /// The set of species names used by the given gene tree's leaves.
    pub fn species_set(&self, genes: &GeneTree) -> std::collections::BTreeSet<String> {
        genes
            .leaf_subnodes()
            .filter_map(|leaf| genes.subnode(leaf).label.as_deref())
            .map(|gene| self.species_for(gene).to_string())
            .collect()
    }
}
