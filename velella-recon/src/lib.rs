//! Probabilistic gene-tree / species-tree reconciliation.
//!
//! Given a rooted species tree, an unrooted binary gene tree, a
//! gene-to-species mapping and event rates, `velella-recon` computes the
//! likelihood that the gene tree arose from the species tree under an
//! undated duplication–loss (or duplication–transfer–loss) model,
//! extracts maximum likelihood reconciliation scenarios, and drives a
//! joint sequence + reconciliation SPR search over gene-tree topologies.
//!
//! # Quick start
//!
//! ```
//! use velella_recon::{
//!     GeneSpeciesMap, GeneTree, ReconciliationEvaluator, RecSettings, SpeciesTree,
//! };
//!
//! let species = SpeciesTree::from_newick("((A,B),C);").unwrap();
//! let genes = GeneTree::from_newick("((a,b),c);").unwrap();
//! let mapping = GeneSpeciesMap::from_pairs([("a", "A"), ("b", "B"), ("c", "C")]);
//!
//! let mut evaluator =
//!     ReconciliationEvaluator::new(species, &genes, &mapping, &RecSettings::default()).unwrap();
//! let log_likelihood = evaluator.evaluate(&genes).unwrap();
//! assert!(log_likelihood.is_finite() && log_likelihood < 0.0);
//! ```

pub mod clv;
pub mod config;
pub mod evaluator;
pub mod family;
pub mod gene_tree;
pub mod joint;
pub mod mapping;
pub mod model;
pub mod newick;
pub mod rates;
pub mod scenario;
pub mod species_tree;
pub mod spr;

mod simple_ds;
mod undated_dl;
mod undated_dtl;

pub use config::RecSettings;
pub use evaluator::ReconciliationEvaluator;
pub use family::{evaluate_families, FamilyStats, GeneFamily};
pub use gene_tree::{GeneTree, SprRollback, Subnode, SubnodeId};
pub use joint::{FixedSequenceEvaluator, JointTree, SequenceEvaluator};
pub use mapping::GeneSpeciesMap;
pub use model::{RecModel, RecModelKind};
pub use rates::{BranchRates, RatesInput};
pub use scenario::{Event, EventKind, Scenario, SpeciesEvents};
pub use species_tree::{SpeciesId, SpeciesNode, SpeciesTree};
pub use spr::{spr_round, spr_search, SprMove, SprStats};

// Re-export the scalar types likelihood consumers parameterize over.
pub use velella_core::{ExtendedReal, Result, ScaledReal, VelellaError};
