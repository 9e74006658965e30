//! Reconciliation settings recognized by the evaluator and the search.

use crate::model::RecModelKind;
use velella_core::{Result, VelellaError};

/// Settings controlling reconciliation evaluation and the joint search.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecSettings {
    /// The reconciliation model variant.
    pub model: RecModelKind,
    /// Freeze the gene root to the input rooting.
    pub rooted_gene_tree: bool,
    /// Weight of the reconciliation term in the joint objective.
    pub rec_weight: f64,
    /// Restrict the species tree to the species present in each family.
    pub prune_species_tree: bool,
    /// Clamp the duplication probability to zero.
    pub no_dup: bool,
    /// SPR moves may not cross gene branches with support above this
    /// threshold; branches below it are free to rearrange.
    pub branch_length_threshold: Option<f64>,
    /// Fixed-point sweeps for the DTL recurrences.
    pub dtl_iterations: usize,
    /// User-supplied global duplication rate (optimized when absent).
    pub user_dup_rate: Option<f64>,
    /// User-supplied global loss rate (optimized when absent).
    pub user_loss_rate: Option<f64>,
    /// User-supplied global transfer rate.
    pub user_transfer_rate: Option<f64>,
    /// Optimize rates per species branch instead of globally.
    pub per_species_rates: bool,
}

impl Default for RecSettings {
    fn default() -> Self {
        Self {
            model: RecModelKind::UndatedDl,
            rooted_gene_tree: false,
            rec_weight: 1.0,
            prune_species_tree: false,
            no_dup: false,
            branch_length_threshold: None,
            dtl_iterations: 3,
            user_dup_rate: None,
            user_loss_rate: None,
            user_transfer_rate: None,
            per_species_rates: false,
        }
    }
}

impl RecSettings {
    /// Settings for a model parsed from its configuration name.
    pub fn for_model_name(name: &str) -> Result<Self> {
        Ok(Self {
            model: name.parse()?,
            ..Self::default()
        })
    }

    /// Reject contradictory option combinations.
    pub fn validate(&self) -> Result<()> {
        if !self.rec_weight.is_finite() || self.rec_weight < 0.0 {
            return Err(VelellaError::Config(format!(
                "reconciliation weight {} must be finite and non-negative",
                self.rec_weight
            )));
        }
        if self.dtl_iterations == 0 {
            return Err(VelellaError::Config(
                "DTL iteration count must be at least 1".into(),
            ));
        }
        if self.user_dup_rate.is_some() != self.user_loss_rate.is_some() {
            return Err(VelellaError::Config(
                "duplication and loss rates must be given together".into(),
            ));
        }
        if self.user_dup_rate.is_some() && self.per_species_rates {
            return Err(VelellaError::Config(
                "user-provided global rates conflict with per-species rate optimization".into(),
            ));
        }
        if self.user_transfer_rate.is_some() && !self.model.accounts_for_transfers() {
            return Err(VelellaError::Config(format!(
                "a transfer rate was given but model {} ignores transfers",
                self.model
            )));
        }
        if self.no_dup && self.model == RecModelKind::SimpleDs {
            return Err(VelellaError::Config(
                "SimpleDS has duplication as its only free rate; no_dup is contradictory".into(),
            ));
        }
        if let Some(threshold) = self.branch_length_threshold {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(VelellaError::Config(format!(
                    "branch length threshold {} must be finite and non-negative",
                    threshold
                )));
            }
        }
        Ok(())
    }

    /// The global rate triple to start from: user rates when given, a
    /// neutral default otherwise.
    pub fn initial_rates(&self) -> (f64, f64, f64) {
        let dup = self.user_dup_rate.unwrap_or(0.2);
        let loss = self.user_loss_rate.unwrap_or(0.2);
        let transfer = if self.model.accounts_for_transfers() {
            self.user_transfer_rate.unwrap_or(0.1)
        } else {
            0.0
        };
        (dup, loss, transfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(RecSettings::default().validate().is_ok());
    }

    #[test]
    fn model_name_parsing() {
        let settings = RecSettings::for_model_name("UndatedDTL").unwrap();
        assert_eq!(settings.model, RecModelKind::UndatedDtl);
        assert!(RecSettings::for_model_name("NotAModel").is_err());
    }

    #[test]
    fn lone_dup_rate_rejected() {
        let settings = RecSettings {
            user_dup_rate: Some(0.2),
            ..RecSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn user_rates_conflict_with_per_species_optimization() {
        let settings = RecSettings {
            user_dup_rate: Some(0.2),
            user_loss_rate: Some(0.2),
            per_species_rates: true,
            ..RecSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn transfer_rate_needs_transfer_model() {
        let settings = RecSettings {
            user_transfer_rate: Some(0.1),
            ..RecSettings::default()
        };
        assert!(settings.validate().is_err());
        let settings = RecSettings {
            model: RecModelKind::UndatedDtl,
            user_dup_rate: Some(0.2),
            user_loss_rate: Some(0.2),
            user_transfer_rate: Some(0.1),
            ..RecSettings::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn no_dup_with_simple_ds_rejected() {
        let settings = RecSettings {
            model: RecModelKind::SimpleDs,
            no_dup: true,
            ..RecSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn initial_rates_zero_transfer_for_dl() {
        let settings = RecSettings::default();
        let (_, _, transfer) = settings.initial_rates();
        assert_eq!(transfer, 0.0);
    }
}
