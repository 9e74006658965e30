//! Per-species-branch event rates.
//!
//! Rates arrive either as one global `(dup, loss, transfer)` triple or as
//! per-branch vectors. Each model normalizes branch-wise against an
//! implicit speciation weight of 1 so that `PD + PL + PS (+ PT) = 1` on
//! every branch.

use velella_core::{Result, VelellaError};

/// Raw (un-normalized) event rates, one entry per species node.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RatesInput {
    /// Duplication rates.
    pub dup: Vec<f64>,
    /// Loss rates.
    pub loss: Vec<f64>,
    /// Horizontal transfer rates.
    pub transfer: Vec<f64>,
}

impl RatesInput {
    /// One global triple replicated on every branch.
    pub fn global(species_count: usize, dup: f64, loss: f64, transfer: f64) -> Self {
        Self {
            dup: vec![dup; species_count],
            loss: vec![loss; species_count],
            transfer: vec![transfer; species_count],
        }
    }

    /// Per-branch vectors.
    pub fn per_branch(dup: Vec<f64>, loss: Vec<f64>, transfer: Vec<f64>) -> Self {
        Self {
            dup,
            loss,
            transfer,
        }
    }

    /// Check lengths and value ranges against a species tree size.
    pub fn validate(&self, species_count: usize) -> Result<()> {
        for (name, rates) in [
            ("duplication", &self.dup),
            ("loss", &self.loss),
            ("transfer", &self.transfer),
        ] {
            if rates.len() != species_count {
                return Err(VelellaError::InvalidInput(format!(
                    "{} rate vector has length {}, expected {}",
                    name,
                    rates.len(),
                    species_count
                )));
            }
            if let Some(bad) = rates.iter().find(|r| !r.is_finite() || **r < 0.0) {
                return Err(VelellaError::InvalidInput(format!(
                    "{} rate {} is not a finite non-negative number",
                    name, bad
                )));
            }
        }
        Ok(())
    }
}

/// Branch-wise normalized event probabilities.
#[derive(Debug, Clone)]
pub struct BranchRates {
    /// Duplication probability per branch.
    pub pd: Vec<f64>,
    /// Loss probability per branch.
    pub pl: Vec<f64>,
    /// Speciation probability per branch.
    pub ps: Vec<f64>,
    /// Transfer probability per branch (all zero for DL-style models).
    pub pt: Vec<f64>,
}

impl BranchRates {
    /// Normalize `input` so each branch sums to 1 against an implicit
    /// speciation weight of 1. `include_transfer` selects the DTL form;
    /// without it the transfer rates are ignored entirely.
    ///
    /// `no_dup` clamps the duplication probability to zero. The clamp is
    /// applied after normalizing the remaining rates, keeping the branch
    /// sum at 1.
    pub fn normalize(
        input: &RatesInput,
        species_count: usize,
        include_transfer: bool,
        no_dup: bool,
    ) -> Result<Self> {
        input.validate(species_count)?;
        let mut pd = input.dup.clone();
        let mut pl = input.loss.clone();
        let mut pt = if include_transfer {
            input.transfer.clone()
        } else {
            vec![0.0; species_count]
        };
        let mut ps = vec![1.0; species_count];
        for e in 0..species_count {
            if no_dup {
                pd[e] = 0.0;
            }
            let sum = pd[e] + pl[e] + pt[e] + ps[e];
            pd[e] /= sum;
            pl[e] /= sum;
            pt[e] /= sum;
            ps[e] /= sum;
        }
        Ok(Self { pd, pl, ps, pt })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_sums_to_one() {
        let input = RatesInput::global(4, 0.2, 0.3, 0.1);
        let rates = BranchRates::normalize(&input, 4, true, false).unwrap();
        for e in 0..4 {
            let sum = rates.pd[e] + rates.pl[e] + rates.ps[e] + rates.pt[e];
            assert!((sum - 1.0).abs() < 1e-12, "branch {} sums to {}", e, sum);
        }
    }

    #[test]
    fn dl_form_ignores_transfer() {
        let input = RatesInput::global(3, 0.2, 0.3, 5.0);
        let rates = BranchRates::normalize(&input, 3, false, false).unwrap();
        assert!(rates.pt.iter().all(|&p| p == 0.0));
        let sum = rates.pd[0] + rates.pl[0] + rates.ps[0];
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn no_dup_clamps_after_normalization() {
        let input = RatesInput::global(2, 0.4, 0.3, 0.0);
        let rates = BranchRates::normalize(&input, 2, false, true).unwrap();
        for e in 0..2 {
            assert_eq!(rates.pd[e], 0.0);
            let sum = rates.pl[e] + rates.ps[e];
            assert!((sum - 1.0).abs() < 1e-12);
        }
        // Loss keeps its weight relative to speciation: 0.3 / 1.3.
        assert!((rates.pl[0] - 0.3 / 1.3).abs() < 1e-12);
    }

    #[test]
    fn wrong_length_rejected() {
        let input = RatesInput::per_branch(vec![0.1; 3], vec![0.1; 2], vec![0.0; 3]);
        assert!(BranchRates::normalize(&input, 3, false, false).is_err());
    }

    #[test]
    fn negative_rate_rejected() {
        let input = RatesInput::global(2, -0.1, 0.1, 0.0);
        assert!(BranchRates::normalize(&input, 2, false, false).is_err());
    }

    #[test]
    fn nan_rate_rejected() {
        let input = RatesInput::global(2, f64::NAN, 0.1, 0.0);
        assert!(BranchRates::normalize(&input, 2, false, false).is_err());
    }
}
