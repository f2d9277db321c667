//! FDR threshold selection and validation levels.
//!
//! Each category of a [`ScoreMap`] gets its own score threshold: the most
//! permissive cutoff whose estimated FDR stays within the target.

use crate::ident::{Validation, ValidationLevel};
use crate::score_map::{Category, CategoryKey, ScoreMap};
use serde::{Deserialize, Serialize};

/// Threshold selected for a single category
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryCutoff {
    pub category: String,
    /// Minimal score of a validated match, `None` if nothing passes
    pub threshold: Option<f64>,
    /// Targets and decoys scoring at least the threshold
    pub targets: usize,
    pub decoys: usize,
    /// Estimated FDR at the threshold, as a fraction
    pub fdr: f64,
    pub fnr: f64,
    /// Largest PEP among validated targets
    pub pep: f64,
    pub true_positives: f64,
    /// Estimated true positives over every target of the category
    pub total_true_positives: f64,
}

impl CategoryCutoff {
    fn select<K: CategoryKey>(category: &Category<K>, target_fdr: f64) -> Self {
        let mut cutoff = CategoryCutoff {
            category: category.key.label(),
            threshold: None,
            targets: 0,
            decoys: 0,
            fdr: 0.0,
            fnr: 1.0,
            pep: 0.0,
            true_positives: 0.0,
            total_true_positives: 0.0,
        };
        let points = match category.curve() {
            Some(curve) if !curve.points.is_empty() => &curve.points,
            _ => return cutoff,
        };
        cutoff.total_true_positives = points[points.len() - 1].true_positives;

        // FDR never decreases as the threshold is relaxed
        let passing = points.partition_point(|p| p.fdr * 100.0 <= target_fdr);
        if passing == 0 {
            return cutoff;
        }
        let last = &points[passing - 1];
        let threshold = match points.get(passing) {
            Some(rejected) => category.lowest_above(rejected.score).unwrap_or(last.score),
            None => last.score,
        };
        let (targets, decoys) = category.at_or_above(threshold);

        cutoff.threshold = Some(threshold);
        cutoff.targets = targets;
        cutoff.decoys = decoys;
        cutoff.fdr = last.fdr;
        cutoff.fnr = last.fnr;
        cutoff.pep = last.pep;
        cutoff.true_positives = last.true_positives;
        cutoff
    }
}

/// Validation statistics of one level (PSM, peptide, protein...)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub map: String,
    /// Target FDR, percent
    pub target_fdr: f64,
    pub validated: usize,
    pub estimated_true_positives: f64,
    /// Estimated FDR at the selected thresholds, percent
    pub fdr_limit: f64,
    /// Estimated FNR at the selected thresholds, percent
    pub fnr_limit: f64,
    pub pep_limit: f64,
    /// Decoys over targets above the thresholds, percent
    pub empirical_fdr: f64,
    /// FDR change caused by a single decoy, percent
    pub resolution: f64,
    /// Estimated and empirical FDR disagree by more than the target FDR
    pub accuracy_warning: bool,
    pub categories: Vec<CategoryCutoff>,
}

pub struct ValidationThresholder<'a, K> {
    map: &'a ScoreMap<K>,
    target_fdr: f64,
    confident_pep: f64,
    /// Indexed like the categories of `map`
    cutoffs: Vec<CategoryCutoff>,
}

impl<'a, K: CategoryKey> ValidationThresholder<'a, K> {
    /// `target_fdr` is a percentage
    pub fn new(map: &'a ScoreMap<K>, target_fdr: f64, confident_pep: f64) -> Self {
        let cutoffs = map
            .categories()
            .map(|c| CategoryCutoff::select(c, target_fdr))
            .collect();
        Self {
            map,
            target_fdr,
            confident_pep,
            cutoffs,
        }
    }

    pub fn cutoff(&self, category: &K) -> Option<&CategoryCutoff> {
        let resolved = self.map.category(category)?;
        self.map
            .categories()
            .position(|c| c.key == resolved.key)
            .and_then(|ix| self.cutoffs.get(ix))
    }

    pub fn threshold(&self, category: &K) -> Option<f64> {
        self.cutoff(category).and_then(|c| c.threshold)
    }

    /// Recompute probability, confidence and level of a match from its raw
    /// score. User flags are preserved.
    pub fn validate(&self, validation: &mut Validation, category: &K, decoy: bool) {
        if !self.map.is_estimated() {
            validation.probability = 1.0;
            validation.confidence = 0.0;
            validation.level = ValidationLevel::None;
            return;
        }
        let pep = self.map.probability(validation.score, category);
        validation.probability = pep;
        validation.confidence = 100.0 * (1.0 - pep);
        validation.level = self.level(validation.score, pep, category, decoy);
    }

    pub fn level(&self, score: f64, pep: f64, category: &K, decoy: bool) -> ValidationLevel {
        if decoy {
            return ValidationLevel::NotValidated;
        }
        match self.threshold(category) {
            Some(threshold) if score >= threshold => match pep <= self.confident_pep {
                true => ValidationLevel::Confident,
                false => ValidationLevel::Doubtful,
            },
            _ => ValidationLevel::NotValidated,
        }
    }

    pub fn summary(&self) -> ValidationSummary {
        let targets = self.cutoffs.iter().map(|c| c.targets).sum::<usize>();
        let decoys = self.cutoffs.iter().map(|c| c.decoys).sum::<usize>();
        let true_positives = self.cutoffs.iter().map(|c| c.true_positives).sum::<f64>();
        let total_true_positives = self
            .cutoffs
            .iter()
            .map(|c| c.total_true_positives)
            .sum::<f64>();
        let false_positives = targets as f64 - true_positives;

        let fdr_limit = match targets {
            0 => 0.0,
            n => 100.0 * false_positives / n as f64,
        };
        let fnr_limit = match total_true_positives > 0.0 {
            true => 100.0 * (total_true_positives - true_positives).max(0.0) / total_true_positives,
            false => 0.0,
        };
        let empirical_fdr = match targets {
            0 => 0.0,
            n => 100.0 * decoys as f64 / n as f64,
        };
        let resolution = match targets {
            0 => 100.0,
            n => 100.0 / n as f64,
        };
        let accuracy_warning = targets > 0 && (fdr_limit - empirical_fdr).abs() > self.target_fdr;
        if accuracy_warning {
            log::warn!(
                "{}: estimated FDR ({:.2}%) and empirical FDR ({:.2}%) disagree, \
                 the validation results may be inaccurate",
                self.map.name,
                fdr_limit,
                empirical_fdr
            );
        }

        ValidationSummary {
            map: self.map.name.clone(),
            target_fdr: self.target_fdr,
            validated: targets,
            estimated_true_positives: true_positives,
            fdr_limit,
            fnr_limit,
            pep_limit: self.cutoffs.iter().map(|c| c.pep).fold(0.0, f64::max),
            empirical_fdr,
            resolution,
            accuracy_warning,
            categories: self.cutoffs.clone(),
        }
    }
}
