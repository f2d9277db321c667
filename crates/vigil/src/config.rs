//! Scoring and validation parameters.
//!
//! [`ScoringOptions`] is what users write in the JSON parameter file: every
//! field is optional. [`ScoringOptions::build`] fills in defaults, rejects
//! values the engine cannot work with and warns about unusual ones.

use crate::enzyme::EnzymeBuilder;
use crate::mass::Tolerance;
use crate::modification::VariableModification;
use crate::sequence::SequenceMatching;
use crate::Error;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbabilisticScore {
    AScore,
    #[default]
    PhosphoRS,
}

/// How posterior error probabilities are estimated from a score map
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PepEstimator {
    /// Centered moving window over the sorted scores
    #[default]
    Window,
    /// Gaussian kernel density estimate of target and decoy scores
    Kde,
}

/// Resolved parameters. FDR and FLR values are percentages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub target_psm_fdr: f64,
    pub target_peptide_fdr: f64,
    pub target_protein_fdr: f64,
    /// Validated matches with a PEP at or below this value are confident
    pub confident_pep: f64,
    pub group_small_subgroups: bool,
    pub flr_threshold: f64,
    pub account_neutral_losses: bool,
    pub probabilistic_score: ProbabilisticScore,
    pub min_isotopic_correction: i8,
    pub max_isotopic_correction: i8,
    pub fragment_tolerance: Tolerance,
    pub pep_estimator: PepEstimator,
    /// Half-width of the PEP smoothing window, derived from the category
    /// size when unset
    pub pep_window: Option<usize>,
    /// Categories with fewer decoys are merged into a neighbour
    pub min_decoys: usize,
    pub monotonic_tolerance: f64,
    pub enzyme: EnzymeBuilder,
    pub sequence_matching: SequenceMatching,
    pub decoy_tag: String,
    pub variable_mods: Vec<VariableModification>,
    /// Fraction of system memory above which cached lookups are evicted
    pub memory_fraction: f64,
    /// Fraction of system memory above which the run is canceled
    pub critical_memory_fraction: f64,
    /// Fraction of the cache evicted under memory pressure
    pub cache_reduction: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            target_psm_fdr: 1.0,
            target_peptide_fdr: 1.0,
            target_protein_fdr: 1.0,
            confident_pep: 0.05,
            group_small_subgroups: true,
            flr_threshold: 1.0,
            account_neutral_losses: true,
            probabilistic_score: ProbabilisticScore::PhosphoRS,
            min_isotopic_correction: 0,
            max_isotopic_correction: 1,
            fragment_tolerance: Tolerance::Da(-0.02, 0.02),
            pep_estimator: PepEstimator::Window,
            pep_window: None,
            min_decoys: 5,
            monotonic_tolerance: 0.05,
            enzyme: EnzymeBuilder::default(),
            sequence_matching: SequenceMatching::IndistinguishableAminoAcids,
            decoy_tag: "rev_".into(),
            variable_mods: vec![VariableModification::phosphorylation()],
            memory_fraction: 0.9,
            critical_memory_fraction: 0.97,
            cache_reduction: 0.5,
        }
    }
}

impl ScoringConfig {
    pub fn variable_mod(&self, name: &str) -> Option<&VariableModification> {
        self.variable_mods.iter().find(|m| m.name == name)
    }
}

/// Parameters as read from the parameter file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScoringOptions {
    pub target_psm_fdr: Option<f64>,
    pub target_peptide_fdr: Option<f64>,
    pub target_protein_fdr: Option<f64>,
    pub confident_pep: Option<f64>,
    pub group_small_subgroups: Option<bool>,
    pub flr_threshold: Option<f64>,
    pub account_neutral_losses: Option<bool>,
    pub probabilistic_score: Option<ProbabilisticScore>,
    pub isotopic_correction: Option<(i8, i8)>,
    pub fragment_tolerance: Option<Tolerance>,
    pub pep_estimator: Option<PepEstimator>,
    pub pep_window: Option<usize>,
    pub min_decoys: Option<usize>,
    pub monotonic_tolerance: Option<f64>,
    pub enzyme: Option<EnzymeBuilder>,
    pub sequence_matching: Option<SequenceMatching>,
    pub decoy_tag: Option<String>,
    pub variable_mods: Option<Vec<VariableModification>>,
    pub memory_fraction: Option<f64>,
    pub critical_memory_fraction: Option<f64>,
    pub cache_reduction: Option<f64>,
}

fn percentage(name: &str, value: f64) -> Result<f64, Error> {
    if !(value > 0.0 && value <= 100.0) {
        return Err(Error::InvalidConfig(format!(
            "{} must be a percentage in (0, 100], got {}",
            name, value
        )));
    }
    if value > 10.0 {
        log::warn!("{} of {}% is higher than expected", name, value);
    }
    Ok(value)
}

fn fraction(name: &str, value: f64) -> Result<f64, Error> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::InvalidConfig(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(value)
}

impl ScoringOptions {
    pub fn build(self) -> Result<ScoringConfig, Error> {
        let default = ScoringConfig::default();

        let (min_isotopic_correction, max_isotopic_correction) = self
            .isotopic_correction
            .unwrap_or((default.min_isotopic_correction, default.max_isotopic_correction));
        if min_isotopic_correction > max_isotopic_correction {
            return Err(Error::InvalidConfig(format!(
                "isotopic_correction lower bound {} exceeds upper bound {}",
                min_isotopic_correction, max_isotopic_correction
            )));
        }

        let enzyme = self.enzyme.unwrap_or(default.enzyme);
        // surface malformed cleavage rules before any work is done
        enzyme.build()?;

        let decoy_tag = self.decoy_tag.unwrap_or(default.decoy_tag);
        if decoy_tag.is_empty() {
            return Err(Error::InvalidConfig("decoy_tag must not be empty".into()));
        }

        let settings = ScoringConfig {
            target_psm_fdr: percentage(
                "target_psm_fdr",
                self.target_psm_fdr.unwrap_or(default.target_psm_fdr),
            )?,
            target_peptide_fdr: percentage(
                "target_peptide_fdr",
                self.target_peptide_fdr.unwrap_or(default.target_peptide_fdr),
            )?,
            target_protein_fdr: percentage(
                "target_protein_fdr",
                self.target_protein_fdr.unwrap_or(default.target_protein_fdr),
            )?,
            confident_pep: fraction(
                "confident_pep",
                self.confident_pep.unwrap_or(default.confident_pep),
            )?,
            group_small_subgroups: self
                .group_small_subgroups
                .unwrap_or(default.group_small_subgroups),
            flr_threshold: percentage(
                "flr_threshold",
                self.flr_threshold.unwrap_or(default.flr_threshold),
            )?,
            account_neutral_losses: self
                .account_neutral_losses
                .unwrap_or(default.account_neutral_losses),
            probabilistic_score: self
                .probabilistic_score
                .unwrap_or(default.probabilistic_score),
            min_isotopic_correction,
            max_isotopic_correction,
            fragment_tolerance: self.fragment_tolerance.unwrap_or(default.fragment_tolerance),
            pep_estimator: self.pep_estimator.unwrap_or(default.pep_estimator),
            pep_window: self.pep_window.filter(|&w| w > 0),
            min_decoys: self.min_decoys.unwrap_or(default.min_decoys),
            monotonic_tolerance: self
                .monotonic_tolerance
                .unwrap_or(default.monotonic_tolerance)
                .abs(),
            enzyme,
            sequence_matching: self.sequence_matching.unwrap_or(default.sequence_matching),
            decoy_tag,
            variable_mods: self.variable_mods.unwrap_or(default.variable_mods),
            memory_fraction: fraction(
                "memory_fraction",
                self.memory_fraction.unwrap_or(default.memory_fraction),
            )?,
            critical_memory_fraction: fraction(
                "critical_memory_fraction",
                self.critical_memory_fraction
                    .unwrap_or(default.critical_memory_fraction),
            )?,
            cache_reduction: fraction(
                "cache_reduction",
                self.cache_reduction.unwrap_or(default.cache_reduction),
            )?,
        };

        if settings.min_decoys == 0 {
            log::warn!("min_decoys is 0, sparse categories will never be merged");
        }
        if settings.confident_pep > 0.5 {
            log::warn!("confident_pep is higher than expected");
        }
        if settings.critical_memory_fraction < settings.memory_fraction {
            log::warn!("critical_memory_fraction is below memory_fraction");
        }
        if settings.fragment_tolerance.width(1000.0) > 1.0 {
            log::warn!("fragment_tolerance is wider than expected");
        }
        if settings.variable_mods.is_empty() {
            log::warn!("no variable modifications defined, sites will not be localized");
        }

        Ok(settings)
    }
}
