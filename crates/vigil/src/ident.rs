//! Identification records shared between the engine and the match store.
//!
//! The engine never owns these records: it reads them from a
//! [`MatchStore`](crate::store::MatchStore), recomputes probabilities and
//! validation levels, and writes them back.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Stable key of a match inside the store
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchKey(pub String);

impl Display for MatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MatchKey {
    fn from(s: &str) -> Self {
        MatchKey(s.to_string())
    }
}

impl From<String> for MatchKey {
    fn from(s: String) -> Self {
        MatchKey(s)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Spectrum,
    Peptide,
    Protein,
}

/// Discrete validation outcome. Ordered from least to most trustworthy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    #[default]
    None,
    NotValidated,
    Doubtful,
    Confident,
}

impl ValidationLevel {
    pub fn is_validated(&self) -> bool {
        matches!(self, ValidationLevel::Doubtful | ValidationLevel::Confident)
    }
}

/// Fields shared by every match level
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    /// Raw score fed into the score map, higher is better
    pub score: f64,
    /// Posterior error probability
    pub probability: f64,
    /// 100 * (1 - PEP)
    pub confidence: f64,
    pub level: ValidationLevel,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub hidden: bool,
}

impl Default for Validation {
    fn default() -> Self {
        Self {
            score: 0.0,
            probability: 1.0,
            confidence: 0.0,
            level: ValidationLevel::None,
            starred: false,
            hidden: false,
        }
    }
}

impl Validation {
    /// Reset everything derived by the engine, keeping user flags
    pub fn invalidate(&mut self) {
        *self = Validation {
            starred: self.starred,
            hidden: self.hidden,
            ..Default::default()
        };
    }
}

/// Relationship of a protein group to the groups it shares peptides with
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProteinInferenceClass {
    #[default]
    Unique,
    Related,
    RelatedAndUnrelated,
    Unrelated,
}

/// Tie-break criterion that allowed a shared group to be merged into one of
/// its subgroups
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeReason {
    EnzymaticEvidence,
    ProteinEvidence,
    Characterization,
}

/// Resolution state of a protein group
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    #[default]
    Unprocessed,
    ResolvedUnique,
    ResolvedAmbiguous,
    /// Resolution of this group failed, it is kept untouched
    Unresolved,
    Deleted,
}

/// Variable modification placed on a residue, 0-based
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModificationMatch {
    pub name: String,
    pub position: usize,
}

/// One search engine's candidate peptide for a spectrum
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeptideAssumption {
    pub engine: String,
    pub sequence: String,
    #[serde(default)]
    pub modifications: Vec<ModificationMatch>,
    /// Raw engine score, oriented so that higher is better
    pub score: f64,
    #[serde(default)]
    pub decoy: bool,
    /// Engine-level posterior error probability
    #[serde(default = "one")]
    pub probability: f64,
}

fn one() -> f64 {
    1.0
}

impl PeptideAssumption {
    /// Key of the peptide match this assumption supports: the sequence and
    /// the modification names, independently of where they are placed
    pub fn peptide_key(&self) -> MatchKey {
        peptide_key(&self.sequence, self.modifications.iter().map(|m| m.name.as_str()))
    }

    /// Key of the exact peptide call, including modification sites
    pub fn isoform_key(&self) -> String {
        let mut s = self.sequence.clone();
        for m in self.modifications.iter().sorted() {
            s.push_str(&format!("|{}@{}", m.name, m.position));
        }
        s
    }

    pub fn modification_names(&self) -> Vec<String> {
        self.modifications.iter().map(|m| m.name.clone()).sorted().collect()
    }
}

pub fn peptide_key<'a, I: Iterator<Item = &'a str>>(sequence: &str, modifications: I) -> MatchKey {
    let mods = modifications.sorted().join(",");
    if mods.is_empty() {
        MatchKey(sequence.to_string())
    } else {
        MatchKey(format!("{}[{}]", sequence, mods))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub mz: f64,
    pub intensity: f64,
}

/// Centroided fragment spectrum attached to a PSM
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub precursor_charge: u8,
    pub peaks: Vec<Peak>,
}

/// Localization probability of a single modification site
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteProbability {
    pub modification: String,
    /// 0-based residue index in the peptide, or 1-based in the protein when
    /// aggregated to the protein level
    pub position: usize,
    pub probability: f64,
    pub confident: bool,
    /// Spectrum providing the best evidence for the site
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectrum: Option<MatchKey>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModificationSiteAssignment {
    pub sites: Vec<SiteProbability>,
    /// Number of placements competing for the modifications
    pub placements: usize,
    /// Difference between the best and second best placement scores
    pub ascore: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectrumMatch {
    pub key: MatchKey,
    #[serde(default)]
    pub file: String,
    pub charge: u8,
    pub assumptions: Vec<PeptideAssumption>,
    /// Retained assumption, its probability is the combined engine PEP
    #[serde(default)]
    pub best: Option<PeptideAssumption>,
    /// The best assumption is tied with a structurally different peptide
    #[serde(default)]
    pub ambiguous: bool,
    #[serde(default)]
    pub spectrum: Option<Spectrum>,
    #[serde(default)]
    pub localization: Option<ModificationSiteAssignment>,
    #[serde(default)]
    pub validation: Validation,
}

impl SpectrumMatch {
    pub fn decoy(&self) -> bool {
        self.best.as_ref().map(|a| a.decoy).unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeptideMatch {
    pub key: MatchKey,
    pub sequence: String,
    pub modifications: Vec<String>,
    pub decoy: bool,
    /// Spectra whose retained assumption is this peptide
    pub spectra: Vec<MatchKey>,
    /// Parent protein accessions
    #[serde(default)]
    pub proteins: Vec<String>,
    #[serde(default)]
    pub protein_groups: Vec<MatchKey>,
    #[serde(default)]
    pub inference: ProteinInferenceClass,
    #[serde(default)]
    pub sites: Vec<SiteProbability>,
    #[serde(default)]
    pub validation: Validation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProteinMatch {
    pub key: MatchKey,
    /// Sorted, deduplicated accessions
    pub accessions: Vec<String>,
    pub main: String,
    pub decoy: bool,
    /// Peptide evidence, sorted
    pub peptides: Vec<MatchKey>,
    #[serde(default)]
    pub state: GroupState,
    #[serde(default)]
    pub inference: ProteinInferenceClass,
    #[serde(default)]
    pub merge_reasons: Vec<MergeReason>,
    #[serde(default)]
    pub sites: Vec<SiteProbability>,
    #[serde(default)]
    pub validation: Validation,
}

impl ProteinMatch {
    pub fn group_key<S: AsRef<str>>(accessions: &[S]) -> MatchKey {
        MatchKey(accessions.iter().map(|a| a.as_ref()).join("/"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Match {
    Spectrum(SpectrumMatch),
    Peptide(PeptideMatch),
    Protein(ProteinMatch),
}

impl Match {
    pub fn key(&self) -> &MatchKey {
        match self {
            Match::Spectrum(m) => &m.key,
            Match::Peptide(m) => &m.key,
            Match::Protein(m) => &m.key,
        }
    }

    pub fn kind(&self) -> MatchKind {
        match self {
            Match::Spectrum(_) => MatchKind::Spectrum,
            Match::Peptide(_) => MatchKind::Peptide,
            Match::Protein(_) => MatchKind::Protein,
        }
    }

    pub fn decoy(&self) -> bool {
        match self {
            Match::Spectrum(m) => m.decoy(),
            Match::Peptide(m) => m.decoy,
            Match::Protein(m) => m.decoy,
        }
    }

    pub fn validation(&self) -> &Validation {
        match self {
            Match::Spectrum(m) => &m.validation,
            Match::Peptide(m) => &m.validation,
            Match::Protein(m) => &m.validation,
        }
    }

    pub fn validation_mut(&mut self) -> &mut Validation {
        match self {
            Match::Spectrum(m) => &mut m.validation,
            Match::Peptide(m) => &mut m.validation,
            Match::Protein(m) => &mut m.validation,
        }
    }

    pub fn into_spectrum(self) -> Option<SpectrumMatch> {
        match self {
            Match::Spectrum(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_peptide(self) -> Option<PeptideMatch> {
        match self {
            Match::Peptide(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_protein(self) -> Option<ProteinMatch> {
        match self {
            Match::Protein(m) => Some(m),
            _ => None,
        }
    }
}
