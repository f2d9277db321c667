//! Contract for protein sequence lookups. Storage of the sequences lives
//! outside of the engine, see [`crate::fasta::Fasta`] for a FASTA backed
//! implementation.

use crate::mass::{Mass, H2O};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How a peptide sequence is matched against protein sequences
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceMatching {
    Exact,
    /// Isoleucine and leucine are interchangeable
    #[default]
    IndistinguishableAminoAcids,
    /// Indistinguishable amino acids, and the peptide must be an enzymatic
    /// product of the protein
    EnzymeAware,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProteinInfo {
    pub accession: String,
    pub sequence: String,
    pub description: String,
    pub gene: Option<String>,
    /// UniProt protein existence level, 1 is the strongest evidence
    pub evidence_level: Option<u8>,
    pub decoy: bool,
}

impl ProteinInfo {
    pub fn molecular_weight(&self) -> f64 {
        self.sequence.bytes().map(|aa| aa.monoisotopic()).sum::<f64>() + H2O
    }

    /// Descriptions flagged as uncharacterized or putative carry little
    /// biological information
    pub fn is_characterized(&self) -> bool {
        let description = self.description.to_ascii_lowercase();
        !description.is_empty()
            && !description.contains("uncharacterized")
            && !description.contains("putative")
    }

    /// Evidence level used for ranking, unknown levels rank last
    pub fn evidence_rank(&self) -> u8 {
        self.evidence_level.unwrap_or(u8::MAX)
    }
}

pub trait SequenceProvider: Send + Sync {
    fn protein(&self, accession: &str) -> Option<Arc<ProteinInfo>>;

    /// Accessions of every protein containing `peptide`, sorted
    fn parent_proteins(&self, peptide: &str, matching: SequenceMatching) -> Vec<String>;

    fn decoy_tag(&self) -> &str;

    /// 0-based start positions of `peptide` inside the protein
    fn peptide_starts(&self, accession: &str, peptide: &str, matching: SequenceMatching) -> Vec<usize> {
        match self.protein(accession) {
            Some(info) => find_positions(&info.sequence, peptide, matching),
            None => Vec::new(),
        }
    }
}

fn normalize(residue: u8, matching: SequenceMatching) -> u8 {
    match (matching, residue) {
        (SequenceMatching::Exact, r) => r,
        (_, b'I') => b'L',
        (_, r) => r,
    }
}

/// Start positions of every occurrence of `peptide` in `protein`,
/// overlapping occurrences included. Enzyme constraints are left to the
/// caller.
pub fn find_positions(protein: &str, peptide: &str, matching: SequenceMatching) -> Vec<usize> {
    let protein = protein.as_bytes();
    let peptide = peptide.as_bytes();
    if peptide.is_empty() || peptide.len() > protein.len() {
        return Vec::new();
    }
    protein
        .windows(peptide.len())
        .enumerate()
        .filter(|(_, window)| {
            window
                .iter()
                .zip(peptide)
                .all(|(a, b)| normalize(*a, matching) == normalize(*b, matching))
        })
        .map(|(ix, _)| ix)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn indistinguishable_matching() {
        assert_eq!(find_positions("MLEAKIEAK", "IEAK", SequenceMatching::Exact), vec![5]);
        assert_eq!(
            find_positions("MLEAKIEAK", "IEAK", SequenceMatching::IndistinguishableAminoAcids),
            vec![1, 5]
        );
        assert!(find_positions("MLE", "MLEAK", SequenceMatching::Exact).is_empty());
    }

    #[test]
    fn characterization() {
        let mut info = ProteinInfo {
            accession: "P1".into(),
            sequence: "GG".into(),
            description: "Putative kinase".into(),
            gene: None,
            evidence_level: None,
            decoy: false,
        };
        assert!(!info.is_characterized());
        info.description = "Serine/threonine kinase".into();
        assert!(info.is_characterized());
        assert_eq!(info.evidence_rank(), u8::MAX);
        assert!((info.molecular_weight() - (2.0 * 57.02146 + H2O)).abs() < 1e-6);
    }
}
