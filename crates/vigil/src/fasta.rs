use crate::enzyme::Enzyme;
use crate::sequence::{find_positions, ProteinInfo, SequenceMatching, SequenceProvider};
use fnv::FnvHashMap;
use rayon::prelude::*;
use std::sync::Arc;

/// In-memory protein database implementing [`SequenceProvider`]
pub struct Fasta {
    proteins: Vec<Arc<ProteinInfo>>,
    index: FnvHashMap<String, usize>,
    decoy_tag: String,
    enzyme: Option<Enzyme>,
}

/// Split a UniProt style header into accession, description, gene name and
/// protein existence level
fn parse_header(header: &str, decoy_tag: &str) -> ProteinInfo {
    let mut tokens = header.splitn(2, char::is_whitespace);
    let accession = tokens.next().unwrap_or_default().to_string();
    let rest = tokens.next().unwrap_or_default().trim();

    let description = match rest.find(" OS=") {
        Some(ix) => &rest[..ix],
        None => rest,
    };

    let field = |name: &str| {
        rest.split_ascii_whitespace()
            .find_map(|tok| tok.strip_prefix(name))
            .map(|s| s.to_string())
    };

    ProteinInfo {
        decoy: accession.contains(decoy_tag),
        accession,
        sequence: String::new(),
        description: description.trim().to_string(),
        gene: field("GN="),
        evidence_level: field("PE=").and_then(|pe| pe.parse().ok()),
    }
}

impl Fasta {
    // Parse a string into a fasta database
    pub fn parse<S: Into<String>>(contents: String, decoy_tag: S) -> Fasta {
        let decoy_tag = decoy_tag.into();

        let mut proteins = Vec::new();
        let mut current: Option<ProteinInfo> = None;

        for line in contents.as_str().lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('>') {
                if let Some(info) = current.take() {
                    if !info.sequence.is_empty() {
                        proteins.push(info);
                    }
                }
                current = Some(parse_header(header, &decoy_tag));
            } else if let Some(info) = current.as_mut() {
                info.sequence.push_str(line);
            }
        }

        if let Some(info) = current.take() {
            if !info.sequence.is_empty() {
                proteins.push(info);
            }
        }

        let index = proteins
            .iter()
            .enumerate()
            .map(|(ix, p)| (p.accession.clone(), ix))
            .collect();

        Fasta {
            proteins: proteins.into_iter().map(Arc::new).collect(),
            index,
            decoy_tag,
            enzyme: None,
        }
    }

    pub fn with_enzyme(mut self, enzyme: Option<Enzyme>) -> Self {
        self.enzyme = enzyme;
        self
    }

    pub fn len(&self) -> usize {
        self.proteins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proteins.is_empty()
    }

    fn contains(&self, protein: &ProteinInfo, peptide: &str, matching: SequenceMatching) -> bool {
        let positions = find_positions(&protein.sequence, peptide, matching);
        match (matching, &self.enzyme) {
            (SequenceMatching::EnzymeAware, Some(enzyme)) => positions
                .into_iter()
                .any(|start| enzyme.is_enzymatic(&protein.sequence, start, start + peptide.len())),
            _ => !positions.is_empty(),
        }
    }
}

impl SequenceProvider for Fasta {
    fn protein(&self, accession: &str) -> Option<Arc<ProteinInfo>> {
        self.index
            .get(accession)
            .map(|&ix| self.proteins[ix].clone())
    }

    fn parent_proteins(&self, peptide: &str, matching: SequenceMatching) -> Vec<String> {
        let mut parents = self
            .proteins
            .par_iter()
            .filter(|protein| self.contains(protein, peptide, matching))
            .map(|protein| protein.accession.clone())
            .collect::<Vec<_>>();
        parents.sort();
        parents
    }

    fn decoy_tag(&self) -> &str {
        &self.decoy_tag
    }
}
