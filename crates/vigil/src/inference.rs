//! Protein inference classes: how the proteins a group's peptides could come
//! from relate to each other, judged from gene names and descriptions.

use crate::cache::SequenceCache;
use crate::ident::{MatchKey, ProteinInferenceClass, ProteinMatch};
use crate::sequence::ProteinInfo;
use fnv::FnvHashSet;
use itertools::Itertools;
use std::collections::BTreeMap;

/// Gene family: lowercase name without its trailing number, or without its
/// last letter when it carries no number (ACTA1 -> acta, ACTB -> act)
fn family(gene: &str) -> String {
    let gene = gene.to_ascii_lowercase();
    let stripped = gene.trim_end_matches(|c: char| c.is_ascii_digit());
    if stripped.len() != gene.len() || gene.len() < 2 {
        return stripped.to_string();
    }
    gene[..gene.len() - 1].to_string()
}

fn similar_genes(a: &str, b: &str) -> bool {
    if a.eq_ignore_ascii_case(b) {
        return true;
    }
    let (a, b) = (family(a), family(b));
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    let (short, long) = match a.len() <= b.len() {
        true => (&a, &b),
        false => (&b, &a),
    };
    short.len() >= 3 && long.contains(short.as_str())
}

fn words(description: &str) -> FnvHashSet<String> {
    description
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_ascii_lowercase())
        .collect()
}

fn similar_descriptions(a: &ProteinInfo, b: &ProteinInfo) -> bool {
    if !a.is_characterized() || !b.is_characterized() {
        return false;
    }
    let (a, b) = (words(&a.description), words(&b.description));
    let smallest = a.len().min(b.len());
    if smallest == 0 {
        return false;
    }
    let shared = a.intersection(&b).count();
    2 * shared >= smallest
}

/// Are two proteins likely products of related genes?
pub fn similar(a: &ProteinInfo, b: &ProteinInfo) -> bool {
    if let (Some(ga), Some(gb)) = (&a.gene, &b.gene) {
        if similar_genes(ga, gb) {
            return true;
        }
    }
    similar_descriptions(a, b)
}

fn classify<I: IntoIterator<Item = bool>>(pairs: I) -> ProteinInferenceClass {
    let (mut related, mut unrelated) = (false, false);
    for similar in pairs {
        match similar {
            true => related = true,
            false => unrelated = true,
        }
    }
    match (related, unrelated) {
        (false, false) => ProteinInferenceClass::Unique,
        (true, false) => ProteinInferenceClass::Related,
        (false, true) => ProteinInferenceClass::Unrelated,
        (true, true) => ProteinInferenceClass::RelatedAndUnrelated,
    }
}

/// Inference classes of the protein groups and of their peptides
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Inference {
    pub groups: BTreeMap<MatchKey, ProteinInferenceClass>,
    pub peptides: BTreeMap<MatchKey, ProteinInferenceClass>,
}

/// Compare every pair of accessions inside a group, and the group's main
/// accession with the accessions of the groups it shares peptides with.
/// Unknown accessions are never similar to anything.
pub fn infer(groups: &[ProteinMatch], cache: &SequenceCache) -> Inference {
    let mut peptide_groups: BTreeMap<&MatchKey, Vec<usize>> = BTreeMap::new();
    for (ix, group) in groups.iter().enumerate() {
        for peptide in &group.peptides {
            peptide_groups.entry(peptide).or_default().push(ix);
        }
    }

    let pair = |a: &str, b: &str| match (cache.protein(a), cache.protein(b)) {
        (Some(a), Some(b)) => similar(&a, &b),
        _ => false,
    };

    let mut inference = Inference::default();
    for (ix, group) in groups.iter().enumerate() {
        let mut pairs = group
            .accessions
            .iter()
            .tuple_combinations()
            .map(|(a, b)| pair(a.as_str(), b.as_str()))
            .collect::<Vec<_>>();

        let neighbours = group
            .peptides
            .iter()
            .filter_map(|p| peptide_groups.get(p))
            .flatten()
            .filter(|&&other| other != ix)
            .flat_map(|&other| groups[other].accessions.iter())
            .filter(|acc| **acc != group.main && group.accessions.binary_search(*acc).is_err())
            .sorted()
            .dedup();
        pairs.extend(neighbours.map(|acc| pair(group.main.as_str(), acc.as_str())));

        inference.groups.insert(group.key.clone(), classify(pairs));
    }

    for (peptide, ixs) in peptide_groups {
        let class = ixs
            .iter()
            .filter_map(|&ix| inference.groups.get(&groups[ix].key))
            .copied()
            .max()
            .unwrap_or_default();
        inference.peptides.insert(peptide.clone(), class);
    }
    inference
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fasta::Fasta;
    use crate::ident::GroupState;
    use std::sync::Arc;

    fn info(gene: Option<&str>, description: &str) -> ProteinInfo {
        ProteinInfo {
            accession: String::new(),
            sequence: String::new(),
            description: description.into(),
            gene: gene.map(|g| g.into()),
            evidence_level: None,
            decoy: false,
        }
    }

    #[test]
    fn gene_similarity() {
        assert!(similar_genes("ACTA1", "acta1"));
        assert!(similar_genes("ACTA1", "ACTA2"));
        assert!(similar_genes("ACTB", "ACTG1"));
        assert!(similar_genes("HIST1H2BK", "HIST1H2B"));
        assert!(!similar_genes("TP53", "MDM2"));
        assert!(!similar_genes("AB1", "AC1"));
    }

    #[test]
    fn description_similarity() {
        let a = info(None, "Actin, cytoplasmic 1");
        let b = info(None, "Actin, cytoplasmic 2");
        let c = info(None, "Cellular tumor antigen p53");
        let d = info(None, "Uncharacterized protein actin cytoplasmic");
        assert!(similar(&a, &b));
        assert!(!similar(&a, &c));
        assert!(!similar(&a, &d));
        assert!(similar(&info(Some("TP53"), "x"), &info(Some("tp53"), "y")));
    }

    #[test]
    fn classes() {
        assert_eq!(classify(Vec::new()), ProteinInferenceClass::Unique);
        assert_eq!(classify(vec![true, true]), ProteinInferenceClass::Related);
        assert_eq!(classify(vec![false]), ProteinInferenceClass::Unrelated);
        assert_eq!(
            classify(vec![true, false]),
            ProteinInferenceClass::RelatedAndUnrelated
        );
    }

    fn group(accessions: &[&str], peptides: &[&str]) -> ProteinMatch {
        ProteinMatch {
            key: ProteinMatch::group_key(accessions),
            accessions: accessions.iter().map(|a| a.to_string()).collect(),
            main: accessions[0].into(),
            decoy: false,
            peptides: peptides.iter().map(|&p| p.into()).collect(),
            state: GroupState::ResolvedUnique,
            inference: Default::default(),
            merge_reasons: Vec::new(),
            sites: Vec::new(),
            validation: Default::default(),
        }
    }

    #[test]
    fn groups_and_peptides() {
        let fasta = Fasta::parse(
            ">A1 Actin, cytoplasmic 1 GN=ACTB\nAAAK\n>A2 Actin, cytoplasmic 2 GN=ACTG1\nCCCK\n>T1 Cellular tumor antigen p53 GN=TP53\nDDDK\n>U1 Ubiquitin GN=UBB\nEEEK\n"
                .into(),
            "rev_",
        );
        let cache = SequenceCache::new(Arc::new(fasta));
        let groups = vec![
            group(&["A1", "A2"], &["ACT"]),
            group(&["A1", "T1"], &["MIX", "SHARED"]),
            group(&["U1"], &["UBI"]),
            group(&["T1"], &["P53", "SHARED"]),
        ];
        let inference = infer(&groups, &cache);
        assert_eq!(inference.groups[&MatchKey::from("A1/A2")], ProteinInferenceClass::Related);
        assert_eq!(inference.groups[&MatchKey::from("U1")], ProteinInferenceClass::Unique);
        assert_eq!(inference.groups[&MatchKey::from("A1/T1")], ProteinInferenceClass::Unrelated);
        assert_eq!(inference.groups[&MatchKey::from("T1")], ProteinInferenceClass::Unrelated);
        assert_eq!(inference.peptides[&MatchKey::from("SHARED")], ProteinInferenceClass::Unrelated);
        assert_eq!(inference.peptides[&MatchKey::from("UBI")], ProteinInferenceClass::Unique);
    }
}
