//! # Protein grouping and simplification
//!
//! Peptides are mapped back to every protein of the database containing
//! them. Proteins explaining exactly the same peptides form a group, keyed
//! by the `/`-joined list of their accessions.
//!
//! A group with several accessions ("shared" group) whose accession set
//! strictly contains other live groups is then simplified: its evidence is
//! handed over to the candidate subgroup that dominates the others, first by
//! enzymatic evidence, then by protein existence level, then by
//! characterization, and the shared group is deleted. A shared group where no
//! candidate strictly dominates is left as-is. Candidates that are themselves
//! shared are resolved first, through an explicit work stack.
//!
//! Once groups are final, each gets a main accession chosen with the same
//! dominance order.

use crate::cache::SequenceCache;
use crate::config::ScoringConfig;
use crate::enzyme::Enzyme;
use crate::ident::{GroupState, MatchKey, MergeReason, PeptideMatch, ProteinMatch};
use crate::pipeline::Stage;
use crate::progress::ProgressSink;
use crate::sequence::{find_positions, ProteinInfo, SequenceMatching};
use crate::Error;
use fnv::{FnvHashMap, FnvHashSet};
use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Ranking of a protein (or a group of proteins) as a merge target. Lower
/// compares better, field order is the tie-break order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Dominance {
    non_enzymatic: bool,
    evidence: u8,
    uncharacterized: bool,
}

impl Dominance {
    const WORST: Dominance = Dominance {
        non_enzymatic: true,
        evidence: u8::MAX,
        uncharacterized: true,
    };

    /// Criteria on which `self` is strictly better than `other`
    fn reasons(&self, other: &Dominance) -> impl Iterator<Item = MergeReason> {
        [
            (self.non_enzymatic < other.non_enzymatic, MergeReason::EnzymaticEvidence),
            (self.evidence < other.evidence, MergeReason::ProteinEvidence),
            (self.uncharacterized < other.uncharacterized, MergeReason::Characterization),
        ]
        .into_iter()
        .filter(|(better, _)| *better)
        .map(|(_, reason)| reason)
    }

    /// Best value of each criterion over several proteins
    fn best(self, other: Dominance) -> Dominance {
        Dominance {
            non_enzymatic: self.non_enzymatic && other.non_enzymatic,
            evidence: self.evidence.min(other.evidence),
            uncharacterized: self.uncharacterized && other.uncharacterized,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProteinGroup {
    pub key: MatchKey,
    /// Sorted, deduplicated
    pub accessions: Vec<String>,
    pub peptides: BTreeSet<MatchKey>,
    pub decoy: bool,
    pub state: GroupState,
    pub reasons: BTreeSet<MergeReason>,
}

impl ProteinGroup {
    fn is_live(&self) -> bool {
        self.state != GroupState::Deleted
    }

    fn is_shared(&self) -> bool {
        self.accessions.len() > 1
    }

    /// Is this group's accession set a strict subset of `other`'s?
    fn is_strict_subset_of(&self, other: &ProteinGroup) -> bool {
        self.accessions.len() < other.accessions.len()
            && self
                .accessions
                .iter()
                .all(|acc| other.accessions.binary_search(acc).is_ok())
    }
}

/// Counters describing what the simplification did
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub groups: usize,
    pub shared: usize,
    pub deleted: usize,
    pub ambiguous: usize,
    /// Shared groups kept because several candidates tied
    pub ties: usize,
    pub unresolved: usize,
    /// Number of merges in which each criterion favoured the winner
    pub reasons: BTreeMap<MergeReason, usize>,
}

/// Final protein groups and the peptide to protein mapping
#[derive(Clone, Debug)]
pub struct Resolution {
    /// Live groups, sorted by key
    pub groups: Vec<ProteinMatch>,
    /// Keys of the groups merged away
    pub deleted: Vec<MatchKey>,
    pub report: ResolutionReport,
    pub peptide_proteins: BTreeMap<MatchKey, Vec<String>>,
    pub peptide_groups: BTreeMap<MatchKey, Vec<MatchKey>>,
}

pub struct ProteinGroupResolver<'a> {
    cache: &'a SequenceCache,
    enzyme: Option<Enzyme>,
    matching: SequenceMatching,
    group_small_subgroups: bool,
    progress: Option<&'a dyn ProgressSink>,
}

impl<'a> ProteinGroupResolver<'a> {
    pub fn new(cache: &'a SequenceCache, config: &ScoringConfig) -> Result<Self, Error> {
        Ok(Self {
            cache,
            enzyme: config.enzyme.build()?,
            matching: config.sequence_matching,
            group_small_subgroups: config.group_small_subgroups,
            progress: None,
        })
    }

    /// Poll `progress` for cancellation while mapping peptides and
    /// simplifying groups
    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    fn check_canceled(&self) -> Result<(), Error> {
        match self.progress {
            Some(progress) if progress.is_canceled() => {
                Err(Error::Canceled(Stage::ProteinGrouping.name()))
            }
            _ => Ok(()),
        }
    }

    fn is_decoy(&self, accession: &str) -> bool {
        match self.cache.protein(accession) {
            Some(info) => info.decoy,
            None => accession.contains(self.cache.provider().decoy_tag()),
        }
    }

    /// Accessions of every protein explaining `peptide`
    pub fn parents(&self, peptide: &PeptideMatch) -> Result<Vec<String>, Error> {
        let parents = match peptide.proteins.is_empty() {
            false => peptide.proteins.iter().cloned().sorted().dedup().collect(),
            true => self
                .cache
                .parent_proteins(&peptide.sequence, self.matching)
                .as_ref()
                .clone(),
        };
        if parents.is_empty() {
            return Err(Error::UnmappedPeptide {
                peptide: peptide.key.to_string(),
                decoy_tag: self.cache.provider().decoy_tag().to_string(),
            });
        }
        Ok(parents)
    }

    /// One group per distinct set of parent proteins
    pub fn build_groups(
        &self,
        peptides: &[PeptideMatch],
    ) -> Result<(Vec<ProteinGroup>, BTreeMap<MatchKey, Vec<String>>), Error> {
        let time = Instant::now();
        let mut mapping: BTreeMap<Vec<String>, BTreeSet<MatchKey>> = BTreeMap::new();
        let mut peptide_proteins = BTreeMap::new();
        for peptide in peptides {
            self.check_canceled()?;
            let parents = self.parents(peptide)?;
            mapping
                .entry(parents.clone())
                .or_default()
                .insert(peptide.key.clone());
            peptide_proteins.insert(peptide.key.clone(), parents);
        }

        let groups = mapping
            .into_iter()
            .map(|(accessions, peptides)| ProteinGroup {
                key: ProteinMatch::group_key(&accessions),
                decoy: accessions.iter().all(|acc| self.is_decoy(acc)),
                accessions,
                peptides,
                state: GroupState::Unprocessed,
                reasons: BTreeSet::new(),
            })
            .sorted_by(|a, b| a.key.cmp(&b.key))
            .collect::<Vec<_>>();

        info!(
            "-  mapped {} peptides to {} protein groups in {:?}ms",
            peptides.len(),
            groups.len(),
            time.elapsed().as_millis()
        );
        Ok((groups, peptide_proteins))
    }

    fn enzymatic(&self, protein: &ProteinInfo, sequence: &str) -> bool {
        match &self.enzyme {
            None => true,
            Some(enzyme) => find_positions(&protein.sequence, sequence, self.matching)
                .into_iter()
                .any(|start| enzyme.is_enzymatic(&protein.sequence, start, start + sequence.len())),
        }
    }

    /// Dominance of a single protein with respect to the peptides in
    /// `sequences`: it has enzymatic evidence if every one of them is an
    /// enzymatic product of it
    fn protein_dominance(&self, accession: &str, sequences: &[&str]) -> Result<Dominance, Error> {
        let info = self
            .cache
            .protein(accession)
            .ok_or_else(|| Error::MissingProtein(accession.to_string()))?;
        Ok(Dominance {
            non_enzymatic: !sequences.iter().all(|seq| self.enzymatic(&info, seq)),
            evidence: info.evidence_rank(),
            uncharacterized: !info.is_characterized(),
        })
    }

    fn group_dominance(&self, group: &ProteinGroup, sequences: &[&str]) -> Result<Dominance, Error> {
        group
            .accessions
            .iter()
            .map(|acc| self.protein_dominance(acc, sequences))
            .try_fold(Dominance::WORST, |acc, d| Ok(acc.best(d?)))
    }

    /// Simplify `groups` in place
    pub fn simplify(
        &self,
        groups: &mut [ProteinGroup],
        sequences: &FnvHashMap<MatchKey, String>,
    ) -> Result<ResolutionReport, Error> {
        let time = Instant::now();
        let mut report = ResolutionReport {
            groups: groups.len(),
            shared: groups.iter().filter(|g| g.is_shared()).count(),
            ..Default::default()
        };

        let mut by_accession: FnvHashMap<&str, Vec<usize>> = FnvHashMap::default();
        for (ix, group) in groups.iter().enumerate() {
            for acc in &group.accessions {
                by_accession.entry(acc.as_str()).or_default().push(ix);
            }
        }
        let by_accession = by_accession
            .into_iter()
            .map(|(acc, ixs)| (acc.to_string(), ixs))
            .collect::<FnvHashMap<String, Vec<usize>>>();

        // Largest shared groups first, their subgroups are pushed on top of
        // them and resolved before them
        let order = (0..groups.len())
            .filter(|&ix| groups[ix].is_shared())
            .sorted_by(|&a, &b| {
                groups[b]
                    .accessions
                    .len()
                    .cmp(&groups[a].accessions.len())
                    .then_with(|| groups[a].key.cmp(&groups[b].key))
            })
            .collect::<Vec<_>>();

        let mut processed: FnvHashMap<usize, GroupState> = FnvHashMap::default();
        for root in order {
            if processed.contains_key(&root) {
                continue;
            }
            let mut stack = vec![root];
            while let Some(&top) = stack.last() {
                self.check_canceled()?;
                if processed.contains_key(&top) || !groups[top].is_live() {
                    stack.pop();
                    continue;
                }
                let candidates = self.candidates(groups, &by_accession, top);
                let pending = candidates
                    .iter()
                    .copied()
                    .filter(|&ix| groups[ix].is_shared() && !processed.contains_key(&ix))
                    .collect::<Vec<_>>();
                if !pending.is_empty() {
                    stack.extend(pending);
                    continue;
                }

                let state = match self.resolve_shared(groups, top, &candidates, sequences, &mut report) {
                    Ok(state) => state,
                    Err(e) => {
                        log::warn!("unable to resolve protein group {}: {}", groups[top].key, e);
                        GroupState::Unresolved
                    }
                };
                groups[top].state = state;
                processed.insert(top, state);
                stack.pop();
            }
        }

        for group in groups.iter_mut() {
            match group.state {
                GroupState::Unprocessed if group.is_shared() => {
                    group.state = GroupState::ResolvedAmbiguous
                }
                GroupState::Unprocessed => group.state = GroupState::ResolvedUnique,
                _ => {}
            }
            match group.state {
                GroupState::Deleted => report.deleted += 1,
                GroupState::ResolvedAmbiguous => report.ambiguous += 1,
                GroupState::Unresolved => report.unresolved += 1,
                _ => {}
            }
        }

        info!(
            "-  simplified {} shared protein groups ({} deleted, {} ambiguous) in {:?}ms",
            report.shared,
            report.deleted,
            report.ambiguous,
            time.elapsed().as_millis()
        );
        Ok(report)
    }

    /// Live groups whose accessions are a strict subset of `groups[ix]`'s
    fn candidates(
        &self,
        groups: &[ProteinGroup],
        by_accession: &FnvHashMap<String, Vec<usize>>,
        ix: usize,
    ) -> Vec<usize> {
        let group = &groups[ix];
        group
            .accessions
            .iter()
            .filter_map(|acc| by_accession.get(acc))
            .flatten()
            .copied()
            .filter(|&other| other != ix)
            .collect::<FnvHashSet<_>>()
            .into_iter()
            .filter(|&other| groups[other].is_live() && groups[other].is_strict_subset_of(group))
            .sorted()
            .collect()
    }

    fn resolve_shared(
        &self,
        groups: &mut [ProteinGroup],
        ix: usize,
        candidates: &[usize],
        sequences: &FnvHashMap<MatchKey, String>,
        report: &mut ResolutionReport,
    ) -> Result<GroupState, Error> {
        if candidates.is_empty() {
            return Ok(GroupState::ResolvedAmbiguous);
        }
        if candidates.len() > 1 && !self.group_small_subgroups {
            return Ok(GroupState::ResolvedAmbiguous);
        }

        let shared = groups[ix]
            .peptides
            .iter()
            .filter_map(|key| sequences.get(key).map(|s| s.as_str()))
            .collect::<Vec<_>>();
        let ranked = candidates
            .iter()
            .map(|&c| Ok((self.group_dominance(&groups[c], &shared)?, c)))
            .collect::<Result<Vec<_>, Error>>()?;

        let best = ranked.iter().map(|(d, _)| *d).min().unwrap_or(Dominance::WORST);
        let winners = ranked
            .iter()
            .filter(|(d, _)| *d == best)
            .map(|(_, c)| *c)
            .collect::<Vec<_>>();

        let winner = match winners.as_slice() {
            [winner] => *winner,
            _ => {
                report.ties += 1;
                log::trace!(
                    "protein group {} has {} equally supported subgroups",
                    groups[ix].key,
                    winners.len()
                );
                return Ok(GroupState::ResolvedAmbiguous);
            }
        };

        let reasons = ranked
            .iter()
            .filter(|(_, c)| *c != winner)
            .flat_map(|(d, _)| best.reasons(d))
            .collect::<BTreeSet<_>>();
        for reason in &reasons {
            *report.reasons.entry(*reason).or_default() += 1;
        }

        let evidence = groups[ix].peptides.clone();
        groups[winner].peptides.extend(evidence);
        groups[winner].reasons.extend(reasons);
        Ok(GroupState::Deleted)
    }

    /// Choose the representative accession of a group
    pub fn main_accession(&self, group: &ProteinGroup, sequences: &FnvHashMap<MatchKey, String>) -> String {
        let peptides = group
            .peptides
            .iter()
            .filter_map(|key| sequences.get(key).map(|s| s.as_str()))
            .collect::<Vec<_>>();
        group
            .accessions
            .iter()
            .map(|acc| {
                let rank = self
                    .protein_dominance(acc, &peptides)
                    .unwrap_or(Dominance::WORST);
                (rank, acc)
            })
            .min()
            .map(|(_, acc)| acc.clone())
            .unwrap_or_default()
    }

    /// Build, simplify and annotate protein groups for `peptides`.
    /// Fails if a peptide maps to no protein.
    pub fn resolve(&self, peptides: &[PeptideMatch]) -> Result<Resolution, Error> {
        let time = Instant::now();
        let sequences = peptides
            .iter()
            .map(|p| (p.key.clone(), p.sequence.clone()))
            .collect::<FnvHashMap<_, _>>();

        let (mut groups, peptide_proteins) = self.build_groups(peptides)?;
        let report = self.simplify(&mut groups, &sequences)?;

        let mut peptide_groups: BTreeMap<MatchKey, Vec<MatchKey>> = BTreeMap::new();
        let mut deleted = Vec::new();
        let mut live = Vec::new();
        for group in &groups {
            if !group.is_live() {
                deleted.push(group.key.clone());
                continue;
            }
            for peptide in &group.peptides {
                peptide_groups
                    .entry(peptide.clone())
                    .or_default()
                    .push(group.key.clone());
            }
            live.push(ProteinMatch {
                key: group.key.clone(),
                accessions: group.accessions.clone(),
                main: self.main_accession(group, &sequences),
                decoy: group.decoy,
                peptides: group.peptides.iter().cloned().collect(),
                state: group.state,
                inference: Default::default(),
                merge_reasons: group.reasons.iter().copied().collect(),
                sites: Vec::new(),
                validation: Default::default(),
            });
        }

        info!(
            "Grouped {} peptides into {} protein groups in {:?}ms",
            peptides.len(),
            live.len(),
            time.elapsed().as_millis()
        );

        Ok(Resolution {
            groups: live,
            deleted,
            report,
            peptide_proteins,
            peptide_groups,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fasta::Fasta;
    use crate::ident::Validation;
    use quickcheck_macros::quickcheck;
    use std::sync::Arc;

    const FASTA: &str = r#"
>P1 Serine kinase OS=Homo sapiens GN=KIN1 PE=1
MAAAKSHAREDKLLLLLK
>P2 Tyrosine phosphatase OS=Homo sapiens GN=PTP2 PE=3
MGGGGSHAREDKWWWWR
>P3 Serine kinase OS=Homo sapiens GN=KIN3 PE=1
MCCCKSHAREDKEEEEK
"#;

    fn peptide(sequence: &str) -> PeptideMatch {
        PeptideMatch {
            key: sequence.into(),
            sequence: sequence.into(),
            modifications: Vec::new(),
            decoy: false,
            spectra: Vec::new(),
            proteins: Vec::new(),
            protein_groups: Vec::new(),
            inference: Default::default(),
            sites: Vec::new(),
            validation: Validation::default(),
        }
    }

    fn cache(fasta: &str) -> SequenceCache {
        SequenceCache::new(Arc::new(Fasta::parse(fasta.into(), "rev_")))
    }

    #[test]
    fn enzymatic_subgroup_wins() {
        let cache = cache(FASTA);
        let resolver = ProteinGroupResolver::new(&cache, &ScoringConfig::default()).unwrap();
        let peptides = vec![peptide("SHAREDK"), peptide("LLLLLK"), peptide("WWWWR")];
        // SHAREDK is also in P3, restrict the shared peptide to P1 and P2
        let mut peptides = peptides;
        peptides[0].proteins = vec!["P2".into(), "P1".into()];

        let resolution = resolver.resolve(&peptides).unwrap();
        assert_eq!(resolution.deleted, vec![MatchKey::from("P1/P2")]);
        let keys = resolution.groups.iter().map(|g| g.key.0.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["P1", "P2"]);

        let p1 = &resolution.groups[0];
        assert_eq!(p1.peptides, vec![MatchKey::from("LLLLLK"), MatchKey::from("SHAREDK")]);
        assert_eq!(
            p1.merge_reasons,
            vec![MergeReason::EnzymaticEvidence, MergeReason::ProteinEvidence]
        );
        assert_eq!(resolution.report.reasons[&MergeReason::EnzymaticEvidence], 1);
        assert_eq!(resolution.report.reasons[&MergeReason::ProteinEvidence], 1);
        assert!(!resolution.report.reasons.contains_key(&MergeReason::Characterization));
        assert_eq!(
            resolution.peptide_groups[&MatchKey::from("SHAREDK")],
            vec![MatchKey::from("P1")]
        );
    }

    #[test]
    fn tied_subgroups_keep_the_shared_group() {
        let cache = cache(FASTA);
        let resolver = ProteinGroupResolver::new(&cache, &ScoringConfig::default()).unwrap();
        let mut peptides = vec![peptide("SHAREDK"), peptide("LLLLLK"), peptide("EEEEK")];
        peptides[0].proteins = vec!["P1".into(), "P3".into()];
        let resolution = resolver.resolve(&peptides).unwrap();
        assert_eq!(resolution.report.ties, 1);
        assert!(resolution.deleted.is_empty());
        assert!(resolution.report.reasons.is_empty());

        let states = resolution
            .groups
            .iter()
            .map(|g| (g.key.0.as_str(), g.state))
            .collect::<Vec<_>>();
        assert_eq!(
            states,
            vec![
                ("P1", GroupState::ResolvedUnique),
                ("P1/P3", GroupState::ResolvedAmbiguous),
                ("P3", GroupState::ResolvedUnique),
            ]
        );
        assert_eq!(resolution.groups[1].peptides, vec![MatchKey::from("SHAREDK")]);
        assert_eq!(
            resolution.peptide_groups[&MatchKey::from("SHAREDK")],
            vec![MatchKey::from("P1/P3")]
        );
        for group in [&resolution.groups[0], &resolution.groups[2]] {
            assert!(!group.peptides.contains(&MatchKey::from("SHAREDK")));
        }
    }

    #[test]
    fn shared_group_without_subgroups() {
        let cache = cache(FASTA);
        let resolver = ProteinGroupResolver::new(&cache, &ScoringConfig::default()).unwrap();
        let resolution = resolver.resolve(&[peptide("SHAREDK")]).unwrap();
        assert_eq!(resolution.groups.len(), 1);
        let group = &resolution.groups[0];
        assert_eq!(group.key, MatchKey::from("P1/P2/P3"));
        assert_eq!(group.state, GroupState::ResolvedAmbiguous);
        // P2 has weaker evidence, P1 and P3 tie and P1 sorts first
        assert_eq!(group.main, "P1");
    }

    #[test]
    fn unmapped_peptide_is_fatal() {
        let cache = cache(FASTA);
        let resolver = ProteinGroupResolver::new(&cache, &ScoringConfig::default()).unwrap();
        let err = resolver
            .resolve(&[peptide("LLLLLK"), peptide("NOTHEREK")])
            .unwrap_err();
        match err {
            Error::UnmappedPeptide { peptide, decoy_tag } => {
                assert_eq!(peptide, "NOTHEREK");
                assert_eq!(decoy_tag, "rev_");
            }
            e => panic!("unexpected error {}", e),
        }
    }

    #[test]
    fn canceled_before_mapping() {
        let cache = cache(FASTA);
        let progress = crate::progress::LogProgress::default();
        progress.set_canceled();
        let resolver = ProteinGroupResolver::new(&cache, &ScoringConfig::default())
            .unwrap()
            .with_progress(&progress);
        let err = resolver.resolve(&[peptide("LLLLLK")]).unwrap_err();
        assert!(matches!(err, Error::Canceled("protein grouping")));
    }

    #[test]
    fn missing_metadata_isolates_group() {
        let cache = cache(FASTA);
        let resolver = ProteinGroupResolver::new(&cache, &ScoringConfig::default()).unwrap();
        let mut peptides = vec![peptide("SHAREDK"), peptide("LLLLLK"), peptide("AAAK")];
        peptides[0].proteins = vec!["P1".into(), "P9".into()];
        peptides[2].proteins = vec!["P9".into()];
        let resolution = resolver.resolve(&peptides).unwrap();
        assert_eq!(resolution.report.unresolved, 1);
        assert!(resolution
            .groups
            .iter()
            .any(|g| g.key.0 == "P1/P9" && g.state == GroupState::Unresolved));
    }

    const RANDOM_FASTA: &str = ">A0 Alpha PE=1\nKAAAK\n>A1 Beta PE=2\nKCCCK\n>A2 Gamma PE=1\nKDDDK\n>A3 Delta PE=3\nKEEEK\n>A4 Epsilon\nKFFFK\n";

    #[quickcheck]
    fn no_containment_and_evidence_conservation(parents: Vec<Vec<u8>>) -> bool {
        let cache = cache(RANDOM_FASTA);
        let resolver = ProteinGroupResolver::new(&cache, &ScoringConfig::default()).unwrap();
        let peptides = parents
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_empty())
            .map(|(ix, p)| {
                let mut pep = peptide(&format!("PEP{}", ix));
                pep.proteins = p.iter().map(|a| format!("A{}", a % 5)).collect();
                pep
            })
            .collect::<Vec<_>>();

        let resolution = resolver.resolve(&peptides).unwrap();
        let live = &resolution.groups;
        // only groups that could not be reduced may still contain another one
        let contained = live.iter().any(|a| {
            live.iter().any(|b| {
                a.accessions.len() < b.accessions.len()
                    && a.accessions.iter().all(|acc| b.accessions.contains(acc))
                    && b.state != GroupState::ResolvedAmbiguous
                    && b.state != GroupState::Unresolved
            })
        });

        let explained = live
            .iter()
            .flat_map(|g| g.peptides.iter().cloned())
            .collect::<BTreeSet<_>>();
        let expected = peptides.iter().map(|p| p.key.clone()).collect::<BTreeSet<_>>();
        !contained && explained == expected
    }
}
