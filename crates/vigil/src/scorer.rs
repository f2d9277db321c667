//! Probability propagation from engine scores to PSMs, peptides and protein
//! groups. Every level only consumes probabilities finalized at the level
//! below it.

use crate::config::ScoringConfig;
use crate::ident::{MatchKey, PeptideAssumption, PeptideMatch, SpectrumMatch};
use crate::score_map::ScoreMap;
use itertools::Itertools;
use std::collections::BTreeMap;

/// Smallest probability considered when converting to a score
const MIN_PROBABILITY: f64 = 1e-300;

/// Product of independent error probabilities. Factors are multiplied in
/// ascending order so the result does not depend on the input order.
pub fn combine<I: IntoIterator<Item = f64>>(probabilities: I) -> f64 {
    probabilities
        .into_iter()
        .map(|p| p.clamp(0.0, 1.0))
        .sorted_by(|a, b| a.total_cmp(b))
        .product()
}

/// Raw score fed into the score map of the next level
pub fn score_of(probability: f64) -> f64 {
    -probability.clamp(MIN_PROBABILITY, 1.0).log10()
}

/// Category of a peptide in the peptide score map
pub fn modification_profile(peptide: &PeptideMatch) -> String {
    peptide.modifications.iter().sorted().dedup().join(",")
}

pub struct ProbabilisticScorer {
    /// One score map per search engine, categorized by precursor charge
    engines: BTreeMap<String, ScoreMap<u8>>,
}

impl ProbabilisticScorer {
    /// Calibrate every engine's raw scores against its decoys
    pub fn fit<'a, I>(config: &ScoringConfig, spectra: I) -> Self
    where
        I: IntoIterator<Item = &'a SpectrumMatch>,
    {
        let mut engines: BTreeMap<String, ScoreMap<u8>> = BTreeMap::new();
        for psm in spectra {
            for assumption in &psm.assumptions {
                engines
                    .entry(assumption.engine.clone())
                    .or_insert_with(|| {
                        ScoreMap::configured(format!("engine:{}", assumption.engine), config)
                    })
                    .add_point(assumption.score, assumption.decoy, psm.charge);
            }
        }
        for map in engines.values_mut() {
            let estimate = map.estimate_probabilities();
            log::trace!("{}: {:?}", map.name, estimate);
        }
        Self { engines }
    }

    pub fn engines(&self) -> &BTreeMap<String, ScoreMap<u8>> {
        &self.engines
    }

    pub fn into_engines(self) -> BTreeMap<String, ScoreMap<u8>> {
        self.engines
    }

    /// Assign engine PEPs to every assumption, retain the assumption with
    /// the lowest combined PEP and derive the PSM raw score from it
    pub fn score_spectrum(&self, psm: &mut SpectrumMatch) {
        for assumption in psm.assumptions.iter_mut() {
            assumption.probability = self
                .engines
                .get(&assumption.engine)
                .map(|map| map.probability(assumption.score, &psm.charge))
                .unwrap_or(1.0);
        }

        // isoform key -> assumptions of every engine proposing it
        let mut candidates: BTreeMap<String, Vec<&PeptideAssumption>> = BTreeMap::new();
        for assumption in &psm.assumptions {
            candidates
                .entry(assumption.isoform_key())
                .or_default()
                .push(assumption);
        }

        let combined = candidates
            .values()
            .map(|group| {
                let pep = combine(group.iter().map(|a| a.probability));
                (pep, group)
            })
            .collect::<Vec<_>>();

        let best = combined
            .iter()
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(pep, group)| (*pep, *group));

        let (pep, group) = match best {
            Some(best) => best,
            None => {
                psm.best = None;
                psm.ambiguous = false;
                psm.validation.score = 0.0;
                return;
            }
        };

        let peptide = group[0].peptide_key();
        psm.ambiguous = combined
            .iter()
            .any(|(other, g)| *other == pep && g[0].peptide_key() != peptide);

        let mut retained = group[0].clone();
        retained.engine = group.iter().map(|a| a.engine.as_str()).sorted().dedup().join(",");
        retained.score = group.iter().map(|a| a.score).fold(f64::MIN, f64::max);
        retained.decoy = group.iter().any(|a| a.decoy);
        retained.probability = pep;

        psm.validation.score = score_of(pep);
        psm.best = Some(retained);
    }

    /// Raw score of a peptide from the PSMs supporting it. PSMs that are
    /// ambiguous, or whose retained assumption is another peptide, do not
    /// contribute.
    pub fn peptide_score<'a, I>(peptide: &MatchKey, spectra: I) -> f64
    where
        I: IntoIterator<Item = &'a SpectrumMatch>,
    {
        let peps = spectra
            .into_iter()
            .filter(|psm| !psm.ambiguous)
            .filter(|psm| {
                psm.best
                    .as_ref()
                    .map(|b| &b.peptide_key() == peptide)
                    .unwrap_or(false)
            })
            .map(|psm| psm.validation.probability)
            .collect::<Vec<_>>();
        match peps.is_empty() {
            true => 0.0,
            false => score_of(combine(peps)),
        }
    }

    /// Raw score of a protein group from the PEPs of the peptides that map
    /// to it alone
    pub fn protein_score<I: IntoIterator<Item = f64>>(unique_peptides: I) -> f64 {
        let peps = unique_peptides.into_iter().collect::<Vec<_>>();
        match peps.is_empty() {
            true => 0.0,
            false => score_of(combine(peps)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ident::{ModificationMatch, Validation};
    use quickcheck_macros::quickcheck;

    fn assumption(engine: &str, sequence: &str, score: f64, decoy: bool) -> PeptideAssumption {
        PeptideAssumption {
            engine: engine.into(),
            sequence: sequence.into(),
            modifications: Vec::new(),
            score,
            decoy,
            probability: 1.0,
        }
    }

    fn psm(key: &str, assumptions: Vec<PeptideAssumption>) -> SpectrumMatch {
        SpectrumMatch {
            key: key.into(),
            file: String::new(),
            charge: 2,
            assumptions,
            best: None,
            ambiguous: false,
            spectrum: None,
            localization: None,
            validation: Validation::default(),
        }
    }

    /// Two engines whose scores separate targets (>= 10) from decoys (< 10)
    fn training() -> Vec<SpectrumMatch> {
        let mut spectra = Vec::new();
        for i in 0..40 {
            let decoy = i % 2 == 0;
            let score = match decoy {
                true => (i % 10) as f64,
                false => 10.0 + i as f64,
            };
            spectra.push(psm(
                &format!("s{}", i),
                vec![
                    assumption("comet", "PEPTIDEK", score, decoy),
                    assumption("xtandem", "PEPTIDEK", score, decoy),
                ],
            ));
        }
        spectra
    }

    #[test]
    fn engines_are_combined() {
        let config = ScoringConfig::default();
        let spectra = training();
        let scorer = ProbabilisticScorer::fit(&config, &spectra);
        assert_eq!(scorer.engines().len(), 2);

        let mut s = psm(
            "query",
            vec![
                assumption("comet", "AAAK", 50.0, false),
                assumption("xtandem", "AAAK", 48.0, false),
                assumption("comet", "CCCK", 2.0, false),
            ],
        );
        scorer.score_spectrum(&mut s);
        let best = s.best.as_ref().unwrap();
        assert_eq!(best.sequence, "AAAK");
        assert_eq!(best.engine, "comet,xtandem");
        assert!(!s.ambiguous);
        assert_eq!(s.validation.score, score_of(best.probability));
        assert!(s.assumptions[2].probability > s.assumptions[0].probability);
    }

    #[test]
    fn ties_between_peptides_are_ambiguous() {
        let config = ScoringConfig::default();
        let scorer = ProbabilisticScorer::fit(&config, &training());
        let mut s = psm(
            "query",
            vec![
                assumption("comet", "AAAK", 50.0, false),
                assumption("comet", "AALK", 50.0, false),
            ],
        );
        scorer.score_spectrum(&mut s);
        assert!(s.ambiguous);

        // same peptide, different site: not ambiguous at the peptide level
        let mut a = assumption("comet", "SSK", 50.0, false);
        a.modifications.push(ModificationMatch {
            name: "Phospho".into(),
            position: 0,
        });
        let mut b = a.clone();
        b.modifications[0].position = 1;
        let mut s = psm("query", vec![a, b]);
        scorer.score_spectrum(&mut s);
        assert!(!s.ambiguous);
    }

    #[test]
    fn peptide_scores_skip_ambiguous_spectra() {
        let mut a = psm("a", vec![assumption("comet", "AAAK", 1.0, false)]);
        a.best = Some(assumption("comet", "AAAK", 1.0, false));
        a.validation.probability = 0.1;
        let mut b = a.clone();
        b.key = "b".into();
        b.validation.probability = 0.01;
        let mut c = a.clone();
        c.key = "c".into();
        c.ambiguous = true;
        c.validation.probability = 1e-9;

        let score = ProbabilisticScorer::peptide_score(&"AAAK".into(), [&a, &b, &c]);
        assert!((score - 3.0).abs() < 1e-9);
        assert_eq!(ProbabilisticScorer::peptide_score(&"CCCK".into(), [&a]), 0.0);
        assert_eq!(ProbabilisticScorer::protein_score(Vec::new()), 0.0);
        assert!((ProbabilisticScorer::protein_score(vec![0.1, 0.1]) - 2.0).abs() < 1e-9);
    }

    #[quickcheck]
    fn combination_ignores_order(mut peps: Vec<u16>, rotate: usize) -> bool {
        let peps = peps
            .drain(..)
            .map(|p| p as f64 / u16::MAX as f64)
            .collect::<Vec<_>>();
        let mut rotated = peps.clone();
        if !rotated.is_empty() {
            let by = rotate % rotated.len();
            rotated.rotate_left(by);
        }
        combine(peps).to_bits() == combine(rotated).to_bits()
    }
}
