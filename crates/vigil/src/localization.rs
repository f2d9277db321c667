//! Modification site localization.
//!
//! Every placement of a variable modification on the residues able to carry
//! it is scored against the fragment spectrum, either with a PhosphoRS-like
//! binomial model or with a depth-weighted AScore. Placement scores are
//! turned into probabilities, and a site's probability is the sum of the
//! probabilities of the placements using it.
//!
//! The false localization rate is controlled with decoy placements: the
//! modification is moved onto a residue that cannot carry it, and the
//! probability such a placement obtains against the valid ones is used as a
//! decoy observation for a [`ScoreMap`].
//!
//! Taus et al., 2011 [https://pubmed.ncbi.nlm.nih.gov/22073976/]
//! Beausoleil et al., 2006 [https://pubmed.ncbi.nlm.nih.gov/16964243/]

use crate::config::{ProbabilisticScore, ScoringConfig};
use crate::ident::{ModificationSiteAssignment, Peak, SiteProbability, SpectrumMatch};
use crate::ions::{fragment_mz, FragmentSettings};
use crate::mass::{Mass, Tolerance};
use crate::modification::VariableModification;
use crate::score_map::ScoreMap;
use crate::threshold::ValidationThresholder;
use fnv::FnvHashMap;
use itertools::Itertools;
use statrs::distribution::{Binomial, DiscreteCDF};
use std::collections::BTreeMap;

/// Placements enumerated per modification before giving up on the
/// remaining combinations
const MAX_PLACEMENTS: usize = 4096;

/// Peak depth weights of the AScore, for 1 to 10 peaks per 100 m/z
const ASCORE_WEIGHTS: [f64; 10] = [0.5, 0.75, 1.0, 1.0, 1.0, 1.0, 0.75, 0.5, 0.25, 0.25];

/// Site assignment of one PSM, with its contribution to the FLR estimate
#[derive(Clone, Debug, PartialEq)]
pub struct Localization {
    pub assignment: ModificationSiteAssignment,
    /// (probability, is_decoy) observations for the FLR score map
    pub observations: Vec<(f64, bool)>,
}

/// `-log10(P(X >= k))` for `X ~ Binomial(n, p)`
fn binomial_score(n: usize, k: usize, p: f64) -> f64 {
    if n == 0 || k == 0 {
        return 0.0;
    }
    let p = p.clamp(f64::EPSILON, 1.0 - f64::EPSILON);
    let tail = match Binomial::new(p, n as u64) {
        Ok(binomial) => binomial.sf(k as u64 - 1),
        Err(_) => 1.0,
    };
    -tail.clamp(1e-300, 1.0).log10()
}

/// Placements of `base` with one site moved onto one of the `impossible`
/// residues, sorted and without duplicates. A placement may already use an
/// impossible residue when the engine reported one.
fn decoy_placements(base: &[usize], impossible: &[usize]) -> Vec<Vec<usize>> {
    (0..base.len())
        .flat_map(|ix| {
            impossible.iter().map(move |&pos| {
                let mut positions = base.to_vec();
                positions[ix] = pos;
                positions.sort_unstable();
                positions
            })
        })
        .filter(|positions| positions != base)
        .filter(|positions| positions.iter().tuple_windows().all(|(a, b)| a != b))
        .sorted()
        .dedup()
        .collect()
}

/// Turn log10 weights into probabilities summing to one
fn normalize(log_weights: &[f64]) -> Vec<f64> {
    let max = log_weights.iter().copied().fold(f64::MIN, f64::max);
    let weights = log_weights
        .iter()
        .map(|w| 10f64.powf(w - max))
        .collect::<Vec<_>>();
    let total = weights.iter().sum::<f64>();
    weights.into_iter().map(|w| w / total).collect()
}

/// Keep the `depth` most intense peaks of every 100 m/z window
fn extract(peaks: &[Peak], depth: usize) -> Vec<f64> {
    let mut windows: BTreeMap<i64, Vec<&Peak>> = BTreeMap::new();
    for peak in peaks {
        windows
            .entry((peak.mz / 100.0).floor() as i64)
            .or_default()
            .push(peak);
    }
    windows
        .into_values()
        .flat_map(|window| {
            window
                .into_iter()
                .sorted_by(|a, b| b.intensity.total_cmp(&a.intensity))
                .take(depth)
                .map(|p| p.mz)
        })
        .sorted_by(|a, b| a.total_cmp(b))
        .collect()
}

/// Number of theoretical fragments matching at least one peak
fn matched(theoretical: &[f64], peaks: &[f64], tolerance: Tolerance) -> usize {
    theoretical
        .iter()
        .filter(|&&mz| {
            let (lo, _) = tolerance.bounds(mz);
            let ix = peaks.partition_point(|&p| p < lo);
            peaks.get(ix).map(|&p| tolerance.contains(mz, p)).unwrap_or(false)
        })
        .count()
}

pub struct PTMLocalizationScorer<'a> {
    config: &'a ScoringConfig,
}

impl<'a> PTMLocalizationScorer<'a> {
    pub fn new(config: &'a ScoringConfig) -> Self {
        Self { config }
    }

    fn settings(&self, precursor_charge: u8) -> FragmentSettings {
        FragmentSettings {
            max_charge: match precursor_charge > 2 {
                true => 2,
                false => 1,
            },
            neutral_losses: self.config.account_neutral_losses,
            min_isotope: self.config.min_isotopic_correction,
            max_isotope: self.config.max_isotopic_correction,
        }
    }

    /// Fragment m/z values of `sequence` with `localized` at `positions`
    /// and the other modifications where they were reported
    fn fragments(
        &self,
        sequence: &[u8],
        fixed: &[(usize, &VariableModification)],
        localized: &VariableModification,
        positions: &[usize],
        settings: &FragmentSettings,
    ) -> Vec<f64> {
        let mut residues = sequence.iter().map(|r| r.monoisotopic()).collect::<Vec<_>>();
        let mut losses = Vec::new();
        let placed = fixed
            .iter()
            .copied()
            .chain(positions.iter().map(|&pos| (pos, localized)));
        for (pos, modification) in placed {
            if let Some(mass) = residues.get_mut(pos) {
                *mass += modification.mass;
            }
            if let Some(loss) = modification.neutral_loss {
                losses.push((pos, loss));
            }
        }
        fragment_mz(&residues, &losses, settings)
    }

    /// log10 weight of every placement
    fn score(&self, fragments: &[Vec<f64>], peaks: &[Peak]) -> (Vec<f64>, Option<Vec<f64>>) {
        let tolerance = self.config.fragment_tolerance;
        match self.config.probabilistic_score {
            ProbabilisticScore::PhosphoRS => {
                let extracted = extract(peaks, usize::MAX);
                let (lo, hi) = match (extracted.first(), extracted.last()) {
                    (Some(lo), Some(hi)) => (*lo, *hi),
                    _ => (0.0, 0.0),
                };
                let range = match hi - lo > 100.0 {
                    true => hi - lo,
                    false => 100.0,
                };
                let width = tolerance.width((lo + hi) / 2.0);
                let p = (extracted.len() as f64 * width / range).min(1.0);
                let scores = fragments
                    .iter()
                    .map(|theoretical| {
                        binomial_score(theoretical.len(), matched(theoretical, &extracted, tolerance), p)
                    })
                    .collect();
                (scores, None)
            }
            ProbabilisticScore::AScore => {
                let mut weighted = vec![0.0; fragments.len()];
                for (depth, weight) in ASCORE_WEIGHTS.iter().enumerate() {
                    let depth = depth + 1;
                    let extracted = extract(peaks, depth);
                    let p = (depth as f64 * tolerance.width(500.0) / 100.0).min(1.0);
                    for (theoretical, total) in fragments.iter().zip(weighted.iter_mut()) {
                        let k = matched(theoretical, &extracted, tolerance);
                        *total += weight * 10.0 * binomial_score(theoretical.len(), k, p);
                    }
                }
                let norm = ASCORE_WEIGHTS.iter().sum::<f64>();
                let scores = weighted.iter().map(|s| s / norm).collect::<Vec<_>>();
                // probabilities scale with 10^(score / 10)
                let log_weights = scores.iter().map(|s| s / 10.0).collect();
                (log_weights, Some(scores))
            }
        }
    }

    /// Localize the variable modifications of the PSM's retained assumption.
    /// Returns `None` when there is nothing to localize or no spectrum.
    pub fn localize(&self, psm: &SpectrumMatch) -> Option<Localization> {
        let best = psm.best.as_ref()?;
        let spectrum = psm.spectrum.as_ref()?;
        if best.modifications.is_empty() || spectrum.peaks.is_empty() {
            return None;
        }

        let mut definitions = Vec::new();
        for m in &best.modifications {
            match self.config.variable_mod(&m.name) {
                Some(def) => definitions.push((m, def)),
                None => {
                    log::trace!("{}: modification {} is not defined", psm.key, m.name);
                    return None;
                }
            }
        }

        let sequence = best.sequence.as_bytes();
        let charge = match spectrum.precursor_charge {
            0 => psm.charge,
            z => z,
        };
        let settings = self.settings(charge);

        let mut assignment = ModificationSiteAssignment::default();
        let mut observations = Vec::new();
        let by_name = definitions
            .iter()
            .map(|(m, def)| (m.name.as_str(), *def))
            .collect::<BTreeMap<_, _>>();

        for (name, def) in by_name {
            let reported = best
                .modifications
                .iter()
                .filter(|m| m.name == name)
                .map(|m| m.position)
                .sorted()
                .collect::<Vec<_>>();
            let fixed = definitions
                .iter()
                .filter(|(m, _)| m.name != name)
                .map(|(m, def)| (m.position, *def))
                .collect::<Vec<_>>();
            let occupied = |pos: usize| fixed.iter().any(|(p, _)| *p == pos);

            let allowed = (0..sequence.len())
                .filter(|&pos| def.can_modify(sequence, pos) && !occupied(pos))
                .collect::<Vec<_>>();
            let impossible = (0..sequence.len())
                .filter(|&pos| !def.can_modify(sequence, pos) && !occupied(pos))
                .collect::<Vec<_>>();

            let mut placements = allowed
                .iter()
                .copied()
                .combinations(reported.len())
                .take(MAX_PLACEMENTS + 1)
                .collect::<Vec<_>>();
            if placements.len() > MAX_PLACEMENTS {
                log::warn!(
                    "{}: more than {} placements of {}, only the first ones are scored",
                    psm.key,
                    MAX_PLACEMENTS,
                    name
                );
                placements.truncate(MAX_PLACEMENTS);
            }
            if !placements.contains(&reported) {
                placements.push(reported.clone());
            }

            if placements.len() == 1 {
                assignment.placements += 1;
                assignment.sites.extend(reported.iter().map(|&position| SiteProbability {
                    modification: name.to_string(),
                    position,
                    probability: 1.0,
                    confident: true,
                    spectrum: Some(psm.key.clone()),
                }));
                continue;
            }

            let valid = placements.len();
            let fragments = placements
                .iter()
                .map(|positions| self.fragments(sequence, &fixed, def, positions, &settings))
                .collect::<Vec<_>>();
            let (log_weights, ascore) = self.score(&fragments, &spectrum.peaks);
            let probabilities = normalize(&log_weights);

            let mut sites: FnvHashMap<usize, f64> = FnvHashMap::default();
            for (placement, probability) in placements.iter().zip(&probabilities) {
                for &pos in placement {
                    *sites.entry(pos).or_default() += probability;
                }
            }
            let best_site = sites.values().copied().fold(0.0, f64::max);
            observations.push((best_site, false));

            // decoy placements: one site of the best valid placement moved
            // onto a residue unable to carry the modification
            let (best_ix, _) = probabilities
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .unwrap_or((0, &0.0));
            let base = &placements[best_ix];
            let mut decoys = decoy_placements(base, &impossible);
            if decoys.len() > MAX_PLACEMENTS {
                log::warn!(
                    "{}: {} decoy placements of {}, only {} are scored",
                    psm.key,
                    decoys.len(),
                    name,
                    MAX_PLACEMENTS
                );
                decoys.truncate(MAX_PLACEMENTS);
            }
            if !decoys.is_empty() {
                let decoy_fragments = decoys
                    .iter()
                    .map(|positions| self.fragments(sequence, &fixed, def, positions, &settings))
                    .collect::<Vec<_>>();
                let (decoy_weights, _) = self.score(&decoy_fragments, &spectrum.peaks);
                let best_decoy = decoy_weights.iter().copied().fold(f64::MIN, f64::max);
                // the best decoy competes against the valid placements
                let mut competing = log_weights.clone();
                competing.push(best_decoy);
                let decoy_probability = normalize(&competing)[valid];
                observations.push((decoy_probability, true));
            }

            if let Some(scores) = ascore {
                let top = scores.iter().copied().sorted_by(|a, b| b.total_cmp(a)).collect::<Vec<_>>();
                if top.len() > 1 {
                    let delta = top[0] - top[1];
                    assignment.ascore = Some(assignment.ascore.map_or(delta, |a: f64| a.min(delta)));
                }
            }

            assignment.placements += placements.len();
            assignment.sites.extend(
                sites
                    .into_iter()
                    .sorted_by_key(|(pos, _)| *pos)
                    .map(|(position, probability)| SiteProbability {
                        modification: name.to_string(),
                        position,
                        probability: probability.clamp(0.0, 1.0),
                        confident: false,
                        spectrum: Some(psm.key.clone()),
                    }),
            );
        }

        assignment
            .sites
            .sort_by(|a, b| (a.position, &a.modification).cmp(&(b.position, &b.modification)));
        Some(Localization {
            assignment,
            observations,
        })
    }

    /// Score map of the FLR observations
    pub fn flr_map<'l, I>(&self, localizations: I) -> ScoreMap<()>
    where
        I: IntoIterator<Item = &'l Localization>,
    {
        let mut map = ScoreMap::configured("flr", self.config).min_decoys(1);
        for localization in localizations {
            for &(probability, decoy) in &localization.observations {
                map.add_point(probability, decoy, ());
            }
        }
        map.estimate_probabilities();
        map
    }

    /// Lowest site probability accepted at the configured FLR
    pub fn cutoff(&self, map: &ScoreMap<()>) -> Option<f64> {
        ValidationThresholder::new(map, self.config.flr_threshold, self.config.confident_pep).threshold(&())
    }
}

/// Flag sites passing the FLR cutoff. Sites with probability 1 (a single
/// possible placement) are always confident.
pub fn apply_cutoff(sites: &mut [SiteProbability], cutoff: Option<f64>) {
    for site in sites {
        site.confident =
            site.probability >= 1.0 || cutoff.map(|c| site.probability >= c).unwrap_or(false);
    }
}

/// Best evidence per distinct (modification, position), sorted by position
pub fn aggregate<I: IntoIterator<Item = SiteProbability>>(sites: I) -> Vec<SiteProbability> {
    let mut best: BTreeMap<(usize, String), SiteProbability> = BTreeMap::new();
    for site in sites {
        let key = (site.position, site.modification.clone());
        match best.get(&key) {
            Some(current)
                if (current.confident, current.probability) >= (site.confident, site.probability) => {}
            _ => {
                best.insert(key, site);
            }
        }
    }
    best.into_values().collect()
}

/// Move peptide sites to 1-based protein coordinates, once per occurrence of
/// the peptide in the protein
pub fn to_protein(sites: &[SiteProbability], starts: &[usize]) -> Vec<SiteProbability> {
    starts
        .iter()
        .flat_map(|start| {
            sites.iter().map(move |site| SiteProbability {
                position: start + site.position + 1,
                ..site.clone()
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ident::{ModificationMatch, PeptideAssumption, Spectrum, Validation};
    use crate::ions::{IonSeries, Kind};
    use crate::mass::PROTON;
    use quickcheck_macros::quickcheck;

    const PHOSPHO: f64 = 79.966331;

    fn config(score: ProbabilisticScore) -> ScoringConfig {
        ScoringConfig {
            probabilistic_score: score,
            account_neutral_losses: false,
            min_isotopic_correction: 0,
            max_isotopic_correction: 0,
            ..Default::default()
        }
    }

    /// PSM of ASPTK phosphorylated on S, with a spectrum holding exactly the
    /// singly charged b/y ions of that placement
    fn psm(reported: usize) -> SpectrumMatch {
        let mut residues = b"ASPTK".iter().map(|r| r.monoisotopic()).collect::<Vec<_>>();
        residues[1] += PHOSPHO;
        let peaks = IonSeries::new(&residues, Kind::B)
            .chain(IonSeries::new(&residues, Kind::Y))
            .map(|ion| Peak {
                mz: ion.monoisotopic_mass + PROTON,
                intensity: 100.0,
            })
            .collect();
        let assumption = PeptideAssumption {
            engine: "comet".into(),
            sequence: "ASPTK".into(),
            modifications: vec![ModificationMatch {
                name: "Phospho".into(),
                position: reported,
            }],
            score: 10.0,
            decoy: false,
            probability: 0.01,
        };
        SpectrumMatch {
            key: "scan=1".into(),
            file: String::new(),
            charge: 2,
            assumptions: vec![assumption.clone()],
            best: Some(assumption),
            ambiguous: false,
            spectrum: Some(Spectrum {
                precursor_charge: 2,
                peaks,
            }),
            localization: None,
            validation: Validation::default(),
        }
    }

    #[test]
    fn phosphors_prefers_supported_site() {
        let config = config(ProbabilisticScore::PhosphoRS);
        let scorer = PTMLocalizationScorer::new(&config);
        // the engine reported the wrong site
        let localization = scorer.localize(&psm(3)).unwrap();
        let sites = &localization.assignment.sites;
        assert_eq!(localization.assignment.placements, 2);
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].position, 1);
        assert!(sites[0].probability > 0.99);
        assert!((sites[0].probability + sites[1].probability - 1.0).abs() < 1e-9);
        assert!(localization.assignment.ascore.is_none());

        assert!(localization.observations.contains(&(sites[0].probability, false)));
        let decoy = localization.observations.iter().find(|(_, d)| *d).unwrap();
        assert!(decoy.0 < 0.5);
    }

    #[test]
    fn ascore_reports_difference() {
        let config = config(ProbabilisticScore::AScore);
        let scorer = PTMLocalizationScorer::new(&config);
        let localization = scorer.localize(&psm(1)).unwrap();
        assert!(localization.assignment.ascore.unwrap() > 0.0);
        assert_eq!(localization.assignment.sites[0].position, 1);
        assert!(localization.assignment.sites[0].probability > 0.5);
    }

    #[test]
    fn single_placement_is_confident() {
        let config = config(ProbabilisticScore::PhosphoRS);
        let scorer = PTMLocalizationScorer::new(&config);
        let mut psm = psm(1);
        if let Some(best) = psm.best.as_mut() {
            best.sequence = "ASPAK".into();
        }
        let localization = scorer.localize(&psm).unwrap();
        assert_eq!(localization.assignment.sites.len(), 1);
        assert!(localization.assignment.sites[0].confident);
        assert!(localization.observations.is_empty());
    }

    #[test]
    fn decoy_placements_are_distinct() {
        assert_eq!(
            decoy_placements(&[1, 3], &[0, 4]),
            vec![vec![0, 1], vec![0, 3], vec![1, 4], vec![3, 4]]
        );
        // 4 was reported although it cannot carry the modification
        assert_eq!(
            decoy_placements(&[1, 4], &[0, 4]),
            vec![vec![0, 1], vec![0, 4]]
        );
        assert!(decoy_placements(&[2], &[]).is_empty());
    }

    #[test]
    fn undefined_modifications_are_skipped() {
        let config = config(ProbabilisticScore::PhosphoRS);
        let scorer = PTMLocalizationScorer::new(&config);
        let mut psm = psm(1);
        if let Some(best) = psm.best.as_mut() {
            best.modifications[0].name = "Unknown".into();
        }
        assert!(scorer.localize(&psm).is_none());
    }

    #[test]
    fn protein_coordinates() {
        let site = SiteProbability {
            modification: "Phospho".into(),
            position: 1,
            probability: 0.9,
            confident: true,
            spectrum: None,
        };
        let weaker = SiteProbability {
            probability: 0.6,
            ..site.clone()
        };
        let sites = aggregate(vec![weaker, site.clone()]);
        assert_eq!(sites, vec![site.clone()]);
        let protein = to_protein(&sites, &[10, 40]);
        assert_eq!(protein.iter().map(|s| s.position).collect::<Vec<_>>(), vec![12, 42]);
    }

    fn observations(data: &[(u8, bool)]) -> Localization {
        Localization {
            assignment: ModificationSiteAssignment::default(),
            observations: data
                .iter()
                .map(|&(p, decoy)| (p as f64 / u8::MAX as f64, decoy))
                .collect(),
        }
    }

    #[quickcheck]
    fn flr_cutoff_is_monotone(data: Vec<(u8, bool)>, probabilities: Vec<u8>) -> bool {
        let localization = observations(&data);
        let mut confident = Vec::new();
        for flr in [1.0, 5.0, 20.0] {
            let config = ScoringConfig {
                flr_threshold: flr,
                ..Default::default()
            };
            let scorer = PTMLocalizationScorer::new(&config);
            let map = scorer.flr_map([&localization]);
            let mut sites = probabilities
                .iter()
                .map(|&p| SiteProbability {
                    modification: "Phospho".into(),
                    position: 0,
                    probability: p as f64 / u8::MAX as f64,
                    confident: false,
                    spectrum: None,
                })
                .collect::<Vec<_>>();
            apply_cutoff(&mut sites, scorer.cutoff(&map));
            confident.push(sites.iter().filter(|s| s.confident).count());
        }
        confident.windows(2).all(|w| w[0] <= w[1])
    }
}
