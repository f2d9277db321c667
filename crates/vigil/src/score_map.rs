//! Target/decoy score calibration.
//!
//! A [`ScoreMap`] accumulates `(score, is_decoy)` observations per category
//! (precursor charge, modification profile...). Once every observation has
//! been added, [`ScoreMap::estimate_probabilities`] turns each category into
//! a posterior error probability curve together with cumulative FDR and FNR
//! curves over the target scores.
//!
//! Decoys are assumed to be a fair sample of the false targets of a
//! concatenated target-decoy search: every decoy above a score stands for one
//! false target above it, hence the factor 2 in the PEP estimate.

use crate::config::{PepEstimator, ScoringConfig};
use crate::kde;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Debug;

/// Types usable as score map categories
pub trait CategoryKey: Ord + Clone + Debug + Send + Sync + Serialize + DeserializeOwned {
    fn label(&self) -> String;
}

impl CategoryKey for () {
    fn label(&self) -> String {
        "all".into()
    }
}

impl CategoryKey for u8 {
    fn label(&self) -> String {
        self.to_string()
    }
}

impl CategoryKey for String {
    fn label(&self) -> String {
        match self.is_empty() {
            true => "unmodified".into(),
            false => self.clone(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub score: f64,
    pub decoy: bool,
}

/// Point of the cumulative curves, taken at a target score `score`:
/// everything scoring at least `score` is accepted
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub score: f64,
    /// Estimated false discovery rate, as a fraction
    pub fdr: f64,
    /// Estimated false negative rate, as a fraction
    pub fnr: f64,
    /// Largest PEP among accepted targets
    pub pep: f64,
    pub targets: usize,
    pub decoys: usize,
    /// Sum of (1 - PEP) over accepted targets
    pub true_positives: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    /// Distinct observed scores, ascending
    pub scores: Vec<f64>,
    /// Monotone PEP at each distinct score
    pub pep: Vec<f64>,
    /// Windowed PEP before the monotonicity constraint
    pub raw_pep: Vec<f64>,
    /// Cumulative curves, from the most stringent point to the most
    /// permissive one
    pub points: Vec<CurvePoint>,
}

impl Curve {
    fn probability(&self, score: f64) -> f64 {
        let n = self.scores.len();
        if n == 0 {
            return 1.0;
        }
        if score <= self.scores[0] {
            return self.pep[0];
        }
        if score >= self.scores[n - 1] {
            return self.pep[n - 1];
        }
        let hi = self.scores.partition_point(|&s| s < score);
        if self.scores[hi] == score {
            return self.pep[hi];
        }
        let lo = hi - 1;
        let linear = (score - self.scores[lo]) / (self.scores[hi] - self.scores[lo]);
        self.pep[lo] + (self.pep[hi] - self.pep[lo]) * linear
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Category<K> {
    pub key: K,
    /// Sparse categories merged into this one
    pub merged: Vec<K>,
    observations: Vec<Observation>,
    sorted: bool,
    curve: Option<Curve>,
}

impl<K: CategoryKey> Category<K> {
    fn new(key: K) -> Self {
        Self {
            key,
            merged: Vec::new(),
            observations: Vec::new(),
            sorted: true,
            curve: None,
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn decoys(&self) -> usize {
        self.observations.iter().filter(|o| o.decoy).count()
    }

    pub fn targets(&self) -> usize {
        self.len() - self.decoys()
    }

    pub fn curve(&self) -> Option<&Curve> {
        self.curve.as_ref()
    }

    fn sort(&mut self) {
        if !self.sorted {
            self.observations.sort_by(|a, b| {
                a.score
                    .total_cmp(&b.score)
                    .then_with(|| a.decoy.cmp(&b.decoy))
            });
            self.sorted = true;
        }
    }

    /// Lowest observed score (target or decoy) strictly above `score`
    pub(crate) fn lowest_above(&self, score: f64) -> Option<f64> {
        if !self.sorted {
            return self
                .observations
                .iter()
                .map(|o| o.score)
                .filter(|&s| s > score)
                .min_by(|a, b| a.total_cmp(b));
        }
        let ix = self.observations.partition_point(|o| o.score <= score);
        self.observations.get(ix).map(|o| o.score)
    }

    /// Number of (targets, decoys) scoring at least `score`
    pub(crate) fn at_or_above(&self, score: f64) -> (usize, usize) {
        let above = match self.sorted {
            true => &self.observations[self.observations.partition_point(|o| o.score < score)..],
            false => &self.observations[..],
        };
        above
            .iter()
            .filter(|o| o.score >= score)
            .fold((0, 0), |(t, d), o| match o.decoy {
                true => (t, d + 1),
                false => (t + 1, d),
            })
    }

    /// Windowed PEP estimate per distinct score, ascending
    fn windowed(&self, window: Option<usize>) -> (Vec<f64>, Vec<f64>) {
        let n = self.observations.len();
        let h = window.unwrap_or_else(|| (((n as f64).sqrt() / 2.0).floor() as usize).max(1));

        let mut decoys_before = Vec::with_capacity(n + 1);
        decoys_before.push(0usize);
        for obs in &self.observations {
            let last = decoys_before[decoys_before.len() - 1];
            decoys_before.push(last + obs.decoy as usize);
        }

        let mut scores: Vec<f64> = Vec::new();
        let mut peps: Vec<f64> = Vec::new();
        let mut ties = 0usize;
        for ix in 0..n {
            let lo = ix.saturating_sub(h);
            let hi = (ix + h + 1).min(n);
            let d = decoys_before[hi] - decoys_before[lo];
            let total = hi - lo;
            let pep = (2.0 * d as f64 / total as f64).min(1.0);

            let score = self.observations[ix].score;
            match scores.last() {
                Some(&last) if last == score => {
                    // running mean over tied observations
                    ties += 1;
                    if let Some(mean) = peps.last_mut() {
                        *mean += (pep - *mean) / ties as f64;
                    }
                }
                _ => {
                    ties = 1;
                    scores.push(score);
                    peps.push(pep);
                }
            }
        }
        (scores, peps)
    }

    fn estimate(&mut self, estimator: PepEstimator, window: Option<usize>) {
        self.sort();
        if self.observations.is_empty() {
            self.curve = None;
            return;
        }

        let (scores, raw_pep) = self.windowed(window);
        let mut pep = match estimator {
            PepEstimator::Window => raw_pep.clone(),
            PepEstimator::Kde => {
                let (all, decoys): (Vec<f64>, Vec<bool>) =
                    self.observations.iter().map(|o| (o.score, o.decoy)).unzip();
                let model = kde::Builder::default().build(&all, &decoys);
                scores.iter().map(|&s| model.posterior_error(s)).collect()
            }
        };

        // Walking down from the best score, PEP may only grow
        let mut running = 0.0f64;
        for p in pep.iter_mut().rev() {
            running = running.max(*p);
            *p = running;
        }

        let mut curve = Curve {
            scores,
            pep,
            raw_pep,
            points: Vec::new(),
        };

        let total_tp = self
            .observations
            .iter()
            .filter(|o| !o.decoy)
            .map(|o| 1.0 - curve.probability(o.score))
            .sum::<f64>();

        let mut targets = 0usize;
        let mut decoys = 0usize;
        let mut pep_sum = 0.0;
        let mut max_pep = 0.0f64;
        let mut points: Vec<CurvePoint> = Vec::new();
        for obs in self.observations.iter().rev() {
            if obs.decoy {
                decoys += 1;
                // decoys tied with the last target point are accepted with it
                if let Some(point) = points.last_mut() {
                    if point.score == obs.score {
                        point.decoys = decoys;
                    }
                }
                continue;
            }
            let p = curve.probability(obs.score);
            targets += 1;
            pep_sum += p;
            max_pep = max_pep.max(p);
            let true_positives = targets as f64 - pep_sum;
            let point = CurvePoint {
                score: obs.score,
                fdr: pep_sum / targets as f64,
                fnr: match total_tp > 0.0 {
                    true => ((total_tp - true_positives) / total_tp).max(0.0),
                    false => 0.0,
                },
                pep: max_pep,
                targets,
                decoys,
                true_positives,
            };
            match points.last_mut() {
                Some(last) if last.score == obs.score => *last = point,
                _ => points.push(point),
            }
        }
        curve.points = points;
        self.curve = Some(curve);
    }
}

/// Outcome of [`ScoreMap::estimate_probabilities`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Estimate {
    Estimated { categories: usize },
    /// Nothing was added to the map
    NoData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionReason {
    /// Not enough decoys to estimate error rates
    TooFewDecoys { decoys: usize, required: usize },
    /// A single decoy moves the FDR by more than the target FDR
    CoarseResolution { resolution: f64, target_fdr: f64 },
    /// The PEP curve rises with the score before the monotonic constraint
    NonMonotonic { deviation: f64 },
}

/// Non-fatal warning about the statistical quality of a score map
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Suspicion {
    pub map: String,
    pub category: String,
    pub reason: SuspicionReason,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoreMap<K> {
    pub name: String,
    /// Sorted by key
    categories: Vec<Category<K>>,
    /// Original key -> key of the category it was merged into, sorted
    redirects: Vec<(K, K)>,
    estimated: bool,
    stale: bool,
    estimator: PepEstimator,
    window: Option<usize>,
    min_decoys: usize,
    monotonic_tolerance: f64,
}

impl<K: CategoryKey> ScoreMap<K> {
    pub fn new<S: Into<String>>(name: S) -> Self {
        let default = ScoringConfig::default();
        Self {
            name: name.into(),
            categories: Vec::new(),
            redirects: Vec::new(),
            estimated: false,
            stale: false,
            estimator: default.pep_estimator,
            window: default.pep_window,
            min_decoys: default.min_decoys,
            monotonic_tolerance: default.monotonic_tolerance,
        }
    }

    /// A map using the estimation settings of `config`
    pub fn configured<S: Into<String>>(name: S, config: &ScoringConfig) -> Self {
        Self::new(name)
            .estimator(config.pep_estimator)
            .window(config.pep_window)
            .min_decoys(config.min_decoys)
            .monotonic_tolerance(config.monotonic_tolerance)
    }

    pub fn estimator(mut self, estimator: PepEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn window(mut self, window: Option<usize>) -> Self {
        self.window = window.filter(|&w| w > 0);
        self
    }

    pub fn min_decoys(mut self, min_decoys: usize) -> Self {
        self.min_decoys = min_decoys;
        self
    }

    pub fn monotonic_tolerance(mut self, tolerance: f64) -> Self {
        self.monotonic_tolerance = tolerance.abs();
        self
    }

    pub fn len(&self) -> usize {
        self.categories.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.iter().all(|c| c.is_empty())
    }

    pub fn is_estimated(&self) -> bool {
        self.estimated && !self.stale
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category<K>> {
        self.categories.iter()
    }

    /// Index of the category holding `key`, following merges. Keys never
    /// seen fall back to the closest category in key order.
    fn resolve(&self, key: &K) -> Option<usize> {
        let key = match self.redirects.binary_search_by(|(from, _)| from.cmp(key)) {
            Ok(ix) => &self.redirects[ix].1,
            Err(_) => key,
        };
        match self.categories.binary_search_by(|c| c.key.cmp(key)) {
            Ok(ix) => Some(ix),
            Err(_) if self.categories.is_empty() => None,
            Err(ix) => {
                log::trace!("{}: unknown category {:?}, using closest", self.name, key);
                Some(ix.min(self.categories.len() - 1))
            }
        }
    }

    pub fn category(&self, key: &K) -> Option<&Category<K>> {
        self.resolve(key).map(|ix| &self.categories[ix])
    }

    pub fn add_point(&mut self, score: f64, decoy: bool, category: K) {
        if !score.is_finite() {
            log::trace!("{}: ignoring non-finite score {}", self.name, score);
            return;
        }
        let key = match self.redirects.binary_search_by(|(from, _)| from.cmp(&category)) {
            Ok(ix) => self.redirects[ix].1.clone(),
            Err(_) => category,
        };
        let ix = match self.categories.binary_search_by(|c| c.key.cmp(&key)) {
            Ok(ix) => ix,
            Err(ix) => {
                self.categories.insert(ix, Category::new(key));
                ix
            }
        };
        let cat = &mut self.categories[ix];
        if let Some(last) = cat.observations.last() {
            if last.score.total_cmp(&score) == Ordering::Greater {
                cat.sorted = false;
            }
        }
        cat.observations.push(Observation { score, decoy });
        if self.estimated {
            self.stale = true;
        }
    }

    /// Merge categories holding fewer than `min_decoys` decoys into their
    /// neighbour in key order with the most observations (the next key on
    /// ties), until every category is dense enough or a single one remains.
    /// Returns the number of merges performed.
    pub fn cure(&mut self, min_decoys: usize) -> usize {
        let mut merges = 0;
        while self.categories.len() > 1 {
            let ix = match self.categories.iter().position(|c| c.decoys() < min_decoys) {
                Some(ix) => ix,
                None => break,
            };
            let last = self.categories.len() - 1;
            let into = if ix == 0 {
                1
            } else if ix == last {
                ix - 1
            } else if self.categories[ix + 1].len() >= self.categories[ix - 1].len() {
                ix + 1
            } else {
                ix - 1
            };

            let sparse = self.categories.remove(ix);
            let into = if into > ix { into - 1 } else { into };
            let target = &mut self.categories[into];
            log::trace!(
                "{}: merging category {:?} ({} decoys) into {:?}",
                self.name,
                sparse.key,
                sparse.decoys(),
                target.key
            );

            for (_, to) in self.redirects.iter_mut() {
                if *to == sparse.key {
                    *to = target.key.clone();
                }
            }
            self.redirects.push((sparse.key.clone(), target.key.clone()));
            self.redirects.sort_by(|a, b| a.0.cmp(&b.0));

            target.merged.push(sparse.key);
            target.merged.extend(sparse.merged);
            target.merged.sort();
            target.observations.extend(sparse.observations);
            target.sorted = false;
            target.curve = None;
            merges += 1;
        }
        if merges > 0 && self.estimated {
            self.stale = true;
        }
        merges
    }

    pub fn estimate_probabilities(&mut self) -> Estimate {
        self.cure(self.min_decoys);
        if self.is_empty() {
            self.estimated = false;
            self.stale = false;
            return Estimate::NoData;
        }
        let (estimator, window) = (self.estimator, self.window);
        for category in self.categories.iter_mut() {
            category.estimate(estimator, window);
        }
        self.estimated = true;
        self.stale = false;
        Estimate::Estimated {
            categories: self.categories.len(),
        }
    }

    /// Posterior error probability of `score` in `category`; 1.0 until the
    /// map has been estimated, and again once new points make it stale
    pub fn probability(&self, score: f64, category: &K) -> f64 {
        if !self.is_estimated() || score.is_nan() {
            return 1.0;
        }
        self.category(category)
            .and_then(|c| c.curve.as_ref())
            .map(|curve| curve.probability(score))
            .unwrap_or(1.0)
    }

    /// Statistical quality warnings, `target_fdr` is a percentage
    pub fn suspicious_input(&self, target_fdr: f64) -> Vec<Suspicion> {
        let mut warnings = Vec::new();
        for category in &self.categories {
            let mut warn = |reason| {
                warnings.push(Suspicion {
                    map: self.name.clone(),
                    category: category.key.label(),
                    reason,
                })
            };
            let decoys = category.decoys();
            if decoys < self.min_decoys.max(1) {
                warn(SuspicionReason::TooFewDecoys {
                    decoys,
                    required: self.min_decoys.max(1),
                });
            }
            let targets = category.targets();
            let resolution = match targets {
                0 => 100.0,
                n => 100.0 / n as f64,
            };
            if resolution > target_fdr {
                warn(SuspicionReason::CoarseResolution {
                    resolution,
                    target_fdr,
                });
            }
            if let Some(curve) = &category.curve {
                let rise = rise_with_score(&curve.raw_pep);
                if rise > self.monotonic_tolerance {
                    warn(SuspicionReason::NonMonotonic { deviation: rise });
                }
            }
        }
        for w in &warnings {
            log::warn!("{}: category {} is suspicious: {:?}", w.map, w.category, w.reason);
        }
        warnings
    }
}

/// Largest increase of PEP between a lower and a higher score
fn rise_with_score(peps: &[f64]) -> f64 {
    let mut lowest = f64::MAX;
    let mut rise = 0.0f64;
    for &pep in peps {
        if lowest < f64::MAX {
            rise = rise.max(pep - lowest);
        }
        lowest = lowest.min(pep);
    }
    rise
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn scenario() -> ScoreMap<()> {
        let mut map = ScoreMap::new("psm").window(Some(1)).min_decoys(1);
        for (score, decoy) in [(0.9, false), (0.85, false), (0.80, true), (0.5, false), (0.4, true)] {
            map.add_point(score, decoy, ());
        }
        map
    }

    #[test]
    fn windowed_pep() {
        let mut map = scenario();
        assert_eq!(map.probability(0.9, &()), 1.0);
        assert_eq!(map.estimate_probabilities(), Estimate::Estimated { categories: 1 });
        assert_eq!(map.probability(0.9, &()), 0.0);
        assert!((map.probability(0.85, &()) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(map.probability(0.5, &()), 1.0);
        assert_eq!(map.probability(100.0, &()), 0.0);
        // halfway between 0.85 and 0.9
        assert!((map.probability(0.875, &()) - 1.0 / 3.0).abs() < 1e-9);

        let curve = map.category(&()).unwrap().curve().unwrap();
        let fdr = curve.points.iter().map(|p| p.fdr).collect::<Vec<_>>();
        assert_eq!(curve.points[0].score, 0.9);
        assert_eq!(fdr[0], 0.0);
        assert!((fdr[1] - 1.0 / 3.0).abs() < 1e-9);
        assert!((fdr[2] - 5.0 / 9.0).abs() < 1e-9);
        assert_eq!(curve.points[2].fnr, 0.0);
        assert!(curve.points[0].fnr > 0.0);
    }

    #[test]
    fn stale_after_new_points() {
        let mut map = scenario();
        map.estimate_probabilities();
        assert!(map.is_estimated());
        map.add_point(0.95, false, ());
        assert!(!map.is_estimated());
        assert_eq!(map.probability(0.9, &()), 1.0);
        map.add_point(f64::NAN, false, ());
        assert_eq!(map.len(), 6);
    }

    #[test]
    fn empty_map() {
        let mut map: ScoreMap<u8> = ScoreMap::new("empty");
        assert_eq!(map.estimate_probabilities(), Estimate::NoData);
        assert_eq!(map.probability(10.0, &2), 1.0);
    }

    #[test]
    fn cure_merges_sparse_categories() {
        let mut map: ScoreMap<u8> = ScoreMap::new("psm");
        for i in 0..20 {
            map.add_point(i as f64, i % 2 == 0, 2);
            map.add_point(i as f64, i % 4 == 0, 3);
        }
        map.add_point(1.0, false, 4);
        map.add_point(2.0, false, 4);
        map.add_point(0.5, true, 1);

        assert_eq!(map.cure(5), 2);
        let keys = map.categories().map(|c| c.key).collect::<Vec<_>>();
        assert_eq!(keys, vec![2, 3]);
        // 1 only neighbours 2, 4 only neighbours 3
        assert_eq!(map.category(&1).unwrap().key, 2);
        assert_eq!(map.category(&4).unwrap().key, 3);
        assert_eq!(map.cure(5), 0);

        map.add_point(3.0, true, 4);
        assert_eq!(map.category(&3).unwrap().len(), 23);
    }

    #[test]
    fn suspicious_categories() {
        let mut map = scenario().min_decoys(5);
        map.estimate_probabilities();
        let warnings = map.suspicious_input(1.0);
        assert!(warnings
            .iter()
            .any(|w| matches!(w.reason, SuspicionReason::TooFewDecoys { decoys: 2, .. })));
        assert!(warnings
            .iter()
            .any(|w| matches!(w.reason, SuspicionReason::CoarseResolution { .. })));
        assert!(warnings.iter().all(|w| w.category == "all"));
    }

    #[test]
    fn pep_rising_with_score_is_suspicious() {
        let mut map = ScoreMap::new("psm").window(Some(1)).min_decoys(1);
        for (score, decoy) in [(1.0, false), (2.0, false), (3.0, false), (4.0, false), (5.0, true), (6.0, true)] {
            map.add_point(score, decoy, ());
        }
        map.estimate_probabilities();
        let warnings = map.suspicious_input(50.0);
        assert_eq!(warnings.len(), 1);
        match warnings[0].reason {
            SuspicionReason::NonMonotonic { deviation } => assert!((deviation - 1.0).abs() < 1e-9),
            ref reason => panic!("unexpected warning {:?}", reason),
        }

        let mut map = scenario();
        map.estimate_probabilities();
        assert!(!map
            .suspicious_input(50.0)
            .iter()
            .any(|w| matches!(w.reason, SuspicionReason::NonMonotonic { .. })));
    }

    #[test]
    fn counts_before_and_after_sorting() {
        let mut map = scenario();
        for _ in 0..2 {
            let category = map.category(&()).unwrap();
            assert_eq!(category.lowest_above(0.5), Some(0.8));
            assert_eq!(category.lowest_above(0.9), None);
            assert_eq!(category.at_or_above(0.8), (2, 1));
            assert_eq!(category.at_or_above(0.0), (3, 2));
            map.estimate_probabilities();
        }
    }

    #[test]
    fn kde_estimator_is_monotone() {
        let mut map = ScoreMap::new("kde").estimator(PepEstimator::Kde);
        for i in 0..100 {
            map.add_point(i as f64 / 10.0, true, ());
            map.add_point(5.0 + i as f64 / 10.0, false, ());
        }
        map.estimate_probabilities();
        let mut last = 1.0;
        for i in 0..150 {
            let pep = map.probability(i as f64 / 10.0, &());
            assert!(pep <= last + 1e-12);
            last = pep;
        }
        assert!(map.probability(14.0, &()) < 0.05);
    }

    fn fill(data: &[(u8, bool, u8)]) -> ScoreMap<u8> {
        let mut map = ScoreMap::new("prop");
        for &(score, decoy, category) in data {
            map.add_point(score as f64, decoy, category % 4);
        }
        map
    }

    #[quickcheck]
    fn fdr_is_monotone(data: Vec<(u8, bool, u8)>) -> bool {
        let mut map = fill(&data);
        map.estimate_probabilities();
        let monotone = map.categories().all(|c| match c.curve() {
            Some(curve) => curve
                .points
                .windows(2)
                .all(|w| w[0].score > w[1].score && w[0].fdr <= w[1].fdr + 1e-12),
            None => true,
        });
        monotone
    }

    #[quickcheck]
    fn curing_is_idempotent(data: Vec<(u8, bool, u8)>, min_decoys: u8) -> bool {
        let mut map = fill(&data);
        let min_decoys = (min_decoys % 8) as usize;
        map.cure(min_decoys);
        let keys = map.categories().map(|c| (c.key, c.len())).collect::<Vec<_>>();
        let merges = map.cure(min_decoys);
        let again = map.categories().map(|c| (c.key, c.len())).collect::<Vec<_>>();
        merges == 0 && keys == again && map.len() == data.len()
    }
}
