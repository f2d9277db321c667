//! Posterior error probabilities from kernel density estimates of the target
//! and decoy score distributions. The model is evaluated on an evenly spaced
//! grid once, and scores are mapped to PEPs by linear interpolation between
//! grid points.
//!
//! Käll, 2008 [https://pubmed.ncbi.nlm.nih.gov/18052118/]

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

fn mean(slice: &[f64]) -> f64 {
    slice.iter().sum::<f64>() / slice.len() as f64
}

fn std(slice: &[f64]) -> f64 {
    let mean = mean(slice);
    let x = slice.iter().fold(0.0, |acc, x| acc + (x - mean).powi(2));
    (x / slice.len() as f64).sqrt()
}

pub struct Kde<'a> {
    sample: &'a [f64],
    pub bandwidth: f64,
    constant: f64,
}

impl<'a> Kde<'a> {
    /// Gaussian kernel with Silverman's rule of thumb bandwidth
    pub fn new(sample: &'a [f64]) -> Self {
        let factor = 4. / 3.;
        let exponent = 1. / 5.;
        let mut bandwidth = std(sample) * (factor / sample.len() as f64).powf(exponent);
        if !bandwidth.is_finite() || bandwidth <= 0.0 {
            // degenerate samples (single value), fall back to a unit kernel
            bandwidth = 1.0;
        }
        let constant = (2.0 * std::f64::consts::PI).sqrt() * bandwidth * sample.len() as f64;
        Self {
            sample,
            bandwidth,
            constant,
        }
    }

    fn kernel(&self, x: f64) -> f64 {
        (-0.5 * x.powi(2)).exp()
    }

    pub fn pdf(&self, x: f64) -> f64 {
        if self.sample.is_empty() {
            return 0.0;
        }
        let h = self.bandwidth;

        let sum = self
            .sample
            .par_iter()
            .fold(|| 0.0, |acc, xi| acc + self.kernel((x - xi) / h))
            .sum::<f64>();

        sum / self.constant
    }
}

pub struct Builder {
    bins: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self { bins: 1000 }
    }
}

impl Builder {
    pub fn build(self, scores: &[f64], decoys: &[bool]) -> Estimator {
        let d = scores
            .iter()
            .zip(decoys)
            .filter(|&(_, d)| *d)
            .map(|(s, _)| *s)
            .collect::<Vec<_>>();

        let t = scores
            .iter()
            .zip(decoys)
            .filter(|&(_, d)| !*d)
            .map(|(s, _)| *s)
            .collect::<Vec<_>>();

        // P(decoy)
        let pi = match scores.len() {
            0 => 0.0,
            n => d.len() as f64 / n as f64,
        };
        let decoy = Kde::new(&d);
        let target = Kde::new(&t);

        let mut min_score = f64::MAX;
        let mut max_score = f64::MIN;
        for s in scores {
            min_score = min_score.min(*s);
            max_score = max_score.max(*s);
        }
        if scores.is_empty() {
            min_score = 0.0;
            max_score = 0.0;
        }
        let bins = match max_score > min_score {
            true => self.bins,
            false => 1,
        };
        let score_step = match bins {
            1 => 0.0,
            _ => (max_score - min_score) / (bins - 1) as f64,
        };

        // Both densities vanish far away from the data: those bins are
        // filled from their defined neighbours afterwards
        let raw = (0..bins)
            .map(|bin| {
                let score = (bin as f64 * score_step) + min_score;
                let decoy = decoy.pdf(score) * pi;
                let target = target.pdf(score) * (1.0 - pi);
                match decoy + target > 0.0 {
                    // each decoy stands for one false target
                    true => Some((2.0 * decoy / (target + decoy)).min(1.0)),
                    false => None,
                }
            })
            .collect::<Vec<_>>();

        let mut bins = Vec::with_capacity(raw.len());
        let mut last = raw.iter().flatten().next().copied().unwrap_or(1.0);
        for pep in raw {
            last = pep.unwrap_or(last);
            bins.push(last);
        }

        // PEP may only grow as the score decreases
        let init = bins.last().copied().unwrap_or(1.0);
        bins.iter_mut().rev().fold(init, |acc, x| {
            *x = acc.max(*x);
            *x
        });

        Estimator {
            bins,
            min_score,
            score_step,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Estimator {
    bins: Vec<f64>,
    min_score: f64,
    score_step: f64,
}

impl Estimator {
    /// Calculate the posterior error probability for a given score, under the
    /// pre-fit non-parametric probability model.
    pub fn posterior_error(&self, score: f64) -> f64 {
        if self.bins.is_empty() {
            return 1.0;
        }
        if self.score_step <= 0.0 {
            return self.bins[0];
        }
        let bin_lo = self
            .bins
            .len()
            .saturating_sub(1)
            .min(((score - self.min_score) / self.score_step).floor().max(0.0) as usize);
        let bin_hi = self.bins.len().saturating_sub(1).min(bin_lo + 1);

        let lower = self.bins[bin_lo];
        let upper = self.bins[bin_hi];

        let bin_lo_score = bin_lo as f64 * self.score_step + self.min_score;
        let linear = ((score - bin_lo_score) / self.score_step).clamp(0.0, 1.0);

        (lower + (upper - lower) * linear).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn separated_distributions() {
        let mut scores = Vec::new();
        let mut decoys = Vec::new();
        for i in 0..200 {
            scores.push(i as f64 / 100.0);
            decoys.push(true);
            scores.push(2.0 + i as f64 / 100.0);
            decoys.push(false);
        }
        let estimator = Builder::default().build(&scores, &decoys);
        assert!(estimator.posterior_error(0.5) > 0.95);
        assert!(estimator.posterior_error(3.5) < 0.05);

        let mut last = 1.0;
        for i in 0..400 {
            let pep = estimator.posterior_error(i as f64 / 100.0);
            assert!(pep <= last + 1e-12);
            last = pep;
        }
    }

    #[test]
    fn degenerate_input() {
        let estimator = Builder::default().build(&[1.0, 1.0], &[false, true]);
        assert!((0.0..=1.0).contains(&estimator.posterior_error(1.0)));
        let estimator = Builder::default().build(&[], &[]);
        assert_eq!(estimator.posterior_error(3.0), 1.0);
    }
}
