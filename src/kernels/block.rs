use crate::family::PitmanYor;
use crate::numeric::sample_from_likelihoods;
use crate::Error;
use crate::Result;
use crate::Rng;
use crate::Score;
use std::collections::BTreeSet;

// Block Pitman-Yor sampler over feature-to-kind assignments. Resamples
// every feature's kind within a single sweep against precomputed
// likelihood vectors, treating the clustering over kinds as a
// Pitman-Yor process whose fresh-kind mass is split evenly across the
// currently empty kinds.
pub struct BlockPitmanYor<'a> {
    alpha: f32,
    d: f32,
    kind_count: usize,
    likelihoods: &'a [Vec<Score>],
    assignments: &'a mut [u32],
    counts: Vec<u32>,
    empty_kinds: BTreeSet<u32>,
    prior: Vec<Score>,
    posterior: Vec<Score>,
}

impl<'a> BlockPitmanYor<'a> {
    pub fn new(
        topology: &PitmanYor,
        likelihoods: &'a [Vec<Score>],
        assignments: &'a mut [u32],
    ) -> Result<Self> {
        topology.validate()?;
        if !topology.alpha.is_finite() || !topology.d.is_finite() {
            return Err(Error::InvalidHyperparameters {
                alpha: topology.alpha,
                d: topology.d,
            });
        }
        debug_assert!(!likelihoods.is_empty());
        debug_assert_eq!(likelihoods.len(), assignments.len());
        let kind_count = likelihoods[0].len();
        debug_assert!(likelihoods.iter().all(|l| l.len() == kind_count));
        let mut sampler = Self {
            alpha: topology.alpha,
            d: topology.d,
            kind_count,
            likelihoods,
            assignments,
            counts: vec![],
            empty_kinds: BTreeSet::new(),
            prior: vec![],
            posterior: vec![0.0; kind_count],
        };
        sampler.counts = sampler.counts_from_assignments();
        sampler.empty_kinds = sampler
            .counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(k, _)| k as u32)
            .collect();
        sampler.prior = sampler.prior_from_counts();
        Ok(sampler)
    }

    fn counts_from_assignments(&self) -> Vec<u32> {
        let mut counts = vec![0; self.kind_count];
        for kindid in self.assignments.iter() {
            counts[*kindid as usize] += 1;
        }
        counts
    }

    fn likelihood_empty(&self) -> Score {
        if self.empty_kinds.is_empty() {
            0.0
        } else {
            let nonempty = (self.kind_count - self.empty_kinds.len()) as f32;
            (self.alpha + self.d * nonempty) / self.empty_kinds.len() as f32
        }
    }

    fn prior_from_counts(&self) -> Vec<Score> {
        let fresh = self.likelihood_empty();
        self.counts
            .iter()
            .map(|count| {
                if *count > 0 {
                    *count as f32 - self.d
                } else {
                    fresh
                }
            })
            .collect()
    }

    fn add_empty_kind(&mut self, kindid: u32) {
        self.empty_kinds.insert(kindid);
        let fresh = self.likelihood_empty();
        for k in self.empty_kinds.iter() {
            self.prior[*k as usize] = fresh;
        }
    }

    fn remove_empty_kind(&mut self, kindid: u32) {
        self.empty_kinds.remove(&kindid);
        let fresh = self.likelihood_empty();
        for k in self.empty_kinds.iter() {
            self.prior[*k as usize] = fresh;
        }
    }

    fn compute_posterior(&mut self, featureid: usize) -> Score {
        let likelihood = &self.likelihoods[featureid];
        let mut total = 0.0;
        for ((posterior, prior), likelihood) in self
            .posterior
            .iter_mut()
            .zip(self.prior.iter())
            .zip(likelihood.iter())
        {
            *posterior = prior * likelihood;
            total += *posterior;
        }
        total
    }

    pub fn run(&mut self, iterations: usize, rng: &mut Rng) {
        for _ in 0..iterations {
            for featureid in 0..self.assignments.len() {
                let old = self.assignments[featureid] as usize;
                self.counts[old] -= 1;
                if self.counts[old] == 0 {
                    self.add_empty_kind(old as u32);
                } else {
                    self.prior[old] = self.counts[old] as f32 - self.d;
                }

                let total = self.compute_posterior(featureid);
                let new = sample_from_likelihoods(rng, &self.posterior, total);
                self.assignments[featureid] = new as u32;

                if self.counts[new] == 0 {
                    self.remove_empty_kind(new as u32);
                }
                self.counts[new] += 1;
                self.prior[new] = self.counts[new] as f32 - self.d;

                #[cfg(debug_assertions)]
                self.validate();
            }
        }
    }

    #[cfg(debug_assertions)]
    fn validate(&self) {
        let expected = self.counts_from_assignments();
        debug_assert_eq!(self.counts, expected);
        for (k, count) in self.counts.iter().enumerate() {
            debug_assert_eq!(self.empty_kinds.contains(&(k as u32)), *count == 0);
        }
        let expected = self.prior_from_counts();
        for (actual, expected) in self.prior.iter().zip(expected.iter()) {
            let close = (actual - expected).abs() / (actual + expected + 1e-20) < 1e-4;
            debug_assert!(close, "prior {} drifted from {}", actual, expected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn uniform_likelihoods(features: usize, kinds: usize) -> Vec<Vec<Score>> {
        vec![vec![1.0; kinds]; features]
    }

    #[test]
    fn rejects_bad_hyperparameters() {
        let likelihoods = uniform_likelihoods(2, 2);
        let mut assignments = vec![0, 0];
        for (alpha, d) in [(0.0, 0.0), (1.0, 1.0), (1.0, -0.5)] {
            let topology = PitmanYor { alpha, d };
            assert!(matches!(
                BlockPitmanYor::new(&topology, &likelihoods, &mut assignments),
                Err(Error::InvalidHyperparameters { .. })
            ));
        }
    }

    #[test]
    fn bookkeeping_stays_exact_across_sweeps() {
        // the debug validate() inside run() checks counts, empties, and
        // prior after every flip
        let mut rng = Rng::seed_from_u64(0);
        let likelihoods = uniform_likelihoods(6, 3);
        let mut assignments = vec![0; 6];
        let topology = PitmanYor { alpha: 1.0, d: 0.0 };
        let mut sampler = BlockPitmanYor::new(&topology, &likelihoods, &mut assignments).unwrap();
        sampler.run(50, &mut rng);
        drop(sampler);
        assert!(assignments.iter().all(|k| *k < 3));
    }

    #[test]
    fn zero_iterations_is_a_no_op() {
        let mut rng = Rng::seed_from_u64(0);
        let likelihoods = uniform_likelihoods(4, 2);
        let mut assignments = vec![0, 1, 0, 1];
        let before = assignments.clone();
        let topology = PitmanYor { alpha: 1.0, d: 0.1 };
        let mut sampler = BlockPitmanYor::new(&topology, &likelihoods, &mut assignments).unwrap();
        sampler.run(0, &mut rng);
        drop(sampler);
        assert_eq!(assignments, before);
    }

    #[test]
    fn crp_frequencies_match_the_prior_on_two_points() {
        // two features, two kinds, uniform likelihoods, alpha = 1, d = 0:
        // P(together) = 1 / (1 + alpha) = 1/2
        let mut rng = Rng::seed_from_u64(42);
        let likelihoods = uniform_likelihoods(2, 2);
        let topology = PitmanYor { alpha: 1.0, d: 0.0 };
        let mut together = 0;
        let trials = 4000;
        for _ in 0..trials {
            let mut assignments = vec![0, 0];
            let mut sampler =
                BlockPitmanYor::new(&topology, &likelihoods, &mut assignments).unwrap();
            sampler.run(8, &mut rng);
            drop(sampler);
            if assignments[0] == assignments[1] {
                together += 1;
            }
        }
        let observed = together as f64 / trials as f64;
        assert!(
            (observed - 0.5).abs() < 0.05,
            "P(together) = {}",
            observed
        );
    }

    #[test]
    fn forced_likelihoods_move_the_feature() {
        let mut rng = Rng::seed_from_u64(0);
        // feature 1 overwhelmingly prefers kind 1
        let likelihoods = vec![vec![1.0, 1e-6], vec![1e-6, 1.0]];
        let mut assignments = vec![0, 0];
        let topology = PitmanYor { alpha: 1.0, d: 0.0 };
        let mut sampler = BlockPitmanYor::new(&topology, &likelihoods, &mut assignments).unwrap();
        sampler.run(4, &mut rng);
        drop(sampler);
        assert_eq!(assignments, vec![0, 1]);
    }
}
