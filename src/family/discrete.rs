use super::Family;
use crate::numeric::ln_gamma;
use crate::numeric::sample_from_likelihoods;
use crate::Rng;
use crate::Score;

/// Dirichlet-Discrete: bounded count slots over a fixed alphabet.
/// two width specialisations are compiled, chosen at model load by the
/// observed alphabet: `D16` for dims up to 16, `D256` up to 256.
#[derive(Debug, Clone, PartialEq)]
pub struct Discrete<const WIDTH: usize>;

pub type D16 = Discrete<16>;
pub type D256 = Discrete<256>;

#[derive(Debug, Clone, PartialEq)]
pub struct Shared {
    pub alphas: Vec<f32>,
}

impl Shared {
    pub fn uniform(dim: usize) -> Self {
        Self {
            alphas: vec![1.0; dim],
        }
    }

    pub fn dim(&self) -> usize {
        self.alphas.len()
    }

    fn alpha_sum(&self) -> f32 {
        self.alphas.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Group {
    pub counts: Vec<u32>,
    pub total: u32,
}

impl<const WIDTH: usize> Family for Discrete<WIDTH> {
    type Value = u32;
    type Shared = Shared;
    type Group = Group;

    fn observe(shared: &mut Shared, value: u32, _: &mut Rng) {
        debug_assert!((value as usize) < shared.dim().min(WIDTH));
    }
    fn forget(_: &mut Shared, _: u32, _: &mut Rng) {}

    fn init_group(shared: &Shared, _: &mut Rng) -> Group {
        Group {
            counts: vec![0; shared.dim()],
            total: 0,
        }
    }

    fn add_value(_: &Shared, group: &mut Group, value: u32, _: &mut Rng) {
        group.counts[value as usize] += 1;
        group.total += 1;
    }

    fn remove_value(_: &Shared, group: &mut Group, value: u32, _: &mut Rng) {
        group.counts[value as usize] -= 1;
        group.total -= 1;
    }

    fn add_repeated_value(_: &Shared, group: &mut Group, value: u32, count: u32, _: &mut Rng) {
        group.counts[value as usize] += count;
        group.total += count;
    }

    fn score_value(shared: &Shared, group: &Group, value: u32, _: &mut Rng) -> Score {
        let numerator = group.counts[value as usize] as f32 + shared.alphas[value as usize];
        let denominator = group.total as f32 + shared.alpha_sum();
        (numerator / denominator).ln()
    }

    fn score_data(shared: &Shared, group: &Group, _: &mut Rng) -> Score {
        let alpha_sum = shared.alpha_sum() as f64;
        let mut score = ln_gamma(alpha_sum) - ln_gamma(alpha_sum + group.total as f64);
        for (count, alpha) in group.counts.iter().zip(shared.alphas.iter()) {
            if *count > 0 {
                score += ln_gamma(*alpha as f64 + *count as f64) - ln_gamma(*alpha as f64);
            }
        }
        score as Score
    }

    fn sample_value(shared: &Shared, group: &Group, rng: &mut Rng) -> u32 {
        let likelihoods: Vec<f32> = group
            .counts
            .iter()
            .zip(shared.alphas.iter())
            .map(|(count, alpha)| *count as f32 + alpha)
            .collect();
        let total = likelihoods.iter().sum();
        sample_from_likelihoods(rng, &likelihoods, total) as u32
    }
}
