use super::Family;
use crate::numeric::ln_beta;
use crate::Rng;
use crate::Score;
use rand::Rng as _;

/// Beta-Bernoulli: boolean slots under a Beta(alpha, beta) prior
#[derive(Debug, Clone, PartialEq)]
pub struct Bernoulli;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shared {
    pub alpha: f32,
    pub beta: f32,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            beta: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Group {
    pub heads: u32,
    pub tails: u32,
}

impl Group {
    fn total(&self) -> u32 {
        self.heads + self.tails
    }
}

impl Family for Bernoulli {
    type Value = bool;
    type Shared = Shared;
    type Group = Group;

    fn observe(_: &mut Shared, _: bool, _: &mut Rng) {}
    fn forget(_: &mut Shared, _: bool, _: &mut Rng) {}

    fn init_group(_: &Shared, _: &mut Rng) -> Group {
        Group::default()
    }

    fn add_value(_: &Shared, group: &mut Group, value: bool, _: &mut Rng) {
        if value {
            group.heads += 1;
        } else {
            group.tails += 1;
        }
    }

    fn remove_value(_: &Shared, group: &mut Group, value: bool, _: &mut Rng) {
        if value {
            group.heads -= 1;
        } else {
            group.tails -= 1;
        }
    }

    fn add_repeated_value(_: &Shared, group: &mut Group, value: bool, count: u32, _: &mut Rng) {
        if value {
            group.heads += count;
        } else {
            group.tails += count;
        }
    }

    fn score_value(shared: &Shared, group: &Group, value: bool, _: &mut Rng) -> Score {
        let denominator = group.total() as f32 + shared.alpha + shared.beta;
        let numerator = if value {
            group.heads as f32 + shared.alpha
        } else {
            group.tails as f32 + shared.beta
        };
        (numerator / denominator).ln()
    }

    fn score_data(shared: &Shared, group: &Group, _: &mut Rng) -> Score {
        let alpha = shared.alpha as f64;
        let beta = shared.beta as f64;
        (ln_beta(alpha + group.heads as f64, beta + group.tails as f64) - ln_beta(alpha, beta))
            as Score
    }

    fn sample_value(shared: &Shared, group: &Group, rng: &mut Rng) -> bool {
        let heads = (group.heads as f32 + shared.alpha)
            / (group.total() as f32 + shared.alpha + shared.beta);
        rng.random::<f32>() < heads
    }
}
