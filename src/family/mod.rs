pub mod bernoulli;
pub mod clustering;
pub mod discrete;
pub mod normal;
pub mod poisson;
pub mod prior;
pub mod process;

pub use clustering::Clustering;
pub use clustering::PitmanYor;
pub use prior::HyperPrior;

use crate::Rng;
use crate::Score;

/// the conjugate-family capability set. each family supplies corpus-level
/// shared parameters, per-group sufficient statistics, and the scoring
/// primitives the mixture composes. the family list is closed: BB, DD16,
/// DD256, DPD, GP, NICH.
pub trait Family: 'static {
    type Value: Copy + PartialEq + std::fmt::Debug;
    type Shared: Clone + PartialEq + std::fmt::Debug;
    type Group: Clone + PartialEq + std::fmt::Debug;

    /// corpus-level running stats on the shared parameters
    fn observe(shared: &mut Self::Shared, value: Self::Value, rng: &mut Rng);
    fn forget(shared: &mut Self::Shared, value: Self::Value, rng: &mut Rng);

    fn init_group(shared: &Self::Shared, rng: &mut Rng) -> Self::Group;
    fn add_value(shared: &Self::Shared, group: &mut Self::Group, value: Self::Value, rng: &mut Rng);
    fn remove_value(
        shared: &Self::Shared,
        group: &mut Self::Group,
        value: Self::Value,
        rng: &mut Rng,
    );

    /// tare fast path: fold `count` copies of one value into a group
    fn add_repeated_value(
        shared: &Self::Shared,
        group: &mut Self::Group,
        value: Self::Value,
        count: u32,
        rng: &mut Rng,
    ) {
        for _ in 0..count {
            Self::add_value(shared, group, value, rng);
        }
    }

    /// log posterior predictive of one value under one group
    fn score_value(shared: &Self::Shared, group: &Self::Group, value: Self::Value, rng: &mut Rng)
        -> Score;

    /// log marginal of the data absorbed by one group
    fn score_data(shared: &Self::Shared, group: &Self::Group, rng: &mut Rng) -> Score;

    fn sample_value(shared: &Self::Shared, group: &Self::Group, rng: &mut Rng) -> Self::Value;
}

/// per-feature vector of group statistics, one entry per packed group id.
/// the batched score and grid operations live here so every family gets
/// them from one generic definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMixture<F: Family> {
    pub groups: Vec<F::Group>,
}

impl<F: Family> Default for FeatureMixture<F> {
    fn default() -> Self {
        Self { groups: vec![] }
    }
}

impl<F: Family> FeatureMixture<F> {
    pub fn init_groups(shared: &F::Shared, group_count: usize, rng: &mut Rng) -> Self {
        Self {
            groups: (0..group_count).map(|_| F::init_group(shared, rng)).collect(),
        }
    }

    pub fn add_group(&mut self, shared: &F::Shared, rng: &mut Rng) {
        self.groups.push(F::init_group(shared, rng));
    }

    pub fn remove_group(&mut self, groupid: usize) {
        self.groups.swap_remove(groupid);
    }

    pub fn add_value(&mut self, shared: &F::Shared, groupid: usize, value: F::Value, rng: &mut Rng) {
        F::add_value(shared, &mut self.groups[groupid], value, rng);
    }

    pub fn remove_value(
        &mut self,
        shared: &F::Shared,
        groupid: usize,
        value: F::Value,
        rng: &mut Rng,
    ) {
        F::remove_value(shared, &mut self.groups[groupid], value, rng);
    }

    /// one log likelihood per group, accumulated into the caller's vector
    pub fn score_value(
        &self,
        shared: &F::Shared,
        value: F::Value,
        scores: &mut [Score],
        rng: &mut Rng,
    ) {
        debug_assert_eq!(scores.len(), self.groups.len());
        for (score, group) in scores.iter_mut().zip(self.groups.iter()) {
            *score += F::score_value(shared, group, value, rng);
        }
    }

    pub fn score_value_group(
        &self,
        shared: &F::Shared,
        groupid: usize,
        value: F::Value,
        rng: &mut Rng,
    ) -> Score {
        F::score_value(shared, &self.groups[groupid], value, rng)
    }

    /// log marginal of this feature's data across all groups
    pub fn score_data(&self, shared: &F::Shared, rng: &mut Rng) -> Score {
        self.groups
            .iter()
            .map(|group| F::score_data(shared, group, rng))
            .sum()
    }

    /// grid Gibbs support: score the data under each hypothesised shared
    pub fn score_data_grid(&self, hypotheses: &[F::Shared], scores: &mut Vec<Score>, rng: &mut Rng) {
        scores.clear();
        for shared in hypotheses {
            scores.push(self.score_data(shared, rng));
        }
    }

    pub fn sample_value(&self, shared: &F::Shared, groupid: usize, rng: &mut Rng) -> F::Value {
        F::sample_value(shared, &self.groups[groupid], rng)
    }
}
