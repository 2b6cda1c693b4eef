use super::Family;
use crate::numeric::ln_gamma;
use crate::numeric::sample_beta;
use crate::numeric::sample_from_likelihoods;
use crate::Rng;
use crate::Score;
use std::collections::BTreeMap;

/// Dirichlet-process discrete: unbounded count slots. the shared holds a
/// stick-breaking measure over the values seen so far plus a remainder
/// mass `beta0` for everything unseen.
#[derive(Debug, Clone, PartialEq)]
pub struct Process;

pub const MIN_BETA: f32 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct Shared {
    pub gamma: f32,
    pub alpha: f32,
    pub beta0: f32,
    pub betas: BTreeMap<u32, f32>,
    pub counts: BTreeMap<u32, u32>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            alpha: 1.0,
            beta0: 1.0,
            betas: BTreeMap::new(),
            counts: BTreeMap::new(),
        }
    }
}

impl Shared {
    pub fn beta(&self, value: u32) -> f32 {
        self.betas.get(&value).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Group {
    pub counts: BTreeMap<u32, u32>,
    pub total: u32,
}

impl Family for Process {
    type Value = u32;
    type Shared = Shared;
    type Group = Group;

    /// first sighting of a value breaks a piece off the remainder stick
    fn observe(shared: &mut Shared, value: u32, rng: &mut Rng) {
        *shared.counts.entry(value).or_insert(0) += 1;
        if !shared.betas.contains_key(&value) {
            let piece = sample_beta(rng, 1.0, shared.gamma as f64) as f32;
            let beta = (shared.beta0 * piece).max(MIN_BETA);
            shared.beta0 = (shared.beta0 - beta).max(MIN_BETA);
            shared.betas.insert(value, beta);
        }
    }

    fn forget(shared: &mut Shared, value: u32, _: &mut Rng) {
        let count = shared.counts.get_mut(&value).expect("forgotten value was observed");
        *count -= 1;
        if *count == 0 {
            shared.counts.remove(&value);
            shared.beta0 += shared.betas.remove(&value).unwrap_or(0.0);
        }
    }

    fn init_group(_: &Shared, _: &mut Rng) -> Group {
        Group::default()
    }

    fn add_value(_: &Shared, group: &mut Group, value: u32, _: &mut Rng) {
        *group.counts.entry(value).or_insert(0) += 1;
        group.total += 1;
    }

    fn remove_value(_: &Shared, group: &mut Group, value: u32, _: &mut Rng) {
        let count = group.counts.get_mut(&value).expect("removed value was added");
        *count -= 1;
        if *count == 0 {
            group.counts.remove(&value);
        }
        group.total -= 1;
    }

    fn add_repeated_value(_: &Shared, group: &mut Group, value: u32, count: u32, _: &mut Rng) {
        *group.counts.entry(value).or_insert(0) += count;
        group.total += count;
    }

    fn score_value(shared: &Shared, group: &Group, value: u32, _: &mut Rng) -> Score {
        let count = group.counts.get(&value).copied().unwrap_or(0) as f32;
        let beta = shared.betas.get(&value).copied().unwrap_or(shared.beta0);
        let numerator = (count + shared.alpha * beta).max(f32::MIN_POSITIVE);
        let denominator = group.total as f32 + shared.alpha;
        (numerator / denominator).ln()
    }

    fn score_data(shared: &Shared, group: &Group, _: &mut Rng) -> Score {
        let alpha = shared.alpha as f64;
        let mut score = ln_gamma(alpha) - ln_gamma(alpha + group.total as f64);
        for (value, count) in group.counts.iter() {
            let prior = alpha * shared.beta(*value).max(MIN_BETA) as f64;
            score += ln_gamma(prior + *count as f64) - ln_gamma(prior);
        }
        score as Score
    }

    fn sample_value(shared: &Shared, group: &Group, rng: &mut Rng) -> u32 {
        let values: Vec<u32> = shared.betas.keys().copied().collect();
        let mut likelihoods: Vec<f32> = values
            .iter()
            .map(|value| {
                group.counts.get(value).copied().unwrap_or(0) as f32
                    + shared.alpha * shared.beta(*value)
            })
            .collect();
        likelihoods.push(shared.alpha * shared.beta0);
        let total = likelihoods.iter().sum();
        let choice = sample_from_likelihoods(rng, &likelihoods, total);
        match values.get(choice) {
            Some(value) => *value,
            // an unseen value: the smallest id not yet observed
            Option::None => (0..).find(|v| !shared.betas.contains_key(v)).expect("finite map"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn observe_forget_restores_remainder_mass() {
        let mut rng = Rng::seed_from_u64(0);
        let mut shared = Shared::default();
        Process::observe(&mut shared, 7, &mut rng);
        let beta7 = shared.beta(7);
        assert!(beta7 > 0.0);
        assert!(shared.beta0 < 1.0);
        Process::forget(&mut shared, 7, &mut rng);
        assert!(shared.betas.is_empty());
        assert!((shared.beta0 - (1.0 - beta7) - beta7).abs() < 1e-6);
    }

    #[test]
    fn scores_favor_the_heavy_value() {
        let mut rng = Rng::seed_from_u64(0);
        let mut shared = Shared::default();
        for _ in 0..3 {
            Process::observe(&mut shared, 1, &mut rng);
        }
        Process::observe(&mut shared, 2, &mut rng);
        let mut group = Process::init_group(&shared, &mut rng);
        for _ in 0..5 {
            Process::add_value(&shared, &mut group, 1, &mut rng);
        }
        Process::add_value(&shared, &mut group, 2, &mut rng);
        let heavy = Process::score_value(&shared, &group, 1, &mut rng);
        let light = Process::score_value(&shared, &group, 2, &mut rng);
        assert!(heavy > light);
    }

    #[test]
    fn group_add_remove_is_identity() {
        let mut rng = Rng::seed_from_u64(0);
        let shared = Shared::default();
        let mut group = Group::default();
        Process::add_value(&shared, &mut group, 3, &mut rng);
        Process::add_value(&shared, &mut group, 3, &mut rng);
        Process::remove_value(&shared, &mut group, 3, &mut rng);
        Process::remove_value(&shared, &mut group, 3, &mut rng);
        assert_eq!(group, Group::default());
    }
}
