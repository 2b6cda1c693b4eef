use super::Family;
use crate::numeric::ln_factorial;
use crate::numeric::ln_gamma;
use crate::numeric::sample_gamma;
use crate::numeric::sample_poisson;
use crate::Rng;
use crate::Score;

/// Gamma-Poisson: unbounded count slots with a negative-binomial
/// posterior predictive
#[derive(Debug, Clone, PartialEq)]
pub struct Poisson;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shared {
    pub alpha: f32,
    pub inv_beta: f32,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            inv_beta: 1.0,
        }
    }
}

impl Shared {
    fn beta(&self) -> f64 {
        1.0 / self.inv_beta as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Group {
    pub count: u32,
    pub sum: u32,
    /// Σ ln(x!) over absorbed values, kept for the marginal
    pub log_prod: f32,
}

impl Family for Poisson {
    type Value = u32;
    type Shared = Shared;
    type Group = Group;

    fn observe(_: &mut Shared, _: u32, _: &mut Rng) {}
    fn forget(_: &mut Shared, _: u32, _: &mut Rng) {}

    fn init_group(_: &Shared, _: &mut Rng) -> Group {
        Group::default()
    }

    fn add_value(_: &Shared, group: &mut Group, value: u32, _: &mut Rng) {
        group.count += 1;
        group.sum += value;
        group.log_prod += ln_factorial(value) as f32;
    }

    fn remove_value(_: &Shared, group: &mut Group, value: u32, _: &mut Rng) {
        group.count -= 1;
        group.sum -= value;
        group.log_prod -= ln_factorial(value) as f32;
    }

    fn add_repeated_value(_: &Shared, group: &mut Group, value: u32, count: u32, _: &mut Rng) {
        group.count += count;
        group.sum += value * count;
        group.log_prod += count as f32 * ln_factorial(value) as f32;
    }

    fn score_value(shared: &Shared, group: &Group, value: u32, _: &mut Rng) -> Score {
        let alpha = shared.alpha as f64 + group.sum as f64;
        let beta = shared.beta() + group.count as f64;
        let odds = beta / (beta + 1.0);
        let score = ln_gamma(alpha + value as f64) - ln_gamma(alpha) - ln_factorial(value)
            + alpha * odds.ln()
            + value as f64 * (1.0 - odds).ln();
        score as Score
    }

    fn score_data(shared: &Shared, group: &Group, _: &mut Rng) -> Score {
        let alpha = shared.alpha as f64;
        let beta = shared.beta();
        let alpha_n = alpha + group.sum as f64;
        let beta_n = beta + group.count as f64;
        let score = alpha * beta.ln() - ln_gamma(alpha) + ln_gamma(alpha_n)
            - alpha_n * beta_n.ln()
            - group.log_prod as f64;
        score as Score
    }

    fn sample_value(shared: &Shared, group: &Group, rng: &mut Rng) -> u32 {
        let alpha = shared.alpha as f64 + group.sum as f64;
        let beta = shared.beta() + group.count as f64;
        let lambda = sample_gamma(rng, alpha) / beta;
        sample_poisson(rng, lambda)
    }
}
