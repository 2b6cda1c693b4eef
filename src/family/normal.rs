use super::Family;
use crate::numeric::ln_gamma;
use crate::numeric::sample_student_t;
use crate::Rng;
use crate::Score;

/// Normal-Inverse-Chi-Squared: real slots with a Student-t posterior
/// predictive
#[derive(Debug, Clone, PartialEq)]
pub struct Normal;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shared {
    pub mu: f32,
    pub kappa: f32,
    pub sigmasq: f32,
    pub nu: f32,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            mu: 0.0,
            kappa: 1.0,
            sigmasq: 1.0,
            nu: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Group {
    pub count: u32,
    pub mean: f32,
    /// Σ (x - mean)^2, updated by the Welford recurrences
    pub count_times_variance: f32,
}

/// posterior parameters given one group's sufficient statistics
fn posterior(shared: &Shared, group: &Group) -> (f64, f64, f64, f64) {
    let n = group.count as f64;
    let mean = group.mean as f64;
    let kappa_n = shared.kappa as f64 + n;
    let mu_n = (shared.kappa as f64 * shared.mu as f64 + n * mean) / kappa_n;
    let nu_n = shared.nu as f64 + n;
    let spread = shared.kappa as f64 * n / kappa_n * (mean - shared.mu as f64).powi(2);
    let nu_sigmasq_n =
        shared.nu as f64 * shared.sigmasq as f64 + group.count_times_variance as f64 + spread;
    (mu_n, kappa_n, nu_sigmasq_n / nu_n, nu_n)
}

fn ln_student_t(x: f64, loc: f64, scalesq: f64, nu: f64) -> f64 {
    let z = (x - loc).powi(2) / scalesq;
    ln_gamma((nu + 1.0) / 2.0)
        - ln_gamma(nu / 2.0)
        - 0.5 * (nu * std::f64::consts::PI * scalesq).ln()
        - (nu + 1.0) / 2.0 * (1.0 + z / nu).ln()
}

impl Family for Normal {
    type Value = f32;
    type Shared = Shared;
    type Group = Group;

    fn observe(_: &mut Shared, _: f32, _: &mut Rng) {}
    fn forget(_: &mut Shared, _: f32, _: &mut Rng) {}

    fn init_group(_: &Shared, _: &mut Rng) -> Group {
        Group::default()
    }

    fn add_value(_: &Shared, group: &mut Group, value: f32, _: &mut Rng) {
        group.count += 1;
        let delta = value - group.mean;
        group.mean += delta / group.count as f32;
        group.count_times_variance += delta * (value - group.mean);
    }

    fn remove_value(_: &Shared, group: &mut Group, value: f32, _: &mut Rng) {
        let total = group.mean * group.count as f32;
        group.count -= 1;
        if group.count == 0 {
            *group = Group::default();
        } else {
            let mean = (total - value) / group.count as f32;
            let delta = value - mean;
            group.count_times_variance =
                (group.count_times_variance - delta * (value - group.mean)).max(0.0);
            group.mean = mean;
        }
    }

    fn score_value(shared: &Shared, group: &Group, value: f32, _: &mut Rng) -> Score {
        let (mu_n, kappa_n, sigmasq_n, nu_n) = posterior(shared, group);
        let scalesq = sigmasq_n * (1.0 + 1.0 / kappa_n);
        ln_student_t(value as f64, mu_n, scalesq, nu_n) as Score
    }

    fn score_data(shared: &Shared, group: &Group, _: &mut Rng) -> Score {
        let n = group.count as f64;
        if group.count == 0 {
            return 0.0;
        }
        let (_, kappa_n, sigmasq_n, nu_n) = posterior(shared, group);
        let nu = shared.nu as f64;
        let score = ln_gamma(nu_n / 2.0) - ln_gamma(nu / 2.0)
            + 0.5 * (shared.kappa as f64 / kappa_n).ln()
            + nu / 2.0 * (nu * shared.sigmasq as f64).ln()
            - nu_n / 2.0 * (nu_n * sigmasq_n).ln()
            - n / 2.0 * std::f64::consts::PI.ln();
        score as Score
    }

    fn sample_value(shared: &Shared, group: &Group, rng: &mut Rng) -> f32 {
        let (mu_n, kappa_n, sigmasq_n, nu_n) = posterior(shared, group);
        let scale = (sigmasq_n * (1.0 + 1.0 / kappa_n)).sqrt();
        (mu_n + scale * sample_student_t(rng, nu_n)) as f32
    }
}
