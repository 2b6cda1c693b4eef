use crate::Rng;
use crate::Score;
use rand::Rng as _;

/// ln Γ(x) by the Lanczos approximation (g = 7, n = 9).
/// accurate to ~15 significant digits for x > 0, which is far beyond
/// the f32 scores the samplers consume.
pub fn ln_gamma(x: f64) -> f64 {
    const G: [f64; 9] = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];
    if x < 0.5 {
        // reflection for the left half plane
        std::f64::consts::PI.ln() - (std::f64::consts::PI * x).sin().ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let t = x + 7.5;
        let s = G
            .iter()
            .enumerate()
            .skip(1)
            .fold(G[0], |s, (i, g)| s + g / (x + i as f64));
        0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + s.ln()
    }
}

pub fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

pub fn ln_factorial(n: u32) -> f64 {
    ln_gamma(n as f64 + 1.0)
}

/// convert log scores to likelihoods in place, shifting by the max
/// so the largest score maps to 1. returns the likelihood total.
pub fn scores_to_likelihoods(scores: &mut [Score]) -> Score {
    let max = scores.iter().cloned().fold(Score::NEG_INFINITY, Score::max);
    let mut total = 0.0;
    for score in scores.iter_mut() {
        *score = (*score - max).exp();
        total += *score;
    }
    total
}

/// draw an index proportional to the given nonnegative likelihoods
pub fn sample_from_likelihoods(rng: &mut Rng, likelihoods: &[Score], total: Score) -> usize {
    let mut target = rng.random::<f32>() * total;
    for (i, likelihood) in likelihoods.iter().enumerate() {
        target -= likelihood;
        if target < 0.0 {
            return i;
        }
    }
    likelihoods.len() - 1
}

/// draw an index proportional to exp(score), clobbering the scores
pub fn sample_from_scores(rng: &mut Rng, scores: &mut [Score]) -> usize {
    let total = scores_to_likelihoods(scores);
    sample_from_likelihoods(rng, scores, total)
}

/// log-sum-exp of the whole slice
pub fn log_sum_exp(scores: &[Score]) -> Score {
    let max = scores.iter().cloned().fold(Score::NEG_INFINITY, Score::max);
    if max.is_infinite() {
        return max;
    }
    max + scores
        .iter()
        .map(|s| (s - max).exp())
        .sum::<Score>()
        .ln()
}

/// row n of the unsigned Stirling numbers of the first kind, in log space.
/// out[k] = ln |s(n, k)| for k in 0..=n, built by the recurrence
/// s(n+1, k) = s(n, k-1) + n * s(n, k).
pub fn log_stirling1_row(n: u32, out: &mut Vec<Score>) {
    out.clear();
    out.push(0.0); // s(0, 0) = 1
    for m in 0..n as usize {
        let factor = (m as f64).ln();
        let prev = out.clone();
        out.clear();
        out.resize(m + 2, Score::NEG_INFINITY);
        for k in 0..=m + 1 {
            let carry = if k > 0 { prev[k - 1] as f64 } else { f64::NEG_INFINITY };
            let scale = if k <= m && m > 0 {
                prev[k] as f64 + factor
            } else if k <= m && m == 0 {
                f64::NEG_INFINITY
            } else {
                f64::NEG_INFINITY
            };
            let max = carry.max(scale);
            out[k] = if max.is_finite() {
                (max + ((carry - max).exp() + (scale - max).exp()).ln()) as Score
            } else {
                Score::NEG_INFINITY
            };
        }
    }
}

//----------------------------------------------------------------------------
// samplers for the conjugate families

/// standard normal via the polar method
pub fn sample_normal(rng: &mut Rng) -> f64 {
    loop {
        let u = 2.0 * rng.random::<f64>() - 1.0;
        let v = 2.0 * rng.random::<f64>() - 1.0;
        let s = u * u + v * v;
        if s > 0.0 && s < 1.0 {
            return u * (-2.0 * s.ln() / s).sqrt();
        }
    }
}

/// Gamma(shape, 1) via Marsaglia-Tsang, with the shape < 1 boost
pub fn sample_gamma(rng: &mut Rng, shape: f64) -> f64 {
    if shape < 1.0 {
        let u: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
        return sample_gamma(rng, shape + 1.0) * u.powf(1.0 / shape);
    }
    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    loop {
        let x = sample_normal(rng);
        let v = 1.0 + c * x;
        if v <= 0.0 {
            continue;
        }
        let v = v * v * v;
        let u: f64 = rng.random();
        if u < 1.0 - 0.0331 * x * x * x * x {
            return d * v;
        }
        if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}

pub fn sample_beta(rng: &mut Rng, a: f64, b: f64) -> f64 {
    let x = sample_gamma(rng, a);
    let y = sample_gamma(rng, b);
    x / (x + y)
}

pub fn sample_poisson(rng: &mut Rng, lambda: f64) -> u32 {
    // split large rates so the Knuth product stays in range
    if lambda > 32.0 {
        let half = sample_poisson(rng, lambda / 2.0);
        return half + sample_poisson(rng, lambda / 2.0);
    }
    let limit = (-lambda).exp();
    let mut product: f64 = rng.random();
    let mut count = 0;
    while product > limit {
        product *= rng.random::<f64>();
        count += 1;
    }
    count
}

pub fn sample_student_t(rng: &mut Rng, nu: f64) -> f64 {
    let z = sample_normal(rng);
    let chi2 = 2.0 * sample_gamma(rng, nu / 2.0);
    z / (chi2 / nu).sqrt()
}

/// Dirichlet draw proportional to the weights, with every component
/// clamped to at least `min` and renormalized
pub fn sample_dirichlet_safe(rng: &mut Rng, weights: &mut [f32], min: f32) {
    let mut total = 0.0;
    for w in weights.iter_mut() {
        *w = sample_gamma(rng, (*w).max(min) as f64) as f32;
        total += *w;
    }
    for w in weights.iter_mut() {
        *w = (*w / total).max(min);
    }
    let total: f32 = weights.iter().sum();
    for w in weights.iter_mut() {
        *w /= total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn ln_gamma_matches_factorials() {
        for n in 1u32..10 {
            let expected: f64 = (1..n).map(|i| (i as f64).ln()).sum();
            assert!((ln_gamma(n as f64) - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn ln_gamma_half() {
        assert!((ln_gamma(0.5) - std::f64::consts::PI.sqrt().ln()).abs() < 1e-9);
    }

    #[test]
    fn stirling_rows_are_exact_for_small_n() {
        let mut row = Vec::new();
        log_stirling1_row(4, &mut row);
        // |s(4, .)| = [0, 6, 11, 6, 1]
        let expected = [f32::NEG_INFINITY, 6f32.ln(), 11f32.ln(), 6f32.ln(), 0.0];
        assert_eq!(row.len(), 5);
        for (got, want) in row.iter().zip(expected.iter()) {
            if want.is_finite() {
                assert!((got - want).abs() < 1e-4, "{} vs {}", got, want);
            } else {
                assert!(got.is_infinite());
            }
        }
    }

    #[test]
    fn scores_sample_in_proportion() {
        let mut rng = Rng::seed_from_u64(0);
        let mut hits = [0usize; 2];
        for _ in 0..10_000 {
            let mut scores = [0.0, (3.0f32).ln()];
            hits[sample_from_scores(&mut rng, &mut scores)] += 1;
        }
        let ratio = hits[1] as f64 / hits[0] as f64;
        assert!((ratio - 3.0).abs() < 0.3, "ratio {}", ratio);
    }

    #[test]
    fn gamma_sampler_has_the_right_mean() {
        let mut rng = Rng::seed_from_u64(7);
        let n = 20_000;
        let mean: f64 = (0..n).map(|_| sample_gamma(&mut rng, 2.5)).sum::<f64>() / n as f64;
        assert!((mean - 2.5).abs() < 0.1, "mean {}", mean);
    }

    #[test]
    fn dirichlet_safe_normalizes() {
        let mut rng = Rng::seed_from_u64(1);
        let mut weights = [1.0, 2.0, 3.0];
        sample_dirichlet_safe(&mut rng, &mut weights, 1e-6);
        let total: f32 = weights.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(weights.iter().all(|w| *w >= 1e-7));
    }
}
