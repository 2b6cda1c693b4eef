use super::PitmanYor;

/// hyperparameter grids for grid Gibbs. each resampling task proposes
/// every point (the cartesian product for multi-dimensional families),
/// scores the data under it, and samples a replacement shared.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HyperPrior {
    pub topology: Vec<PitmanYor>,
    pub clustering: Vec<PitmanYor>,
    pub bb: BernoulliGrid,
    pub dd: DiscreteGrid,
    pub dpd: ProcessGrid,
    pub gp: PoissonGrid,
    pub nich: NormalGrid,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BernoulliGrid {
    pub alpha: Vec<f32>,
    pub beta: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DiscreteGrid {
    pub alpha: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProcessGrid {
    pub alpha: Vec<f32>,
    pub gamma: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PoissonGrid {
    pub alpha: Vec<f32>,
    pub inv_beta: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NormalGrid {
    pub mu: Vec<f32>,
    pub kappa: Vec<f32>,
    pub sigmasq: Vec<f32>,
    pub nu: Vec<f32>,
}

fn log_spaced(lo: f32, hi: f32, size: usize) -> Vec<f32> {
    let step = (hi / lo).ln() / (size - 1) as f32;
    (0..size).map(|i| lo * (step * i as f32).exp()).collect()
}

impl Default for HyperPrior {
    fn default() -> Self {
        let pitman_yor = [0.1, 1.0, 10.0]
            .into_iter()
            .flat_map(|alpha| {
                [0.0, 0.1, 0.5]
                    .into_iter()
                    .map(move |d| PitmanYor { alpha, d })
            })
            .collect::<Vec<_>>();
        Self {
            topology: pitman_yor.clone(),
            clustering: pitman_yor,
            bb: BernoulliGrid {
                alpha: log_spaced(0.1, 10.0, 5),
                beta: log_spaced(0.1, 10.0, 5),
            },
            dd: DiscreteGrid {
                alpha: log_spaced(0.1, 10.0, 7),
            },
            dpd: ProcessGrid {
                alpha: log_spaced(0.1, 10.0, 5),
                gamma: log_spaced(0.1, 10.0, 5),
            },
            gp: PoissonGrid {
                alpha: log_spaced(0.1, 10.0, 5),
                inv_beta: log_spaced(0.1, 10.0, 5),
            },
            nich: NormalGrid {
                mu: vec![-10.0, -1.0, 0.0, 1.0, 10.0],
                kappa: log_spaced(0.1, 10.0, 5),
                sigmasq: log_spaced(0.01, 100.0, 7),
                nu: log_spaced(0.5, 50.0, 5),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grids_are_nonempty_and_finite() {
        let prior = HyperPrior::default();
        assert!(!prior.topology.is_empty());
        assert!(prior.bb.alpha.iter().all(|a| a.is_finite() && *a > 0.0));
        assert!(prior.nich.sigmasq.iter().all(|s| *s > 0.0));
    }

    #[test]
    fn log_spacing_hits_both_endpoints() {
        let grid = log_spaced(0.1, 10.0, 5);
        assert!((grid[0] - 0.1).abs() < 1e-6);
        assert!((grid[4] - 10.0).abs() < 1e-4);
        assert!(grid.windows(2).all(|w| w[0] < w[1]));
    }
}
