use crate::config;
use crate::family::bernoulli;
use crate::family::discrete;
use crate::family::normal;
use crate::family::poisson;
use crate::family::prior::ProcessGrid;
use crate::family::process;
use crate::family::process::Process;
use crate::family::FeatureMixture;
use crate::family::PitmanYor;
use crate::model::product::FamilyKind;
use crate::model::CrossCat;
use crate::numeric::ln_gamma;
use crate::numeric::log_stirling1_row;
use crate::numeric::sample_dirichlet_safe;
use crate::numeric::sample_from_scores;
use crate::Error;
use crate::FeatureId;
use crate::KindId;
use crate::Result;
use crate::Rng;
use crate::Score;
use rand::RngCore;
use rand::SeedableRng;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;
use std::time::Duration;
use std::time::Instant;

/// grid-Gibbs resampling of every hyperparameter: the topology, each
/// kind's clustering, and each feature's shared. tasks are independent,
/// observe a consistent snapshot, and replace the hypers at the join.
pub struct HyperKernel {
    run: bool,
    parallel: bool,
    pub total_time: Duration,
}

/// one task's replacement, applied sequentially after the parallel scan
enum Update {
    Topology(PitmanYor),
    Clustering(KindId, PitmanYor),
    Bb(FeatureId, bernoulli::Shared),
    Dd(FeatureId, discrete::Shared),
    Dpd(FeatureId, process::Shared),
    Gp(FeatureId, poisson::Shared),
    Nich(FeatureId, normal::Shared),
}

impl HyperKernel {
    pub fn new(config: &config::Hyper) -> Self {
        Self {
            run: config.run,
            parallel: config.parallel,
            total_time: Duration::ZERO,
        }
    }

    pub fn try_run(&mut self, cross_cat: &mut CrossCat, rng: &mut Rng) -> Result<()> {
        if !self.run {
            return Ok(());
        }
        let started = Instant::now();
        validate_grids(cross_cat)?;

        let kind_count = cross_cat.kinds.len();
        let feature_count = cross_cat.feature_to_kind.len();
        let task_count = 1 + kind_count + feature_count;
        let seed = rng.next_u64();

        // every task reads this consistent snapshot; replacements land
        // sequentially at the join
        let snapshot: &CrossCat = cross_cat;
        let resample = |taskid: usize| -> Result<Update> {
            let mut rng = Rng::seed_from_u64(seed.wrapping_add(taskid as u64));
            if taskid == 0 {
                Ok(Update::Topology(infer_topology(snapshot, &mut rng)))
            } else if taskid < 1 + kind_count {
                let kindid = taskid - 1;
                Ok(Update::Clustering(
                    kindid,
                    infer_clustering(snapshot, kindid, &mut rng),
                ))
            } else {
                let featureid = taskid - 1 - kind_count;
                infer_feature(snapshot, featureid, &mut rng)
            }
        };
        let updates: Result<Vec<Update>> = if self.parallel {
            (0..task_count).into_par_iter().map(resample).collect()
        } else {
            (0..task_count).map(resample).collect()
        };

        for update in updates? {
            apply(cross_cat, update);
        }

        // shared parameters changed, so every tare cache is stale
        let seed = rng.next_u64();
        for (kindid, kind) in cross_cat.kinds.iter_mut().enumerate() {
            let mut rng = Rng::seed_from_u64(seed.wrapping_add(kindid as u64));
            kind.mixture.suspend_cache();
            kind.mixture.resume_cache(&kind.model, &mut rng);
        }
        self.total_time += started.elapsed();
        Ok(())
    }
}

fn validate_grids(cross_cat: &CrossCat) -> Result<()> {
    let prior = &cross_cat.hyper_prior;
    if prior.topology.is_empty() {
        return Err(Error::EmptyGrid("hyper_prior.topology"));
    }
    if prior.clustering.is_empty() {
        return Err(Error::EmptyGrid("hyper_prior.clustering"));
    }
    if prior.bb.alpha.is_empty() || prior.bb.beta.is_empty() {
        return Err(Error::EmptyGrid("hyper_prior.bb"));
    }
    if prior.dd.alpha.is_empty() {
        return Err(Error::EmptyGrid("hyper_prior.dd"));
    }
    if prior.dpd.alpha.is_empty() || prior.dpd.gamma.is_empty() {
        return Err(Error::EmptyGrid("hyper_prior.dpd"));
    }
    if prior.gp.alpha.is_empty() || prior.gp.inv_beta.is_empty() {
        return Err(Error::EmptyGrid("hyper_prior.gp"));
    }
    if prior.nich.mu.is_empty()
        || prior.nich.kappa.is_empty()
        || prior.nich.sigmasq.is_empty()
        || prior.nich.nu.is_empty()
    {
        return Err(Error::EmptyGrid("hyper_prior.nich"));
    }
    Ok(())
}

/// resample the outer clustering against the features-per-kind histogram
fn infer_topology(cross_cat: &CrossCat, rng: &mut Rng) -> PitmanYor {
    let counts: Vec<u32> = cross_cat
        .kinds
        .iter()
        .map(|kind| kind.features.len() as u32)
        .collect();
    sample_clustering_posterior(&cross_cat.hyper_prior.topology, &counts, rng)
}

fn infer_clustering(cross_cat: &CrossCat, kindid: KindId, rng: &mut Rng) -> PitmanYor {
    let counts = cross_cat.kinds[kindid].mixture.clustering.counts();
    sample_clustering_posterior(&cross_cat.hyper_prior.clustering, counts, rng)
}

pub fn sample_clustering_posterior(
    grid: &[PitmanYor],
    counts: &[u32],
    rng: &mut Rng,
) -> PitmanYor {
    if grid.len() == 1 {
        return grid[0];
    }
    let mut scores: Vec<Score> = grid.iter().map(|shared| shared.score_counts(counts)).collect();
    grid[sample_from_scores(rng, &mut scores)]
}

fn infer_feature(cross_cat: &CrossCat, featureid: FeatureId, rng: &mut Rng) -> Result<Update> {
    let kindid = cross_cat.feature_to_kind[featureid] as usize;
    let kind = &cross_cat.kinds[kindid];
    let prior = &cross_cat.hyper_prior;
    let family = kind
        .model
        .family_of(featureid)
        .ok_or(Error::UnknownFeature(featureid))?;
    match family {
        FamilyKind::Bb => {
            let pos = kind.model.bb.position(featureid).expect("aligned tables");
            let hypotheses: Vec<bernoulli::Shared> = prior
                .bb
                .alpha
                .iter()
                .flat_map(|alpha| {
                    prior.bb.beta.iter().map(move |beta| bernoulli::Shared {
                        alpha: *alpha,
                        beta: *beta,
                    })
                })
                .collect();
            let mut scores = vec![];
            kind.mixture.bb.get(pos).score_data_grid(&hypotheses, &mut scores, rng);
            let choice = sample_from_scores(rng, &mut scores);
            Ok(Update::Bb(featureid, hypotheses[choice]))
        }
        FamilyKind::D16 => {
            let pos = kind.model.d16.position(featureid).expect("aligned tables");
            let shared = kind.model.d16.get(pos);
            let feature = kind.mixture.d16.get(pos);
            Ok(Update::Dd(
                featureid,
                infer_discrete_hypers(shared.dim(), feature, &prior.dd.alpha, rng),
            ))
        }
        FamilyKind::D256 => {
            let pos = kind.model.d256.position(featureid).expect("aligned tables");
            let shared = kind.model.d256.get(pos);
            let feature = kind.mixture.d256.get(pos);
            Ok(Update::Dd(
                featureid,
                infer_discrete_hypers(shared.dim(), feature, &prior.dd.alpha, rng),
            ))
        }
        FamilyKind::Dpd => {
            let pos = kind.model.dpd.position(featureid).expect("aligned tables");
            let shared = kind.model.dpd.get(pos);
            let feature = kind.mixture.dpd.get(pos);
            Ok(Update::Dpd(
                featureid,
                infer_process_hypers(shared, feature, &prior.dpd, rng),
            ))
        }
        FamilyKind::Gp => {
            let pos = kind.model.gp.position(featureid).expect("aligned tables");
            let hypotheses: Vec<poisson::Shared> = prior
                .gp
                .alpha
                .iter()
                .flat_map(|alpha| {
                    prior.gp.inv_beta.iter().map(move |inv_beta| poisson::Shared {
                        alpha: *alpha,
                        inv_beta: *inv_beta,
                    })
                })
                .collect();
            let mut scores = vec![];
            kind.mixture.gp.get(pos).score_data_grid(&hypotheses, &mut scores, rng);
            let choice = sample_from_scores(rng, &mut scores);
            Ok(Update::Gp(featureid, hypotheses[choice]))
        }
        FamilyKind::Nich => {
            let pos = kind.model.nich.position(featureid).expect("aligned tables");
            let grid = &prior.nich;
            let mut hypotheses = Vec::with_capacity(
                grid.mu.len() * grid.kappa.len() * grid.sigmasq.len() * grid.nu.len(),
            );
            for mu in grid.mu.iter() {
                for kappa in grid.kappa.iter() {
                    for sigmasq in grid.sigmasq.iter() {
                        for nu in grid.nu.iter() {
                            hypotheses.push(normal::Shared {
                                mu: *mu,
                                kappa: *kappa,
                                sigmasq: *sigmasq,
                                nu: *nu,
                            });
                        }
                    }
                }
            }
            let mut scores = vec![];
            kind.mixture.nich.get(pos).score_data_grid(&hypotheses, &mut scores, rng);
            let choice = sample_from_scores(rng, &mut scores);
            Ok(Update::Nich(featureid, hypotheses[choice]))
        }
    }
}

/// symmetric-alpha grid Gibbs shared by the two discrete widths
fn infer_discrete_hypers<F>(
    dim: usize,
    feature: &FeatureMixture<F>,
    alpha_grid: &[f32],
    rng: &mut Rng,
) -> discrete::Shared
where
    F: crate::family::Family<Shared = discrete::Shared>,
{
    let hypotheses: Vec<discrete::Shared> = alpha_grid
        .iter()
        .map(|alpha| discrete::Shared {
            alphas: vec![*alpha; dim],
        })
        .collect();
    let mut scores = vec![];
    feature.score_data_grid(&hypotheses, &mut scores, rng);
    let choice = sample_from_scores(rng, &mut scores);
    hypotheses.into_iter().nth(choice).expect("grid choice")
}

/// the DPD protocol: sample auxiliary table counts with log-Stirling
/// numbers, resample gamma given them, resample the betas through a safe
/// Dirichlet, then grid-Gibbs alpha. hypers only move once every value
/// in the shared measure has been observed.
fn infer_process_hypers(
    shared: &process::Shared,
    feature: &FeatureMixture<Process>,
    grid: &ProcessGrid,
    rng: &mut Rng,
) -> process::Shared {
    let mut shared = shared.clone();
    let mut scores: Vec<Score> = vec![];

    let mut aux: std::collections::BTreeMap<u32, u32> = std::collections::BTreeMap::new();
    for group in feature.groups.iter() {
        for (value, count) in group.counts.iter() {
            let beta = shared.beta(*value);
            if beta <= 0.0 || *count == 0 {
                continue;
            }
            let log_prior = (shared.alpha * beta).ln();
            log_stirling1_row(*count, &mut scores);
            for (k, score) in scores.iter_mut().enumerate() {
                *score += k as f32 * log_prior;
            }
            let aux_count = sample_from_scores(rng, &mut scores) as u32;
            debug_assert!(aux_count > 0);
            *aux.entry(*value).or_insert(0) += aux_count;
        }
    }

    if aux.len() != shared.betas.len() || aux.is_empty() {
        return shared;
    }

    // grid gibbs gamma | aux
    let aux_total: u32 = aux.values().sum();
    scores.clear();
    for gamma in grid.gamma.iter() {
        let gamma = *gamma as f64;
        let score = aux.len() as f64 * gamma.ln() + ln_gamma(gamma)
            - ln_gamma(gamma + aux_total as f64);
        scores.push(score as Score);
    }
    shared.gamma = grid.gamma[sample_from_scores(rng, &mut scores)];

    // betas, beta0 | aux, gamma
    let values: Vec<u32> = aux.keys().copied().collect();
    let mut weights: Vec<f32> = aux.values().map(|count| *count as f32).collect();
    weights.push(shared.gamma);
    sample_dirichlet_safe(rng, &mut weights, process::MIN_BETA);
    for (value, weight) in values.iter().zip(weights.iter()) {
        shared.betas.insert(*value, *weight);
    }
    shared.beta0 = *weights.last().expect("gamma weight");

    // grid gibbs alpha | betas, gamma
    let hypotheses: Vec<process::Shared> = grid
        .alpha
        .iter()
        .map(|alpha| {
            let mut hypothesis = shared.clone();
            hypothesis.alpha = *alpha;
            hypothesis
        })
        .collect();
    feature.score_data_grid(&hypotheses, &mut scores, rng);
    let choice = sample_from_scores(rng, &mut scores);
    hypotheses.into_iter().nth(choice).expect("grid choice")
}

fn apply(cross_cat: &mut CrossCat, update: Update) {
    match update {
        Update::Topology(topology) => cross_cat.topology = topology,
        Update::Clustering(kindid, clustering) => {
            cross_cat.kinds[kindid].model.clustering = clustering;
        }
        Update::Bb(featureid, shared) => {
            let kindid = cross_cat.feature_to_kind[featureid] as usize;
            let model = &mut cross_cat.kinds[kindid].model;
            *model.bb.find_mut(featureid).expect("feature is here") = shared;
        }
        Update::Dd(featureid, shared) => {
            let kindid = cross_cat.feature_to_kind[featureid] as usize;
            let model = &mut cross_cat.kinds[kindid].model;
            if let Some(existing) = model.d16.find_mut(featureid) {
                *existing = shared;
            } else {
                *model.d256.find_mut(featureid).expect("feature is here") = shared;
            }
        }
        Update::Dpd(featureid, shared) => {
            let kindid = cross_cat.feature_to_kind[featureid] as usize;
            let model = &mut cross_cat.kinds[kindid].model;
            *model.dpd.find_mut(featureid).expect("feature is here") = shared;
        }
        Update::Gp(featureid, shared) => {
            let kindid = cross_cat.feature_to_kind[featureid] as usize;
            let model = &mut cross_cat.kinds[kindid].model;
            *model.gp.find_mut(featureid).expect("feature is here") = shared;
        }
        Update::Nich(featureid, shared) => {
            let kindid = cross_cat.feature_to_kind[featureid] as usize;
            let model = &mut cross_cat.kinds[kindid].model;
            *model.nich.find_mut(featureid).expect("feature is here") = shared;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::Family;
    use crate::family::HyperPrior;
    use crate::model::assemble;
    use crate::model::ProductModel;
    use crate::value::Observed;
    use crate::value::ProductValue;

    fn mixed_cross_cat() -> (CrossCat, Rng) {
        let mut model = ProductModel::default();
        model.bb.insert(0, bernoulli::Shared::default());
        model.gp.insert(1, poisson::Shared::default());
        model.nich.insert(2, normal::Shared::default());
        model.update_schema();
        let mut cross_cat = assemble(
            PitmanYor { alpha: 1.0, d: 0.0 },
            HyperPrior::default(),
            vec![],
            vec![model],
        );
        let mut rng = Rng::seed_from_u64(0);
        cross_cat.mixture_init_unobserved(1, &mut rng);
        (cross_cat, rng)
    }

    fn feed_rows(cross_cat: &mut CrossCat, rng: &mut Rng, rows: usize) {
        for i in 0..rows {
            let value = ProductValue {
                observed: Observed::All,
                booleans: vec![i % 3 == 0],
                counts: vec![(i % 5) as u32],
                reals: vec![i as f32 * 0.25],
            };
            let kind = &mut cross_cat.kinds[0];
            kind.mixture.add_value(&kind.model, 0, &value, rng);
        }
    }

    #[test]
    fn resampling_replaces_hypers_from_the_grids() {
        let (mut cross_cat, mut rng) = mixed_cross_cat();
        feed_rows(&mut cross_cat, &mut rng, 20);
        let mut kernel = HyperKernel::new(&config::Hyper {
            run: true,
            parallel: false,
        });
        kernel.try_run(&mut cross_cat, &mut rng).unwrap();
        let grid = &cross_cat.hyper_prior;
        let bb = cross_cat.kinds[0].model.bb.get(0);
        assert!(grid.bb.alpha.contains(&bb.alpha));
        assert!(grid.bb.beta.contains(&bb.beta));
        let gp = cross_cat.kinds[0].model.gp.get(0);
        assert!(grid.gp.alpha.contains(&gp.alpha));
        assert!(grid
            .topology
            .iter()
            .any(|shared| *shared == cross_cat.topology));
        cross_cat.validate();
    }

    #[test]
    fn disabled_kernel_changes_nothing() {
        let (mut cross_cat, mut rng) = mixed_cross_cat();
        feed_rows(&mut cross_cat, &mut rng, 5);
        let before = cross_cat.clone();
        let mut kernel = HyperKernel::new(&config::Hyper {
            run: false,
            parallel: false,
        });
        kernel.try_run(&mut cross_cat, &mut rng).unwrap();
        assert_eq!(cross_cat, before);
    }

    #[test]
    fn empty_grids_are_fatal() {
        let (mut cross_cat, mut rng) = mixed_cross_cat();
        cross_cat.hyper_prior.topology.clear();
        let mut kernel = HyperKernel::new(&config::Hyper {
            run: true,
            parallel: false,
        });
        assert!(matches!(
            kernel.try_run(&mut cross_cat, &mut rng),
            Err(Error::EmptyGrid("hyper_prior.topology"))
        ));
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let (mut sequential, mut rng) = mixed_cross_cat();
        feed_rows(&mut sequential, &mut rng, 12);
        let mut parallel = sequential.clone();

        let mut rng_a = Rng::seed_from_u64(99);
        let mut rng_b = Rng::seed_from_u64(99);
        HyperKernel::new(&config::Hyper { run: true, parallel: false })
            .try_run(&mut sequential, &mut rng_a)
            .unwrap();
        HyperKernel::new(&config::Hyper { run: true, parallel: true })
            .try_run(&mut parallel, &mut rng_b)
            .unwrap();
        assert_eq!(sequential.topology, parallel.topology);
        assert_eq!(sequential.kinds[0].model, parallel.kinds[0].model);
    }

    #[test]
    fn dpd_hypers_wait_for_full_observation() {
        let mut rng = Rng::seed_from_u64(0);
        let mut shared = process::Shared::default();
        // two values observed in the corpus, only one absorbed by groups
        Process::observe(&mut shared, 0, &mut rng);
        Process::observe(&mut shared, 1, &mut rng);
        let mut feature = FeatureMixture::<Process>::init_groups(&shared, 1, &mut rng);
        Process::add_value(&shared, &mut feature.groups[0], 0, &mut rng);
        let grid = HyperPrior::default().dpd;
        let resampled = infer_process_hypers(&shared, &feature, &grid, &mut rng);
        assert_eq!(resampled, shared, "partial observation leaves hypers fixed");
    }
}
