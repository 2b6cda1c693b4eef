use super::block::BlockPitmanYor;
use crate::model::CacheMode;
use crate::model::CrossCat;
use crate::model::ProductMixture;
use crate::model::ProductModel;
use crate::numeric::scores_to_likelihoods;
use crate::value::Diff;
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

/// time spent in each phase of one proposal, for the batch log
#[derive(Debug, Clone, Copy, Default)]
pub struct ProposerTimers {
    pub tare: Duration,
    pub score: Duration,
    pub sample: Duration,
}

/// the shadow mixture: every feature held in every kind simultaneously,
/// so a feature's statistics under any kind's partition are on hand the
/// moment the block sampler decides to move it. one (model, mixture)
/// pair per kind, each model a clone holding all features, each mixture
/// in lazy tare mode. exact at batch boundaries: rows removed by the
/// annealer predate the last rebuild, so their pos/neg never landed
/// here, and the pending tare counts flush completes the rest.
#[derive(Debug, Default)]
pub struct KindProposer {
    pub models: Vec<ProductModel>,
    pub kinds: Vec<ProductMixture>,
}

impl KindProposer {
    pub fn clear(&mut self) {
        self.models.clear();
        self.kinds.clear();
    }

    pub fn kind_count(&self) -> usize {
        self.kinds.len()
    }

    fn combined_model(cross_cat: &CrossCat) -> ProductModel {
        let mut model = ProductModel::default();
        for kind in cross_cat.kinds.iter() {
            model.extend(&kind.model);
        }
        model.tares = cross_cat.tares.clone();
        debug_assert_eq!(model.schema, cross_cat.schema);
        model
    }

    /// rebuild the shadow from the primary mixtures' clustering counts,
    /// with fresh (unobserved) statistics
    pub fn mixture_init_unobserved(&mut self, cross_cat: &CrossCat, rng: &mut Rng) {
        debug_assert!(!cross_cat.kinds.is_empty());
        let model = Self::combined_model(cross_cat);
        self.kinds = cross_cat
            .kinds
            .iter()
            .map(|kind| {
                let mut mixture = ProductMixture::new(CacheMode::Lazy);
                mixture.init_unobserved(
                    &model,
                    kind.mixture.clustering.counts(),
                    true,
                    rng,
                );
                mixture
            })
            .collect();
        self.models = vec![model; cross_cat.kinds.len()];
    }

    /// mirror a row add into one kind of the shadow, at the group the
    /// primary kind sampled
    pub fn add_row(&mut self, kindid: KindId, groupid: usize, diff: &Diff, rng: &mut Rng) {
        let model = &mut self.models[kindid];
        if diff.tares.is_empty() {
            model.add_value(&diff.pos, rng);
        } else {
            model.add_diff(diff, rng);
        }
        self.kinds[kindid].add_diff_deferred(model, groupid, diff, rng);
    }

    /// removal touches only the clustering count; the removed row's
    /// statistics were never absorbed here
    pub fn remove_row(&mut self, kindid: KindId, groupid: usize) {
        self.kinds[kindid].remove_unobserved_value(&self.models[kindid], groupid);
    }

    /// per-kind slices for the pipeline's mutate stage
    pub fn split_mut(
        &mut self,
    ) -> impl Iterator<Item = (&mut ProductModel, &mut ProductMixture)> {
        self.models.iter_mut().zip(self.kinds.iter_mut())
    }

    pub fn count_rows(&self) -> usize {
        self.kinds
            .first()
            .map(|mixture| mixture.count_rows())
            .unwrap_or(0)
    }

    /// flush pending tares, score every feature under every kind, and
    /// run the block sampler over the feature-to-kind map
    pub fn infer_assignments(
        &mut self,
        cross_cat: &CrossCat,
        feature_to_kind: &mut [u32],
        iterations: usize,
        parallel: bool,
        rng: &mut Rng,
    ) -> Result<ProposerTimers> {
        let mut timers = ProposerTimers::default();

        let started = Instant::now();
        for (model, mixture) in self.models.iter().zip(self.kinds.iter_mut()) {
            mixture.flush_tares(model, rng);
        }
        timers.tare = started.elapsed();

        let started = Instant::now();
        let seed = rng.next_u64();
        let feature_count = feature_to_kind.len();
        let kind_count = self.kinds.len();
        let kinds = &self.kinds;
        let models = &self.models;
        let score_feature = |featureid: FeatureId| -> Vec<Score> {
            let mut rng = Rng::seed_from_u64(seed.wrapping_add(featureid as u64));
            let mut scores: Vec<Score> = (0..kind_count)
                .map(|kindid| kinds[kindid].score_feature(&models[kindid], featureid, &mut rng))
                .collect();
            scores_to_likelihoods(&mut scores);
            scores
        };
        let likelihoods: Vec<Vec<Score>> = if parallel {
            (0..feature_count)
                .into_par_iter()
                .map(score_feature)
                .collect()
        } else {
            (0..feature_count).map(score_feature).collect()
        };
        timers.score = started.elapsed();

        let started = Instant::now();
        let mut sampler = BlockPitmanYor::new(&cross_cat.topology, &likelihoods, feature_to_kind)?;
        sampler.run(iterations, rng);
        timers.sample = started.elapsed();

        Ok(timers)
    }
}
