use super::cat;
use super::proposer::KindProposer;
use crate::assign::Assignments;
use crate::assign::Queue;
use crate::config;
use crate::model::CrossCat;
use crate::model::Kind;
use crate::value::Diff;
use crate::value::ProductValue;
use crate::value::Row;
use crate::Error;
use crate::FeatureId;
use crate::KindId;
use crate::Result;
use crate::Rng;
use crate::Score;
use rand::Rng as _;
use rand::RngCore;
use rand::SeedableRng;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::time::Duration;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default)]
pub struct KindMetrics {
    pub total_count: usize,
    pub change_count: usize,
    pub birth_count: usize,
    pub death_count: usize,
    pub tare_time: Duration,
    pub score_time: Duration,
    pub sample_time: Duration,
    pub total_time: Duration,
}

/// periodically reassigns features to kinds: feeds rows through both the
/// primary mixtures and the shadow proposer, then at batch boundaries
/// scores every feature under every kind and runs the block sampler
pub struct KindKernel {
    empty_group_count: usize,
    empty_kind_count: usize,
    iterations: usize,
    score_parallel: bool,
    pub proposer: KindProposer,
    pub metrics: KindMetrics,
    partials: Vec<Diff>,
    temp: Vec<ProductValue>,
    scores: Vec<Score>,
}

impl KindKernel {
    pub fn new(
        config: &config::Kernels,
        cross_cat: &mut CrossCat,
        assignments: &mut Assignments,
        rng: &mut Rng,
    ) -> Result<Self> {
        if config.kind.empty_kind_count == 0 {
            return Err(Error::Config("kernels.kind.empty_kind_count must be > 0".into()));
        }
        let mut kernel = Self {
            empty_group_count: config.cat.empty_group_count as usize,
            empty_kind_count: config.kind.empty_kind_count as usize,
            iterations: config.kind.iterations as usize,
            score_parallel: config.kind.score_parallel,
            proposer: KindProposer::default(),
            metrics: KindMetrics::default(),
            partials: vec![],
            temp: vec![],
            scores: vec![],
        };
        let started = Instant::now();
        debug_assert_eq!(assignments.row_count(), cross_cat.count_rows());
        kernel.init_featureless_kinds(
            cross_cat,
            assignments,
            kernel.empty_kind_count,
            true,
            rng,
        )?;
        kernel.proposer.mixture_init_unobserved(cross_cat, rng);
        cross_cat.validate();
        kernel.metrics.total_time += started.elapsed();
        Ok(kernel)
    }

    /// hand off to the category loop: drop the reserve kinds and the
    /// shadow mixtures
    pub fn teardown(
        &mut self,
        cross_cat: &mut CrossCat,
        assignments: &mut Assignments,
        rng: &mut Rng,
    ) -> Result<()> {
        self.proposer.clear();
        self.init_featureless_kinds(cross_cat, assignments, 0, true, rng)?;
        cross_cat.validate();
        Ok(())
    }

    //------------------------------------------------------------------
    // row mutation

    pub fn add_row(
        &mut self,
        cross_cat: &mut CrossCat,
        assignments: &mut Assignments,
        row: &Row,
        row_seed: u64,
    ) -> Result<()> {
        debug_assert_eq!(cross_cat.kinds.len(), self.proposer.kind_count());
        cross_cat.diff_split(&row.diff, &mut self.partials, &mut self.temp);
        let (rowids, groupids) = assignments.split_mut();
        if !rowids.try_push(row.id) {
            return Err(Error::DuplicateRow(row.id));
        }
        for (kindid, ((kind, queue), (proposer_model, proposer_mixture))) in cross_cat
            .kinds
            .iter_mut()
            .zip(groupids.iter_mut())
            .zip(self.proposer.split_mut())
            .enumerate()
        {
            let mut rng = cat::kind_rng(row_seed, kindid);
            process_add(
                kind,
                queue,
                proposer_model,
                proposer_mixture,
                &self.partials[kindid],
                &row.diff,
                &mut self.scores,
                &mut rng,
            );
        }
        Ok(())
    }

    pub fn remove_row(
        &mut self,
        cross_cat: &mut CrossCat,
        assignments: &mut Assignments,
        row: &Row,
        row_seed: u64,
    ) -> Result<()> {
        debug_assert_eq!(cross_cat.kinds.len(), self.proposer.kind_count());
        cross_cat.diff_split(&row.diff, &mut self.partials, &mut self.temp);
        let (rowids, groupids) = assignments.split_mut();
        let popped = rowids.pop()?;
        if popped != row.id {
            return Err(Error::RowIdMismatch {
                expected: row.id,
                popped,
            });
        }
        for (kindid, ((kind, queue), (proposer_model, proposer_mixture))) in cross_cat
            .kinds
            .iter_mut()
            .zip(groupids.iter_mut())
            .zip(self.proposer.split_mut())
            .enumerate()
        {
            let mut rng = cat::kind_rng(row_seed, kindid);
            process_remove(
                kind,
                queue,
                proposer_model,
                proposer_mixture,
                &self.partials[kindid],
                &mut rng,
            )?;
        }
        Ok(())
    }

    pub fn split_row(&mut self, cross_cat: &CrossCat, row: &Row, partials: &mut Vec<Diff>) {
        cross_cat.diff_split(&row.diff, partials, &mut self.temp);
    }

    //------------------------------------------------------------------
    // the sweep

    /// returns whether any feature moved
    pub fn try_run(
        &mut self,
        cross_cat: &mut CrossCat,
        assignments: &mut Assignments,
        rng: &mut Rng,
    ) -> Result<bool> {
        if self.iterations == 0 {
            return Ok(false);
        }
        let started = Instant::now();
        debug_assert_eq!(assignments.row_count(), cross_cat.count_rows());
        debug_assert_eq!(cross_cat.count_rows(), self.proposer.count_rows());
        cross_cat.validate();

        let old = cross_cat.feature_to_kind.clone();
        let mut new = old.clone();
        let timers = self.proposer.infer_assignments(
            cross_cat,
            &mut new,
            self.iterations,
            self.score_parallel,
            rng,
        )?;
        self.metrics.tare_time += timers.tare;
        self.metrics.score_time += timers.score;
        self.metrics.sample_time += timers.sample;

        for kind in cross_cat.kinds.iter_mut() {
            kind.mixture.suspend_cache();
        }
        for mixture in self.proposer.kinds.iter_mut() {
            mixture.suspend_cache();
        }
        let change_count = self.move_features(cross_cat, &old, &new);
        self.init_featureless_kinds(cross_cat, assignments, self.empty_kind_count, false, rng)?;

        // caches rebuild for every kind, then the shadow rebuilds
        let seed = rng.next_u64();
        if self.score_parallel {
            cross_cat
                .kinds
                .par_iter_mut()
                .enumerate()
                .for_each(|(kindid, kind)| {
                    let mut rng = Rng::seed_from_u64(seed.wrapping_add(kindid as u64));
                    kind.mixture.resume_cache(&kind.model, &mut rng);
                });
        } else {
            for (kindid, kind) in cross_cat.kinds.iter_mut().enumerate() {
                let mut rng = Rng::seed_from_u64(seed.wrapping_add(kindid as u64));
                kind.mixture.resume_cache(&kind.model, &mut rng);
            }
        }
        self.proposer.mixture_init_unobserved(cross_cat, rng);

        cross_cat.validate();
        assignments.validate();
        self.metrics.total_time += started.elapsed();
        Ok(change_count > 0)
    }

    fn move_features(&mut self, cross_cat: &mut CrossCat, old: &[u32], new: &[u32]) -> usize {
        let mut change_count = 0;
        for featureid in 0..old.len() {
            if new[featureid] != old[featureid] {
                self.move_feature_to_kind(cross_cat, featureid, new[featureid] as usize);
                change_count += 1;
            }
        }
        self.metrics.total_count = old.len();
        self.metrics.change_count = change_count;

        // a kind dies when it loses every feature, births when it gains
        // its first
        let kind_count = cross_cat.kinds.len();
        let mut states = vec![0u8; kind_count];
        for kindid in old.iter() {
            states[*kindid as usize] |= 1;
        }
        for kindid in new.iter() {
            states[*kindid as usize] |= 2;
        }
        self.metrics.death_count = states.iter().filter(|s| **s == 1).count();
        self.metrics.birth_count = states.iter().filter(|s| **s == 2).count();
        change_count
    }

    fn move_feature_to_kind(
        &mut self,
        cross_cat: &mut CrossCat,
        featureid: FeatureId,
        new_kindid: KindId,
    ) {
        let old_kindid = cross_cat.feature_to_kind[featureid] as usize;
        debug_assert_ne!(old_kindid, new_kindid);
        let [old_kind, new_kind] = cross_cat
            .kinds
            .get_disjoint_mut([old_kindid, new_kindid])
            .expect("moves are between distinct kinds");
        self.proposer.kinds[new_kindid].move_feature_to(
            featureid,
            &mut old_kind.model,
            &mut old_kind.mixture,
            &mut new_kind.model,
            &mut new_kind.mixture,
        );
        old_kind.features.remove(&featureid);
        new_kind.features.insert(featureid);
        cross_cat.feature_to_kind[featureid] = new_kindid as u32;
    }

    //------------------------------------------------------------------
    // kind lifecycle

    fn init_featureless_kinds(
        &mut self,
        cross_cat: &mut CrossCat,
        assignments: &mut Assignments,
        reserve_count: usize,
        maintaining: bool,
        rng: &mut Rng,
    ) -> Result<()> {
        for kindid in (0..cross_cat.kinds.len()).rev() {
            if cross_cat.kinds[kindid].features.is_empty() {
                remove_featureless_kind(cross_cat, assignments, kindid);
            }
        }
        for _ in 0..reserve_count {
            self.add_featureless_kind(cross_cat, assignments, maintaining, rng)?;
        }
        cross_cat.update_splitter();
        let mut temp = std::mem::take(&mut self.temp);
        cross_cat.update_tares(&mut temp);
        self.temp = temp;
        assignments.validate();
        Ok(())
    }

    /// a fresh kind gets clustering hyperparameters drawn from the grid
    /// prior and a row partition sampled from them, so it can compete
    /// for features on the next sweep
    fn add_featureless_kind(
        &mut self,
        cross_cat: &mut CrossCat,
        assignments: &mut Assignments,
        maintaining: bool,
        rng: &mut Rng,
    ) -> Result<()> {
        let grid = &cross_cat.hyper_prior.clustering;
        let clustering = if grid.is_empty() {
            cross_cat
                .kinds
                .first()
                .map(|kind| kind.model.clustering)
                .unwrap_or_default()
        } else {
            grid[rng.random_range(0..grid.len())]
        };
        clustering.validate()?;

        let row_count = assignments.row_count();
        let assignment_vector = clustering.sample_assignments(row_count, rng);
        let nonempty = assignment_vector.iter().max().map(|g| g + 1).unwrap_or(0);
        let mut counts = vec![0u32; nonempty + self.empty_group_count];
        let queue = assignments.packed_add_kind();
        for groupid in assignment_vector {
            // fresh tracker: global ids coincide with packed ids
            queue.push(groupid as u32);
            counts[groupid] += 1;
        }
        let mut kind = Kind::default();
        kind.model.clustering = clustering;
        kind.mixture
            .init_unobserved(&kind.model, &counts, maintaining, rng);
        cross_cat.kinds.push(kind);
        Ok(())
    }
}

fn remove_featureless_kind(
    cross_cat: &mut CrossCat,
    assignments: &mut Assignments,
    kindid: KindId,
) {
    debug_assert!(cross_cat.kinds[kindid].features.is_empty());
    cross_cat.kinds.swap_remove(kindid);
    assignments.packed_remove_kind(kindid);
    // the former tail kind now sits at kindid
    if kindid < cross_cat.kinds.len() {
        for featureid in cross_cat.kinds[kindid].features.iter() {
            cross_cat.feature_to_kind[*featureid] = kindid as u32;
        }
    }
}

/// one kind's share of a pipelined row add: mutate the primary kind,
/// then mirror into the shadow at the sampled group
pub fn process_add(
    kind: &mut Kind,
    groupids: &mut Queue<u32>,
    proposer_model: &mut crate::model::ProductModel,
    proposer_mixture: &mut crate::model::ProductMixture,
    partial: &Diff,
    full: &Diff,
    scores: &mut Vec<Score>,
    rng: &mut Rng,
) {
    cat::process_add(kind, groupids, partial, scores, rng);
    let global = *groupids.back().expect("just pushed");
    let groupid = kind.mixture.id_tracker.global_to_packed(global);
    if full.tares.is_empty() {
        proposer_model.add_value(&full.pos, rng);
    } else {
        proposer_model.add_diff(full, rng);
    }
    proposer_mixture.add_diff_deferred(proposer_model, groupid, full, rng);
}

pub fn process_remove(
    kind: &mut Kind,
    groupids: &mut Queue<u32>,
    proposer_model: &mut crate::model::ProductModel,
    proposer_mixture: &mut crate::model::ProductMixture,
    partial: &Diff,
    rng: &mut Rng,
) -> Result<()> {
    let global = *groupids.front().ok_or(Error::EmptyPop)?;
    let groupid = kind.mixture.id_tracker.global_to_packed(global);
    cat::process_remove(kind, groupids, partial, rng)?;
    proposer_mixture.remove_unobserved_value(proposer_model, groupid);
    Ok(())
}
