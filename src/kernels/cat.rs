use crate::assign::Assignments;
use crate::assign::Queue;
use crate::config;
use crate::model::CrossCat;
use crate::model::Kind;
use crate::numeric::sample_from_scores;
use crate::value::Diff;
use crate::value::ProductValue;
use crate::value::Row;
use crate::Error;
use crate::KindId;
use crate::Result;
use crate::Rng;
use crate::Score;
use rand::SeedableRng;
use std::time::Duration;
use std::time::Instant;

/// derive the rng for one kind's mutation of one row. sequential and
/// pipelined execution both use this, so runs from the same seed are
/// bit-identical regardless of threading.
pub fn kind_rng(row_seed: u64, kindid: KindId) -> Rng {
    Rng::seed_from_u64(row_seed.wrapping_add(kindid as u64))
}

/// given a row, samples one group per kind, applies the add against the
/// mixture, and records the assignment
pub struct CatKernel {
    partials: Vec<Diff>,
    temp: Vec<ProductValue>,
    scores: Vec<Score>,
    total_time: Duration,
}

impl CatKernel {
    pub fn new(config: &config::Cat) -> Result<Self> {
        if config.empty_group_count == 0 {
            return Err(Error::Config("kernels.cat.empty_group_count must be > 0".into()));
        }
        Ok(Self {
            partials: vec![],
            temp: vec![],
            scores: vec![],
            total_time: Duration::ZERO,
        })
    }

    pub fn add_row(
        &mut self,
        cross_cat: &mut CrossCat,
        assignments: &mut Assignments,
        row: &Row,
        row_seed: u64,
    ) -> Result<()> {
        let started = Instant::now();
        cross_cat.diff_split(&row.diff, &mut self.partials, &mut self.temp);
        let (rowids, groupids) = assignments.split_mut();
        if !rowids.try_push(row.id) {
            return Err(Error::DuplicateRow(row.id));
        }
        for (kindid, (kind, queue)) in cross_cat
            .kinds
            .iter_mut()
            .zip(groupids.iter_mut())
            .enumerate()
        {
            let mut rng = kind_rng(row_seed, kindid);
            process_add(kind, queue, &self.partials[kindid], &mut self.scores, &mut rng);
        }
        self.total_time += started.elapsed();
        Ok(())
    }

    /// single-pass variant: returns the packed group ids instead of
    /// recording them in the assignment store
    pub fn add_row_out(
        &mut self,
        cross_cat: &mut CrossCat,
        row: &Row,
        row_seed: u64,
        groupids_out: &mut Vec<u32>,
    ) {
        let started = Instant::now();
        cross_cat.diff_split(&row.diff, &mut self.partials, &mut self.temp);
        groupids_out.clear();
        for (kindid, kind) in cross_cat.kinds.iter_mut().enumerate() {
            let mut rng = kind_rng(row_seed, kindid);
            let groupid = apply_add(kind, &self.partials[kindid], &mut self.scores, &mut rng);
            groupids_out.push(groupid as u32);
        }
        self.total_time += started.elapsed();
    }

    pub fn remove_row(
        &mut self,
        cross_cat: &mut CrossCat,
        assignments: &mut Assignments,
        row: &Row,
        row_seed: u64,
    ) -> Result<()> {
        let started = Instant::now();
        cross_cat.diff_split(&row.diff, &mut self.partials, &mut self.temp);
        let (rowids, groupids) = assignments.split_mut();
        let popped = rowids.pop()?;
        if popped != row.id {
            return Err(Error::RowIdMismatch {
                expected: row.id,
                popped,
            });
        }
        for (kindid, (kind, queue)) in cross_cat
            .kinds
            .iter_mut()
            .zip(groupids.iter_mut())
            .enumerate()
        {
            let mut rng = kind_rng(row_seed, kindid);
            process_remove(kind, queue, &self.partials[kindid], &mut rng)?;
        }
        self.total_time += started.elapsed();
        Ok(())
    }

    pub fn split_row(&mut self, cross_cat: &CrossCat, row: &Row, partials: &mut Vec<Diff>) {
        cross_cat.diff_split(&row.diff, partials, &mut self.temp);
    }

    pub fn take_total_time(&mut self) -> Duration {
        std::mem::take(&mut self.total_time)
    }
}

/// score, sample, and apply one kind's share of a row add; used by the
/// sequential kernel and by the pipeline's per-kind mutate threads
pub fn process_add(
    kind: &mut Kind,
    groupids: &mut Queue<u32>,
    partial: &Diff,
    scores: &mut Vec<Score>,
    rng: &mut Rng,
) {
    let groupid = apply_add(kind, partial, scores, rng);
    let global = kind.mixture.id_tracker.packed_to_global(groupid);
    groupids.push(global);
}

fn apply_add(kind: &mut Kind, partial: &Diff, scores: &mut Vec<Score>, rng: &mut Rng) -> usize {
    let Kind { model, mixture, .. } = kind;
    if partial.tares.is_empty() {
        model.add_value(&partial.pos, rng);
        mixture.score_value(model, &partial.pos, scores, rng);
        let groupid = sample_from_scores(rng, scores);
        mixture.add_value(model, groupid, &partial.pos, rng);
        groupid
    } else {
        model.add_diff(partial, rng);
        mixture.score_diff(model, partial, scores, rng);
        let groupid = sample_from_scores(rng, scores);
        mixture.add_diff(model, groupid, partial, rng);
        groupid
    }
}

/// pop this kind's assignment, translate global to packed, and undo the
/// row's contribution
pub fn process_remove(
    kind: &mut Kind,
    groupids: &mut Queue<u32>,
    partial: &Diff,
    rng: &mut Rng,
) -> Result<()> {
    let global = groupids.pop()?;
    let groupid = kind.mixture.id_tracker.global_to_packed(global);
    let Kind { model, mixture, .. } = kind;
    if partial.tares.is_empty() {
        mixture.remove_value(model, groupid, &partial.pos, rng);
        model.remove_value(&partial.pos, rng);
    } else {
        mixture.remove_diff(model, groupid, partial, rng);
        model.remove_diff(partial, rng);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::bernoulli;
    use crate::family::HyperPrior;
    use crate::family::PitmanYor;
    use crate::model::assemble;
    use crate::model::ProductModel;
    use crate::value::Observed;

    /// schema {1 boolean}, one tare [false], matching the trivial
    /// deterministic chain scenario
    fn boolean_cross_cat() -> (CrossCat, Assignments) {
        let mut model = ProductModel::default();
        model.bb.insert(0, bernoulli::Shared::default());
        model.update_schema();
        let tare = ProductValue {
            observed: Observed::All,
            booleans: vec![false],
            counts: vec![],
            reals: vec![],
        };
        // a tiny concentration pins every row to the first group
        let mut cross_cat = assemble(
            PitmanYor {
                alpha: 1e-6,
                d: 0.0,
            },
            HyperPrior::default(),
            vec![tare],
            vec![model],
        );
        let mut rng = Rng::seed_from_u64(0);
        cross_cat.mixture_init_unobserved(1, &mut rng);
        let mut assignments = Assignments::default();
        assignments.init(1);
        (cross_cat, assignments)
    }

    fn tare_row(id: u64) -> Row {
        Row {
            id,
            diff: Diff {
                pos: ProductValue::default(),
                neg: ProductValue::default(),
                tares: vec![0],
            },
        }
    }

    #[test]
    fn identical_rows_collapse_into_one_group() {
        let (mut cross_cat, mut assignments) = boolean_cross_cat();
        let mut kernel = CatKernel::new(&config::Cat::default()).unwrap();
        for id in 0..5 {
            kernel
                .add_row(&mut cross_cat, &mut assignments, &tare_row(id), id)
                .unwrap();
        }
        assert_eq!(assignments.row_count(), 5);
        // all five rows in the single group, one reserve behind it
        assert_eq!(
            cross_cat.kinds[0].mixture.clustering.counts(),
            &[5, 0],
            "five identical boolean rows and one reserve"
        );
        assert_eq!(cross_cat.kinds[0].mixture.bb.get(0).groups[0].tails, 5);
        cross_cat.validate();
        assignments.validate();
    }

    #[test]
    fn add_then_remove_restores_the_mixture() {
        let (mut cross_cat, mut assignments) = boolean_cross_cat();
        let mut kernel = CatKernel::new(&config::Cat::default()).unwrap();
        kernel
            .add_row(&mut cross_cat, &mut assignments, &tare_row(0), 0)
            .unwrap();
        let snapshot = cross_cat.kinds[0].clone();
        kernel
            .add_row(&mut cross_cat, &mut assignments, &tare_row(1), 1)
            .unwrap();
        kernel
            .remove_row(&mut cross_cat, &mut assignments, &tare_row(1), 1)
            .unwrap();
        assert_eq!(
            cross_cat.kinds[0].mixture.clustering,
            snapshot.mixture.clustering
        );
        assert_eq!(cross_cat.kinds[0].mixture.bb, snapshot.mixture.bb);
        assert_eq!(cross_cat.kinds[0].model, snapshot.model);
    }

    #[test]
    fn removing_all_rows_leaves_initial_state() {
        let (mut cross_cat, mut assignments) = boolean_cross_cat();
        let initial = cross_cat.kinds[0].clone();
        let mut kernel = CatKernel::new(&config::Cat::default()).unwrap();
        for id in 0..4 {
            kernel
                .add_row(&mut cross_cat, &mut assignments, &tare_row(id), id)
                .unwrap();
        }
        for id in 0..4 {
            kernel
                .remove_row(&mut cross_cat, &mut assignments, &tare_row(id), id)
                .unwrap();
        }
        assert_eq!(assignments.row_count(), 0);
        assert_eq!(cross_cat.kinds[0].mixture.clustering, initial.mixture.clustering);
        assert_eq!(cross_cat.kinds[0].mixture.bb, initial.mixture.bb);
    }

    #[test]
    fn mismatched_removal_order_is_fatal() {
        let (mut cross_cat, mut assignments) = boolean_cross_cat();
        let mut kernel = CatKernel::new(&config::Cat::default()).unwrap();
        kernel
            .add_row(&mut cross_cat, &mut assignments, &tare_row(0), 0)
            .unwrap();
        kernel
            .add_row(&mut cross_cat, &mut assignments, &tare_row(1), 1)
            .unwrap();
        assert!(matches!(
            kernel.remove_row(&mut cross_cat, &mut assignments, &tare_row(1), 1),
            Err(Error::RowIdMismatch { expected: 1, popped: 0 })
        ));
    }
}
