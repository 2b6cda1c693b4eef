use crate::assign::Assignments;
use crate::assign::Queue;
use crate::config::Config;
use crate::kernels::cat;
use crate::kernels::kind;
use crate::kernels::CatKernel;
use crate::kernels::HyperKernel;
use crate::kernels::KindKernel;
use crate::logger::CatStatus;
use crate::logger::HyperStatus;
use crate::logger::KindStatus;
use crate::logger::LogMessage;
use crate::logger::Logger;
use crate::logger::Rusage;
use crate::logger::Scores;
use crate::logger::Summary;
use crate::model::CrossCat;
use crate::model::Kind;
use crate::model::ProductMixture;
use crate::model::ProductModel;
use crate::pipeline::consume_loop;
use crate::pipeline::consume_shared_loop;
use crate::pipeline::Pipeline;
use crate::schedule::Schedule;
use crate::stream::codec;
use crate::stream::codec::Checkpoint;
use crate::stream::RecordReader;
use crate::stream::RecordWriter;
use crate::stream::StreamInterval;
use crate::value::differ::Differ;
use crate::value::Diff;
use crate::value::Observed;
use crate::value::ProductValue;
use crate::value::Row;
use crate::Error;
use crate::Result;
use crate::Rng;
use rand::Rng as _;
use rand::RngCore;
use rand::SeedableRng;
use std::sync::Mutex;

/// why a pipelined batch segment stopped
enum Outcome {
    Target,
    Boundary,
}

/// the inference engine: one cross-cat state, its assignment store, and
/// the loops that drive them from a row stream
pub struct Engine {
    pub config: Config,
    pub cross_cat: CrossCat,
    pub assignments: Assignments,
    pub logger: Logger,
}

impl Engine {
    pub fn load(
        config: Config,
        model_in: &str,
        groups_in: Option<&str>,
        assign_in: Option<&str>,
        tares_in: Option<&str>,
        rng: &mut Rng,
    ) -> Result<Self> {
        config.validate()?;
        let mut cross_cat = codec::load_model(model_in)?;
        if cross_cat.kinds.is_empty() {
            return Err(Error::SchemaMismatch("model has no kinds".to_string()));
        }
        if let Some(path) = tares_in {
            let tares = crate::stream::files::read_stream(path, |bytes| {
                let mut decoder = codec::Decoder::new(bytes);
                codec::get_value(&mut decoder)
            })?;
            for tare in tares.iter() {
                cross_cat.schema.validate_value(tare).map_err(|_| {
                    Error::SchemaMismatch("tare disagrees with the model schema".to_string())
                })?;
            }
            cross_cat.tares = tares;
            let mut temp = vec![];
            cross_cat.update_tares(&mut temp);
        }

        let empty_group_count = config.kernels.cat.empty_group_count as usize;
        match groups_in {
            Some(dirname) => {
                codec::load_mixtures(&mut cross_cat, dirname, empty_group_count, rng)?
            }
            None => cross_cat.mixture_init_unobserved(empty_group_count, rng),
        }

        let mut assignments = Assignments::default();
        assignments.init(cross_cat.kinds.len());
        if let Some(path) = assign_in {
            codec::load_assignments(&mut assignments, path)?;
            if assignments.row_count() > cross_cat.count_rows() {
                return Err(Error::SchemaMismatch(format!(
                    "{} assigned rows but the mixtures carry {}",
                    assignments.row_count(),
                    cross_cat.count_rows()
                )));
            }
        }

        cross_cat.validate();
        assignments.validate();
        Ok(Self {
            config,
            cross_cat,
            assignments,
            logger: Logger::noop(),
        })
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn dump(
        &self,
        model_out: Option<&str>,
        groups_out: Option<&str>,
        assign_out: Option<&str>,
    ) -> Result<()> {
        if let Some(path) = model_out {
            codec::dump_model(&self.cross_cat, path)?;
        }
        if groups_out.is_some() || assign_out.is_some() {
            let sorted = self.cross_cat.sorted_groupids();
            if let Some(dirname) = groups_out {
                codec::dump_mixtures(&self.cross_cat, dirname)?;
            }
            if let Some(path) = assign_out {
                crate::stream::files::create_parent_dirs(path)?;
                let mut writer = RecordWriter::create(path)?;
                codec::dump_assignments(&self.assignments, &sorted, &mut writer)?;
                writer.flush()?;
            }
        }
        Ok(())
    }

    fn build_differ(&self) -> Result<Differ> {
        match self.cross_cat.tares.first() {
            Some(tare) => Differ::with_tare(self.cross_cat.schema, tare.clone()),
            None => Ok(Differ::new(self.cross_cat.schema)),
        }
    }

    //------------------------------------------------------------------
    // single pass

    /// one greedy append-only pass over a row stream
    pub fn infer_single_pass(
        &mut self,
        rng: &mut Rng,
        rows_in: &str,
        assign_out: Option<&str>,
    ) -> Result<()> {
        let differ = self.build_differ()?;
        let mut reader = RecordReader::open(rows_in)?;
        let mut kernel = CatKernel::new(&self.config.kernels.cat)?;
        let mut buffer = vec![];
        match assign_out {
            Some(path) => {
                crate::stream::files::create_parent_dirs(path)?;
                let mut writer = RecordWriter::create(path)?;
                let mut groupids = vec![];
                let mut record = vec![];
                while reader.try_read(&mut buffer)? {
                    let mut row = codec::decode_row(&buffer)?;
                    differ.fill_in(&mut row)?;
                    kernel.add_row_out(&mut self.cross_cat, &row, rng.next_u64(), &mut groupids);
                    record.clear();
                    record.extend_from_slice(&row.id.to_le_bytes());
                    record.extend_from_slice(&(groupids.len() as u32).to_le_bytes());
                    for groupid in groupids.iter() {
                        record.extend_from_slice(&groupid.to_le_bytes());
                    }
                    writer.write_record(&record)?;
                }
                writer.flush()?;
            }
            None => {
                let mut groupids = vec![];
                while reader.try_read(&mut buffer)? {
                    let mut row = codec::decode_row(&buffer)?;
                    differ.fill_in(&mut row)?;
                    kernel.add_row_out(&mut self.cross_cat, &row, rng.next_u64(), &mut groupids);
                }
            }
        }
        Ok(())
    }

    /// single-pass update of a pretrained model on new rows, keeping the
    /// assignment store in sync so the state remains dumpable
    pub fn mix(&mut self, rng: &mut Rng, rows_in: &str) -> Result<()> {
        let differ = self.build_differ()?;
        let mut reader = RecordReader::open(rows_in)?;
        let mut kernel = CatKernel::new(&self.config.kernels.cat)?;
        let mut buffer = vec![];
        while reader.try_read(&mut buffer)? {
            let mut row = codec::decode_row(&buffer)?;
            differ.fill_in(&mut row)?;
            kernel.add_row(&mut self.cross_cat, &mut self.assignments, &row, rng.next_u64())?;
        }
        self.cross_cat.validate();
        self.assignments.validate();
        Ok(())
    }

    //------------------------------------------------------------------
    // multi pass

    /// streaming annealed inference. returns true when the whole corpus
    /// ended up assigned, false when a checkpoint boundary stopped the
    /// run early; the emitted checkpoint resumes it deterministically.
    pub fn infer_multi_pass(
        &mut self,
        rng: &mut Rng,
        rows_in: &str,
        checkpoint_in: Option<&str>,
        checkpoint_out: Option<&str>,
    ) -> Result<bool> {
        let mut rows = StreamInterval::open(rows_in)?;
        let mut schedule = Schedule::new(&self.config.schedule, self.assignments.row_count())?;
        schedule.annealing.set_extra_passes(
            schedule
                .accelerating
                .extra_passes(self.assignments.row_count()),
        );

        let mut checkpoint = match checkpoint_in {
            Some(path) => {
                let checkpoint = codec::read_checkpoint(path)?;
                *rng = Rng::seed_from_u64(checkpoint.seed);
                rows.seek(checkpoint.unassigned_pos, checkpoint.assigned_pos)?;
                schedule.restore(&checkpoint.schedule);
                Checkpoint {
                    tardis_iter: checkpoint.tardis_iter + 1,
                    ..checkpoint
                }
            }
            None => {
                let row_count = RecordReader::count_records(rows_in)? as u64;
                if self.assignments.row_count() > 0 {
                    rows.init_from_assignments(&self.assignments)?;
                }
                self.log_batch(0, None, None, None)?;
                Checkpoint {
                    row_count,
                    ..Default::default()
                }
            }
        };
        if self.assignments.row_count() as u64 >= checkpoint.row_count {
            return Err(Error::Config(format!(
                "{} rows already assigned out of {}",
                self.assignments.row_count(),
                checkpoint.row_count
            )));
        }

        checkpoint.finished = false;
        let kind_enabled =
            self.config.kernels.kind.iterations > 0 && schedule.disabling.test();
        let finished = if kind_enabled {
            let finished =
                self.infer_kind_structure(&mut rows, &mut checkpoint, &mut schedule, rng)?;
            if finished {
                true
            } else if schedule.checkpointing.test() {
                false
            } else {
                self.infer_cat_structure(&mut rows, &mut checkpoint, &mut schedule, rng)?
            }
        } else {
            self.infer_cat_structure(&mut rows, &mut checkpoint, &mut schedule, rng)?
        };
        checkpoint.finished = finished;

        if let Some(path) = checkpoint_out {
            checkpoint.seed = rng.next_u64();
            let (unassigned_pos, assigned_pos) = rows.positions();
            checkpoint.unassigned_pos = unassigned_pos;
            checkpoint.assigned_pos = assigned_pos;
            checkpoint.schedule = schedule.state();
            codec::write_checkpoint(path, &checkpoint)?;
        }
        Ok(finished)
    }

    fn infer_cat_structure(
        &mut self,
        rows: &mut StreamInterval,
        checkpoint: &mut Checkpoint,
        schedule: &mut Schedule,
        rng: &mut Rng,
    ) -> Result<bool> {
        if self.config.kernels.cat.row_queue_capacity > 0 {
            self.infer_cat_structure_parallel(rows, checkpoint, schedule, rng)
        } else {
            self.infer_cat_structure_sequential(rows, checkpoint, schedule, rng)
        }
    }

    fn infer_kind_structure(
        &mut self,
        rows: &mut StreamInterval,
        checkpoint: &mut Checkpoint,
        schedule: &mut Schedule,
        rng: &mut Rng,
    ) -> Result<bool> {
        if self.config.kernels.kind.row_queue_capacity > 0 {
            self.infer_kind_structure_parallel(rows, checkpoint, schedule, rng)
        } else {
            self.infer_kind_structure_sequential(rows, checkpoint, schedule, rng)
        }
    }

    fn infer_cat_structure_sequential(
        &mut self,
        rows: &mut StreamInterval,
        checkpoint: &mut Checkpoint,
        schedule: &mut Schedule,
        rng: &mut Rng,
    ) -> Result<bool> {
        let differ = self.build_differ()?;
        let mut cat_kernel = CatKernel::new(&self.config.kernels.cat)?;
        let mut hyper_kernel = HyperKernel::new(&self.config.kernels.hyper);
        let mut buffer = vec![];
        let target = checkpoint.row_count as usize;

        while self.assignments.row_count() != target {
            let add = schedule.annealing.next_action_is_add();
            let row_seed = rng.next_u64();
            if add {
                rows.read_unassigned(&mut buffer)?;
                let mut row = codec::decode_row(&buffer)?;
                differ.fill_in(&mut row)?;
                cat_kernel.add_row(&mut self.cross_cat, &mut self.assignments, &row, row_seed)?;
                schedule.batching.add();
            } else {
                rows.read_assigned(&mut buffer)?;
                let mut row = codec::decode_row(&buffer)?;
                differ.fill_in(&mut row)?;
                cat_kernel.remove_row(&mut self.cross_cat, &mut self.assignments, &row, row_seed)?;
                schedule.batching.remove();
            }

            if schedule.batching.test() {
                schedule.annealing.set_extra_passes(
                    schedule
                        .accelerating
                        .extra_passes(self.assignments.row_count()),
                );
                hyper_kernel.try_run(&mut self.cross_cat, rng)?;
                checkpoint.tardis_iter += 1;
                let cat_status = CatStatus {
                    total_time_sec: cat_kernel.take_total_time().as_secs_f64(),
                };
                let hyper_status = HyperStatus {
                    total_time_sec: std::mem::take(&mut hyper_kernel.total_time).as_secs_f64(),
                };
                self.log_batch(checkpoint.tardis_iter, Some(cat_status), None, Some(hyper_status))?;
                if schedule.checkpointing.test() {
                    return Ok(false);
                }
            }
        }
        checkpoint.tardis_iter += 1;
        let cat_status = CatStatus {
            total_time_sec: cat_kernel.take_total_time().as_secs_f64(),
        };
        self.log_batch(checkpoint.tardis_iter, Some(cat_status), None, None)?;
        Ok(true)
    }

    fn infer_cat_structure_parallel(
        &mut self,
        rows: &mut StreamInterval,
        checkpoint: &mut Checkpoint,
        schedule: &mut Schedule,
        rng: &mut Rng,
    ) -> Result<bool> {
        let differ = self.build_differ()?;
        let mut hyper_kernel = HyperKernel::new(&self.config.kernels.hyper);
        let target = checkpoint.row_count as usize;
        let mut row_count = self.assignments.row_count();

        loop {
            let outcome = run_cat_segment(
                self.config.kernels.cat.row_queue_capacity as usize,
                self.config.kernels.cat.parser_threads as usize,
                &mut self.cross_cat,
                &mut self.assignments,
                &differ,
                rows,
                schedule,
                rng,
                &mut row_count,
                target,
            )?;
            debug_assert_eq!(self.assignments.row_count(), row_count);
            match outcome {
                Outcome::Target => {
                    checkpoint.tardis_iter += 1;
                    self.log_batch(checkpoint.tardis_iter, None, None, None)?;
                    return Ok(true);
                }
                Outcome::Boundary => {
                    schedule
                        .annealing
                        .set_extra_passes(schedule.accelerating.extra_passes(row_count));
                    hyper_kernel.try_run(&mut self.cross_cat, rng)?;
                    checkpoint.tardis_iter += 1;
                    let hyper_status = HyperStatus {
                        total_time_sec: std::mem::take(&mut hyper_kernel.total_time)
                            .as_secs_f64(),
                    };
                    self.log_batch(checkpoint.tardis_iter, None, None, Some(hyper_status))?;
                    if schedule.checkpointing.test() {
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn infer_kind_structure_sequential(
        &mut self,
        rows: &mut StreamInterval,
        checkpoint: &mut Checkpoint,
        schedule: &mut Schedule,
        rng: &mut Rng,
    ) -> Result<bool> {
        let differ = self.build_differ()?;
        let mut kind_kernel = KindKernel::new(
            &self.config.kernels,
            &mut self.cross_cat,
            &mut self.assignments,
            rng,
        )?;
        let mut hyper_kernel = HyperKernel::new(&self.config.kernels.hyper);
        let mut buffer = vec![];
        let target = checkpoint.row_count as usize;

        let outcome = loop {
            if self.assignments.row_count() == target {
                break Ok(true);
            }
            let add = schedule.annealing.next_action_is_add();
            let row_seed = rng.next_u64();
            let step = if add {
                rows.read_unassigned(&mut buffer).and_then(|_| {
                    let mut row = codec::decode_row(&buffer)?;
                    differ.fill_in(&mut row)?;
                    kind_kernel.add_row(&mut self.cross_cat, &mut self.assignments, &row, row_seed)?;
                    schedule.batching.add();
                    Ok(())
                })
            } else {
                rows.read_assigned(&mut buffer).and_then(|_| {
                    let mut row = codec::decode_row(&buffer)?;
                    differ.fill_in(&mut row)?;
                    kind_kernel.remove_row(
                        &mut self.cross_cat,
                        &mut self.assignments,
                        &row,
                        row_seed,
                    )?;
                    schedule.batching.remove();
                    Ok(())
                })
            };
            if let Err(e) = step {
                break Err(e);
            }

            if schedule.batching.test() {
                schedule.annealing.set_extra_passes(
                    schedule
                        .accelerating
                        .extra_passes(self.assignments.row_count()),
                );
                let step = kind_kernel
                    .try_run(&mut self.cross_cat, &mut self.assignments, rng)
                    .and_then(|changed| {
                        schedule.disabling.run(changed);
                        hyper_kernel.try_run(&mut self.cross_cat, rng)
                    });
                if let Err(e) = step {
                    break Err(e);
                }
                checkpoint.tardis_iter += 1;
                let kind_status = KindStatus::from(&kind_kernel.metrics);
                let hyper_status = HyperStatus {
                    total_time_sec: std::mem::take(&mut hyper_kernel.total_time).as_secs_f64(),
                };
                self.log_batch(
                    checkpoint.tardis_iter,
                    None,
                    Some(kind_status),
                    Some(hyper_status),
                )?;
                if schedule.checkpointing.test() || !schedule.disabling.test() {
                    break Ok(false);
                }
            }
        };

        kind_kernel.teardown(&mut self.cross_cat, &mut self.assignments, rng)?;
        let finished = outcome?;
        if finished {
            checkpoint.tardis_iter += 1;
            self.log_batch(checkpoint.tardis_iter, None, None, None)?;
        }
        Ok(finished)
    }

    fn infer_kind_structure_parallel(
        &mut self,
        rows: &mut StreamInterval,
        checkpoint: &mut Checkpoint,
        schedule: &mut Schedule,
        rng: &mut Rng,
    ) -> Result<bool> {
        let differ = self.build_differ()?;
        let mut kind_kernel = KindKernel::new(
            &self.config.kernels,
            &mut self.cross_cat,
            &mut self.assignments,
            rng,
        )?;
        let mut hyper_kernel = HyperKernel::new(&self.config.kernels.hyper);
        let target = checkpoint.row_count as usize;
        let mut row_count = self.assignments.row_count();

        let outcome = loop {
            let segment = run_kind_segment(
                self.config.kernels.kind.row_queue_capacity as usize,
                self.config.kernels.kind.parser_threads as usize,
                &mut self.cross_cat,
                &mut self.assignments,
                &mut kind_kernel,
                &differ,
                rows,
                schedule,
                rng,
                &mut row_count,
                target,
            );
            let segment = match segment {
                Ok(segment) => segment,
                Err(e) => break Err(e),
            };
            debug_assert_eq!(self.assignments.row_count(), row_count);
            match segment {
                Outcome::Target => break Ok(true),
                Outcome::Boundary => {
                    schedule
                        .annealing
                        .set_extra_passes(schedule.accelerating.extra_passes(row_count));
                    let step = kind_kernel
                        .try_run(&mut self.cross_cat, &mut self.assignments, rng)
                        .and_then(|changed| {
                            schedule.disabling.run(changed);
                            hyper_kernel.try_run(&mut self.cross_cat, rng)
                        });
                    if let Err(e) = step {
                        break Err(e);
                    }
                    checkpoint.tardis_iter += 1;
                    let kind_status = KindStatus::from(&kind_kernel.metrics);
                    let hyper_status = HyperStatus {
                        total_time_sec: std::mem::take(&mut hyper_kernel.total_time)
                            .as_secs_f64(),
                    };
                    self.log_batch(
                        checkpoint.tardis_iter,
                        None,
                        Some(kind_status),
                        Some(hyper_status),
                    )?;
                    if schedule.checkpointing.test() || !schedule.disabling.test() {
                        break Ok(false);
                    }
                }
            }
        };

        kind_kernel.teardown(&mut self.cross_cat, &mut self.assignments, rng)?;
        let finished = outcome?;
        if finished {
            checkpoint.tardis_iter += 1;
            self.log_batch(checkpoint.tardis_iter, None, None, None)?;
        }
        Ok(finished)
    }

    //------------------------------------------------------------------
    // posterior enumeration and generation

    /// emit sample_count posterior samples spaced by sample_skip sweeps
    pub fn posterior_enum(&mut self, rng: &mut Rng, rows_in: &str, samples_out: &str) -> Result<()> {
        let sample_count = self.config.posterior_enum.sample_count as usize;
        let sample_skip = self.config.posterior_enum.sample_skip as usize;
        if sample_skip == 0 && sample_count > 1 {
            return Err(Error::Config("posterior_enum.sample_skip of 0 has zero diversity".into()));
        }
        let differ = self.build_differ()?;
        let mut rows =
            crate::stream::files::read_stream(rows_in, codec::decode_row)?;
        if rows.is_empty() {
            return Err(Error::Parse(format!("{}: empty row stream", rows_in)));
        }
        for row in rows.iter_mut() {
            differ.fill_in(row)?;
        }

        let mut cat_kernel = CatKernel::new(&self.config.kernels.cat)?;
        let mut hyper_kernel = HyperKernel::new(&self.config.kernels.hyper);
        if self.assignments.row_count() == 0 {
            for row in rows.iter() {
                cat_kernel.add_row(&mut self.cross_cat, &mut self.assignments, row, rng.next_u64())?;
            }
        }

        crate::stream::files::create_parent_dirs(samples_out)?;
        let mut writer = RecordWriter::create(samples_out)?;
        let mut score_rng = Rng::seed_from_u64(0);

        if self.config.kernels.kind.iterations > 0 {
            let mut kind_kernel = KindKernel::new(
                &self.config.kernels,
                &mut self.cross_cat,
                &mut self.assignments,
                rng,
            )?;
            for _ in 0..sample_count {
                for _ in 0..sample_skip {
                    for row in rows.iter() {
                        let row_seed = rng.next_u64();
                        kind_kernel.remove_row(
                            &mut self.cross_cat,
                            &mut self.assignments,
                            row,
                            row_seed,
                        )?;
                        kind_kernel.add_row(
                            &mut self.cross_cat,
                            &mut self.assignments,
                            row,
                            row_seed,
                        )?;
                    }
                    kind_kernel.try_run(&mut self.cross_cat, &mut self.assignments, rng)?;
                    hyper_kernel.try_run(&mut self.cross_cat, rng)?;
                }
                let score = self.cross_cat.score_data(&mut score_rng);
                writer.write_record(&codec::encode_posterior_sample(
                    &self.cross_cat,
                    &self.assignments,
                    score,
                ))?;
            }
            kind_kernel.teardown(&mut self.cross_cat, &mut self.assignments, rng)?;
        } else {
            for _ in 0..sample_count {
                for _ in 0..sample_skip {
                    for row in rows.iter() {
                        let row_seed = rng.next_u64();
                        cat_kernel.remove_row(
                            &mut self.cross_cat,
                            &mut self.assignments,
                            row,
                            row_seed,
                        )?;
                        cat_kernel.add_row(
                            &mut self.cross_cat,
                            &mut self.assignments,
                            row,
                            row_seed,
                        )?;
                    }
                    hyper_kernel.try_run(&mut self.cross_cat, rng)?;
                }
                let score = self.cross_cat.score_data(&mut score_rng);
                writer.write_record(&codec::encode_posterior_sample(
                    &self.cross_cat,
                    &self.assignments,
                    score,
                ))?;
            }
        }
        writer.flush()
    }

    /// synthesise rows from the prior, progressively so rows correlate
    /// through the growing groups
    pub fn generate(&mut self, rng: &mut Rng, rows_out: &str) -> Result<()> {
        if self.assignments.row_count() != 0 {
            return Err(Error::Config("generate requires an unassigned model".into()));
        }
        HyperKernel::new(&self.config.kernels.hyper).try_run(&mut self.cross_cat, rng)?;

        let row_count = self.config.generate.row_count as u64;
        let density = self.config.generate.density;
        crate::stream::files::create_parent_dirs(rows_out)?;
        let mut writer = RecordWriter::create(rows_out)?;
        let mut partials: Vec<ProductValue> = vec![];
        let mut likelihoods: Vec<f32> = vec![];
        let mut record;
        for id in 0..row_count {
            partials.clear();
            for kind in self.cross_cat.kinds.iter_mut() {
                let Kind { model, mixture, .. } = kind;
                let total = model.schema.total();
                let bits: Vec<bool> = (0..total).map(|_| rng.random::<f64>() < density).collect();
                let mut partial = ProductValue {
                    observed: Observed::Dense(bits),
                    ..Default::default()
                };
                likelihoods.resize(mixture.group_count(), 0.0);
                mixture
                    .clustering
                    .score_value(&model.clustering, &mut likelihoods);
                crate::numeric::scores_to_likelihoods(&mut likelihoods);
                let groupid = mixture.sample_value(model, &likelihoods, &mut partial, rng);
                model.add_value(&partial, rng);
                mixture.add_value(model, groupid, &partial, rng);
                partials.push(partial);
            }
            let mut full = ProductValue::default();
            self.cross_cat.value_join(&mut full, &partials)?;
            self.cross_cat.schema.normalize_small(&mut full.observed);
            let row = Row {
                id,
                diff: Diff::from(full),
            };
            record = codec::encode_row(&row);
            writer.write_record(&record)?;
        }
        writer.flush()
    }

    //------------------------------------------------------------------

    fn log_batch(
        &mut self,
        iter: u64,
        cat: Option<CatStatus>,
        kind: Option<KindStatus>,
        hyper: Option<HyperStatus>,
    ) -> Result<()> {
        // scoring draws are throwaway; a fixed seed keeps logging out of
        // the inference rng stream
        let mut rng = Rng::seed_from_u64(0);
        let score = self.cross_cat.score_data(&mut rng);
        let data_count = self.assignments.row_count();
        let kl_divergence = if data_count > 0 {
            (-score - (data_count as f32).ln()) / data_count as f32
        } else {
            0.0
        };
        let mut summary = Summary {
            topology_alpha: self.cross_cat.topology.alpha,
            topology_d: self.cross_cat.topology.d,
            category_counts: vec![],
            feature_counts: vec![],
        };
        for kind in self.cross_cat.kinds.iter() {
            if !kind.features.is_empty() {
                let counts = kind.mixture.clustering.counts();
                summary
                    .category_counts
                    .push(counts.iter().filter(|c| **c > 0).count());
                summary.feature_counts.push(kind.features.len());
            }
        }
        self.logger.log(&LogMessage {
            iter,
            rusage: Rusage::snapshot(),
            summary,
            scores: Scores {
                assigned_object_count: data_count,
                score,
                kl_divergence,
            },
            cat,
            kind,
            hyper,
        })
    }
}

//----------------------------------------------------------------------------
// pipelined batch segments

#[derive(Default)]
struct PipelineTask {
    add: bool,
    seed: u64,
    raw: Vec<u8>,
    row: Row,
    partials: Vec<Diff>,
    valid: bool,
}

fn set_error(slot: &Mutex<Option<Error>>, error: Error) {
    let mut slot = slot.lock().expect("pipeline error slot");
    slot.get_or_insert(error);
}

/// drive the producer until a batch boundary or the row target, then
/// drain. shared by the category and kind segments.
fn run_producer<T: Default>(
    pipeline: &Pipeline<T>,
    schedule: &mut Schedule,
    rng: &mut Rng,
    row_count: &mut usize,
    target: usize,
    error: &Mutex<Option<Error>>,
    fill: impl Fn(&mut T, bool, u64),
) -> Outcome {
    let mut position = 0u64;
    let outcome = loop {
        if *row_count == target {
            break Outcome::Target;
        }
        if error.lock().expect("pipeline error slot").is_some() {
            break Outcome::Target;
        }
        let add = schedule.annealing.next_action_is_add();
        let seed = rng.next_u64();
        if add {
            *row_count += 1;
            schedule.batching.add();
        } else {
            *row_count -= 1;
            schedule.batching.remove();
        }
        pipeline.produce(position, |task| fill(task, add, seed));
        position += 1;
        if schedule.batching.test() {
            break Outcome::Boundary;
        }
    };
    pipeline.produce_exit(position);
    pipeline.wait(position + 1);
    outcome
}

fn run_cat_segment(
    capacity: usize,
    parser_threads: usize,
    cross_cat: &mut CrossCat,
    assignments: &mut Assignments,
    differ: &Differ,
    rows: &mut StreamInterval,
    schedule: &mut Schedule,
    rng: &mut Rng,
    row_count: &mut usize,
    target: usize,
) -> Result<Outcome> {
    let kind_count = cross_cat.kinds.len();
    let parser_threads = parser_threads.min(num_cpus::get().max(1));
    let mut pipeline: Pipeline<PipelineTask> = Pipeline::new(capacity, 3);
    pipeline.add_consumer(0);
    pipeline.add_consumer(0);
    for _ in 0..parser_threads {
        pipeline.add_consumer(1);
    }
    for _ in 0..1 + kind_count {
        pipeline.add_consumer(2);
    }
    pipeline.validate();

    let error: Mutex<Option<Error>> = Mutex::new(None);
    let CrossCat {
        ref splitter,
        ref mut kinds,
        ..
    } = *cross_cat;
    let (rowids, groupids) = assignments.split_mut();
    let (unassigned, assigned) = rows.split_mut();

    let outcome = std::thread::scope(|scope| {
        let pipeline = &pipeline;
        let error = &error;
        spawn_unzip_threads(scope, pipeline, error, unassigned, assigned);
        spawn_parse_threads(scope, pipeline, error, parser_threads, splitter, differ);
        spawn_fifo_thread(scope, pipeline, error, rowids);
        for (kindid, (kind, queue)) in kinds.iter_mut().zip(groupids.iter_mut()).enumerate() {
            scope.spawn(move || {
                let mut scores = vec![];
                consume_shared_loop(pipeline, 2, |_, envelope| {
                    if !envelope.task.valid {
                        return;
                    }
                    let mut rng = cat::kind_rng(envelope.task.seed, kindid);
                    if envelope.task.add {
                        cat::process_add(
                            kind,
                            queue,
                            &envelope.task.partials[kindid],
                            &mut scores,
                            &mut rng,
                        );
                    } else if let Err(e) = cat::process_remove(
                        kind,
                        queue,
                        &envelope.task.partials[kindid],
                        &mut rng,
                    ) {
                        set_error(error, e);
                    }
                });
            });
        }
        run_producer(pipeline, schedule, rng, row_count, target, error, |task, add, seed| {
            task.add = add;
            task.seed = seed;
            task.valid = false;
        })
    });

    match error.into_inner().expect("pipeline error slot") {
        Some(error) => Err(error),
        None => Ok(outcome),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_kind_segment(
    capacity: usize,
    parser_threads: usize,
    cross_cat: &mut CrossCat,
    assignments: &mut Assignments,
    kind_kernel: &mut KindKernel,
    differ: &Differ,
    rows: &mut StreamInterval,
    schedule: &mut Schedule,
    rng: &mut Rng,
    row_count: &mut usize,
    target: usize,
) -> Result<Outcome> {
    let kind_count = cross_cat.kinds.len();
    let parser_threads = parser_threads.min(num_cpus::get().max(1));
    let mut pipeline: Pipeline<PipelineTask> = Pipeline::new(capacity, 3);
    pipeline.add_consumer(0);
    pipeline.add_consumer(0);
    for _ in 0..parser_threads {
        pipeline.add_consumer(1);
    }
    for _ in 0..1 + kind_count {
        pipeline.add_consumer(2);
    }
    pipeline.validate();

    let error: Mutex<Option<Error>> = Mutex::new(None);
    let CrossCat {
        ref splitter,
        ref mut kinds,
        ..
    } = *cross_cat;
    let (rowids, groupids) = assignments.split_mut();
    let (unassigned, assigned) = rows.split_mut();
    let proposer_parts: Vec<(&mut ProductModel, &mut ProductMixture)> =
        kind_kernel.proposer.split_mut().collect();

    let outcome = std::thread::scope(|scope| {
        let pipeline = &pipeline;
        let error = &error;
        spawn_unzip_threads(scope, pipeline, error, unassigned, assigned);
        spawn_parse_threads(scope, pipeline, error, parser_threads, splitter, differ);
        spawn_fifo_thread(scope, pipeline, error, rowids);
        for (kindid, ((kind, queue), (proposer_model, proposer_mixture))) in kinds
            .iter_mut()
            .zip(groupids.iter_mut())
            .zip(proposer_parts)
            .enumerate()
        {
            scope.spawn(move || {
                let mut scores = vec![];
                consume_shared_loop(pipeline, 2, |_, envelope| {
                    if !envelope.task.valid {
                        return;
                    }
                    let mut rng = cat::kind_rng(envelope.task.seed, kindid);
                    if envelope.task.add {
                        kind::process_add(
                            kind,
                            queue,
                            proposer_model,
                            proposer_mixture,
                            &envelope.task.partials[kindid],
                            &envelope.task.row.diff,
                            &mut scores,
                            &mut rng,
                        );
                    } else if let Err(e) = kind::process_remove(
                        kind,
                        queue,
                        proposer_model,
                        proposer_mixture,
                        &envelope.task.partials[kindid],
                        &mut rng,
                    ) {
                        set_error(error, e);
                    }
                });
            });
        }
        run_producer(pipeline, schedule, rng, row_count, target, error, |task, add, seed| {
            task.add = add;
            task.seed = seed;
            task.valid = false;
        })
    });

    match error.into_inner().expect("pipeline error slot") {
        Some(error) => Err(error),
        None => Ok(outcome),
    }
}

fn spawn_unzip_threads<'scope, 'env: 'scope>(
    scope: &'scope std::thread::Scope<'scope, 'env>,
    pipeline: &'scope Pipeline<PipelineTask>,
    error: &'scope Mutex<Option<Error>>,
    unassigned: &'scope mut RecordReader,
    assigned: &'scope mut RecordReader,
) {
    scope.spawn(move || {
        consume_loop(pipeline, 0, |_, envelope| {
            if envelope.task.add {
                if let Err(e) = unassigned.cyclic_read(&mut envelope.task.raw) {
                    set_error(error, e);
                }
            }
        });
    });
    scope.spawn(move || {
        consume_loop(pipeline, 0, |_, envelope| {
            if !envelope.task.add {
                if let Err(e) = assigned.cyclic_read(&mut envelope.task.raw) {
                    set_error(error, e);
                }
            }
        });
    });
}

fn spawn_parse_threads<'scope, 'env: 'scope>(
    scope: &'scope std::thread::Scope<'scope, 'env>,
    pipeline: &'scope Pipeline<PipelineTask>,
    error: &'scope Mutex<Option<Error>>,
    parser_threads: usize,
    splitter: &'scope crate::value::Splitter,
    differ: &'scope Differ,
) {
    for index in 0..parser_threads {
        scope.spawn(move || {
            let mut temp = vec![];
            consume_loop(pipeline, 1, |position, envelope| {
                // parsers claim tasks round-robin so exactly one wins
                if position as usize % parser_threads != index {
                    return;
                }
                let task = &mut envelope.task;
                task.valid = false;
                let parsed = codec::decode_row(&task.raw).and_then(|row| {
                    task.row = row;
                    differ.fill_in(&mut task.row)?;
                    splitter.split_diff(&task.row.diff, &mut task.partials, &mut temp);
                    Ok(())
                });
                match parsed {
                    Ok(()) => task.valid = true,
                    Err(e) => set_error(error, e),
                }
            });
        });
    }
}

fn spawn_fifo_thread<'scope, 'env: 'scope>(
    scope: &'scope std::thread::Scope<'scope, 'env>,
    pipeline: &'scope Pipeline<PipelineTask>,
    error: &'scope Mutex<Option<Error>>,
    rowids: &'scope mut Queue<u64>,
) {
    scope.spawn(move || {
        consume_shared_loop(pipeline, 2, |_, envelope| {
            if !envelope.task.valid {
                return;
            }
            if envelope.task.add {
                if !rowids.try_push(envelope.task.row.id) {
                    set_error(error, Error::DuplicateRow(envelope.task.row.id));
                }
            } else {
                match rowids.pop() {
                    Ok(popped) if popped == envelope.task.row.id => {}
                    Ok(popped) => set_error(
                        error,
                        Error::RowIdMismatch {
                            expected: envelope.task.row.id,
                            popped,
                        },
                    ),
                    Err(e) => set_error(error, e),
                }
            }
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::bernoulli;
    use crate::family::normal;
    use crate::family::poisson;
    use crate::family::HyperPrior;
    use crate::family::PitmanYor;
    use crate::model::assemble;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.kernels.cat.row_queue_capacity = 0;
        config.kernels.cat.empty_group_count = 1;
        config.kernels.kind.iterations = 0;
        config.kernels.hyper.run = false;
        config.schedule.extra_passes = 1.0;
        config.schedule.small_data_size = 1.0;
        config.generate.row_count = 20;
        config.generate.density = 1.0;
        config
    }

    /// schema {2 booleans, 1 count, 1 real} split over two kinds
    fn write_test_model(path: &str) {
        let mut first = ProductModel::default();
        first.bb.insert(0, bernoulli::Shared::default());
        first.gp.insert(2, poisson::Shared::default());
        first.update_schema();
        let mut second = ProductModel::default();
        second.bb.insert(1, bernoulli::Shared::default());
        second.nich.insert(3, normal::Shared::default());
        second.update_schema();
        let cross_cat = assemble(
            PitmanYor { alpha: 1.0, d: 0.0 },
            HyperPrior::default(),
            vec![],
            vec![first, second],
        );
        codec::dump_model(&cross_cat, path).unwrap();
    }

    fn generate_rows(model: &str, rows: &str, config: &Config) {
        let mut rng = Rng::seed_from_u64(config.seed);
        let mut engine =
            Engine::load(config.clone(), model, None, None, None, &mut rng).unwrap();
        engine.generate(&mut rng, rows).unwrap();
    }

    #[test]
    fn generate_then_infer_terminates_with_all_rows_assigned() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.pbs").to_string_lossy().into_owned();
        let rows = dir.path().join("rows.pbs").to_string_lossy().into_owned();
        write_test_model(&model);
        let mut config = test_config();
        config.seed = 42;
        config.schedule.extra_passes = 3.0;
        generate_rows(&model, &rows, &config);
        assert_eq!(RecordReader::count_records(&rows).unwrap(), 20);

        let mut rng = Rng::seed_from_u64(7);
        let mut engine =
            Engine::load(config, &model, None, None, None, &mut rng).unwrap();
        let finished = engine.infer_multi_pass(&mut rng, &rows, None, None).unwrap();
        assert!(finished);
        assert_eq!(engine.assignments.row_count(), 20);
        engine.cross_cat.validate();
        engine.assignments.validate();
    }

    #[test]
    fn generated_rows_decode_and_respect_density() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.pbs").to_string_lossy().into_owned();
        let rows = dir.path().join("rows.pbs").to_string_lossy().into_owned();
        write_test_model(&model);
        let mut config = test_config();
        config.generate.density = 1.0;
        generate_rows(&model, &rows, &config);
        let rows = crate::stream::files::read_stream(&rows, codec::decode_row).unwrap();
        assert_eq!(rows.len(), 20);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.id, i as u64);
            // density 1: every slot observed
            assert_eq!(row.diff.pos.observed.count(4), 4);
            assert!(row.diff.tares.is_empty());
        }
    }

    #[test]
    fn pipelined_and_sequential_runs_are_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.pbs").to_string_lossy().into_owned();
        let rows = dir.path().join("rows.pbs").to_string_lossy().into_owned();
        write_test_model(&model);
        let config = test_config();
        generate_rows(&model, &rows, &config);

        let run = |capacity: u32, parser_threads: u32| {
            let mut config = test_config();
            config.kernels.cat.row_queue_capacity = capacity;
            config.kernels.cat.parser_threads = parser_threads.max(1);
            let mut rng = Rng::seed_from_u64(123);
            let mut engine =
                Engine::load(config, &model, None, None, None, &mut rng).unwrap();
            let finished = engine.infer_multi_pass(&mut rng, &rows, None, None).unwrap();
            assert!(finished);
            engine
        };

        let sequential = run(0, 1);
        let pipelined = run(8, 2);
        assert_eq!(sequential.assignments, pipelined.assignments);
        for (a, b) in sequential
            .cross_cat
            .kinds
            .iter()
            .zip(pipelined.cross_cat.kinds.iter())
        {
            assert_eq!(a.mixture.clustering, b.mixture.clustering);
            assert_eq!(a.mixture.id_tracker, b.mixture.id_tracker);
            assert_eq!(a.mixture.bb, b.mixture.bb);
            assert_eq!(a.mixture.gp, b.mixture.gp);
            assert_eq!(a.mixture.nich, b.mixture.nich);
        }
    }

    #[test]
    fn kind_inference_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.pbs").to_string_lossy().into_owned();
        let rows = dir.path().join("rows.pbs").to_string_lossy().into_owned();
        write_test_model(&model);
        let mut config = test_config();
        config.kernels.kind.iterations = 2;
        config.kernels.kind.empty_kind_count = 1;
        config.kernels.kind.score_parallel = false;
        config.kernels.kind.row_queue_capacity = 0;
        config.kernels.hyper.run = true;
        config.kernels.hyper.parallel = false;
        generate_rows(&model, &rows, &config);

        let mut rng = Rng::seed_from_u64(5);
        let mut engine = Engine::load(config, &model, None, None, None, &mut rng).unwrap();
        let finished = engine.infer_multi_pass(&mut rng, &rows, None, None).unwrap();
        assert!(finished);
        assert_eq!(engine.assignments.row_count(), 20);
        engine.cross_cat.validate();
        // reserve kinds were collected on the way out
        assert!(engine.cross_cat.kinds.iter().all(|k| !k.features.is_empty()));
    }

    #[test]
    fn pipelined_kind_inference_matches_row_counts() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.pbs").to_string_lossy().into_owned();
        let rows = dir.path().join("rows.pbs").to_string_lossy().into_owned();
        write_test_model(&model);
        let mut config = test_config();
        config.kernels.kind.iterations = 1;
        config.kernels.kind.empty_kind_count = 1;
        config.kernels.kind.score_parallel = false;
        config.kernels.kind.row_queue_capacity = 4;
        config.kernels.kind.parser_threads = 2;
        generate_rows(&model, &rows, &config);

        let mut rng = Rng::seed_from_u64(5);
        let mut engine = Engine::load(config, &model, None, None, None, &mut rng).unwrap();
        let finished = engine.infer_multi_pass(&mut rng, &rows, None, None).unwrap();
        assert!(finished);
        assert_eq!(engine.assignments.row_count(), 20);
        engine.cross_cat.validate();
    }

    #[test]
    fn resuming_one_checkpoint_twice_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.pbs").to_string_lossy().into_owned();
        let rows = dir.path().join("rows.pbs").to_string_lossy().into_owned();
        let snapshot_model = dir.path().join("snap/model.pbs").to_string_lossy().into_owned();
        let snapshot_groups = dir.path().join("snap/groups").to_string_lossy().into_owned();
        let snapshot_assign = dir.path().join("snap/assign.pbs").to_string_lossy().into_owned();
        let checkpoint = dir.path().join("checkpoint.pbs").to_string_lossy().into_owned();
        write_test_model(&model);
        let mut config = test_config();
        // fires at the first batch boundary, so the run stops early
        config.schedule.checkpoint_period_sec = 1e-9;
        generate_rows(&model, &rows, &config);

        let mut rng = Rng::seed_from_u64(11);
        let mut engine =
            Engine::load(config.clone(), &model, None, None, None, &mut rng).unwrap();
        let finished = engine
            .infer_multi_pass(&mut rng, &rows, None, Some(&checkpoint))
            .unwrap();
        assert!(!finished, "the checkpoint stops the run early");
        assert!(engine.assignments.row_count() > 0);
        engine
            .dump(Some(&snapshot_model), Some(&snapshot_groups), Some(&snapshot_assign))
            .unwrap();

        let resume = || {
            let mut rng = Rng::seed_from_u64(999); // overridden by the checkpoint seed
            let mut engine = Engine::load(
                config.clone(),
                &snapshot_model,
                Some(snapshot_groups.as_str()),
                Some(snapshot_assign.as_str()),
                None,
                &mut rng,
            )
            .unwrap();
            engine
                .infer_multi_pass(&mut rng, &rows, Some(checkpoint.as_str()), None)
                .unwrap();
            engine
        };
        let first = resume();
        let second = resume();
        assert_eq!(first.assignments, second.assignments);
        for (a, b) in first.cross_cat.kinds.iter().zip(second.cross_cat.kinds.iter()) {
            assert_eq!(a.mixture.clustering, b.mixture.clustering);
            assert_eq!(a.mixture.bb, b.mixture.bb);
        }
    }

    #[test]
    fn posterior_enum_emits_the_requested_samples() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.pbs").to_string_lossy().into_owned();
        let rows = dir.path().join("rows.pbs").to_string_lossy().into_owned();
        let samples = dir.path().join("samples.pbs").to_string_lossy().into_owned();
        write_test_model(&model);
        let mut config = test_config();
        config.generate.row_count = 8;
        config.posterior_enum.sample_count = 3;
        config.posterior_enum.sample_skip = 1;
        generate_rows(&model, &rows, &config);

        let mut rng = Rng::seed_from_u64(3);
        let mut engine = Engine::load(config, &model, None, None, None, &mut rng).unwrap();
        engine.posterior_enum(&mut rng, &rows, &samples).unwrap();
        assert_eq!(RecordReader::count_records(&samples).unwrap(), 3);
        assert_eq!(engine.assignments.row_count(), 8);
    }

    #[test]
    fn mix_extends_a_trained_model() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.pbs").to_string_lossy().into_owned();
        let rows = dir.path().join("rows.pbs").to_string_lossy().into_owned();
        write_test_model(&model);
        let config = test_config();
        generate_rows(&model, &rows, &config);

        let mut rng = Rng::seed_from_u64(1);
        let mut engine = Engine::load(config, &model, None, None, None, &mut rng).unwrap();
        engine.mix(&mut rng, &rows).unwrap();
        assert_eq!(engine.assignments.row_count(), 20);
        assert_eq!(engine.cross_cat.count_rows(), 20);
    }
}
