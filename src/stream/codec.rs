use super::files::RecordReader;
use super::files::RecordWriter;
use crate::assign::Assignments;
use crate::family::bernoulli;
use crate::family::discrete;
use crate::family::normal;
use crate::family::poisson;
use crate::family::prior;
use crate::family::process;
use crate::family::FeatureMixture;
use crate::family::HyperPrior;
use crate::family::PitmanYor;
use crate::model::assemble;
use crate::model::CrossCat;
use crate::model::Kind;
use crate::model::ProductModel;
use crate::schedule::ScheduleState;
use crate::value::Diff;
use crate::value::Observed;
use crate::value::ProductValue;
use crate::value::Row;
use crate::Error;
use crate::Result;
use crate::Rng;
use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use std::collections::BTreeMap;
use std::collections::HashMap;

//----------------------------------------------------------------------------
// primitives

fn put_u8(out: &mut Vec<u8>, x: u8) {
    out.push(x);
}

fn put_bool(out: &mut Vec<u8>, x: bool) {
    out.push(x as u8);
}

fn put_u32(out: &mut Vec<u8>, x: u32) {
    out.extend_from_slice(&x.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, x: u64) {
    out.extend_from_slice(&x.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, x: f32) {
    out.extend_from_slice(&x.to_le_bytes());
}

fn put_f64(out: &mut Vec<u8>, x: f64) {
    out.extend_from_slice(&x.to_le_bytes());
}

/// cursor over one record's bytes; every read failure is a ParseError
pub struct Decoder<'a> {
    bytes: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn bad<T>(context: &str) -> Result<T> {
        Err(Error::Parse(format!("truncated field: {}", context)))
    }

    fn u8(&mut self) -> Result<u8> {
        self.bytes.read_u8().or_else(|_| Self::bad("u8"))
    }

    fn boolean(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn u32(&mut self) -> Result<u32> {
        self.bytes
            .read_u32::<LittleEndian>()
            .or_else(|_| Self::bad("u32"))
    }

    fn u64(&mut self) -> Result<u64> {
        self.bytes
            .read_u64::<LittleEndian>()
            .or_else(|_| Self::bad("u64"))
    }

    fn f32(&mut self) -> Result<f32> {
        self.bytes
            .read_f32::<LittleEndian>()
            .or_else(|_| Self::bad("f32"))
    }

    fn f64(&mut self) -> Result<f64> {
        self.bytes
            .read_f64::<LittleEndian>()
            .or_else(|_| Self::bad("f64"))
    }

    fn len(&mut self) -> Result<usize> {
        Ok(self.u32()? as usize)
    }

    pub fn done(&self) -> Result<()> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(Error::Parse(format!(
                "{} trailing bytes after record",
                self.bytes.len()
            )))
        }
    }
}

//----------------------------------------------------------------------------
// values, diffs, rows

pub fn put_value(out: &mut Vec<u8>, value: &ProductValue) {
    match &value.observed {
        Observed::All => put_u8(out, 0),
        Observed::Dense(bits) => {
            put_u8(out, 1);
            put_u32(out, bits.len() as u32);
            for bit in bits {
                put_bool(out, *bit);
            }
        }
        Observed::Sparse(ids) => {
            put_u8(out, 2);
            put_u32(out, ids.len() as u32);
            for id in ids {
                put_u32(out, *id);
            }
        }
        Observed::None => put_u8(out, 3),
    }
    put_u32(out, value.booleans.len() as u32);
    for x in value.booleans.iter() {
        put_bool(out, *x);
    }
    put_u32(out, value.counts.len() as u32);
    for x in value.counts.iter() {
        put_u32(out, *x);
    }
    put_u32(out, value.reals.len() as u32);
    for x in value.reals.iter() {
        put_f32(out, *x);
    }
}

pub fn get_value(decoder: &mut Decoder) -> Result<ProductValue> {
    let observed = match decoder.u8()? {
        0 => Observed::All,
        1 => {
            let len = decoder.len()?;
            let mut bits = Vec::with_capacity(len);
            for _ in 0..len {
                bits.push(decoder.boolean()?);
            }
            Observed::Dense(bits)
        }
        2 => {
            let len = decoder.len()?;
            let mut ids = Vec::with_capacity(len);
            for _ in 0..len {
                ids.push(decoder.u32()?);
            }
            Observed::Sparse(ids)
        }
        3 => Observed::None,
        tag => return Err(Error::Parse(format!("bad sparsity tag: {}", tag))),
    };
    let booleans_len = decoder.len()?;
    let mut booleans = Vec::with_capacity(booleans_len);
    for _ in 0..booleans_len {
        booleans.push(decoder.boolean()?);
    }
    let counts_len = decoder.len()?;
    let mut counts = Vec::with_capacity(counts_len);
    for _ in 0..counts_len {
        counts.push(decoder.u32()?);
    }
    let reals_len = decoder.len()?;
    let mut reals = Vec::with_capacity(reals_len);
    for _ in 0..reals_len {
        reals.push(decoder.f32()?);
    }
    Ok(ProductValue {
        observed,
        booleans,
        counts,
        reals,
    })
}

pub fn put_diff(out: &mut Vec<u8>, diff: &Diff) {
    put_value(out, &diff.pos);
    put_value(out, &diff.neg);
    put_u32(out, diff.tares.len() as u32);
    for id in diff.tares.iter() {
        put_u32(out, *id);
    }
}

pub fn get_diff(decoder: &mut Decoder) -> Result<Diff> {
    let pos = get_value(decoder)?;
    let neg = get_value(decoder)?;
    let tares_len = decoder.len()?;
    let mut tares = Vec::with_capacity(tares_len);
    for _ in 0..tares_len {
        tares.push(decoder.u32()?);
    }
    Ok(Diff { pos, neg, tares })
}

pub fn encode_row(row: &Row) -> Vec<u8> {
    let mut out = vec![];
    put_u64(&mut out, row.id);
    put_diff(&mut out, &row.diff);
    out
}

pub fn decode_row(bytes: &[u8]) -> Result<Row> {
    let mut decoder = Decoder::new(bytes);
    let id = decoder.u64()?;
    let diff = get_diff(&mut decoder)?;
    decoder.done()?;
    Ok(Row { id, diff })
}

/// the row id is the first field, so peeking needs no full parse
pub fn peek_row_id(bytes: &[u8]) -> Result<u64> {
    Decoder::new(bytes).u64()
}

//----------------------------------------------------------------------------
// checkpoints

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Checkpoint {
    pub seed: u64,
    pub row_count: u64,
    pub tardis_iter: u64,
    pub unassigned_pos: u64,
    pub assigned_pos: u64,
    pub schedule: ScheduleState,
    pub finished: bool,
}

pub fn encode_checkpoint(checkpoint: &Checkpoint) -> Vec<u8> {
    let mut out = vec![];
    put_u64(&mut out, checkpoint.seed);
    put_u64(&mut out, checkpoint.row_count);
    put_u64(&mut out, checkpoint.tardis_iter);
    put_u64(&mut out, checkpoint.unassigned_pos);
    put_u64(&mut out, checkpoint.assigned_pos);
    put_f64(&mut out, checkpoint.schedule.annealing_state);
    put_u64(&mut out, checkpoint.schedule.stale);
    put_u64(&mut out, checkpoint.schedule.fresh);
    put_u32(&mut out, checkpoint.schedule.reject_count);
    put_bool(&mut out, checkpoint.schedule.disabled);
    put_bool(&mut out, checkpoint.finished);
    out
}

pub fn decode_checkpoint(bytes: &[u8]) -> Result<Checkpoint> {
    let mut decoder = Decoder::new(bytes);
    let checkpoint = Checkpoint {
        seed: decoder.u64()?,
        row_count: decoder.u64()?,
        tardis_iter: decoder.u64()?,
        unassigned_pos: decoder.u64()?,
        assigned_pos: decoder.u64()?,
        schedule: ScheduleState {
            annealing_state: decoder.f64()?,
            stale: decoder.u64()?,
            fresh: decoder.u64()?,
            reject_count: decoder.u32()?,
            disabled: decoder.boolean()?,
        },
        finished: decoder.boolean()?,
    };
    decoder.done()?;
    Ok(checkpoint)
}

pub fn read_checkpoint(path: &str) -> Result<Checkpoint> {
    let mut reader = RecordReader::open(path)?;
    let mut buffer = vec![];
    if !reader.try_read(&mut buffer)? {
        return Err(Error::Parse(format!("{}: empty checkpoint", path)));
    }
    decode_checkpoint(&buffer)
}

pub fn write_checkpoint(path: &str, checkpoint: &Checkpoint) -> Result<()> {
    super::files::create_parent_dirs(path)?;
    let mut writer = RecordWriter::create(path)?;
    writer.write_record(&encode_checkpoint(checkpoint))?;
    writer.flush()
}

/// one posterior-enumeration sample: the total score plus, per nonempty
/// kind, its feature ids and its groups as row-id lists
pub fn encode_posterior_sample(
    cross_cat: &CrossCat,
    assignments: &Assignments,
    score: f32,
) -> Vec<u8> {
    let mut out = vec![];
    put_f32(&mut out, score);
    let kinds: Vec<usize> = (0..cross_cat.kinds.len())
        .filter(|kindid| !cross_cat.kinds[*kindid].features.is_empty())
        .collect();
    put_u32(&mut out, kinds.len() as u32);
    for kindid in kinds {
        let kind = &cross_cat.kinds[kindid];
        put_u32(&mut out, kind.features.len() as u32);
        for featureid in kind.features.iter() {
            put_u32(&mut out, *featureid as u32);
        }
        let mut groups: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
        for (i, rowid) in assignments.rowids().iter().enumerate() {
            let global = *assignments.groupids(kindid).get(i);
            groups.entry(global).or_default().push(*rowid);
        }
        put_u32(&mut out, groups.len() as u32);
        for rowids in groups.values() {
            put_u32(&mut out, rowids.len() as u32);
            for rowid in rowids {
                put_u64(&mut out, *rowid);
            }
        }
    }
    out
}

//----------------------------------------------------------------------------
// assignments

pub fn dump_assignments(
    assignments: &Assignments,
    sorted_to_globals: &[Vec<u32>],
    writer: &mut RecordWriter,
) -> Result<()> {
    let kind_count = assignments.kind_count();
    let global_to_sorteds: Vec<HashMap<u32, u32>> = sorted_to_globals
        .iter()
        .map(|sorted| {
            sorted
                .iter()
                .enumerate()
                .map(|(rank, global)| (*global, rank as u32))
                .collect()
        })
        .collect();
    let mut out = vec![];
    for (i, rowid) in assignments.rowids().iter().enumerate() {
        out.clear();
        put_u64(&mut out, *rowid);
        put_u32(&mut out, kind_count as u32);
        for kind in 0..kind_count {
            let global = *assignments.groupids(kind).get(i);
            let sorted = global_to_sorteds[kind]
                .get(&global)
                .copied()
                .ok_or_else(|| Error::Parse(format!("unmapped group id: {}", global)))?;
            put_u32(&mut out, sorted);
        }
        writer.write_record(&out)?;
    }
    Ok(())
}

/// group ids in the file are in the popularity-sorted encoding, which is
/// exactly the packed (and global) order of a freshly loaded mixture
pub fn load_assignments(assignments: &mut Assignments, path: &str) -> Result<()> {
    let kind_count = assignments.kind_count();
    let mut reader = RecordReader::open(path)?;
    let mut buffer = vec![];
    while reader.try_read(&mut buffer)? {
        let mut decoder = Decoder::new(&buffer);
        let rowid = decoder.u64()?;
        let len = decoder.len()?;
        if len != kind_count {
            return Err(Error::SchemaMismatch(format!(
                "assignment carries {} kinds, model has {}",
                len, kind_count
            )));
        }
        assignments.push_row(rowid)?;
        for kind in 0..kind_count {
            assignments.push_group(kind, decoder.u32()?);
        }
        decoder.done()?;
    }
    Ok(())
}

//----------------------------------------------------------------------------
// shared models

fn put_pitman_yor(out: &mut Vec<u8>, shared: &PitmanYor) {
    put_f32(out, shared.alpha);
    put_f32(out, shared.d);
}

fn get_pitman_yor(decoder: &mut Decoder) -> Result<PitmanYor> {
    Ok(PitmanYor {
        alpha: decoder.f32()?,
        d: decoder.f32()?,
    })
}

fn put_f32_grid(out: &mut Vec<u8>, grid: &[f32]) {
    put_u32(out, grid.len() as u32);
    for x in grid {
        put_f32(out, *x);
    }
}

fn get_f32_grid(decoder: &mut Decoder) -> Result<Vec<f32>> {
    let grid_len = decoder.len()?;
    let mut grid = Vec::with_capacity(grid_len);
    for _ in 0..grid_len {
        grid.push(decoder.f32()?);
    }
    Ok(grid)
}

fn put_hyper_prior(out: &mut Vec<u8>, prior: &HyperPrior) {
    put_u32(out, prior.topology.len() as u32);
    for shared in prior.topology.iter() {
        put_pitman_yor(out, shared);
    }
    put_u32(out, prior.clustering.len() as u32);
    for shared in prior.clustering.iter() {
        put_pitman_yor(out, shared);
    }
    put_f32_grid(out, &prior.bb.alpha);
    put_f32_grid(out, &prior.bb.beta);
    put_f32_grid(out, &prior.dd.alpha);
    put_f32_grid(out, &prior.dpd.alpha);
    put_f32_grid(out, &prior.dpd.gamma);
    put_f32_grid(out, &prior.gp.alpha);
    put_f32_grid(out, &prior.gp.inv_beta);
    put_f32_grid(out, &prior.nich.mu);
    put_f32_grid(out, &prior.nich.kappa);
    put_f32_grid(out, &prior.nich.sigmasq);
    put_f32_grid(out, &prior.nich.nu);
}

fn get_hyper_prior(decoder: &mut Decoder) -> Result<HyperPrior> {
    let topology_len = decoder.len()?;
    let mut topology = Vec::with_capacity(topology_len);
    for _ in 0..topology_len {
        topology.push(get_pitman_yor(decoder)?);
    }
    let clustering_len = decoder.len()?;
    let mut clustering = Vec::with_capacity(clustering_len);
    for _ in 0..clustering_len {
        clustering.push(get_pitman_yor(decoder)?);
    }
    Ok(HyperPrior {
        topology,
        clustering,
        bb: prior::BernoulliGrid {
            alpha: get_f32_grid(decoder)?,
            beta: get_f32_grid(decoder)?,
        },
        dd: prior::DiscreteGrid {
            alpha: get_f32_grid(decoder)?,
        },
        dpd: prior::ProcessGrid {
            alpha: get_f32_grid(decoder)?,
            gamma: get_f32_grid(decoder)?,
        },
        gp: prior::PoissonGrid {
            alpha: get_f32_grid(decoder)?,
            inv_beta: get_f32_grid(decoder)?,
        },
        nich: prior::NormalGrid {
            mu: get_f32_grid(decoder)?,
            kappa: get_f32_grid(decoder)?,
            sigmasq: get_f32_grid(decoder)?,
            nu: get_f32_grid(decoder)?,
        },
    })
}

fn put_kind_model(out: &mut Vec<u8>, model: &ProductModel) {
    put_pitman_yor(out, &model.clustering);
    put_u32(out, model.bb.len() as u32);
    for (id, shared) in model.bb.iter() {
        put_u32(out, id as u32);
        put_f32(out, shared.alpha);
        put_f32(out, shared.beta);
    }
    put_u32(out, model.d16.len() as u32);
    for (id, shared) in model.d16.iter() {
        put_u32(out, id as u32);
        put_f32_grid(out, &shared.alphas);
    }
    put_u32(out, model.d256.len() as u32);
    for (id, shared) in model.d256.iter() {
        put_u32(out, id as u32);
        put_f32_grid(out, &shared.alphas);
    }
    put_u32(out, model.dpd.len() as u32);
    for (id, shared) in model.dpd.iter() {
        put_u32(out, id as u32);
        put_f32(out, shared.gamma);
        put_f32(out, shared.alpha);
        put_f32(out, shared.beta0);
        put_u32(out, shared.betas.len() as u32);
        for (value, beta) in shared.betas.iter() {
            put_u32(out, *value);
            put_f32(out, *beta);
            put_u32(out, shared.counts.get(value).copied().unwrap_or(0));
        }
    }
    put_u32(out, model.gp.len() as u32);
    for (id, shared) in model.gp.iter() {
        put_u32(out, id as u32);
        put_f32(out, shared.alpha);
        put_f32(out, shared.inv_beta);
    }
    put_u32(out, model.nich.len() as u32);
    for (id, shared) in model.nich.iter() {
        put_u32(out, id as u32);
        put_f32(out, shared.mu);
        put_f32(out, shared.kappa);
        put_f32(out, shared.sigmasq);
        put_f32(out, shared.nu);
    }
}

fn get_kind_model(decoder: &mut Decoder) -> Result<ProductModel> {
    let mut model = ProductModel {
        clustering: get_pitman_yor(decoder)?,
        ..Default::default()
    };
    for _ in 0..decoder.len()? {
        let id = decoder.u32()? as usize;
        model.bb.insert(
            id,
            bernoulli::Shared {
                alpha: decoder.f32()?,
                beta: decoder.f32()?,
            },
        );
    }
    for _ in 0..decoder.len()? {
        let id = decoder.u32()? as usize;
        model.d16.insert(
            id,
            discrete::Shared {
                alphas: get_f32_grid(decoder)?,
            },
        );
    }
    for _ in 0..decoder.len()? {
        let id = decoder.u32()? as usize;
        model.d256.insert(
            id,
            discrete::Shared {
                alphas: get_f32_grid(decoder)?,
            },
        );
    }
    for _ in 0..decoder.len()? {
        let id = decoder.u32()? as usize;
        let gamma = decoder.f32()?;
        let alpha = decoder.f32()?;
        let beta0 = decoder.f32()?;
        let mut betas = BTreeMap::new();
        let mut counts = BTreeMap::new();
        for _ in 0..decoder.len()? {
            let value = decoder.u32()?;
            betas.insert(value, decoder.f32()?);
            let count = decoder.u32()?;
            if count > 0 {
                counts.insert(value, count);
            }
        }
        model.dpd.insert(
            id,
            process::Shared {
                gamma,
                alpha,
                beta0,
                betas,
                counts,
            },
        );
    }
    for _ in 0..decoder.len()? {
        let id = decoder.u32()? as usize;
        model.gp.insert(
            id,
            poisson::Shared {
                alpha: decoder.f32()?,
                inv_beta: decoder.f32()?,
            },
        );
    }
    for _ in 0..decoder.len()? {
        let id = decoder.u32()? as usize;
        model.nich.insert(
            id,
            normal::Shared {
                mu: decoder.f32()?,
                kappa: decoder.f32()?,
                sigmasq: decoder.f32()?,
                nu: decoder.f32()?,
            },
        );
    }
    model.update_schema();
    Ok(model)
}

/// shared model file: a header record (topology, hyper prior, tares,
/// kind count) followed by one record per kind
pub fn dump_model(cross_cat: &CrossCat, path: &str) -> Result<()> {
    super::files::create_parent_dirs(path)?;
    let mut writer = RecordWriter::create(path)?;
    let mut out = vec![];
    put_pitman_yor(&mut out, &cross_cat.topology);
    put_hyper_prior(&mut out, &cross_cat.hyper_prior);
    put_u32(&mut out, cross_cat.tares.len() as u32);
    for tare in cross_cat.tares.iter() {
        put_value(&mut out, tare);
    }
    put_u32(&mut out, cross_cat.kinds.len() as u32);
    writer.write_record(&out)?;
    for kind in cross_cat.kinds.iter() {
        out.clear();
        put_kind_model(&mut out, &kind.model);
        writer.write_record(&out)?;
    }
    writer.flush()
}

pub fn load_model(path: &str) -> Result<CrossCat> {
    let mut reader = RecordReader::open(path)?;
    let mut buffer = vec![];
    if !reader.try_read(&mut buffer)? {
        return Err(Error::Parse(format!("{}: empty model file", path)));
    }
    let mut decoder = Decoder::new(&buffer);
    let topology = get_pitman_yor(&mut decoder)?;
    let hyper_prior = get_hyper_prior(&mut decoder)?;
    let tares_len = decoder.len()?;
    let mut tares = Vec::with_capacity(tares_len);
    for _ in 0..tares_len {
        tares.push(get_value(&mut decoder)?);
    }
    let kind_count = decoder.len()?;
    decoder.done()?;
    let mut models = Vec::with_capacity(kind_count);
    for _ in 0..kind_count {
        if !reader.try_read(&mut buffer)? {
            return Err(Error::Parse(format!("{}: missing kind record", path)));
        }
        let mut decoder = Decoder::new(&buffer);
        models.push(get_kind_model(&mut decoder)?);
        decoder.done()?;
    }
    let mut seen = std::collections::BTreeSet::new();
    for model in models.iter() {
        for id in model.feature_ids() {
            if !seen.insert(id) {
                return Err(Error::DuplicateFeature(id));
            }
        }
    }
    let total = seen.len();
    if seen.iter().next_back().map(|id| id + 1).unwrap_or(0) != total {
        let missing = (0..total).find(|id| !seen.contains(id)).unwrap_or(total);
        return Err(Error::UnknownFeature(missing));
    }
    // slot order is family-block order: every reader walks BB, DD16,
    // DD256, DPD, GP, NICH, so ids must be grouped that way globally
    let mut rank_by_id = vec![0u8; total];
    for model in models.iter() {
        let tables: [(&[crate::FeatureId], u8); 6] = [
            (model.bb.ids(), 0),
            (model.d16.ids(), 1),
            (model.d256.ids(), 2),
            (model.dpd.ids(), 3),
            (model.gp.ids(), 4),
            (model.nich.ids(), 5),
        ];
        for (ids, rank) in tables {
            for id in ids {
                rank_by_id[*id] = rank;
            }
        }
    }
    if rank_by_id.windows(2).any(|w| w[0] > w[1]) {
        return Err(Error::SchemaMismatch(
            "feature ids are not grouped in family order".to_string(),
        ));
    }
    let cross_cat = assemble(topology, hyper_prior, tares, models);
    for tare in cross_cat.tares.iter() {
        cross_cat.schema.validate_value(tare).map_err(|_| {
            Error::SchemaMismatch("tare disagrees with the model schema".to_string())
        })?;
    }
    Ok(cross_cat)
}

//----------------------------------------------------------------------------
// mixtures (one groups file per kind)

pub fn mixture_filename(dirname: &str, kindid: usize) -> String {
    format!("{}/mixture.{:03}.pbs", dirname, kindid)
}

/// one record per nonempty group in popularity order: the count, then
/// each feature's sufficient statistics in family order
pub fn dump_mixture(kind: &Kind, sorted_to_global: &[u32], path: &str) -> Result<()> {
    super::files::create_parent_dirs(path)?;
    let mut writer = RecordWriter::create(path)?;
    let mut out = vec![];
    for global in sorted_to_global.iter() {
        let packed = kind.mixture.id_tracker.global_to_packed(*global);
        out.clear();
        put_u32(&mut out, kind.mixture.clustering.counts()[packed]);
        for (_, feature) in kind.mixture.bb.iter() {
            let group = &feature.groups[packed];
            put_u32(&mut out, group.heads);
            put_u32(&mut out, group.tails);
        }
        for (_, feature) in kind.mixture.d16.iter() {
            put_discrete_group(&mut out, &feature.groups[packed]);
        }
        for (_, feature) in kind.mixture.d256.iter() {
            put_discrete_group(&mut out, &feature.groups[packed]);
        }
        for (_, feature) in kind.mixture.dpd.iter() {
            let group = &feature.groups[packed];
            put_u32(&mut out, group.counts.len() as u32);
            for (value, count) in group.counts.iter() {
                put_u32(&mut out, *value);
                put_u32(&mut out, *count);
            }
        }
        for (_, feature) in kind.mixture.gp.iter() {
            let group = &feature.groups[packed];
            put_u32(&mut out, group.count);
            put_u32(&mut out, group.sum);
            put_f32(&mut out, group.log_prod);
        }
        for (_, feature) in kind.mixture.nich.iter() {
            let group = &feature.groups[packed];
            put_u32(&mut out, group.count);
            put_f32(&mut out, group.mean);
            put_f32(&mut out, group.count_times_variance);
        }
        writer.write_record(&out)?;
    }
    writer.flush()
}

fn put_discrete_group(out: &mut Vec<u8>, group: &discrete::Group) {
    put_u32(out, group.counts.len() as u32);
    for count in group.counts.iter() {
        put_u32(out, *count);
    }
}

fn get_discrete_group(decoder: &mut Decoder) -> Result<discrete::Group> {
    let counts_len = decoder.len()?;
    let mut counts = Vec::with_capacity(counts_len);
    for _ in 0..counts_len {
        counts.push(decoder.u32()?);
    }
    let total = counts.iter().sum();
    Ok(discrete::Group { counts, total })
}

/// read one kind's groups file, append the reserve groups, and bring the
/// mixture caches up
pub fn load_mixture(
    kind: &mut Kind,
    path: &str,
    empty_group_count: usize,
    rng: &mut Rng,
) -> Result<()> {
    let mut reader = RecordReader::open(path)?;
    let mut buffer = vec![];
    let mut counts: Vec<u32> = vec![];
    let mut bb: Vec<Vec<bernoulli::Group>> = vec![vec![]; kind.model.bb.len()];
    let mut d16: Vec<Vec<discrete::Group>> = vec![vec![]; kind.model.d16.len()];
    let mut d256: Vec<Vec<discrete::Group>> = vec![vec![]; kind.model.d256.len()];
    let mut dpd: Vec<Vec<process::Group>> = vec![vec![]; kind.model.dpd.len()];
    let mut gp: Vec<Vec<poisson::Group>> = vec![vec![]; kind.model.gp.len()];
    let mut nich: Vec<Vec<normal::Group>> = vec![vec![]; kind.model.nich.len()];
    while reader.try_read(&mut buffer)? {
        let mut decoder = Decoder::new(&buffer);
        counts.push(decoder.u32()?);
        for groups in bb.iter_mut() {
            groups.push(bernoulli::Group {
                heads: decoder.u32()?,
                tails: decoder.u32()?,
            });
        }
        for groups in d16.iter_mut() {
            groups.push(get_discrete_group(&mut decoder)?);
        }
        for groups in d256.iter_mut() {
            groups.push(get_discrete_group(&mut decoder)?);
        }
        for groups in dpd.iter_mut() {
            let mut group = process::Group::default();
            for _ in 0..decoder.len()? {
                let value = decoder.u32()?;
                let count = decoder.u32()?;
                group.counts.insert(value, count);
                group.total += count;
            }
            groups.push(group);
        }
        for groups in gp.iter_mut() {
            groups.push(poisson::Group {
                count: decoder.u32()?,
                sum: decoder.u32()?,
                log_prod: decoder.f32()?,
            });
        }
        for groups in nich.iter_mut() {
            groups.push(normal::Group {
                count: decoder.u32()?,
                mean: decoder.f32()?,
                count_times_variance: decoder.f32()?,
            });
        }
        decoder.done()?;
    }
    // reserves come after the loaded groups, then caches rebuild
    kind.mixture
        .init_unobserved(&kind.model, &counts, false, rng);
    install(&mut kind.mixture.bb, bb);
    install(&mut kind.mixture.d16, d16);
    install(&mut kind.mixture.d256, d256);
    install(&mut kind.mixture.dpd, dpd);
    install(&mut kind.mixture.gp, gp);
    install(&mut kind.mixture.nich, nich);
    for _ in 0..empty_group_count {
        kind.mixture.grow_reserve(&kind.model, rng);
    }
    kind.mixture.resume_cache(&kind.model, rng);
    kind.mixture.validate(&kind.model);
    Ok(())
}

fn install<F: crate::family::Family>(
    table: &mut crate::model::IndexedVector<FeatureMixture<F>>,
    loaded: Vec<Vec<F::Group>>,
) {
    for (feature, groups) in table.values_mut().iter_mut().zip(loaded.into_iter()) {
        feature.groups = groups;
    }
}

pub fn dump_mixtures(cross_cat: &CrossCat, dirname: &str) -> Result<()> {
    let sorted = cross_cat.sorted_groupids();
    std::fs::create_dir_all(dirname).map_err(Error::io(dirname))?;
    for (kindid, kind) in cross_cat.kinds.iter().enumerate() {
        dump_mixture(kind, &sorted[kindid], &mixture_filename(dirname, kindid))?;
    }
    Ok(())
}

pub fn load_mixtures(
    cross_cat: &mut CrossCat,
    dirname: &str,
    empty_group_count: usize,
    rng: &mut Rng,
) -> Result<()> {
    for (kindid, kind) in cross_cat.kinds.iter_mut().enumerate() {
        load_mixture(
            kind,
            &mixture_filename(dirname, kindid),
            empty_group_count,
            rng,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sample_row() -> Row {
        Row {
            id: 42,
            diff: Diff {
                pos: ProductValue {
                    observed: Observed::Sparse(vec![1, 4]),
                    booleans: vec![true],
                    counts: vec![],
                    reals: vec![2.5],
                },
                neg: ProductValue {
                    observed: Observed::None,
                    ..Default::default()
                },
                tares: vec![0],
            },
        }
    }

    #[test]
    fn rows_round_trip() {
        let row = sample_row();
        let bytes = encode_row(&row);
        assert_eq!(decode_row(&bytes).unwrap(), row);
        assert_eq!(peek_row_id(&bytes).unwrap(), 42);
    }

    #[test]
    fn checkpoints_round_trip() {
        let checkpoint = Checkpoint {
            seed: 7,
            row_count: 100,
            tardis_iter: 3,
            unassigned_pos: 1280,
            assigned_pos: 256,
            schedule: ScheduleState {
                annealing_state: -0.5,
                stale: 10,
                fresh: 3,
                reject_count: 2,
                disabled: false,
            },
            finished: true,
        };
        let bytes = encode_checkpoint(&checkpoint);
        assert_eq!(decode_checkpoint(&bytes).unwrap(), checkpoint);
    }

    #[test]
    fn truncation_is_a_parse_error() {
        let bytes = encode_row(&sample_row());
        assert!(matches!(
            decode_row(&bytes[..bytes.len() - 1]),
            Err(Error::Parse(_))
        ));
    }

    fn sample_cross_cat() -> CrossCat {
        let mut first = ProductModel::default();
        first.bb.insert(0, bernoulli::Shared { alpha: 0.7, beta: 1.3 });
        first.d16.insert(2, discrete::Shared::uniform(3));
        first.update_schema();
        let mut second = ProductModel::default();
        second.bb.insert(1, bernoulli::Shared::default());
        second.gp.insert(3, poisson::Shared::default());
        second.nich.insert(4, normal::Shared::default());
        second.update_schema();
        let tare = ProductValue {
            observed: Observed::Sparse(vec![0]),
            booleans: vec![false],
            counts: vec![],
            reals: vec![],
        };
        assemble(
            PitmanYor { alpha: 2.0, d: 0.25 },
            HyperPrior::default(),
            vec![tare],
            vec![first, second],
        )
    }

    #[test]
    fn model_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pbs").to_string_lossy().into_owned();
        let cross_cat = sample_cross_cat();
        dump_model(&cross_cat, &path).unwrap();
        let loaded = load_model(&path).unwrap();
        assert_eq!(loaded.schema, cross_cat.schema);
        assert_eq!(loaded.topology, cross_cat.topology);
        assert_eq!(loaded.tares, cross_cat.tares);
        assert_eq!(loaded.feature_to_kind, cross_cat.feature_to_kind);
        for (a, b) in loaded.kinds.iter().zip(cross_cat.kinds.iter()) {
            assert_eq!(a.model, b.model);
            assert_eq!(a.features, b.features);
        }
    }

    #[test]
    fn mixture_files_round_trip_in_popularity_order() {
        let mut rng = Rng::seed_from_u64(0);
        let dir = tempfile::tempdir().unwrap();
        let dirname = dir.path().join("groups").to_string_lossy().into_owned();
        let mut cross_cat = sample_cross_cat();
        cross_cat.mixture_init_unobserved(1, &mut rng);
        let schema = cross_cat.schema;
        let full = ProductValue {
            observed: Observed::All,
            booleans: vec![true, false],
            counts: vec![1, 3],
            reals: vec![0.5],
        };
        assert_eq!(schema.total(), 5);
        let mut partials = vec![];
        cross_cat.value_split(&full, &mut partials);
        for (kind, partial) in cross_cat.kinds.iter_mut().zip(partials.iter()) {
            kind.mixture.add_value(&kind.model, 0, partial, &mut rng);
            kind.mixture.add_value(&kind.model, 1, partial, &mut rng);
            kind.mixture.add_value(&kind.model, 0, partial, &mut rng);
        }
        dump_mixtures(&cross_cat, &dirname).unwrap();

        let mut reloaded = sample_cross_cat();
        load_mixtures(&mut reloaded, &dirname, 1, &mut rng).unwrap();
        for (kind, original) in reloaded.kinds.iter().zip(cross_cat.kinds.iter()) {
            // counts arrive sorted, most popular first, reserves appended
            assert_eq!(kind.mixture.clustering.counts(), &[2, 1, 0]);
            assert_eq!(
                kind.mixture.count_rows(),
                original.mixture.count_rows()
            );
            kind.mixture.validate(&kind.model);
        }
    }

    #[test]
    fn unknown_feature_gaps_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pbs").to_string_lossy().into_owned();
        let mut gapped = ProductModel::default();
        gapped.bb.insert(0, bernoulli::Shared::default());
        gapped.bb.insert(2, bernoulli::Shared::default());
        gapped.update_schema();
        let cross_cat = assemble(
            PitmanYor::default(),
            HyperPrior::default(),
            vec![],
            vec![gapped],
        );
        dump_model(&cross_cat, &path).unwrap();
        assert!(matches!(load_model(&path), Err(Error::UnknownFeature(1))));
    }
}
