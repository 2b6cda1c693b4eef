use super::indexed::IndexedVector;
use super::product::FamilyKind;
use super::product::ProductModel;
use super::tracker::IdTracker;
use crate::family::bernoulli::Bernoulli;
use crate::family::discrete::D16;
use crate::family::discrete::D256;
use crate::family::normal::Normal;
use crate::family::poisson::Poisson;
use crate::family::process::Process;
use crate::family::Clustering;
use crate::family::Family;
use crate::family::FeatureMixture;
use crate::value::product::read_value;
use crate::value::product::write_value;
use crate::value::product::SlotConsumer;
use crate::value::product::SlotProducer;
use crate::value::Diff;
use crate::value::ProductValue;
use crate::FeatureId;
use crate::GroupId;
use crate::Rng;
use crate::Score;

/// how the tare cache batches work. the primary cross-cat kinds keep
/// per-group tare scores in sync with every mutation; the kind proposer
/// accumulates pending tare counts and applies them in bulk at the end
/// of a pipelined step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Cached,
    Lazy,
}

/// per-tare memo, one entry per tare: score per group in Cached mode,
/// pending addition count per group in Lazy mode
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TareCache {
    pub scores: Vec<Score>,
    pub counts: Vec<u32>,
}

/// one kind's groups: clustering counts, per-feature sufficient
/// statistics, the tare cache, and the packed/global id mapping
#[derive(Debug, Clone, PartialEq)]
pub struct ProductMixture {
    pub clustering: Clustering,
    pub bb: IndexedVector<FeatureMixture<Bernoulli>>,
    pub d16: IndexedVector<FeatureMixture<D16>>,
    pub d256: IndexedVector<FeatureMixture<D256>>,
    pub dpd: IndexedVector<FeatureMixture<Process>>,
    pub gp: IndexedVector<FeatureMixture<Poisson>>,
    pub nich: IndexedVector<FeatureMixture<Normal>>,
    pub tare_caches: Vec<TareCache>,
    pub id_tracker: IdTracker,
    pub maintaining_cache: bool,
    pub mode: CacheMode,
}

impl ProductMixture {
    pub fn new(mode: CacheMode) -> Self {
        Self {
            clustering: Clustering::default(),
            bb: IndexedVector::default(),
            d16: IndexedVector::default(),
            d256: IndexedVector::default(),
            dpd: IndexedVector::default(),
            gp: IndexedVector::default(),
            nich: IndexedVector::default(),
            tare_caches: vec![],
            id_tracker: IdTracker::default(),
            maintaining_cache: false,
            mode: CacheMode::Cached,
        }
        .with_mode(mode)
    }

    fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn group_count(&self) -> usize {
        self.clustering.group_count()
    }

    pub fn count_rows(&self) -> usize {
        self.clustering.count_rows()
    }

    /// build fresh groups for every feature of the model, with the given
    /// clustering counts and no absorbed data. caches come up only when
    /// `maintaining` is set; bulk rewires init with it off and resume later.
    pub fn init_unobserved(
        &mut self,
        model: &ProductModel,
        counts: &[u32],
        maintaining: bool,
        rng: &mut Rng,
    ) {
        let group_count = counts.len();
        self.clustering = Clustering::init(counts.to_vec());
        self.bb.clear();
        for (id, shared) in model.bb.iter() {
            self.bb
                .insert(id, FeatureMixture::init_groups(shared, group_count, rng));
        }
        self.d16.clear();
        for (id, shared) in model.d16.iter() {
            self.d16
                .insert(id, FeatureMixture::init_groups(shared, group_count, rng));
        }
        self.d256.clear();
        for (id, shared) in model.d256.iter() {
            self.d256
                .insert(id, FeatureMixture::init_groups(shared, group_count, rng));
        }
        self.dpd.clear();
        for (id, shared) in model.dpd.iter() {
            self.dpd
                .insert(id, FeatureMixture::init_groups(shared, group_count, rng));
        }
        self.gp.clear();
        for (id, shared) in model.gp.iter() {
            self.gp
                .insert(id, FeatureMixture::init_groups(shared, group_count, rng));
        }
        self.nich.clear();
        for (id, shared) in model.nich.iter() {
            self.nich
                .insert(id, FeatureMixture::init_groups(shared, group_count, rng));
        }
        self.maintaining_cache = maintaining;
        self.tare_caches.clear();
        self.id_tracker.init(group_count);
        self.init_tare_cache(model, rng);
        self.validate(model);
    }

    /// drop the tare caches while features are rewired in bulk
    pub fn suspend_cache(&mut self) {
        self.maintaining_cache = false;
        self.tare_caches.clear();
    }

    /// rebuild the tare caches after a rewire or hyperparameter change
    pub fn resume_cache(&mut self, model: &ProductModel, rng: &mut Rng) {
        self.maintaining_cache = true;
        self.init_tare_cache(model, rng);
    }

    //------------------------------------------------------------------
    // add / remove

    pub fn add_value(
        &mut self,
        model: &ProductModel,
        groupid: GroupId,
        value: &ProductValue,
        rng: &mut Rng,
    ) {
        debug_assert!(self.maintaining_cache, "cache is not being maintained");
        let grew = self.clustering.add_value(groupid);
        let layout = model.layout();
        let mut fun = AddValue {
            mixture: &mut *self,
            model,
            groupid,
            rng: &mut *rng,
        };
        read_value(&mut fun, &layout, value);
        if grew {
            self.append_group(model, rng);
            self.validate(model);
        }
    }

    pub fn remove_value(
        &mut self,
        model: &ProductModel,
        groupid: GroupId,
        value: &ProductValue,
        rng: &mut Rng,
    ) {
        debug_assert!(self.maintaining_cache, "cache is not being maintained");
        let emptied = self.clustering.remove_value(groupid);
        let layout = model.layout();
        let mut fun = RemoveValue {
            mixture: &mut *self,
            model,
            groupid,
            rng: &mut *rng,
        };
        read_value(&mut fun, &layout, value);
        if emptied {
            self.drop_group(groupid);
            self.validate(model);
        }
    }

    pub fn add_diff(&mut self, model: &ProductModel, groupid: GroupId, diff: &Diff, rng: &mut Rng) {
        debug_assert_eq!(self.mode, CacheMode::Cached);
        debug_assert!(self.maintaining_cache, "cache is not being maintained");
        let grew = self.clustering.add_value(groupid);
        let layout = model.layout();
        {
            let mut fun = AddValue {
                mixture: &mut *self,
                model,
                groupid,
                rng: &mut *rng,
            };
            for id in diff.tares.iter() {
                read_value(&mut fun, &layout, &model.tares[*id as usize]);
            }
            read_value(&mut fun, &layout, &diff.pos);
        }
        {
            let mut fun = RemoveValue {
                mixture: &mut *self,
                model,
                groupid,
                rng: &mut *rng,
            };
            read_value(&mut fun, &layout, &diff.neg);
        }
        self.update_tare_scores(model, groupid, rng);
        if grew {
            self.append_group(model, rng);
            self.validate(model);
        }
    }

    pub fn remove_diff(
        &mut self,
        model: &ProductModel,
        groupid: GroupId,
        diff: &Diff,
        rng: &mut Rng,
    ) {
        debug_assert_eq!(self.mode, CacheMode::Cached);
        debug_assert!(self.maintaining_cache, "cache is not being maintained");
        let emptied = self.clustering.remove_value(groupid);
        let layout = model.layout();
        {
            let mut fun = AddValue {
                mixture: &mut *self,
                model,
                groupid,
                rng: &mut *rng,
            };
            read_value(&mut fun, &layout, &diff.neg);
        }
        {
            let mut fun = RemoveValue {
                mixture: &mut *self,
                model,
                groupid,
                rng: &mut *rng,
            };
            read_value(&mut fun, &layout, &diff.pos);
            for id in diff.tares.iter() {
                read_value(&mut fun, &layout, &model.tares[*id as usize]);
            }
        }
        if emptied {
            self.drop_group(groupid);
            self.validate(model);
        } else {
            self.update_tare_scores(model, groupid, rng);
        }
    }

    /// Lazy half of a diff add: pos and neg land now, the tare
    /// contribution is queued per group for the bulk flush
    pub fn add_diff_deferred(
        &mut self,
        model: &ProductModel,
        groupid: GroupId,
        diff: &Diff,
        rng: &mut Rng,
    ) {
        debug_assert_eq!(self.mode, CacheMode::Lazy);
        let grew = self.clustering.add_value(groupid);
        let layout = model.layout();
        {
            let mut fun = AddValue {
                mixture: &mut *self,
                model,
                groupid,
                rng: &mut *rng,
            };
            read_value(&mut fun, &layout, &diff.pos);
        }
        {
            let mut fun = RemoveValue {
                mixture: &mut *self,
                model,
                groupid,
                rng: &mut *rng,
            };
            read_value(&mut fun, &layout, &diff.neg);
        }
        for id in diff.tares.iter() {
            self.tare_caches[*id as usize].counts[groupid] += 1;
        }
        if grew {
            self.append_group(model, rng);
        }
    }

    /// apply every queued tare addition with the repeated-value fast
    /// path, then clear the queues
    pub fn flush_tares(&mut self, model: &ProductModel, rng: &mut Rng) {
        debug_assert_eq!(self.mode, CacheMode::Lazy);
        debug_assert_eq!(self.tare_caches.len(), model.tares.len());
        let layout = model.layout();
        for id in 0..model.tares.len() {
            let counts = std::mem::take(&mut self.tare_caches[id].counts);
            {
                let mut fun = AddRepeated {
                    mixture: &mut *self,
                    model,
                    counts: &counts,
                    rng: &mut *rng,
                };
                read_value(&mut fun, &layout, &model.tares[id]);
            }
            self.tare_caches[id].counts = vec![0; counts.len()];
        }
    }

    /// Lazy removal: only the clustering count moves; the removed row's
    /// statistics predate the last rebuild and were never absorbed here
    pub fn remove_unobserved_value(&mut self, _model: &ProductModel, groupid: GroupId) {
        debug_assert_eq!(self.mode, CacheMode::Lazy);
        let emptied = self.clustering.remove_value(groupid);
        if emptied {
            self.drop_group(groupid);
        }
    }

    /// loader hook: append an empty reserve group after reading a
    /// groups file
    pub fn grow_reserve(&mut self, model: &ProductModel, rng: &mut Rng) {
        self.append_group(model, rng);
    }

    /// append one fresh reserve group in every table and cache
    fn append_group(&mut self, model: &ProductModel, rng: &mut Rng) {
        self.clustering.append_empty();
        for (pos, mixture) in self.bb.values_mut().iter_mut().enumerate() {
            mixture.add_group(model.bb.get(pos), rng);
        }
        for (pos, mixture) in self.d16.values_mut().iter_mut().enumerate() {
            mixture.add_group(model.d16.get(pos), rng);
        }
        for (pos, mixture) in self.d256.values_mut().iter_mut().enumerate() {
            mixture.add_group(model.d256.get(pos), rng);
        }
        for (pos, mixture) in self.dpd.values_mut().iter_mut().enumerate() {
            mixture.add_group(model.dpd.get(pos), rng);
        }
        for (pos, mixture) in self.gp.values_mut().iter_mut().enumerate() {
            mixture.add_group(model.gp.get(pos), rng);
        }
        for (pos, mixture) in self.nich.values_mut().iter_mut().enumerate() {
            mixture.add_group(model.nich.get(pos), rng);
        }
        self.id_tracker.add_group();
        match self.mode {
            CacheMode::Cached => {
                for cache in self.tare_caches.iter_mut() {
                    cache.scores.push(0.0);
                }
                let tail = self.group_count() - 1;
                self.update_tare_scores(model, tail, rng);
            }
            CacheMode::Lazy => {
                for cache in self.tare_caches.iter_mut() {
                    cache.counts.push(0);
                }
            }
        }
    }

    /// swap-remove an emptied group from every table and cache
    fn drop_group(&mut self, groupid: GroupId) {
        self.clustering.swap_remove(groupid);
        for mixture in self.bb.values_mut() {
            mixture.remove_group(groupid);
        }
        for mixture in self.d16.values_mut() {
            mixture.remove_group(groupid);
        }
        for mixture in self.d256.values_mut() {
            mixture.remove_group(groupid);
        }
        for mixture in self.dpd.values_mut() {
            mixture.remove_group(groupid);
        }
        for mixture in self.gp.values_mut() {
            mixture.remove_group(groupid);
        }
        for mixture in self.nich.values_mut() {
            mixture.remove_group(groupid);
        }
        for cache in self.tare_caches.iter_mut() {
            match self.mode {
                CacheMode::Cached => {
                    cache.scores.swap_remove(groupid);
                }
                CacheMode::Lazy => {
                    cache.counts.swap_remove(groupid);
                }
            }
        }
        self.id_tracker.remove_group(groupid);
    }

    //------------------------------------------------------------------
    // scoring

    /// one log likelihood per group: clustering prior plus the additive
    /// per-feature predictive scores
    pub fn score_value(
        &self,
        model: &ProductModel,
        value: &ProductValue,
        scores: &mut Vec<Score>,
        rng: &mut Rng,
    ) {
        debug_assert!(self.maintaining_cache, "cache is not being maintained");
        scores.resize(self.group_count(), 0.0);
        self.clustering.score_value(&model.clustering, scores);
        let mut fun = ScoreValue {
            mixture: self,
            scores: &mut scores[..],
            model,
            rng: &mut *rng,
        };
        read_value(&mut fun, &model.layout(), value);
    }

    /// score_value(pos) - score_value(neg) + Σ cached tare scores. the
    /// neg contribution folds in by negating the scratch vector around a
    /// plain read_value pass, keeping one driver on the hot path.
    pub fn score_diff(
        &self,
        model: &ProductModel,
        diff: &Diff,
        scores: &mut Vec<Score>,
        rng: &mut Rng,
    ) {
        debug_assert_eq!(self.mode, CacheMode::Cached);
        debug_assert!(self.maintaining_cache, "cache is not being maintained");
        scores.resize(self.group_count(), 0.0);
        self.clustering.score_value(&model.clustering, scores);
        let layout = model.layout();
        {
            let mut fun = ScoreValue {
                mixture: self,
                scores: &mut scores[..],
                model,
                rng: &mut *rng,
            };
            read_value(&mut fun, &layout, &diff.pos);
        }
        if diff.neg.observed.count(model.schema.total()) > 0 {
            for score in scores.iter_mut() {
                *score = -*score;
            }
            let mut fun = ScoreValue {
                mixture: self,
                scores: &mut scores[..],
                model,
                rng: &mut *rng,
            };
            read_value(&mut fun, &layout, &diff.neg);
            for score in scores.iter_mut() {
                *score = -*score;
            }
        }
        for id in diff.tares.iter() {
            let cached = &self.tare_caches[*id as usize].scores;
            debug_assert_eq!(cached.len(), scores.len());
            for (score, tare) in scores.iter_mut().zip(cached.iter()) {
                *score += tare;
            }
        }
    }

    /// per-feature sum of predictive scores for one group, without the
    /// clustering prior
    pub fn score_value_group(
        &self,
        model: &ProductModel,
        groupid: GroupId,
        value: &ProductValue,
        rng: &mut Rng,
    ) -> Score {
        let mut fun = ScoreGroup {
            mixture: self,
            model,
            groupid,
            score: 0.0,
            rng: &mut *rng,
        };
        read_value(&mut fun, &model.layout(), value);
        fun.score
    }

    /// log marginal of one feature's data under this kind's partition
    pub fn score_feature(&self, model: &ProductModel, featureid: FeatureId, rng: &mut Rng) -> Score {
        match model.family_of(featureid).expect("feature belongs to this kind") {
            FamilyKind::Bb => {
                let pos = model.bb.position(featureid).expect("aligned tables");
                self.bb.get(pos).score_data(model.bb.get(pos), rng)
            }
            FamilyKind::D16 => {
                let pos = model.d16.position(featureid).expect("aligned tables");
                self.d16.get(pos).score_data(model.d16.get(pos), rng)
            }
            FamilyKind::D256 => {
                let pos = model.d256.position(featureid).expect("aligned tables");
                self.d256.get(pos).score_data(model.d256.get(pos), rng)
            }
            FamilyKind::Dpd => {
                let pos = model.dpd.position(featureid).expect("aligned tables");
                self.dpd.get(pos).score_data(model.dpd.get(pos), rng)
            }
            FamilyKind::Gp => {
                let pos = model.gp.position(featureid).expect("aligned tables");
                self.gp.get(pos).score_data(model.gp.get(pos), rng)
            }
            FamilyKind::Nich => {
                let pos = model.nich.position(featureid).expect("aligned tables");
                self.nich.get(pos).score_data(model.nich.get(pos), rng)
            }
        }
    }

    /// log marginal of all data in this kind: clustering plus features
    pub fn score_data(&self, model: &ProductModel, rng: &mut Rng) -> Score {
        let mut score = self.clustering.score_data(&model.clustering);
        for (pos, mixture) in self.bb.values().iter().enumerate() {
            score += mixture.score_data(model.bb.get(pos), rng);
        }
        for (pos, mixture) in self.d16.values().iter().enumerate() {
            score += mixture.score_data(model.d16.get(pos), rng);
        }
        for (pos, mixture) in self.d256.values().iter().enumerate() {
            score += mixture.score_data(model.d256.get(pos), rng);
        }
        for (pos, mixture) in self.dpd.values().iter().enumerate() {
            score += mixture.score_data(model.dpd.get(pos), rng);
        }
        for (pos, mixture) in self.gp.values().iter().enumerate() {
            score += mixture.score_data(model.gp.get(pos), rng);
        }
        for (pos, mixture) in self.nich.values().iter().enumerate() {
            score += mixture.score_data(model.nich.get(pos), rng);
        }
        score
    }

    /// draw a group id from the likelihoods, then one value per observed
    /// slot from that group's posterior predictive
    pub fn sample_value(
        &self,
        model: &ProductModel,
        likelihoods: &[Score],
        value: &mut ProductValue,
        rng: &mut Rng,
    ) -> GroupId {
        let total = likelihoods.iter().sum();
        let groupid = crate::numeric::sample_from_likelihoods(rng, likelihoods, total);
        let mut fun = SampleGroup {
            mixture: self,
            model,
            groupid,
            rng: &mut *rng,
        };
        write_value(&mut fun, &model.layout(), value);
        groupid
    }

    //------------------------------------------------------------------
    // tare cache maintenance

    fn init_tare_cache(&mut self, model: &ProductModel, rng: &mut Rng) {
        if !self.maintaining_cache {
            return;
        }
        let group_count = self.group_count();
        self.tare_caches = vec![TareCache::default(); model.tares.len()];
        match self.mode {
            CacheMode::Cached => {
                for id in 0..model.tares.len() {
                    let mut scores = vec![0.0; group_count];
                    let mut fun = ScoreValue {
                        mixture: self,
                        scores: &mut scores[..],
                        model,
                        rng: &mut *rng,
                    };
                    read_value(&mut fun, &model.layout(), &model.tares[id]);
                    self.tare_caches[id].scores = scores;
                }
            }
            CacheMode::Lazy => {
                for cache in self.tare_caches.iter_mut() {
                    cache.counts = vec![0; group_count];
                }
            }
        }
    }

    fn update_tare_scores(&mut self, model: &ProductModel, groupid: GroupId, rng: &mut Rng) {
        if self.mode != CacheMode::Cached || !self.maintaining_cache {
            return;
        }
        debug_assert_eq!(self.tare_caches.len(), model.tares.len());
        for id in 0..model.tares.len() {
            let score = self.score_value_group(model, groupid, &model.tares[id], rng);
            self.tare_caches[id].scores[groupid] = score;
        }
    }

    //------------------------------------------------------------------
    // feature moves

    /// splice one feature out of its old kind and into a new kind. the
    /// receiver is the proposer mixture that already holds the feature's
    /// statistics under the destination kind's partition; those become
    /// the destination's groups. every cache involved must be suspended.
    pub fn move_feature_to(
        &mut self,
        featureid: FeatureId,
        source_model: &mut ProductModel,
        source_mixture: &mut ProductMixture,
        destin_model: &mut ProductModel,
        destin_mixture: &mut ProductMixture,
    ) {
        debug_assert!(!self.maintaining_cache, "proposer cache must be suspended");
        debug_assert!(!source_mixture.maintaining_cache, "source cache must be suspended");
        debug_assert!(!destin_mixture.maintaining_cache, "destin cache must be suspended");
        debug_assert_eq!(
            destin_mixture.group_count(),
            self.group_count(),
            "proposer and destination disagree on groups"
        );
        macro_rules! splice {
            ($table:ident) => {{
                let shared = source_model.$table.remove(featureid);
                destin_model.$table.insert(featureid, shared);
                source_mixture.$table.remove(featureid);
                let moved = self.$table.find_mut(featureid).expect("proposer holds every feature");
                let groups = std::mem::take(&mut moved.groups);
                destin_mixture
                    .$table
                    .insert(featureid, FeatureMixture { groups });
            }};
        }
        match source_model.family_of(featureid).expect("feature is somewhere") {
            FamilyKind::Bb => splice!(bb),
            FamilyKind::D16 => splice!(d16),
            FamilyKind::D256 => splice!(d256),
            FamilyKind::Dpd => splice!(dpd),
            FamilyKind::Gp => splice!(gp),
            FamilyKind::Nich => splice!(nich),
        }
        source_model.update_schema();
        destin_model.update_schema();
    }

    //------------------------------------------------------------------

    pub fn validate(&self, model: &ProductModel) {
        debug_assert_eq!(self.bb.len(), model.bb.len());
        debug_assert_eq!(self.d16.len(), model.d16.len());
        debug_assert_eq!(self.d256.len(), model.d256.len());
        debug_assert_eq!(self.dpd.len(), model.dpd.len());
        debug_assert_eq!(self.gp.len(), model.gp.len());
        debug_assert_eq!(self.nich.len(), model.nich.len());
        let group_count = self.group_count();
        debug_assert!(self.bb.values().iter().all(|m| m.groups.len() == group_count));
        debug_assert!(self.d16.values().iter().all(|m| m.groups.len() == group_count));
        debug_assert!(self.d256.values().iter().all(|m| m.groups.len() == group_count));
        debug_assert!(self.dpd.values().iter().all(|m| m.groups.len() == group_count));
        debug_assert!(self.gp.values().iter().all(|m| m.groups.len() == group_count));
        debug_assert!(self.nich.values().iter().all(|m| m.groups.len() == group_count));
        debug_assert_eq!(self.id_tracker.packed_size(), group_count);
        if self.maintaining_cache {
            debug_assert_eq!(self.tare_caches.len(), model.tares.len());
            for cache in self.tare_caches.iter() {
                match self.mode {
                    CacheMode::Cached => {
                        debug_assert_eq!(cache.scores.len(), group_count);
                        debug_assert_eq!(cache.counts.len(), 0);
                    }
                    CacheMode::Lazy => {
                        debug_assert_eq!(cache.scores.len(), 0);
                        debug_assert_eq!(cache.counts.len(), group_count);
                    }
                }
            }
        } else {
            debug_assert!(self.tare_caches.is_empty());
        }
    }
}

//----------------------------------------------------------------------------
// slot visitors

struct AddValue<'a> {
    mixture: &'a mut ProductMixture,
    model: &'a ProductModel,
    groupid: GroupId,
    rng: &'a mut Rng,
}

impl SlotConsumer for AddValue<'_> {
    fn bb(&mut self, i: usize, x: bool) {
        self.mixture
            .bb
            .get_mut(i)
            .add_value(self.model.bb.get(i), self.groupid, x, self.rng);
    }
    fn d16(&mut self, i: usize, x: u32) {
        self.mixture
            .d16
            .get_mut(i)
            .add_value(self.model.d16.get(i), self.groupid, x, self.rng);
    }
    fn d256(&mut self, i: usize, x: u32) {
        self.mixture
            .d256
            .get_mut(i)
            .add_value(self.model.d256.get(i), self.groupid, x, self.rng);
    }
    fn dpd(&mut self, i: usize, x: u32) {
        self.mixture
            .dpd
            .get_mut(i)
            .add_value(self.model.dpd.get(i), self.groupid, x, self.rng);
    }
    fn gp(&mut self, i: usize, x: u32) {
        self.mixture
            .gp
            .get_mut(i)
            .add_value(self.model.gp.get(i), self.groupid, x, self.rng);
    }
    fn nich(&mut self, i: usize, x: f32) {
        self.mixture
            .nich
            .get_mut(i)
            .add_value(self.model.nich.get(i), self.groupid, x, self.rng);
    }
}

struct RemoveValue<'a> {
    mixture: &'a mut ProductMixture,
    model: &'a ProductModel,
    groupid: GroupId,
    rng: &'a mut Rng,
}

impl SlotConsumer for RemoveValue<'_> {
    fn bb(&mut self, i: usize, x: bool) {
        self.mixture
            .bb
            .get_mut(i)
            .remove_value(self.model.bb.get(i), self.groupid, x, self.rng);
    }
    fn d16(&mut self, i: usize, x: u32) {
        self.mixture
            .d16
            .get_mut(i)
            .remove_value(self.model.d16.get(i), self.groupid, x, self.rng);
    }
    fn d256(&mut self, i: usize, x: u32) {
        self.mixture
            .d256
            .get_mut(i)
            .remove_value(self.model.d256.get(i), self.groupid, x, self.rng);
    }
    fn dpd(&mut self, i: usize, x: u32) {
        self.mixture
            .dpd
            .get_mut(i)
            .remove_value(self.model.dpd.get(i), self.groupid, x, self.rng);
    }
    fn gp(&mut self, i: usize, x: u32) {
        self.mixture
            .gp
            .get_mut(i)
            .remove_value(self.model.gp.get(i), self.groupid, x, self.rng);
    }
    fn nich(&mut self, i: usize, x: f32) {
        self.mixture
            .nich
            .get_mut(i)
            .remove_value(self.model.nich.get(i), self.groupid, x, self.rng);
    }
}

struct AddRepeated<'a> {
    mixture: &'a mut ProductMixture,
    model: &'a ProductModel,
    counts: &'a [u32],
    rng: &'a mut Rng,
}

impl AddRepeated<'_> {
    fn spread<F: Family>(
        groups: &mut FeatureMixture<F>,
        shared: &F::Shared,
        counts: &[u32],
        value: F::Value,
        rng: &mut Rng,
    ) {
        debug_assert_eq!(counts.len(), groups.groups.len());
        for (group, count) in groups.groups.iter_mut().zip(counts.iter()) {
            if *count > 0 {
                F::add_repeated_value(shared, group, value, *count, rng);
            }
        }
    }
}

impl SlotConsumer for AddRepeated<'_> {
    fn bb(&mut self, i: usize, x: bool) {
        Self::spread(self.mixture.bb.get_mut(i), self.model.bb.get(i), self.counts, x, self.rng);
    }
    fn d16(&mut self, i: usize, x: u32) {
        Self::spread(self.mixture.d16.get_mut(i), self.model.d16.get(i), self.counts, x, self.rng);
    }
    fn d256(&mut self, i: usize, x: u32) {
        Self::spread(self.mixture.d256.get_mut(i), self.model.d256.get(i), self.counts, x, self.rng);
    }
    fn dpd(&mut self, i: usize, x: u32) {
        Self::spread(self.mixture.dpd.get_mut(i), self.model.dpd.get(i), self.counts, x, self.rng);
    }
    fn gp(&mut self, i: usize, x: u32) {
        Self::spread(self.mixture.gp.get_mut(i), self.model.gp.get(i), self.counts, x, self.rng);
    }
    fn nich(&mut self, i: usize, x: f32) {
        Self::spread(self.mixture.nich.get_mut(i), self.model.nich.get(i), self.counts, x, self.rng);
    }
}

struct ScoreValue<'a> {
    mixture: &'a ProductMixture,
    model: &'a ProductModel,
    scores: &'a mut [Score],
    rng: &'a mut Rng,
}

impl SlotConsumer for ScoreValue<'_> {
    fn bb(&mut self, i: usize, x: bool) {
        self.mixture
            .bb
            .get(i)
            .score_value(self.model.bb.get(i), x, self.scores, self.rng);
    }
    fn d16(&mut self, i: usize, x: u32) {
        self.mixture
            .d16
            .get(i)
            .score_value(self.model.d16.get(i), x, self.scores, self.rng);
    }
    fn d256(&mut self, i: usize, x: u32) {
        self.mixture
            .d256
            .get(i)
            .score_value(self.model.d256.get(i), x, self.scores, self.rng);
    }
    fn dpd(&mut self, i: usize, x: u32) {
        self.mixture
            .dpd
            .get(i)
            .score_value(self.model.dpd.get(i), x, self.scores, self.rng);
    }
    fn gp(&mut self, i: usize, x: u32) {
        self.mixture
            .gp
            .get(i)
            .score_value(self.model.gp.get(i), x, self.scores, self.rng);
    }
    fn nich(&mut self, i: usize, x: f32) {
        self.mixture
            .nich
            .get(i)
            .score_value(self.model.nich.get(i), x, self.scores, self.rng);
    }
}

struct ScoreGroup<'a> {
    mixture: &'a ProductMixture,
    model: &'a ProductModel,
    groupid: GroupId,
    score: Score,
    rng: &'a mut Rng,
}

impl SlotConsumer for ScoreGroup<'_> {
    fn bb(&mut self, i: usize, x: bool) {
        self.score += self
            .mixture
            .bb
            .get(i)
            .score_value_group(self.model.bb.get(i), self.groupid, x, self.rng);
    }
    fn d16(&mut self, i: usize, x: u32) {
        self.score += self
            .mixture
            .d16
            .get(i)
            .score_value_group(self.model.d16.get(i), self.groupid, x, self.rng);
    }
    fn d256(&mut self, i: usize, x: u32) {
        self.score += self
            .mixture
            .d256
            .get(i)
            .score_value_group(self.model.d256.get(i), self.groupid, x, self.rng);
    }
    fn dpd(&mut self, i: usize, x: u32) {
        self.score += self
            .mixture
            .dpd
            .get(i)
            .score_value_group(self.model.dpd.get(i), self.groupid, x, self.rng);
    }
    fn gp(&mut self, i: usize, x: u32) {
        self.score += self
            .mixture
            .gp
            .get(i)
            .score_value_group(self.model.gp.get(i), self.groupid, x, self.rng);
    }
    fn nich(&mut self, i: usize, x: f32) {
        self.score += self
            .mixture
            .nich
            .get(i)
            .score_value_group(self.model.nich.get(i), self.groupid, x, self.rng);
    }
}

struct SampleGroup<'a> {
    mixture: &'a ProductMixture,
    model: &'a ProductModel,
    groupid: GroupId,
    rng: &'a mut Rng,
}

impl SlotProducer for SampleGroup<'_> {
    fn bb(&mut self, i: usize) -> bool {
        self.mixture
            .bb
            .get(i)
            .sample_value(self.model.bb.get(i), self.groupid, self.rng)
    }
    fn d16(&mut self, i: usize) -> u32 {
        self.mixture
            .d16
            .get(i)
            .sample_value(self.model.d16.get(i), self.groupid, self.rng)
    }
    fn d256(&mut self, i: usize) -> u32 {
        self.mixture
            .d256
            .get(i)
            .sample_value(self.model.d256.get(i), self.groupid, self.rng)
    }
    fn dpd(&mut self, i: usize) -> u32 {
        self.mixture
            .dpd
            .get(i)
            .sample_value(self.model.dpd.get(i), self.groupid, self.rng)
    }
    fn gp(&mut self, i: usize) -> u32 {
        self.mixture
            .gp
            .get(i)
            .sample_value(self.model.gp.get(i), self.groupid, self.rng)
    }
    fn nich(&mut self, i: usize) -> f32 {
        self.mixture
            .nich
            .get(i)
            .sample_value(self.model.nich.get(i), self.groupid, self.rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::bernoulli;
    use crate::numeric::log_sum_exp;
    use crate::value::Observed;
    use rand::SeedableRng;

    fn boolean_model() -> ProductModel {
        let mut model = ProductModel::default();
        model.bb.insert(0, bernoulli::Shared::default());
        model.update_schema();
        model
    }

    fn boolean_value(x: bool) -> ProductValue {
        ProductValue {
            observed: Observed::All,
            booleans: vec![x],
            counts: vec![],
            reals: vec![],
        }
    }

    #[test]
    fn reserve_group_appends_on_occupation() {
        let mut rng = Rng::seed_from_u64(0);
        let model = boolean_model();
        let mut mixture = ProductMixture::new(CacheMode::Cached);
        mixture.init_unobserved(&model, &[0], true, &mut rng);
        assert_eq!(mixture.group_count(), 1);
        mixture.add_value(&model, 0, &boolean_value(true), &mut rng);
        // the only reserve was occupied, so a new one appeared
        assert_eq!(mixture.group_count(), 2);
        assert_eq!(mixture.clustering.counts(), &[1, 0]);
        assert_eq!(mixture.id_tracker.packed_size(), 2);
    }

    #[test]
    fn emptied_group_swap_removes_everywhere() {
        let mut rng = Rng::seed_from_u64(0);
        let model = boolean_model();
        let mut mixture = ProductMixture::new(CacheMode::Cached);
        mixture.init_unobserved(&model, &[0], true, &mut rng);
        mixture.add_value(&model, 0, &boolean_value(true), &mut rng);
        mixture.add_value(&model, 1, &boolean_value(false), &mut rng);
        assert_eq!(mixture.group_count(), 3);
        let global_of_tail = mixture.id_tracker.packed_to_global(2);
        mixture.remove_value(&model, 0, &boolean_value(true), &mut rng);
        assert_eq!(mixture.group_count(), 2);
        assert_eq!(mixture.id_tracker.packed_to_global(0), global_of_tail);
    }

    #[test]
    fn add_then_remove_is_bit_identical() {
        let mut rng = Rng::seed_from_u64(0);
        let model = boolean_model();
        let mut mixture = ProductMixture::new(CacheMode::Cached);
        mixture.init_unobserved(&model, &[2, 0], true, &mut rng);
        // pre-fill so remove does not empty the group
        mixture.bb.get_mut(0).groups[0].heads = 2;
        let before = mixture.clone();
        mixture.add_value(&model, 0, &boolean_value(true), &mut rng);
        mixture.remove_value(&model, 0, &boolean_value(true), &mut rng);
        assert_eq!(mixture.clustering, before.clustering);
        assert_eq!(mixture.bb, before.bb);
        assert_eq!(mixture.id_tracker, before.id_tracker);
    }

    fn tare_model() -> ProductModel {
        let mut model = boolean_model();
        model.tares = vec![boolean_value(false)];
        model
    }

    #[test]
    fn diff_scores_match_brute_force_on_materialised_rows() {
        let mut rng = Rng::seed_from_u64(0);
        let model = tare_model();
        let mut mixture = ProductMixture::new(CacheMode::Cached);
        mixture.init_unobserved(&model, &[0], true, &mut rng);
        // rows equal to the tare: empty pos and neg
        let diff = Diff {
            pos: ProductValue::default(),
            neg: ProductValue::default(),
            tares: vec![0],
        };
        for _ in 0..5 {
            let mut scores = vec![];
            mixture.score_diff(&model, &diff, &mut scores, &mut rng);
            let groupid = crate::numeric::sample_from_scores(&mut rng, &mut scores.clone());
            mixture.add_diff(&model, groupid, &diff, &mut rng);
        }
        let mut diff_scores = vec![];
        mixture.score_diff(&model, &diff, &mut diff_scores, &mut rng);
        let mut value_scores = vec![];
        mixture.score_value(&model, &boolean_value(false), &mut value_scores, &mut rng);
        assert_eq!(diff_scores.len(), value_scores.len());
        for (diff_score, value_score) in diff_scores.iter().zip(value_scores.iter()) {
            assert!((diff_score - value_score).abs() < 1e-4);
        }
        assert!((log_sum_exp(&diff_scores) - log_sum_exp(&value_scores)).abs() < 1e-4);
    }

    #[test]
    fn lazy_flush_matches_eager_adds() {
        let mut rng = Rng::seed_from_u64(0);
        let model = tare_model();
        let diff = Diff {
            pos: ProductValue::default(),
            neg: ProductValue::default(),
            tares: vec![0],
        };

        let mut eager = ProductMixture::new(CacheMode::Cached);
        eager.init_unobserved(&model, &[0], true, &mut rng);
        let mut lazy = ProductMixture::new(CacheMode::Lazy);
        lazy.init_unobserved(&model, &[0], true, &mut rng);

        for groupid in [0, 0, 1] {
            eager.add_diff(&model, groupid, &diff, &mut rng);
            lazy.add_diff_deferred(&model, groupid, &diff, &mut rng);
        }
        lazy.flush_tares(&model, &mut rng);
        assert_eq!(eager.clustering, lazy.clustering);
        assert_eq!(eager.bb, lazy.bb);
    }

    #[test]
    fn moved_feature_lands_in_the_destination() {
        let mut rng = Rng::seed_from_u64(0);
        let mut source_model = boolean_model();
        let mut destin_model = ProductModel::default();
        let mut source = ProductMixture::new(CacheMode::Cached);
        source.init_unobserved(&source_model, &[1, 0], true, &mut rng);
        let mut destin = ProductMixture::new(CacheMode::Cached);
        destin.init_unobserved(&destin_model, &[1, 0], true, &mut rng);
        // the proposer holds feature 0 grouped by the destination partition
        let mut proposer = ProductMixture::new(CacheMode::Lazy);
        proposer.init_unobserved(&source_model, &[1, 0], false, &mut rng);
        proposer.bb.find_mut(0).unwrap().groups[0].heads = 1;

        source.suspend_cache();
        destin.suspend_cache();
        proposer.suspend_cache();
        proposer.move_feature_to(0, &mut source_model, &mut source, &mut destin_model, &mut destin);

        assert_eq!(source_model.feature_count(), 0);
        assert_eq!(destin_model.feature_count(), 1);
        assert!(source.bb.is_empty());
        assert_eq!(destin.bb.find(0).unwrap().groups[0].heads, 1);
        assert_eq!(destin_model.schema.booleans, 1);
    }
}
