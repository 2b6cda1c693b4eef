use super::mixture::CacheMode;
use super::mixture::ProductMixture;
use super::product::ProductModel;
use crate::family::HyperPrior;
use crate::family::PitmanYor;
use crate::value::Diff;
use crate::value::ProductValue;
use crate::value::Schema;
use crate::value::Splitter;
use crate::FeatureId;
use crate::Result;
use crate::Rng;
use crate::Score;
use std::collections::BTreeSet;

/// one kind: its shared parameters, its row partition, and the set of
/// features it owns (the only mutable membership)
#[derive(Debug, Clone, PartialEq)]
pub struct Kind {
    pub model: ProductModel,
    pub mixture: ProductMixture,
    pub features: BTreeSet<FeatureId>,
}

impl Default for Kind {
    fn default() -> Self {
        Self {
            model: ProductModel::default(),
            mixture: ProductMixture::new(CacheMode::Cached),
            features: BTreeSet::new(),
        }
    }
}

/// the full latent state: a partition of features into kinds, each kind
/// carrying a Pitman-Yor partition of rows into groups
#[derive(Debug, Clone, PartialEq)]
pub struct CrossCat {
    pub schema: Schema,
    pub topology: PitmanYor,
    pub hyper_prior: HyperPrior,
    pub tares: Vec<ProductValue>,
    pub splitter: Splitter,
    pub kinds: Vec<Kind>,
    pub feature_to_kind: Vec<u32>,
}

impl Default for CrossCat {
    fn default() -> Self {
        Self {
            schema: Schema::default(),
            topology: PitmanYor::default(),
            hyper_prior: HyperPrior::default(),
            tares: vec![],
            splitter: Splitter::default(),
            kinds: vec![],
            feature_to_kind: vec![],
        }
    }
}

impl CrossCat {
    pub fn kind_count(&self) -> usize {
        self.kinds.len()
    }

    pub fn update_splitter(&mut self) {
        self.splitter
            .init(self.schema, &self.feature_to_kind, self.kinds.len());
    }

    /// rematerialise each kind's partial tares from the full tare set
    pub fn update_tares(&mut self, temp: &mut Vec<ProductValue>) {
        for kind in self.kinds.iter_mut() {
            kind.model.tares.clear();
        }
        let tares = self.tares.clone();
        for tare in tares.iter() {
            self.splitter.split(tare, temp);
            for (kind, partial) in self.kinds.iter_mut().zip(temp.iter_mut()) {
                kind.model.tares.push(std::mem::take(partial));
            }
        }
    }

    pub fn value_split(&self, full: &ProductValue, partials: &mut Vec<ProductValue>) {
        self.splitter.split(full, partials);
    }

    pub fn diff_split(&self, full: &Diff, partials: &mut Vec<Diff>, temp: &mut Vec<ProductValue>) {
        self.splitter.split_diff(full, partials, temp);
    }

    pub fn value_join(&self, full: &mut ProductValue, partials: &[ProductValue]) -> Result<()> {
        self.splitter.join(full, partials)
    }

    pub fn diff_join(&self, full: &mut Diff, partials: &[Diff]) -> Result<()> {
        self.splitter.join_diff(full, partials)
    }

    /// fresh mixtures with no rows: `empty_group_count` reserves per kind
    pub fn mixture_init_unobserved(&mut self, empty_group_count: usize, rng: &mut Rng) {
        for kind in self.kinds.iter_mut() {
            let counts = vec![0; empty_group_count];
            kind.mixture.init_unobserved(&kind.model, &counts, true, rng);
        }
    }

    /// total log score of all absorbed data
    pub fn score_data(&self, rng: &mut Rng) -> Score {
        self.kinds
            .iter()
            .map(|kind| kind.mixture.score_data(&kind.model, rng))
            .sum()
    }

    /// per kind, the global ids of nonempty groups sorted most popular
    /// first; this is the id encoding of the assignment and group files
    pub fn sorted_groupids(&self) -> Vec<Vec<u32>> {
        self.kinds
            .iter()
            .map(|kind| {
                let counts = kind.mixture.clustering.counts();
                let mut order: Vec<(u32, u32)> = counts
                    .iter()
                    .enumerate()
                    .filter(|(_, count)| **count > 0)
                    .map(|(packed, count)| (*count, kind.mixture.id_tracker.packed_to_global(packed)))
                    .collect();
                order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                order.into_iter().map(|(_, global)| global).collect()
            })
            .collect()
    }

    pub fn count_rows(&self) -> usize {
        self.kinds
            .first()
            .map(|kind| kind.mixture.count_rows())
            .unwrap_or(0)
    }

    pub fn validate(&self) {
        let mut expected = Schema::default();
        for kind in self.kinds.iter() {
            kind.model.validate();
            kind.mixture.validate(&kind.model);
            expected.absorb(&kind.model.schema);
        }
        debug_assert_eq!(self.schema, expected, "kind schemas do not sum to the total");
        debug_assert_eq!(self.feature_to_kind.len(), self.schema.total());
        for (featureid, kindid) in self.feature_to_kind.iter().enumerate() {
            debug_assert!(
                self.kinds[*kindid as usize].features.contains(&featureid),
                "kind {} is missing feature {}",
                kindid,
                featureid
            );
        }
        for (kindid, kind) in self.kinds.iter().enumerate() {
            for featureid in kind.features.iter() {
                debug_assert_eq!(self.feature_to_kind[*featureid] as usize, kindid);
            }
            debug_assert_eq!(kind.features.len(), kind.model.feature_count());
            debug_assert_eq!(kind.model.tares.len(), self.tares.len());
        }
        let row_counts: Vec<usize> = self.kinds.iter().map(|k| k.mixture.count_rows()).collect();
        debug_assert!(
            row_counts.windows(2).all(|w| w[0] == w[1]),
            "kinds disagree on row count: {:?}",
            row_counts
        );
    }
}

/// which kind each partial belongs to is positional; build a cross-cat
/// from per-kind models for loaders and tests
pub fn assemble(
    topology: PitmanYor,
    hyper_prior: HyperPrior,
    tares: Vec<ProductValue>,
    models: Vec<ProductModel>,
) -> CrossCat {
    let mut schema = Schema::default();
    let mut feature_count = 0;
    for model in models.iter() {
        schema.absorb(&model.schema);
        feature_count = feature_count.max(
            model
                .feature_ids()
                .last()
                .map(|id| id + 1)
                .unwrap_or(0),
        );
    }
    let mut feature_to_kind = vec![u32::MAX; feature_count];
    let mut kinds: Vec<Kind> = vec![];
    for (kindid, model) in models.into_iter().enumerate() {
        let features: BTreeSet<FeatureId> = model.feature_ids().into_iter().collect();
        for featureid in features.iter() {
            feature_to_kind[*featureid] = kindid as u32;
        }
        kinds.push(Kind {
            model,
            mixture: ProductMixture::new(CacheMode::Cached),
            features,
        });
    }
    let mut cross_cat = CrossCat {
        schema,
        topology,
        hyper_prior,
        tares,
        splitter: Splitter::default(),
        kinds,
        feature_to_kind,
    };
    cross_cat.update_splitter();
    let mut temp = vec![];
    cross_cat.update_tares(&mut temp);
    cross_cat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::bernoulli;
    use crate::family::normal;
    use crate::value::Observed;
    use rand::SeedableRng;

    pub fn two_kind_cross_cat() -> CrossCat {
        let mut first = ProductModel::default();
        first.bb.insert(0, bernoulli::Shared::default());
        first.update_schema();
        let mut second = ProductModel::default();
        second.bb.insert(1, bernoulli::Shared::default());
        second.nich.insert(2, normal::Shared::default());
        second.update_schema();
        assemble(
            PitmanYor::default(),
            HyperPrior::default(),
            vec![],
            vec![first, second],
        )
    }

    #[test]
    fn assembly_wires_the_feature_map() {
        let mut cross_cat = two_kind_cross_cat();
        assert_eq!(cross_cat.feature_to_kind, vec![0, 1, 1]);
        assert_eq!(cross_cat.schema, Schema::new(2, 0, 1));
        let mut rng = Rng::seed_from_u64(0);
        cross_cat.mixture_init_unobserved(1, &mut rng);
        cross_cat.validate();
    }

    #[test]
    fn split_respects_kind_membership() {
        let cross_cat = two_kind_cross_cat();
        let full = ProductValue {
            observed: Observed::All,
            booleans: vec![true, false],
            counts: vec![],
            reals: vec![0.5],
        };
        let mut partials = vec![];
        cross_cat.value_split(&full, &mut partials);
        assert_eq!(partials[0].booleans, vec![true]);
        assert_eq!(partials[1].booleans, vec![false]);
        assert_eq!(partials[1].reals, vec![0.5]);
    }

    #[test]
    fn sorted_groupids_order_by_popularity() {
        let mut cross_cat = two_kind_cross_cat();
        let mut rng = Rng::seed_from_u64(0);
        cross_cat.mixture_init_unobserved(1, &mut rng);
        let mut partials = vec![];
        let row = ProductValue {
            observed: Observed::All,
            booleans: vec![true, true],
            counts: vec![],
            reals: vec![0.0],
        };
        cross_cat.value_split(&row, &mut partials);
        for (kind, partial) in cross_cat.kinds.iter_mut().zip(partials.iter()) {
            // two rows in group 0, one in group 1
            kind.mixture.add_value(&kind.model, 0, partial, &mut rng);
            kind.mixture.add_value(&kind.model, 0, partial, &mut rng);
            kind.mixture.add_value(&kind.model, 1, partial, &mut rng);
        }
        let sorted = cross_cat.sorted_groupids();
        for kind_sorted in sorted.iter() {
            assert_eq!(kind_sorted.len(), 2);
            assert_eq!(kind_sorted[0], 0);
            assert_eq!(kind_sorted[1], 1);
        }
        cross_cat.validate();
    }
}
