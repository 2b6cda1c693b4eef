use super::indexed::IndexedVector;
use crate::family::bernoulli;
use crate::family::bernoulli::Bernoulli;
use crate::family::discrete;
use crate::family::discrete::D16;
use crate::family::discrete::D256;
use crate::family::normal;
use crate::family::normal::Normal;
use crate::family::poisson;
use crate::family::poisson::Poisson;
use crate::family::process;
use crate::family::process::Process;
use crate::family::Family;
use crate::family::PitmanYor;
use crate::value::product::read_value;
use crate::value::product::SlotConsumer;
use crate::value::Diff;
use crate::value::Layout;
use crate::value::ProductValue;
use crate::value::Schema;
use crate::FeatureId;
use crate::Rng;

/// which of the six closed families a feature belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyKind {
    Bb,
    D16,
    D256,
    Dpd,
    Gp,
    Nich,
}

/// one kind's shared parameters: six id-indexed tables in family order
/// plus the clustering hyperparameters and this kind's partial tares
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProductModel {
    pub schema: Schema,
    pub clustering: PitmanYor,
    pub bb: IndexedVector<bernoulli::Shared>,
    pub d16: IndexedVector<discrete::Shared>,
    pub d256: IndexedVector<discrete::Shared>,
    pub dpd: IndexedVector<process::Shared>,
    pub gp: IndexedVector<poisson::Shared>,
    pub nich: IndexedVector<normal::Shared>,
    pub tares: Vec<ProductValue>,
}

impl ProductModel {
    pub fn layout(&self) -> Layout {
        Layout {
            bb: self.bb.len(),
            d16: self.d16.len(),
            d256: self.d256.len(),
            dpd: self.dpd.len(),
            gp: self.gp.len(),
            nich: self.nich.len(),
        }
    }

    pub fn feature_count(&self) -> usize {
        self.layout().total()
    }

    /// recompute the schema from the current table sizes; call after
    /// any feature move
    pub fn update_schema(&mut self) {
        self.schema = self.layout().schema();
    }

    pub fn clear(&mut self) {
        self.bb.clear();
        self.d16.clear();
        self.d256.clear();
        self.dpd.clear();
        self.gp.clear();
        self.nich.clear();
        self.tares.clear();
        self.update_schema();
    }

    /// all feature ids across the six tables, ascending
    pub fn feature_ids(&self) -> Vec<FeatureId> {
        let mut ids: Vec<FeatureId> = self
            .bb
            .ids()
            .iter()
            .chain(self.d16.ids())
            .chain(self.d256.ids())
            .chain(self.dpd.ids())
            .chain(self.gp.ids())
            .chain(self.nich.ids())
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn family_of(&self, id: FeatureId) -> Option<FamilyKind> {
        if self.bb.position(id).is_some() {
            Some(FamilyKind::Bb)
        } else if self.d16.position(id).is_some() {
            Some(FamilyKind::D16)
        } else if self.d256.position(id).is_some() {
            Some(FamilyKind::D256)
        } else if self.dpd.position(id).is_some() {
            Some(FamilyKind::Dpd)
        } else if self.gp.position(id).is_some() {
            Some(FamilyKind::Gp)
        } else if self.nich.position(id).is_some() {
            Some(FamilyKind::Nich)
        } else {
            None
        }
    }

    /// absorb all of another model's features, for the proposer's
    /// all-features shadow model
    pub fn extend(&mut self, other: &Self) {
        self.bb.extend_from(&other.bb);
        self.d16.extend_from(&other.d16);
        self.d256.extend_from(&other.d256);
        self.dpd.extend_from(&other.dpd);
        self.gp.extend_from(&other.gp);
        self.nich.extend_from(&other.nich);
        self.update_schema();
    }

    /// corpus-level running stats: one observe per observed slot
    pub fn add_value(&mut self, value: &ProductValue, rng: &mut Rng) {
        let layout = self.layout();
        let mut fun = ObserveShared { model: self, rng };
        read_value(&mut fun, &layout, value);
    }

    pub fn remove_value(&mut self, value: &ProductValue, rng: &mut Rng) {
        let layout = self.layout();
        let mut fun = ForgetShared { model: self, rng };
        read_value(&mut fun, &layout, value);
    }

    /// the net row equals Σ tares + pos - neg
    pub fn add_diff(&mut self, diff: &Diff, rng: &mut Rng) {
        let tares: Vec<ProductValue> = diff
            .tares
            .iter()
            .map(|id| self.tares[*id as usize].clone())
            .collect();
        for tare in tares.iter() {
            self.add_value(tare, rng);
        }
        self.add_value(&diff.pos, rng);
        self.remove_value(&diff.neg, rng);
    }

    pub fn remove_diff(&mut self, diff: &Diff, rng: &mut Rng) {
        let tares: Vec<ProductValue> = diff
            .tares
            .iter()
            .map(|id| self.tares[*id as usize].clone())
            .collect();
        self.add_value(&diff.neg, rng);
        self.remove_value(&diff.pos, rng);
        for tare in tares.iter() {
            self.remove_value(tare, rng);
        }
    }

    pub fn validate(&self) {
        debug_assert_eq!(self.schema, self.layout().schema());
        let ids = self.feature_ids();
        debug_assert!(
            ids.windows(2).all(|w| w[0] < w[1]),
            "a feature appears in two tables"
        );
    }
}

struct ObserveShared<'a> {
    model: &'a mut ProductModel,
    rng: &'a mut Rng,
}

impl SlotConsumer for ObserveShared<'_> {
    fn bb(&mut self, i: usize, x: bool) {
        Bernoulli::observe(self.model.bb.get_mut(i), x, self.rng);
    }
    fn d16(&mut self, i: usize, x: u32) {
        D16::observe(self.model.d16.get_mut(i), x, self.rng);
    }
    fn d256(&mut self, i: usize, x: u32) {
        D256::observe(self.model.d256.get_mut(i), x, self.rng);
    }
    fn dpd(&mut self, i: usize, x: u32) {
        Process::observe(self.model.dpd.get_mut(i), x, self.rng);
    }
    fn gp(&mut self, i: usize, x: u32) {
        Poisson::observe(self.model.gp.get_mut(i), x, self.rng);
    }
    fn nich(&mut self, i: usize, x: f32) {
        Normal::observe(self.model.nich.get_mut(i), x, self.rng);
    }
}

struct ForgetShared<'a> {
    model: &'a mut ProductModel,
    rng: &'a mut Rng,
}

impl SlotConsumer for ForgetShared<'_> {
    fn bb(&mut self, i: usize, x: bool) {
        Bernoulli::forget(self.model.bb.get_mut(i), x, self.rng);
    }
    fn d16(&mut self, i: usize, x: u32) {
        D16::forget(self.model.d16.get_mut(i), x, self.rng);
    }
    fn d256(&mut self, i: usize, x: u32) {
        D256::forget(self.model.d256.get_mut(i), x, self.rng);
    }
    fn dpd(&mut self, i: usize, x: u32) {
        Process::forget(self.model.dpd.get_mut(i), x, self.rng);
    }
    fn gp(&mut self, i: usize, x: u32) {
        Poisson::forget(self.model.gp.get_mut(i), x, self.rng);
    }
    fn nich(&mut self, i: usize, x: f32) {
        Normal::forget(self.model.nich.get_mut(i), x, self.rng);
    }
}
