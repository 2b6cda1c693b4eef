use super::observed::Observed;
use super::product::Diff;
use super::product::ProductValue;
use super::product::Row;
use super::schema::Schema;
use crate::Error;
use crate::Result;

/// one slot of an exploded product value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    Bool(bool),
    Count(u32),
    Real(f32),
}

/// expand a product value into one optional typed value per schema slot
pub fn explode(schema: &Schema, value: &ProductValue) -> Vec<Option<Slot>> {
    let total = schema.total();
    let mask = value.observed.to_dense(total);
    let mut slots = vec![None; total];
    let mut bools = value.booleans.iter();
    let mut ints = value.counts.iter();
    let mut floats = value.reals.iter();
    for (slot, observed) in mask.iter().enumerate() {
        if *observed {
            slots[slot] = Some(if slot < schema.booleans {
                Slot::Bool(*bools.next().expect("packed booleans"))
            } else if slot < schema.booleans + schema.counts {
                Slot::Count(*ints.next().expect("packed counts"))
            } else {
                Slot::Real(*floats.next().expect("packed reals"))
            });
        }
    }
    slots
}

/// pack exploded slots back into a product value with a minimal mask
pub fn implode(schema: &Schema, slots: &[Option<Slot>]) -> ProductValue {
    let mut value = ProductValue {
        observed: Observed::Dense(slots.iter().map(|s| s.is_some()).collect()),
        ..Default::default()
    };
    for slot in slots.iter().flatten() {
        match slot {
            Slot::Bool(x) => value.booleans.push(*x),
            Slot::Count(x) => value.counts.push(*x),
            Slot::Real(x) => value.reals.push(*x),
        }
    }
    schema.normalize_small(&mut value.observed);
    value
}

#[derive(Debug, Clone, Copy, Default)]
struct BooleanSummary {
    counts: [usize; 2],
}

impl BooleanSummary {
    fn add(&mut self, value: bool) {
        self.counts[value as usize] += 1;
    }
    fn mode(&self) -> bool {
        self.counts[1] > self.counts[0]
    }
    fn count(&self, value: bool) -> usize {
        self.counts[value as usize]
    }
}

#[derive(Debug, Clone, Copy)]
struct CountSummary {
    // assume the mode lies in [0, 16)
    counts: [usize; 16],
}

impl Default for CountSummary {
    fn default() -> Self {
        Self { counts: [0; 16] }
    }
}

impl CountSummary {
    fn add(&mut self, value: u32) {
        if (value as usize) < self.counts.len() {
            self.counts[value as usize] += 1;
        }
    }
    fn mode(&self) -> u32 {
        let mut mode = 0;
        for (value, count) in self.counts.iter().enumerate() {
            if *count > self.counts[mode] {
                mode = value;
            }
        }
        mode as u32
    }
    fn count(&self, value: u32) -> usize {
        self.counts[value as usize]
    }
}

/// builds the corpus tare (the per-slot modal row) and converts rows
/// between absolute and tare-relative form
#[derive(Debug, Clone)]
pub struct Differ {
    schema: Schema,
    row_count: usize,
    booleans: Vec<BooleanSummary>,
    counts: Vec<CountSummary>,
    tare: ProductValue,
    tare_slots: Vec<Option<Slot>>,
}

impl Differ {
    pub fn new(schema: Schema) -> Self {
        let tare = ProductValue {
            observed: Observed::None,
            ..Default::default()
        };
        let tare_slots = vec![None; schema.total()];
        Self {
            schema,
            row_count: 0,
            booleans: vec![BooleanSummary::default(); schema.booleans],
            counts: vec![CountSummary::default(); schema.counts],
            tare,
            tare_slots,
        }
    }

    pub fn with_tare(schema: Schema, tare: ProductValue) -> Result<Self> {
        schema.validate_value(&tare)?;
        let mut differ = Self::new(schema);
        differ.set_tare(tare);
        Ok(differ)
    }

    pub fn has_tare(&self) -> bool {
        !self.tare.is_empty()
    }

    pub fn tare(&self) -> &ProductValue {
        &self.tare
    }

    fn set_tare(&mut self, mut tare: ProductValue) {
        self.tare_slots = explode(&self.schema, &tare);
        self.schema.normalize_small(&mut tare.observed);
        self.tare = tare;
    }

    /// accumulate one absolute row into the modal summaries
    pub fn observe_row(&mut self, value: &ProductValue) {
        let slots = explode(&self.schema, value);
        for (slot, value) in slots.iter().enumerate().take(self.schema.booleans) {
            if let Some(Slot::Bool(x)) = value {
                self.booleans[slot].add(*x);
            }
        }
        for (slot, value) in slots
            .iter()
            .enumerate()
            .skip(self.schema.booleans)
            .take(self.schema.counts)
        {
            if let Some(Slot::Count(x)) = value {
                self.counts[slot - self.schema.booleans].add(*x);
            }
        }
        // reals never sparsify
        self.row_count += 1;
    }

    /// recompute the tare: a slot is dense iff its modal value covers
    /// more than the threshold share of observed rows
    pub fn build_tare(&mut self) {
        let threshold = crate::TARE_THRESHOLD * self.row_count as f32;
        let mut slots = vec![None; self.schema.total()];
        for (slot, summary) in self.booleans.iter().enumerate() {
            let mode = summary.mode();
            if summary.count(mode) as f32 > threshold {
                slots[slot] = Some(Slot::Bool(mode));
            }
        }
        for (i, summary) in self.counts.iter().enumerate() {
            let mode = summary.mode();
            if summary.count(mode) as f32 > threshold {
                slots[self.schema.booleans + i] = Some(Slot::Count(mode));
            }
        }
        let tare = implode(&self.schema, &slots);
        self.set_tare(tare);
    }

    /// convert an absolute row (diff with dense pos, no tares) into
    /// tare-relative form
    pub fn compress(&self, row: &mut Row) {
        if !self.has_tare() {
            self.schema.normalize_small(&mut row.diff.pos.observed);
            return;
        }
        let data = explode(&self.schema, &row.diff.pos);
        let mut pos = vec![None; self.schema.total()];
        let mut neg = vec![None; self.schema.total()];
        for (slot, tare) in self.tare_slots.iter().enumerate() {
            match (tare, &data[slot]) {
                (Some(t), Some(d)) if t != d => {
                    pos[slot] = Some(*d);
                    neg[slot] = Some(*t);
                }
                (Some(_), Some(_)) => {} // implicit in the tare
                (Some(t), None) => neg[slot] = Some(*t),
                (None, Some(d)) => pos[slot] = Some(*d),
                (None, None) => {}
            }
        }
        row.diff.pos = implode(&self.schema, &pos);
        row.diff.neg = implode(&self.schema, &neg);
        row.diff.tares = vec![0];
    }

    /// attach the implicit tare reference to a freshly parsed row: rows
    /// arriving in absolute form are compressed against the tare; rows
    /// that already reference tares pass through
    pub fn fill_in(&self, row: &mut Row) -> Result<()> {
        if row.diff.tares.is_empty() {
            if self.has_tare() {
                self.compress(row);
            }
        } else if !self.has_tare() {
            return Err(Error::SchemaMismatch(format!(
                "row {} references tares but the model has none",
                row.id
            )));
        }
        self.schema.validate_diff(&row.diff)
    }

    /// evaluate Σ tares + pos - neg back into an absolute value
    pub fn materialise(&self, diff: &Diff, tares: &[ProductValue]) -> ProductValue {
        let pos = explode(&self.schema, &diff.pos);
        let neg = explode(&self.schema, &diff.neg);
        let mut slots = vec![None; self.schema.total()];
        for id in diff.tares.iter() {
            let tare = explode(&self.schema, &tares[*id as usize]);
            for (slot, value) in tare.into_iter().enumerate() {
                if value.is_some() {
                    slots[slot] = value;
                }
            }
        }
        for (slot, value) in neg.iter().enumerate() {
            if value.is_some() {
                slots[slot] = None;
            }
        }
        for (slot, value) in pos.into_iter().enumerate() {
            if value.is_some() {
                slots[slot] = value;
            }
        }
        implode(&self.schema, &slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(2, 2, 1)
    }

    fn row(id: u64, booleans: Vec<bool>, counts: Vec<u32>, reals: Vec<f32>) -> Row {
        Row {
            id,
            diff: Diff::from(ProductValue {
                observed: Observed::All,
                booleans,
                counts,
                reals,
            }),
        }
    }

    fn trained_differ() -> Differ {
        let mut differ = Differ::new(schema());
        for _ in 0..8 {
            differ.observe_row(&row(0, vec![false, true], vec![0, 3], vec![0.0]).diff.pos);
        }
        differ.observe_row(&row(0, vec![true, true], vec![0, 7], vec![0.0]).diff.pos);
        differ.build_tare();
        differ
    }

    #[test]
    fn tare_takes_dominant_modes_and_skips_reals() {
        let differ = trained_differ();
        let slots = explode(&schema(), differ.tare());
        assert_eq!(slots[0], Some(Slot::Bool(false)));
        assert_eq!(slots[1], Some(Slot::Bool(true)));
        assert_eq!(slots[2], Some(Slot::Count(0)));
        assert_eq!(slots[3], Some(Slot::Count(3)));
        assert_eq!(slots[4], None);
    }

    #[test]
    fn compress_then_materialise_round_trips() {
        let differ = trained_differ();
        let tares = vec![differ.tare().clone()];
        let original = row(1, vec![true, true], vec![0, 3], vec![2.5]);
        let mut compressed = original.clone();
        differ.compress(&mut compressed);
        assert_eq!(compressed.diff.tares, vec![0]);
        // slot 0 differs from the tare, slots 1..3 are implicit
        assert!(compressed.diff.pos.observed.count(5) < 5);
        let materialised = differ.materialise(&compressed.diff, &tares);
        assert_eq!(
            explode(&schema(), &materialised),
            explode(&schema(), &original.diff.pos)
        );
    }

    #[test]
    fn unobserved_tare_slot_lands_in_neg() {
        let differ = trained_differ();
        let tares = vec![differ.tare().clone()];
        let mut partial = Row {
            id: 2,
            diff: Diff::from(ProductValue {
                observed: Observed::Sparse(vec![0, 4]),
                booleans: vec![false],
                counts: vec![],
                reals: vec![1.0],
            }),
        };
        let original = partial.clone();
        differ.compress(&mut partial);
        let materialised = differ.materialise(&partial.diff, &tares);
        assert_eq!(
            explode(&schema(), &materialised),
            explode(&schema(), &original.diff.pos)
        );
    }

    #[test]
    fn empty_diff_with_tares_materialises_the_tare_sum() {
        let differ = trained_differ();
        let tares = vec![differ.tare().clone()];
        let diff = Diff {
            pos: ProductValue::default(),
            neg: ProductValue::default(),
            tares: vec![0],
        };
        let materialised = differ.materialise(&diff, &tares);
        assert_eq!(
            explode(&schema(), &materialised),
            explode(&schema(), differ.tare())
        );
    }

    #[test]
    fn fill_in_rejects_tare_references_without_a_tare() {
        let differ = Differ::new(schema());
        let mut bad = row(3, vec![true, true], vec![1, 2], vec![0.5]);
        bad.diff.tares = vec![0];
        assert!(differ.fill_in(&mut bad).is_err());
    }
}
