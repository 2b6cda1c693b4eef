use super::observed::Observed;
use super::product::Diff;
use super::product::ProductValue;
use super::schema::Schema;
use crate::Error;
use crate::KindId;
use crate::Result;

/// precomputed routing table between a full product value and its
/// per-kind partial values. rebuilt whenever a feature changes kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Splitter {
    schema: Schema,
    part_schemas: Vec<Schema>,
    full_to_part: Vec<u32>,
    full_to_local: Vec<u32>,
    part_to_full: Vec<Vec<u32>>,
}

impl Splitter {
    /// slots [0, booleans) are bools, then counts, then reals;
    /// feature id equals global slot index
    pub fn init(&mut self, schema: Schema, full_to_part: &[u32], part_count: usize) {
        debug_assert_eq!(schema.total(), full_to_part.len());
        self.schema = schema;
        self.full_to_part = full_to_part.to_vec();
        self.part_schemas = vec![Schema::default(); part_count];
        self.part_to_full = vec![vec![]; part_count];
        self.full_to_local = vec![0; schema.total()];
        for (slot, part) in full_to_part.iter().enumerate() {
            let part = *part as usize;
            let partial = &mut self.part_schemas[part];
            if slot < schema.booleans {
                partial.booleans += 1;
            } else if slot < schema.booleans + schema.counts {
                partial.counts += 1;
            } else {
                partial.reals += 1;
            }
            self.full_to_local[slot] = self.part_to_full[part].len() as u32;
            self.part_to_full[part].push(slot as u32);
        }
    }

    pub fn part_count(&self) -> usize {
        self.part_schemas.len()
    }

    pub fn part_schema(&self, part: KindId) -> &Schema {
        &self.part_schemas[part]
    }

    pub fn validate(&self, schema: &Schema, full_to_part: &[u32], part_count: usize) {
        debug_assert_eq!(self.schema, *schema);
        debug_assert_eq!(self.full_to_part, full_to_part);
        debug_assert_eq!(self.part_schemas.len(), part_count);
    }

    /// split a full value into one partial value per kind, preserving
    /// the observed-mask encoding
    pub fn split(&self, full: &ProductValue, partials: &mut Vec<ProductValue>) {
        let part_count = self.part_count();
        partials.resize_with(part_count, ProductValue::default);
        for partial in partials.iter_mut() {
            partial.clear();
        }
        match &full.observed {
            Observed::None => {
                for partial in partials.iter_mut() {
                    partial.observed = Observed::None;
                }
            }
            Observed::All => {
                for partial in partials.iter_mut() {
                    partial.observed = Observed::All;
                }
                self.scatter(full, partials, None);
            }
            Observed::Dense(bits) => {
                for (part, partial) in partials.iter_mut().enumerate() {
                    partial.observed = Observed::blank(self.part_schemas[part].total());
                }
                for (slot, bit) in bits.iter().enumerate() {
                    if *bit {
                        let part = self.full_to_part[slot] as usize;
                        let local = self.full_to_local[slot] as usize;
                        match &mut partials[part].observed {
                            Observed::Dense(bits) => bits[local] = true,
                            _ => unreachable!("partial masks are dense"),
                        }
                    }
                }
                self.scatter(full, partials, Some(bits));
            }
            Observed::Sparse(ids) => {
                for partial in partials.iter_mut() {
                    partial.observed = Observed::Sparse(vec![]);
                }
                let mut bits = vec![false; self.schema.total()];
                for id in ids {
                    let slot = *id as usize;
                    bits[slot] = true;
                    let part = self.full_to_part[slot] as usize;
                    let local = self.full_to_local[slot];
                    match &mut partials[part].observed {
                        Observed::Sparse(ids) => ids.push(local),
                        _ => unreachable!("partial masks are sparse"),
                    }
                }
                self.scatter(full, partials, Some(&bits));
            }
        }
    }

    /// route every observed packed value to its owning part. observed
    /// slots walk in ascending global order, so pushes land in ascending
    /// local order within every part's blocks.
    fn scatter(&self, full: &ProductValue, partials: &mut [ProductValue], bits: Option<&[bool]>) {
        let Schema { booleans, counts, .. } = self.schema;
        let mut bools = full.booleans.iter();
        let mut ints = full.counts.iter();
        let mut floats = full.reals.iter();
        for slot in 0..self.schema.total() {
            if bits.map(|b| b[slot]).unwrap_or(true) {
                let partial = &mut partials[self.full_to_part[slot] as usize];
                if slot < booleans {
                    partial.booleans.push(*bools.next().expect("packed booleans"));
                } else if slot < booleans + counts {
                    partial.counts.push(*ints.next().expect("packed counts"));
                } else {
                    partial.reals.push(*floats.next().expect("packed reals"));
                }
            }
        }
    }

    /// split a diff: pos and neg split slot-wise, the tare id list is
    /// carried into every partial
    pub fn split_diff(&self, full: &Diff, partials: &mut Vec<Diff>, temp: &mut Vec<ProductValue>) {
        let part_count = self.part_count();
        partials.resize_with(part_count, Diff::default);
        for partial in partials.iter_mut() {
            partial.clear();
            partial.tares = full.tares.clone();
        }
        self.split(&full.pos, temp);
        for (partial, pos) in partials.iter_mut().zip(temp.iter_mut()) {
            std::mem::swap(&mut partial.pos, pos);
        }
        self.split(&full.neg, temp);
        for (partial, neg) in partials.iter_mut().zip(temp.iter_mut()) {
            std::mem::swap(&mut partial.neg, neg);
        }
    }

    /// join partial values back into a full value. all partials must
    /// carry the same encoding; SPARSE join is unsupported.
    pub fn join(&self, full: &mut ProductValue, partials: &[ProductValue]) -> Result<()> {
        debug_assert_eq!(partials.len(), self.part_count());
        full.clear();
        let sparsity = partials
            .first()
            .map(|p| std::mem::discriminant(&p.observed));
        debug_assert!(
            partials
                .iter()
                .all(|p| Some(std::mem::discriminant(&p.observed)) == sparsity),
            "partial values disagree on sparsity"
        );
        match partials.first().map(|p| &p.observed) {
            Option::None | Some(Observed::None) => {
                full.observed = Observed::None;
                Ok(())
            }
            Some(Observed::Sparse(_)) => Err(Error::UnsupportedSparsity("splitter join")),
            Some(Observed::All) => {
                full.observed = Observed::All;
                self.gather(full, partials, None);
                Ok(())
            }
            Some(Observed::Dense(_)) => {
                let mut bits = vec![false; self.schema.total()];
                for (part, partial) in partials.iter().enumerate() {
                    match &partial.observed {
                        Observed::Dense(local_bits) => {
                            for (local, bit) in local_bits.iter().enumerate() {
                                bits[self.part_to_full[part][local] as usize] = *bit;
                            }
                        }
                        _ => unreachable!("checked above"),
                    }
                }
                full.observed = Observed::Dense(bits.clone());
                self.gather(full, partials, Some(&bits));
                Ok(())
            }
        }
    }

    fn gather(&self, full: &mut ProductValue, partials: &[ProductValue], bits: Option<&[bool]>) {
        let Schema { booleans, counts, .. } = self.schema;
        let mut bools: Vec<_> = partials.iter().map(|p| p.booleans.iter()).collect();
        let mut ints: Vec<_> = partials.iter().map(|p| p.counts.iter()).collect();
        let mut floats: Vec<_> = partials.iter().map(|p| p.reals.iter()).collect();
        for slot in 0..self.schema.total() {
            if bits.map(|b| b[slot]).unwrap_or(true) {
                let part = self.full_to_part[slot] as usize;
                if slot < booleans {
                    full.booleans.push(*bools[part].next().expect("packed booleans"));
                } else if slot < booleans + counts {
                    full.counts.push(*ints[part].next().expect("packed counts"));
                } else {
                    full.reals.push(*floats[part].next().expect("packed reals"));
                }
            }
        }
    }

    pub fn join_diff(&self, full: &mut Diff, partials: &[Diff]) -> Result<()> {
        if partials.is_empty() {
            full.clear();
            return Ok(());
        }
        full.tares = partials[0].tares.clone();
        let pos: Vec<_> = partials.iter().map(|p| p.pos.clone()).collect();
        let neg: Vec<_> = partials.iter().map(|p| p.neg.clone()).collect();
        self.join(&mut full.pos, &pos)?;
        self.join(&mut full.neg, &neg)?;
        Ok(())
    }
}
