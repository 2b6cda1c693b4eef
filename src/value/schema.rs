use super::observed::Observed;
use super::product::Diff;
use super::product::ProductValue;
use crate::Error;
use crate::Result;

/// block sizes of a product value: booleans, then counts, then reals.
/// immutable after model load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Schema {
    pub booleans: usize,
    pub counts: usize,
    pub reals: usize,
}

impl Schema {
    pub fn new(booleans: usize, counts: usize, reals: usize) -> Self {
        Self {
            booleans,
            counts,
            reals,
        }
    }

    pub fn total(&self) -> usize {
        self.booleans + self.counts + self.reals
    }

    pub fn absorb(&mut self, other: &Self) {
        self.booleans += other.booleans;
        self.counts += other.counts;
        self.reals += other.reals;
    }

    pub fn validate_observed(&self, observed: &Observed) -> Result<()> {
        match observed {
            Observed::All | Observed::None => Ok(()),
            Observed::Dense(bits) => {
                if bits.len() == self.total() {
                    Ok(())
                } else {
                    Err(Error::InvalidSparsity(format!(
                        "dense mask of {} bits against {} slots",
                        bits.len(),
                        self.total()
                    )))
                }
            }
            Observed::Sparse(ids) => {
                let ascending = ids.windows(2).all(|w| w[0] < w[1]);
                let bounded = ids.last().map(|i| (*i as usize) < self.total());
                if ascending && bounded.unwrap_or(true) {
                    Ok(())
                } else {
                    Err(Error::InvalidSparsity(format!(
                        "sparse list {:?} against {} slots",
                        ids,
                        self.total()
                    )))
                }
            }
        }
    }

    /// check the observed mask and that the packed value lengths add up
    pub fn validate_value(&self, value: &ProductValue) -> Result<()> {
        self.validate_observed(&value.observed)?;
        let ok = match &value.observed {
            Observed::All => {
                value.booleans.len() == self.booleans
                    && value.counts.len() == self.counts
                    && value.reals.len() == self.reals
            }
            Observed::None => {
                value.booleans.is_empty() && value.counts.is_empty() && value.reals.is_empty()
            }
            observed => {
                let packed = value.booleans.len() + value.counts.len() + value.reals.len();
                value.booleans.len() <= self.booleans
                    && value.counts.len() <= self.counts
                    && value.reals.len() <= self.reals
                    && packed == observed.count(self.total())
            }
        };
        if ok {
            Ok(())
        } else {
            Err(Error::SchemaMismatch(format!(
                "value carries ({}, {}, {}) slots against schema {:?}",
                value.booleans.len(),
                value.counts.len(),
                value.reals.len(),
                self
            )))
        }
    }

    pub fn validate_diff(&self, diff: &Diff) -> Result<()> {
        self.validate_value(&diff.pos)?;
        self.validate_value(&diff.neg)?;
        if diff.tares.is_empty() && diff.neg.observed.count(self.total()) > 0 {
            return Err(Error::SchemaMismatch(
                "diff has neg parts but no tares".to_string(),
            ));
        }
        Ok(())
    }

    /// shrink the observed mask to its smallest encoding. DENSE masks
    /// below the sparse threshold become SPARSE; full and empty masks
    /// collapse to ALL and NONE.
    pub fn normalize_small(&self, observed: &mut Observed) {
        let total = self.total();
        let threshold = (crate::SPARSE_THRESHOLD * total as f32) as usize;
        match observed {
            Observed::All | Observed::None => {}
            Observed::Dense(bits) => {
                let count = bits.iter().filter(|b| **b).count();
                if count == 0 {
                    *observed = Observed::None;
                } else if count == total {
                    *observed = Observed::All;
                } else if count < threshold {
                    let ids = bits
                        .iter()
                        .enumerate()
                        .filter(|(_, b)| **b)
                        .map(|(i, _)| i as u32)
                        .collect();
                    *observed = Observed::Sparse(ids);
                }
            }
            Observed::Sparse(ids) => {
                if ids.is_empty() {
                    *observed = Observed::None;
                } else if ids.len() == total {
                    *observed = Observed::All;
                } else if ids.len() >= threshold {
                    let mut bits = vec![false; total];
                    for i in ids.iter() {
                        bits[*i as usize] = true;
                    }
                    *observed = Observed::Dense(bits);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_must_ascend() {
        let schema = Schema::new(2, 2, 2);
        assert!(schema.validate_observed(&Observed::Sparse(vec![0, 3])).is_ok());
        assert!(schema.validate_observed(&Observed::Sparse(vec![3, 0])).is_err());
        assert!(schema.validate_observed(&Observed::Sparse(vec![1, 1])).is_err());
        assert!(schema.validate_observed(&Observed::Sparse(vec![6])).is_err());
    }

    #[test]
    fn normalize_collapses_extremes() {
        let schema = Schema::new(10, 0, 0);
        let mut full = Observed::Dense(vec![true; 10]);
        schema.normalize_small(&mut full);
        assert_eq!(full, Observed::All);

        let mut empty = Observed::Sparse(vec![]);
        schema.normalize_small(&mut empty);
        assert_eq!(empty, Observed::None);
    }

    #[test]
    fn normalize_sparsifies_thin_masks() {
        let schema = Schema::new(100, 0, 0);
        let mut bits = vec![false; 100];
        bits[17] = true;
        let mut thin = Observed::Dense(bits);
        schema.normalize_small(&mut thin);
        assert_eq!(thin, Observed::Sparse(vec![17]));
    }
}
