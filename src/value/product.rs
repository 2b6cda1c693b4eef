use super::observed::Observed;
use super::schema::Schema;
use crate::RowId;

/// one row payload: an observed mask plus typed values densely packed
/// in schema order within each block
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProductValue {
    pub observed: Observed,
    pub booleans: Vec<bool>,
    pub counts: Vec<u32>,
    pub reals: Vec<f32>,
}

impl ProductValue {
    pub fn blank() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.observed, Observed::None)
    }

    pub fn clear(&mut self) {
        self.observed = Observed::None;
        self.booleans.clear();
        self.counts.clear();
        self.reals.clear();
    }

    pub fn packed_len(&self) -> usize {
        self.booleans.len() + self.counts.len() + self.reals.len()
    }
}

/// the additive transport format of a row: Σ tares + pos - neg,
/// slot-wise, where slots absent in an operand contribute nothing
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Diff {
    pub pos: ProductValue,
    pub neg: ProductValue,
    pub tares: Vec<u32>,
}

impl Diff {
    pub fn clear(&mut self) {
        self.pos.clear();
        self.neg.clear();
        self.tares.clear();
    }
}

impl From<ProductValue> for Diff {
    /// promote a plain value to a diff with empty neg and no tares
    fn from(pos: ProductValue) -> Self {
        Self {
            pos,
            neg: ProductValue::blank(),
            tares: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub id: RowId,
    pub diff: Diff,
}

/// per-family slot counts of one kind, in the fixed family order
/// BB, DD16, DD256, DPD, GP, NICH. the booleans block is bb, the
/// counts block is d16 + d256 + dpd + gp, the reals block is nich.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Layout {
    pub bb: usize,
    pub d16: usize,
    pub d256: usize,
    pub dpd: usize,
    pub gp: usize,
    pub nich: usize,
}

impl Layout {
    pub fn schema(&self) -> Schema {
        Schema::new(
            self.bb,
            self.d16 + self.d256 + self.dpd + self.gp,
            self.nich,
        )
    }

    pub fn total(&self) -> usize {
        self.bb + self.d16 + self.d256 + self.dpd + self.gp + self.nich
    }
}

/// visitor over the observed slots of a product value, one callback per
/// family with the within-family position and the typed value
pub trait SlotConsumer {
    fn bb(&mut self, i: usize, x: bool);
    fn d16(&mut self, i: usize, x: u32);
    fn d256(&mut self, i: usize, x: u32);
    fn dpd(&mut self, i: usize, x: u32);
    fn gp(&mut self, i: usize, x: u32);
    fn nich(&mut self, i: usize, x: f32);
}

/// source of one typed value per observed slot, used by the write driver
pub trait SlotProducer {
    fn bb(&mut self, i: usize) -> bool;
    fn d16(&mut self, i: usize) -> u32;
    fn d256(&mut self, i: usize) -> u32;
    fn dpd(&mut self, i: usize) -> u32;
    fn gp(&mut self, i: usize) -> u32;
    fn nich(&mut self, i: usize) -> f32;
}

/// drive a consumer over every observed slot in family order, preserving
/// the dense packing order of the stored values. this is the single hot
/// path every add, remove, and score operation funnels through.
pub fn read_value<C: SlotConsumer>(consumer: &mut C, layout: &Layout, value: &ProductValue) {
    match &value.observed {
        Observed::All => read_all(consumer, layout, value),
        Observed::Dense(bits) => read_dense(consumer, layout, value, bits),
        Observed::Sparse(ids) => read_sparse(consumer, layout, value, ids),
        Observed::None => {}
    }
}

fn read_all<C: SlotConsumer>(consumer: &mut C, layout: &Layout, value: &ProductValue) {
    let mut booleans = value.booleans.iter();
    for i in 0..layout.bb {
        consumer.bb(i, *booleans.next().expect("packed booleans"));
    }
    let mut counts = value.counts.iter();
    for i in 0..layout.d16 {
        consumer.d16(i, *counts.next().expect("packed counts"));
    }
    for i in 0..layout.d256 {
        consumer.d256(i, *counts.next().expect("packed counts"));
    }
    for i in 0..layout.dpd {
        consumer.dpd(i, *counts.next().expect("packed counts"));
    }
    for i in 0..layout.gp {
        consumer.gp(i, *counts.next().expect("packed counts"));
    }
    let mut reals = value.reals.iter();
    for i in 0..layout.nich {
        consumer.nich(i, *reals.next().expect("packed reals"));
    }
}

fn read_dense<C: SlotConsumer>(
    consumer: &mut C,
    layout: &Layout,
    value: &ProductValue,
    bits: &[bool],
) {
    let mut observed = bits.iter();
    let mut booleans = value.booleans.iter();
    for i in 0..layout.bb {
        if *observed.next().expect("dense mask") {
            consumer.bb(i, *booleans.next().expect("packed booleans"));
        }
    }
    let mut counts = value.counts.iter();
    for i in 0..layout.d16 {
        if *observed.next().expect("dense mask") {
            consumer.d16(i, *counts.next().expect("packed counts"));
        }
    }
    for i in 0..layout.d256 {
        if *observed.next().expect("dense mask") {
            consumer.d256(i, *counts.next().expect("packed counts"));
        }
    }
    for i in 0..layout.dpd {
        if *observed.next().expect("dense mask") {
            consumer.dpd(i, *counts.next().expect("packed counts"));
        }
    }
    for i in 0..layout.gp {
        if *observed.next().expect("dense mask") {
            consumer.gp(i, *counts.next().expect("packed counts"));
        }
    }
    let mut reals = value.reals.iter();
    for i in 0..layout.nich {
        if *observed.next().expect("dense mask") {
            consumer.nich(i, *reals.next().expect("packed reals"));
        }
    }
}

fn read_sparse<C: SlotConsumer>(
    consumer: &mut C,
    layout: &Layout,
    value: &ProductValue,
    ids: &[u32],
) {
    let mut ids = ids.iter().map(|i| *i as usize).peekable();
    let mut block = BlockWindow::default();
    let mut booleans = value.booleans.iter();
    block.advance(layout.bb);
    while let Some(local) = block.claim(&mut ids) {
        consumer.bb(local, *booleans.next().expect("packed booleans"));
    }
    let mut counts = value.counts.iter();
    block.advance(layout.d16);
    while let Some(local) = block.claim(&mut ids) {
        consumer.d16(local, *counts.next().expect("packed counts"));
    }
    block.advance(layout.d256);
    while let Some(local) = block.claim(&mut ids) {
        consumer.d256(local, *counts.next().expect("packed counts"));
    }
    block.advance(layout.dpd);
    while let Some(local) = block.claim(&mut ids) {
        consumer.dpd(local, *counts.next().expect("packed counts"));
    }
    block.advance(layout.gp);
    while let Some(local) = block.claim(&mut ids) {
        consumer.gp(local, *counts.next().expect("packed counts"));
    }
    let mut reals = value.reals.iter();
    block.advance(layout.nich);
    while let Some(local) = block.claim(&mut ids) {
        consumer.nich(local, *reals.next().expect("packed reals"));
    }
}

/// fill the packed value vectors by pulling one value per observed slot
/// from the producer, in family order
pub fn write_value<P: SlotProducer>(producer: &mut P, layout: &Layout, value: &mut ProductValue) {
    value.booleans.clear();
    value.counts.clear();
    value.reals.clear();
    match value.observed.clone() {
        Observed::All => {
            for i in 0..layout.bb {
                let x = producer.bb(i);
                value.booleans.push(x);
            }
            for i in 0..layout.d16 {
                let x = producer.d16(i);
                value.counts.push(x);
            }
            for i in 0..layout.d256 {
                let x = producer.d256(i);
                value.counts.push(x);
            }
            for i in 0..layout.dpd {
                let x = producer.dpd(i);
                value.counts.push(x);
            }
            for i in 0..layout.gp {
                let x = producer.gp(i);
                value.counts.push(x);
            }
            for i in 0..layout.nich {
                let x = producer.nich(i);
                value.reals.push(x);
            }
        }
        Observed::Dense(bits) => {
            let mut observed = bits.iter();
            for i in 0..layout.bb {
                if *observed.next().expect("dense mask") {
                    let x = producer.bb(i);
                    value.booleans.push(x);
                }
            }
            for i in 0..layout.d16 {
                if *observed.next().expect("dense mask") {
                    let x = producer.d16(i);
                    value.counts.push(x);
                }
            }
            for i in 0..layout.d256 {
                if *observed.next().expect("dense mask") {
                    let x = producer.d256(i);
                    value.counts.push(x);
                }
            }
            for i in 0..layout.dpd {
                if *observed.next().expect("dense mask") {
                    let x = producer.dpd(i);
                    value.counts.push(x);
                }
            }
            for i in 0..layout.gp {
                if *observed.next().expect("dense mask") {
                    let x = producer.gp(i);
                    value.counts.push(x);
                }
            }
            for i in 0..layout.nich {
                if *observed.next().expect("dense mask") {
                    let x = producer.nich(i);
                    value.reals.push(x);
                }
            }
        }
        Observed::Sparse(ids) => {
            let mut ids = ids.iter().map(|i| *i as usize).peekable();
            let mut block = BlockWindow::default();
            block.advance(layout.bb);
            while let Some(local) = block.claim(&mut ids) {
                let x = producer.bb(local);
                value.booleans.push(x);
            }
            block.advance(layout.d16);
            while let Some(local) = block.claim(&mut ids) {
                let x = producer.d16(local);
                value.counts.push(x);
            }
            block.advance(layout.d256);
            while let Some(local) = block.claim(&mut ids) {
                let x = producer.d256(local);
                value.counts.push(x);
            }
            block.advance(layout.dpd);
            while let Some(local) = block.claim(&mut ids) {
                let x = producer.dpd(local);
                value.counts.push(x);
            }
            block.advance(layout.gp);
            while let Some(local) = block.claim(&mut ids) {
                let x = producer.gp(local);
                value.counts.push(x);
            }
            block.advance(layout.nich);
            while let Some(local) = block.claim(&mut ids) {
                let x = producer.nich(local);
                value.reals.push(x);
            }
        }
        Observed::None => {}
    }
}

/// sliding [begin, end) window over the family blocks of the global
/// slot index space, for walking sparse observed lists
#[derive(Default)]
struct BlockWindow {
    begin: usize,
    end: usize,
}

impl BlockWindow {
    fn advance(&mut self, size: usize) {
        self.begin = self.end;
        self.end += size;
    }

    /// pop the next sparse id if it falls inside the current block,
    /// returning its block-local position
    fn claim<I: Iterator<Item = usize>>(
        &self,
        ids: &mut std::iter::Peekable<I>,
    ) -> Option<usize> {
        match ids.peek() {
            Some(id) if *id < self.end => {
                let id = ids.next().expect("peeked");
                debug_assert!(id >= self.begin, "sparse ids must ascend");
                Some(id - self.begin)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        slots: Vec<(&'static str, usize, String)>,
    }

    impl SlotConsumer for Recorder {
        fn bb(&mut self, i: usize, x: bool) {
            self.slots.push(("bb", i, x.to_string()));
        }
        fn d16(&mut self, i: usize, x: u32) {
            self.slots.push(("d16", i, x.to_string()));
        }
        fn d256(&mut self, i: usize, x: u32) {
            self.slots.push(("d256", i, x.to_string()));
        }
        fn dpd(&mut self, i: usize, x: u32) {
            self.slots.push(("dpd", i, x.to_string()));
        }
        fn gp(&mut self, i: usize, x: u32) {
            self.slots.push(("gp", i, x.to_string()));
        }
        fn nich(&mut self, i: usize, x: f32) {
            self.slots.push(("nich", i, x.to_string()));
        }
    }

    fn layout() -> Layout {
        Layout {
            bb: 2,
            d16: 1,
            d256: 0,
            dpd: 0,
            gp: 1,
            nich: 1,
        }
    }

    #[test]
    fn all_visits_every_slot_in_family_order() {
        let value = ProductValue {
            observed: Observed::All,
            booleans: vec![true, false],
            counts: vec![3, 7],
            reals: vec![1.5],
        };
        let mut recorder = Recorder::default();
        read_value(&mut recorder, &layout(), &value);
        assert_eq!(
            recorder.slots,
            vec![
                ("bb", 0, "true".to_string()),
                ("bb", 1, "false".to_string()),
                ("d16", 0, "3".to_string()),
                ("gp", 0, "7".to_string()),
                ("nich", 0, "1.5".to_string()),
            ]
        );
    }

    #[test]
    fn dense_skips_unobserved_but_keeps_packing_order() {
        let value = ProductValue {
            observed: Observed::Dense(vec![false, true, true, false, true]),
            booleans: vec![false],
            counts: vec![3],
            reals: vec![2.5],
        };
        let mut recorder = Recorder::default();
        read_value(&mut recorder, &layout(), &value);
        assert_eq!(
            recorder.slots,
            vec![
                ("bb", 1, "false".to_string()),
                ("d16", 0, "3".to_string()),
                ("nich", 0, "2.5".to_string()),
            ]
        );
    }

    #[test]
    fn sparse_routes_global_slots_to_family_positions() {
        // slots: 0,1 bb; 2 d16; 3 gp; 4 nich
        let value = ProductValue {
            observed: Observed::Sparse(vec![1, 3, 4]),
            booleans: vec![true],
            counts: vec![9],
            reals: vec![0.25],
        };
        let mut recorder = Recorder::default();
        read_value(&mut recorder, &layout(), &value);
        assert_eq!(
            recorder.slots,
            vec![
                ("bb", 1, "true".to_string()),
                ("gp", 0, "9".to_string()),
                ("nich", 0, "0.25".to_string()),
            ]
        );
    }

    struct Echo;
    impl SlotProducer for Echo {
        fn bb(&mut self, i: usize) -> bool {
            i % 2 == 0
        }
        fn d16(&mut self, i: usize) -> u32 {
            i as u32 + 10
        }
        fn d256(&mut self, i: usize) -> u32 {
            i as u32 + 20
        }
        fn dpd(&mut self, i: usize) -> u32 {
            i as u32 + 30
        }
        fn gp(&mut self, i: usize) -> u32 {
            i as u32 + 40
        }
        fn nich(&mut self, i: usize) -> f32 {
            i as f32
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut value = ProductValue {
            observed: Observed::Sparse(vec![0, 2, 3]),
            ..Default::default()
        };
        write_value(&mut Echo, &layout(), &mut value);
        assert_eq!(value.booleans, vec![true]);
        assert_eq!(value.counts, vec![10, 40]);
        assert_eq!(value.reals, Vec::<f32>::new());

        let mut recorder = Recorder::default();
        read_value(&mut recorder, &layout(), &value);
        assert_eq!(recorder.slots.len(), 3);
    }
}
