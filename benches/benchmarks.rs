use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;
use crosscat::family::bernoulli;
use crosscat::family::PitmanYor;
use crosscat::kernels::BlockPitmanYor;
use crosscat::model::CacheMode;
use crosscat::model::ProductMixture;
use crosscat::model::ProductModel;
use crosscat::value::Diff;
use crosscat::value::Observed;
use crosscat::value::ProductValue;
use crosscat::Rng;
use rand::SeedableRng;

fn block_sampler(c: &mut Criterion) {
    let likelihoods = vec![vec![1.0f32; 8]; 256];
    let topology = PitmanYor { alpha: 1.0, d: 0.1 };
    c.bench_function("block_pitman_yor_sweep", |b| {
        b.iter(|| {
            let mut rng = Rng::seed_from_u64(0);
            let mut assignments = vec![0u32; 256];
            let mut sampler =
                BlockPitmanYor::new(&topology, &likelihoods, &mut assignments).unwrap();
            sampler.run(1, &mut rng);
            assignments
        })
    });
}

fn score_diff(c: &mut Criterion) {
    let mut rng = Rng::seed_from_u64(0);
    let mut model = ProductModel::default();
    for featureid in 0..32 {
        model.bb.insert(featureid, bernoulli::Shared::default());
    }
    model.update_schema();
    model.tares = vec![ProductValue {
        observed: Observed::All,
        booleans: vec![false; 32],
        counts: vec![],
        reals: vec![],
    }];
    let mut mixture = ProductMixture::new(CacheMode::Cached);
    mixture.init_unobserved(&model, &[0], true, &mut rng);
    let diff = Diff {
        pos: ProductValue::default(),
        neg: ProductValue::default(),
        tares: vec![0],
    };
    for groupid in [0, 0, 1, 0, 1, 2] {
        mixture.add_diff(&model, groupid, &diff, &mut rng);
    }
    let mut scores = vec![];
    c.bench_function("score_diff_32_features", |b| {
        b.iter(|| {
            mixture.score_diff(&model, &diff, &mut scores, &mut rng);
            scores.clone()
        })
    });
}

criterion_group!(benches, block_sampler, score_diff);
criterion_main!(benches);
