#[macro_use]
extern crate criterion;

use burn::backend::{Autodiff, NdArray};
use criterion::Criterion;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use sbr_rnn::batch::{sample_training_examples, BatchBuilder, OneHot};
use sbr_rnn::data::{Interaction, Interactions};
use sbr_rnn::models::rnn::Hyperparameters;
use sbr_rnn::models::Tying;

type Backend = Autodiff<NdArray>;

fn synthetic_interactions(num_users: usize, num_items: usize, length: usize) -> Interactions {
    let mut data = Vec::with_capacity(num_users * length);

    for user_id in 0..num_users {
        for timestamp in 0..length {
            let item_id = (user_id * 7 + timestamp * timestamp) % num_items;
            data.push(Interaction::new(user_id, item_id, timestamp));
        }
    }

    Interactions::from(data)
}

fn bench_rnn(c: &mut Criterion) {
    let num_items = 500;
    let data = synthetic_interactions(200, num_items, 30).to_compressed();

    c.bench_function("rnn_epoch", |b| {
        let mut model = Hyperparameters::new(num_items, 20)
            .hidden_dims(vec![32])
            .embedding_dim(32)
            .samples_per_user(2)
            .from_seed([42; 16])
            .build::<Backend>(&Default::default())
            .unwrap();

        b.iter(|| {
            model.train_epoch(&data).unwrap();
        })
    });

    c.bench_function("rnn_tied_step", |b| {
        let mut model = Hyperparameters::new(num_items, 20)
            .hidden_dims(vec![32])
            .embedding_dim(32)
            .tying(Tying::TiedNew)
            .from_seed([42; 16])
            .build::<Backend>(&Default::default())
            .unwrap();

        let mut rng = XorShiftRng::from_seed([42; 16]);
        let examples = sample_training_examples(&data, 1, &mut rng);
        let batch = BatchBuilder::new(20, num_items, OneHot::new(num_items))
            .build(&examples[..16])
            .unwrap();

        b.iter(|| model.train_step(&batch))
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_rnn
}
criterion_main!(benches);
