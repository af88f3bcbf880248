#[macro_use]
extern crate serde_derive;

use std::collections::BTreeMap;
use std::fs::File;
use std::time::{Duration, Instant};

use burn::backend::{Autodiff, NdArray};
use tracing_subscriber::EnvFilter;

use sbr_rnn::data::{user_based_split, Dataset};
use sbr_rnn::datasets::load_csv;
use sbr_rnn::evaluation::{Metric, Metrics};
use sbr_rnn::models::rnn;

type Backend = Autodiff<NdArray>;

#[derive(Debug, Serialize, Deserialize)]
struct Result {
    sps: f32,
    recall: f32,
    elapsed: Duration,
    metrics: BTreeMap<Metric, Vec<f32>>,
    hyperparameters: rnn::Hyperparameters,
}

fn best(metrics: &Metrics, metric: Metric) -> f32 {
    metrics
        .get(metric)
        .iter()
        .cloned()
        .fold(0.0, f32::max)
}

fn fit(dataset: &Dataset, hyper: rnn::Hyperparameters) -> Metrics {
    let device = Default::default();
    let mut model = hyper.build::<Backend>(&device).unwrap();

    model.fit(dataset).unwrap()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut data = load_csv("data.csv").unwrap();
    let mut rng = rand::thread_rng();

    let (train, test) = user_based_split(&mut data, &mut rng, 0.2);
    let dataset = Dataset::new(train.to_compressed(), test.to_compressed());

    for _ in 0..100 {
        let mut results: Vec<Result> = File::open("rnn_results.json")
            .map(|file| serde_json::from_reader(&file).unwrap())
            .unwrap_or_default();

        let hyper = rnn::Hyperparameters::random(data.num_items(), &mut rng);

        let start = Instant::now();
        let metrics = fit(&dataset, hyper.clone());
        let result = Result {
            sps: best(&metrics, Metric::Sps),
            recall: best(&metrics, Metric::Recall),
            elapsed: start.elapsed(),
            metrics: metrics.snapshot(),
            hyperparameters: hyper,
        };

        println!("{:#?}", result);

        if result.sps.is_finite() {
            results.push(result);
            results.sort_by(|a, b| a.sps.partial_cmp(&b.sps).unwrap());
        }

        println!("Best result: {:#?}", results.last());

        File::create("rnn_results.json")
            .map(|file| serde_json::to_writer_pretty(&file, &results).unwrap())
            .unwrap();
    }
}
