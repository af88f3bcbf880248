//! Recurrent next-item recommender.
//!
//! The model reads the (truncated) history of a user one item at a time
//! and outputs a distribution over the item that comes next. It is
//! configured through [`Hyperparameters`] and trained with
//! [`RnnRecommender::fit`], which alternates training epochs and
//! validation passes:
//!
//! ```rust,no_run
//! # use burn::backend::{Autodiff, NdArray};
//! # use sbr_rnn::data::Dataset;
//! # use sbr_rnn::models::rnn::Hyperparameters;
//! # use sbr_rnn::models::CellKind;
//! # fn run(dataset: &Dataset) {
//! let mut model = Hyperparameters::new(1000, 20)
//!     .cell(CellKind::Gru)
//!     .hidden_dims(vec![32])
//!     .build::<Autodiff<NdArray>>(&Default::default())
//!     .unwrap();
//!
//! let metrics = model.fit(dataset).unwrap();
//! let next = model.recommend(&[3, 17, 42], 10).unwrap();
//! # }
//! ```
use std::path::{Path, PathBuf};

use burn::tensor::backend::AutodiffBackend;
use itertools::Itertools;
use ndarray::Array2;
use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use super::functions::{
    compile_predict, compile_test, compile_train, top_k_indices, TrainFunction, DEFAULT_TOP_K,
};
use super::network::{NetworkConfig, RecommenderNetwork};
use super::optimizers::UpdateManager;
use super::persistence::{self, FRAMEWORK};
use super::validation::{self, ValidationMode};
use super::{CellKind, Tying};
use crate::batch::{sample_training_examples, Batch, BatchBuilder, BatchInputs, FeatureExtractor, OneHot};
use crate::data::{CompressedInteractions, SequenceDataset};
use crate::evaluation::{Evaluator, Metric, Metrics, RankingEvaluator};
use crate::{ConfigurationError, FittingError, ItemId, NextItemRanker, PersistenceError, PredictionError};

/// Hyperparameters describing the recurrent model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hyperparameters {
    num_items: usize,
    max_sequence_length: usize,
    batch_size: usize,
    cell: CellKind,
    hidden_dims: Vec<usize>,
    embedding_dim: usize,
    dropout: f64,
    tying: Tying,
    derive_target: bool,
    share_weights: bool,
    temperature: f32,
    gamma: f32,
    regularization: f32,
    diversity_bias: f32,
    update_manager: UpdateManager,
    incremental_evaluation: bool,
    samples_per_user: usize,
    num_epochs: usize,
    top_k: usize,
    save_dir: Option<PathBuf>,
    rng: XorShiftRng,
}

impl Hyperparameters {
    /// Build new hyperparameters.
    pub fn new(num_items: usize, max_sequence_length: usize) -> Self {
        Hyperparameters {
            num_items,
            max_sequence_length,
            batch_size: 16,
            cell: CellKind::Lstm,
            hidden_dims: vec![50],
            embedding_dim: 0,
            dropout: 0.0,
            tying: Tying::Untied,
            derive_target: true,
            share_weights: true,
            temperature: 10.0,
            gamma: 0.5,
            regularization: 0.0,
            diversity_bias: 0.0,
            update_manager: UpdateManager::default(),
            incremental_evaluation: false,
            samples_per_user: 10,
            num_epochs: 10,
            top_k: DEFAULT_TOP_K,
            save_dir: None,
            rng: XorShiftRng::from_seed(rand::thread_rng().gen()),
        }
    }

    /// Set the mini-batch size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the recurrent layer type.
    pub fn cell(mut self, cell: CellKind) -> Self {
        self.cell = cell;
        self
    }

    /// Set the sizes of the stacked recurrent layers.
    pub fn hidden_dims(mut self, hidden_dims: Vec<usize>) -> Self {
        self.hidden_dims = hidden_dims;
        self
    }

    /// Set the embedding dimensionality. Zero feeds the item features
    /// straight into the recurrent layers.
    pub fn embedding_dim(mut self, embedding_dim: usize) -> Self {
        self.embedding_dim = embedding_dim;
        self
    }

    /// Set the dropout probability applied after every recurrent layer.
    pub fn dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    /// Set the output tying mode.
    pub fn tying(mut self, tying: Tying) -> Self {
        self.tying = tying;
        self
    }

    /// Set whether the secondary target of a tied model is smoothed
    /// through the embedding.
    pub fn derive_target(mut self, derive_target: bool) -> Self {
        self.derive_target = derive_target;
        self
    }

    /// Set whether a tied model reuses the embedding as its output weights.
    pub fn share_weights(mut self, share_weights: bool) -> Self {
        self.share_weights = share_weights;
        self
    }

    /// Set the softmax temperature of the secondary objective.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the weight of the secondary objective.
    pub fn gamma(mut self, gamma: f32) -> Self {
        self.gamma = gamma;
        self
    }

    /// Set the output bias regularization: positive values give an L2
    /// penalty, negative values an L1 penalty.
    pub fn regularization(mut self, regularization: f32) -> Self {
        self.regularization = regularization;
        self
    }

    /// Set the diversity bias. Accepted but not applied to the loss.
    pub fn diversity_bias(mut self, diversity_bias: f32) -> Self {
        self.diversity_bias = diversity_bias;
        self
    }

    /// Set the update strategy.
    pub fn update_manager(mut self, update_manager: UpdateManager) -> Self {
        self.update_manager = update_manager;
        self
    }

    /// Set whether validation replays every prefix of every sequence.
    pub fn incremental_evaluation(mut self, incremental_evaluation: bool) -> Self {
        self.incremental_evaluation = incremental_evaluation;
        self
    }

    /// Set the number of training examples cut from each user per epoch.
    pub fn samples_per_user(mut self, samples_per_user: usize) -> Self {
        self.samples_per_user = samples_per_user;
        self
    }

    /// Set the number of epochs to run per each `fit` call.
    pub fn num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Set the number of items ranked during validation.
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Save the parameters into this directory after every epoch.
    pub fn save_dir<P: Into<PathBuf>>(mut self, save_dir: P) -> Self {
        self.save_dir = Some(save_dir.into());
        self
    }

    /// Set the random number generator.
    pub fn rng(mut self, rng: XorShiftRng) -> Self {
        self.rng = rng;
        self
    }

    /// Set the random number generator from seed.
    pub fn from_seed(mut self, seed: [u8; 16]) -> Self {
        self.rng = XorShiftRng::from_seed(seed);
        self
    }

    /// Set hyperparameters randomly: useful for hyperparameter search.
    pub fn random<R: Rng>(num_items: usize, rng: &mut R) -> Self {
        let embedding_dim = 2_usize.pow(Uniform::new(3, 7).sample(rng));
        let num_layers = Uniform::new(1, 3).sample(rng);

        Hyperparameters {
            num_items,
            max_sequence_length: 2_usize.pow(Uniform::new(3, 7).sample(rng)),
            batch_size: 2_usize.pow(Uniform::new(3, 7).sample(rng)),
            cell: if rng.gen::<f32>() < 0.5 {
                CellKind::Lstm
            } else {
                CellKind::Gru
            },
            hidden_dims: vec![embedding_dim; num_layers],
            embedding_dim,
            dropout: Uniform::new(0.0, 0.5).sample(rng),
            tying: match Uniform::new(0, 3).sample(rng) {
                0 => Tying::Untied,
                1 => Tying::TiedClassic,
                _ => Tying::TiedNew,
            },
            derive_target: rng.gen::<f32>() < 0.5,
            share_weights: true,
            temperature: 10.0_f32.powf(Uniform::new(-1.0, 1.5).sample(rng)),
            gamma: Uniform::new(0.0, 1.0).sample(rng),
            regularization: if rng.gen::<f32>() < 0.5 {
                0.0
            } else {
                10.0_f32.powf(Uniform::new(-6.0, -2.0).sample(rng))
            },
            diversity_bias: 0.0,
            update_manager: UpdateManager::random(rng),
            incremental_evaluation: false,
            samples_per_user: Uniform::new(1, 11).sample(rng),
            num_epochs: 2_usize.pow(Uniform::new(2, 5).sample(rng)),
            top_k: DEFAULT_TOP_K,
            save_dir: None,
            rng: XorShiftRng::from_seed(rand::thread_rng().gen()),
        }
    }

    /// Canonical name of the parameter file written after `epochs` epochs.
    pub fn model_filename(&self, epochs: usize) -> String {
        let mut summary = format!(
            "{}{}_emb{}{}",
            self.cell.tag(),
            self.hidden_dims.iter().join("-"),
            self.embedding_dim,
            self.tying.tag(),
        );

        if self.tying.is_tied() {
            if !self.derive_target {
                summary.push_str("_notd");
            }
            if !self.share_weights {
                summary.push_str("_nowt");
            }
            summary.push_str(&format!("_T{:?}_g{:?}", self.temperature, self.gamma));
        }
        if self.dropout > 0.0 {
            summary.push_str(&format!("_dr{:?}", self.dropout));
        }
        if self.regularization != 0.0 {
            summary.push_str(&format!("_r{:?}", self.regularization));
        }
        if self.diversity_bias != 0.0 {
            summary.push_str(&format!("_db{:?}", self.diversity_bias));
        }

        format!(
            "rnn_cce_{}_{}_ml{}_bs{}_ne{}.{}",
            summary,
            self.update_manager.name(),
            self.max_sequence_length,
            self.batch_size,
            epochs,
            FRAMEWORK
        )
    }

    fn network_config(&self, input_size: usize) -> NetworkConfig {
        NetworkConfig {
            num_items: self.num_items,
            input_size,
            cell: self.cell,
            hidden_dims: self.hidden_dims.clone(),
            embedding_dim: self.embedding_dim,
            dropout: self.dropout,
            tying: self.tying,
            derive_target: self.derive_target,
            share_weights: self.share_weights,
            temperature: self.temperature,
            gamma: self.gamma,
            regularization: self.regularization,
        }
    }

    /// Build a model over one-hot item inputs.
    pub fn build<B: AutodiffBackend>(
        self,
        device: &B::Device,
    ) -> Result<RnnRecommender<B, OneHot>, ConfigurationError> {
        let features = OneHot::new(self.num_items);
        self.build_with_features(features, device)
    }

    /// Build a model over inputs produced by `features`.
    pub fn build_with_features<B: AutodiffBackend, F: FeatureExtractor>(
        mut self,
        features: F,
        device: &B::Device,
    ) -> Result<RnnRecommender<B, F>, ConfigurationError> {
        if self.batch_size == 0 {
            return Err(ConfigurationError::InvalidBatchSize);
        }
        if self.max_sequence_length == 0 {
            return Err(ConfigurationError::InvalidSequenceLength);
        }
        if self.diversity_bias != 0.0 {
            tracing::warn!(
                diversity_bias = self.diversity_bias,
                "Diversity bias is not applied to the loss"
            );
        }

        B::seed(device, self.rng.gen());

        let (network, loss) = self
            .network_config(features.input_size())
            .assemble::<B>(device)?;
        let train = compile_train(network, loss, &self.update_manager, device);
        let builder = BatchBuilder::new(self.max_sequence_length, self.num_items, features);

        Ok(RnnRecommender {
            hyper: self,
            builder,
            train,
            device: device.clone(),
            epochs_trained: 0,
        })
    }
}

/// Recurrent recommender trained to predict the next item of a sequence.
pub struct RnnRecommender<B: AutodiffBackend, F> {
    hyper: Hyperparameters,
    builder: BatchBuilder<F>,
    train: TrainFunction<B>,
    device: B::Device,
    epochs_trained: usize,
}

impl<B: AutodiffBackend, F: FeatureExtractor> RnnRecommender<B, F> {
    /// The hyperparameters the model was built with.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// The network being trained.
    pub fn network(&self) -> &RecommenderNetwork<B> {
        self.train.network()
    }

    /// Number of epochs completed over all `fit` calls.
    pub fn epochs_trained(&self) -> usize {
        self.epochs_trained
    }

    /// Canonical parameter file name at the current epoch count.
    pub fn model_filename(&self) -> String {
        self.hyper.model_filename(self.epochs_trained)
    }

    /// Train for the configured number of epochs, validating after each.
    ///
    /// Returns one value per epoch for every metric.
    pub fn fit<D: SequenceDataset + ?Sized>(&mut self, dataset: &D) -> Result<Metrics, FittingError> {
        if dataset.training_set().is_empty() {
            return Err(FittingError::NoInteractions);
        }

        let mut metrics = Metrics::new();
        let mut evaluator = RankingEvaluator::new(self.hyper.top_k, dataset.item_popularity());

        for _ in 0..self.hyper.num_epochs {
            let loss = self.train_epoch(dataset.training_set())?;
            self.compute_validation_metrics(dataset, &mut evaluator, &mut metrics)?;
            self.epochs_trained += 1;

            tracing::info!(
                epoch = self.epochs_trained,
                loss,
                recall = metrics.last(Metric::Recall).unwrap_or(0.0),
                sps = metrics.last(Metric::Sps).unwrap_or(0.0),
                ndcg = metrics.last(Metric::Ndcg).unwrap_or(0.0),
                item_coverage = metrics.last(Metric::ItemCoverage).unwrap_or(0.0),
                "Finished epoch"
            );

            if let Some(ref save_dir) = self.hyper.save_dir {
                let path = save_dir.join(self.hyper.model_filename(self.epochs_trained));
                self.save(&path)?;
            }
        }

        Ok(metrics)
    }

    /// Run one epoch over freshly sampled examples; returns the mean batch loss.
    pub fn train_epoch(&mut self, interactions: &CompressedInteractions) -> Result<f32, FittingError> {
        let mut examples = sample_training_examples(
            interactions,
            self.hyper.samples_per_user,
            &mut self.hyper.rng,
        );

        if examples.is_empty() {
            return Err(FittingError::NoInteractions);
        }

        examples.shuffle(&mut self.hyper.rng);

        let mut loss = 0.0;
        let mut num_batches = 0;

        for chunk in examples.chunks(self.hyper.batch_size) {
            let batch = self.builder.build(chunk)?;
            loss += self.train.step(&batch);
            num_batches += 1;
        }

        Ok(loss / num_batches as f32)
    }

    /// One gradient step on a prepared batch; returns the loss before the step.
    pub fn train_step(&mut self, batch: &Batch) -> f32 {
        self.train.step(batch)
    }

    /// Run one validation pass and append its aggregates to `metrics`.
    pub fn compute_validation_metrics<D, E>(
        &self,
        dataset: &D,
        evaluator: &mut E,
        metrics: &mut Metrics,
    ) -> Result<(), PredictionError>
    where
        D: SequenceDataset + ?Sized,
        E: Evaluator + ?Sized,
    {
        let ranker = compile_test(
            compile_predict(self.train.network(), &self.device),
            self.hyper.top_k,
        );
        let mode = if self.hyper.incremental_evaluation {
            ValidationMode::Incremental
        } else {
            ValidationMode::Batch {
                batch_size: self.hyper.batch_size,
            }
        };

        validation::compute_validation_metrics(dataset, &self.builder, &ranker, evaluator, mode, metrics)
    }

    /// Next-item distributions, one row per history.
    pub fn predict(&self, histories: &[&[ItemId]]) -> Result<Array2<f32>, PredictionError> {
        let inputs = self.builder.build_inputs(histories)?;
        compile_predict(self.train.network(), &self.device).call(&inputs)
    }

    /// The `k` most likely next items after `history`, best first.
    pub fn recommend(&self, history: &[ItemId], k: usize) -> Result<Vec<ItemId>, PredictionError> {
        let scores = self.predict(&[history])?;

        Ok(scores
            .outer_iter()
            .next()
            .map(|row| top_k_indices(&row.to_vec(), k))
            .unwrap_or_default())
    }

    /// Write the network parameters to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), PersistenceError> {
        persistence::save::<B, _, _>(self.train.network(), path)
    }

    /// Restore the network parameters from `path`.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PersistenceError> {
        let network = persistence::load::<B, _, _>(self.train.network().clone(), path, &self.device)?;
        self.train.set_network(network);

        Ok(())
    }
}

impl<B: AutodiffBackend, F: FeatureExtractor> NextItemRanker for RnnRecommender<B, F> {
    fn rank(&self, inputs: &BatchInputs) -> Result<Vec<Vec<ItemId>>, PredictionError> {
        compile_test(
            compile_predict(self.train.network(), &self.device),
            self.hyper.top_k,
        )
        .rank(inputs)
    }
}
