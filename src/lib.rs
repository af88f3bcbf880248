#![deny(missing_docs)]
//! # sbr-rnn
//!
//! `sbr-rnn` trains recurrent neural network recommenders that operate on
//! sequences of items: given the items a user has interacted with so far,
//! the model outputs a distribution over the item the user will interact
//! with next.
//!
//! Items are fed to the network one-hot encoded (optionally followed by
//! per-item side features), run through a stack of LSTM or GRU layers,
//! and scored with a softmax over the whole catalogue. The output layer
//! can share its weights with the input embedding ("weight tying"), in
//! which case training minimises a blend of two KL divergences against
//! the true target and a temperature-smoothed target derived from the
//! embedding.
//!
//! ## Example
//!
//! ```rust,no_run
//! # extern crate sbr_rnn;
//! # extern crate rand;
//! # extern crate rand_xorshift;
//! # use rand::SeedableRng;
//! use burn::backend::{Autodiff, NdArray};
//!
//! use sbr_rnn::data::{user_based_split, Dataset};
//! use sbr_rnn::models::optimizers::UpdateManager;
//! use sbr_rnn::models::rnn::Hyperparameters;
//! use sbr_rnn::models::Tying;
//!
//! let mut data = sbr_rnn::datasets::load_csv("data.csv").unwrap();
//! let mut rng = rand_xorshift::XorShiftRng::from_seed([42; 16]);
//!
//! let (train, test) = user_based_split(&mut data, &mut rng, 0.2);
//! let dataset = Dataset::new(train.to_compressed(), test.to_compressed());
//!
//! let device = Default::default();
//! let mut model = Hyperparameters::new(data.num_items(), 30)
//!     .hidden_dims(vec![50])
//!     .embedding_dim(50)
//!     .tying(Tying::TiedNew)
//!     .update_manager(UpdateManager::from_name("adagrad", &Default::default()).unwrap())
//!     .num_epochs(10)
//!     .rng(rng)
//!     .build::<Autodiff<NdArray>>(&device)
//!     .unwrap();
//!
//! let metrics = model.fit(&dataset).unwrap();
//! println!("{:#?}", metrics.snapshot());
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[macro_use]
extern crate failure;

pub mod batch;
pub mod data;
#[cfg(feature = "datasets")]
pub mod datasets;
pub mod evaluation;
pub mod models;

/// Alias for user indices.
pub type UserId = usize;
/// Alias for item indices.
pub type ItemId = usize;
/// Alias for timestamps.
pub type Timestamp = usize;

/// Errors raised while building or validating a model configuration.
///
/// These are fatal: a run with an invalid configuration cannot proceed.
#[derive(Debug, Fail)]
pub enum ConfigurationError {
    /// The requested update strategy is not one of the supported ones.
    #[fail(
        display = "Unknown update strategy '{}': expected one of adagrad, adadelta, rmsprop, nesterov-momentum, adam.",
        _0
    )]
    UnknownUpdateStrategy(String),
    /// Weight tying was requested without an input embedding.
    #[fail(display = "Weight tying requires a non-zero embedding size.")]
    TyingWithoutEmbedding,
    /// Tying reads item embeddings from the first `num_items` input rows.
    #[fail(
        display = "Weight tying requires inputs of at least {} features (one per item), got {}.",
        num_items, input_size
    )]
    TyingInputMismatch {
        /// Width of the input feature vectors.
        input_size: usize,
        /// Number of items.
        num_items: usize,
    },
    /// A shared output projection needs the last hidden layer to match the embedding.
    #[fail(
        display = "Shared output weights require the last hidden size ({}) to equal the embedding size ({}).",
        hidden, embedding
    )]
    TyingHiddenMismatch {
        /// Size of the last recurrent layer.
        hidden: usize,
        /// Size of the embedding.
        embedding: usize,
    },
    /// No recurrent layers were configured.
    #[fail(display = "At least one recurrent layer is required.")]
    NoRecurrentLayers,
    /// The softmax temperature must be strictly positive.
    #[fail(display = "Invalid temperature {}: must be positive.", _0)]
    InvalidTemperature(f32),
    /// Dropout must be a probability in `[0, 1)`.
    #[fail(display = "Invalid dropout probability {}.", _0)]
    InvalidDropout(f64),
    /// Mini-batches need at least one example.
    #[fail(display = "Batch size must be positive.")]
    InvalidBatchSize,
    /// Sequences need at least one step.
    #[fail(display = "Maximum sequence length must be positive.")]
    InvalidSequenceLength,
}

/// Errors raised while turning items into feature vectors.
#[derive(Debug, Fail)]
pub enum FeatureExtractionError {
    /// The item id is outside the known item range.
    #[fail(display = "Unknown item {} (model knows {} items).", item_id, num_items)]
    UnknownItem {
        /// The offending item.
        item_id: ItemId,
        /// Number of items the extractor knows about.
        num_items: usize,
    },
}

/// Errors raised while saving or restoring model parameters.
#[derive(Debug, Fail)]
pub enum PersistenceError {
    /// The stored file holds a different number of parameter tensors.
    #[fail(
        display = "Parameter count mismatch: network has {}, file has {}.",
        expected, found
    )]
    ParameterCount {
        /// Parameters in the current network.
        expected: usize,
        /// Parameters in the file.
        found: usize,
    },
    /// A stored tensor does not match the shape of the network parameter it restores.
    #[fail(
        display = "Shape mismatch for parameter {}: expected {:?}, found {:?}.",
        index, expected, found
    )]
    ShapeMismatch {
        /// Position of the parameter in traversal order.
        index: usize,
        /// Shape of the current network parameter.
        expected: Vec<usize>,
        /// Shape stored in the file.
        found: Vec<usize>,
    },
    /// Reading or writing the parameter file failed.
    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] std::io::Error),
    /// The parameter record could not be encoded or decoded.
    #[fail(display = "Record error: {}", _0)]
    Record(#[cause] burn::record::RecorderError),
}

impl From<std::io::Error> for PersistenceError {
    fn from(error: std::io::Error) -> Self {
        PersistenceError::Io(error)
    }
}

impl From<burn::record::RecorderError> for PersistenceError {
    fn from(error: burn::record::RecorderError) -> Self {
        PersistenceError::Record(error)
    }
}

/// Prediction error types.
#[derive(Debug, Fail)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
    /// Failed to featurize the input sequence.
    #[fail(display = "{}", _0)]
    Features(#[cause] FeatureExtractionError),
}

impl From<FeatureExtractionError> for PredictionError {
    fn from(error: FeatureExtractionError) -> Self {
        PredictionError::Features(error)
    }
}

/// Fitting error types.
#[derive(Debug, Fail)]
pub enum FittingError {
    /// No interactions were given.
    #[fail(display = "No interactions were supplied.")]
    NoInteractions,
    /// Failed to featurize a training batch.
    #[fail(display = "{}", _0)]
    Features(#[cause] FeatureExtractionError),
    /// Validation failed.
    #[fail(display = "{}", _0)]
    Prediction(#[cause] PredictionError),
    /// Saving a checkpoint failed.
    #[fail(display = "{}", _0)]
    Persistence(#[cause] PersistenceError),
}

impl From<FeatureExtractionError> for FittingError {
    fn from(error: FeatureExtractionError) -> Self {
        FittingError::Features(error)
    }
}

impl From<PredictionError> for FittingError {
    fn from(error: PredictionError) -> Self {
        FittingError::Prediction(error)
    }
}

impl From<PersistenceError> for FittingError {
    fn from(error: PersistenceError) -> Self {
        FittingError::Persistence(error)
    }
}

/// Trait describing models that rank candidate next items given
/// featurized interaction histories.
pub trait NextItemRanker {
    /// For every history in `inputs`, return the highest scoring items,
    /// best first.
    fn rank(&self, inputs: &batch::BatchInputs) -> Result<Vec<Vec<ItemId>>, PredictionError>;
}
