//! Callable entry points bound to an assembled network: one gradient step,
//! deterministic prediction, and top-k ranking.
use std::cmp::Ordering;

use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor, TensorData};
use ndarray::{Array2, ArrayBase, Data, Dimension};

use super::network::{LossPolicy, RecommenderNetwork};
use super::optimizers::{UpdateManager, UpdatePlan};
use crate::batch::{Batch, BatchInputs};
use crate::{ItemId, NextItemRanker, PredictionError};

/// Convert a host array into a backend tensor of the backend's float precision.
pub fn to_tensor<B, S, I, const D: usize>(array: &ArrayBase<S, I>, device: &B::Device) -> Tensor<B, D>
where
    B: Backend,
    S: Data<Elem = f32>,
    I: Dimension,
{
    let values: Vec<f32> = array.iter().cloned().collect();
    let data = TensorData::new(values, array.shape().to_vec()).convert::<B::FloatElem>();

    Tensor::from_data(data, device)
}

/// Performs one optimizer step per call.
pub struct TrainFunction<B: AutodiffBackend> {
    network: RecommenderNetwork<B>,
    loss: LossPolicy,
    plan: UpdatePlan<RecommenderNetwork<B>, B>,
    device: B::Device,
}

/// Bind a network, its loss, and an update strategy into a train function.
pub fn compile_train<B: AutodiffBackend>(
    network: RecommenderNetwork<B>,
    loss: LossPolicy,
    update_manager: &UpdateManager,
    device: &B::Device,
) -> TrainFunction<B> {
    tracing::debug!(
        update_manager = %update_manager.name(),
        "Compiling train function"
    );

    TrainFunction {
        network,
        loss,
        plan: update_manager.plan(),
        device: device.clone(),
    }
}

impl<B: AutodiffBackend> TrainFunction<B> {
    /// Take one gradient step on `batch`; returns the loss before the step.
    pub fn step(&mut self, batch: &Batch) -> f32 {
        let input = to_tensor(&batch.inputs.input, &self.device);
        let mask = to_tensor(&batch.inputs.mask, &self.device);
        let target = to_tensor(&batch.target, &self.device);

        let loss = self.loss.loss(&self.network, input, mask, target);
        let value = loss.clone().into_scalar().elem::<f32>();

        self.network = self.plan.apply(loss, self.network.clone());

        value
    }

    /// The network being trained.
    pub fn network(&self) -> &RecommenderNetwork<B> {
        &self.network
    }

    /// Replace the trained parameters, keeping the optimizer state.
    pub fn set_network(&mut self, network: RecommenderNetwork<B>) {
        self.network = network;
    }
}

/// Deterministic forward pass with dropout disabled.
#[derive(Clone, Debug)]
pub struct PredictFunction<B: Backend> {
    network: RecommenderNetwork<B>,
    device: B::Device,
}

/// Snapshot the current parameters into a predict function.
pub fn compile_predict<B: AutodiffBackend>(
    network: &RecommenderNetwork<B>,
    device: &B::Device,
) -> PredictFunction<B::InnerBackend> {
    PredictFunction {
        network: network.valid(),
        device: device.clone(),
    }
}

impl<B: Backend> PredictFunction<B> {
    /// Item distributions, one row per sequence.
    pub fn call(&self, inputs: &BatchInputs) -> Result<Array2<f32>, PredictionError> {
        let input = to_tensor(&inputs.input, &self.device);
        let mask = to_tensor(&inputs.mask, &self.device);

        let output = self.network.forward(input, mask);
        let [batch_size, num_items] = output.dims();
        let values: Vec<f32> = output.into_data().iter::<f32>().collect();

        if values.iter().any(|x| !x.is_finite()) {
            return Err(PredictionError::InvalidPredictionValue);
        }

        Ok(Array2::from_shape_fn((batch_size, num_items), |(row, col)| {
            values[row * num_items + col]
        }))
    }
}

/// Returns the `k` best items of every sequence.
#[derive(Clone, Debug)]
pub struct TestFunction<B: Backend> {
    predict: PredictFunction<B>,
    k: usize,
}

/// Items returned per sequence when no cutoff is given.
pub const DEFAULT_TOP_K: usize = 10;

/// Wrap a predict function into a top-`k` ranker.
pub fn compile_test<B: Backend>(predict: PredictFunction<B>, k: usize) -> TestFunction<B> {
    TestFunction { predict, k }
}

/// [`compile_test`] with the default cutoff of [`DEFAULT_TOP_K`] items.
pub fn compile_test_default<B: Backend>(predict: PredictFunction<B>) -> TestFunction<B> {
    compile_test(predict, DEFAULT_TOP_K)
}

impl<B: Backend> NextItemRanker for TestFunction<B> {
    fn rank(&self, inputs: &BatchInputs) -> Result<Vec<Vec<ItemId>>, PredictionError> {
        let scores = self.predict.call(inputs)?;

        Ok(scores
            .outer_iter()
            .map(|row| top_k_indices(&row.to_vec(), self.k))
            .collect())
    }
}

/// Indices of the `k` highest scores, best first.
///
/// Uses partial selection; only the order among the returned `k` is sorted.
pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<ItemId> {
    let k = k.min(scores.len());

    if k == 0 {
        return Vec::new();
    }

    let descending = |a: &usize, b: &usize| {
        scores[*b]
            .partial_cmp(&scores[*a])
            .unwrap_or(Ordering::Equal)
    };

    let mut indices: Vec<ItemId> = (0..scores.len()).collect();
    indices.select_nth_unstable_by(k - 1, descending);
    indices.truncate(k);
    indices.sort_by(descending);

    indices
}
