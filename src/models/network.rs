//! The recurrent network and its training objective.
//!
//! One-hot item features are (optionally) embedded, run through a stack of
//! recurrent layers, and the hidden state at the last valid step of every
//! sequence is scored against all items.
//!
//! In untied mode the scores come from an independent dense layer and the
//! objective is the categorical cross-entropy against the one-hot target.
//!
//! In tied mode the scores are `h·Eᵀ + b`, where `E` is the input embedding
//! (or, without weight sharing, a separate bias-free projection). The
//! objective is
//!
//! ```text
//! KL(target ‖ p) + γ·T·KL(smoothed ‖ q)
//! ```
//!
//! where `p` is the prediction, `smoothed = softmax(target·E·Eᵀ / T)` (or the
//! raw target when target derivation is off), and `q` is either `p` itself
//! ([`Tying::TiedNew`]) or `softmax(h·Eᵀ / T)` ([`Tying::TiedClassic`]).
//!
//! Every probability is clamped to `[EPSILON, 1]` before a logarithm.
use burn::module::{Module, Param};
use burn::nn::gru::{Gru, GruConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, Lstm, LstmConfig};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::{CellKind, Tying};
use crate::ConfigurationError;

/// Lower clamp applied to probabilities before taking logarithms.
pub const EPSILON: f32 = 1e-8;

/// A single recurrent layer.
#[derive(Module, Debug)]
pub enum RecurrentCell<B: Backend> {
    /// LSTM layer.
    Lstm(Lstm<B>),
    /// GRU layer.
    Gru(Gru<B>),
}

impl<B: Backend> RecurrentCell<B> {
    fn new(kind: CellKind, d_input: usize, d_hidden: usize, device: &B::Device) -> Self {
        match kind {
            CellKind::Lstm => RecurrentCell::Lstm(LstmConfig::new(d_input, d_hidden, true).init(device)),
            CellKind::Gru => RecurrentCell::Gru(GruConfig::new(d_input, d_hidden, true).init(device)),
        }
    }

    /// `[batch, steps, d_input]` to `[batch, steps, d_hidden]`.
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        match self {
            RecurrentCell::Lstm(lstm) => lstm.forward(input, None).0,
            RecurrentCell::Gru(gru) => gru.forward(input, None),
        }
    }
}

/// Optional input embedding and an independent dense output layer.
#[derive(Module, Debug)]
pub struct DenseLayers<B: Backend> {
    embedding: Option<Linear<B>>,
    output: Linear<B>,
}

/// Input embedding and the output layer tied to it.
#[derive(Module, Debug)]
pub struct TiedLayers<B: Backend> {
    embedding: Linear<B>,
    /// Own bias-free projection. Without one, hidden states are scored
    /// against the item rows of `embedding`.
    projection: Option<Linear<B>>,
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> TiedLayers<B> {
    fn item_embeddings(&self, num_items: usize) -> Tensor<B, 2> {
        self.embedding.weight.val().narrow(0, 0, num_items)
    }
}

/// The layers that map items in and out of the recurrent stack.
#[derive(Module, Debug)]
pub enum ItemLayers<B: Backend> {
    /// Untied network.
    Dense(DenseLayers<B>),
    /// Embedding-tied network.
    Tied(TiedLayers<B>),
}

/// Pre-softmax quantities of a forward pass.
#[derive(Debug)]
pub struct NetworkOutputs<B: Backend> {
    /// Item scores before the output bias, `[batch, num_items]`.
    pub projection: Tensor<B, 2>,
    /// Item scores, `[batch, num_items]`.
    pub logits: Tensor<B, 2>,
}

/// The assembled network.
#[derive(Module, Debug)]
pub struct RecommenderNetwork<B: Backend> {
    num_items: usize,
    items: ItemLayers<B>,
    recurrent: Vec<RecurrentCell<B>>,
    dropout: Dropout,
}

impl<B: Backend> RecommenderNetwork<B> {
    /// Number of items scored.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    fn embedding(&self) -> Option<&Linear<B>> {
        match self.items {
            ItemLayers::Dense(ref layers) => layers.embedding.as_ref(),
            ItemLayers::Tied(ref layers) => Some(&layers.embedding),
        }
    }

    /// Item rows of the input embedding, `[num_items, embedding_dim]`.
    pub fn item_embeddings(&self) -> Option<Tensor<B, 2>> {
        self.embedding()
            .map(|embedding| embedding.weight.val().narrow(0, 0, self.num_items))
    }

    /// The learned output bias.
    pub fn output_bias(&self) -> Option<Tensor<B, 1>> {
        match self.items {
            ItemLayers::Dense(ref layers) => layers.output.bias.as_ref().map(|bias| bias.val()),
            ItemLayers::Tied(ref layers) => Some(layers.bias.val()),
        }
    }

    /// Run the network up to the output scores.
    pub fn outputs(&self, input: Tensor<B, 3>, mask: Tensor<B, 2>) -> NetworkOutputs<B> {
        let mut sequence = match self.embedding() {
            Some(embedding) => embedding.forward(input),
            None => input,
        };

        for layer in &self.recurrent {
            sequence = self.dropout.forward(layer.forward(sequence));
        }

        let hidden = last_valid_step(sequence, mask);

        match self.items {
            ItemLayers::Dense(ref layers) => {
                let logits = layers.output.forward(hidden);
                NetworkOutputs {
                    projection: logits.clone(),
                    logits,
                }
            }
            ItemLayers::Tied(ref layers) => {
                let projection = match layers.projection {
                    Some(ref projection) => projection.forward(hidden),
                    None => hidden.matmul(layers.item_embeddings(self.num_items).transpose()),
                };
                let logits = projection.clone() + layers.bias.val().unsqueeze::<2>();

                NetworkOutputs { projection, logits }
            }
        }
    }

    /// Distribution over the next item, `[batch, num_items]`.
    pub fn forward(&self, input: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
        softmax(self.outputs(input, mask).logits, 1)
    }
}

/// Select the hidden state at the last valid step of each left-packed
/// sequence. Rows with no valid steps yield zeros.
pub fn last_valid_step<B: Backend>(sequence: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch_size, steps] = mask.dims();

    let selector = if steps > 1 {
        let next = Tensor::cat(
            vec![
                mask.clone().narrow(1, 1, steps - 1),
                Tensor::zeros([batch_size, 1], &mask.device()),
            ],
            1,
        );
        mask - next
    } else {
        mask
    };

    (sequence * selector.unsqueeze_dim::<3>(2))
        .sum_dim(1)
        .squeeze_dim::<2>(1)
}

/// Mean over the batch of `-Σ target·log(prediction)`.
pub fn categorical_crossentropy<B: Backend>(
    target: Tensor<B, 2>,
    prediction: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let target = target.clamp(EPSILON, 1.0);
    let prediction = prediction.clamp(EPSILON, 1.0);

    (target * prediction.log())
        .sum_dim(1)
        .mean()
        .neg()
}

/// Mean over the batch of `Σ p·log(p/q)`.
pub fn kullback_leibler<B: Backend>(p: Tensor<B, 2>, q: Tensor<B, 2>) -> Tensor<B, 1> {
    let p = p.clamp(EPSILON, 1.0);
    let q = q.clamp(EPSILON, 1.0);

    (p.clone() * (p.log() - q.log())).sum_dim(1).mean()
}

/// Softmax of `logits / temperature` over the item axis.
pub fn softmax_temperature<B: Backend>(logits: Tensor<B, 2>, temperature: f32) -> Tensor<B, 2> {
    softmax(logits.div_scalar(temperature), 1)
}

/// Smooth one-hot targets through the item embeddings:
/// `softmax(target·E·Eᵀ / T)`. No gradient flows into `E`.
pub fn smoothed_target<B: Backend>(
    target: Tensor<B, 2>,
    item_embeddings: Tensor<B, 2>,
    temperature: f32,
) -> Tensor<B, 2> {
    let item_embeddings = item_embeddings.detach();
    let similarities = target
        .matmul(item_embeddings.clone())
        .matmul(item_embeddings.transpose());

    softmax_temperature(similarities, temperature)
}

/// Penalty on the output bias: `coef·Σb²` for positive coefficients,
/// `|coef|·Σ|b|` for negative ones, nothing for zero.
pub fn regularization_penalty<B: Backend>(coefficient: f32, bias: Tensor<B, 1>) -> Tensor<B, 1> {
    if coefficient > 0.0 {
        bias.square().sum().mul_scalar(coefficient)
    } else if coefficient < 0.0 {
        bias.abs().sum().mul_scalar(coefficient.abs())
    } else {
        Tensor::zeros([1], &bias.device())
    }
}

/// How the scalar training loss is formed from a forward pass.
#[derive(Clone, Debug, PartialEq)]
pub struct LossPolicy {
    tying: Tying,
    temperature: f32,
    gamma: f32,
    derive_target: bool,
    regularization: f32,
}

impl LossPolicy {
    /// Target of the secondary tied objective: the smoothed target when
    /// target derivation is on, the one-hot target itself otherwise.
    pub fn secondary_target<B: Backend>(
        &self,
        network: &RecommenderNetwork<B>,
        target: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        match network.item_embeddings() {
            Some(embeddings) if self.derive_target => {
                smoothed_target(target, embeddings, self.temperature)
            }
            _ => target,
        }
    }

    /// Scalar loss of `network` on one batch.
    pub fn loss<B: Backend>(
        &self,
        network: &RecommenderNetwork<B>,
        input: Tensor<B, 3>,
        mask: Tensor<B, 2>,
        target: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let outputs = network.outputs(input, mask);
        let prediction = softmax(outputs.logits, 1);

        let loss = match self.tying {
            Tying::Untied => categorical_crossentropy(target, prediction),
            Tying::TiedClassic | Tying::TiedNew => {
                let smoothed = self.secondary_target(network, target.clone());
                let secondary = if self.tying == Tying::TiedNew {
                    prediction.clone()
                } else {
                    softmax_temperature(outputs.projection, self.temperature)
                };

                kullback_leibler(target, prediction)
                    + kullback_leibler(smoothed, secondary)
                        .mul_scalar(self.gamma * self.temperature)
            }
        };

        match network.output_bias() {
            Some(bias) if self.regularization != 0.0 => {
                loss + regularization_penalty(self.regularization, bias)
            }
            _ => loss,
        }
    }
}

/// Everything needed to assemble a network and its loss.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Number of items scored.
    pub num_items: usize,
    /// Width of the input feature vectors.
    pub input_size: usize,
    /// Recurrent layer type.
    pub cell: CellKind,
    /// Hidden sizes of the stacked recurrent layers.
    pub hidden_dims: Vec<usize>,
    /// Input embedding size; zero feeds features straight to the recurrent layers.
    pub embedding_dim: usize,
    /// Dropout after every recurrent layer.
    pub dropout: f64,
    /// Output tying mode.
    pub tying: Tying,
    /// Smooth the secondary target through the embedding.
    pub derive_target: bool,
    /// Reuse the embedding as the output projection.
    pub share_weights: bool,
    /// Softmax temperature of the secondary objective.
    pub temperature: f32,
    /// Weight of the secondary objective.
    pub gamma: f32,
    /// Output bias regularization coefficient.
    pub regularization: f32,
}

impl NetworkConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        let last_hidden = *self
            .hidden_dims
            .last()
            .ok_or(ConfigurationError::NoRecurrentLayers)?;

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigurationError::InvalidDropout(self.dropout));
        }

        if !self.tying.is_tied() {
            return Ok(());
        }

        if self.embedding_dim == 0 {
            return Err(ConfigurationError::TyingWithoutEmbedding);
        }

        if !(self.temperature > 0.0) {
            return Err(ConfigurationError::InvalidTemperature(self.temperature));
        }

        if self.input_size < self.num_items {
            return Err(ConfigurationError::TyingInputMismatch {
                input_size: self.input_size,
                num_items: self.num_items,
            });
        }

        if self.share_weights && last_hidden != self.embedding_dim {
            return Err(ConfigurationError::TyingHiddenMismatch {
                hidden: last_hidden,
                embedding: self.embedding_dim,
            });
        }

        Ok(())
    }

    /// Build the network and its loss, checking the configuration first.
    pub fn assemble<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<(RecommenderNetwork<B>, LossPolicy), ConfigurationError> {
        self.validate()?;

        let embedding = || -> Linear<B> {
            LinearConfig::new(self.input_size, self.embedding_dim)
                .with_bias(false)
                .init(device)
        };

        let mut d_input = if self.embedding_dim > 0 {
            self.embedding_dim
        } else {
            self.input_size
        };
        let mut recurrent = Vec::with_capacity(self.hidden_dims.len());
        for &d_hidden in &self.hidden_dims {
            recurrent.push(RecurrentCell::new(self.cell, d_input, d_hidden, device));
            d_input = d_hidden;
        }

        let items = if self.tying.is_tied() {
            ItemLayers::Tied(TiedLayers {
                embedding: embedding(),
                projection: if self.share_weights {
                    None
                } else {
                    Some(
                        LinearConfig::new(d_input, self.num_items)
                            .with_bias(false)
                            .init(device),
                    )
                },
                bias: Param::from_tensor(Tensor::zeros([self.num_items], device)),
            })
        } else {
            ItemLayers::Dense(DenseLayers {
                embedding: if self.embedding_dim > 0 {
                    Some(embedding())
                } else {
                    None
                },
                output: LinearConfig::new(d_input, self.num_items).init(device),
            })
        };

        let network = RecommenderNetwork {
            num_items: self.num_items,
            items,
            recurrent,
            dropout: DropoutConfig::new(self.dropout).init(),
        };

        let policy = LossPolicy {
            tying: self.tying,
            temperature: self.temperature,
            gamma: self.gamma,
            derive_target: self.derive_target,
            regularization: self.regularization,
        };

        Ok((network, policy))
    }
}
