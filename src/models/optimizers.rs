//! Gradient update strategies.
//!
//! A strategy is chosen by name together with a handful of tunable
//! hyperparameters. Each strategy has a canonical name that encodes its
//! hyperparameters, used to label runs and checkpoint files.
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{
    AdaGrad, AdaGradConfig, Adam, AdamConfig, GradientsParams, Optimizer, RmsProp,
    RmsPropConfig, Sgd, SgdConfig, SimpleOptimizer,
};
use burn::record::Record;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::ConfigurationError;

/// The externally tunable optimizer knobs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UpdateSettings {
    /// Learning rate.
    pub learning_rate: f64,
    /// Decay for Adadelta and RMSProp, momentum for Nesterov momentum.
    pub rho: f64,
    /// First moment decay for Adam.
    pub beta1: f64,
    /// Second moment decay for Adam.
    pub beta2: f64,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        UpdateSettings {
            learning_rate: 0.1,
            rho: 0.9,
            beta1: 0.9,
            beta2: 0.999,
        }
    }
}

/// Adagrad hyperparameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AdagradParams {
    /// Learning rate.
    pub learning_rate: f64,
}

/// Adadelta hyperparameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AdadeltaParams {
    /// Learning rate.
    pub learning_rate: f64,
    /// Decay of the running averages.
    pub rho: f64,
}

/// RMSProp hyperparameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RmsPropParams {
    /// Learning rate.
    pub learning_rate: f64,
    /// Decay of the squared gradient average.
    pub rho: f64,
}

/// Nesterov momentum hyperparameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NesterovParams {
    /// Learning rate.
    pub learning_rate: f64,
    /// Momentum factor.
    pub momentum: f64,
}

/// Adam hyperparameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AdamParams {
    /// Learning rate.
    pub learning_rate: f64,
    /// First moment decay.
    pub beta1: f64,
    /// Second moment decay.
    pub beta2: f64,
}

/// The supported update strategies.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum UpdateManager {
    /// Adagrad.
    Adagrad(AdagradParams),
    /// Adadelta.
    Adadelta(AdadeltaParams),
    /// RMSProp.
    RmsProp(RmsPropParams),
    /// SGD with Nesterov momentum.
    NesterovMomentum(NesterovParams),
    /// Adam.
    Adam(AdamParams),
}

impl Default for UpdateManager {
    fn default() -> Self {
        UpdateManager::Adagrad(AdagradParams {
            learning_rate: UpdateSettings::default().learning_rate,
        })
    }
}

impl UpdateManager {
    /// Resolve a strategy by name: one of `adagrad`, `adadelta`,
    /// `rmsprop`, `nesterov-momentum` (or `nesterov`), `adam`.
    pub fn from_name(name: &str, settings: &UpdateSettings) -> Result<Self, ConfigurationError> {
        let learning_rate = settings.learning_rate;

        let manager = match name {
            "adagrad" => UpdateManager::Adagrad(AdagradParams { learning_rate }),
            "adadelta" => UpdateManager::Adadelta(AdadeltaParams {
                learning_rate,
                rho: settings.rho,
            }),
            "rmsprop" => UpdateManager::RmsProp(RmsPropParams {
                learning_rate,
                rho: settings.rho,
            }),
            "nesterov-momentum" | "nesterov" => UpdateManager::NesterovMomentum(NesterovParams {
                learning_rate,
                momentum: settings.rho,
            }),
            "adam" => UpdateManager::Adam(AdamParams {
                learning_rate,
                beta1: settings.beta1,
                beta2: settings.beta2,
            }),
            other => return Err(ConfigurationError::UnknownUpdateStrategy(other.to_owned())),
        };

        Ok(manager)
    }

    /// Draw a random strategy and learning rate for hyperparameter search.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let names = ["adagrad", "adadelta", "rmsprop", "nesterov-momentum", "adam"];
        let name = names[Uniform::new(0, names.len()).sample(rng)];
        let settings = UpdateSettings {
            learning_rate: 10.0_f64.powf(Uniform::new(-3.0, 0.0).sample(rng)),
            ..UpdateSettings::default()
        };

        // Every name above is known.
        Self::from_name(name, &settings).unwrap_or_default()
    }

    /// Canonical name encoding the strategy and its hyperparameters.
    pub fn name(&self) -> String {
        match *self {
            UpdateManager::Adagrad(ref p) => format!("Ug_lr{:?}", p.learning_rate),
            UpdateManager::Adadelta(ref p) => {
                format!("Ud_lr{:?}_rho{:?}", p.learning_rate, p.rho)
            }
            UpdateManager::RmsProp(ref p) => format!("Ur_lr{:?}_rho{:?}", p.learning_rate, p.rho),
            UpdateManager::NesterovMomentum(ref p) => {
                format!("Un_lr{:?}_m{:?}", p.learning_rate, p.momentum)
            }
            UpdateManager::Adam(ref p) => format!(
                "Ua_lr{:?}_b1_{:?}_b2_{:?}",
                p.learning_rate, p.beta1, p.beta2
            ),
        }
    }

    /// The learning rate of the strategy.
    pub fn learning_rate(&self) -> f64 {
        match *self {
            UpdateManager::Adagrad(ref p) => p.learning_rate,
            UpdateManager::Adadelta(ref p) => p.learning_rate,
            UpdateManager::RmsProp(ref p) => p.learning_rate,
            UpdateManager::NesterovMomentum(ref p) => p.learning_rate,
            UpdateManager::Adam(ref p) => p.learning_rate,
        }
    }

    /// Instantiate the optimizer state for `module`'s parameters.
    pub fn plan<B, M>(&self) -> UpdatePlan<M, B>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let optimizer = match *self {
            UpdateManager::Adagrad(_) => Strategy::Adagrad(AdaGradConfig::new().init()),
            UpdateManager::Adadelta(ref p) => Strategy::Adadelta(OptimizerAdaptor::from(
                Adadelta {
                    rho: p.rho as f32,
                    epsilon: 1e-6,
                },
            )),
            UpdateManager::RmsProp(ref p) => Strategy::RmsProp(
                RmsPropConfig::new()
                    .with_alpha(p.rho as f32)
                    .with_momentum(0.0)
                    .init(),
            ),
            UpdateManager::NesterovMomentum(ref p) => Strategy::Nesterov(
                SgdConfig::new()
                    .with_momentum(Some(
                        MomentumConfig::new()
                            .with_momentum(p.momentum)
                            .with_dampening(0.0)
                            .with_nesterov(true),
                    ))
                    .init(),
            ),
            UpdateManager::Adam(ref p) => Strategy::Adam(
                AdamConfig::new()
                    .with_beta_1(p.beta1 as f32)
                    .with_beta_2(p.beta2 as f32)
                    .init(),
            ),
        };

        UpdatePlan {
            learning_rate: self.learning_rate(),
            optimizer,
        }
    }
}

enum Strategy<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    Adagrad(OptimizerAdaptor<AdaGrad, M, B>),
    Adadelta(OptimizerAdaptor<Adadelta, M, B>),
    RmsProp(OptimizerAdaptor<RmsProp, M, B>),
    Nesterov(OptimizerAdaptor<Sgd<B::InnerBackend>, M, B>),
    Adam(OptimizerAdaptor<Adam, M, B>),
}

/// Optimizer state bound to one module type, ready to apply updates.
pub struct UpdatePlan<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    learning_rate: f64,
    optimizer: Strategy<M, B>,
}

impl<M, B> UpdatePlan<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    /// Backpropagate `loss` and return the updated module.
    pub fn apply(&mut self, loss: Tensor<B, 1>, module: M) -> M {
        let grads = GradientsParams::from_grads(loss.backward(), &module);
        let lr = self.learning_rate;

        match self.optimizer {
            Strategy::Adagrad(ref mut optim) => optim.step(lr, module, grads),
            Strategy::Adadelta(ref mut optim) => optim.step(lr, module, grads),
            Strategy::RmsProp(ref mut optim) => optim.step(lr, module, grads),
            Strategy::Nesterov(ref mut optim) => optim.step(lr, module, grads),
            Strategy::Adam(ref mut optim) => optim.step(lr, module, grads),
        }
    }
}

/// Adadelta: per-parameter step sizes from running averages of squared
/// gradients and squared updates.
#[derive(Clone, Debug)]
pub struct Adadelta {
    rho: f32,
    epsilon: f32,
}

/// Adadelta running averages.
#[derive(Record, Clone)]
pub struct AdadeltaState<B: Backend, const D: usize> {
    square_avg: Tensor<B, D>,
    delta_avg: Tensor<B, D>,
}

impl<B: Backend> SimpleOptimizer<B> for Adadelta {
    type State<const D: usize> = AdadeltaState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: f64,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let (square_avg, delta_avg) = match state {
            Some(state) => (state.square_avg, state.delta_avg),
            None => (grad.zeros_like(), grad.zeros_like()),
        };

        let rho = self.rho as f64;
        let square_avg = square_avg
            .mul_scalar(rho)
            .add(grad.clone().square().mul_scalar(1.0 - rho));
        let update = grad
            .mul(delta_avg.clone().add_scalar(self.epsilon).sqrt())
            .div(square_avg.clone().add_scalar(self.epsilon).sqrt());
        let delta_avg = delta_avg
            .mul_scalar(rho)
            .add(update.clone().square().mul_scalar(1.0 - rho));

        let state = AdadeltaState {
            square_avg,
            delta_avg,
        };

        (tensor.sub(update.mul_scalar(lr)), Some(state))
    }

    fn to_device<const D: usize>(state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        AdadeltaState {
            square_avg: state.square_avg.to_device(device),
            delta_avg: state.delta_avg.to_device(device),
        }
    }
}
