//! Models module.
pub mod functions;
pub mod network;
pub mod optimizers;
pub mod persistence;
pub mod rnn;
pub mod validation;

/// How the output layer relates to the input embedding.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Tying {
    /// Independent dense output layer trained with categorical cross-entropy.
    Untied,
    /// Output scores reuse the embedding; the smoothed target is matched
    /// against a separate temperature-scaled softmax of the projection.
    TiedClassic,
    /// Output scores reuse the embedding; the smoothed target is matched
    /// against the prediction itself.
    TiedNew,
}

impl Tying {
    /// True for either tied variant.
    pub fn is_tied(&self) -> bool {
        *self != Tying::Untied
    }

    fn tag(&self) -> &'static str {
        match *self {
            Tying::Untied => "",
            Tying::TiedClassic => "_ti",
            Tying::TiedNew => "_tin",
        }
    }
}

/// The recurrent layer type.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CellKind {
    /// Long short-term memory.
    Lstm,
    /// Gated recurrent unit.
    Gru,
}

impl CellKind {
    fn tag(&self) -> &'static str {
        match *self {
            CellKind::Lstm => "LSTM",
            CellKind::Gru => "GRU",
        }
    }
}
