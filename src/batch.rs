//! Turning interaction sequences into fixed-shape mini-batches.
//!
//! Every batch has three co-indexed arrays:
//!
//! - `input`: `batch × max_length × input_size` item features,
//! - `mask`: `batch × max_length`, `1.0` on valid steps,
//! - `target`: `batch × num_items`, one-hot encoding of the next item.
//!
//! Histories longer than `max_length` keep only their most recent
//! events; shorter ones are packed from step 0 and zero-padded.
use ndarray::{s, Array2, Array3, ArrayViewMut1};
use rand::Rng;

use crate::data::CompressedInteractions;
use crate::{FeatureExtractionError, ItemId, UserId};

/// Maps an item to its feature vector.
pub trait FeatureExtractor {
    /// Width of the produced feature vectors.
    fn input_size(&self) -> usize;
    /// Write the features of `item_id` into `out`, which is zeroed and
    /// has length `input_size()`.
    fn extract(
        &self,
        item_id: ItemId,
        out: ArrayViewMut1<f32>,
    ) -> Result<(), FeatureExtractionError>;
}

/// Plain one-hot item encoding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneHot {
    num_items: usize,
}

impl OneHot {
    /// One-hot encoder over `num_items` items.
    pub fn new(num_items: usize) -> Self {
        OneHot { num_items }
    }
}

impl FeatureExtractor for OneHot {
    fn input_size(&self) -> usize {
        self.num_items
    }

    fn extract(
        &self,
        item_id: ItemId,
        mut out: ArrayViewMut1<f32>,
    ) -> Result<(), FeatureExtractionError> {
        if item_id >= self.num_items {
            return Err(FeatureExtractionError::UnknownItem {
                item_id,
                num_items: self.num_items,
            });
        }

        out[item_id] = 1.0;

        Ok(())
    }
}

/// One-hot item encoding followed by a per-item side feature vector.
#[derive(Clone, Debug)]
pub struct OneHotWithMetadata {
    num_items: usize,
    metadata: Array2<f32>,
}

impl OneHotWithMetadata {
    /// Build from a `num_items × num_features` metadata matrix.
    pub fn new(metadata: Array2<f32>) -> Self {
        OneHotWithMetadata {
            num_items: metadata.nrows(),
            metadata,
        }
    }
}

impl FeatureExtractor for OneHotWithMetadata {
    fn input_size(&self) -> usize {
        self.num_items + self.metadata.ncols()
    }

    fn extract(
        &self,
        item_id: ItemId,
        mut out: ArrayViewMut1<f32>,
    ) -> Result<(), FeatureExtractionError> {
        if item_id >= self.num_items {
            return Err(FeatureExtractionError::UnknownItem {
                item_id,
                num_items: self.num_items,
            });
        }

        out[item_id] = 1.0;
        out.slice_mut(s![self.num_items..])
            .assign(&self.metadata.row(item_id));

        Ok(())
    }
}

/// A history paired with the events that follow it.
#[derive(Clone, Debug)]
pub struct SequenceExample<'a> {
    /// Owner of the sequence.
    pub user_id: UserId,
    /// Past events, oldest first.
    pub history: &'a [ItemId],
    /// Following events; the first one is the training target.
    pub targets: &'a [ItemId],
}

impl<'a> SequenceExample<'a> {
    /// Returns `None` when there is no target to predict.
    pub fn new(user_id: UserId, history: &'a [ItemId], targets: &'a [ItemId]) -> Option<Self> {
        if targets.is_empty() {
            None
        } else {
            Some(SequenceExample {
                user_id,
                history,
                targets,
            })
        }
    }

    /// The item the model is trained to predict.
    pub fn target(&self) -> ItemId {
        self.targets[0]
    }
}

/// Network inputs for a mini-batch.
#[derive(Clone, Debug)]
pub struct BatchInputs {
    /// `batch × max_length × input_size` features.
    pub input: Array3<f32>,
    /// `batch × max_length`, `1.0` on valid steps.
    pub mask: Array2<f32>,
}

impl BatchInputs {
    /// Number of sequences in the batch.
    pub fn len(&self) -> usize {
        self.mask.nrows()
    }

    /// True when the batch holds no sequences.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Network inputs plus one-hot targets.
#[derive(Clone, Debug)]
pub struct Batch {
    /// Inputs and mask.
    pub inputs: BatchInputs,
    /// `batch × num_items` one-hot targets.
    pub target: Array2<f32>,
}

/// Builds batches of a fixed shape with a given feature extractor.
#[derive(Clone, Debug)]
pub struct BatchBuilder<F> {
    max_length: usize,
    num_items: usize,
    features: F,
}

impl<F: FeatureExtractor> BatchBuilder<F> {
    /// New builder.
    pub fn new(max_length: usize, num_items: usize, features: F) -> Self {
        BatchBuilder {
            max_length,
            num_items,
            features,
        }
    }

    /// Steps per sequence.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Width of the target vectors.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Width of the input feature vectors.
    pub fn input_size(&self) -> usize {
        self.features.input_size()
    }

    /// Featurize histories only.
    pub fn build_inputs(
        &self,
        histories: &[&[ItemId]],
    ) -> Result<BatchInputs, FeatureExtractionError> {
        let mut input = Array3::zeros((histories.len(), self.max_length, self.input_size()));
        let mut mask = Array2::zeros((histories.len(), self.max_length));

        for (row, history) in histories.iter().enumerate() {
            let history = &history[history.len().saturating_sub(self.max_length)..];

            for (step, &item_id) in history.iter().enumerate() {
                self.features
                    .extract(item_id, input.slice_mut(s![row, step, ..]))?;
                mask[(row, step)] = 1.0;
            }
        }

        Ok(BatchInputs { input, mask })
    }

    /// Featurize histories and one-hot encode their first target.
    pub fn build(&self, examples: &[SequenceExample]) -> Result<Batch, FeatureExtractionError> {
        let histories: Vec<&[ItemId]> = examples.iter().map(|example| example.history).collect();
        let inputs = self.build_inputs(&histories)?;

        let mut target = Array2::zeros((examples.len(), self.num_items));

        for (row, example) in examples.iter().enumerate() {
            let item_id = example.target();

            if item_id >= self.num_items {
                return Err(FeatureExtractionError::UnknownItem {
                    item_id,
                    num_items: self.num_items,
                });
            }

            target[(row, item_id)] = 1.0;
        }

        Ok(Batch { inputs, target })
    }
}

/// Sample training examples by cutting user sequences.
///
/// Up to `samples_per_user` distinct cut points are drawn per user; the
/// history is everything before the cut and the targets everything from
/// it onwards. Users with fewer than two events yield nothing.
pub fn sample_training_examples<'a, R: Rng>(
    interactions: &'a CompressedInteractions,
    samples_per_user: usize,
    rng: &mut R,
) -> Vec<SequenceExample<'a>> {
    let mut examples = Vec::new();

    for user in interactions.iter_users() {
        let item_ids = user.item_ids;

        if item_ids.len() < 2 {
            continue;
        }

        let num_cuts = item_ids.len() - 1;
        let amount = samples_per_user.min(num_cuts);

        for cut in rand::seq::index::sample(rng, num_cuts, amount).iter() {
            let cut = cut + 1;

            if let Some(example) =
                SequenceExample::new(user.user_id, &item_ids[..cut], &item_ids[cut..])
            {
                examples.push(example);
            }
        }
    }

    examples
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;
    use crate::data::{Interaction, Interactions};

    #[test]
    fn targets_are_one_hot() {
        let builder = BatchBuilder::new(4, 6, OneHot::new(6));
        let sequence = [0, 3, 5, 1, 2, 4];

        let examples: Vec<_> = (1..sequence.len())
            .filter_map(|cut| SequenceExample::new(0, &sequence[..cut], &sequence[cut..]))
            .collect();
        let batch = builder.build(&examples).unwrap();

        for (row, example) in batch.target.outer_iter().zip(&examples) {
            assert!(row.iter().all(|&x| x == 0.0 || x == 1.0));
            assert_eq!(row.sum(), 1.0);
            assert_eq!(row[example.targets[0]], 1.0);
        }
    }

    #[test]
    fn mask_marks_valid_prefix() {
        let max_length = 3;
        let builder = BatchBuilder::new(max_length, 10, OneHot::new(10));
        let histories: Vec<Vec<ItemId>> = (1..7).map(|len| (0..len).collect()).collect();
        let views: Vec<&[ItemId]> = histories.iter().map(|x| x.as_slice()).collect();

        let inputs = builder.build_inputs(&views).unwrap();

        for (row, history) in inputs.mask.outer_iter().zip(&histories) {
            let expected = history.len().min(max_length);
            assert_eq!(row.sum() as usize, expected);
            assert!(row.iter().take(expected).all(|&x| x == 1.0));
            assert!(row.iter().skip(expected).all(|&x| x == 0.0));
        }
    }

    #[test]
    fn long_histories_keep_most_recent_events() {
        let builder = BatchBuilder::new(2, 5, OneHot::new(5));
        let inputs = builder.build_inputs(&[&[0, 1, 2, 3]]).unwrap();

        assert_eq!(inputs.input[(0, 0, 2)], 1.0);
        assert_eq!(inputs.input[(0, 1, 3)], 1.0);
        assert_eq!(inputs.input.sum(), 2.0);
    }

    #[test]
    fn unknown_items_are_reported() {
        let builder = BatchBuilder::new(3, 4, OneHot::new(4));

        match builder.build_inputs(&[&[0, 7]]) {
            Err(FeatureExtractionError::UnknownItem { item_id, num_items }) => {
                assert_eq!(item_id, 7);
                assert_eq!(num_items, 4);
            }
            other => panic!("Expected an unknown item error, got {:?}", other),
        }
    }

    #[test]
    fn metadata_follows_one_hot() {
        let metadata = arr2(&[[0.5, 1.5], [2.0, 3.0], [4.0, 5.0]]);
        let builder = BatchBuilder::new(2, 3, OneHotWithMetadata::new(metadata));

        assert_eq!(builder.input_size(), 5);

        let inputs = builder.build_inputs(&[&[1]]).unwrap();
        let step: Vec<f32> = inputs.input.slice(s![0, 0, ..]).to_vec();

        assert_eq!(step, vec![0.0, 1.0, 0.0, 2.0, 3.0]);
    }

    #[test]
    fn empty_targets_are_rejected() {
        assert!(SequenceExample::new(0, &[1, 2], &[]).is_none());
    }

    #[test]
    fn sampled_examples_split_sequences() {
        let data: Vec<Interaction> = vec![
            Interaction::new(0, 1, 0),
            Interaction::new(0, 2, 1),
            Interaction::new(0, 3, 2),
            Interaction::new(1, 0, 0),
        ];
        let interactions = Interactions::from(data).to_compressed();
        let mut rng = XorShiftRng::from_seed([42; 16]);

        let examples = sample_training_examples(&interactions, 10, &mut rng);

        assert_eq!(examples.len(), 2);
        for example in &examples {
            assert_eq!(example.user_id, 0);
            assert_eq!(example.history.len() + example.targets.len(), 3);
            assert!(!example.history.is_empty());
        }
    }
}
