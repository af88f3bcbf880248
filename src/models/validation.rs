//! Replaying validation sequences through a ranker and aggregating metrics.
use itertools::Itertools;

use crate::batch::{BatchBuilder, FeatureExtractor};
use crate::data::SequenceDataset;
use crate::evaluation::{record_metrics, Evaluator, Metrics};
use crate::{ItemId, NextItemRanker, PredictionError};

/// How validation sequences are turned into ranking instances.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ValidationMode {
    /// Every sequence is cut in half once: the first half is the history
    /// and the rest is the goal. Sequences are ranked `batch_size` at a time.
    Batch {
        /// Sequences per ranking call.
        batch_size: usize,
    },
    /// Every prefix of every sequence is ranked on its own against the
    /// single item that follows it.
    Incremental,
}

/// Run one validation pass and append its aggregates to `metrics`.
///
/// Sequences shorter than two events carry no goal and are skipped. The
/// evaluator is cleared afterwards, also when ranking or featurization fails
/// part-way through the pass.
pub fn compute_validation_metrics<D, F, R, E>(
    dataset: &D,
    builder: &BatchBuilder<F>,
    ranker: &R,
    evaluator: &mut E,
    mode: ValidationMode,
    metrics: &mut Metrics,
) -> Result<(), PredictionError>
where
    D: SequenceDataset + ?Sized,
    F: FeatureExtractor,
    R: NextItemRanker + ?Sized,
    E: Evaluator + ?Sized,
{
    let result = match mode {
        ValidationMode::Batch { batch_size } => {
            validate_batches(dataset, builder, ranker, evaluator, batch_size.max(1))
        }
        ValidationMode::Incremental => validate_incrementally(dataset, builder, ranker, evaluator),
    };

    match result {
        Ok(num_instances) => {
            tracing::debug!(num_instances, ?mode, "Finished validation pass");
            record_metrics(evaluator, metrics);
            Ok(())
        }
        Err(error) => {
            evaluator.clear();
            Err(error)
        }
    }
}

fn validate_batches<D, F, R, E>(
    dataset: &D,
    builder: &BatchBuilder<F>,
    ranker: &R,
    evaluator: &mut E,
    batch_size: usize,
) -> Result<usize, PredictionError>
where
    D: SequenceDataset + ?Sized,
    F: FeatureExtractor,
    R: NextItemRanker + ?Sized,
    E: Evaluator + ?Sized,
{
    let mut num_instances = 0;

    let splits = dataset
        .validation_set()
        .filter(|user| user.len() >= 2)
        .map(|user| user.item_ids.split_at(user.len() / 2));

    for chunk in &splits.chunks(batch_size) {
        let (histories, goals): (Vec<&[ItemId]>, Vec<&[ItemId]>) = chunk.unzip();

        let inputs = builder.build_inputs(&histories)?;
        let predictions = ranker.rank(&inputs)?;

        for (goal, predicted) in izip!(&goals, &predictions) {
            evaluator.add_instance(goal, predicted);
            num_instances += 1;
        }
    }

    Ok(num_instances)
}

fn validate_incrementally<D, F, R, E>(
    dataset: &D,
    builder: &BatchBuilder<F>,
    ranker: &R,
    evaluator: &mut E,
) -> Result<usize, PredictionError>
where
    D: SequenceDataset + ?Sized,
    F: FeatureExtractor,
    R: NextItemRanker + ?Sized,
    E: Evaluator + ?Sized,
{
    let mut num_instances = 0;

    for user in dataset.validation_set() {
        let item_ids = user.item_ids;

        for prefix in 1..item_ids.len() {
            let inputs = builder.build_inputs(&[&item_ids[..prefix]])?;
            let predictions = ranker.rank(&inputs)?;

            if let Some(predicted) = predictions.first() {
                evaluator.add_instance(&item_ids[prefix..=prefix], predicted);
                num_instances += 1;
            }
        }
    }

    Ok(num_instances)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::batch::{BatchInputs, OneHot};
    use crate::data::{Dataset, Interaction, Interactions};
    use crate::evaluation::{Metric, RankingEvaluator};

    struct RecordingRanker {
        calls: RefCell<Vec<BatchInputs>>,
    }

    impl NextItemRanker for RecordingRanker {
        fn rank(&self, inputs: &BatchInputs) -> Result<Vec<Vec<ItemId>>, PredictionError> {
            self.calls.borrow_mut().push(inputs.clone());
            Ok(vec![vec![0, 1, 2]; inputs.len()])
        }
    }

    #[derive(Default)]
    struct RecordingEvaluator {
        goals: Vec<Vec<ItemId>>,
        cleared: bool,
    }

    impl Evaluator for RecordingEvaluator {
        fn add_instance(&mut self, goal: &[ItemId], _predictions: &[ItemId]) {
            self.goals.push(goal.to_vec());
        }
        fn average_recall(&self) -> f32 {
            self.goals.len() as f32
        }
        fn sps(&self) -> f32 {
            0.5
        }
        fn average_precision(&self) -> f32 {
            0.0
        }
        fn average_ndcg(&self) -> f32 {
            0.0
        }
        fn user_coverage(&self) -> f32 {
            0.0
        }
        fn item_coverage(&self) -> f32 {
            0.0
        }
        fn blockbuster_share(&self) -> f32 {
            0.0
        }
        fn clear(&mut self) {
            self.cleared = true;
        }
    }

    fn dataset(sequences: &[&[ItemId]]) -> Dataset {
        let mut data = Vec::new();
        for (user_id, sequence) in sequences.iter().enumerate() {
            for (timestamp, &item_id) in sequence.iter().enumerate() {
                data.push(Interaction::new(user_id, item_id, timestamp));
            }
        }

        let validation = Interactions::from(data).to_compressed();
        let train = Interactions::new(0, validation.num_items()).to_compressed();

        Dataset::new(train, validation)
    }

    #[test]
    fn incremental_mode_replays_every_prefix() {
        let dataset = dataset(&[&[1, 2, 3, 4]]);
        let builder = BatchBuilder::new(5, 5, OneHot::new(5));
        let ranker = RecordingRanker {
            calls: RefCell::new(Vec::new()),
        };
        let mut evaluator = RecordingEvaluator::default();
        let mut metrics = Metrics::new();

        compute_validation_metrics(
            &dataset,
            &builder,
            &ranker,
            &mut evaluator,
            ValidationMode::Incremental,
            &mut metrics,
        )
        .unwrap();

        let calls = ranker.calls.borrow();
        assert_eq!(calls.len(), 3);
        for (prefix, inputs) in calls.iter().enumerate() {
            assert_eq!(inputs.len(), 1);
            assert_eq!(inputs.mask.sum() as usize, prefix + 1);
        }

        assert_eq!(evaluator.goals, vec![vec![2], vec![3], vec![4]]);
        assert!(evaluator.cleared);

        assert_eq!(metrics.num_passes(), 1);
        assert_eq!(metrics.last(Metric::Recall), Some(3.0));
        assert_eq!(metrics.last(Metric::Sps), Some(0.5));
    }

    #[test]
    fn batch_mode_splits_sequences_in_half() {
        let dataset = dataset(&[&[0, 1, 2, 3], &[4], &[1, 2, 3]]);
        let builder = BatchBuilder::new(5, 5, OneHot::new(5));
        let ranker = RecordingRanker {
            calls: RefCell::new(Vec::new()),
        };
        let mut evaluator = RecordingEvaluator::default();
        let mut metrics = Metrics::new();

        compute_validation_metrics(
            &dataset,
            &builder,
            &ranker,
            &mut evaluator,
            ValidationMode::Batch { batch_size: 1 },
            &mut metrics,
        )
        .unwrap();

        let calls = ranker.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].mask.sum(), 2.0);
        assert_eq!(calls[1].mask.sum(), 1.0);

        assert_eq!(evaluator.goals, vec![vec![2, 3], vec![2, 3]]);
        assert_eq!(metrics.num_passes(), 1);
    }

    #[test]
    fn batch_mode_groups_sequences() {
        let dataset = dataset(&[&[0, 1], &[1, 2], &[2, 3]]);
        let builder = BatchBuilder::new(3, 4, OneHot::new(4));
        let ranker = RecordingRanker {
            calls: RefCell::new(Vec::new()),
        };
        let mut evaluator = RecordingEvaluator::default();
        let mut metrics = Metrics::new();

        compute_validation_metrics(
            &dataset,
            &builder,
            &ranker,
            &mut evaluator,
            ValidationMode::Batch { batch_size: 2 },
            &mut metrics,
        )
        .unwrap();

        let sizes: Vec<usize> = ranker.calls.borrow().iter().map(|x| x.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(evaluator.goals.len(), 3);
    }

    struct FailingRanker {
        calls: RefCell<usize>,
        fail_on: usize,
    }

    impl NextItemRanker for FailingRanker {
        fn rank(&self, inputs: &BatchInputs) -> Result<Vec<Vec<ItemId>>, PredictionError> {
            *self.calls.borrow_mut() += 1;

            if *self.calls.borrow() == self.fail_on {
                Err(PredictionError::InvalidPredictionValue)
            } else {
                Ok(vec![vec![0, 1, 2]; inputs.len()])
            }
        }
    }

    #[test]
    fn failed_pass_leaves_evaluator_empty() {
        let dataset = dataset(&[&[0, 1, 2, 3, 4]]);
        let builder = BatchBuilder::new(5, 5, OneHot::new(5));
        let ranker = FailingRanker {
            calls: RefCell::new(0),
            fail_on: 3,
        };
        let mut evaluator = RankingEvaluator::new(3, &[1.0; 5]);
        let mut metrics = Metrics::new();

        let result = compute_validation_metrics(
            &dataset,
            &builder,
            &ranker,
            &mut evaluator,
            ValidationMode::Incremental,
            &mut metrics,
        );

        assert!(result.is_err());
        assert_eq!(*ranker.calls.borrow(), 3);
        assert!(evaluator.is_empty());
        assert_eq!(metrics.num_passes(), 0);
    }

    #[test]
    fn failed_batch_pass_clears_evaluator() {
        let dataset = dataset(&[&[0, 1], &[1, 2], &[2, 3]]);
        let builder = BatchBuilder::new(3, 4, OneHot::new(4));
        let ranker = FailingRanker {
            calls: RefCell::new(0),
            fail_on: 2,
        };
        let mut evaluator = RecordingEvaluator::default();
        let mut metrics = Metrics::new();

        let result = compute_validation_metrics(
            &dataset,
            &builder,
            &ranker,
            &mut evaluator,
            ValidationMode::Batch { batch_size: 2 },
            &mut metrics,
        );

        assert!(result.is_err());
        assert!(evaluator.cleared);
        assert_eq!(evaluator.goals.len(), 2);
        assert_eq!(metrics.num_passes(), 0);
    }
}
