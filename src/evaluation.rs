//! Top-k ranking metrics and their per-run accumulation.
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use rayon::prelude::*;

use crate::ItemId;

/// Aggregate metrics reported after every validation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Metric {
    /// Share of the goal items found in the top k, averaged over instances.
    Recall,
    /// Sequential prediction score: whether the very next item is in the top k.
    Sps,
    /// Share of the top k that are goal items.
    Precision,
    /// Normalised discounted cumulative gain of the top k.
    Ndcg,
    /// Share of instances with at least one hit.
    UserCoverage,
    /// Number of distinct items recommended.
    ItemCoverage,
    /// Share of hits that are blockbuster items.
    BlockbusterShare,
}

impl Metric {
    /// All metrics, in reporting order.
    pub const ALL: [Metric; 7] = [
        Metric::Recall,
        Metric::Sps,
        Metric::Precision,
        Metric::Ndcg,
        Metric::UserCoverage,
        Metric::ItemCoverage,
        Metric::BlockbusterShare,
    ];

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match *self {
            Metric::Recall => "recall",
            Metric::Sps => "sps",
            Metric::Precision => "precision",
            Metric::Ndcg => "ndcg",
            Metric::UserCoverage => "user_coverage",
            Metric::ItemCoverage => "item_coverage",
            Metric::BlockbusterShare => "blockbuster_share",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One list of values per metric, one value appended per validation pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    values: BTreeMap<Metric, Vec<f32>>,
}

impl Metrics {
    /// Empty accumulator.
    pub fn new() -> Self {
        Metrics::default()
    }

    /// Append a value to the list of `metric`.
    pub fn append(&mut self, metric: Metric, value: f32) {
        self.values.entry(metric).or_insert_with(Vec::new).push(value);
    }

    /// All values recorded for `metric`, oldest first.
    pub fn get(&self, metric: Metric) -> &[f32] {
        self.values.get(&metric).map(|x| x.as_slice()).unwrap_or(&[])
    }

    /// Most recent value of `metric`.
    pub fn last(&self, metric: Metric) -> Option<f32> {
        self.get(metric).last().cloned()
    }

    /// Number of validation passes recorded.
    pub fn num_passes(&self) -> usize {
        self.values.values().map(|x| x.len()).max().unwrap_or(0)
    }

    /// A copy of everything recorded so far.
    pub fn snapshot(&self) -> BTreeMap<Metric, Vec<f32>> {
        self.values.clone()
    }
}

/// Collects (goal, prediction) instances and computes aggregate ranking
/// metrics over them.
pub trait Evaluator {
    /// Record one ranking: the items that actually followed and the
    /// predicted items, best first.
    fn add_instance(&mut self, goal: &[ItemId], predictions: &[ItemId]);
    /// Mean recall at k.
    fn average_recall(&self) -> f32;
    /// Sequential prediction score.
    fn sps(&self) -> f32;
    /// Mean precision at k.
    fn average_precision(&self) -> f32;
    /// Mean NDCG at k.
    fn average_ndcg(&self) -> f32;
    /// Share of instances with a hit.
    fn user_coverage(&self) -> f32;
    /// Distinct items recommended.
    fn item_coverage(&self) -> f32;
    /// Share of hits on blockbuster items.
    fn blockbuster_share(&self) -> f32;
    /// Drop all recorded instances.
    fn clear(&mut self);
}

/// Append the evaluator's aggregates to `metrics`, then clear it.
pub fn record_metrics<E: Evaluator + ?Sized>(evaluator: &mut E, metrics: &mut Metrics) {
    for &metric in Metric::ALL.iter() {
        let value = match metric {
            Metric::Recall => evaluator.average_recall(),
            Metric::Sps => evaluator.sps(),
            Metric::Precision => evaluator.average_precision(),
            Metric::Ndcg => evaluator.average_ndcg(),
            Metric::UserCoverage => evaluator.user_coverage(),
            Metric::ItemCoverage => evaluator.item_coverage(),
            Metric::BlockbusterShare => evaluator.blockbuster_share(),
        };

        metrics.append(metric, value);
    }

    evaluator.clear();
}

#[derive(Clone, Debug)]
struct Instance {
    goal: Vec<ItemId>,
    predictions: Vec<ItemId>,
}

impl Instance {
    fn hits(&self) -> impl Iterator<Item = (usize, ItemId)> + '_ {
        self.predictions
            .iter()
            .cloned()
            .enumerate()
            .filter(move |(_, item_id)| self.goal.contains(item_id))
    }
}

/// Evaluator over the top `k` predictions of each instance.
///
/// Blockbusters are the most popular 1% of items (at least one).
#[derive(Clone, Debug)]
pub struct RankingEvaluator {
    k: usize,
    blockbusters: HashSet<ItemId>,
    instances: Vec<Instance>,
}

impl RankingEvaluator {
    /// New evaluator; `item_popularity` is indexed by item id.
    pub fn new(k: usize, item_popularity: &[f32]) -> Self {
        let mut by_popularity: Vec<ItemId> = (0..item_popularity.len()).collect();
        by_popularity.sort_by(|&a, &b| {
            item_popularity[b]
                .partial_cmp(&item_popularity[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let num_blockbusters = ((item_popularity.len() as f32 * 0.01).ceil() as usize)
            .max(1)
            .min(item_popularity.len());

        RankingEvaluator {
            k,
            blockbusters: by_popularity.into_iter().take(num_blockbusters).collect(),
            instances: Vec::new(),
        }
    }

    /// Number of recorded instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn mean<F: Fn(&Instance) -> f32 + Sync + Send>(&self, func: F) -> f32 {
        if self.instances.is_empty() {
            return 0.0;
        }

        self.instances.par_iter().map(func).sum::<f32>() / self.instances.len() as f32
    }
}

fn discount(rank: usize) -> f32 {
    1.0 / (rank as f32 + 2.0).log2()
}

impl Evaluator for RankingEvaluator {
    fn add_instance(&mut self, goal: &[ItemId], predictions: &[ItemId]) {
        self.instances.push(Instance {
            goal: goal.to_vec(),
            predictions: predictions.iter().take(self.k).cloned().collect(),
        });
    }

    fn average_recall(&self) -> f32 {
        self.mean(|instance| {
            if instance.goal.is_empty() {
                0.0
            } else {
                instance.hits().count() as f32 / instance.goal.len() as f32
            }
        })
    }

    fn sps(&self) -> f32 {
        self.mean(|instance| match instance.goal.first() {
            Some(next_item) if instance.predictions.contains(next_item) => 1.0,
            _ => 0.0,
        })
    }

    fn average_precision(&self) -> f32 {
        let k = self.k.max(1) as f32;
        self.mean(|instance| instance.hits().count() as f32 / k)
    }

    fn average_ndcg(&self) -> f32 {
        let k = self.k;
        self.mean(|instance| {
            let dcg: f32 = instance.hits().map(|(rank, _)| discount(rank)).sum();
            let ideal: f32 = (0..instance.goal.len().min(k)).map(discount).sum();

            if ideal > 0.0 {
                dcg / ideal
            } else {
                0.0
            }
        })
    }

    fn user_coverage(&self) -> f32 {
        self.mean(|instance| {
            if instance.hits().next().is_some() {
                1.0
            } else {
                0.0
            }
        })
    }

    fn item_coverage(&self) -> f32 {
        self.instances
            .iter()
            .flat_map(|instance| instance.predictions.iter())
            .collect::<HashSet<_>>()
            .len() as f32
    }

    fn blockbuster_share(&self) -> f32 {
        let (blockbuster_hits, hits) = self
            .instances
            .par_iter()
            .map(|instance| {
                instance.hits().fold((0, 0), |(blockbusters, total), (_, item_id)| {
                    (
                        blockbusters + self.blockbusters.contains(&item_id) as usize,
                        total + 1,
                    )
                })
            })
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

        if hits == 0 {
            0.0
        } else {
            blockbuster_hits as f32 / hits as f32
        }
    }

    fn clear(&mut self) {
        self.instances.clear();
    }
}
