//! Interaction containers, splitting, and the dataset contract consumed
//! by model fitting and validation.
use std::cmp::Ordering;
use std::hash::Hasher;

use rand::Rng;

use siphasher::sip::SipHasher;

use super::{ItemId, Timestamp, UserId};

/// A single user-item interaction.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Interaction {
    user_id: UserId,
    item_id: ItemId,
    timestamp: Timestamp,
}

impl Interaction {
    /// New interaction.
    pub fn new(user_id: UserId, item_id: ItemId, timestamp: Timestamp) -> Self {
        Interaction {
            user_id,
            item_id,
            timestamp,
        }
    }

    /// The interacting user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The item interacted with.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    /// When it happened.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Split interactions so that each user lands entirely in either the
/// train or the test set.
pub fn user_based_split<R: Rng>(
    interactions: &mut Interactions,
    rng: &mut R,
    test_fraction: f32,
) -> (Interactions, Interactions) {
    let denominator = 100_000;
    let train_cutoff = (test_fraction * denominator as f32) as u64;

    let (key_0, key_1) = (rng.gen::<u64>(), rng.gen::<u64>());

    let is_train = |x: &Interaction| {
        let mut hasher = SipHasher::new_with_keys(key_0, key_1);
        hasher.write_usize(x.user_id());
        hasher.finish() % denominator > train_cutoff
    };

    interactions.split_by(is_train)
}

/// A flat list of interactions.
#[derive(Clone, Debug)]
pub struct Interactions {
    num_users: usize,
    num_items: usize,
    interactions: Vec<Interaction>,
}

impl Interactions {
    /// Empty interactions for the given id ranges.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Interactions {
            num_users,
            num_items,
            interactions: Vec::new(),
        }
    }

    /// Add an interaction, growing the id ranges if needed.
    pub fn push(&mut self, interaction: Interaction) {
        self.num_users = self.num_users.max(interaction.user_id() + 1);
        self.num_items = self.num_items.max(interaction.item_id() + 1);
        self.interactions.push(interaction);
    }

    /// The underlying interactions.
    pub fn data(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Number of interactions.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// True when there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Partition by a predicate, keeping the id ranges.
    pub fn split_by<F: Fn(&Interaction) -> bool>(&self, func: F) -> (Self, Self) {
        let (head, tail): (Vec<_>, Vec<_>) =
            self.interactions.iter().cloned().partition(|x| func(x));

        (
            Interactions {
                num_users: self.num_users,
                num_items: self.num_items,
                interactions: head,
            },
            Interactions {
                num_users: self.num_users,
                num_items: self.num_items,
                interactions: tail,
            },
        )
    }

    /// Convert to per-user, time-ordered sequences.
    pub fn to_compressed(&self) -> CompressedInteractions {
        CompressedInteractions::from(self)
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }
}

impl From<Vec<Interaction>> for Interactions {
    fn from(data: Vec<Interaction>) -> Interactions {
        let num_users = data.iter().map(|x| x.user_id() + 1).max().unwrap_or(0);
        let num_items = data.iter().map(|x| x.item_id() + 1).max().unwrap_or(0);

        Interactions {
            num_users,
            num_items,
            interactions: data,
        }
    }
}

fn cmp_timestamp(x: &Interaction, y: &Interaction) -> Ordering {
    x.user_id()
        .cmp(&y.user_id())
        .then_with(|| x.timestamp().cmp(&y.timestamp()))
}

/// Interactions stored as one time-ordered item sequence per user.
#[derive(Clone, Debug)]
pub struct CompressedInteractions {
    num_users: usize,
    num_items: usize,
    user_pointers: Vec<usize>,
    item_ids: Vec<ItemId>,
    timestamps: Vec<Timestamp>,
}

impl<'a> From<&'a Interactions> for CompressedInteractions {
    fn from(interactions: &Interactions) -> CompressedInteractions {
        let mut data = interactions.data().to_owned();

        data.sort_by(cmp_timestamp);

        let mut user_pointers = vec![0; interactions.num_users + 1];
        let mut item_ids = Vec::with_capacity(data.len());
        let mut timestamps = Vec::with_capacity(data.len());

        for datum in &data {
            item_ids.push(datum.item_id());
            timestamps.push(datum.timestamp());

            user_pointers[datum.user_id() + 1] += 1;
        }

        for idx in 1..user_pointers.len() {
            user_pointers[idx] += user_pointers[idx - 1];
        }

        CompressedInteractions {
            num_users: interactions.num_users,
            num_items: interactions.num_items,
            user_pointers,
            item_ids,
            timestamps,
        }
    }
}

impl CompressedInteractions {
    /// Iterate over all users, including those without interactions.
    pub fn iter_users(&self) -> CompressedInteractionsUserIterator<'_> {
        CompressedInteractionsUserIterator {
            interactions: self,
            idx: 0,
        }
    }

    /// The sequence of a single user.
    pub fn get_user(&self, user_id: UserId) -> Option<CompressedInteractionsUser<'_>> {
        if user_id >= self.num_users {
            return None;
        }

        let start = self.user_pointers[user_id];
        let stop = self.user_pointers[user_id + 1];

        Some(CompressedInteractionsUser {
            user_id,
            item_ids: &self.item_ids[start..stop],
            timestamps: &self.timestamps[start..stop],
        })
    }

    /// Total number of interactions.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// True when there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }
}

/// Iterator over the users of a `CompressedInteractions`.
pub struct CompressedInteractionsUserIterator<'a> {
    interactions: &'a CompressedInteractions,
    idx: usize,
}

/// One user's time-ordered sequence.
#[derive(Clone, Debug)]
pub struct CompressedInteractionsUser<'a> {
    /// The user.
    pub user_id: UserId,
    /// Items, oldest first.
    pub item_ids: &'a [ItemId],
    /// Matching timestamps.
    pub timestamps: &'a [Timestamp],
}

impl<'a> CompressedInteractionsUser<'a> {
    /// Number of events.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// True when the user has no events.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

impl<'a> Iterator for CompressedInteractionsUserIterator<'a> {
    type Item = CompressedInteractionsUser<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = self.interactions.get_user(self.idx);
        self.idx += 1;
        value
    }
}

/// The data source consumed by model fitting and validation.
pub trait SequenceDataset {
    /// Number of items in the catalogue.
    fn num_items(&self) -> usize;
    /// Per-user training sequences.
    fn training_set(&self) -> &CompressedInteractions;
    /// Restartable stream of validation sequences. Each call starts a
    /// fresh pass over the validation users.
    fn validation_set(&self) -> CompressedInteractionsUserIterator<'_>;
    /// Popularity weight of every item, indexed by item id.
    fn item_popularity(&self) -> &[f32];
}

/// In-memory training and validation sequences.
#[derive(Clone, Debug)]
pub struct Dataset {
    train: CompressedInteractions,
    validation: CompressedInteractions,
    item_popularity: Vec<f32>,
}

impl Dataset {
    /// Build from train and validation splits.
    ///
    /// Item popularity is derived from training counts on a `1..=10`
    /// scale: the most popular item gets 10, unseen items get 1.
    pub fn new(train: CompressedInteractions, validation: CompressedInteractions) -> Self {
        let num_items = train.num_items().max(validation.num_items());

        let mut counts = vec![0_usize; num_items];
        for &item_id in &train.item_ids {
            counts[item_id] += 1;
        }

        let max_count = counts.iter().cloned().max().unwrap_or(0).max(1) as f32;
        let item_popularity = counts
            .iter()
            .map(|&count| 1.0 + 9.0 * count as f32 / max_count)
            .collect();

        Dataset {
            train,
            validation,
            item_popularity,
        }
    }
}

impl SequenceDataset for Dataset {
    fn num_items(&self) -> usize {
        self.item_popularity.len()
    }

    fn training_set(&self) -> &CompressedInteractions {
        &self.train
    }

    fn validation_set(&self) -> CompressedInteractionsUserIterator<'_> {
        self.validation.iter_users()
    }

    fn item_popularity(&self) -> &[f32] {
        &self.item_popularity
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;

    fn interactions() -> Interactions {
        let mut data = Vec::new();

        for user_id in 0..50 {
            for timestamp in (0..5).rev() {
                data.push(Interaction::new(user_id, (user_id + timestamp) % 7, timestamp));
            }
        }

        Interactions::from(data)
    }

    #[test]
    fn compressed_sequences_are_time_ordered() {
        let compressed = interactions().to_compressed();

        assert_eq!(compressed.num_users(), 50);
        assert_eq!(compressed.len(), 250);

        for user in compressed.iter_users() {
            assert_eq!(user.len(), 5);
            assert!(user.timestamps.windows(2).all(|x| x[0] <= x[1]));
        }
    }

    #[test]
    fn user_split_keeps_users_whole() {
        let mut data = interactions();
        let mut rng = XorShiftRng::from_seed([42; 16]);

        let (train, test) = user_based_split(&mut data, &mut rng, 0.2);

        assert_eq!(train.len() + test.len(), data.len());
        assert!(!test.is_empty());

        for interaction in train.data() {
            assert!(test
                .data()
                .iter()
                .all(|x| x.user_id() != interaction.user_id()));
        }
    }

    #[test]
    fn popularity_is_scaled() {
        let data = vec![
            Interaction::new(0, 0, 0),
            Interaction::new(0, 0, 1),
            Interaction::new(1, 1, 0),
            Interaction::new(1, 2, 1),
        ];
        let train = Interactions::from(data);
        let mut validation = Interactions::new(2, 4);
        validation.push(Interaction::new(0, 3, 5));

        let dataset = Dataset::new(train.to_compressed(), validation.to_compressed());

        assert_eq!(dataset.num_items(), 4);
        assert_eq!(dataset.item_popularity(), &[10.0, 5.5, 5.5, 1.0]);
        assert_eq!(dataset.validation_set().count(), 2);
        assert_eq!(dataset.validation_set().count(), 2);
    }
}
