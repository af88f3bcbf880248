//! Loading interaction data from disk.
use std::path::Path;

use crate::data::{Interaction, Interactions};

/// Load interactions from a CSV file with `user_id`, `item_id` and
/// `timestamp` columns.
pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Interactions, failure::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let interactions: Vec<Interaction> = reader.deserialize().collect::<Result<Vec<_>, _>>()?;

    Ok(Interactions::from(interactions))
}
