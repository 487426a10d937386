//! Fine-category to category-group mapping.

use std::collections::HashMap;
use std::path::Path;

use crate::fashion::error::{EncoderError, Result};

/// Group ids handed out by [`CategoryLookup::from_csv`] start here; `0` is
/// padding and `1` is the FITB placeholder category.
pub const FIRST_GROUP_ID: i64 = 2;

/// Immutable, total mapping from fine category id to group id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CategoryLookup {
    table: HashMap<i64, i64>,
}

impl CategoryLookup {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (i64, i64)>) -> Self {
        Self {
            table: pairs.into_iter().collect(),
        }
    }

    /// Load a categories CSV of `category_id,...,group_name` rows.
    ///
    /// The first column is the fine category id and the last column names its
    /// group. Group names receive consecutive ids in order of first appearance.
    /// A header row (non-numeric first column) is skipped. Quoted fields may
    /// contain commas.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut group_ids: HashMap<String, i64> = HashMap::new();
        let mut table = HashMap::new();

        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let first = record.get(0).unwrap_or_default();
            let Ok(category) = first.parse::<i64>() else {
                if row == 0 {
                    continue;
                }
                return Err(EncoderError::malformed(
                    row,
                    format!("category id `{}` in {} is not an integer", first, path.display()),
                ));
            };
            let group = match record.len() {
                0 | 1 => None,
                n => record.get(n - 1).filter(|name| !name.is_empty()),
            };
            let Some(group) = group else {
                return Err(EncoderError::malformed(
                    row,
                    format!("category {} in {} has no group", category, path.display()),
                ));
            };

            let next_id = FIRST_GROUP_ID + group_ids.len() as i64;
            let group = *group_ids.entry(group.to_string()).or_insert(next_id);
            table.insert(category, group);
        }

        log::info!(
            "loaded {} categories in {} groups from {}",
            table.len(),
            group_ids.len(),
            path.display()
        );
        Ok(Self { table })
    }

    pub fn lookup(&self, category: i64) -> Result<i64> {
        self.table
            .get(&category)
            .copied()
            .ok_or(EncoderError::UnknownCategory(category))
    }

    pub fn remap(&self, categories: &[i64]) -> Result<Vec<i64>> {
        categories.iter().map(|&c| self.lookup(c)).collect()
    }

    /// Largest group id in the table, `None` when it is empty.
    ///
    /// Embedding tables over grouped categories need `max_group() + 1` rows.
    pub fn max_group(&self) -> Option<i64> {
        self.table.values().copied().max()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Remap through `lookup` when grouping is enabled, pass through otherwise.
pub fn apply_grouping(lookup: Option<&CategoryLookup>, categories: &[i64]) -> Result<Vec<i64>> {
    match lookup {
        Some(lookup) => lookup.remap(categories),
        None => Ok(categories.to_vec()),
    }
}
