use serde::{Deserialize, Serialize};

use super::{ModelError, ScaledVector, squared_distance};
use crate::features::{FeatureVector, feature_names};

/// Display data for one training row, parallel to the index rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub name: Option<String>,
    /// Catalog grade, if the corpus had one.
    pub difficulty: Option<String>,
    pub features: FeatureVector,
}

/// Raw (unscaled) features of the training corpus, in index row order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub feature_names: Vec<String>,
    pub rows: Vec<TableRow>,
}

impl FeatureTable {
    pub fn new(rows: Vec<TableRow>) -> Self {
        Self {
            feature_names: feature_names(),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, row: usize) -> Option<&TableRow> {
        self.rows.get(row)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Row position in the index (and the feature table).
    pub row: usize,
    /// Euclidean distance in scaled space.
    pub distance: f64,
}

/// Brute-force k-nearest-neighbor search over the scaled training matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborIndex {
    pub feature_names: Vec<String>,
    rows: Vec<ScaledVector>,
}

impl NeighborIndex {
    /// Store the scaled corpus. `table` must describe the same rows in the same order.
    pub fn fit(scaled: Vec<ScaledVector>, table: &FeatureTable) -> Result<Self, ModelError> {
        if scaled.is_empty() {
            return Err(ModelError::EmptyCorpus);
        }
        if scaled.len() != table.len() {
            return Err(ModelError::DimensionMismatch {
                expected: scaled.len(),
                found: table.len(),
            });
        }
        Ok(Self {
            feature_names: feature_names(),
            rows: scaled,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, row: usize) -> Option<&ScaledVector> {
        self.rows.get(row)
    }

    /// The `n` rows closest to `query`, nearest first. Equal distances keep row
    /// order. `exclude` drops one row by position, never by value, so a distinct
    /// row with identical features is still returned.
    pub fn query(&self, query: &ScaledVector, n: usize, exclude: Option<usize>) -> Vec<Neighbor> {
        let mut distances: Vec<(usize, f64)> = self
            .rows
            .iter()
            .enumerate()
            .filter(|&(j, _)| Some(j) != exclude)
            .map(|(j, row)| (j, squared_distance(query, row)))
            .collect();

        let by_distance =
            |a: &(usize, f64), b: &(usize, f64)| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0));

        let n = n.min(distances.len());
        if n == 0 {
            return Vec::new();
        }
        // Partial sort: only need the n smallest
        if n < distances.len() {
            distances.select_nth_unstable_by(n - 1, by_distance);
            distances.truncate(n);
        }
        distances.sort_by(by_distance);

        distances
            .into_iter()
            .map(|(row, d2)| Neighbor {
                row,
                distance: d2.sqrt(),
            })
            .collect()
    }

    /// Neighbors of a corpus member, excluding the member itself.
    pub fn query_row(&self, row: usize, n: usize) -> Option<Vec<Neighbor>> {
        let point = *self.rows.get(row)?;
        Some(self.query(&point, n, Some(row)))
    }
}
