pub mod forest;
pub mod kmeans;
pub mod neighbors;
pub mod scaler;

use crate::features::FEATURE_COUNT;
use thiserror::Error;

/// A feature vector after the scaler's transform. Positions follow
/// [`crate::features::FEATURE_NAMES`].
pub type ScaledVector = [f64; FEATURE_COUNT];

#[derive(Error, Debug, PartialEq)]
pub enum ModelError {
    #[error("Cannot fit on an empty corpus")]
    EmptyCorpus,
    #[error("Cannot form {clusters} clusters from {rows} rows")]
    TooFewRows { rows: usize, clusters: usize },
    #[error("Cannot form {clusters} clusters from {distinct} distinct points")]
    TooFewDistinct { distinct: usize, clusters: usize },
    #[error("Cluster {cluster} ended with no members")]
    EmptyCluster { cluster: usize },
    #[error("{clusters} clusters need {clusters} difficulty labels, got {labels}")]
    LabelCountMismatch { clusters: usize, labels: usize },
    #[error("Expected {expected} values, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// Squared Euclidean distance over the overlapping prefix of two slices.
#[inline]
pub(crate) fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Keep only the listed columns of a scaled vector.
pub(crate) fn project(v: &ScaledVector, columns: &[usize]) -> Vec<f64> {
    columns.iter().map(|&c| v[c]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squared_distance() {
        assert_eq!(squared_distance(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
        assert_eq!(squared_distance(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_project_columns() {
        let v = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(project(&v, &[0, 6]), vec![0.0, 6.0]);
    }
}
