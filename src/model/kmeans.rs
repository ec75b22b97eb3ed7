//! Unsupervised difficulty grading.
//!
//! Tracks are partitioned with k-means in scaled space; clusters are then ranked by
//! the mean moving duration of their training members and given labels from an
//! ordered vocabulary (shortest mean → easiest label).

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::{ModelError, ScaledVector, project, squared_distance};
use crate::features::{DURATION_INDEX, FEATURE_COUNT, feature_names};

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Include the `duration` column in the clustering distance.
    pub cluster_on_duration: bool,
    /// Independent k-means++ restarts; the lowest inertia wins.
    pub n_init: usize,
    pub max_iter: usize,
    pub seed: u64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            cluster_on_duration: true,
            n_init: 10,
            max_iter: 300,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterModel {
    pub feature_names: Vec<String>,
    /// Positions in the scaled vector that take part in the distance.
    pub columns: Vec<usize>,
    /// One centroid per cluster id, in `columns` space.
    pub centroids: Vec<Vec<f64>>,
    /// Label per cluster id.
    pub labels: Vec<String>,
    /// Rank of each cluster id in the vocabulary (0 = easiest).
    pub severity: Vec<usize>,
    /// Mean training duration (seconds) per cluster id.
    pub mean_durations: Vec<f64>,
    /// Training rows per cluster id.
    pub sizes: Vec<usize>,
    pub inertia: f64,
}

/// Outcome of one k-means run.
struct Run {
    centroids: Vec<Vec<f64>>,
    assignments: Vec<usize>,
    inertia: f64,
}

impl ClusterModel {
    /// Cluster the scaled corpus into `vocabulary.len()` groups and label them by
    /// ascending mean duration. Equal means keep ascending cluster id order.
    pub fn fit(
        scaled: &[ScaledVector],
        durations: &[f64],
        vocabulary: &[String],
        options: &ClusterOptions,
    ) -> Result<Self, ModelError> {
        let k = vocabulary.len();
        if scaled.is_empty() {
            return Err(ModelError::EmptyCorpus);
        }
        if durations.len() != scaled.len() {
            return Err(ModelError::DimensionMismatch {
                expected: scaled.len(),
                found: durations.len(),
            });
        }
        if k == 0 || k > scaled.len() {
            return Err(ModelError::TooFewRows {
                rows: scaled.len(),
                clusters: k,
            });
        }

        let columns: Vec<usize> = if options.cluster_on_duration {
            (0..FEATURE_COUNT).collect()
        } else {
            (0..FEATURE_COUNT).filter(|&c| c != DURATION_INDEX).collect()
        };
        let data: Vec<Vec<f64>> = scaled.iter().map(|v| project(v, &columns)).collect();

        // Every cluster needs at least one point of its own
        let distinct = count_distinct(&data);
        if distinct < k {
            return Err(ModelError::TooFewDistinct {
                distinct,
                clusters: k,
            });
        }

        let runs: Vec<Run> = (0..options.n_init.max(1))
            .into_par_iter()
            .map(|i| run_kmeans(&data, k, options.max_iter, options.seed.wrapping_add(i as u64)))
            .collect();

        // Strictly better inertia only, so ties keep the earliest restart
        let mut best = 0;
        for (i, run) in runs.iter().enumerate() {
            if run.inertia < runs[best].inertia {
                best = i;
            }
        }
        let Run {
            centroids,
            assignments,
            inertia,
        } = runs.into_iter().nth(best).ok_or(ModelError::EmptyCorpus)?;

        let mut sums = vec![0.0; k];
        let mut sizes = vec![0usize; k];
        for (&c, &d) in assignments.iter().zip(durations) {
            sums[c] += d;
            sizes[c] += 1;
        }
        if let Some(cluster) = sizes.iter().position(|&n| n == 0) {
            return Err(ModelError::EmptyCluster { cluster });
        }
        let mean_durations: Vec<f64> = sums
            .iter()
            .zip(&sizes)
            .map(|(&s, &n)| s / n as f64)
            .collect();

        let mut order: Vec<usize> = (0..k).collect();
        order.sort_by(|&a, &b| mean_durations[a].total_cmp(&mean_durations[b]));

        let mut severity = vec![0; k];
        for (rank, &cluster) in order.iter().enumerate() {
            severity[cluster] = rank;
        }
        let labels = severity.iter().map(|&rank| vocabulary[rank].clone()).collect();

        log::debug!(
            "k-means: k={} inertia={:.4} sizes={:?} mean durations={:?}",
            k,
            inertia,
            sizes,
            mean_durations
        );

        Ok(Self {
            feature_names: feature_names(),
            columns,
            centroids,
            labels,
            severity,
            mean_durations,
            sizes,
            inertia,
        })
    }

    /// Nearest centroid; ties go to the lowest cluster id.
    pub fn cluster_of(&self, scaled: &ScaledVector) -> usize {
        nearest(&project(scaled, &self.columns), &self.centroids).0
    }

    pub fn predict(&self, scaled: &ScaledVector) -> &str {
        &self.labels[self.cluster_of(scaled)]
    }

    pub fn label_for_cluster(&self, cluster: usize) -> Option<&str> {
        self.labels.get(cluster).map(String::as_str)
    }

    /// Mean training duration per cluster id, in seconds.
    pub fn cluster_mean_durations(&self) -> &[f64] {
        &self.mean_durations
    }

    pub fn k(&self) -> usize {
        self.centroids.len()
    }

    /// Cluster ids ordered from easiest to hardest.
    pub fn clusters_by_severity(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = (0..self.k()).collect();
        ids.sort_by_key(|&c| self.severity[c]);
        ids
    }
}

fn count_distinct(data: &[Vec<f64>]) -> usize {
    data.iter()
        .map(|p| p.iter().map(|v| (v + 0.0).to_bits()).collect::<Vec<u64>>())
        .collect::<HashSet<_>>()
        .len()
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.iter().enumerate() {
        let d = squared_distance(point, centroid);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

fn run_kmeans(data: &[Vec<f64>], k: usize, max_iter: usize, seed: u64) -> Run {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut centroids = init_plus_plus(data, k, &mut rng);
    let mut assignments = vec![usize::MAX; data.len()];

    for _ in 0..max_iter.max(1) {
        if !assign(data, &centroids, &mut assignments) {
            break;
        }
        update_centroids(data, &mut assignments, &mut centroids);
    }
    assign(data, &centroids, &mut assignments);

    let inertia = data
        .iter()
        .zip(&assignments)
        .map(|(p, &c)| squared_distance(p, &centroids[c]))
        .sum();

    Run {
        centroids,
        assignments,
        inertia,
    }
}

/// k-means++ seeding: each new centre is drawn with probability proportional to
/// its squared distance from the centres chosen so far.
fn init_plus_plus(data: &[Vec<f64>], k: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<f64>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(data[rng.gen_range(0..data.len())].clone());

    let mut closest: Vec<f64> = data
        .iter()
        .map(|p| squared_distance(p, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = closest.iter().sum();
        let pick = if total <= 0.0 {
            // every point coincides with a centre already
            rng.gen_range(0..data.len())
        } else {
            let target = rng.gen_range(0.0..total);
            let mut acc = 0.0;
            closest
                .iter()
                .position(|&d| {
                    acc += d;
                    acc > target
                })
                .unwrap_or(data.len() - 1)
        };

        let centre = data[pick].clone();
        for (p, best) in data.iter().zip(closest.iter_mut()) {
            *best = best.min(squared_distance(p, &centre));
        }
        centroids.push(centre);
    }
    centroids
}

/// Reassign every point to its nearest centroid. Returns whether anything moved.
fn assign(data: &[Vec<f64>], centroids: &[Vec<f64>], assignments: &mut [usize]) -> bool {
    let mut changed = false;
    for (p, slot) in data.iter().zip(assignments.iter_mut()) {
        let (c, _) = nearest(p, centroids);
        if *slot != c {
            *slot = c;
            changed = true;
        }
    }
    changed
}

/// Move each centroid to the mean of its members. An empty cluster takes over the
/// point lying farthest from its current centroid.
fn update_centroids(data: &[Vec<f64>], assignments: &mut [usize], centroids: &mut [Vec<f64>]) {
    let dim = data[0].len();
    let k = centroids.len();
    let mut sums = vec![vec![0.0; dim]; k];
    let mut counts = vec![0usize; k];

    for (p, &c) in data.iter().zip(assignments.iter()) {
        counts[c] += 1;
        for (s, v) in sums[c].iter_mut().zip(p) {
            *s += v;
        }
    }

    for c in 0..k {
        if counts[c] > 0 {
            centroids[c] = sums[c].iter().map(|s| s / counts[c] as f64).collect();
            continue;
        }

        let mut far = None;
        let mut far_dist = -1.0;
        for (i, p) in data.iter().enumerate() {
            let owner = assignments[i];
            if counts[owner] <= 1 {
                continue;
            }
            let d = squared_distance(p, &centroids[owner]);
            if d > far_dist {
                far_dist = d;
                far = Some(i);
            }
        }
        if let Some(i) = far {
            counts[assignments[i]] -= 1;
            assignments[i] = c;
            counts[c] = 1;
            centroids[c] = data[i].clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        ["Easy", "Medium", "Hard"].iter().map(|s| s.to_string()).collect()
    }

    /// Three well separated blobs along the diagonal; duration grows with position.
    fn blobs() -> (Vec<ScaledVector>, Vec<f64>) {
        let mut rows = Vec::new();
        let mut durations = Vec::new();
        for (centre, base) in [(0.8, 30000.0), (0.1, 3000.0), (0.45, 12000.0)] {
            for j in 0..10 {
                let jitter = j as f64 * 0.002;
                rows.push([centre + jitter; FEATURE_COUNT]);
                durations.push(base + j as f64 * 10.0);
            }
        }
        (rows, durations)
    }

    #[test]
    fn test_fit_rejects_bad_input() {
        let opts = ClusterOptions::default();
        assert_eq!(
            ClusterModel::fit(&[], &[], &labels(), &opts),
            Err(ModelError::EmptyCorpus)
        );
        let (rows, durations) = blobs();
        assert_eq!(
            ClusterModel::fit(&rows[..2], &durations[..2], &labels(), &opts),
            Err(ModelError::TooFewRows { rows: 2, clusters: 3 })
        );
        assert!(matches!(
            ClusterModel::fit(&rows, &durations[..5], &labels(), &opts),
            Err(ModelError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_labels_follow_mean_duration() {
        let (rows, durations) = blobs();
        let model =
            ClusterModel::fit(&rows, &durations, &labels(), &ClusterOptions::default()).unwrap();

        assert_eq!(model.predict(&[0.1; FEATURE_COUNT]), "Easy");
        assert_eq!(model.predict(&[0.45; FEATURE_COUNT]), "Medium");
        assert_eq!(model.predict(&[0.8; FEATURE_COUNT]), "Hard");
        assert_eq!(model.sizes.iter().sum::<usize>(), rows.len());
        assert!(model.sizes.iter().all(|&n| n == 10));
    }

    #[test]
    fn test_mean_duration_non_decreasing_by_severity() {
        let (rows, durations) = blobs();
        let model =
            ClusterModel::fit(&rows, &durations, &labels(), &ClusterOptions::default()).unwrap();
        let ordered: Vec<f64> = model
            .clusters_by_severity()
            .iter()
            .map(|&c| model.mean_durations[c])
            .collect();
        assert!(ordered.windows(2).all(|w| w[0] <= w[1]));
        let hardest = model.clusters_by_severity()[2];
        assert_eq!(model.label_for_cluster(hardest), Some("Hard"));
        assert_eq!(model.cluster_mean_durations()[hardest], ordered[2]);
        assert_eq!(model.label_for_cluster(3), None);
    }

    #[test]
    fn test_equal_means_ordered_by_cluster_id() {
        let (rows, _) = blobs();
        let durations = vec![5000.0; rows.len()];
        let model =
            ClusterModel::fit(&rows, &durations, &labels(), &ClusterOptions::default()).unwrap();
        assert_eq!(model.severity, vec![0, 1, 2]);
        assert_eq!(model.labels, labels());
    }

    #[test]
    fn test_predict_tie_goes_to_lowest_id() {
        let model = ClusterModel {
            feature_names: feature_names(),
            columns: vec![0],
            centroids: vec![vec![1.0], vec![-1.0]],
            labels: vec!["Hard".into(), "Easy".into()],
            severity: vec![1, 0],
            mean_durations: vec![2.0, 1.0],
            sizes: vec![1, 1],
            inertia: 0.0,
        };
        let mut q = [0.0; FEATURE_COUNT];
        assert_eq!(model.cluster_of(&q), 0);
        q[0] = -0.5;
        assert_eq!(model.predict(&q), "Easy");
    }

    #[test]
    fn test_duration_column_is_optional() {
        let (rows, durations) = blobs();
        let with =
            ClusterModel::fit(&rows, &durations, &labels(), &ClusterOptions::default()).unwrap();
        assert!(with.columns.contains(&DURATION_INDEX));
        assert_eq!(with.centroids[0].len(), FEATURE_COUNT);

        let opts = ClusterOptions {
            cluster_on_duration: false,
            ..ClusterOptions::default()
        };
        let without = ClusterModel::fit(&rows, &durations, &labels(), &opts).unwrap();
        assert!(!without.columns.contains(&DURATION_INDEX));
        assert_eq!(without.centroids[0].len(), FEATURE_COUNT - 1);

        // A query that differs only in duration lands in the same cluster
        let mut q = [0.1; FEATURE_COUNT];
        let before = without.cluster_of(&q);
        q[DURATION_INDEX] = 5.0;
        assert_eq!(without.cluster_of(&q), before);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let (rows, durations) = blobs();
        let opts = ClusterOptions::default();
        let a = ClusterModel::fit(&rows, &durations, &labels(), &opts).unwrap();
        let b = ClusterModel::fit(&rows, &durations, &labels(), &opts).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fewer_distinct_points_than_clusters_rejected() {
        let rows = vec![[0.5; FEATURE_COUNT]; 6];
        let durations = vec![100.0, 200.0, 300.0, 400.0, 500.0, 600.0];
        assert_eq!(
            ClusterModel::fit(&rows, &durations, &labels(), &ClusterOptions::default()),
            Err(ModelError::TooFewDistinct {
                distinct: 1,
                clusters: 3
            })
        );

        // two stacks of five: enough rows, not enough distinct points
        let mut rows = vec![[0.0; FEATURE_COUNT]; 5];
        rows.extend(vec![[1.0; FEATURE_COUNT]; 5]);
        let mut durations = vec![100.0; 5];
        durations.extend(vec![10000.0; 5]);
        assert_eq!(
            ClusterModel::fit(&rows, &durations, &labels(), &ClusterOptions::default()),
            Err(ModelError::TooFewDistinct {
                distinct: 2,
                clusters: 3
            })
        );
    }

    #[test]
    fn test_stacked_duplicates_fill_every_cluster() {
        let mut rows = Vec::new();
        let mut durations = Vec::new();
        for (value, duration) in [(1.0, 20000.0), (0.0, 2000.0), (0.5, 9000.0)] {
            for _ in 0..4 {
                rows.push([value; FEATURE_COUNT]);
                durations.push(duration);
            }
        }
        let model =
            ClusterModel::fit(&rows, &durations, &labels(), &ClusterOptions::default()).unwrap();

        assert_eq!(model.sizes, vec![4, 4, 4]);
        assert!(model.mean_durations.iter().all(|&d| d <= 20000.0));
        assert_eq!(model.predict(&[1.0; FEATURE_COUNT]), "Hard");
        assert_eq!(model.predict(&[0.5; FEATURE_COUNT]), "Medium");
        assert_eq!(model.predict(&[0.0; FEATURE_COUNT]), "Easy");
    }
}
