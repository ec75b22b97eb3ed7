//! Duration regressor: a random forest of CART trees over the geometry columns.
//!
//! The model is fit on the scaled feature vector but only ever reads the first
//! [`GEOMETRY_FEATURES`] columns, so the observed moving time (the target) and the
//! break time can never leak into its input.

use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{ModelError, ScaledVector, project};
use crate::features::{GEOMETRY_FEATURES, feature_names};

/// Fixed forest hyperparameters. These are configuration, never tuned online.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Candidate features per split. `None` = floor(sqrt(inputs)), at least 1.
    pub max_features: Option<usize>,
    pub bootstrap: bool,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 200,
            max_depth: 15,
            min_samples_split: 5,
            min_samples_leaf: 2,
            max_features: None,
            bootstrap: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict(&self, x: &[f64]) -> f64 {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    at = if x[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationModel {
    pub feature_names: Vec<String>,
    /// Positions in the scaled vector the trees read.
    pub columns: Vec<usize>,
    pub params: ForestParams,
    trees: Vec<Tree>,
}

impl DurationModel {
    /// Fit `params.n_trees` trees in parallel. Each tree draws from its own RNG
    /// stream derived from `seed`, so the result does not depend on thread count.
    pub fn fit(
        scaled: &[ScaledVector],
        targets: &[f64],
        params: &ForestParams,
        seed: u64,
    ) -> Result<Self, ModelError> {
        if scaled.is_empty() {
            return Err(ModelError::EmptyCorpus);
        }
        if targets.len() != scaled.len() {
            return Err(ModelError::DimensionMismatch {
                expected: scaled.len(),
                found: targets.len(),
            });
        }

        let columns: Vec<usize> = (0..GEOMETRY_FEATURES).collect();
        let data: Vec<Vec<f64>> = scaled.iter().map(|v| project(v, &columns)).collect();
        let max_features = params
            .max_features
            .unwrap_or_else(|| (columns.len() as f64).sqrt() as usize)
            .clamp(1, columns.len());

        let pb = ProgressBar::new(params.n_trees as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} trees ({eta} remaining)",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );

        let trees: Vec<Tree> = (0..params.n_trees.max(1))
            .into_par_iter()
            .map(|t| {
                let mut rng = ChaCha8Rng::seed_from_u64(tree_seed(seed, t));
                let mut rows: Vec<usize> = if params.bootstrap {
                    (0..data.len()).map(|_| rng.gen_range(0..data.len())).collect()
                } else {
                    (0..data.len()).collect()
                };
                let mut builder = TreeBuilder {
                    data: &data,
                    targets,
                    params,
                    max_features,
                    rng,
                    nodes: Vec::new(),
                };
                builder.grow(&mut rows, 0);
                pb.inc(1);
                Tree {
                    nodes: builder.nodes,
                }
            })
            .collect();

        pb.finish_and_clear();

        Ok(Self {
            feature_names: feature_names(),
            columns,
            params: params.clone(),
            trees,
        })
    }

    /// Mean of the per-tree predictions, in seconds.
    pub fn predict(&self, scaled: &ScaledVector) -> f64 {
        let x = project(scaled, &self.columns);
        let total: f64 = self.trees.iter().map(|t| t.predict(&x)).sum();
        total / self.trees.len().max(1) as f64
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Every split reads one of `columns` and points forward to nodes that exist,
    /// so prediction always reaches a leaf.
    pub(crate) fn is_well_formed(&self) -> bool {
        self.trees.iter().all(|tree| {
            !tree.nodes.is_empty()
                && tree.nodes.iter().enumerate().all(|(at, node)| match node {
                    Node::Leaf { .. } => true,
                    Node::Split {
                        feature,
                        left,
                        right,
                        ..
                    } => {
                        *feature < self.columns.len()
                            && [*left, *right]
                                .iter()
                                .all(|&child| child > at && child < tree.nodes.len())
                    }
                })
        })
    }
}

fn tree_seed(seed: u64, tree: usize) -> u64 {
    seed ^ (tree as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

struct TreeBuilder<'a> {
    data: &'a [Vec<f64>],
    targets: &'a [f64],
    params: &'a ForestParams,
    max_features: usize,
    rng: ChaCha8Rng,
    nodes: Vec<Node>,
}

/// Best split found for a node: sorted position and threshold on one feature.
struct Split {
    feature: usize,
    threshold: f64,
    position: usize,
    score: f64,
}

impl TreeBuilder<'_> {
    /// Grow the subtree for `rows` and return its node index.
    fn grow(&mut self, rows: &mut [usize], depth: usize) -> usize {
        let n = rows.len();
        let sum: f64 = rows.iter().map(|&r| self.targets[r]).sum();
        let mean = sum / n as f64;

        let splittable = depth < self.params.max_depth
            && n >= self.params.min_samples_split.max(2)
            && n >= 2 * self.params.min_samples_leaf.max(1)
            && rows.iter().any(|&r| self.targets[r] != self.targets[rows[0]]);

        let split = if splittable { self.best_split(rows, sum) } else { None };
        let Some(split) = split else {
            self.nodes.push(Node::Leaf { value: mean });
            return self.nodes.len() - 1;
        };

        self.sort_by_feature(rows, split.feature);
        let at = self.nodes.len();
        self.nodes.push(Node::Leaf { value: mean });

        let (left_rows, right_rows) = rows.split_at_mut(split.position);
        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[at] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        at
    }

    /// Maximise the reduction in squared error over a random feature subset,
    /// i.e. maximise `S_l²/n_l + S_r²/n_r`.
    fn best_split(&mut self, rows: &mut [usize], total: f64) -> Option<Split> {
        let n = rows.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        let parent_score = total * total / n as f64;
        let inputs = self.data[0].len();

        // Visit features in random order; past the first `max_features`, keep
        // looking only while no valid split has turned up.
        let order = sample(&mut self.rng, inputs, inputs).into_vec();

        let mut best: Option<Split> = None;
        for (visited, feature) in order.into_iter().enumerate() {
            if visited >= self.max_features && best.is_some() {
                break;
            }
            self.sort_by_feature(rows, feature);

            let mut left_sum = 0.0;
            for position in 1..n {
                left_sum += self.targets[rows[position - 1]];
                if position < min_leaf || n - position < min_leaf {
                    continue;
                }
                let lo = self.data[rows[position - 1]][feature];
                let hi = self.data[rows[position]][feature];
                if lo == hi {
                    continue;
                }

                let right_sum = total - left_sum;
                let score = left_sum * left_sum / position as f64
                    + right_sum * right_sum / (n - position) as f64;
                if score > parent_score + 1e-12 && best.as_ref().is_none_or(|b| score > b.score) {
                    let mid = lo + (hi - lo) / 2.0;
                    best = Some(Split {
                        feature,
                        threshold: if mid < hi { mid } else { lo },
                        position,
                        score,
                    });
                }
            }
        }
        best
    }

    fn sort_by_feature(&self, rows: &mut [usize], feature: usize) {
        rows.sort_by(|&a, &b| {
            self.data[a][feature]
                .total_cmp(&self.data[b][feature])
                .then(a.cmp(&b))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{BREAK_TIME_INDEX, DURATION_INDEX, FEATURE_COUNT};

    /// Duration grows linearly with length (column 0), noise-free.
    fn linear_corpus(n: usize) -> (Vec<ScaledVector>, Vec<f64>) {
        let mut rows = Vec::new();
        let mut targets = Vec::new();
        for i in 0..n {
            let x = i as f64 / (n - 1) as f64;
            let mut row = [0.5; FEATURE_COUNT];
            row[0] = x;
            row[3] = x * 0.8;
            row[DURATION_INDEX] = x;
            rows.push(row);
            targets.push(3600.0 + 20000.0 * x);
        }
        (rows, targets)
    }

    fn small_params() -> ForestParams {
        ForestParams {
            n_trees: 30,
            ..ForestParams::default()
        }
    }

    #[test]
    fn test_fit_rejects_bad_input() {
        assert_eq!(
            DurationModel::fit(&[], &[], &small_params(), 42),
            Err(ModelError::EmptyCorpus)
        );
        let (rows, targets) = linear_corpus(10);
        assert!(matches!(
            DurationModel::fit(&rows, &targets[..3], &small_params(), 42),
            Err(ModelError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_never_reads_time_columns() {
        let (rows, targets) = linear_corpus(60);
        let model = DurationModel::fit(&rows, &targets, &small_params(), 42).unwrap();
        assert!(!model.columns.contains(&DURATION_INDEX));
        assert!(!model.columns.contains(&BREAK_TIME_INDEX));

        let mut q = rows[30];
        let base = model.predict(&q);
        q[DURATION_INDEX] = 100.0;
        q[BREAK_TIME_INDEX] = -100.0;
        assert_eq!(model.predict(&q), base);
    }

    #[test]
    fn test_learns_monotone_trend() {
        let (rows, targets) = linear_corpus(100);
        let model = DurationModel::fit(&rows, &targets, &small_params(), 42).unwrap();

        let short = model.predict(&rows[5]);
        let long = model.predict(&rows[95]);
        assert!(long > short);
        // in-sample error stays within a few percent of the target range
        let mae: f64 = rows
            .iter()
            .zip(&targets)
            .map(|(r, t)| (model.predict(r) - t).abs())
            .sum::<f64>()
            / rows.len() as f64;
        assert!(mae < 1500.0, "mae {}", mae);
    }

    #[test]
    fn test_predictions_within_target_range() {
        let (rows, targets) = linear_corpus(50);
        let model = DurationModel::fit(&rows, &targets, &small_params(), 7).unwrap();
        let lo = targets.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = targets.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut far = rows[0];
        far[0] = 10.0;
        for q in rows.iter().chain(std::iter::once(&far)) {
            let p = model.predict(q);
            assert!(p >= lo && p <= hi);
        }
    }

    #[test]
    fn test_same_seed_same_forest() {
        let (rows, targets) = linear_corpus(40);
        let a = DurationModel::fit(&rows, &targets, &small_params(), 42).unwrap();
        let b = DurationModel::fit(&rows, &targets, &small_params(), 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.tree_count(), 30);
    }

    #[test]
    fn test_constant_target_single_leaf() {
        let (rows, _) = linear_corpus(20);
        let targets = vec![5400.0; rows.len()];
        let model = DurationModel::fit(&rows, &targets, &small_params(), 1).unwrap();
        assert_eq!(model.predict(&rows[3]), 5400.0);
    }

    #[test]
    fn test_fitted_trees_are_well_formed() {
        let (rows, targets) = linear_corpus(40);
        let mut model = DurationModel::fit(&rows, &targets, &small_params(), 42).unwrap();
        assert!(model.is_well_formed());

        // a split pointing back at its parent would loop forever
        model.trees[0].nodes[0] = Node::Split {
            feature: 0,
            threshold: 0.5,
            left: 0,
            right: 0,
        };
        assert!(!model.is_well_formed());

        model.trees[0].nodes = Vec::new();
        assert!(!model.is_well_formed());
    }

    #[test]
    fn test_serde_round_trip_predicts_identically() {
        let (rows, targets) = linear_corpus(30);
        let model = DurationModel::fit(&rows, &targets, &small_params(), 42).unwrap();
        let json = serde_json::to_string(&model).unwrap();
        let loaded: DurationModel = serde_json::from_str(&json).unwrap();
        for r in &rows {
            assert_eq!(loaded.predict(r), model.predict(r));
        }
    }
}
