//! Offline training: corpus → cleaned records → features → fitted bundle → artifacts.
//!
//! Nothing is written unless every step succeeds; the artifact store then swaps
//! the new set in as a unit.

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::artifacts::{ArtifactError, ModelBundle};
use crate::features::{FeatureError, FeatureVector};
use crate::model::forest::{DurationModel, ForestParams};
use crate::model::kmeans::{ClusterModel, ClusterOptions};
use crate::model::neighbors::{FeatureTable, NeighborIndex, TableRow};
use crate::model::scaler::{ScalerKind, ScalerState};
use crate::model::{ModelError, ScaledVector};
use crate::track::corpus::{self, CleaningReport, CleaningThresholds, CorpusError, TrackRecord};

#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error("Row {row}: {source}")]
    Feature { row: usize, source: FeatureError },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("Cannot build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

type Result<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainOptions {
    pub clusters: usize,
    /// Difficulty vocabulary, easiest first. Must have `clusters` entries.
    pub labels: Vec<String>,
    pub seed: u64,
    pub scaler: ScalerKind,
    pub cluster_on_duration: bool,
    pub n_init: usize,
    pub max_iter: usize,
    /// Share of the corpus held out to score the duration model. 0 disables.
    pub holdout_fraction: f64,
    pub forest: ForestParams,
    pub cleaning: CleaningThresholds,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            clusters: 3,
            labels: vec!["Easy".into(), "Medium".into(), "Hard".into()],
            seed: 42,
            scaler: ScalerKind::MinMax,
            cluster_on_duration: true,
            n_init: 10,
            max_iter: 300,
            holdout_fraction: 0.2,
            forest: ForestParams::default(),
            cleaning: CleaningThresholds::default(),
        }
    }
}

impl TrainOptions {
    fn cluster_options(&self) -> ClusterOptions {
        ClusterOptions {
            cluster_on_duration: self.cluster_on_duration,
            n_init: self.n_init,
            max_iter: self.max_iter,
            seed: self.seed,
        }
    }
}

/// Hold-out scores of the duration regressor, in seconds where applicable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegressionMetrics {
    pub n_train: usize,
    pub n_test: usize,
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
    /// Mean absolute percentage error, as a fraction.
    pub mape: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub label: String,
    pub size: usize,
    pub mean_duration: f64,
}

pub struct TrainReport {
    pub rows_read: usize,
    pub malformed: usize,
    pub cleaning: CleaningReport,
    /// Easiest first.
    pub clusters: Vec<ClusterSummary>,
    pub holdout: Option<RegressionMetrics>,
    pub artifact_dir: PathBuf,
}

/// Run the whole offline pipeline and persist the artifacts to `artifact_dir`.
pub fn train(
    corpus_path: &Path,
    clusters: usize,
    artifact_dir: &Path,
    options: &TrainOptions,
    workers: usize,
) -> Result<TrainReport> {
    let options = &TrainOptions {
        clusters,
        ..options.clone()
    };
    if options.labels.len() != clusters {
        return Err(ModelError::LabelCountMismatch {
            clusters,
            labels: options.labels.len(),
        }
        .into());
    }

    let file = corpus::read_corpus(corpus_path)?;
    let (records, cleaning) = corpus::clean(&file.rows, &options.cleaning);
    log::info!(
        "Cleaning kept {}/{} rows (missing {}, zero elapsed {}, zero length {}, \
         zero duration {}, negative break {}, long break {}, too fast {})",
        cleaning.kept,
        cleaning.total,
        cleaning.missing_fields,
        cleaning.zero_elapsed,
        cleaning.zero_length,
        cleaning.zero_duration,
        cleaning.negative_break,
        cleaning.long_break,
        cleaning.too_fast
    );
    if records.is_empty() {
        return Err(ModelError::EmptyCorpus.into());
    }

    let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
    let (bundle, holdout) = pool.install(|| -> Result<_> {
        let bundle = fit_bundle(&records, options)?;
        let holdout = evaluate_holdout(&collect_features(&records)?, options)?;
        Ok((bundle, holdout))
    })?;

    bundle.save(artifact_dir)?;

    let clusters = bundle
        .difficulty
        .clusters_by_severity()
        .into_iter()
        .map(|c| ClusterSummary {
            label: bundle.difficulty.labels[c].clone(),
            size: bundle.difficulty.sizes[c],
            mean_duration: bundle.difficulty.mean_durations[c],
        })
        .collect();

    Ok(TrainReport {
        rows_read: file.rows.len(),
        malformed: file.malformed,
        cleaning,
        clusters,
        holdout,
        artifact_dir: artifact_dir.to_path_buf(),
    })
}

/// Fit every model on `records`. Pure: no I/O.
pub fn fit_bundle(records: &[TrackRecord], options: &TrainOptions) -> Result<ModelBundle> {
    if options.labels.len() != options.clusters {
        return Err(ModelError::LabelCountMismatch {
            clusters: options.clusters,
            labels: options.labels.len(),
        }
        .into());
    }

    let features = collect_features(records)?;
    let scaler = ScalerState::fit(&features, options.scaler)?;
    let scaled = scaler.transform_all(&features);
    let durations: Vec<f64> = features.iter().map(|f| f.duration).collect();

    log::info!("Clustering {} tracks into {} difficulty groups", scaled.len(), options.clusters);
    let difficulty =
        ClusterModel::fit(&scaled, &durations, &options.labels, &options.cluster_options())?;

    log::info!("Fitting duration forest ({} trees)", options.forest.n_trees);
    let duration = DurationModel::fit(&scaled, &durations, &options.forest, options.seed)?;

    let table = FeatureTable::new(
        records
            .iter()
            .zip(&features)
            .map(|(r, f)| TableRow {
                name: r.name.clone(),
                difficulty: r.difficulty.clone(),
                features: *f,
            })
            .collect(),
    );
    let index = NeighborIndex::fit(scaled, &table)?;

    Ok(ModelBundle {
        scaler,
        difficulty,
        duration,
        index,
        table,
    })
}

fn collect_features(records: &[TrackRecord]) -> Result<Vec<FeatureVector>> {
    records
        .iter()
        .enumerate()
        .map(|(row, record)| {
            let f = FeatureVector::from_record(record)
                .map_err(|source| TrainError::Feature { row, source })?;
            f.ensure_trainable().map_err(|source| TrainError::Feature { row, source })?;
            Ok(f)
        })
        .collect()
}

/// Fit a throwaway scaler and forest on a seeded split and score them on the
/// rest. The held-out rows take no part in either fit.
fn evaluate_holdout(
    features: &[FeatureVector],
    options: &TrainOptions,
) -> Result<Option<RegressionMetrics>> {
    let Some((test, train)) = holdout_split(features.len(), options) else {
        return Ok(None);
    };
    let (scaler, model) = fit_holdout(features, &train, options)?;

    let actual: Vec<f64> = test.iter().map(|&i| features[i].duration).collect();
    let predicted: Vec<f64> = test
        .iter()
        .map(|&i| model.predict(&scaler.transform(&features[i])))
        .collect();
    let metrics = regression_metrics(&actual, &predicted, train.len());

    log::info!(
        "Hold-out ({} rows): MAE {:.0}s, RMSE {:.0}s, R² {:.3}, MAPE {:.1}%",
        metrics.n_test,
        metrics.mae,
        metrics.rmse,
        metrics.r2,
        metrics.mape * 100.0
    );
    Ok(Some(metrics))
}

/// Seeded (test, train) row split, or `None` when disabled or the corpus is too small.
fn holdout_split(n: usize, options: &TrainOptions) -> Option<(Vec<usize>, Vec<usize>)> {
    let fraction = options.holdout_fraction;
    if !(fraction > 0.0 && fraction < 1.0) {
        return None;
    }
    let n_test = (n as f64 * fraction).round() as usize;
    if n_test == 0 || n < n_test + 2 {
        log::warn!(
            "Corpus too small for a {:.0}% hold-out, skipping evaluation",
            fraction * 100.0
        );
        return None;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut ChaCha8Rng::seed_from_u64(options.seed));
    let train = order.split_off(n_test);
    Some((order, train))
}

fn fit_holdout(
    features: &[FeatureVector],
    train: &[usize],
    options: &TrainOptions,
) -> Result<(ScalerState, DurationModel)> {
    let train_features: Vec<FeatureVector> = train.iter().map(|&i| features[i]).collect();
    let scaler = ScalerState::fit(&train_features, options.scaler)?;
    let train_x: Vec<ScaledVector> = scaler.transform_all(&train_features);
    let train_y: Vec<f64> = train_features.iter().map(|f| f.duration).collect();
    let model = DurationModel::fit(&train_x, &train_y, &options.forest, options.seed)?;
    Ok((scaler, model))
}

fn regression_metrics(actual: &[f64], predicted: &[f64], n_train: usize) -> RegressionMetrics {
    let n = actual.len() as f64;
    let mean = actual.iter().sum::<f64>() / n;

    let mut abs_sum = 0.0;
    let mut sq_sum = 0.0;
    let mut pct_sum = 0.0;
    let mut total_var = 0.0;
    for (&a, &p) in actual.iter().zip(predicted) {
        let err = p - a;
        abs_sum += err.abs();
        sq_sum += err * err;
        // training rows all have positive duration
        pct_sum += (err / a).abs();
        total_var += (a - mean) * (a - mean);
    }

    RegressionMetrics {
        n_train,
        n_test: actual.len(),
        mae: abs_sum / n,
        rmse: (sq_sum / n).sqrt(),
        r2: if total_var > 0.0 { 1.0 - sq_sum / total_var } else { 0.0 },
        mape: pct_sum / n,
    }
}
