//! Online inference against a frozen model bundle.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use thiserror::Error;

use crate::artifacts::{ArtifactError, ModelBundle};
use crate::features::{self, DEFAULT_MOVING_SPEED, ExtractOptions, FeatureError, FeatureVector};
use crate::model::neighbors::Neighbor;
use crate::track::{self, TrackError, TrackPoint};

#[derive(Error, Debug)]
pub enum PredictError {
    #[error(transparent)]
    Track(#[from] TrackError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PredictOptions {
    /// Similar hikes returned per prediction.
    pub neighbors: usize,
    /// Moving-detection threshold in m/s; must match what the corpus was built with.
    pub moving_speed_threshold: Option<f64>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            neighbors: 5,
            moving_speed_threshold: Some(DEFAULT_MOVING_SPEED),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearestHike {
    /// Row in the training corpus, usable with `trailgrade similar`.
    pub row: usize,
    pub name: Option<String>,
    pub difficulty: Option<String>,
    pub duration_hm: String,
    pub length_3d_m: f64,
    pub uphill_m: f64,
    pub downhill_m: f64,
    pub break_time_hm: String,
    /// Euclidean distance in scaled space.
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub length_3d_m: f64,
    pub uphill_m: f64,
    pub downhill_m: f64,
    pub min_elevation_m: f64,
    pub max_elevation_m: f64,
    pub break_time_sec: f64,
    pub observed_duration_sec: f64,
    pub observed_duration_hm: String,
    pub predicted_duration_sec: f64,
    pub predicted_duration_hm: String,
    pub predicted_difficulty: String,
    /// No moving time could be measured, so duration-based features are zero.
    pub low_confidence: bool,
    /// The regressor's output was unusable; the predicted duration is the observed one.
    pub duration_fallback: bool,
    pub nearest_hikes: Vec<NearestHike>,
}

/// Loaded once, then shared read-only between callers.
pub struct Predictor {
    bundle: ModelBundle,
    options: PredictOptions,
}

impl Predictor {
    pub fn load(artifact_dir: &Path, options: PredictOptions) -> Result<Self, ArtifactError> {
        Ok(Self::new(ModelBundle::load(artifact_dir)?, options))
    }

    pub fn new(bundle: ModelBundle, options: PredictOptions) -> Self {
        Self { bundle, options }
    }

    pub fn bundle(&self) -> &ModelBundle {
        &self.bundle
    }

    pub fn options(&self) -> &PredictOptions {
        &self.options
    }

    pub fn predict_gpx<R: Read>(&self, reader: R) -> Result<PredictionResult, PredictError> {
        let points = track::read_gpx(reader)?;
        self.predict_points(&points)
    }

    pub fn predict_points(&self, points: &[TrackPoint]) -> Result<PredictionResult, PredictError> {
        let extraction = features::extract(
            points,
            &ExtractOptions {
                moving_speed_threshold: self.options.moving_speed_threshold,
            },
        )?;
        self.predict_features(&extraction.features, extraction.elapsed_secs)
    }

    /// Score one feature vector. `elapsed_secs` is the track's wall-clock span and
    /// stands in for the duration if the regressor output is unusable.
    pub fn predict_features(
        &self,
        features: &FeatureVector,
        elapsed_secs: f64,
    ) -> Result<PredictionResult, PredictError> {
        if features.length_3d <= 0.0 {
            return Err(FeatureError::DegenerateTrack {
                reason: "zero length",
            }
            .into());
        }
        let low_confidence = features.duration <= 0.0;
        if low_confidence {
            log::warn!("Track has no measurable moving time; scoring with zero duration");
        }

        // One scaled vector feeds all three models
        let scaled = self.bundle.scaler.transform(features);
        let difficulty = self.bundle.difficulty.predict(&scaled).to_string();
        let raw_prediction = self.bundle.duration.predict(&scaled);
        let index_hits = self.bundle.index.query(&scaled, self.options.neighbors, None);

        let duration_fallback = !raw_prediction.is_finite() || raw_prediction <= 0.0;
        let predicted = if duration_fallback {
            log::warn!(
                "Duration model returned {}; falling back to observed {:.0}s",
                raw_prediction,
                elapsed_secs
            );
            elapsed_secs
        } else {
            raw_prediction
        };

        log::debug!(
            "Predicted {} / {:.0}s, nearest distance {:?}",
            difficulty,
            predicted,
            index_hits.first().map(|n| n.distance)
        );

        Ok(PredictionResult {
            length_3d_m: round2(features.length_3d),
            uphill_m: round2(features.uphill),
            downhill_m: round2(features.downhill),
            min_elevation_m: round2(features.min_elevation),
            max_elevation_m: round2(features.max_elevation),
            break_time_sec: round2(features.break_time),
            observed_duration_sec: round2(elapsed_secs),
            observed_duration_hm: format_hm(elapsed_secs),
            predicted_duration_sec: round2(predicted),
            predicted_duration_hm: format_hm(predicted),
            predicted_difficulty: difficulty,
            low_confidence,
            duration_fallback,
            nearest_hikes: self.describe(&index_hits),
        })
    }

    /// Corpus hikes most like corpus row `row`, excluding the row itself.
    pub fn similar(&self, row: usize, n: usize) -> Option<Vec<NearestHike>> {
        let hits = self.bundle.index.query_row(row, n)?;
        Some(self.describe(&hits))
    }

    fn describe(&self, hits: &[Neighbor]) -> Vec<NearestHike> {
        hits.iter()
            .filter_map(|hit| {
                let entry = self.bundle.table.get(hit.row)?;
                let f = &entry.features;
                Some(NearestHike {
                    row: hit.row,
                    name: entry.name.clone(),
                    difficulty: entry.difficulty.clone(),
                    duration_hm: format_hm(f.duration),
                    length_3d_m: round2(f.length_3d),
                    uphill_m: round2(f.uphill),
                    downhill_m: round2(f.downhill),
                    break_time_hm: format_hm(f.break_time),
                    distance: hit.distance,
                })
            })
            .collect()
    }
}

/// Seconds as `"{h}h {mm}m"`, rounded to the nearest minute.
pub fn format_hm(secs: f64) -> String {
    let minutes = if secs.is_finite() && secs > 0.0 {
        (secs / 60.0).round() as u64
    } else {
        0
    };
    format!("{}h {:02}m", minutes / 60, minutes % 60)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
