//! The canonical hike feature vector and its derivation from raw track points.
//!
//! Every fitted artifact is indexed positionally against [`FEATURE_NAMES`]. Changing
//! the order or the count invalidates all persisted models, which is detected at
//! load time by comparing the names stored in each artifact.

use crate::track::TrackPoint;
use crate::track::corpus::TrackRecord;
use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FEATURE_COUNT: usize = 7;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "length_3d",
    "min_elevation",
    "max_elevation",
    "uphill",
    "downhill",
    "break_time",
    "duration",
];

pub const BREAK_TIME_INDEX: usize = 5;
pub const DURATION_INDEX: usize = 6;

/// Leading columns that carry no timing information. The duration regressor only
/// ever sees these.
pub const GEOMETRY_FEATURES: usize = 5;

/// 1 km/h: below this a point pair counts as standing still.
pub const DEFAULT_MOVING_SPEED: f64 = 1000.0 / 3600.0;

#[derive(Error, Debug, PartialEq)]
pub enum FeatureError {
    #[error("Not enough track points: need at least 2, got {points}")]
    InsufficientData { points: usize },
    #[error("Degenerate track: {reason}")]
    DegenerateTrack { reason: &'static str },
    #[error("Feature {feature} is not a finite number")]
    NonFinite { feature: &'static str },
}

/// Owned copy of [`FEATURE_NAMES`], stored inside every artifact.
pub fn feature_names() -> Vec<String> {
    FEATURE_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Whether an artifact's recorded feature names match the current extractor.
pub fn matches_feature_order(names: &[String]) -> bool {
    names.len() == FEATURE_COUNT && names.iter().zip(FEATURE_NAMES).all(|(a, b)| a == b)
}

/// Summary of one hike. Field order mirrors [`FEATURE_NAMES`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Metres along the track, elevation included.
    pub length_3d: f64,
    pub min_elevation: f64,
    pub max_elevation: f64,
    /// Cumulative climb in metres.
    pub uphill: f64,
    /// Cumulative descent in metres, positive.
    pub downhill: f64,
    /// Seconds stopped.
    pub break_time: f64,
    /// Seconds moving.
    pub duration: f64,
}

impl FeatureVector {
    /// Build from positional values, rejecting NaN and infinities.
    pub fn try_from_array(values: [f64; FEATURE_COUNT]) -> Result<Self, FeatureError> {
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(FeatureError::NonFinite {
                feature: FEATURE_NAMES[i],
            });
        }
        Ok(Self::from_array(values))
    }

    pub(crate) fn from_array(v: [f64; FEATURE_COUNT]) -> Self {
        Self {
            length_3d: v[0],
            min_elevation: v[1],
            max_elevation: v[2],
            uphill: v[3],
            downhill: v[4],
            break_time: v[5],
            duration: v[6],
        }
    }

    pub fn to_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.length_3d,
            self.min_elevation,
            self.max_elevation,
            self.uphill,
            self.downhill,
            self.break_time,
            self.duration,
        ]
    }

    /// Features of a catalog row: timing comes from the catalog, not from points.
    pub fn from_record(record: &TrackRecord) -> Result<Self, FeatureError> {
        Self::try_from_array([
            record.length_3d,
            record.min_elevation,
            record.max_elevation,
            record.uphill,
            record.downhill,
            record.break_time().max(0.0),
            record.duration(),
        ])
    }

    /// Training rows must have both distance and moving time.
    pub fn ensure_trainable(&self) -> Result<(), FeatureError> {
        if self.length_3d <= 0.0 {
            return Err(FeatureError::DegenerateTrack {
                reason: "zero length",
            });
        }
        if self.duration <= 0.0 {
            return Err(FeatureError::DegenerateTrack {
                reason: "zero duration",
            });
        }
        Ok(())
    }
}

/// Knobs for point-based extraction.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Minimum implied speed (m/s) for a point pair to count as moving.
    /// `None` disables moving detection and duration becomes the elapsed time.
    pub moving_speed_threshold: Option<f64>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            moving_speed_threshold: Some(DEFAULT_MOVING_SPEED),
        }
    }
}

/// Features of a freshly recorded track plus its raw wall-clock span.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extraction {
    pub features: FeatureVector,
    /// Seconds between the first and last timestamped point.
    pub elapsed_secs: f64,
}

/// Derive the feature vector from an ordered point sequence.
///
/// Elevation deltas are taken raw, without smoothing. A pair where either point
/// lacks elevation contributes horizontal distance only. Timestamps that step
/// backwards contribute no time.
pub fn extract(
    points: &[TrackPoint],
    options: &ExtractOptions,
) -> Result<Extraction, FeatureError> {
    if points.len() < 2 {
        return Err(FeatureError::InsufficientData {
            points: points.len(),
        });
    }

    let mut length_3d = 0.0;
    let mut uphill = 0.0;
    let mut downhill = 0.0;
    let mut moving = 0.0;

    for pair in points.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let horizontal = Haversine::distance(
            Point::new(a.longitude, a.latitude),
            Point::new(b.longitude, b.latitude),
        );
        let rise = match (a.elevation, b.elevation) {
            (Some(za), Some(zb)) => zb - za,
            _ => 0.0,
        };
        let step = (horizontal * horizontal + rise * rise).sqrt();

        length_3d += step;
        if rise > 0.0 {
            uphill += rise;
        } else {
            downhill -= rise;
        }

        if let (Some(ta), Some(tb), Some(threshold)) =
            (a.time, b.time, options.moving_speed_threshold)
        {
            let dt = (tb - ta).num_milliseconds() as f64 / 1000.0;
            if dt > 0.0 && step / dt > threshold {
                moving += dt;
            }
        }
    }

    let (min_elevation, max_elevation) = points
        .iter()
        .filter_map(|p| p.elevation)
        .fold(None, |acc: Option<(f64, f64)>, z| match acc {
            Some((lo, hi)) => Some((lo.min(z), hi.max(z))),
            None => Some((z, z)),
        })
        .unwrap_or((0.0, 0.0));

    let elapsed_secs = elapsed(points);
    let duration = match options.moving_speed_threshold {
        Some(_) => moving,
        None => elapsed_secs,
    };

    let features = FeatureVector::try_from_array([
        length_3d,
        min_elevation,
        max_elevation,
        uphill,
        downhill,
        (elapsed_secs - duration).max(0.0),
        duration,
    ])?;

    Ok(Extraction { features, elapsed_secs })
}

fn elapsed(points: &[TrackPoint]) -> f64 {
    let first = points.iter().find_map(|p| p.time);
    let last = points.iter().rev().find_map(|p| p.time);
    match (first, last) {
        (Some(a), Some(b)) => ((b - a).num_milliseconds() as f64 / 1000.0).max(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 7, 3, 8, 0, 0).unwrap()
    }

    fn pt(lat: f64, lon: f64, ele: f64, secs: i64) -> TrackPoint {
        TrackPoint::new(lat, lon, Some(ele), Some(t0() + Duration::seconds(secs)))
    }

    #[test]
    fn test_feature_names_match_struct_order() {
        let v = FeatureVector::from_array([1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(v.length_3d, 1.0);
        assert_eq!(v.break_time, 6.0);
        assert_eq!(v.duration, 7.0);
        assert_eq!(v.to_array()[DURATION_INDEX], 7.0);
        assert_eq!(v.to_array()[BREAK_TIME_INDEX], 6.0);
        assert!(matches_feature_order(&feature_names()));
    }

    #[test]
    fn test_feature_order_mismatch_detected() {
        let mut names = feature_names();
        names.swap(0, 1);
        assert!(!matches_feature_order(&names));
        assert!(!matches_feature_order(&names[..6]));
    }

    #[test]
    fn test_extract_requires_two_points() {
        let one = vec![pt(46.5, 7.9, 1200.0, 0)];
        assert_eq!(
            extract(&one, &ExtractOptions::default()),
            Err(FeatureError::InsufficientData { points: 1 })
        );
        assert_eq!(
            extract(&[], &ExtractOptions::default()),
            Err(FeatureError::InsufficientData { points: 0 })
        );
    }

    #[test]
    fn test_identical_points_are_degenerate() {
        let points = vec![pt(46.5, 7.9, 1200.0, 0), pt(46.5, 7.9, 1200.0, 0)];
        let ex = extract(&points, &ExtractOptions::default()).unwrap();
        assert_eq!(ex.features.length_3d, 0.0);
        assert_eq!(ex.features.duration, 0.0);
        assert!(matches!(
            ex.features.ensure_trainable(),
            Err(FeatureError::DegenerateTrack { .. })
        ));
    }

    #[test]
    fn test_vertical_climb_counts_in_length() {
        // Pure vertical step: 3D length equals the climb
        let points = vec![pt(46.5, 7.9, 1000.0, 0), pt(46.5, 7.9, 1030.0, 60)];
        let ex = extract(&points, &ExtractOptions::default()).unwrap();
        assert!((ex.features.length_3d - 30.0).abs() < 1e-9);
        assert!((ex.features.uphill - 30.0).abs() < 1e-9);
        assert_eq!(ex.features.downhill, 0.0);
        assert!((ex.features.duration - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_extract_aggregates() {
        // ~111 m per 0.001 deg of latitude
        let points = vec![
            pt(46.500, 7.9, 1200.0, 0),
            pt(46.501, 7.9, 1250.0, 120),
            pt(46.502, 7.9, 1230.0, 240),
            // 10 minute stop at the same spot
            pt(46.502, 7.9, 1230.0, 840),
            pt(46.503, 7.9, 1180.0, 960),
        ];
        let ex = extract(&points, &ExtractOptions::default()).unwrap();
        let f = ex.features;

        assert!(f.length_3d > 355.0 && f.length_3d < 359.0);
        assert!((f.uphill - 50.0).abs() < 1e-9);
        assert!((f.downhill - 70.0).abs() < 1e-9);
        assert_eq!(f.min_elevation, 1180.0);
        assert_eq!(f.max_elevation, 1250.0);
        assert!((ex.elapsed_secs - 960.0).abs() < 1e-9);
        assert!((f.duration - 360.0).abs() < 1e-9);
        assert!((f.break_time - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_moving_detection_uses_elapsed() {
        let points = vec![
            pt(46.500, 7.9, 1200.0, 0),
            pt(46.500, 7.9, 1200.0, 600),
            pt(46.501, 7.9, 1210.0, 720),
        ];
        let opts = ExtractOptions {
            moving_speed_threshold: None,
        };
        let ex = extract(&points, &opts).unwrap();
        assert!((ex.features.duration - 720.0).abs() < 1e-9);
        assert_eq!(ex.features.break_time, 0.0);
    }

    #[test]
    fn test_missing_timestamps_give_zero_duration() {
        let points = vec![
            TrackPoint::new(46.500, 7.9, Some(1200.0), None),
            TrackPoint::new(46.501, 7.9, Some(1210.0), None),
        ];
        let ex = extract(&points, &ExtractOptions::default()).unwrap();
        assert!(ex.features.length_3d > 0.0);
        assert_eq!(ex.features.duration, 0.0);
        assert_eq!(ex.elapsed_secs, 0.0);
        assert!(ex.features.ensure_trainable().is_err());
    }

    #[test]
    fn test_backwards_timestamp_contributes_nothing() {
        let points = vec![
            pt(46.500, 7.9, 1200.0, 100),
            pt(46.501, 7.9, 1200.0, 50),
            pt(46.502, 7.9, 1200.0, 200),
        ];
        let ex = extract(&points, &ExtractOptions::default()).unwrap();
        assert!((ex.features.duration - 150.0).abs() < 1e-9);
        assert!((ex.elapsed_secs - 100.0).abs() < 1e-9);
        assert!(ex.features.break_time >= 0.0);
    }

    #[test]
    fn test_extracted_fields_non_negative() {
        // Below sea level: elevations may be negative, nothing else may
        let points = vec![
            pt(31.50, 35.50, -400.0, 0),
            pt(31.51, 35.50, -380.0, 900),
            pt(31.52, 35.51, -420.0, 1800),
            pt(31.52, 35.51, -420.0, 1800),
        ];
        let f = extract(&points, &ExtractOptions::default()).unwrap().features;
        assert!(f.max_elevation >= f.min_elevation);
        assert!(f.min_elevation < 0.0);
        for (name, value) in FEATURE_NAMES.iter().zip(f.to_array()) {
            if !name.ends_with("elevation") {
                assert!(value >= 0.0, "{} = {}", name, value);
            }
        }
    }

    #[test]
    fn test_non_finite_rejected() {
        let err = FeatureVector::try_from_array([1.0, f64::NAN, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(
            err,
            Err(FeatureError::NonFinite {
                feature: "min_elevation"
            })
        );
    }
}
