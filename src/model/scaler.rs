use serde::{Deserialize, Serialize};

use super::{ModelError, ScaledVector};
use crate::features::{FEATURE_COUNT, FeatureVector, feature_names};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerKind {
    /// `(x - min) / (max - min)`
    #[default]
    MinMax,
    /// `(x - mean) / std`
    Standard,
}

/// Per-feature affine transform learned from the training corpus.
///
/// Both kinds reduce to `(x - offset) / scale`. Values outside the fitted range
/// extrapolate linearly; nothing is clamped, so downstream models must accept
/// scaled values outside [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub kind: ScalerKind,
    pub feature_names: Vec<String>,
    pub offsets: [f64; FEATURE_COUNT],
    pub scales: [f64; FEATURE_COUNT],
}

impl ScalerState {
    pub fn fit(vectors: &[FeatureVector], kind: ScalerKind) -> Result<Self, ModelError> {
        if vectors.is_empty() {
            return Err(ModelError::EmptyCorpus);
        }

        let rows: Vec<[f64; FEATURE_COUNT]> = vectors.iter().map(FeatureVector::to_array).collect();
        let (offsets, scales) = match kind {
            ScalerKind::MinMax => min_max(&rows),
            ScalerKind::Standard => mean_std(&rows),
        };

        // A constant feature keeps scale 1 so every training value maps to 0
        let scales = scales.map(|s| if s.abs() < 1e-12 { 1.0 } else { s });

        Ok(Self {
            kind,
            feature_names: feature_names(),
            offsets,
            scales,
        })
    }

    pub fn transform(&self, vector: &FeatureVector) -> ScaledVector {
        let raw = vector.to_array();
        std::array::from_fn(|d| (raw[d] - self.offsets[d]) / self.scales[d])
    }

    pub fn transform_all(&self, vectors: &[FeatureVector]) -> Vec<ScaledVector> {
        vectors.iter().map(|v| self.transform(v)).collect()
    }

    /// Map a scaled vector back to raw units.
    pub fn inverse(&self, scaled: &ScaledVector) -> FeatureVector {
        FeatureVector::from_array(std::array::from_fn(|d| {
            scaled[d] * self.scales[d] + self.offsets[d]
        }))
    }
}

fn min_max(rows: &[[f64; FEATURE_COUNT]]) -> ([f64; FEATURE_COUNT], [f64; FEATURE_COUNT]) {
    let mut mins = [f64::INFINITY; FEATURE_COUNT];
    let mut maxs = [f64::NEG_INFINITY; FEATURE_COUNT];
    for row in rows {
        for d in 0..FEATURE_COUNT {
            mins[d] = mins[d].min(row[d]);
            maxs[d] = maxs[d].max(row[d]);
        }
    }
    (mins, std::array::from_fn(|d| maxs[d] - mins[d]))
}

/// Population mean and standard deviation per dimension.
fn mean_std(rows: &[[f64; FEATURE_COUNT]]) -> ([f64; FEATURE_COUNT], [f64; FEATURE_COUNT]) {
    let n = rows.len() as f64;

    let mut means = [0.0_f64; FEATURE_COUNT];
    for row in rows {
        for (d, &val) in row.iter().enumerate() {
            means[d] += val;
        }
    }
    for m in &mut means {
        *m /= n;
    }

    let mut vars = [0.0_f64; FEATURE_COUNT];
    for row in rows {
        for (d, &val) in row.iter().enumerate() {
            let diff = val - means[d];
            vars[d] += diff * diff;
        }
    }

    (means, vars.map(|v| (v / n).sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv(v: [f64; FEATURE_COUNT]) -> FeatureVector {
        FeatureVector::try_from_array(v).unwrap()
    }

    fn corpus() -> Vec<FeatureVector> {
        vec![
            fv([8000.0, 800.0, 1400.0, 650.0, 640.0, 3600.0, 7200.0]),
            fv([12000.0, 450.0, 2100.0, 1700.0, 1650.0, 5400.0, 14400.0]),
            fv([3500.0, 1200.0, 1500.0, 300.0, 310.0, 600.0, 3000.0]),
            fv([15500.0, -20.0, 900.0, 950.0, 960.0, 0.0, 16000.0]),
        ]
    }

    #[test]
    fn test_fit_empty_fails() {
        assert_eq!(
            ScalerState::fit(&[], ScalerKind::MinMax),
            Err(ModelError::EmptyCorpus)
        );
    }

    #[test]
    fn test_min_max_extrema_map_exactly() {
        let data = corpus();
        let scaler = ScalerState::fit(&data, ScalerKind::MinMax).unwrap();
        let scaled = scaler.transform_all(&data);

        // length_3d: min row 2, max row 3
        assert_eq!(scaled[2][0], 0.0);
        assert_eq!(scaled[3][0], 1.0);
        // min_elevation: min row 3, max row 2
        assert_eq!(scaled[3][1], 0.0);
        assert_eq!(scaled[2][1], 1.0);
        for row in &scaled {
            for &v in row {
                assert!((0.0..=1.0).contains(&v));
            }
        }
    }

    #[test]
    fn test_out_of_range_extrapolates() {
        let scaler = ScalerState::fit(&corpus(), ScalerKind::MinMax).unwrap();
        let longer = fv([27500.0, 800.0, 1400.0, 650.0, 640.0, 3600.0, 7200.0]);
        let scaled = scaler.transform(&longer);
        // range 3500..15500, so 27500 sits two ranges above the minimum
        assert!((scaled[0] - 2.0).abs() < 1e-12);

        let shorter = fv([0.0, 800.0, 1400.0, 650.0, 640.0, 3600.0, 7200.0]);
        assert!(scaler.transform(&shorter)[0] < 0.0);
    }

    #[test]
    fn test_round_trip_both_kinds() {
        let data = corpus();
        for kind in [ScalerKind::MinMax, ScalerKind::Standard] {
            let scaler = ScalerState::fit(&data, kind).unwrap();
            for row in &data {
                let back = scaler.inverse(&scaler.transform(row));
                for (a, b) in back.to_array().iter().zip(row.to_array()) {
                    assert!((a - b).abs() <= 1e-9 * b.abs().max(1.0), "{:?}: {} vs {}", kind, a, b);
                }
            }
        }
    }

    #[test]
    fn test_standard_zero_mean_unit_std() {
        let data = corpus();
        let scaler = ScalerState::fit(&data, ScalerKind::Standard).unwrap();
        let scaled = scaler.transform_all(&data);
        for d in 0..FEATURE_COUNT {
            let mean: f64 = scaled.iter().map(|r| r[d]).sum::<f64>() / scaled.len() as f64;
            let var: f64 =
                scaled.iter().map(|r| (r[d] - mean).powi(2)).sum::<f64>() / scaled.len() as f64;
            assert!(mean.abs() < 1e-10);
            assert!((var - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn test_constant_feature_maps_to_zero() {
        let data = vec![
            fv([1000.0, 500.0, 900.0, 400.0, 400.0, 0.0, 3600.0]),
            fv([2000.0, 500.0, 950.0, 450.0, 450.0, 0.0, 4000.0]),
        ];
        let scaler = ScalerState::fit(&data, ScalerKind::MinMax).unwrap();
        let scaled = scaler.transform(&data[1]);
        assert_eq!(scaled[1], 0.0);
        assert_eq!(scaled[5], 0.0);
        assert!(scaled.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_json_round_trip_transforms_identically() {
        let data = corpus();
        let scaler = ScalerState::fit(&data, ScalerKind::Standard).unwrap();
        let json = serde_json::to_string(&scaler).unwrap();
        let loaded: ScalerState = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, scaler);
        for row in &data {
            assert_eq!(loaded.transform(row), scaler.transform(row));
        }
    }
}
