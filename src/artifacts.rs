//! Persistence of the fitted model bundle.
//!
//! A bundle is five JSON files in one directory. Saving writes a staging sibling
//! directory first and swaps it in with renames, so readers only ever see a
//! complete set. Loading checks every file exists before reading any of them and
//! validates each artifact against the current feature order.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::features::{
    BREAK_TIME_INDEX, DURATION_INDEX, FEATURE_COUNT, FEATURE_NAMES, matches_feature_order,
};
use crate::model::forest::DurationModel;
use crate::model::kmeans::ClusterModel;
use crate::model::neighbors::{FeatureTable, NeighborIndex};
use crate::model::scaler::ScalerState;

pub const SCALER_FILE: &str = "scaler.json";
pub const DIFFICULTY_FILE: &str = "difficulty_model.json";
pub const DURATION_FILE: &str = "duration_model.json";
pub const NEIGHBOR_FILE: &str = "neighbor_index.json";
pub const TABLE_FILE: &str = "feature_table.json";

pub const ARTIFACT_FILES: [&str; 5] = [
    SCALER_FILE,
    DIFFICULTY_FILE,
    DURATION_FILE,
    NEIGHBOR_FILE,
    TABLE_FILE,
];

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact not found: {0} (run `trailgrade train` first)")]
    NotFound(PathBuf),
    #[error("{artifact} was fit on features {found:?}, current order is {expected:?}")]
    FeatureOrderMismatch {
        artifact: &'static str,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("Inconsistent artifacts: {0}")]
    Inconsistent(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot decode {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

type Result<T> = std::result::Result<T, ArtifactError>;

/// Everything the predictor needs, fitted together on one corpus.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    pub scaler: ScalerState,
    pub difficulty: ClusterModel,
    pub duration: DurationModel,
    pub index: NeighborIndex,
    pub table: FeatureTable,
}

impl ModelBundle {
    /// Write all five artifacts into `dir`, replacing any previous set as a unit.
    pub fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;

        let parent = match dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifacts".to_string());
        fs::create_dir_all(&parent).map_err(|source| io_err(&parent, source))?;

        let staging = parent.join(format!(".{}.staging", name));
        let previous = parent.join(format!(".{}.previous", name));
        remove_dir_if_exists(&staging)?;
        fs::create_dir_all(&staging).map_err(|source| io_err(&staging, source))?;

        let written = (|| {
            write_json(&staging.join(SCALER_FILE), &self.scaler)?;
            write_json(&staging.join(DIFFICULTY_FILE), &self.difficulty)?;
            write_json(&staging.join(DURATION_FILE), &self.duration)?;
            write_json(&staging.join(NEIGHBOR_FILE), &self.index)?;
            write_json(&staging.join(TABLE_FILE), &self.table)
        })();
        if let Err(e) = written {
            fs::remove_dir_all(&staging).ok();
            return Err(e);
        }

        remove_dir_if_exists(&previous)?;
        if dir.exists() {
            fs::rename(dir, &previous).map_err(|source| io_err(dir, source))?;
        }
        if let Err(source) = fs::rename(&staging, dir) {
            // put the old set back so the directory is never left half-empty
            if previous.exists() {
                fs::rename(&previous, dir).ok();
            }
            return Err(io_err(dir, source));
        }
        fs::remove_dir_all(&previous).ok();

        log::info!("Saved {} artifacts to {}", ARTIFACT_FILES.len(), dir.display());
        Ok(())
    }

    /// Load and validate a complete artifact set. Fails before reading anything
    /// if any file is missing.
    pub fn load(dir: &Path) -> Result<Self> {
        for file in ARTIFACT_FILES {
            let path = dir.join(file);
            if !path.is_file() {
                return Err(ArtifactError::NotFound(path));
            }
        }

        let bundle = Self {
            scaler: read_json(&dir.join(SCALER_FILE))?,
            difficulty: read_json(&dir.join(DIFFICULTY_FILE))?,
            duration: read_json(&dir.join(DURATION_FILE))?,
            index: read_json(&dir.join(NEIGHBOR_FILE))?,
            table: read_json(&dir.join(TABLE_FILE))?,
        };
        bundle.validate()?;

        log::info!(
            "Loaded artifacts from {} ({} corpus rows, {} clusters, {} trees)",
            dir.display(),
            bundle.table.len(),
            bundle.difficulty.k(),
            bundle.duration.tree_count()
        );
        Ok(bundle)
    }

    /// Check that every artifact was fit on the current feature order and that
    /// the artifacts agree with each other.
    pub fn validate(&self) -> Result<()> {
        check_order("scaler", &self.scaler.feature_names)?;
        check_order("difficulty model", &self.difficulty.feature_names)?;
        check_order("duration model", &self.duration.feature_names)?;
        check_order("neighbor index", &self.index.feature_names)?;
        check_order("feature table", &self.table.feature_names)?;

        let d = &self.difficulty;
        if d.columns.is_empty() || d.columns.iter().any(|&c| c >= FEATURE_COUNT) {
            return Err(ArtifactError::Inconsistent(format!(
                "difficulty model columns {:?} out of range",
                d.columns
            )));
        }
        let k = d.centroids.len();
        if k == 0
            || d.labels.len() != k
            || d.severity.len() != k
            || d.mean_durations.len() != k
            || d.sizes.len() != k
            || d.centroids.iter().any(|c| c.len() != d.columns.len())
        {
            return Err(ArtifactError::Inconsistent(
                "difficulty model centroids, labels and columns disagree".into(),
            ));
        }
        let mut ranks = d.severity.clone();
        ranks.sort_unstable();
        if ranks.iter().enumerate().any(|(i, &r)| i != r) {
            return Err(ArtifactError::Inconsistent(format!(
                "difficulty severities {:?} are not a ranking",
                d.severity
            )));
        }

        let cols = &self.duration.columns;
        if cols.iter().any(|&c| c >= FEATURE_COUNT) {
            return Err(ArtifactError::Inconsistent(format!(
                "duration model columns {:?} out of range",
                cols
            )));
        }
        if cols.contains(&DURATION_INDEX) || cols.contains(&BREAK_TIME_INDEX) {
            return Err(ArtifactError::Inconsistent(
                "duration model reads time-derived features".into(),
            ));
        }
        if self.duration.tree_count() == 0 {
            return Err(ArtifactError::Inconsistent(
                "duration model has no trees".into(),
            ));
        }
        if !self.duration.is_well_formed() {
            return Err(ArtifactError::Inconsistent(
                "duration model has a broken tree".into(),
            ));
        }

        if self.index.is_empty() || self.index.len() != self.table.len() {
            return Err(ArtifactError::Inconsistent(format!(
                "neighbor index has {} rows, feature table has {}",
                self.index.len(),
                self.table.len()
            )));
        }
        Ok(())
    }
}

fn check_order(artifact: &'static str, found: &[String]) -> Result<()> {
    if matches_feature_order(found) {
        Ok(())
    } else {
        Err(ArtifactError::FeatureOrderMismatch {
            artifact,
            expected: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            found: found.to_vec(),
        })
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).map_err(|source| io_err(path, source))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(|source| io_err(path, source))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|source| io_err(path, source))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|source| io_err(path, source))?;
    }
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> ArtifactError {
    ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}
