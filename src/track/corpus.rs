//! Historical track catalog: CSV reading and the cleaning filter applied before training.
//!
//! The catalog is the hikr.org export layout: one row per recorded hike with
//! precomputed aggregates (`length_3d`, `moving_time`, `uphill`, ...). Columns are
//! matched by header name, so extra columns in the file are ignored.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("Cannot read corpus {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// A catalog row exactly as it appears in the file. Every field is optional so an
/// empty cell or missing column drops the row during cleaning. A cell that does not
/// decode (text in a numeric column) makes the whole line count as malformed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRow {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub moving_time: Option<f64>,
    #[serde(default)]
    pub length_3d: Option<f64>,
    #[serde(default)]
    pub min_elevation: Option<f64>,
    #[serde(default)]
    pub max_elevation: Option<f64>,
    #[serde(default)]
    pub uphill: Option<f64>,
    #[serde(default)]
    pub downhill: Option<f64>,
    #[serde(default)]
    pub difficulty: Option<String>,
}

/// Rows read from a catalog file, plus how many lines could not be decoded at all.
pub struct CorpusFile {
    pub rows: Vec<RawRow>,
    pub malformed: usize,
}

/// A validated training row.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRecord {
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds spent moving.
    pub moving_time: f64,
    pub length_3d: f64,
    pub min_elevation: f64,
    pub max_elevation: f64,
    pub uphill: f64,
    pub downhill: f64,
    /// Ground-truth grade from the catalog (e.g. "T3"), informational only.
    pub difficulty: Option<String>,
}

impl TrackRecord {
    pub fn duration(&self) -> f64 {
        self.moving_time
    }

    /// Wall-clock time not spent moving.
    pub fn break_time(&self) -> f64 {
        self.elapsed() - self.moving_time
    }

    pub fn elapsed(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    /// Mean moving speed in m/s.
    pub fn speed(&self) -> f64 {
        self.length_3d / self.duration()
    }
}

/// Outlier thresholds for catalog rows. The defaults are the values the
/// published models were trained with and must stay as they are.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleaningThresholds {
    /// Rows at or above this mean moving speed (m/s) are dropped.
    pub max_speed: f64,
    /// Rows whose break time reaches this multiple of the moving time are dropped.
    pub max_break_ratio: f64,
}

impl Default for CleaningThresholds {
    fn default() -> Self {
        Self {
            max_speed: 5.0,
            max_break_ratio: 1.5,
        }
    }
}

/// Why rows were rejected during cleaning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleaningReport {
    pub total: usize,
    pub kept: usize,
    pub missing_fields: usize,
    pub zero_elapsed: usize,
    pub zero_length: usize,
    pub zero_duration: usize,
    pub negative_break: usize,
    pub long_break: usize,
    pub too_fast: usize,
}

impl CleaningReport {
    pub fn dropped(&self) -> usize {
        self.total - self.kept
    }
}

/// Read every row of a catalog CSV. Undecodable lines are counted, not fatal.
pub fn read_corpus(path: &Path) -> Result<CorpusFile, CorpusError> {
    let file = std::fs::File::open(path).map_err(|source| CorpusError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(std::io::BufReader::new(file));

    let mut rows = Vec::new();
    let mut malformed = 0;
    for result in reader.deserialize::<RawRow>() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                log::debug!("Skipping malformed corpus line: {}", e);
                malformed += 1;
            }
        }
    }

    log::info!(
        "Read {} corpus rows from {} ({} malformed)",
        rows.len(),
        path.display(),
        malformed
    );
    Ok(CorpusFile { rows, malformed })
}

/// Drop incomplete rows and sensor/log artifacts, keeping the survivors in file order.
pub fn clean(
    rows: &[RawRow],
    thresholds: &CleaningThresholds,
) -> (Vec<TrackRecord>, CleaningReport) {
    let mut report = CleaningReport {
        total: rows.len(),
        ..CleaningReport::default()
    };
    let mut kept = Vec::with_capacity(rows.len());

    for row in rows {
        let Some(record) = complete(row) else {
            report.missing_fields += 1;
            continue;
        };

        if record.start_time == record.end_time {
            report.zero_elapsed += 1;
        } else if record.length_3d <= 0.0 {
            report.zero_length += 1;
        } else if record.moving_time <= 0.0 {
            report.zero_duration += 1;
        } else if record.break_time() < 0.0 {
            report.negative_break += 1;
        } else if record.break_time() >= thresholds.max_break_ratio * record.duration() {
            report.long_break += 1;
        } else if record.speed() >= thresholds.max_speed {
            report.too_fast += 1;
        } else {
            kept.push(record);
        }
    }

    report.kept = kept.len();
    (kept, report)
}

fn complete(row: &RawRow) -> Option<TrackRecord> {
    let record = TrackRecord {
        name: row.name.clone().filter(|n| !n.is_empty()),
        start_time: parse_timestamp(row.start_time.as_deref()?)?,
        end_time: parse_timestamp(row.end_time.as_deref()?)?,
        moving_time: row.moving_time?,
        length_3d: row.length_3d?,
        min_elevation: row.min_elevation?,
        max_elevation: row.max_elevation?,
        uphill: row.uphill?,
        downhill: row.downhill?,
        difficulty: row.difficulty.clone().filter(|d| !d.is_empty()),
    };

    let numbers = [
        record.moving_time,
        record.length_3d,
        record.min_elevation,
        record.max_elevation,
        record.uphill,
        record.downhill,
    ];
    numbers.iter().all(|v| v.is_finite()).then_some(record)
}

/// Catalog timestamps come in a few shapes; naive ones are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}
