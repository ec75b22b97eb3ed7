pub mod corpus;

use chrono::{DateTime, Utc};
use std::io::Read;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("GPX parse error: {0}")]
    Gpx(String),
}

/// One sampled position of a recorded track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above sea level, when the device recorded it.
    pub elevation: Option<f64>,
    pub time: Option<DateTime<Utc>>,
}

impl TrackPoint {
    pub fn new(
        latitude: f64,
        longitude: f64,
        elevation: Option<f64>,
        time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            latitude,
            longitude,
            elevation,
            time,
        }
    }
}

/// Read a GPX document and flatten every track segment into one ordered point list.
///
/// Routes and standalone waypoints are ignored; only recorded tracks carry timing.
pub fn read_gpx<R: Read>(reader: R) -> Result<Vec<TrackPoint>, TrackError> {
    let gpx = gpx::read(reader).map_err(|e| TrackError::Gpx(e.to_string()))?;

    let mut points = Vec::new();
    for track in gpx.tracks {
        for segment in track.segments {
            for pt in segment.points {
                let coord = pt.point();
                // gpx exposes time through its own wrapper; RFC 3339 is the common ground
                let time = pt
                    .time
                    .and_then(|t| t.format().ok())
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                points.push(TrackPoint::new(coord.y(), coord.x(), pt.elevation, time));
            }
        }
    }

    log::debug!("Read {} track points from GPX", points.len());
    Ok(points)
}
