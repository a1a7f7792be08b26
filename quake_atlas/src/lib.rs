//! Core seismic catalog pipeline: normalization, filtering, downsampling,
//! geodesic density clustering and temporal aggregation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub mod aggregate;
pub mod cluster;
pub mod downsample;
pub mod filter;
pub mod geometry;
pub mod normalize;
pub mod store;
pub mod timestamp;

pub use aggregate::{cumulative_energy, energy, yearly_counts, EnergyPoint, EnergySeries, YearlyCounts};
pub use cluster::{cluster, ClusterLabel, ClusterParams, Clustering, NeighborSearch};
pub use downsample::downsample;
pub use filter::{filter, refilter, FilterCriteria};
pub use geometry::{Polyline, ReferenceGeometry};
pub use normalize::{
    inspect_time_column, inspect_time_column_path, normalize_path, normalize_reader, DropCounts,
    DropSeverity, NormalizeReport, TimeColumnReport,
};
pub use store::DatasetStore;
pub use timestamp::{parse_timestamp, TimestampEncoding, TimestampSurvey};

#[derive(Error, Debug)]
pub enum QuakeError {
    #[error("catalog unavailable at {path}: {reason}")]
    DataUnavailable { path: String, reason: String },
    #[error("no valid records ({original_count} rows read, {dropped_count} dropped)")]
    EmptyResult {
        original_count: usize,
        dropped_count: usize,
    },
    #[error("reference geometry unavailable: {0}")]
    GeometryUnavailable(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// One normalized catalog row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub depth: f64,
    pub magnitude: f64,
    pub place: Option<String>,
    /// Zero-based data row in the source table.
    pub row: usize,
    /// Values of the columns listed in [`Catalog::extra_columns`].
    #[serde(default)]
    pub extras: Vec<String>,
}

/// Normalized, time-ordered, immutable event catalog.
#[derive(Clone, Debug)]
pub struct Catalog {
    records: Vec<EventRecord>,
    extra_columns: Vec<String>,
    report: NormalizeReport,
}

impl Catalog {
    pub(crate) fn from_parts(
        mut records: Vec<EventRecord>,
        extra_columns: Vec<String>,
        report: NormalizeReport,
    ) -> Self {
        // Stable: equal timestamps keep source order.
        records.sort_by(|a, b| a.time.cmp(&b.time));
        Self {
            records,
            extra_columns,
            report,
        }
    }

    /// Build a catalog from in-memory records.
    ///
    /// Records with non-finite or out-of-range fields are dropped and counted
    /// in [`Catalog::report`], exactly as rows of a CSV source would be.
    pub fn from_records(records: Vec<EventRecord>) -> Self {
        let (records, report) = normalize::screen_records(records);
        Self::from_parts(records, Vec::new(), report)
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    pub fn report(&self) -> &NormalizeReport {
        &self.report
    }

    /// Earliest and latest event time.
    pub fn time_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.records.first()?.time, self.records.last()?.time))
    }

    /// Smallest and largest magnitude.
    pub fn magnitude_span(&self) -> Option<(f64, f64)> {
        let mut iter = self.records.iter().map(|r| r.magnitude);
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), m| (lo.min(m), hi.max(m))))
    }

    /// Records with `start <= time < end`, located by binary search.
    pub(crate) fn time_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[EventRecord] {
        if start >= end {
            return &[];
        }
        let lo = self.records.partition_point(|r| r.time < start);
        let hi = self.records.partition_point(|r| r.time < end);
        &self.records[lo..hi.max(lo)]
    }
}

/// Point coloring requested by the rendering layer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    ByMagnitude,
    ByCluster,
}

impl Default for ColorMode {
    fn default() -> Self {
        ColorMode::ByMagnitude
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorMode::ByMagnitude => f.write_str("magnitude"),
            ColorMode::ByCluster => f.write_str("cluster"),
        }
    }
}

pub const DEFAULT_DISPLAY_CAP: usize = 50_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Maximum number of records handed to spatial output.
    pub display_cap: usize,
    /// Seed for the display downsampler; `None` draws from OS entropy.
    pub sample_seed: Option<u64>,
    pub cluster: ClusterParams,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            display_cap: DEFAULT_DISPLAY_CAP,
            sample_seed: None,
            cluster: ClusterParams::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Complete,
    NoMatches,
}

/// Per-request derived view of a catalog.
#[derive(Clone, Debug)]
pub struct Analysis<'a> {
    pub criteria: FilterCriteria,
    pub filtered: Vec<&'a EventRecord>,
    pub display: Vec<&'a EventRecord>,
    pub yearly: YearlyCounts,
    pub energy: EnergySeries,
    pub status: AnalysisStatus,
}

impl<'a> Analysis<'a> {
    pub fn is_downsampled(&self) -> bool {
        self.display.len() < self.filtered.len()
    }

    /// Turn an empty filter window into an explicit [`QuakeError::EmptyResult`].
    pub fn require_matches(&self) -> Result<&Self, QuakeError> {
        match self.status {
            AnalysisStatus::Complete => Ok(self),
            AnalysisStatus::NoMatches => Err(QuakeError::EmptyResult {
                original_count: 0,
                dropped_count: 0,
            }),
        }
    }

    /// `(lat, lon)` pairs of the display set in degrees.
    pub fn display_points(&self) -> Vec<[f64; 2]> {
        self.display
            .iter()
            .map(|r| [r.latitude, r.longitude])
            .collect()
    }

    /// Cluster the display set. Labels line up with `self.display`.
    pub fn cluster_display(&self, params: &ClusterParams) -> Result<Clustering, QuakeError> {
        cluster(&self.display_points(), params)
    }
}

/// Filter, downsample and aggregate `catalog` for one request.
pub fn analyze<'a>(
    catalog: &'a Catalog,
    criteria: &FilterCriteria,
    params: &Params,
) -> Result<Analysis<'a>, QuakeError> {
    if params.display_cap == 0 {
        return Err(QuakeError::InvalidParameter(
            "display_cap must be > 0".into(),
        ));
    }

    let filtered = filter(catalog, criteria);
    info!(
        "Filter matched {} of {} events",
        filtered.len(),
        catalog.len()
    );

    let display_set = downsample(&filtered, params.display_cap, params.sample_seed);
    let (shown, matched) = (display_set.len(), filtered.len());
    if shown < matched {
        info!("Display set capped: sampled {} of {} events", shown, matched);
    }

    let yearly = yearly_counts(&filtered);
    let energy = cumulative_energy(&filtered);
    debug!(
        "Aggregated {} years, {} energy points",
        yearly.len(),
        energy.len()
    );

    let status = if filtered.is_empty() {
        AnalysisStatus::NoMatches
    } else {
        AnalysisStatus::Complete
    };

    Ok(Analysis {
        criteria: criteria.clone(),
        filtered,
        display: display_set,
        yearly,
        energy,
        status,
    })
}
