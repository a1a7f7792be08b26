//! Catalog normalization: CSV ingestion, column aliasing, timestamp
//! reconciliation and row validation.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Instant;

use csv::{ReaderBuilder, StringRecord, Trim};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::timestamp::{parse_timestamp, TimestampSurvey};
use crate::{Catalog, EventRecord, QuakeError};

const BATCH_ROWS: usize = 65_536;

/// Rows excluded during normalization, one reason per row.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropCounts {
    pub malformed_row: usize,
    pub missing_time: usize,
    pub missing_latitude: usize,
    pub missing_longitude: usize,
    pub missing_magnitude: usize,
    pub missing_depth: usize,
    pub out_of_range: usize,
}

impl DropCounts {
    pub fn total(&self) -> usize {
        self.malformed_row
            + self.missing_time
            + self.missing_latitude
            + self.missing_longitude
            + self.missing_magnitude
            + self.missing_depth
            + self.out_of_range
    }

    fn bump(&mut self, reason: DropReason) {
        let slot = match reason {
            DropReason::MissingTime => &mut self.missing_time,
            DropReason::MissingLatitude => &mut self.missing_latitude,
            DropReason::MissingLongitude => &mut self.missing_longitude,
            DropReason::MissingMagnitude => &mut self.missing_magnitude,
            DropReason::MissingDepth => &mut self.missing_depth,
            DropReason::OutOfRange => &mut self.out_of_range,
        };
        *slot += 1;
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropSeverity {
    /// Every row survived.
    Clean,
    /// At least one row was dropped.
    Lossy,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NormalizeReport {
    pub source: String,
    pub original_count: usize,
    pub cleaned_count: usize,
    pub dropped: DropCounts,
    /// Required canonical columns absent from the header.
    pub missing_columns: Vec<String>,
}

impl NormalizeReport {

    pub fn dropped_count(&self) -> usize {
        self.original_count - self.cleaned_count
    }

    pub fn severity(&self) -> DropSeverity {
        if self.dropped_count() == 0 {
            DropSeverity::Clean
        } else {
            DropSeverity::Lossy
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DropReason {
    MissingTime,
    MissingLatitude,
    MissingLongitude,
    MissingMagnitude,
    MissingDepth,
    OutOfRange,
}

/// Header positions of the canonical columns.
#[derive(Clone, Debug, Default)]
struct ColumnMap {
    time: Option<usize>,
    latitude: Option<usize>,
    longitude: Option<usize>,
    magnitude: Option<usize>,
    depth: Option<usize>,
    place: Option<usize>,
    extras: Vec<usize>,
    extra_names: Vec<String>,
}

impl ColumnMap {
    fn from_headers(headers: &StringRecord) -> Self {
        let mut map = ColumnMap::default();
        for (idx, raw) in headers.iter().enumerate() {
            let name = raw.trim().trim_start_matches('\u{feff}').to_ascii_lowercase();
            let slot = match name.as_str() {
                "time" => &mut map.time,
                "latitude" | "lat" => &mut map.latitude,
                "longitude" | "lon" => &mut map.longitude,
                "mag" | "magnitude" => &mut map.magnitude,
                "depth" => &mut map.depth,
                "place" => &mut map.place,
                _ => {
                    map.extras.push(idx);
                    map.extra_names.push(raw.to_string());
                    continue;
                }
            };
            if slot.is_none() {
                *slot = Some(idx);
            } else {
                // A second synonym of an already-mapped column is kept as-is.
                map.extras.push(idx);
                map.extra_names.push(raw.to_string());
            }
        }
        map
    }

    fn missing(&self) -> Vec<String> {
        [
            ("time", self.time),
            ("latitude", self.latitude),
            ("longitude", self.longitude),
            ("magnitude", self.magnitude),
            ("depth", self.depth),
        ]
        .iter()
        .filter(|(_, idx)| idx.is_none())
        .map(|(name, _)| name.to_string())
        .collect()
    }
}

/// Coerce a raw cell to a finite number.
pub fn parse_number(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    value.is_finite().then_some(value)
}

fn cell(record: &StringRecord, idx: Option<usize>) -> Option<&str> {
    record.get(idx?)
}

fn parse_row(map: &ColumnMap, row: usize, record: &StringRecord) -> Result<EventRecord, DropReason> {
    let time = cell(record, map.time)
        .and_then(parse_timestamp)
        .ok_or(DropReason::MissingTime)?;
    let latitude = cell(record, map.latitude)
        .and_then(parse_number)
        .ok_or(DropReason::MissingLatitude)?;
    let longitude = cell(record, map.longitude)
        .and_then(parse_number)
        .ok_or(DropReason::MissingLongitude)?;
    let magnitude = cell(record, map.magnitude)
        .and_then(parse_number)
        .ok_or(DropReason::MissingMagnitude)?;
    let depth = cell(record, map.depth)
        .and_then(parse_number)
        .ok_or(DropReason::MissingDepth)?;
    let place = cell(record, map.place)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let extras = map
        .extras
        .iter()
        .map(|&i| record.get(i).unwrap_or_default().to_string())
        .collect();
    let record = EventRecord {
        time,
        latitude,
        longitude,
        depth,
        magnitude,
        place,
        row,
        extras,
    };
    match violation(&record) {
        Some(reason) => Err(reason),
        None => Ok(record),
    }
}

/// First record invariant broken by `record`, in row check order.
fn violation(record: &EventRecord) -> Option<DropReason> {
    if !record.latitude.is_finite() {
        return Some(DropReason::MissingLatitude);
    }
    if !record.longitude.is_finite() {
        return Some(DropReason::MissingLongitude);
    }
    if !record.magnitude.is_finite() {
        return Some(DropReason::MissingMagnitude);
    }
    if !record.depth.is_finite() {
        return Some(DropReason::MissingDepth);
    }
    if !(-90.0..=90.0).contains(&record.latitude) || !(-180.0..=180.0).contains(&record.longitude) {
        return Some(DropReason::OutOfRange);
    }
    None
}

/// Apply the row checks to records built in memory.
pub(crate) fn screen_records(records: Vec<EventRecord>) -> (Vec<EventRecord>, NormalizeReport) {
    let original_count = records.len();
    let mut dropped = DropCounts::default();
    let kept: Vec<EventRecord> = records
        .into_iter()
        .filter(|r| match violation(r) {
            Some(reason) => {
                dropped.bump(reason);
                false
            }
            None => true,
        })
        .collect();
    let report = NormalizeReport {
        source: "<memory>".to_string(),
        original_count,
        cleaned_count: kept.len(),
        dropped,
        missing_columns: Vec::new(),
    };
    (kept, report)
}

fn parse_batch(map: &ColumnMap, batch: &[(usize, StringRecord)]) -> Vec<Result<EventRecord, DropReason>> {
    #[cfg(feature = "parallel")]
    let rows = batch.par_iter();
    #[cfg(not(feature = "parallel"))]
    let rows = batch.iter();
    rows.map(|(row, record)| parse_row(map, *row, record)).collect()
}

/// Normalize the CSV catalog at `path`.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<Catalog, QuakeError> {
    let path = path.as_ref();
    let label = path.display().to_string();
    let file = File::open(path).map_err(|e| QuakeError::DataUnavailable {
        path: label.clone(),
        reason: e.to_string(),
    })?;
    normalize_reader(BufReader::new(file), &label)
}

/// Normalize a CSV catalog from any reader. `source` labels logs and errors.
pub fn normalize_reader<R: Read>(reader: R, source: &str) -> Result<Catalog, QuakeError> {
    let started = Instant::now();
    let unavailable = |e: csv::Error| QuakeError::DataUnavailable {
        path: source.to_string(),
        reason: e.to_string(),
    };

    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::Headers)
        .from_reader(reader);
    let headers = rdr.headers().map_err(unavailable)?.clone();
    let map = ColumnMap::from_headers(&headers);
    let missing_columns = map.missing();
    for name in &missing_columns {
        warn!("{}: required column '{}' not found; every row will be dropped", source, name);
    }

    let mut dropped = DropCounts::default();
    let mut records = Vec::new();
    let mut original_count = 0usize;
    let mut batch: Vec<(usize, StringRecord)> = Vec::with_capacity(BATCH_ROWS);

    let flush = |batch: &mut Vec<(usize, StringRecord)>,
                     records: &mut Vec<EventRecord>,
                     dropped: &mut DropCounts| {
        for parsed in parse_batch(&map, batch) {
            match parsed {
                Ok(record) => records.push(record),
                Err(reason) => dropped.bump(reason),
            }
        }
        batch.clear();
    };

    for result in rdr.records() {
        let row = original_count;
        original_count += 1;
        match result {
            Ok(record) => batch.push((row, record)),
            Err(e) if e.is_io_error() => return Err(unavailable(e)),
            Err(e) => {
                debug!("{}: row {} unreadable: {}", source, row, e);
                dropped.malformed_row += 1;
            }
        }
        if batch.len() >= BATCH_ROWS {
            flush(&mut batch, &mut records, &mut dropped);
        }
    }
    flush(&mut batch, &mut records, &mut dropped);

    let report = NormalizeReport {
        source: source.to_string(),
        original_count,
        cleaned_count: records.len(),
        dropped,
        missing_columns,
    };

    info!(
        "Normalized {}: {} valid events from {} rows in {:.1} ms",
        source,
        report.cleaned_count,
        report.original_count,
        started.elapsed().as_secs_f64() * 1000.0
    );
    match report.severity() {
        DropSeverity::Clean => info!("{}: no rows dropped", source),
        DropSeverity::Lossy => warn!(
            "{}: dropped {} rows (malformed {}, time {}, latitude {}, longitude {}, magnitude {}, depth {}, out of range {})",
            source,
            report.dropped_count(),
            report.dropped.malformed_row,
            report.dropped.missing_time,
            report.dropped.missing_latitude,
            report.dropped.missing_longitude,
            report.dropped.missing_magnitude,
            report.dropped.missing_depth,
            report.dropped.out_of_range
        ),
    }

    if records.is_empty() {
        return Err(QuakeError::EmptyResult {
            original_count: report.original_count,
            dropped_count: report.dropped_count(),
        });
    }

    let extra_columns = map.extra_names.clone();
    Ok(Catalog::from_parts(records, extra_columns, report))
}

const INSPECT_EDGE: usize = 5;

/// Raw view of the timestamp column, used to diagnose rows lost to
/// unparseable times before a full normalization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeColumnReport {
    pub source: String,
    pub rows: usize,
    /// First raw values in file order.
    pub head: Vec<String>,
    /// Last raw values in file order.
    pub tail: Vec<String>,
    pub survey: TimestampSurvey,
}

/// Read only the `time` column of a CSV catalog and classify every value.
pub fn inspect_time_column<R: Read>(reader: R, source: &str) -> Result<TimeColumnReport, QuakeError> {
    let unavailable = |reason: String| QuakeError::DataUnavailable {
        path: source.to_string(),
        reason,
    };
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::Headers)
        .from_reader(reader);
    let headers = rdr.headers().map_err(|e| unavailable(e.to_string()))?.clone();
    let time_idx = ColumnMap::from_headers(&headers)
        .time
        .ok_or_else(|| unavailable("no 'time' column".to_string()))?;

    let mut head = Vec::with_capacity(INSPECT_EDGE);
    let mut tail = VecDeque::with_capacity(INSPECT_EDGE);
    let mut survey = TimestampSurvey::default();
    let mut rows = 0usize;
    for result in rdr.records() {
        let record = match result {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(unavailable(e.to_string())),
            Err(_) => StringRecord::new(),
        };
        rows += 1;
        let raw = record.get(time_idx).unwrap_or_default();
        survey.record(raw);
        if head.len() < INSPECT_EDGE {
            head.push(raw.to_string());
        }
        if tail.len() == INSPECT_EDGE {
            tail.pop_front();
        }
        tail.push_back(raw.to_string());
    }
    debug!("{}: surveyed {} timestamps", source, rows);

    Ok(TimeColumnReport {
        source: source.to_string(),
        rows,
        head,
        tail: tail.into_iter().collect(),
        survey,
    })
}

/// [`inspect_time_column`] over the file at `path`.
pub fn inspect_time_column_path<P: AsRef<Path>>(path: P) -> Result<TimeColumnReport, QuakeError> {
    let path = path.as_ref();
    let label = path.display().to_string();
    let file = File::open(path).map_err(|e| QuakeError::DataUnavailable {
        path: label.clone(),
        reason: e.to_string(),
    })?;
    inspect_time_column(BufReader::new(file), &label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Utc};

    const USGS_HEADER: &str = "time,latitude,longitude,depth,mag,magType,place,type";

    fn normalize_str(text: &str) -> Result<Catalog, QuakeError> {
        normalize_reader(text.as_bytes(), "inline")
    }

    #[test]
    fn renames_synonyms_and_keeps_unknown_columns() {
        let text = format!(
            "{}\n2020-01-01T00:00:00.000Z,35.5,139.7,10.0,6.1,mww,\"Honshu, Japan\",earthquake\n",
            USGS_HEADER
        );
        let catalog = normalize_str(&text).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.extra_columns(), ["magType", "type"]);
        let r = &catalog.records()[0];
        assert_eq!(r.latitude, 35.5);
        assert_eq!(r.longitude, 139.7);
        assert_eq!(r.magnitude, 6.1);
        assert_eq!(r.place.as_deref(), Some("Honshu, Japan"));
        assert_eq!(r.extras, vec!["mww".to_string(), "earthquake".to_string()]);
        assert_eq!(catalog.report().severity(), DropSeverity::Clean);
    }

    #[test]
    fn unknown_columns_keep_their_whitespace() {
        let text = "time , lat,lon,depth,mag,place,note\n 2020-01-01T00:00:00Z , 1.5 ,2,3,4.5,  Off Chile  ,  two spaces \n";
        let catalog = normalize_str(text).unwrap();
        let r = &catalog.records()[0];
        assert_eq!(r.latitude, 1.5);
        assert_eq!(r.place.as_deref(), Some("Off Chile"));
        assert_eq!(r.extras, vec!["  two spaces ".to_string()]);
        assert_eq!(catalog.extra_columns(), ["note"]);
    }

    #[test]
    fn accepts_short_column_names() {
        let text = "Time,Lat,Lon,Depth,Magnitude\n2001-02-03 04:05:06,1,2,3,4.5\n";
        let catalog = normalize_str(text).unwrap();
        let r = &catalog.records()[0];
        assert_eq!(r.time, Utc.with_ymd_and_hms(2001, 2, 3, 4, 5, 6).unwrap());
        assert_eq!((r.latitude, r.longitude, r.depth, r.magnitude), (1.0, 2.0, 3.0, 4.5));
        assert_eq!(r.place, None);
    }

    #[test]
    fn mixed_timestamp_encodings_survive() {
        let text = "\
time,latitude,longitude,depth,mag
2020-01-01T00:00:00.000Z,0,0,10,5
2020-01-02 00:00:00,0,0,10,5
2020-01-03T00:00:00+00:00,0,0,10,5
2020-01-04,0,0,10,5
2020-01-05T00:00:00.123456789Z,0,0,10,5
";
        let catalog = normalize_str(text).unwrap();
        assert_eq!(catalog.len(), 5);
        let days: Vec<u32> = catalog.records().iter().map(|r| r.time.day()).collect();
        assert_eq!(days, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn drops_are_counted_by_reason_and_conserved() {
        let text = "\
time,latitude,longitude,depth,mag
2020-01-01T00:00:00Z,10,20,5,4.0
garbage,10,20,5,4.0
2020-01-02T00:00:00Z,,20,5,4.0
2020-01-02T00:00:00Z,10,abc,5,4.0
2020-01-02T00:00:00Z,10,20,5,NaN
2020-01-02T00:00:00Z,10,20,,4.0
2020-01-02T00:00:00Z,95,20,5,4.0
2020-01-03T00:00:00Z,10,20
2020-01-04T00:00:00Z,-10,-20,700,8.2
";
        let catalog = normalize_str(text).unwrap();
        let report = catalog.report();
        assert_eq!(report.original_count, 9);
        assert_eq!(report.cleaned_count, 2);
        assert_eq!(report.dropped_count(), 7);
        assert_eq!(report.dropped.total(), report.dropped_count());
        assert_eq!(report.dropped.missing_time, 1);
        assert_eq!(report.dropped.missing_latitude, 1);
        assert_eq!(report.dropped.missing_longitude, 1);
        // NaN plus the short row with no magnitude cell.
        assert_eq!(report.dropped.missing_magnitude, 2);
        assert_eq!(report.dropped.missing_depth, 1);
        assert_eq!(report.dropped.out_of_range, 1);
        assert_eq!(report.severity(), DropSeverity::Lossy);
    }

    #[test]
    fn source_rows_are_recorded() {
        let text = "\
time,latitude,longitude,depth,mag
2020-01-03T00:00:00Z,0,0,1,5
bad,0,0,1,5
2020-01-01T00:00:00Z,0,0,1,5
";
        let catalog = normalize_str(text).unwrap();
        let rows: Vec<usize> = catalog.records().iter().map(|r| r.row).collect();
        assert_eq!(rows, vec![2, 0]);
    }

    #[test]
    fn zero_valid_rows_is_empty_result() {
        let text = "time,latitude,longitude,depth,mag\nnope,0,0,1,5\n,,,,\n";
        match normalize_str(text) {
            Err(QuakeError::EmptyResult {
                original_count,
                dropped_count,
            }) => {
                assert_eq!(original_count, 2);
                assert_eq!(dropped_count, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_required_column_drops_everything() {
        let text = "time,latitude,longitude,mag\n2020-01-01,0,0,5\n";
        assert!(matches!(
            normalize_str(text),
            Err(QuakeError::EmptyResult { .. })
        ));
    }

    #[test]
    fn header_only_is_empty_result() {
        assert!(matches!(
            normalize_str(USGS_HEADER),
            Err(QuakeError::EmptyResult {
                original_count: 0,
                ..
            })
        ));
    }

    #[test]
    fn missing_file_is_data_unavailable() {
        let err = normalize_path("/nonexistent/quake_atlas/catalog.csv").unwrap_err();
        assert!(matches!(err, QuakeError::DataUnavailable { .. }));
    }

    #[test]
    fn number_coercion() {
        assert_eq!(parse_number(" 4.5 "), Some(4.5));
        assert_eq!(parse_number("-12"), Some(-12.0));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("n/a"), None);
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("NaN"), None);
    }

    #[test]
    fn time_column_inspection_reports_edges_and_failures() {
        let mut text = String::from("id,time,mag\n");
        for day in 1..=9 {
            text.push_str(&format!("{},2020-01-0{}T00:00:00Z,5\n", day, day));
        }
        text.push_str("10,not a date,5\n");
        text.push_str("11,2020-02-01,5\n");
        let report = inspect_time_column(text.as_bytes(), "inline").unwrap();
        assert_eq!(report.rows, 11);
        assert_eq!(report.head.len(), 5);
        assert_eq!(report.head[0], "2020-01-01T00:00:00Z");
        assert_eq!(report.tail.len(), 5);
        assert_eq!(report.tail[3], "not a date");
        assert_eq!(report.tail[4], "2020-02-01");
        assert_eq!(report.survey.parsed, 10);
        assert_eq!(report.survey.unparseable, 1);
    }

    #[test]
    fn time_column_inspection_needs_time_header() {
        assert!(matches!(
            inspect_time_column("lat,lon\n1,2\n".as_bytes(), "inline"),
            Err(QuakeError::DataUnavailable { .. })
        ));
    }
}
