//! Mixed-encoding timestamp parsing.
//!
//! Catalog exports accumulate decades of tooling, so a single `time` column can
//! hold RFC 3339 values next to offset-less ISO strings, minute precision, bare
//! dates and slash-separated dates. Every value is tried against the whole set
//! of encodings; anything that still fails becomes `None`.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Encoding a raw timestamp was recognised as.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimestampEncoding {
    Rfc3339,
    ExplicitOffset,
    NaiveUtc,
    DateOnly,
    Unparseable,
}

impl TimestampEncoding {
    pub fn label(&self) -> &'static str {
        match self {
            TimestampEncoding::Rfc3339 => "rfc3339",
            TimestampEncoding::ExplicitOffset => "explicit_offset",
            TimestampEncoding::NaiveUtc => "naive_utc",
            TimestampEncoding::DateOnly => "date_only",
            TimestampEncoding::Unparseable => "unparseable",
        }
    }
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%d %H:%M%:z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S%.f",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Parse a raw catalog timestamp into UTC, trying every supported encoding.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    classify(raw).1
}

/// Parse and report which encoding matched.
pub fn classify(raw: &str) -> (TimestampEncoding, Option<DateTime<Utc>>) {
    let value = raw.trim();
    if value.is_empty() {
        return (TimestampEncoding::Unparseable, None);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return (TimestampEncoding::Rfc3339, Some(dt.with_timezone(&Utc)));
    }

    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return (TimestampEncoding::ExplicitOffset, Some(dt.with_timezone(&Utc)));
        }
    }

    // A trailing zulu marker on an otherwise naive value is plain UTC.
    let naive = strip_utc_suffix(value);
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return (TimestampEncoding::NaiveUtc, Some(dt.and_utc()));
        }
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(naive, fmt) {
            if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                return (TimestampEncoding::DateOnly, Some(dt.and_utc()));
            }
        }
    }

    (TimestampEncoding::Unparseable, None)
}

fn strip_utc_suffix(value: &str) -> &str {
    let trimmed = value
        .strip_suffix(" UTC")
        .or_else(|| value.strip_suffix("UTC"))
        .or_else(|| value.strip_suffix('Z'))
        .or_else(|| value.strip_suffix('z'))
        .unwrap_or(value);
    trimmed.trim_end()
}

/// Encoding breakdown of a timestamp column.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TimestampSurvey {
    pub total: usize,
    pub parsed: usize,
    pub unparseable: usize,
    pub by_encoding: BTreeMap<TimestampEncoding, usize>,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

impl TimestampSurvey {
    pub fn record(&mut self, raw: &str) {
        let (encoding, parsed) = classify(raw);
        self.total += 1;
        *self.by_encoding.entry(encoding).or_insert(0) += 1;
        match parsed {
            Some(ts) => {
                self.parsed += 1;
                self.earliest = Some(self.earliest.map_or(ts, |e| e.min(ts)));
                self.latest = Some(self.latest.map_or(ts, |l| l.max(ts)));
            }
            None => self.unparseable += 1,
        }
    }
}

/// Survey a sequence of raw timestamp strings.
pub fn survey<'a, I>(values: I) -> TimestampSurvey
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = TimestampSurvey::default();
    for value in values {
        out.record(value);
    }
    out
}
