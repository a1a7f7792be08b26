use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Catalog, EventRecord};

/// Half-open time window `[time_start, time_end_exclusive)` and closed
/// magnitude range `[mag_min, mag_max]`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FilterCriteria {
    pub time_start: DateTime<Utc>,
    pub time_end_exclusive: DateTime<Utc>,
    pub mag_min: f64,
    pub mag_max: f64,
}

impl FilterCriteria {
    pub fn new(
        time_start: DateTime<Utc>,
        time_end_exclusive: DateTime<Utc>,
        mag_min: f64,
        mag_max: f64,
    ) -> Self {
        Self {
            time_start,
            time_end_exclusive,
            mag_min,
            mag_max,
        }
    }

    /// Calendar-date window with an inclusive end date. The exclusive bound is
    /// midnight UTC of the day after `end_inclusive`.
    pub fn from_dates(start: NaiveDate, end_inclusive: NaiveDate, mag_min: f64, mag_max: f64) -> Self {
        let time_start = start.and_time(NaiveTime::MIN).and_utc();
        // The last representable day has no successor; its end is the end of time.
        let time_end_exclusive = end_inclusive
            .succ_opt()
            .map_or(DateTime::<Utc>::MAX_UTC, |next| next.and_time(NaiveTime::MIN).and_utc());
        Self::new(time_start, time_end_exclusive, mag_min, mag_max)
    }

    pub fn matches_time(&self, time: DateTime<Utc>) -> bool {
        self.time_start <= time && time < self.time_end_exclusive
    }

    pub fn matches_magnitude(&self, magnitude: f64) -> bool {
        magnitude.is_finite() && self.mag_min <= magnitude && magnitude <= self.mag_max
    }

    pub fn matches(&self, record: &EventRecord) -> bool {
        self.matches_time(record.time) && self.matches_magnitude(record.magnitude)
    }
}

/// Select the catalog records matching `criteria`, in catalog order.
///
/// The time bound is resolved by binary search over the time-sorted catalog;
/// only the records inside the window are checked for magnitude.
pub fn filter<'a>(catalog: &'a Catalog, criteria: &FilterCriteria) -> Vec<&'a EventRecord> {
    catalog
        .time_window(criteria.time_start, criteria.time_end_exclusive)
        .iter()
        .filter(|r| criteria.matches_magnitude(r.magnitude))
        .collect()
}

/// Apply `criteria` to an existing subset.
pub fn refilter<'a>(subset: &[&'a EventRecord], criteria: &FilterCriteria) -> Vec<&'a EventRecord> {
    subset
        .iter()
        .copied()
        .filter(|r| criteria.matches(r))
        .collect()
}
