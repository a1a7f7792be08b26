use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::EventRecord;

/// Event count per calendar year (UTC). Years without events are absent.
pub type YearlyCounts = BTreeMap<i32, usize>;

/// Relative radiated energy, `10^(1.5 * magnitude)`.
pub fn energy(magnitude: f64) -> f64 {
    10f64.powf(1.5 * magnitude)
}

pub fn yearly_counts(subset: &[&EventRecord]) -> YearlyCounts {
    let mut out = YearlyCounts::new();
    for record in subset {
        *out.entry(record.time.year()).or_insert(0) += 1;
    }
    out
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnergyPoint {
    pub time: DateTime<Utc>,
    pub magnitude: f64,
    pub energy: f64,
    pub cumulative: f64,
}

/// Cumulative energy over a time-ordered subset.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnergySeries {
    pub points: Vec<EnergyPoint>,
}

impl EnergySeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.points.last().map_or(0.0, |p| p.cumulative)
    }
}

/// Running energy sum in ascending time order.
///
/// The sort is stable, so records sharing a timestamp accumulate in input
/// order and the series is identical across runs.
pub fn cumulative_energy(subset: &[&EventRecord]) -> EnergySeries {
    let mut ordered: Vec<&EventRecord> = subset.to_vec();
    ordered.sort_by_key(|r| r.time);

    let mut total = 0.0;
    let points = ordered
        .into_iter()
        .map(|r| {
            let e = energy(r.magnitude);
            total += e;
            EnergyPoint {
                time: r.time,
                magnitude: r.magnitude,
                energy: e,
                cumulative: total,
            }
        })
        .collect();
    EnergySeries { points }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::event;
    use chrono::TimeZone;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() <= b.abs() * 1e-12, "{a} != {b}");
    }

    #[test]
    fn energy_for_reference_magnitudes() {
        let first = event(2, 6.0);
        let second = event(1, 5.0);
        let series = cumulative_energy(&[&first, &second]);
        assert_eq!(series.len(), 2);
        assert_close(series.points[0].energy, 10f64.powf(7.5));
        assert_close(series.points[0].cumulative, 10f64.powf(7.5));
        assert_close(series.points[1].energy, 1e9);
        assert_close(series.points[1].cumulative, 10f64.powf(7.5) + 1e9);
    }

    #[test]
    fn series_is_monotone_and_totals_match() {
        let records: Vec<EventRecord> = [4.5, 7.1, 2.0, 5.5, 6.3, 3.3]
            .iter()
            .enumerate()
            .map(|(i, &m)| event(6 - i as u32, m))
            .collect();
        let refs: Vec<&EventRecord> = records.iter().collect();
        let series = cumulative_energy(&refs);
        assert!(series
            .points
            .windows(2)
            .all(|w| w[0].cumulative <= w[1].cumulative && w[0].time <= w[1].time));
        let expected: f64 = records.iter().map(|r| energy(r.magnitude)).sum();
        assert_close(series.total(), expected);
    }

    #[test]
    fn equal_timestamps_keep_input_order() {
        let a = event(1, 5.0);
        let b = event(1, 6.0);
        let series = cumulative_energy(&[&b, &a]);
        assert_eq!(series.points[0].magnitude, 6.0);
        assert_eq!(series.points[1].magnitude, 5.0);
    }

    #[test]
    fn yearly_counts_sum_to_subset() {
        let mut records = Vec::new();
        for (year, n) in [(1999, 3usize), (2004, 1), (2011, 5)] {
            for _ in 0..n {
                let mut r = event(1, 6.0);
                r.time = Utc.with_ymd_and_hms(year, 6, 1, 12, 0, 0).unwrap();
                records.push(r);
            }
        }
        let refs: Vec<&EventRecord> = records.iter().collect();
        let counts = yearly_counts(&refs);
        assert_eq!(counts.len(), 3);
        assert_eq!(counts.get(&2004), Some(&1));
        assert_eq!(counts.get(&2000), None);
        assert_eq!(counts.values().sum::<usize>(), refs.len());
    }

    #[test]
    fn empty_inputs_give_empty_outputs() {
        assert!(yearly_counts(&[]).is_empty());
        let series = cumulative_energy(&[]);
        assert!(series.is_empty());
        assert_eq!(series.total(), 0.0);
    }
}
