//! Density-based clustering (DBSCAN) over geodesic coordinates.
//!
//! Points are `(lat, lon)` pairs in degrees. They are converted to radians and
//! compared by haversine central angle, so `eps` is an angle on the unit
//! sphere: `eps_rad * EARTH_RADIUS_KM` is the physical search radius.
//!
//! The neighbor search runs in two passes. The first pass counts each point's
//! eps-neighborhood to mark core points and is spread across the rayon pool
//! when enabled. The second pass grows clusters from core points in index
//! order, re-querying neighborhoods on demand so memory stays linear in the
//! number of points. Labels depend only on the input and parameters, never on
//! how many workers ran the first pass.

use std::collections::HashMap;
use std::f64::consts::{FRAC_PI_2, PI, TAU};
use std::fmt;

use ndarray::Array2;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::QuakeError;

/// Mean Earth radius.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;
pub const DEFAULT_EPS_RAD: f64 = 0.03;
pub const DEFAULT_MIN_SAMPLES: usize = 25;

const PARALLEL_MIN_POINTS: usize = 2_048;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NeighborSearch {
    Auto,
    Serial,
    Parallel,
}

impl Default for NeighborSearch {
    fn default() -> Self {
        NeighborSearch::Auto
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterParams {
    /// Neighborhood radius as a central angle in radians.
    pub eps_rad: f64,
    /// Minimum neighborhood size, the point itself included, for a core point.
    pub min_samples: usize,
    pub search: NeighborSearch,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            eps_rad: DEFAULT_EPS_RAD,
            min_samples: DEFAULT_MIN_SAMPLES,
            search: NeighborSearch::Auto,
        }
    }
}

impl ClusterParams {
    pub fn from_radius_km(radius_km: f64, min_samples: usize) -> Self {
        Self {
            eps_rad: radius_km / EARTH_RADIUS_KM,
            min_samples,
            ..Self::default()
        }
    }

    pub fn eps_km(&self) -> f64 {
        self.eps_rad * EARTH_RADIUS_KM
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterLabel {
    Noise,
    Cluster(usize),
}

impl ClusterLabel {
    pub fn is_noise(&self) -> bool {
        matches!(self, ClusterLabel::Noise)
    }

    pub fn id(&self) -> Option<usize> {
        match self {
            ClusterLabel::Cluster(id) => Some(*id),
            ClusterLabel::Noise => None,
        }
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterLabel::Cluster(id) => write!(f, "Cluster {}", id),
            ClusterLabel::Noise => f.write_str("Noise"),
        }
    }
}

/// Labels for one `(points, eps, min_samples)` tuple.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Clustering {
    pub labels: Vec<ClusterLabel>,
    pub cluster_count: usize,
    pub noise_count: usize,
    pub eps_rad: f64,
    pub min_samples: usize,
    /// SHA-256 over the parameters and coordinates that produced `labels`.
    pub fingerprint: String,
}

impl Clustering {
    /// Point indices grouped by cluster id.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.cluster_count];
        for (i, label) in self.labels.iter().enumerate() {
            if let ClusterLabel::Cluster(id) = label {
                out[*id].push(i);
            }
        }
        out
    }

    pub fn same_cluster(&self, a: usize, b: usize) -> bool {
        match (self.labels.get(a), self.labels.get(b)) {
            (Some(ClusterLabel::Cluster(x)), Some(ClusterLabel::Cluster(y))) => x == y,
            _ => false,
        }
    }

    /// Whether these labels were produced from exactly `points` and `params`.
    pub fn is_valid_for(&self, points: &[[f64; 2]], params: &ClusterParams) -> bool {
        self.fingerprint == fingerprint(points, params.eps_rad, params.min_samples.max(1))
    }
}

/// Haversine central angle between two `(lat, lon)` points in radians.
pub fn haversine(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dlat = b[0] - a[0];
    let dlon = b[1] - a[1];
    let h = (dlat / 2.0).sin().powi(2) + a[0].cos() * b[0].cos() * (dlon / 2.0).sin().powi(2);
    2.0 * h.min(1.0).sqrt().asin()
}

/// Run DBSCAN with the haversine metric over `(lat, lon)` degree pairs.
pub fn cluster(points: &[[f64; 2]], params: &ClusterParams) -> Result<Clustering, QuakeError> {
    let eps = params.eps_rad;
    if !eps.is_finite() || eps <= 0.0 {
        return Err(QuakeError::InvalidParameter(format!(
            "eps_rad must be a positive finite angle, got {}",
            eps
        )));
    }
    if let Some(bad) = points
        .iter()
        .position(|p| !p[0].is_finite() || !p[1].is_finite())
    {
        return Err(QuakeError::InvalidParameter(format!(
            "point {} has non-finite coordinates",
            bad
        )));
    }

    let min_samples = params.min_samples.max(1);
    let n = points.len();
    let fingerprint = fingerprint(points, eps, min_samples);
    if n == 0 {
        return Ok(Clustering {
            labels: Vec::new(),
            cluster_count: 0,
            noise_count: 0,
            eps_rad: eps,
            min_samples,
            fingerprint,
        });
    }

    let index = BandIndex::build(radians(points), eps);

    let parallel = match params.search {
        NeighborSearch::Serial => false,
        NeighborSearch::Parallel => true,
        NeighborSearch::Auto => n >= PARALLEL_MIN_POINTS,
    };
    let core = core_flags(&index, min_samples, parallel);
    debug!(
        "Neighbor pass: {} of {} points are core (parallel={})",
        core.iter().filter(|&&c| c).count(),
        n,
        parallel
    );

    let mut assigned: Vec<Option<usize>> = vec![None; n];
    let mut next_id = 0usize;
    let mut stack = Vec::new();
    let mut neighbors = Vec::new();
    for seed in 0..n {
        if assigned[seed].is_some() || !core[seed] {
            continue;
        }
        let id = next_id;
        next_id += 1;
        assigned[seed] = Some(id);
        stack.push(seed);
        while let Some(p) = stack.pop() {
            index.neighbors_into(p, &mut neighbors);
            for &q in &neighbors {
                if assigned[q].is_none() {
                    assigned[q] = Some(id);
                    if core[q] {
                        stack.push(q);
                    }
                }
            }
        }
    }

    let labels: Vec<ClusterLabel> = assigned
        .into_iter()
        .map(|a| a.map_or(ClusterLabel::Noise, ClusterLabel::Cluster))
        .collect();
    let noise_count = labels.iter().filter(|l| l.is_noise()).count();
    info!(
        "Clustering found {} clusters and {} noise points among {} events (eps {:.4} rad = {:.0} km, min_samples {})",
        next_id,
        noise_count,
        n,
        eps,
        eps * EARTH_RADIUS_KM,
        min_samples
    );

    Ok(Clustering {
        labels,
        cluster_count: next_id,
        noise_count,
        eps_rad: eps,
        min_samples,
        fingerprint,
    })
}

fn core_flags(index: &BandIndex, min_samples: usize, parallel: bool) -> Vec<bool> {
    let is_core = |i: usize| index.count_within(i, min_samples) >= min_samples;
    #[cfg(feature = "parallel")]
    {
        if parallel {
            return (0..index.len()).into_par_iter().map(is_core).collect();
        }
    }
    #[cfg(not(feature = "parallel"))]
    let _ = parallel;
    (0..index.len()).map(is_core).collect()
}

fn wrap_lon(lon: f64) -> f64 {
    (lon + PI).rem_euclid(TAU) - PI
}

/// `(lat, lon)` degrees to an `n x 2` radian matrix with longitudes in `[-PI, PI)`.
fn radians(points: &[[f64; 2]]) -> Array2<f64> {
    Array2::from_shape_fn((points.len(), 2), |(i, j)| match j {
        0 => points[i][0].to_radians(),
        _ => wrap_lon(points[i][1].to_radians()),
    })
}

/// Latitude bands of height `eps`, each sorted by longitude.
///
/// Any point within `eps` of a query lies in the query's band or an adjacent
/// one, and inside a longitude window of half-width
/// `asin(sin(eps) / cos(lat))`. Near the poles the window spans every
/// longitude.
struct BandIndex {
    /// One `(lat, lon)` radian row per point.
    coords: Array2<f64>,
    eps: f64,
    bands: HashMap<i64, Vec<(f64, usize)>>,
}

impl BandIndex {
    fn build(coords: Array2<f64>, eps: f64) -> Self {
        let mut bands: HashMap<i64, Vec<(f64, usize)>> = HashMap::new();
        for (i, row) in coords.rows().into_iter().enumerate() {
            bands.entry(band_key(row[0], eps)).or_default().push((row[1], i));
        }
        for band in bands.values_mut() {
            band.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        }
        Self { coords, eps, bands }
    }

    fn len(&self) -> usize {
        self.coords.nrows()
    }

    fn point(&self, i: usize) -> [f64; 2] {
        [self.coords[[i, 0]], self.coords[[i, 1]]]
    }

    /// Longitude ranges to scan around `p`.
    fn lon_ranges(&self, p: [f64; 2]) -> [Option<(f64, f64)>; 2] {
        let lat = p[0];
        if lat.abs() + self.eps >= FRAC_PI_2 {
            return [Some((-PI, PI)), None];
        }
        let ratio = self.eps.sin() / lat.cos();
        if ratio >= 1.0 {
            return [Some((-PI, PI)), None];
        }
        // Widen slightly; candidates are confirmed by exact distance.
        let half = ratio.asin() * (1.0 + 1e-9) + 1e-12;
        let (lo, hi) = (p[1] - half, p[1] + half);
        if lo < -PI {
            [Some((lo + TAU, PI)), Some((-PI, hi))]
        } else if hi > PI {
            [Some((lo, PI)), Some((-PI, hi - TAU))]
        } else {
            [Some((lo, hi)), None]
        }
    }

    /// Visit every point within `eps` of point `i` (itself included) until
    /// `visit` returns `false`.
    fn for_each_neighbor<F: FnMut(usize) -> bool>(&self, i: usize, mut visit: F) {
        let p = self.point(i);
        let ranges = self.lon_ranges(p);
        let lo_key = band_key(p[0] - self.eps, self.eps);
        let hi_key = band_key(p[0] + self.eps, self.eps);
        for key in lo_key..=hi_key {
            let Some(band) = self.bands.get(&key) else {
                continue;
            };
            for (lo, hi) in ranges.iter().flatten() {
                let start = band.partition_point(|(lon, _)| *lon < *lo);
                for &(lon, j) in &band[start..] {
                    if lon > *hi {
                        break;
                    }
                    if haversine(p, self.point(j)) <= self.eps && !visit(j) {
                        return;
                    }
                }
            }
        }
    }

    /// Neighborhood size of point `i`, stopping once `limit` is reached.
    fn count_within(&self, i: usize, limit: usize) -> usize {
        let mut count = 0usize;
        self.for_each_neighbor(i, |_| {
            count += 1;
            count < limit
        });
        count
    }

    fn neighbors_into(&self, i: usize, out: &mut Vec<usize>) {
        out.clear();
        self.for_each_neighbor(i, |j| {
            out.push(j);
            true
        });
        out.sort_unstable();
    }
}

fn band_key(lat: f64, eps: f64) -> i64 {
    ((lat + FRAC_PI_2) / eps).floor() as i64
}

fn fingerprint(points: &[[f64; 2]], eps: f64, min_samples: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(eps.to_bits().to_le_bytes());
    hasher.update((min_samples as u64).to_le_bytes());
    hasher.update((points.len() as u64).to_le_bytes());
    for p in points {
        hasher.update(p[0].to_bits().to_le_bytes());
        hasher.update(p[1].to_bits().to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(eps_rad: f64, min_samples: usize) -> ClusterParams {
        ClusterParams {
            eps_rad,
            min_samples,
            search: NeighborSearch::Serial,
        }
    }

    fn deg(rad: f64) -> f64 {
        rad.to_degrees()
    }

    /// Brute-force neighborhood sizes, used to check the band index.
    fn brute_counts(points: &[[f64; 2]], eps: f64) -> Vec<usize> {
        let rad: Vec<[f64; 2]> = points
            .iter()
            .map(|p| [p[0].to_radians(), p[1].to_radians()])
            .collect();
        rad.iter()
            .map(|a| rad.iter().filter(|b| haversine(*a, **b) <= eps).count())
            .collect()
    }

    fn scatter(n: usize, seed: u64) -> Vec<[f64; 2]> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| [rng.gen_range(-90.0..=90.0), rng.gen_range(-180.0..=180.0)])
            .collect()
    }

    #[test]
    fn haversine_quarter_circle() {
        let d = haversine([0.0, 0.0], [0.0, FRAC_PI_2]);
        assert!((d - FRAC_PI_2).abs() < 1e-12);
        let d = haversine([0.0, 0.0], [FRAC_PI_2, 0.0]);
        assert!((d - FRAC_PI_2).abs() < 1e-12);
        assert_eq!(haversine([0.3, 1.2], [0.3, 1.2]), 0.0);
    }

    #[test]
    fn default_eps_is_about_191_km() {
        let p = ClusterParams::default();
        assert!((p.eps_km() - 191.13).abs() < 0.1);
        let q = ClusterParams::from_radius_km(p.eps_km(), 25);
        assert!((q.eps_rad - 0.03).abs() < 1e-12);
    }

    #[test]
    fn close_pair_clusters_far_point_is_noise() {
        let points = [[0.0, 0.0], [deg(0.001), 0.0], [deg(1.0), 0.0]];
        let out = cluster(&points, &params(0.03, 2)).unwrap();
        assert_eq!(out.labels.len(), 3);
        assert!(out.same_cluster(0, 1));
        assert!(out.labels[0].id().is_some());
        assert_eq!(out.labels[2], ClusterLabel::Noise);
        assert_eq!(out.cluster_count, 1);
        assert_eq!(out.noise_count, 1);
    }

    #[test]
    fn empty_input_and_zero_min_samples_never_fail() {
        let out = cluster(&[], &params(0.03, 0)).unwrap();
        assert!(out.labels.is_empty());
        assert_eq!(out.cluster_count, 0);

        let points = [[10.0, 10.0], [-40.0, 100.0]];
        let out = cluster(&points, &params(0.03, 0)).unwrap();
        assert_eq!(out.noise_count, 0);
        assert_eq!(out.cluster_count, 2);
        assert!(!out.same_cluster(0, 1));
    }

    #[test]
    fn rejects_bad_eps_and_coordinates() {
        assert!(matches!(
            cluster(&[[0.0, 0.0]], &params(0.0, 2)),
            Err(QuakeError::InvalidParameter(_))
        ));
        assert!(matches!(
            cluster(&[[0.0, 0.0]], &params(f64::NAN, 2)),
            Err(QuakeError::InvalidParameter(_))
        ));
        assert!(matches!(
            cluster(&[[f64::NAN, 0.0]], &params(0.03, 2)),
            Err(QuakeError::InvalidParameter(_))
        ));
    }

    #[test]
    fn border_point_joins_cluster_but_is_not_core() {
        // Three points in a row 0.02 rad apart: the middle one reaches both
        // ends, the ends only reach the middle.
        let points = [[0.0, 0.0], [0.0, deg(0.02)], [0.0, deg(0.04)]];
        let out = cluster(&points, &params(0.03, 3)).unwrap();
        assert_eq!(out.cluster_count, 1);
        assert!(out.same_cluster(0, 1) && out.same_cluster(1, 2));
    }

    #[test]
    fn clusters_across_the_antimeridian() {
        let points = [[0.0, 179.5], [0.0, -179.5], [0.0, 179.9]];
        let out = cluster(&points, &params(0.03, 3)).unwrap();
        assert_eq!(out.cluster_count, 1);
        assert_eq!(out.noise_count, 0);
    }

    #[test]
    fn clusters_near_the_pole() {
        // Widely separated longitudes are close together at 89.5 degrees.
        let points = [[89.5, 0.0], [89.5, 90.0], [89.5, 180.0], [89.5, -90.0]];
        let out = cluster(&points, &params(0.03, 4)).unwrap();
        assert_eq!(out.cluster_count, 1);
        assert_eq!(out.members()[0], vec![0, 1, 2, 3]);
    }

    #[test]
    fn high_latitude_separation_uses_geodesic_distance() {
        // 3 degrees of longitude at 80N is about 58 km; at the equator ~334 km.
        let polar = [[80.0, 10.0], [80.0, 13.0]];
        let equatorial = [[0.0, 10.0], [0.0, 13.0]];
        assert_eq!(cluster(&polar, &params(0.03, 2)).unwrap().cluster_count, 1);
        assert_eq!(
            cluster(&equatorial, &params(0.03, 2)).unwrap().noise_count,
            2
        );
    }

    #[test]
    fn band_index_matches_brute_force() {
        let points = scatter(600, 11);
        let eps = 0.2;
        let brute = brute_counts(&points, eps);
        let index = BandIndex::build(radians(&points), eps);
        assert_eq!(index.len(), points.len());
        for (i, expected) in brute.iter().enumerate() {
            assert_eq!(index.count_within(i, usize::MAX), *expected, "point {}", i);
        }
    }

    #[test]
    fn radian_matrix_wraps_longitude() {
        let coords = radians(&[[90.0, 180.0], [-45.0, -90.0]]);
        assert_eq!(coords.dim(), (2, 2));
        assert!((coords[[0, 0]] - FRAC_PI_2).abs() < 1e-12);
        assert!((coords[[0, 1]] + PI).abs() < 1e-12);
        assert!((coords[[1, 1]] + FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn noise_points_are_sparse() {
        let points = scatter(800, 5);
        let p = params(0.15, 4);
        let out = cluster(&points, &p).unwrap();
        let counts = brute_counts(&points, p.eps_rad);
        for (i, label) in out.labels.iter().enumerate() {
            if label.is_noise() {
                assert!(counts[i] < p.min_samples);
            }
        }
        assert_eq!(
            out.noise_count + out.members().iter().map(Vec::len).sum::<usize>(),
            points.len()
        );
    }

    #[test]
    fn serial_and_parallel_agree() {
        let points = scatter(3_000, 23);
        let serial = cluster(&points, &params(0.08, 5)).unwrap();
        let parallel = cluster(
            &points,
            &ClusterParams {
                search: NeighborSearch::Parallel,
                ..params(0.08, 5)
            },
        )
        .unwrap();
        assert_eq!(serial.labels, parallel.labels);
        assert_eq!(serial.fingerprint, parallel.fingerprint);
    }

    #[test]
    fn fingerprint_tracks_inputs() {
        let points = [[1.0, 2.0], [1.0, 2.1]];
        let p = params(0.03, 2);
        let out = cluster(&points, &p).unwrap();
        assert!(out.is_valid_for(&points, &p));
        assert!(!out.is_valid_for(&points, &params(0.04, 2)));
        assert!(!out.is_valid_for(&points[..1], &p));
    }
}
