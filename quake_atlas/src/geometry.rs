//! Read-only tectonic boundary geometry loaded from GeoJSON.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::QuakeError;

/// One boundary line as `(lon, lat)` vertices in degrees.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Polyline {
    pub name: Option<String>,
    pub vertices: Vec<[f64; 2]>,
}

impl Polyline {
    /// Longitudes and latitudes as separate sequences.
    pub fn unzip(&self) -> (Vec<f64>, Vec<f64>) {
        self.vertices.iter().map(|v| (v[0], v[1])).unzip()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReferenceGeometry {
    polylines: Vec<Polyline>,
    skipped_features: usize,
}

#[derive(Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
    #[serde(default)]
    properties: Option<JsonValue>,
}

#[derive(Deserialize)]
struct Geometry {
    #[serde(rename = "type")]
    kind: String,
    coordinates: JsonValue,
}

impl ReferenceGeometry {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, QuakeError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            QuakeError::GeometryUnavailable(format!("{}: {}", path.display(), e))
        })?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, QuakeError> {
        let collection: FeatureCollection = serde_json::from_reader(reader)
            .map_err(|e| QuakeError::GeometryUnavailable(e.to_string()))?;
        Self::from_collection(collection)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, QuakeError> {
        let collection: FeatureCollection = serde_json::from_slice(bytes)
            .map_err(|e| QuakeError::GeometryUnavailable(e.to_string()))?;
        Self::from_collection(collection)
    }

    fn from_collection(collection: FeatureCollection) -> Result<Self, QuakeError> {
        let mut polylines = Vec::new();
        let mut skipped_features = 0usize;
        for (idx, feature) in collection.features.into_iter().enumerate() {
            let name = feature_name(feature.properties.as_ref());
            let Some(geometry) = feature.geometry else {
                skipped_features += 1;
                continue;
            };
            match geometry.kind.as_str() {
                "LineString" => {
                    let vertices = parse_line(&geometry.coordinates).ok_or_else(|| {
                        QuakeError::GeometryUnavailable(format!(
                            "feature {} has malformed LineString coordinates",
                            idx
                        ))
                    })?;
                    polylines.push(Polyline { name, vertices });
                }
                "MultiLineString" => {
                    let parts = geometry
                        .coordinates
                        .as_array()
                        .and_then(|parts| parts.iter().map(parse_line).collect::<Option<Vec<_>>>())
                        .ok_or_else(|| {
                            QuakeError::GeometryUnavailable(format!(
                                "feature {} has malformed MultiLineString coordinates",
                                idx
                            ))
                        })?;
                    for vertices in parts {
                        polylines.push(Polyline {
                            name: name.clone(),
                            vertices,
                        });
                    }
                }
                other => {
                    debug!("Skipping feature {} with geometry type {}", idx, other);
                    skipped_features += 1;
                }
            }
        }
        if skipped_features > 0 {
            warn!("Reference geometry: skipped {} non-line features", skipped_features);
        }
        Ok(Self {
            polylines,
            skipped_features,
        })
    }

    pub fn polylines(&self) -> &[Polyline] {
        &self.polylines
    }

    pub fn len(&self) -> usize {
        self.polylines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polylines.is_empty()
    }

    pub fn skipped_features(&self) -> usize {
        self.skipped_features
    }

    pub fn vertex_count(&self) -> usize {
        self.polylines.iter().map(|p| p.vertices.len()).sum()
    }
}

fn feature_name(properties: Option<&JsonValue>) -> Option<String> {
    let props = properties?.as_object()?;
    ["Name", "name", "LAYER"]
        .iter()
        .find_map(|key| props.get(*key)?.as_str().map(str::to_string))
}

fn parse_line(value: &JsonValue) -> Option<Vec<[f64; 2]>> {
    value
        .as_array()?
        .iter()
        .map(|pair| {
            let pair = pair.as_array()?;
            Some([pair.first()?.as_f64()?, pair.get(1)?.as_f64()?])
        })
        .collect()
}
