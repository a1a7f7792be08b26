//! Process-lifetime memoization of the catalog and the reference geometry.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use tracing::info;

use crate::geometry::ReferenceGeometry;
use crate::normalize::normalize_path;
use crate::{Catalog, QuakeError};

/// Holds the shared, immutable datasets.
///
/// The first caller of each accessor pays the load; everyone after receives a
/// clone of the same `Arc`. A failed load leaves the slot empty so the next
/// caller retries from scratch.
#[derive(Debug, Default)]
pub struct DatasetStore {
    catalog: OnceCell<Arc<Catalog>>,
    geometry: OnceCell<Arc<ReferenceGeometry>>,
}

static GLOBAL: Lazy<DatasetStore> = Lazy::new(DatasetStore::new);

impl DatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static DatasetStore {
        &GLOBAL
    }

    pub fn catalog_or_init<F>(&self, init: F) -> Result<Arc<Catalog>, QuakeError>
    where
        F: FnOnce() -> Result<Catalog, QuakeError>,
    {
        self.catalog
            .get_or_try_init(|| init().map(Arc::new))
            .map(Arc::clone)
    }

    pub fn geometry_or_init<F>(&self, init: F) -> Result<Arc<ReferenceGeometry>, QuakeError>
    where
        F: FnOnce() -> Result<ReferenceGeometry, QuakeError>,
    {
        self.geometry
            .get_or_try_init(|| init().map(Arc::new))
            .map(Arc::clone)
    }

    /// Normalize the catalog at `path` once.
    pub fn catalog<P: AsRef<Path>>(&self, path: P) -> Result<Arc<Catalog>, QuakeError> {
        let path = path.as_ref();
        self.catalog_or_init(|| {
            info!("Loading earthquake catalog from {} ...", path.display());
            let started = Instant::now();
            let catalog = normalize_path(path)?;
            info!(
                "Catalog ready: {} events in {:.1} s",
                catalog.len(),
                started.elapsed().as_secs_f64()
            );
            Ok(catalog)
        })
    }

    /// Read the boundary GeoJSON at `path` once.
    pub fn geometry<P: AsRef<Path>>(&self, path: P) -> Result<Arc<ReferenceGeometry>, QuakeError> {
        let path = path.as_ref();
        self.geometry_or_init(|| {
            info!("Loading tectonic boundaries from {} ...", path.display());
            let geometry = ReferenceGeometry::load(path)?;
            info!("Boundaries ready: {} polylines", geometry.len());
            Ok(geometry)
        })
    }

    pub fn cached_catalog(&self) -> Option<Arc<Catalog>> {
        self.catalog.get().cloned()
    }

    pub fn cached_geometry(&self) -> Option<Arc<ReferenceGeometry>> {
        self.geometry.get().cloned()
    }
}
