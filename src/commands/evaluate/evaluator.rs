use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::DynamicImage;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use super::index::FlatL2Index;
use super::loader::{DatabaseLoader, LoaderMode, open_rgb};
use super::store::{DescriptorStore, PendingDescriptor};
use crate::embedding::ImageEmbedder;
use crate::error::CurateError;
use crate::geofence::{GeoPoint, UtmPoint};
use crate::model::Location;
use crate::record::ProcessedImageRecord;
use crate::util::{build_pool, file_name_string, sha256_file};

/// A query image, either on disk or as base64-encoded file bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryInput {
    Path(PathBuf),
    Encoded(String),
}

impl QueryInput {
    /// Reads `path` and wraps its bytes as an encoded payload.
    pub fn encode_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self::Encoded(STANDARD.encode(bytes)))
    }

    pub fn load(&self) -> Result<DynamicImage> {
        match self {
            Self::Path(path) => open_rgb(path),
            Self::Encoded(payload) => {
                let bytes = STANDARD
                    .decode(payload.trim())
                    .context("query payload is not valid base64")?;
                let image = image::load_from_memory(&bytes)
                    .context("query payload is not a decodable image")?;
                Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub index: usize,
    pub file_name: String,
    pub squared_distance: f32,
    pub location: Location,
}

/// Centroid of the matched database locations.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub location: Location,
    pub matches: Vec<Match>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub k: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            batch_size: 16,
            workers: 1,
            k: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub database_images: usize,
    pub embedded: usize,
    pub cached: usize,
    pub batches: usize,
}

pub struct Evaluator {
    loader: DatabaseLoader,
    locations: Vec<Location>,
    index: FlatL2Index,
    embedder: Arc<dyn ImageEmbedder>,
    k: usize,
    stats: BuildStats,
}

impl Evaluator {
    /// Embeds every database image (or reuses cached descriptors) and fills
    /// the index so that index position == loader position.
    pub fn build(
        loader: &DatabaseLoader,
        embedder: Arc<dyn ImageEmbedder>,
        options: BuildOptions,
        mut cache: Option<&mut DescriptorStore>,
    ) -> Result<Self> {
        if loader.is_empty() {
            return Err(CurateError::insufficient("database has no images").into());
        }
        let model = embedder.config().clone();
        let paths = loader.paths();

        let locations = paths
            .iter()
            .map(|path| ProcessedImageRecord::from_path(path).map(|record| location_of(&record)))
            .collect::<Result<Vec<Location>>>()?;

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; paths.len()];
        let mut hashes: Vec<Option<String>> = vec![None; paths.len()];
        if let Some(store) = cache.as_deref() {
            store.ensure_model(&model)?;
            for (slot, path) in paths.iter().enumerate() {
                let hash = sha256_file(path)?;
                slots[slot] = store.lookup(&file_name_string(path), &hash, &model)?;
                hashes[slot] = Some(hash);
            }
        }

        let missing = slots
            .iter()
            .enumerate()
            .filter_map(|(slot, vector)| vector.is_none().then_some(slot))
            .collect::<Vec<usize>>();
        let batch_size = options.batch_size.max(1);
        let batches = missing.chunks(batch_size).collect::<Vec<&[usize]>>();
        info!(
            database = %loader.folder().display(),
            mode = ?loader.mode(),
            images = paths.len(),
            to_embed = missing.len(),
            batches = batches.len(),
            model = %model.model_id,
            "extracting database descriptors"
        );

        let pool = build_pool(options.workers)?;
        let embedded = pool.install(|| {
            batches
                .par_iter()
                .map(|batch| embed_slots(loader, embedder.as_ref(), batch))
                .collect::<Result<Vec<Vec<(usize, Vec<f32>)>>>>()
        })?;

        let mut pending = Vec::<PendingDescriptor>::new();
        for (slot, vector) in embedded.into_iter().flatten() {
            if vector.len() != model.dimensions {
                return Err(CurateError::Retrieval(format!(
                    "embedder returned {} values for {}, expected {}",
                    vector.len(),
                    paths[slot].display(),
                    model.dimensions
                ))
                .into());
            }
            if let Some(hash) = hashes[slot].take() {
                pending.push((file_name_string(&paths[slot]), hash, vector.clone()));
            }
            slots[slot] = Some(vector);
        }

        if let Some(store) = cache.as_deref_mut() {
            let written = store.upsert_batch(&model, &pending)?;
            debug!(written, "cached database descriptors");
        }

        let mut index = FlatL2Index::new(model.dimensions);
        for (slot, vector) in slots.into_iter().enumerate() {
            let vector = vector
                .with_context(|| format!("no descriptor for {}", paths[slot].display()))?;
            index.add(&vector)?;
        }

        let stats = BuildStats {
            database_images: paths.len(),
            embedded: missing.len(),
            cached: paths.len() - missing.len(),
            batches: batches.len(),
        };
        info!(
            embedded = stats.embedded,
            cached = stats.cached,
            "database index ready"
        );

        Ok(Self {
            loader: loader.with_mode(LoaderMode::Paths),
            locations,
            index,
            embedder,
            k: options.k.max(1),
            stats,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn evaluate(&self, query: &QueryInput) -> Result<Prediction> {
        self.evaluate_with_k(query, self.k)
    }

    pub fn evaluate_with_k(&self, query: &QueryInput, k: usize) -> Result<Prediction> {
        let image = query
            .load()
            .map_err(|err| CurateError::Retrieval(format!("{err:#}")))?;
        let descriptor = self
            .embedder
            .embed_batch(std::slice::from_ref(&image))
            .map_err(|err| CurateError::Retrieval(format!("{err:#}")))?
            .into_iter()
            .next()
            .ok_or_else(|| CurateError::Retrieval("embedder returned no descriptor".to_string()))?;

        let neighbors = self.index.search(&descriptor, k)?;
        let matches = neighbors
            .iter()
            .map(|neighbor| Match {
                index: neighbor.index,
                file_name: self
                    .loader
                    .path(neighbor.index)
                    .map(file_name_string)
                    .unwrap_or_default(),
                squared_distance: neighbor.squared_distance,
                location: self.locations[neighbor.index],
            })
            .collect::<Vec<Match>>();

        let location = centroid(matches.iter().map(|matched| matched.location))?;
        Ok(Prediction { location, matches })
    }
}

fn embed_slots(
    loader: &DatabaseLoader,
    embedder: &dyn ImageEmbedder,
    batch: &[usize],
) -> Result<Vec<(usize, Vec<f32>)>> {
    let images = batch
        .iter()
        .map(|slot| loader.image(*slot))
        .collect::<Result<Vec<DynamicImage>>>()?;
    let vectors = embedder.embed_batch(&images)?;
    if vectors.len() != batch.len() {
        return Err(CurateError::Retrieval(format!(
            "embedder returned {} descriptors for a batch of {}",
            vectors.len(),
            batch.len()
        ))
        .into());
    }
    Ok(batch.iter().copied().zip(vectors).collect())
}

pub fn location_of(record: &ProcessedImageRecord) -> Location {
    Location {
        gps: record.gps,
        utm: record.utm,
    }
}

/// Arithmetic mean in both coordinate systems.
pub fn centroid(locations: impl IntoIterator<Item = Location>) -> Result<Location> {
    let mut count = 0usize;
    let (mut lon, mut lat, mut east, mut north) = (0.0, 0.0, 0.0, 0.0);
    for location in locations {
        count += 1;
        lon += location.gps.lon;
        lat += location.gps.lat;
        east += location.utm.east;
        north += location.utm.north;
    }
    if count == 0 {
        return Err(CurateError::insufficient("no matches to average").into());
    }
    let n = count as f64;
    Ok(Location {
        gps: GeoPoint::new(lon / n, lat / n),
        utm: UtmPoint::new(east / n, north / n),
    })
}
