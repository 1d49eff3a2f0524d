use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::bail;
use image::{DynamicImage, Rgb, RgbImage};

use crate::embedding::{EmbedderConfig, ImageEmbedder};
use crate::geofence::{GeoPoint, Geofence, project_to_utm};
use crate::record::ProcessedImageRecord;
use crate::tags::{ImageTags, TagReader};

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Fresh, empty directory under the system temp dir, unique per call.
pub fn scratch_dir(label: &str) -> PathBuf {
    let sequence = SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!(
        "geocurate-test-{}-{label}-{sequence}",
        std::process::id()
    ));
    if path.exists() {
        fs::remove_dir_all(&path).expect("clear stale scratch dir");
    }
    fs::create_dir_all(&path).expect("create scratch dir");
    path
}

/// Solid-color RGB image; each color gives a distinct local embedding.
pub fn solid_image(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
}

/// Image whose left half and right half have different colors.
pub fn split_image(width: u32, height: u32, left: [u8; 3], right: [u8; 3]) -> DynamicImage {
    let image = RgbImage::from_fn(width, height, |x, _| {
        if x < width / 2 { Rgb(left) } else { Rgb(right) }
    });
    DynamicImage::ImageRgb8(image)
}

/// Roughly 1.4 km x 1.1 km box around the Caen campus sample point.
pub fn campus_fence() -> Geofence {
    Geofence::from_vertices(&[
        GeoPoint::new(-0.38, 49.21),
        GeoPoint::new(-0.36, 49.21),
        GeoPoint::new(-0.36, 49.22),
        GeoPoint::new(-0.38, 49.22),
    ])
    .expect("valid fence")
}

/// Serves canned tags by file name; names it does not know fail to decode.
#[derive(Default)]
pub struct StaticTagReader {
    tags: HashMap<String, Option<ImageTags>>,
}

impl StaticTagReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, file_name: &str, tags: Option<ImageTags>) -> Self {
        self.tags.insert(file_name.to_string(), tags);
        self
    }
}

impl TagReader for StaticTagReader {
    fn read_tags(&self, path: &Path) -> anyhow::Result<Option<ImageTags>> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        match self.tags.get(name) {
            Some(tags) => Ok(tags.clone()),
            None => anyhow::bail!("corrupt file: {}", path.display()),
        }
    }
}

/// Writes a solid-color processed image named after `gps`, `stem` and
/// `heading`; returns its path.
pub fn write_processed_image(
    dir: &Path,
    gps: GeoPoint,
    stem: &str,
    heading: Option<i32>,
    color: [u8; 3],
) -> PathBuf {
    let (utm, zone) = project_to_utm(gps.lat, gps.lon);
    let record = ProcessedImageRecord::new(
        utm,
        zone.number.to_string(),
        zone.band_or_placeholder().to_string(),
        gps,
        stem,
        0,
        heading,
    );
    let path = dir.join(record.file_name());
    solid_image(16, 16, color)
        .to_rgb8()
        .save_with_format(&path, image::ImageFormat::Jpeg)
        .expect("write processed image");
    path
}

/// Three-value descriptor: the normalized color of the center pixel. Fails
/// on pure black frames.
pub struct PixelEmbedder {
    config: EmbedderConfig,
}

impl PixelEmbedder {
    pub fn new() -> Self {
        Self {
            config: EmbedderConfig {
                model_id: "center-pixel-test".to_string(),
                dimensions: 3,
                normalization: "unit-range".to_string(),
                backend: "test".to_string(),
            },
        }
    }
}

impl ImageEmbedder for PixelEmbedder {
    fn config(&self) -> &EmbedderConfig {
        &self.config
    }

    fn embed_batch(&self, images: &[DynamicImage]) -> anyhow::Result<Vec<Vec<f32>>> {
        images
            .iter()
            .map(|image| {
                let rgb = image.to_rgb8();
                let pixel = rgb.get_pixel(rgb.width() / 2, rgb.height() / 2).0;
                if pixel.iter().all(|channel| *channel < 8) {
                    bail!("black frame");
                }
                Ok(pixel.iter().map(|channel| f32::from(*channel) / 255.0).collect())
            })
            .collect()
    }
}
